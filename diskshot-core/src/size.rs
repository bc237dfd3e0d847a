//! Human-readable size strings, as printed by device listing tools.

const KIB: f64 = 1024.0;

/// Converts a size such as `"10G"`, `"512M"` or `"1,5G"` to a byte count.
///
/// The numeral may be followed by one magnitude suffix from `B K M G T P`,
/// each 1024 times the previous. A decimal comma is accepted. Without a
/// suffix the whole string is a byte count. Anything unparsable yields `0`;
/// callers that need to tell "absent" from "zero" must track that separately.
pub fn parse_size(text: &str) -> u64 {
    let text = text.trim().to_uppercase().replace(',', ".");
    if text.is_empty() {
        return 0;
    }

    let (number, multiplier) = match text.char_indices().last() {
        Some((idx, suffix)) if suffix.is_ascii_alphabetic() => {
            let Some(exponent) = "BKMGTP".find(suffix) else {
                return 0;
            };
            (text[..idx].trim(), KIB.powi(exponent as i32))
        }
        _ => (text.as_str(), 1.0),
    };

    match number.parse::<f64>() {
        Ok(value) if value.is_finite() && value >= 0.0 => (value * multiplier) as u64,
        _ => 0,
    }
}

/// Formats a byte count the way the device views show it: one decimal of
/// gigabytes from 1 GiB upwards, whole megabytes below.
pub fn pretty_size(bytes: u64) -> String {
    let gb = bytes as f64 / KIB.powi(3);
    if gb >= 1.0 {
        format!("{gb:.1} GB")
    } else {
        format!("{:.0} MB", bytes as f64 / KIB.powi(2))
    }
}

pub fn to_gb(bytes: u64) -> f64 {
    bytes as f64 / KIB.powi(3)
}

#[cfg(test)]
mod tests {
    use super::*;

    const GIB: u64 = 1024 * 1024 * 1024;

    #[test]
    fn parses_suffixed_sizes() {
        assert_eq!(parse_size("10G"), 10 * GIB);
        assert_eq!(parse_size("512M"), 512 * 1024 * 1024);
        assert_eq!(parse_size("4K"), 4096);
        assert_eq!(parse_size("2T"), 2 * 1024 * GIB);
        assert_eq!(parse_size("1P"), 1024 * 1024 * GIB);
        assert_eq!(parse_size("100B"), 100);
    }

    #[test]
    fn accepts_decimal_comma_and_point() {
        assert_eq!(parse_size("1,5G"), GIB + GIB / 2);
        assert_eq!(parse_size("1.5G"), GIB + GIB / 2);
        assert_eq!(parse_size("465,8G"), (465.8 * GIB as f64) as u64);
    }

    #[test]
    fn bare_numbers_are_bytes() {
        assert_eq!(parse_size("123456"), 123456);
        assert_eq!(parse_size(" 42 "), 42);
    }

    #[test]
    fn lowercase_suffix_is_accepted() {
        assert_eq!(parse_size("8g"), 8 * GIB);
    }

    #[test]
    fn garbage_yields_zero() {
        assert_eq!(parse_size(""), 0);
        assert_eq!(parse_size("xyz"), 0);
        assert_eq!(parse_size("10Q"), 0);
        assert_eq!(parse_size("G"), 0);
        assert_eq!(parse_size("-5M"), 0);
    }

    #[test]
    fn pretty_size_switches_units() {
        assert_eq!(pretty_size(GIB + GIB / 2), "1.5 GB");
        assert_eq!(pretty_size(300 * 1024 * 1024), "300 MB");
        assert_eq!(pretty_size(0), "0 MB");
    }
}
