use std::fmt;

/// The token that replaces secret values in any text shown to a user.
pub const MASK: &str = "***";

/// A credential value that is never printed and is wiped when dropped.
///
/// `Secret` deliberately implements neither `Display` nor `Serialize`; the
/// only way to get at the value is [`Secret::expose`], which the engine calls
/// right before handing the bytes to a child process.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<String> for Secret {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Secret({MASK})")
    }
}

impl Drop for Secret {
    fn drop(&mut self) {
        let mut bytes = std::mem::take(&mut self.0).into_bytes();
        bytes.fill(0);
        std::hint::black_box(&bytes);
    }
}

/// Replaces every occurrence of every secret in `text` with [`MASK`].
///
/// Occurrences may overlap each other or sit inside longer tokens; all byte
/// ranges covered by any occurrence are merged and masked as one. If masking
/// itself produces a new occurrence (a secret made of mask characters), the
/// pass is repeated, and as a last resort the whole text is withheld.
pub fn mask_secrets<'a>(text: &str, secrets: impl IntoIterator<Item = &'a Secret>) -> String {
    let secrets: Vec<&str> = secrets
        .into_iter()
        .map(Secret::expose)
        .filter(|s| !s.is_empty())
        .collect();

    let leaks = |s: &str| secrets.iter().any(|secret| s.contains(secret));

    let mut masked = text.to_string();
    for _ in 0..4 {
        if !leaks(&masked) {
            return masked;
        }
        masked = mask_once(&masked, &secrets);
    }
    if leaks(&masked) {
        const WITHHELD: &str = "<command withheld>";
        if leaks(WITHHELD) {
            return String::new();
        }
        return WITHHELD.to_string();
    }
    masked
}

fn mask_once(text: &str, secrets: &[&str]) -> String {
    let mut ranges: Vec<(usize, usize)> = Vec::new();
    for secret in secrets {
        let mut from = 0;
        while let Some(pos) = text[from..].find(secret) {
            let start = from + pos;
            ranges.push((start, start + secret.len()));
            // Step one character so overlapping occurrences are found too.
            from = start + text[start..].chars().next().map_or(1, char::len_utf8);
        }
    }
    ranges.sort_unstable();

    let mut out = String::with_capacity(text.len());
    let mut cursor = 0;
    let mut iter = ranges.into_iter().peekable();
    while let Some((start, mut end)) = iter.next() {
        while let Some(&(next_start, next_end)) = iter.peek() {
            if next_start > end {
                break;
            }
            end = end.max(next_end);
            iter.next();
        }
        if start > cursor {
            out.push_str(&text[cursor..start]);
        }
        out.push_str(MASK);
        cursor = cursor.max(end);
    }
    out.push_str(&text[cursor..]);
    out
}
