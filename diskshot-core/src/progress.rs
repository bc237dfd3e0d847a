//! Progress estimation from the read stage's byte-count reports.
//!
//! The read stage prints lines such as
//! `104857600 bytes (105 MB, 100 MiB) copied, 1 s, 105 MB/s`. Everything
//! else it (or any other stage) prints is chatter and produces no event.
use regex::Regex;
use std::fmt;
use std::sync::LazyLock;
use std::time::{Duration, Instant};

static BYTES_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(\d+) bytes").unwrap());
static SPEED_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d+(?:[.,]\d+)?)\s*([kKMG]?B/s)").unwrap());

/// A transfer rate as printed by the read stage.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Throughput {
    /// The numeral exactly as printed (e.g. `"100"` or `"1.2"`).
    pub value: String,
    /// One of `B/s`, `KB/s`, `MB/s`, `GB/s`.
    pub unit: String,
}

impl fmt::Display for Throughput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.value, self.unit)
    }
}

/// One progress report.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProgressEvent {
    pub bytes_copied: u64,
    /// Percent complete, `0..=100`. Absent when the source size is unknown.
    pub percent: Option<u8>,
    pub throughput: Option<Throughput>,
}

impl ProgressEvent {
    pub(crate) fn finished(bytes_copied: u64) -> Self {
        Self {
            bytes_copied,
            percent: Some(100),
            throughput: None,
        }
    }

    /// The status line shown next to a progress bar.
    pub fn status_text(&self) -> String {
        match (self.percent, &self.throughput) {
            (Some(p), Some(t)) => format!("Progress: {p}% - Speed: {t}"),
            (Some(p), None) => format!("Progress: {p}%"),
            (None, Some(t)) => format!("Copied {} bytes - Speed: {t}", self.bytes_copied),
            (None, None) => format!("Copied {} bytes", self.bytes_copied),
        }
    }
}

/// `floor(min(100, copied * 100 / total))`.
pub fn percent_of(copied: u64, total: u64) -> Option<u8> {
    if total == 0 {
        return None;
    }
    let percent = (u128::from(copied) * 100 / u128::from(total)).min(100);
    Some(percent as u8)
}

/// Parses one line of output against a source of `source_size` bytes.
///
/// Returns `None` unless the line mentions both `bytes` and `copied`.
pub fn parse_line(line: &str, source_size: u64) -> Option<ProgressEvent> {
    if !(line.contains("bytes") && line.contains("copied")) {
        return None;
    }
    let bytes_copied = BYTES_RE.captures(line)?.get(1)?.as_str().parse().ok()?;

    let throughput = SPEED_RE.captures(line).map(|caps| {
        let unit = &caps[2];
        Throughput {
            value: caps[1].to_string(),
            unit: match unit.strip_prefix('k') {
                Some(rest) => format!("K{rest}"),
                None => unit.to_string(),
            },
        }
    });

    Some(ProgressEvent {
        bytes_copied,
        percent: percent_of(bytes_copied, source_size),
        throughput,
    })
}

/// Per-job progress state: keeps the reported percentage from going
/// backwards when the stream of reports is reordered or restarted.
#[derive(Debug)]
pub struct ProgressMonitor {
    source_size: u64,
    last_percent: Option<u8>,
}

impl ProgressMonitor {
    pub fn new(source_size: u64) -> Self {
        Self {
            source_size,
            last_percent: None,
        }
    }

    pub fn parse(&mut self, line: &str) -> Option<ProgressEvent> {
        let mut event = parse_line(line, self.source_size)?;
        if let Some(percent) = event.percent {
            let percent = self.last_percent.map_or(percent, |last| last.max(percent));
            self.last_percent = Some(percent);
            event.percent = Some(percent);
        }
        Some(event)
    }

    pub fn last_percent(&self) -> Option<u8> {
        self.last_percent
    }
}

/// A rate limiter for throttling log messages.
///
/// Progress lines arrive many times a second; the log only needs a sample.
#[derive(Debug)]
pub struct LogThrottle {
    interval: Duration,
    last: Option<Instant>,
}

impl LogThrottle {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: None,
        }
    }

    /// Returns true if enough time has passed since the last log.
    pub fn should_log(&mut self) -> bool {
        let now = Instant::now();
        let due = self
            .last
            .is_none_or(|last| now.duration_since(last) >= self.interval);
        if due {
            self.last = Some(now);
        }
        due
    }
}
