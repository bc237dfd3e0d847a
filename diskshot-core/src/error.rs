//! Fatal job errors.
//!
//! Each variant's `Display` text is the message a caller sees in the job's
//! terminal [`crate::job::JobOutcome`]. Non-fatal conditions (an unreadable
//! device listing, a partition that cannot be parsed, a failed usage query)
//! never become an `ImagingError`; they are logged and degraded in place.
use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ImagingError {
    #[error("Could not determine source device size")]
    SizeUnknown,

    #[error("{tool} not found. Please install {tool} for {purpose} support.")]
    MissingDependency { tool: String, purpose: &'static str },

    #[error("Encryption requested but no passphrase was supplied")]
    MissingPassphrase,

    #[error("Option '{option}' is not supported: {reason}")]
    UnsupportedOption {
        option: &'static str,
        reason: &'static str,
    },

    #[error("Invalid administrator password")]
    ElevationDenied,

    #[error("Failed to start {stage} stage: {source}")]
    ProcessLaunch {
        stage: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("Operation failed with return code: {code} ({stage} stage)")]
    ProcessExit { stage: &'static str, code: i32 },

    #[error("Operation failed: {stage} stage was killed by signal {signal}")]
    ProcessSignaled { stage: &'static str, signal: i32 },

    #[error("Failed to write image: {0}")]
    Write(#[source] io::Error),

    #[error("Operation cancelled by user")]
    Cancelled,

    #[error("An imaging job is already running on this engine")]
    EngineBusy,

    #[error("Error: {0}")]
    Panicked(String),
}

impl ImagingError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, ImagingError::Cancelled)
    }
}
