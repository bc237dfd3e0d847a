//! The imaging job and everything the engine reports about it.
use crate::error::ImagingError;
use crate::progress::ProgressEvent;
use crate::secret::{Secret, mask_secrets};
use std::path::{Path, PathBuf};

/// Optional features of an imaging run.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ImagingOptions {
    pub compress: bool,
    pub encrypt: bool,
    /// Split the image into fragments. Not supported; see [`ImagingOptions::validate`].
    pub split: bool,
    /// Fragment size in megabytes, meaningful only with `split`.
    pub split_size_mb: Option<u32>,
}

impl ImagingOptions {
    /// Rejects option combinations the engine cannot honour.
    ///
    /// Splitting is accepted as configuration but the engine only ever
    /// writes a single image file, so a job asking for it fails up front
    /// instead of silently producing one file.
    pub fn validate(&self) -> Result<(), ImagingError> {
        if self.split_size_mb == Some(0) {
            return Err(ImagingError::UnsupportedOption {
                option: "split-size",
                reason: "fragment size must be positive",
            });
        }
        if self.split {
            return Err(ImagingError::UnsupportedOption {
                option: "split",
                reason: "images are always written as a single file",
            });
        }
        Ok(())
    }

    /// Names of the active optional features, in reporting order.
    pub fn features(&self) -> Vec<&'static str> {
        let mut features = Vec::new();
        if self.encrypt {
            features.push("encrypted");
        }
        if self.compress {
            features.push("compressed");
        }
        features
    }
}

/// Secrets for one job. Dropping the value wipes them.
#[derive(Clone, Debug, Default)]
pub struct Credentials {
    /// Secret for the privilege-elevation tool.
    pub elevation: Option<Secret>,
    /// Passphrase the cipher stage derives its key from.
    pub passphrase: Option<Secret>,
}

impl Credentials {
    pub fn secrets(&self) -> impl Iterator<Item = &Secret> {
        self.elevation.iter().chain(self.passphrase.iter())
    }

    /// `path` as display text with every secret masked.
    pub fn mask_path(&self, path: &Path) -> String {
        mask_secrets(&path.to_string_lossy(), self.secrets())
    }

    /// Drops both secrets, wiping their memory.
    pub fn clear(&mut self) {
        self.elevation = None;
        self.passphrase = None;
    }
}

/// One request to image `source` into `destination`.
///
/// The final file name is `destination` plus the option suffixes; see
/// [`crate::pipeline::output_path`].
#[derive(Clone, Debug)]
pub struct ImagingJob {
    pub source: PathBuf,
    pub destination: PathBuf,
    pub options: ImagingOptions,
    pub credentials: Credentials,
    /// Exact source size in bytes; `0` until resolved.
    pub source_size: u64,
}

impl ImagingJob {
    pub fn new(source: impl Into<PathBuf>, destination: impl Into<PathBuf>) -> Self {
        Self {
            source: source.into(),
            destination: destination.into(),
            options: ImagingOptions::default(),
            credentials: Credentials::default(),
            source_size: 0,
        }
    }

    pub fn with_options(mut self, options: ImagingOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = credentials;
        self
    }
}

/// Lifecycle of a job. `Completed`, `Failed` and `Cancelled` are terminal.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum JobState {
    Idle = 0,
    SizeResolving = 1,
    PipelineRunning = 2,
    Completed = 3,
    Failed = 4,
    Cancelled = 5,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed | JobState::Cancelled)
    }

    pub(crate) fn from_u8(value: u8) -> Self {
        match value {
            1 => JobState::SizeResolving,
            2 => JobState::PipelineRunning,
            3 => JobState::Completed,
            4 => JobState::Failed,
            5 => JobState::Cancelled,
            _ => JobState::Idle,
        }
    }
}

/// The single result every job ends with.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct JobOutcome {
    pub state: JobState,
    pub success: bool,
    pub message: String,
    /// SHA-256 of the written image file, for completed jobs.
    pub checksum: Option<String>,
}

impl JobOutcome {
    pub(crate) fn completed(options: &ImagingOptions, checksum: String) -> Self {
        let features = options.features();
        let message = if features.is_empty() {
            "Image created successfully!".to_string()
        } else {
            format!("Image created successfully! ({})", features.join(", "))
        };
        Self {
            state: JobState::Completed,
            success: true,
            message,
            checksum: Some(checksum),
        }
    }

    pub(crate) fn from_error(err: &ImagingError) -> Self {
        Self {
            state: if err.is_cancelled() {
                JobState::Cancelled
            } else {
                JobState::Failed
            },
            success: false,
            message: err.to_string(),
            checksum: None,
        }
    }
}

/// Notifications delivered to the caller, in the order they happened.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum JobEvent {
    State(JobState),
    Log(String),
    /// Reports may be coalesced when the receiver falls behind. The newest
    /// one is always delivered before the next non-progress event.
    Progress(ProgressEvent),
    /// Always the last event of a job.
    Finished(JobOutcome),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_is_rejected_explicitly() {
        let options = ImagingOptions {
            split: true,
            split_size_mb: Some(4096),
            ..Default::default()
        };
        assert!(matches!(
            options.validate(),
            Err(ImagingError::UnsupportedOption { option: "split", .. })
        ));
    }

    #[test]
    fn zero_split_size_is_rejected() {
        let options = ImagingOptions {
            split_size_mb: Some(0),
            ..Default::default()
        };
        assert!(options.validate().is_err());
        assert!(ImagingOptions::default().validate().is_ok());
    }

    #[test]
    fn completion_message_lists_features() {
        let plain = JobOutcome::completed(&ImagingOptions::default(), String::new());
        assert_eq!(plain.message, "Image created successfully!");

        let both = ImagingOptions {
            compress: true,
            encrypt: true,
            ..Default::default()
        };
        let outcome = JobOutcome::completed(&both, String::new());
        assert_eq!(outcome.message, "Image created successfully! (encrypted, compressed)");
        assert!(outcome.success);
    }

    #[test]
    fn cancellation_maps_to_cancelled_state() {
        let outcome = JobOutcome::from_error(&ImagingError::Cancelled);
        assert_eq!(outcome.state, JobState::Cancelled);
        assert!(!outcome.success);
        assert_eq!(outcome.message, "Operation cancelled by user");

        let failed = JobOutcome::from_error(&ImagingError::SizeUnknown);
        assert_eq!(failed.state, JobState::Failed);
    }

    #[test]
    fn state_round_trips_through_u8() {
        for state in [
            JobState::Idle,
            JobState::SizeResolving,
            JobState::PipelineRunning,
            JobState::Completed,
            JobState::Failed,
            JobState::Cancelled,
        ] {
            assert_eq!(JobState::from_u8(state as u8), state);
        }
        assert!(JobState::Cancelled.is_terminal());
        assert!(!JobState::PipelineRunning.is_terminal());
    }

    #[test]
    fn masked_paths_hide_both_secrets() {
        let creds = Credentials {
            elevation: Some(Secret::new("it's")),
            passphrase: Some(Secret::new("hunter2")),
        };
        let shown = creds.mask_path(Path::new("/backups/it's/hunter2.img"));
        assert_eq!(shown, "/backups/***/***.img");
    }

    #[test]
    fn credentials_clear_drops_secrets() {
        let mut creds = Credentials {
            elevation: Some(Secret::new("a")),
            passphrase: Some(Secret::new("b")),
        };
        assert_eq!(creds.secrets().count(), 2);
        creds.clear();
        assert_eq!(creds.secrets().count(), 0);
    }
}
