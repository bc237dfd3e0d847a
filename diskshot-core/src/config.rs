//! Tunables for the imaging engine.
//!
//! Every external tool the engine invokes and every timing constant of the
//! job state machine lives here, so front-ends can layer their own sources
//! (files, environment) on top of [`EngineConfig::default`].
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration shared by the inventory, the size resolver, the pipeline
/// builder and the execution controller.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Tool used for the read stage. Must understand `if=`, `bs=` and `status=progress`.
    pub read_tool: String,
    /// Block size handed to the read stage (`bs=`).
    pub block_size: String,
    /// Tool used for the cipher stage (OpenSSL-compatible `enc`).
    pub cipher_tool: String,
    /// Tool used for the compression stage.
    pub compress_tool: String,
    /// Privilege-elevation tool. Must accept the secret on stdin with `-S`.
    pub elevation_tool: String,
    /// Tool used for the elevated exact-size query.
    pub size_tool: String,
    /// Tool producing the hierarchical JSON device listing.
    pub lister_tool: String,
    /// How often the controller polls for output, exit and cancellation.
    pub poll_interval_ms: u64,
    /// How long a terminated pipeline may take to exit before it is killed.
    pub grace_period_ms: u64,
    /// Outer ceiling `cancel()` waits for the worker before forcing termination.
    pub cancel_timeout_ms: u64,
    /// Capacity of the notification channel handed to the caller.
    pub event_capacity: usize,
    /// Minimum interval between progress lines in the log.
    pub progress_log_interval_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            read_tool: "dd".to_string(),
            block_size: "1M".to_string(),
            cipher_tool: "openssl".to_string(),
            compress_tool: "gzip".to_string(),
            elevation_tool: "sudo".to_string(),
            size_tool: "blockdev".to_string(),
            lister_tool: "lsblk".to_string(),
            poll_interval_ms: 100,
            grace_period_ms: 1000,
            cancel_timeout_ms: 5000,
            event_capacity: 1024,
            progress_log_interval_ms: 1000,
        }
    }
}

impl EngineConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }

    pub fn cancel_timeout(&self) -> Duration {
        Duration::from_millis(self.cancel_timeout_ms)
    }

    pub fn progress_log_interval(&self) -> Duration {
        Duration::from_millis(self.progress_log_interval_ms)
    }
}
