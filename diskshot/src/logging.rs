//! Tracing subscriber setup for the command-line front-end.
//!
//! Logs always go to stderr. The default filter keeps the engine quiet
//! (warnings only) because its log notifications are already printed above
//! the progress bar; `--verbose` raises both crates to `debug`, and
//! `RUST_LOG` overrides everything.

use tracing::Level;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Clone, Copy, Debug, Default)]
pub struct LogConfig {
    /// Output logs as JSON (for machine parsing)
    pub json: bool,
    /// Enable verbose logging (sets default level to DEBUG)
    pub verbose: bool,
}

/// The filter used when `RUST_LOG` is not set.
pub fn default_directives(verbose: bool) -> String {
    if verbose {
        let level = Level::DEBUG.as_str().to_lowercase();
        format!("diskshot={level},diskshot_core={level}")
    } else {
        "diskshot=info,diskshot_core=warn".to_string()
    }
}

pub fn init(config: LogConfig) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directives(config.verbose)));

    if config.json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(
                fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_target(true)
                    .with_writer(std::io::stderr),
            )
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(
                fmt::layer()
                    .with_target(false)
                    .with_thread_ids(false)
                    .with_file(false)
                    .with_line_number(false)
                    .with_writer(std::io::stderr),
            )
            .init();
    }
}
