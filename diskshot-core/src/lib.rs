//! The core, UI-agnostic library for the `diskshot` disk imaging utility.
//!
//! `diskshot-core` captures a raw block device into an image file, optionally
//! encrypted and compressed, and is meant to sit behind any front-end: the
//! `diskshot` command-line tool, a GUI, or a service. It handles device
//! discovery, exact size resolution, assembling the external tool pipeline,
//! progress estimation and cooperative cancellation.
//!
//! The library is structured into several key modules:
//! - [`device`] and [`inventory`]: block devices, their partitions and usage.
//! - [`platform`]: platform-specific device enumeration.
//! - [`resolve`]: exact source sizes, with or without elevated privileges.
//! - [`pipeline`]: turns an [`ImagingJob`] into the ordered stage commands.
//! - [`progress`]: parses the read stage's byte-count reports.
//! - [`controller`]: runs one job at a time and reports what happens.
//!
//! The primary entry point is [`ExecutionController::start`]. It returns a
//! channel of [`JobEvent`]s that always ends with exactly one
//! [`JobEvent::Finished`].
//!
//! ## Example: Imaging a Device with Progress Reporting
//!
//! ```rust,no_run
//! use diskshot_core::{EngineConfig, ExecutionController, ImagingJob, ImagingOptions, JobEvent};
//!
//! let mut controller = ExecutionController::new(EngineConfig::default());
//! let job = ImagingJob::new("/dev/sdb", "/backups/sdb.img").with_options(ImagingOptions {
//!     compress: true,
//!     ..Default::default()
//! });
//!
//! let events = controller.start(job).expect("engine is idle");
//! for event in events {
//!     match event {
//!         JobEvent::Progress(p) => println!("{}", p.status_text()),
//!         JobEvent::Log(line) => println!("{line}"),
//!         JobEvent::Finished(outcome) => println!("{}", outcome.message),
//!         JobEvent::State(_) => {}
//!     }
//! }
//! ```

pub mod config;
#[cfg(unix)]
pub mod controller;
pub mod device;
pub mod elevate;
pub mod error;
pub mod inventory;
pub mod job;
pub mod pipeline;
pub mod platform;
#[cfg(unix)]
mod process;
pub mod progress;
pub mod resolve;
pub mod secret;
pub mod size;

pub use config::EngineConfig;
#[cfg(unix)]
pub use controller::{CancelToken, ExecutionController};
pub use device::{BlockDevice, DeviceKind, Partition, PartitionSelection};
pub use error::ImagingError;
pub use job::{Credentials, ImagingJob, ImagingOptions, JobEvent, JobOutcome, JobState};
pub use pipeline::{PipelineBuilder, PipelineSpec, StageKind};
pub use progress::{ProgressEvent, ProgressMonitor, Throughput};
pub use resolve::{DeviceSizeResolver, FixedSize, SizeResolver};
pub use secret::Secret;
pub use size::parse_size;
