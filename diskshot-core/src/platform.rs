//! Provides platform-specific functionality.
//!
//! This module contains the logic for interacting with the operating system to
//! enumerate block devices and query filesystem usage. Each submodule exposes
//! the same public API so the rest of the library can use it without caring
//! about the underlying platform.

#[cfg(target_os = "linux")]
mod linux;
#[cfg(target_os = "linux")]
pub use self::linux::*;

#[cfg(not(target_os = "linux"))]
mod unsupported;
#[cfg(not(target_os = "linux"))]
pub use self::unsupported::*;

use crate::config::EngineConfig;
use crate::device::BlockDevice;
use std::io;
use std::sync::mpsc::{self, Receiver};
use std::thread;

/// Runs [`list_block_devices`] on a background thread.
///
/// The listing arrives on the returned channel once the lister tool and the
/// usage queries are done, so the caller can keep a spinner or event loop
/// going meanwhile. The channel disconnects without a value only if the
/// thread panics.
pub fn spawn_listing(config: &EngineConfig) -> io::Result<Receiver<Vec<BlockDevice>>> {
    let config = config.clone();
    let (tx, rx) = mpsc::channel();
    thread::Builder::new()
        .name("diskshot-inventory".into())
        .spawn(move || {
            // The caller may have stopped waiting.
            let _ = tx.send(list_block_devices(&config));
        })?;
    Ok(rx)
}
