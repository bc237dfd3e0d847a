//! Exact byte size of the source device.
use crate::config::EngineConfig;
use crate::elevate::{elevated_command, feed_secret};
use crate::secret::{Secret, mask_secrets};
use std::fs::File;
use std::io;
use std::path::Path;
use std::process::Stdio;
use tracing::{debug, warn};

#[cfg(target_os = "linux")]
nix::ioctl_read!(blkgetsize64, 0x12, 114, u64);

/// Source of a device's exact length in bytes.
///
/// A return of `0` means "size unknown"; the controller treats it as fatal.
pub trait SizeResolver: Send + Sync {
    fn resolve(&self, device: &Path, elevation: Option<&Secret>) -> u64;
}

/// Queries the device directly, then retries through the elevation tool.
///
/// The unprivileged attempt opens the device and asks the kernel for its
/// size with `BLKGETSIZE64` (regular files report their length, which makes
/// image files valid sources). If that fails and an elevation secret is
/// available, `<size_tool> --getsize64 <device>` is run through the
/// elevation tool with the secret on its stdin.
pub struct DeviceSizeResolver {
    elevation_tool: String,
    size_tool: String,
}

impl DeviceSizeResolver {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            elevation_tool: config.elevation_tool.clone(),
            size_tool: config.size_tool.clone(),
        }
    }

    fn query_elevated(&self, device: &Path, secret: &Secret) -> io::Result<u64> {
        let mut child = elevated_command(
            &self.elevation_tool,
            &self.size_tool,
            [std::ffi::OsStr::new("--getsize64"), device.as_os_str()],
        )
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()?;

        if let Some(stdin) = child.stdin.take() {
            feed_secret(stdin, secret)?;
        }

        let output = child.wait_with_output()?;
        if !output.status.success() {
            return Err(io::Error::other(format!(
                "{} exited with {}: {}",
                self.size_tool,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        String::from_utf8_lossy(&output.stdout)
            .trim()
            .parse::<u64>()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }
}

impl SizeResolver for DeviceSizeResolver {
    fn resolve(&self, device: &Path, elevation: Option<&Secret>) -> u64 {
        let shown = mask_secrets(&device.to_string_lossy(), elevation);
        match query_unprivileged(device) {
            Ok(size) if size > 0 => return size,
            Ok(_) => debug!(device = %shown, "Device reports zero size"),
            Err(e) => debug!(device = %shown, error = %e, "Unprivileged size query failed"),
        }

        let Some(secret) = elevation else {
            warn!(device = %shown, "Could not determine device size and no elevation secret was given");
            return 0;
        };

        match self.query_elevated(device, secret) {
            Ok(size) => size,
            Err(e) => {
                let error = mask_secrets(&e.to_string(), elevation);
                warn!(device = %shown, %error, "Error getting device size");
                0
            }
        }
    }
}

/// Size of a device or regular file without any elevation.
pub fn query_unprivileged(device: &Path) -> io::Result<u64> {
    let file = File::open(device)?;
    let metadata = file.metadata()?;
    if metadata.is_file() {
        return Ok(metadata.len());
    }
    block_device_size(&file)
}

#[cfg(target_os = "linux")]
fn block_device_size(file: &File) -> io::Result<u64> {
    use std::os::unix::io::AsRawFd;

    let mut size_bytes: u64 = 0;
    // SAFETY: the descriptor is open for the duration of the call and the
    // kernel writes exactly one u64 into `size_bytes`.
    unsafe {
        blkgetsize64(file.as_raw_fd(), &mut size_bytes).map_err(io::Error::from)?;
    }
    Ok(size_bytes)
}

#[cfg(not(target_os = "linux"))]
fn block_device_size(_file: &File) -> io::Result<u64> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "block device size query is only implemented for Linux",
    ))
}

/// A resolver that always reports the same size. Useful when the source is
/// a stream whose length is known up front.
pub struct FixedSize(pub u64);

impl SizeResolver for FixedSize {
    fn resolve(&self, _device: &Path, _elevation: Option<&Secret>) -> u64 {
        self.0
    }
}
