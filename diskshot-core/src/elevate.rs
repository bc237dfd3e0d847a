//! Running commands through the privilege-elevation tool.
//!
//! The elevation secret is always written to the tool's stdin (`-S`) with an
//! empty prompt, never placed on a command line.
use crate::error::ImagingError;
use crate::secret::Secret;
use std::fs::File;
use std::io::{self, ErrorKind, Read, Write};
use std::path::Path;
use std::process::{ChildStdin, Command, Stdio};
use tracing::{debug, warn};

/// Arguments that make the elevation tool read the secret from stdin
/// without printing a prompt.
pub const ELEVATION_ARGS: [&str; 3] = ["-S", "-p", ""];

/// Builds `<tool> -S -p '' <program> <args...>`.
pub fn elevated_command<I, S>(tool: &str, program: &str, args: I) -> Command
where
    I: IntoIterator<Item = S>,
    S: AsRef<std::ffi::OsStr>,
{
    let mut cmd = Command::new(tool);
    cmd.args(ELEVATION_ARGS).arg(program).args(args);
    cmd
}

/// Writes the secret followed by a newline and closes the pipe.
///
/// The tool may not read stdin at all when it has cached credentials, so a
/// broken pipe is not an error.
pub fn feed_secret(mut stdin: ChildStdin, secret: &Secret) -> io::Result<()> {
    let mut line = Vec::with_capacity(secret.expose().len() + 1);
    line.extend_from_slice(secret.expose().as_bytes());
    line.push(b'\n');
    let result = stdin.write_all(&line).and_then(|_| stdin.flush());
    line.fill(0);
    match result {
        Err(e) if e.kind() == ErrorKind::BrokenPipe => {
            debug!("Elevation tool closed stdin before reading the secret");
            Ok(())
        }
        other => other,
    }
}

/// Checks that the elevation tool accepts `secret` (`-v` validates and
/// refreshes the cached credentials without running anything).
pub fn verify(tool: &str, secret: &Secret) -> Result<(), ImagingError> {
    let mut child = Command::new(tool)
        .args(ELEVATION_ARGS)
        .arg("-v")
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .map_err(|e| match e.kind() {
            ErrorKind::NotFound => ImagingError::MissingDependency {
                tool: tool.to_string(),
                purpose: "privilege elevation",
            },
            _ => ImagingError::ProcessLaunch {
                stage: "elevation",
                source: e,
            },
        })?;

    if let Some(stdin) = child.stdin.take() {
        if let Err(e) = feed_secret(stdin, secret) {
            warn!(error = %e, "Failed to pass the elevation secret");
        }
    }

    let status = child.wait().map_err(|e| ImagingError::ProcessLaunch {
        stage: "elevation",
        source: e,
    })?;
    if status.success() {
        Ok(())
    } else {
        Err(ImagingError::ElevationDenied)
    }
}

/// Whether reading `device` requires elevated privileges.
///
/// Only a permission failure counts. A device that does not exist or fails
/// for other reasons is left to the read stage to report.
pub fn needs_elevation(device: &Path) -> bool {
    let result = File::open(device).and_then(|mut f| f.read(&mut [0u8; 1]));
    matches!(result, Err(e) if e.kind() == ErrorKind::PermissionDenied)
}
