//! Running a [`PipelineSpec`] as one process group.
//!
//! Stages are spawned in order, each one's stdout wired to the next one's
//! stdin by an OS pipe. The first stage leads a new process group that every
//! later stage joins, so the whole pipeline can be signalled at once. The
//! final stream is persisted by an in-process write stage on its own thread.
//! Every stage's stderr is split into lines (on `\r` as well as `\n`, since
//! progress reports overwrite themselves) and forwarded to the controller.
use crate::elevate::feed_secret;
use crate::error::ImagingError;
use crate::pipeline::{PipelineSpec, SecretChannel, StageKind};
use nix::sys::signal::{Signal, killpg};
use nix::unistd::Pid;
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{self, BufReader, BufWriter, ErrorKind, Read, Write};
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::path::Path;
use std::process::{Child, ChildStderr, ChildStdout, ExitStatus, Stdio};
use std::sync::mpsc::Sender;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

// Use a 1 MiB buffer for I/O operations.
const BUFFER_SIZE: usize = 1024 * 1024;

const REAP_INTERVAL: Duration = Duration::from_millis(20);

/// A line of stderr output from one stage.
#[derive(Debug)]
pub(crate) struct StageLine {
    pub stage: StageKind,
    pub text: String,
}

/// What the write stage produced.
#[derive(Debug)]
pub(crate) struct WriteSummary {
    pub bytes: u64,
    pub checksum: String,
}

struct RunningStage {
    kind: StageKind,
    child: Child,
    status: Option<ExitStatus>,
}

pub(crate) struct RunningPipeline {
    stages: Vec<RunningStage>,
    pgid: i32,
    writer: Option<JoinHandle<io::Result<WriteSummary>>>,
    written: Option<io::Result<WriteSummary>>,
}

impl RunningPipeline {
    /// Spawns every stage and the write stage.
    ///
    /// The output file is only created once every process is running, so a
    /// launch failure leaves nothing behind.
    pub fn spawn(spec: &PipelineSpec, lines: Sender<StageLine>) -> Result<Self, ImagingError> {
        let mut pipeline = Self {
            stages: Vec::with_capacity(spec.stages().len()),
            pgid: 0,
            writer: None,
            written: None,
        };
        let mut upstream: Option<ChildStdout> = None;

        for stage in spec.stages() {
            let mut cmd = stage.command();
            cmd.process_group(pipeline.pgid)
                .stdout(Stdio::piped())
                .stderr(Stdio::piped());
            match upstream.take() {
                Some(stream) => cmd.stdin(Stdio::from(stream)),
                None if stage.reads_secret_from_stdin() => cmd.stdin(Stdio::piped()),
                None => cmd.stdin(Stdio::null()),
            };

            let mut child = cmd.spawn().map_err(|source| ImagingError::ProcessLaunch {
                stage: stage.kind.name(),
                source,
            })?;
            if pipeline.pgid == 0 {
                pipeline.pgid = child.id() as i32;
            }
            debug!(stage = stage.kind.name(), pid = child.id(), pgid = pipeline.pgid, "Spawned stage");

            if let (Some(SecretChannel::Stdin(secret)), Some(stdin)) = (&stage.secret, child.stdin.take()) {
                if let Err(e) = feed_secret(stdin, secret) {
                    warn!(stage = stage.kind.name(), error = %e, "Failed to pass the elevation secret");
                }
            }
            if let Some(stderr) = child.stderr.take() {
                spawn_line_reader(stage.kind, stderr, lines.clone());
            }
            upstream = child.stdout.take();

            pipeline.stages.push(RunningStage {
                kind: stage.kind,
                child,
                status: None,
            });
        }

        let stream = upstream.ok_or_else(|| ImagingError::ProcessLaunch {
            stage: "write",
            source: io::Error::new(ErrorKind::BrokenPipe, "pipeline has no output stream"),
        })?;
        let output = spec.output().to_path_buf();
        let writer = thread::Builder::new()
            .name("diskshot-write".into())
            .spawn(move || write_stage(stream, &output))
            .map_err(|source| ImagingError::ProcessLaunch {
                stage: "write",
                source,
            })?;
        pipeline.writer = Some(writer);

        Ok(pipeline)
    }

    pub fn pgid(&self) -> i32 {
        self.pgid
    }

    /// Polls every stage without blocking. Returns the pipeline's result once
    /// all processes have exited and the write stage is done.
    pub fn try_finish(&mut self) -> Option<Result<WriteSummary, ImagingError>> {
        if !self.reap() {
            return None;
        }
        if self.writer.as_ref().is_some_and(|w| !w.is_finished()) {
            return None;
        }
        self.join_writer();
        Some(self.result())
    }

    /// Asks the group to terminate, waits up to `grace`, then kills it.
    /// Returns once every stage has been reaped.
    pub fn terminate(&mut self, grace: Duration) {
        signal_group(self.pgid, Signal::SIGTERM);

        let deadline = Instant::now() + grace;
        while !self.reap() && Instant::now() < deadline {
            thread::sleep(REAP_INTERVAL);
        }

        if !self.reap() {
            warn!(pgid = self.pgid, "Pipeline ignored termination request; killing it");
            self.kill();
        }

        // With every process gone the write stage sees end of stream.
        let deadline = Instant::now() + grace;
        while self.writer.as_ref().is_some_and(|w| !w.is_finished()) && Instant::now() < deadline {
            thread::sleep(REAP_INTERVAL);
        }
        if self.writer.as_ref().is_some_and(|w| w.is_finished()) {
            self.join_writer();
        } else if self.writer.take().is_some() {
            warn!("Write stage still blocked after termination; detaching it");
        }
    }

    fn kill(&mut self) {
        signal_group(self.pgid, Signal::SIGKILL);
        for stage in self.stages.iter_mut().filter(|s| s.status.is_none()) {
            match stage.child.wait() {
                Ok(status) => stage.status = Some(status),
                Err(e) => warn!(stage = stage.kind.name(), error = %e, "Failed to reap stage"),
            }
        }
    }

    /// Collects exit statuses; true when every stage has exited.
    fn reap(&mut self) -> bool {
        let mut all_done = true;
        for stage in self.stages.iter_mut().filter(|s| s.status.is_none()) {
            match stage.child.try_wait() {
                Ok(Some(status)) => {
                    debug!(stage = stage.kind.name(), %status, "Stage exited");
                    stage.status = Some(status);
                }
                Ok(None) => all_done = false,
                Err(e) => {
                    warn!(stage = stage.kind.name(), error = %e, "Failed to poll stage");
                    all_done = false;
                }
            }
        }
        all_done
    }

    fn join_writer(&mut self) {
        if let Some(writer) = self.writer.take() {
            self.written = Some(
                writer
                    .join()
                    .unwrap_or_else(|_| Err(io::Error::other("write stage panicked"))),
            );
        }
    }

    fn result(&mut self) -> Result<WriteSummary, ImagingError> {
        // A failed write makes upstream stages die of a broken pipe, so it is
        // the root cause whenever it happened.
        let written = self
            .written
            .take()
            .unwrap_or_else(|| Err(io::Error::other("write stage did not finish")));
        let summary = written.map_err(ImagingError::Write)?;

        for stage in &self.stages {
            let Some(status) = stage.status else { continue };
            if status.success() {
                continue;
            }
            let name = stage.kind.name();
            return Err(match (status.code(), status.signal()) {
                (Some(code), _) => ImagingError::ProcessExit { stage: name, code },
                (None, Some(signal)) => ImagingError::ProcessSignaled { stage: name, signal },
                (None, None) => ImagingError::ProcessExit { stage: name, code: -1 },
            });
        }
        Ok(summary)
    }
}

impl Drop for RunningPipeline {
    fn drop(&mut self) {
        if self.stages.iter().any(|s| s.status.is_none()) {
            self.kill();
        }
    }
}

/// Sends `signal` to every process in group `pgid`. A group that no longer
/// exists is not an error.
pub(crate) fn signal_group(pgid: i32, signal: Signal) {
    if pgid <= 0 {
        return;
    }
    if let Err(e) = killpg(Pid::from_raw(pgid), signal) {
        debug!(pgid, ?signal, error = %e, "Could not signal process group");
    }
}

fn spawn_line_reader(stage: StageKind, stderr: ChildStderr, lines: Sender<StageLine>) {
    let spawned = thread::Builder::new()
        .name(format!("diskshot-{}-stderr", stage.name()))
        .spawn(move || {
            let mut reader = BufReader::new(stderr);
            let mut line = Vec::new();
            let mut byte = [0u8; 1];
            loop {
                let n = match reader.read(&mut byte) {
                    Ok(n) => n,
                    Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                    Err(_) => 0,
                };
                let end = n == 0;
                if end || byte[0] == b'\r' || byte[0] == b'\n' {
                    if !line.is_empty() {
                        let text = String::from_utf8_lossy(&line).trim().to_string();
                        line.clear();
                        if !text.is_empty() && lines.send(StageLine { stage, text }).is_err() {
                            break;
                        }
                    }
                    if end {
                        break;
                    }
                } else {
                    line.push(byte[0]);
                }
            }
        });
    if let Err(e) = spawned {
        warn!(stage = stage.name(), error = %e, "Could not start stderr reader");
    }
}

/// Persists the pipeline's output stream to `output`, hashing what it writes.
fn write_stage(mut stream: ChildStdout, output: &Path) -> io::Result<WriteSummary> {
    let file = File::create(output)?;
    let mut writer = BufWriter::with_capacity(BUFFER_SIZE, file);
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; BUFFER_SIZE];
    let mut total: u64 = 0;

    loop {
        let n = match stream.read(&mut buffer) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        writer.write_all(&buffer[..n])?;
        hasher.update(&buffer[..n]);
        total += n as u64;
    }

    writer.flush()?;
    writer.into_inner().map_err(|e| e.into_error())?.sync_all()?;

    Ok(WriteSummary {
        bytes: total,
        checksum: hex::encode(hasher.finalize()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_stage_persists_stream_and_hashes_it() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("out.img");
        let mut child = std::process::Command::new("sh")
            .args(["-c", "printf abc"])
            .stdout(Stdio::piped())
            .spawn()
            .unwrap();

        let summary = write_stage(child.stdout.take().unwrap(), &output).unwrap();
        child.wait().unwrap();

        assert_eq!(summary.bytes, 3);
        assert_eq!(
            summary.checksum,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert_eq!(std::fs::read(&output).unwrap(), b"abc");
    }

    #[test]
    fn signalling_missing_group_is_harmless() {
        signal_group(0, Signal::SIGTERM);
        signal_group(i32::MAX, Signal::SIGTERM);
    }
}
