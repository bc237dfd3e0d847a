//! The job state machine.
//!
//! ```text
//! Idle -> SizeResolving -> PipelineRunning -> Completed
//!              |                  |        -> Failed
//!              +-> Failed         +------> -> Cancelled
//! ```
//!
//! A job runs on one dedicated worker thread. The caller gets an ordered
//! stream of [`JobEvent`]s from a bounded channel, can request cooperative
//! cancellation at any time, and always ends up with exactly one
//! [`JobOutcome`].
use crate::config::EngineConfig;
use crate::elevate::{self, needs_elevation};
use crate::error::ImagingError;
use crate::job::{Credentials, ImagingJob, JobEvent, JobOutcome, JobState};
use crate::pipeline::PipelineBuilder;
use crate::process::{RunningPipeline, StageLine, WriteSummary, signal_group};
use crate::progress::{LogThrottle, ProgressEvent, ProgressMonitor};
use crate::resolve::{DeviceSizeResolver, SizeResolver};
use crate::secret::mask_secrets;
use crate::size::to_gb;
use nix::sys::signal::Signal;
use std::any::Any;
use std::cell::RefCell;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU8, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender, TrySendError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

const JOIN_POLL: Duration = Duration::from_millis(10);

/// State shared between the controller and its worker.
#[derive(Debug, Default)]
struct Shared {
    cancel: AtomicBool,
    state: AtomicU8,
    pgid: AtomicI32,
}

impl Shared {
    fn set_state(&self, state: JobState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    fn state(&self) -> JobState {
        JobState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }
}

/// A cloneable handle that requests cancellation of the running job, for
/// use from signal handlers and other threads.
#[derive(Clone, Debug)]
pub struct CancelToken(Arc<Shared>);

impl CancelToken {
    pub fn cancel(&self) {
        self.0.cancel.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.is_cancelled()
    }
}

/// Runs one imaging job at a time.
pub struct ExecutionController {
    config: Arc<EngineConfig>,
    resolver: Arc<dyn SizeResolver>,
    shared: Arc<Shared>,
    worker: Option<JoinHandle<JobOutcome>>,
    outcome: Option<JobOutcome>,
}

impl ExecutionController {
    pub fn new(config: EngineConfig) -> Self {
        let resolver = Arc::new(DeviceSizeResolver::new(&config));
        Self {
            config: Arc::new(config),
            resolver,
            shared: Arc::new(Shared::default()),
            worker: None,
            outcome: None,
        }
    }

    /// Replaces the size resolver, e.g. for sources whose size is known.
    pub fn with_resolver(mut self, resolver: impl SizeResolver + 'static) -> Self {
        self.resolver = Arc::new(resolver);
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn state(&self) -> JobState {
        self.shared.state()
    }

    pub fn is_running(&self) -> bool {
        self.worker.as_ref().is_some_and(|w| !w.is_finished())
    }

    /// Process group of the running pipeline, if one is running.
    pub fn process_group(&self) -> Option<i32> {
        match self.shared.pgid.load(Ordering::SeqCst) {
            0 => None,
            pgid => Some(pgid),
        }
    }

    pub fn cancel_token(&self) -> CancelToken {
        CancelToken(self.shared.clone())
    }

    /// Starts `job` on a worker thread and returns its event stream.
    ///
    /// The stream ends with [`JobEvent::Finished`]. When the receiver falls
    /// behind, progress reports are coalesced: only the newest undelivered
    /// one is kept and it is delivered before any later event. All other
    /// events wait for room, so the receiver must be drained (or dropped).
    pub fn start(&mut self, job: ImagingJob) -> Result<Receiver<JobEvent>, ImagingError> {
        if self.is_running() {
            return Err(ImagingError::EngineBusy);
        }
        if self.worker.is_some() {
            self.join();
        }

        self.shared.cancel.store(false, Ordering::SeqCst);
        self.shared.pgid.store(0, Ordering::SeqCst);
        self.shared.set_state(JobState::SizeResolving);
        self.outcome = None;

        let (events, receiver) = mpsc::sync_channel(self.config.event_capacity.max(1));
        let worker = Worker {
            config: self.config.clone(),
            resolver: self.resolver.clone(),
            shared: self.shared.clone(),
            events,
            pending: RefCell::new(None),
        };

        info!(
            source = %job.credentials.mask_path(&job.source),
            destination = %job.credentials.mask_path(&job.destination),
            "Starting imaging job"
        );
        let handle = thread::Builder::new()
            .name("diskshot-job".into())
            .spawn(move || worker.run(job))
            .map_err(|source| {
                self.shared.set_state(JobState::Failed);
                ImagingError::ProcessLaunch {
                    stage: "worker",
                    source,
                }
            })?;
        self.worker = Some(handle);
        Ok(receiver)
    }

    /// Requests cancellation and waits for the job to wind down.
    ///
    /// The worker terminates the pipeline on its next poll. If it has not
    /// finished within the configured ceiling, the pipeline's process group
    /// is killed from here. Returns the outcome if the worker has finished.
    pub fn cancel(&mut self) -> Option<JobOutcome> {
        let Some(worker) = self.worker.as_ref() else {
            return self.outcome.clone();
        };
        self.shared.cancel.store(true, Ordering::SeqCst);
        info!("Cancellation requested");

        let deadline = Instant::now() + self.config.cancel_timeout();
        while !worker.is_finished() && Instant::now() < deadline {
            thread::sleep(JOIN_POLL);
        }

        if !worker.is_finished() {
            warn!("Job did not stop in time; killing its processes");
            if let Some(pgid) = self.process_group() {
                signal_group(pgid, Signal::SIGKILL);
            }
            let deadline = Instant::now() + self.config.grace_period();
            while !worker.is_finished() && Instant::now() < deadline {
                thread::sleep(JOIN_POLL);
            }
            if !worker.is_finished() {
                // The worker is blocked delivering an event nobody reads.
                self.shared.set_state(JobState::Cancelled);
                return Some(JobOutcome::from_error(&ImagingError::Cancelled));
            }
        }

        self.join()
    }

    /// Waits for the current job to finish and returns its outcome. Returns
    /// the previous outcome (or `None`) if no job is running.
    pub fn join(&mut self) -> Option<JobOutcome> {
        if let Some(worker) = self.worker.take() {
            let outcome = worker.join().unwrap_or_else(|panic| {
                let err = ImagingError::Panicked(panic_message(panic.as_ref()));
                self.shared.set_state(JobState::Failed);
                JobOutcome::from_error(&err)
            });
            self.outcome = Some(outcome);
        }
        self.outcome.clone()
    }
}

impl Drop for ExecutionController {
    fn drop(&mut self) {
        if self.is_running() {
            self.cancel();
        }
    }
}

struct Worker {
    config: Arc<EngineConfig>,
    resolver: Arc<dyn SizeResolver>,
    shared: Arc<Shared>,
    events: SyncSender<JobEvent>,
    /// Newest progress report that did not fit in the channel.
    pending: RefCell<Option<ProgressEvent>>,
}

impl Worker {
    fn run(self, mut job: ImagingJob) -> JobOutcome {
        self.emit(JobEvent::State(JobState::SizeResolving));

        let result = panic::catch_unwind(AssertUnwindSafe(|| self.execute(&mut job)));
        job.credentials.clear();

        let outcome = match result {
            Ok(Ok(summary)) => {
                self.emit(JobEvent::Progress(ProgressEvent::finished(job.source_size)));
                self.log(format!("Image checksum (SHA-256): {}", summary.checksum));
                JobOutcome::completed(&job.options, summary.checksum)
            }
            Ok(Err(err)) => JobOutcome::from_error(&err),
            Err(panic) => JobOutcome::from_error(&ImagingError::Panicked(panic_message(panic.as_ref()))),
        };

        match outcome.state {
            JobState::Completed => info!(message = %outcome.message, "Imaging job completed"),
            JobState::Cancelled => warn!(message = %outcome.message, "Imaging job cancelled"),
            _ => error!(message = %outcome.message, "Imaging job failed"),
        }
        self.shared.set_state(outcome.state);
        self.emit(JobEvent::State(outcome.state));
        self.emit(JobEvent::Finished(outcome.clone()));
        outcome
    }

    fn execute(&self, job: &mut ImagingJob) -> Result<WriteSummary, ImagingError> {
        let size = self
            .resolver
            .resolve(&job.source, job.credentials.elevation.as_ref());
        if size == 0 {
            return Err(ImagingError::SizeUnknown);
        }
        job.source_size = size;
        self.log(format!("Source device size: {:.2} GB", to_gb(size)));
        self.check_cancelled()?;

        let elevate = match &job.credentials.elevation {
            Some(secret) if needs_elevation(&job.source) => {
                self.log("Administrator privileges required for accessing block device");
                elevate::verify(&self.config.elevation_tool, secret)?;
                true
            }
            _ => false,
        };

        let spec = PipelineBuilder::new(&self.config).elevate(elevate).build(job)?;
        if job.options.encrypt {
            self.log("Encryption enabled (AES-256-CBC)");
        }
        if job.options.compress {
            self.log("Compression enabled (gzip)");
        }
        self.log(format!("Executing: {}", spec.description()));
        self.check_cancelled()?;

        self.shared.set_state(JobState::PipelineRunning);
        self.emit(JobEvent::State(JobState::PipelineRunning));

        let (lines_tx, lines) = mpsc::channel();
        let mut pipeline = RunningPipeline::spawn(&spec, lines_tx)?;
        drop(spec);
        self.shared.pgid.store(pipeline.pgid(), Ordering::SeqCst);

        let result = self.monitor(&mut pipeline, &lines, size, &job.credentials);
        self.shared.pgid.store(0, Ordering::SeqCst);
        if let Ok(summary) = &result {
            self.log(format!("Wrote {} bytes", summary.bytes));
        }
        result
    }

    /// Polls the running pipeline until it finishes or cancellation is
    /// requested.
    fn monitor(
        &self,
        pipeline: &mut RunningPipeline,
        lines: &Receiver<StageLine>,
        source_size: u64,
        credentials: &Credentials,
    ) -> Result<WriteSummary, ImagingError> {
        let poll = self.config.poll_interval();
        let mut monitor = ProgressMonitor::new(source_size);
        let mut throttle = LogThrottle::new(self.config.progress_log_interval());

        loop {
            if self.shared.is_cancelled() {
                self.log("Cancelling: terminating pipeline");
                pipeline.terminate(self.config.grace_period());
                return Err(ImagingError::Cancelled);
            }

            match lines.recv_timeout(poll) {
                Ok(line) => self.handle_line(line, &mut monitor, &mut throttle, credentials),
                Err(RecvTimeoutError::Timeout) => {}
                // Every stage closed stderr; keep polling for exit.
                Err(RecvTimeoutError::Disconnected) => thread::sleep(poll),
            }
            self.flush_progress();

            if let Some(result) = pipeline.try_finish() {
                // Stages have exited; collect what their readers still hold.
                while let Ok(line) = lines.recv_timeout(poll) {
                    self.handle_line(line, &mut monitor, &mut throttle, credentials);
                }
                return result;
            }
        }
    }

    fn handle_line(
        &self,
        line: StageLine,
        monitor: &mut ProgressMonitor,
        throttle: &mut LogThrottle,
        credentials: &Credentials,
    ) {
        match monitor.parse(&line.text) {
            Some(event) => {
                if throttle.should_log() {
                    debug!(bytes = event.bytes_copied, percent = ?event.percent, "{}", event.status_text());
                }
                self.emit(JobEvent::Progress(event));
            }
            None => {
                let text = mask_secrets(&line.text, credentials.secrets());
                self.log(format!("[{}] {}", line.stage.name(), text));
            }
        }
    }

    fn check_cancelled(&self) -> Result<(), ImagingError> {
        if self.shared.is_cancelled() {
            Err(ImagingError::Cancelled)
        } else {
            Ok(())
        }
    }

    fn log(&self, message: impl Into<String>) {
        let message = message.into();
        info!("{message}");
        self.emit(JobEvent::Log(message));
    }

    fn emit(&self, event: JobEvent) {
        match event {
            JobEvent::Progress(progress) => {
                // A newer report supersedes one still waiting for room.
                self.pending.replace(None);
                self.offer_progress(progress);
            }
            // A dropped receiver just means nobody is listening.
            _ => {
                if let Some(progress) = self.pending.take() {
                    let _ = self.events.send(JobEvent::Progress(progress));
                }
                let _ = self.events.send(event);
            }
        }
    }

    /// Retries delivery of a held-back progress report without blocking.
    fn flush_progress(&self) {
        if let Some(progress) = self.pending.take() {
            self.offer_progress(progress);
        }
    }

    fn offer_progress(&self, progress: ProgressEvent) {
        match self.events.try_send(JobEvent::Progress(progress)) {
            Err(TrySendError::Full(JobEvent::Progress(progress))) => {
                debug!("Event receiver is behind; holding the latest progress report");
                self.pending.replace(Some(progress));
            }
            Ok(()) | Err(_) => {}
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "worker panicked".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolve::FixedSize;
    use crate::secret::Secret;

    fn collect(rx: Receiver<JobEvent>) -> Vec<JobEvent> {
        rx.into_iter().collect()
    }

    #[test]
    fn unknown_size_fails_before_pipeline() {
        let dir = tempfile::tempdir().unwrap();
        let mut controller = ExecutionController::new(EngineConfig::default()).with_resolver(FixedSize(0));
        let rx = controller
            .start(ImagingJob::new("/dev/sdz", dir.path().join("out.img")))
            .unwrap();
        let events = collect(rx);
        let outcome = controller.join().unwrap();

        assert!(!outcome.success);
        assert_eq!(outcome.state, JobState::Failed);
        assert_eq!(outcome.message, "Could not determine source device size");
        assert!(!events.contains(&JobEvent::State(JobState::PipelineRunning)));
        assert_eq!(events.last(), Some(&JobEvent::Finished(outcome)));
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn missing_dependency_never_enters_pipeline_running() {
        let dir = tempfile::tempdir().unwrap();
        let config = EngineConfig {
            read_tool: "sh".into(),
            cipher_tool: "diskshot-missing-cipher".into(),
            ..Default::default()
        };
        let job = ImagingJob::new("/dev/sdz", dir.path().join("out.img"))
            .with_options(crate::job::ImagingOptions {
                encrypt: true,
                ..Default::default()
            })
            .with_credentials(Credentials {
                passphrase: Some(Secret::new("pw")),
                ..Default::default()
            });

        let mut controller = ExecutionController::new(config).with_resolver(FixedSize(1 << 20));
        let events = collect(controller.start(job).unwrap());
        let outcome = controller.join().unwrap();

        assert_eq!(outcome.state, JobState::Failed);
        assert!(outcome.message.contains("diskshot-missing-cipher"));
        assert!(!events.contains(&JobEvent::State(JobState::PipelineRunning)));
        assert_eq!(controller.state(), JobState::Failed);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn cancel_before_start_is_a_no_op() {
        let mut controller = ExecutionController::new(EngineConfig::default());
        assert_eq!(controller.cancel(), None);
        assert_eq!(controller.state(), JobState::Idle);
        assert_eq!(controller.join(), None);
    }

    #[test]
    fn cancel_token_sets_shared_flag() {
        let controller = ExecutionController::new(EngineConfig::default());
        let token = controller.cancel_token();
        assert!(!token.is_cancelled());
        token.cancel();
        assert!(controller.shared.is_cancelled());
    }

    fn worker(capacity: usize) -> (Worker, Receiver<JobEvent>) {
        let (events, receiver) = mpsc::sync_channel(capacity);
        let worker = Worker {
            config: Arc::new(EngineConfig::default()),
            resolver: Arc::new(FixedSize(0)),
            shared: Arc::new(Shared::default()),
            events,
            pending: RefCell::new(None),
        };
        (worker, receiver)
    }

    fn progress(bytes: u64) -> JobEvent {
        JobEvent::Progress(ProgressEvent {
            bytes_copied: bytes,
            percent: None,
            throughput: None,
        })
    }

    #[test]
    fn slow_receiver_gets_newest_progress_before_next_event() {
        let (worker, receiver) = worker(2);
        for bytes in 1..=4 {
            worker.emit(progress(bytes));
        }
        assert_eq!(receiver.try_recv().unwrap(), progress(1));
        assert_eq!(receiver.try_recv().unwrap(), progress(2));
        assert!(receiver.try_recv().is_err());

        worker.emit(JobEvent::Log("done".into()));
        let rest: Vec<_> = receiver.try_iter().collect();
        assert_eq!(rest, [progress(4), JobEvent::Log("done".into())]);
    }

    #[test]
    fn held_progress_is_flushed_once_there_is_room() {
        let (worker, receiver) = worker(1);
        worker.emit(progress(1));
        worker.emit(progress(2));
        assert_eq!(receiver.try_recv().unwrap(), progress(1));

        worker.flush_progress();
        assert_eq!(receiver.try_recv().unwrap(), progress(2));
        worker.flush_progress();
        assert!(receiver.try_recv().is_err());
    }

    #[test]
    fn panic_messages_are_extracted() {
        let boxed: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(boxed.as_ref()), "boom");
        let boxed: Box<dyn Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(boxed.as_ref()), "bang");
        let boxed: Box<dyn Any + Send> = Box::new(7u8);
        assert_eq!(panic_message(boxed.as_ref()), "worker panicked");
    }
}
