//! Launch, stream, cancel and reap generation jobs.
//!
//! One child process per [`JobHandle`]. Its stdout and stderr share a single
//! pipe, drained by a reader thread into the handle's log. Everything else
//! (polling, cancellation, awaiting) runs on the caller's thread and takes
//! the handle's lock only briefly, so a cancel request is never stuck behind
//! a wait for output.

mod lines;
pub(crate) mod process;
pub mod types;

pub use types::{JobResult, JobState, Outcome, PollBatch};

use crate::config::{self, Config, Tools};
use crate::error::{JobError, Result};
use crate::invocation::Invocation;
use crate::job::JobSpec;
use crate::util::ensure_dir;
use lines::LineSplitter;
use std::io::{self, Read};
use std::path::PathBuf;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

static NEXT_JOB_ID: AtomicU64 = AtomicU64::new(1);

pub struct Runner {
    settings: config::Runner,
    tools: Tools,
}

impl Runner {
    pub fn new(cfg: &Config) -> Self {
        Self::with_settings(cfg.runner.clone(), cfg.tools.clone())
    }

    pub fn with_settings(settings: config::Runner, tools: Tools) -> Self {
        Self { settings, tools }
    }

    pub fn settings(&self) -> &config::Runner {
        &self.settings
    }

    /// The exact command line `launch` would run for `spec`.
    pub fn invocation(&self, spec: &JobSpec) -> Invocation {
        Invocation::with_tool(&self.tools.resolve(spec.mode), spec)
    }

    /// Validate `spec`, start the tool and return without waiting for it.
    ///
    /// Fails before spawning on validation or filesystem problems, or when
    /// the session already has a live job. A spawn failure is not an error
    /// here: the returned handle is already terminal and its result says
    /// [`Outcome::LaunchFailed`].
    pub fn launch(&self, session: &Session, spec: &JobSpec) -> Result<JobHandle> {
        spec.validate()?;

        let mut slot = session.lock();
        if let Some(prev) = slot.as_ref() {
            if prev.is_live() {
                return Err(JobError::AlreadyRunning);
            }
        }

        ensure_dir(&spec.out_dir)?;

        let invocation = self.invocation(spec);
        let job_id = NEXT_JOB_ID.fetch_add(1, Ordering::Relaxed);
        let handle = JobHandle::start(job_id, invocation, spec.output_path(), &self.settings);
        *slot = Some(handle.clone());
        Ok(handle)
    }

    pub fn poll_output(&self, handle: &JobHandle, wait: Duration) -> PollBatch {
        handle.poll_output(wait)
    }

    pub fn cancel(&self, handle: &JobHandle) {
        handle.cancel()
    }

    pub fn await_result(&self, handle: &JobHandle) -> JobResult {
        handle.await_result()
    }

    /// Terminate a process left over from an earlier interaction cycle.
    ///
    /// Never fails: a handle that is already gone is fine.
    pub fn reap_orphan(&self, handle: Option<&JobHandle>) {
        let Some(handle) = handle else {
            return;
        };
        if !handle.is_live() {
            debug!("job {}: nothing to reap ({:?})", handle.id(), handle.state());
            return;
        }
        info!("job {}: reaping orphaned generator process", handle.id());
        handle.cancel();
    }
}

/// Per-user (per-tab) slot holding at most one live job.
#[derive(Default)]
pub struct Session {
    slot: Mutex<Option<JobHandle>>,
}

impl Session {
    pub fn new() -> Self {
        Self::default()
    }

    /// The most recently launched job, live or finished.
    pub fn current(&self) -> Option<JobHandle> {
        self.lock().clone()
    }

    /// Run at the start of an interaction cycle, before any new launch.
    pub fn reap_orphan(&self, runner: &Runner) {
        let current = self.current();
        runner.reap_orphan(current.as_ref());
    }

    fn lock(&self) -> MutexGuard<'_, Option<JobHandle>> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Shared reference to one launched job.
#[derive(Clone)]
pub struct JobHandle {
    shared: Arc<Shared>,
}

struct Shared {
    id: u64,
    invocation: Invocation,
    artifact: PathBuf,
    grace_period: Duration,
    poll_interval: Duration,
    started: Instant,
    inner: Mutex<Inner>,
    output_ready: Condvar,
}

struct Inner {
    state: JobState,
    pid: Option<u32>,
    child: Option<Child>,
    exit: Option<ExitStatus>,
    log: Vec<String>,
    delivered: usize,
    eof: bool,
    result: Option<JobResult>,
}

impl std::fmt::Debug for JobHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobHandle")
            .field("id", &self.shared.id)
            .field("program", &self.shared.invocation.program)
            .field("state", &self.lock().state)
            .finish()
    }
}

impl JobHandle {
    fn start(id: u64, invocation: Invocation, artifact: PathBuf, settings: &config::Runner) -> Self {
        let shared = Arc::new(Shared {
            id,
            invocation,
            artifact,
            grace_period: settings.grace_period(),
            poll_interval: settings.poll_interval(),
            started: Instant::now(),
            inner: Mutex::new(Inner {
                state: JobState::NotStarted,
                pid: None,
                child: None,
                exit: None,
                log: Vec::new(),
                delivered: 0,
                eof: false,
                result: None,
            }),
            output_ready: Condvar::new(),
        });
        let handle = Self { shared };

        match spawn_merged(&handle.shared.invocation) {
            Ok((child, reader)) => {
                let pid = child.id();
                {
                    let mut inner = handle.lock();
                    inner.pid = Some(pid);
                    inner.child = Some(child);
                    inner.state = JobState::Running;
                }
                info!(
                    "job {id} started pid={pid}: {}",
                    handle.shared.invocation.display()
                );
                let shared = Arc::clone(&handle.shared);
                let spawned = std::thread::Builder::new()
                    .name(format!("job-{id}-output"))
                    .spawn(move || pump_output(&shared, reader));
                if let Err(e) = spawned {
                    // No reader means the pipe fills and the tool stalls; stop it now.
                    warn!("job {id}: failed to start output reader: {e}");
                    handle.lock().eof = true;
                    handle.cancel();
                }
            }
            Err(e) => {
                warn!(
                    "job {id}: failed to launch {}: {e}",
                    handle.shared.invocation.program
                );
                let mut inner = handle.lock();
                inner.state = JobState::Failed { exit_code: None };
                inner.eof = true;
                inner.result = Some(JobResult {
                    job_id: id,
                    outcome: Outcome::LaunchFailed {
                        message: format!("{}: {e}", handle.shared.invocation.program),
                    },
                    exit_code: None,
                    output: Vec::new(),
                    expected_artifact: handle.shared.artifact.clone(),
                    artifact: None,
                    duration_ms: 0,
                });
            }
        }

        handle
    }

    pub fn id(&self) -> u64 {
        self.shared.id
    }

    pub fn invocation(&self) -> &Invocation {
        &self.shared.invocation
    }

    pub fn expected_artifact(&self) -> &std::path::Path {
        &self.shared.artifact
    }

    pub fn pid(&self) -> Option<u32> {
        self.lock().pid
    }

    /// Current state, after checking whether the process has exited.
    pub fn state(&self) -> JobState {
        let mut inner = self.lock();
        self.refresh(&mut inner);
        inner.state
    }

    pub fn is_live(&self) -> bool {
        self.state().is_live()
    }

    /// Snapshot of every line captured so far. Does not move the poll cursor.
    pub fn output(&self) -> Vec<String> {
        self.lock().log.clone()
    }

    /// Hand out lines appended since the previous call.
    ///
    /// With a non-zero `wait`, blocks until a line arrives, the stream ends,
    /// or `wait` elapses.
    pub fn poll_output(&self, wait: Duration) -> PollBatch {
        let mut inner = self.lock();
        if !wait.is_zero() {
            let deadline = Instant::now() + wait;
            while inner.delivered == inner.log.len() && !inner.eof {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    break;
                }
                inner = self
                    .shared
                    .output_ready
                    .wait_timeout(inner, remaining)
                    .unwrap_or_else(PoisonError::into_inner)
                    .0;
            }
        }

        let lines = inner.log[inner.delivered..].to_vec();
        inner.delivered = inner.log.len();
        PollBatch {
            lines,
            finished: inner.eof,
        }
    }

    /// Two-phase stop: SIGTERM to the group, then SIGKILL after the grace period.
    ///
    /// No-op unless the job is `Running`; calling it again is harmless.
    pub fn cancel(&self) {
        let id = self.shared.id;
        {
            let mut inner = self.lock();
            self.refresh(&mut inner);
            if inner.state != JobState::Running {
                debug!("job {id}: cancel ignored in state {:?}", inner.state);
                return;
            }
            inner.state = JobState::Cancelling;
            if let Some(child) = inner.child.as_ref() {
                info!("job {id}: sending termination signal to process group");
                if let Err(e) = process::terminate_group(child) {
                    warn!("job {id}: graceful termination failed: {e}");
                }
            }
        }

        let deadline = Instant::now() + self.shared.grace_period;
        loop {
            {
                let mut inner = self.lock();
                self.refresh(&mut inner);
                let leader_gone = inner.exit.is_some() || inner.child.is_none();
                // An open pipe means some member of the group is still alive.
                if leader_gone && inner.eof {
                    inner.state = JobState::Cancelled;
                    info!("job {id}: cancelled");
                    return;
                }
                if Instant::now() >= deadline {
                    warn!(
                        "job {id}: still running after {:?}; killing process group",
                        self.shared.grace_period
                    );
                    if leader_gone {
                        self.kill_stragglers(&inner);
                    } else {
                        self.force_kill(&mut inner);
                    }
                    inner.state = JobState::Cancelled;
                    return;
                }
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            std::thread::sleep(self.shared.poll_interval.min(remaining));
        }
    }

    /// Block until the process is gone and classify how it ended.
    pub fn await_result(&self) -> JobResult {
        let id = self.shared.id;
        loop {
            {
                let mut inner = self.lock();
                if let Some(result) = &inner.result {
                    return result.clone();
                }
                self.refresh(&mut inner);
                if inner.state.is_terminal() {
                    break;
                }
            }
            std::thread::sleep(self.shared.poll_interval);
        }

        // Helpers that inherited the pipe can keep it open past the exit.
        let mut inner = self.lock();
        let mut deadline = Instant::now() + self.shared.grace_period;
        let mut killed = false;
        while !inner.eof {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                if killed {
                    warn!("job {id}: output still open after kill; returning captured lines");
                    break;
                }
                warn!("job {id}: output still open after exit; killing process group");
                self.kill_stragglers(&inner);
                killed = true;
                deadline = Instant::now() + self.shared.grace_period;
                continue;
            }
            inner = self
                .shared
                .output_ready
                .wait_timeout(inner, remaining)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }

        if let Some(result) = &inner.result {
            return result.clone();
        }

        let exit_code = inner.exit.and_then(|s| s.code());
        let outcome = match inner.state {
            JobState::Cancelled => Outcome::Cancelled,
            JobState::Completed { .. } if self.shared.artifact.is_file() => Outcome::Success,
            JobState::Completed { .. } => Outcome::ArtifactMissing,
            _ => Outcome::ProcessFailure,
        };
        let artifact = matches!(outcome, Outcome::Success).then(|| self.shared.artifact.clone());

        match &outcome {
            Outcome::Success => info!("job {id}: wrote {}", self.shared.artifact.display()),
            Outcome::ArtifactMissing => warn!(
                "job {id}: exited 0 but {} does not exist",
                self.shared.artifact.display()
            ),
            Outcome::ProcessFailure => warn!("job {id}: failed exit_code={exit_code:?}"),
            other => debug!("job {id}: finished {other:?}"),
        }

        let result = JobResult {
            job_id: id,
            outcome,
            exit_code,
            output: inner.log.clone(),
            expected_artifact: self.shared.artifact.clone(),
            artifact,
            duration_ms: self.shared.started.elapsed().as_millis() as u64,
        };
        inner.result = Some(result.clone());
        // Reaped; release the OS handle.
        inner.child = None;
        result
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.shared
            .inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Record the exit status if the child has exited since the last check.
    fn refresh(&self, inner: &mut Inner) {
        if inner.exit.is_some() {
            return;
        }
        let Some(child) = inner.child.as_mut() else {
            return;
        };
        match child.try_wait() {
            Ok(Some(status)) => self.record_exit(inner, status),
            Ok(None) => {}
            Err(e) => warn!("job {}: try_wait failed: {e}", self.shared.id),
        }
    }

    fn record_exit(&self, inner: &mut Inner, status: ExitStatus) {
        debug!("job {}: exited with {status}", self.shared.id);
        inner.exit = Some(status);
        inner.state = match inner.state {
            JobState::Cancelling | JobState::Cancelled => JobState::Cancelled,
            _ if status.success() => JobState::Completed { exit_code: 0 },
            _ => JobState::Failed {
                exit_code: status.code(),
            },
        };
    }

    /// SIGKILL what is left of the group once the leader has been reaped.
    ///
    /// Only called while the output pipe is still open, i.e. while something
    /// the tool started is still around.
    fn kill_stragglers(&self, inner: &Inner) {
        let Some(pid) = inner.pid else {
            return;
        };
        if let Err(e) = process::kill_group_of(pid) {
            warn!("job {}: killing leftover processes failed: {e}", self.shared.id);
        }
    }

    fn force_kill(&self, inner: &mut Inner) {
        let id = self.shared.id;
        let Some(child) = inner.child.as_mut() else {
            return;
        };
        if let Err(e) = process::kill_group(child) {
            warn!("job {id}: kill failed: {e}");
        }
        match child.wait() {
            Ok(status) => self.record_exit(inner, status),
            Err(e) => warn!("job {id}: wait after kill failed: {e}"),
        }
    }
}

/// Spawn with stdout and stderr on one pipe, so lines keep the order the
/// tool wrote them in.
fn spawn_merged(invocation: &Invocation) -> io::Result<(Child, io::PipeReader)> {
    let (reader, writer) = io::pipe()?;
    let writer_err = writer.try_clone()?;

    let mut cmd = Command::new(&invocation.program);
    cmd.args(&invocation.args)
        .env("PYTHONUNBUFFERED", "1")
        .stdin(Stdio::null())
        .stdout(writer)
        .stderr(writer_err);
    process::configure(&mut cmd);

    let child = cmd.spawn()?;
    // The command still owns our copies of the write end; drop them or the
    // reader never sees EOF.
    drop(cmd);
    Ok((child, reader))
}

fn pump_output(shared: &Shared, mut reader: io::PipeReader) {
    let mut splitter = LineSplitter::default();
    let mut buf = [0u8; 8192];
    loop {
        match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                let lines = splitter.feed(&buf[..n]);
                if !lines.is_empty() {
                    append(shared, lines);
                }
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                warn!("job {}: reading output failed: {e}", shared.id);
                break;
            }
        }
    }
    if let Some(rest) = splitter.finish() {
        append(shared, vec![rest]);
    }

    let mut inner = shared.inner.lock().unwrap_or_else(PoisonError::into_inner);
    inner.eof = true;
    drop(inner);
    shared.output_ready.notify_all();
    debug!("job {}: output closed", shared.id);
}

fn append(shared: &Shared, lines: Vec<String>) {
    for line in &lines {
        trace!(target: "flux_runner::tool", job = shared.id, "{line}");
    }
    let mut inner = shared.inner.lock().unwrap_or_else(PoisonError::into_inner);
    inner.log.extend(lines);
    drop(inner);
    shared.output_ready.notify_all();
}
