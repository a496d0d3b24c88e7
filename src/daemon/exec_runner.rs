//! Child-process runner
//!
//! Spawns the collector in its own process group and keeps it alive from a
//! background supervision task. A collector that keeps dying is respawned
//! after a backoff until the restart budget is used up; a run that outlasts
//! the cooldown earns a fresh budget. Stopping sends SIGTERM to the group and
//! escalates to SIGKILL after the grace period.

use super::{lock_or_recover, Runner, RunnerState, StopOutcome, SupervisionPolicy};
use crate::backends::status::BackendState;
use crate::backends::Backend;
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use tokio::process::{Child, Command};
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, error, info, instrument, warn};

/// Captured output attached to the status is cut to this many bytes
const VERBOSE_OUTPUT_LIMIT: usize = 4096;

#[derive(Debug)]
struct Shared {
    state: RwLock<RunnerState>,
    running: AtomicBool,
    spawn_count: AtomicU64,
    restart_count: AtomicU32,
    started_at: RwLock<Option<DateTime<Utc>>>,
}

impl Shared {
    fn set_state(&self, state: RunnerState) {
        *lock_or_recover!(self.state.write()) = state;
    }

    fn state(&self) -> RunnerState {
        *lock_or_recover!(self.state.read())
    }
}

/// Handle on a live supervision task
struct Supervision {
    stop_tx: oneshot::Sender<()>,
    handle: JoinHandle<StopOutcome>,
}

pub struct ExecRunner {
    name: String,
    backend: Arc<dyn Backend>,
    policy: SupervisionPolicy,
    stdout_path: PathBuf,
    stderr_path: PathBuf,
    shared: Arc<Shared>,
    control: Mutex<Option<Supervision>>,
}

impl ExecRunner {
    pub fn new(backend: Arc<dyn Backend>, log_path: &Path, policy: SupervisionPolicy) -> Self {
        let name = backend.name().to_string();
        Self {
            stdout_path: log_path.join(format!("{}_stdout.log", name)),
            stderr_path: log_path.join(format!("{}_stderr.log", name)),
            name,
            backend,
            policy,
            shared: Arc::new(Shared {
                state: RwLock::new(RunnerState::Stopped),
                running: AtomicBool::new(false),
                spawn_count: AtomicU64::new(0),
                restart_count: AtomicU32::new(0),
                started_at: RwLock::new(None),
            }),
            control: Mutex::new(None),
        }
    }

    /// When the current (or last) process was spawned
    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        *lock_or_recover!(self.shared.started_at.read())
    }

    pub fn stderr_path(&self) -> &Path {
        &self.stderr_path
    }

    fn resolve_program(&self) -> Result<PathBuf> {
        match self.backend.exec_path() {
            Ok(program) => Ok(program),
            Err(e) => {
                let message = format!("Unable to find collector executable: {:#}", e);
                error!("[{}] {}", self.name, message);
                self.backend.set_status(BackendState::Error, &message);
                Err(e.context(format!("[{}] Collector executable is not usable", self.name)))
            }
        }
    }

    async fn start_locked(&self, control: &mut Option<Supervision>) -> Result<()> {
        if let Some(supervision) = control.as_ref() {
            if !supervision.handle.is_finished() {
                bail!("[{}] Collector is already running", self.name);
            }
        }
        // Reap a supervision task that gave up after exhausting its budget
        if let Some(finished) = control.take() {
            let _ = finished.handle.await;
        }

        let program = self.resolve_program()?;
        self.shared.restart_count.store(0, Ordering::SeqCst);
        self.shared.set_state(RunnerState::Starting);
        info!("[{}] Starting collector {}", self.name, program.display());

        let task = SupervisionTask {
            name: self.name.clone(),
            backend: Arc::clone(&self.backend),
            policy: self.policy.clone(),
            program,
            args: self.backend.exec_args(),
            stdout_path: self.stdout_path.clone(),
            stderr_path: self.stderr_path.clone(),
            shared: Arc::clone(&self.shared),
        };

        let (stop_tx, stop_rx) = oneshot::channel();
        let handle = tokio::spawn(task.run(stop_rx));
        *control = Some(Supervision { stop_tx, handle });
        Ok(())
    }

    async fn stop_locked(&self, control: &mut Option<Supervision>) -> Result<StopOutcome> {
        let Some(supervision) = control.take() else {
            debug!("[{}] Stop requested but nothing is running", self.name);
            return Ok(StopOutcome::NotRunning);
        };

        if !supervision.handle.is_finished() {
            info!("[{}] Stopping", self.name);
            self.shared.set_state(RunnerState::Stopping);
        }

        // The task may already have given up, in which case nobody listens
        let _ = supervision.stop_tx.send(());
        let outcome = supervision
            .handle
            .await
            .with_context(|| format!("[{}] Supervision task failed", self.name))?;

        self.shared.running.store(false, Ordering::SeqCst);
        self.shared.set_state(RunnerState::Stopped);
        self.backend.set_status(BackendState::Unknown, "Stopped");

        match outcome {
            StopOutcome::Killed => warn!("[{}] Collector had to be killed", self.name),
            StopOutcome::Graceful => info!("[{}] Stopped", self.name),
            StopOutcome::NotRunning => {}
        }
        Ok(outcome)
    }
}

#[async_trait]
impl Runner for ExecRunner {
    fn name(&self) -> &str {
        &self.name
    }

    fn backend(&self) -> Arc<dyn Backend> {
        Arc::clone(&self.backend)
    }

    fn state(&self) -> RunnerState {
        self.shared.state()
    }

    async fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    fn spawn_count(&self) -> u64 {
        self.shared.spawn_count.load(Ordering::SeqCst)
    }

    fn restart_count(&self) -> u32 {
        self.shared.restart_count.load(Ordering::SeqCst)
    }

    async fn validate_before_start(&self) -> Result<()> {
        self.resolve_program().map(|_| ())
    }

    async fn start(&self) -> Result<()> {
        let mut control = self.control.lock().await;
        self.start_locked(&mut control).await
    }

    async fn stop(&self) -> Result<StopOutcome> {
        let mut control = self.control.lock().await;
        self.stop_locked(&mut control).await
    }

    async fn restart(&self) -> Result<()> {
        let mut control = self.control.lock().await;
        self.stop_locked(&mut control).await?;
        sleep(self.policy.settle_delay).await;
        self.start_locked(&mut control).await
    }
}

enum Event {
    StopRequested,
    Exited(std::io::Result<ExitStatus>),
    SpawnFailed,
}

/// Everything the background loop owns
struct SupervisionTask {
    name: String,
    backend: Arc<dyn Backend>,
    policy: SupervisionPolicy,
    program: PathBuf,
    args: Vec<String>,
    stdout_path: PathBuf,
    stderr_path: PathBuf,
    shared: Arc<Shared>,
}

impl SupervisionTask {
    #[instrument(skip_all, fields(collector = %self.name))]
    async fn run(self, mut stop_rx: oneshot::Receiver<()>) -> StopOutcome {
        loop {
            self.shared.set_state(RunnerState::Starting);
            let spawned_at = Instant::now();

            let event = match self.spawn() {
                Ok(mut child) => {
                    self.shared.running.store(true, Ordering::SeqCst);
                    self.shared.spawn_count.fetch_add(1, Ordering::SeqCst);
                    *lock_or_recover!(self.shared.started_at.write()) = Some(Utc::now());
                    self.shared.set_state(RunnerState::Running);
                    self.backend.set_status(BackendState::Running, "Running");
                    debug!("[{}] Spawned pid {:?}", self.name, child.id());

                    let event = tokio::select! {
                        _ = &mut stop_rx => Event::StopRequested,
                        status = child.wait() => Event::Exited(status),
                    };

                    if let Event::StopRequested = event {
                        let outcome = self.terminate(&mut child).await;
                        self.shared.running.store(false, Ordering::SeqCst);
                        self.shared.set_state(RunnerState::Stopped);
                        return outcome;
                    }
                    event
                }
                Err(e) => {
                    let message = format!("Failed to start collector: {:#}", e);
                    error!("[{}] {}", self.name, message);
                    self.backend.set_status(BackendState::Error, &message);
                    Event::SpawnFailed
                }
            };

            self.shared.running.store(false, Ordering::SeqCst);
            self.shared.set_state(RunnerState::Crashed);
            let lifetime = spawned_at.elapsed();

            match event {
                Event::Exited(Ok(status)) => {
                    warn!("[{}] Collector exited with {} after {:?}", self.name, status, lifetime)
                }
                Event::Exited(Err(e)) => {
                    error!("[{}] Lost track of collector process: {}", self.name, e)
                }
                Event::SpawnFailed | Event::StopRequested => {}
            }

            if lifetime >= self.policy.cooldown {
                debug!("[{}] Collector ran past the cooldown, resetting restart budget", self.name);
                self.shared.restart_count.store(0, Ordering::SeqCst);
            } else if lifetime < self.policy.stability_threshold {
                error!(
                    "[{}] Collector exited immediately, check its configuration and output in {}",
                    self.name,
                    self.stderr_path.display()
                );
            }

            let restarts = self.shared.restart_count.load(Ordering::SeqCst);
            if restarts >= self.policy.max_restarts {
                let message = format!(
                    "Unable to start collector after {} tries, giving up!",
                    self.policy.max_restarts
                );
                error!("[{}] {}", self.name, message);
                self.backend.set_status(BackendState::Error, &message);
                if let Some(output) = self.collector_output() {
                    error!("[{}] Collector output: {}", self.name, output);
                    self.backend.set_verbose_status(&output);
                }
                return StopOutcome::NotRunning;
            }

            let attempt = self.shared.restart_count.fetch_add(1, Ordering::SeqCst) + 1;
            warn!(
                "[{}] Collector finished unexpectedly, restarting in {:?} ({}/{})",
                self.name, self.policy.backoff, attempt, self.policy.max_restarts
            );
            self.backend
                .set_status(BackendState::Unknown, "Collector exited unexpectedly, restarting");

            tokio::select! {
                _ = &mut stop_rx => {
                    self.shared.set_state(RunnerState::Stopped);
                    return StopOutcome::NotRunning;
                }
                _ = sleep(self.policy.backoff) => {}
            }
        }
    }

    fn spawn(&self) -> Result<Child> {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(log_target(&self.stdout_path))
            .stderr(log_target(&self.stderr_path))
            .kill_on_drop(true);

        #[cfg(unix)]
        command.process_group(0);

        command
            .spawn()
            .with_context(|| format!("Failed to spawn {}", self.program.display()))
    }

    async fn terminate(&self, child: &mut Child) -> StopOutcome {
        if let Ok(Some(_)) = child.try_wait() {
            return StopOutcome::Graceful;
        }

        send_graceful(child);
        match timeout(self.policy.grace_period, child.wait()).await {
            Ok(_) => StopOutcome::Graceful,
            Err(_) => {
                warn!(
                    "[{}] Collector ignored the stop request for {:?}, killing it",
                    self.name, self.policy.grace_period
                );
                send_kill(child);
                if let Err(e) = child.wait().await {
                    error!("[{}] Failed to reap killed collector: {}", self.name, e);
                }
                StopOutcome::Killed
            }
        }
    }

    /// stdout and stderr captured from the last run
    fn collector_output(&self) -> Option<String> {
        let mut output = String::new();
        for path in [&self.stdout_path, &self.stderr_path] {
            if let Ok(bytes) = std::fs::read(path) {
                output.push_str(&String::from_utf8_lossy(&bytes));
            }
        }

        let output = output.trim();
        if output.is_empty() {
            None
        } else {
            Some(tail(output, VERBOSE_OUTPUT_LIMIT).to_string())
        }
    }
}

/// Truncate the log file and hand it to the child, or discard output if the
/// file cannot be opened
fn log_target(path: &Path) -> Stdio {
    if let Some(parent) = path.parent() {
        let _ = std::fs::create_dir_all(parent);
    }
    match File::create(path) {
        Ok(file) => Stdio::from(file),
        Err(e) => {
            warn!("Unable to open {} for collector output: {}", path.display(), e);
            Stdio::null()
        }
    }
}

fn tail(text: &str, limit: usize) -> &str {
    if text.len() <= limit {
        return text;
    }
    let mut start = text.len() - limit;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    &text[start..]
}

#[cfg(unix)]
fn signal_group(child: &mut Child, signal: nix::sys::signal::Signal) -> bool {
    use nix::sys::signal::killpg;
    use nix::unistd::Pid;

    let Some(pid) = child.id() else {
        return false;
    };
    match killpg(Pid::from_raw(pid as i32), signal) {
        Ok(()) => true,
        Err(e) => {
            debug!("Failed to send {:?} to process group {}: {}", signal, pid, e);
            false
        }
    }
}

#[cfg(unix)]
fn send_graceful(child: &mut Child) {
    signal_group(child, nix::sys::signal::Signal::SIGTERM);
}

#[cfg(unix)]
fn send_kill(child: &mut Child) {
    if !signal_group(child, nix::sys::signal::Signal::SIGKILL) {
        let _ = child.start_kill();
    }
}

#[cfg(not(unix))]
fn send_graceful(child: &mut Child) {
    let _ = child.start_kill();
}

#[cfg(not(unix))]
fn send_kill(child: &mut Child) {
    let _ = child.start_kill();
}
