use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::future::Future;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use nix::unistd::Pid;
use tokio_util::sync::CancellationToken;

use crate::error::BatchError;
use crate::report::OutputSink;
use crate::{log_debug, log_warn};

/// Maximum time to wait for graceful shutdown after SIGTERM before sending SIGKILL.
const SIGTERM_GRACE_PERIOD_SECONDS: u64 = 5;

/// Polling interval when waiting for a process group to exit after SIGTERM.
const KILL_POLL_INTERVAL_MS: u64 = 100;

/// Global shutdown flag shared with signal handlers.
fn shutdown_flag() -> &'static Arc<AtomicBool> {
    static FLAG: OnceLock<Arc<AtomicBool>> = OnceLock::new();
    FLAG.get_or_init(|| Arc::new(AtomicBool::new(false)))
}

/// Check if a shutdown has been requested via signal.
pub fn is_shutdown_requested() -> bool {
    shutdown_flag().load(Ordering::Relaxed)
}

/// Install SIGTERM and SIGINT handlers that set the shutdown flag.
pub fn install_signal_handlers() -> Result<(), String> {
    let flag = Arc::clone(shutdown_flag());
    signal_hook::flag::register(signal_hook::consts::SIGTERM, Arc::clone(&flag))
        .map_err(|e| format!("Failed to register SIGTERM handler: {}", e))?;
    signal_hook::flag::register(signal_hook::consts::SIGINT, flag)
        .map_err(|e| format!("Failed to register SIGINT handler: {}", e))?;
    Ok(())
}

/// Cancel `cancel` once a shutdown signal arrives. Exits when the token is
/// cancelled for any other reason.
pub async fn watch_for_shutdown(cancel: CancellationToken) {
    loop {
        if is_shutdown_requested() {
            log_warn!("Shutdown requested, cancelling batch");
            cancel.cancel();
            return;
        }
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_millis(100)) => {}
            _ = cancel.cancelled() => return,
        }
    }
}

// --- Process Registry ---

/// Process groups of commands still running, so a shutdown can reach them.
fn process_registry() -> &'static Mutex<HashSet<Pid>> {
    static REGISTRY: OnceLock<Mutex<HashSet<Pid>>> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(HashSet::new()))
}

fn register_child(pgid: Pid) {
    if let Ok(mut registry) = process_registry().lock() {
        registry.insert(pgid);
    }
}

fn unregister_child(pgid: Pid) {
    if let Ok(mut registry) = process_registry().lock() {
        registry.remove(&pgid);
    }
}

/// SIGTERM every registered process group, wait out the grace period, then
/// SIGKILL survivors. Used on the way out when tasks could not clean up.
pub fn kill_all_children() {
    use nix::sys::signal::{killpg, Signal};

    let pgids: Vec<Pid> = {
        let Ok(mut registry) = process_registry().lock() else {
            return;
        };
        registry.drain().collect()
    };

    if pgids.is_empty() {
        return;
    }

    for &pgid in &pgids {
        let _ = killpg(pgid, Signal::SIGTERM);
    }

    let deadline = std::time::Instant::now() + Duration::from_secs(SIGTERM_GRACE_PERIOD_SECONDS);
    while std::time::Instant::now() < deadline {
        let all_gone = pgids
            .iter()
            .all(|&pgid| matches!(killpg(pgid, None), Err(nix::errno::Errno::ESRCH)));
        if all_gone {
            return;
        }
        std::thread::sleep(Duration::from_millis(KILL_POLL_INTERVAL_MS));
    }

    for &pgid in &pgids {
        let _ = killpg(pgid, Signal::SIGKILL);
    }
}

// --- Runner ---

/// Exit of a finished process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessExit {
    pub code: Option<i32>,
}

impl ProcessExit {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

/// One process launch.
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub command: String,
    pub argv: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub dir: Option<PathBuf>,
    pub sink: OutputSink,
}

/// Trait for running command processes. Enables mocking in scheduler tests.
///
/// `Ok` carries the exit of a process that ran; `Err` means it could not be
/// spawned or the batch was cancelled while it ran.
pub trait ProcessRunner: Send + Sync {
    fn run(
        &self,
        request: RunRequest,
        cancel: &CancellationToken,
    ) -> impl Future<Output = Result<ProcessExit, BatchError>> + Send;
}

/// Runs commands as local subprocesses, each in its own process group.
#[derive(Debug, Default)]
pub struct SubprocessRunner;

impl ProcessRunner for SubprocessRunner {
    async fn run(
        &self,
        request: RunRequest,
        cancel: &CancellationToken,
    ) -> Result<ProcessExit, BatchError> {
        let spawn_error = |message: String| BatchError::Execution {
            command: request.command.clone(),
            message,
        };

        let (program, args) = request
            .argv
            .split_first()
            .ok_or_else(|| spawn_error("empty argv".to_string()))?;

        let mut cmd = tokio::process::Command::new(program);
        cmd.args(args).envs(&request.env);
        if let Some(dir) = &request.dir {
            cmd.current_dir(dir);
        }

        // stdin MUST be null: in its own process group the child is in the
        // background and a terminal read would stop it with SIGTTIN.
        cmd.stdin(Stdio::null());
        let (stdout, stderr) = request
            .sink
            .stdio()
            .map_err(|e| spawn_error(format!("Failed to open output sink: {}", e)))?;
        cmd.stdout(stdout);
        cmd.stderr(stderr);
        cmd.kill_on_drop(true);

        // SAFETY: pre_exec runs between fork() and exec() where only async-signal-safe
        // functions are permitted. setpgid is async-signal-safe per POSIX.
        unsafe {
            cmd.pre_exec(|| {
                nix::unistd::setpgid(Pid::from_raw(0), Pid::from_raw(0))
                    .map_err(std::io::Error::other)?;
                Ok(())
            });
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| spawn_error(format!("Failed to spawn '{}': {}", program, e)))?;
        let child_pid = child
            .id()
            .ok_or_else(|| spawn_error("Failed to get child PID".to_string()))?
            as i32;
        let pgid = Pid::from_raw(child_pid);
        register_child(pgid);
        log_debug!("[{}] Spawned pid={}", request.command, child_pid);

        let wait_result = tokio::select! {
            result = child.wait() => Some(result),
            _ = cancel.cancelled() => None,
        };

        let outcome = match wait_result {
            Some(result) => {
                let status = result.map_err(|e| spawn_error(format!("Error waiting: {}", e)));
                status.map(|s| ProcessExit { code: s.code() })
            }
            None => {
                log_debug!("[{}] Cancelled, stopping process group", request.command);
                kill_process_group(child_pid).await;
                let _ = child.wait().await;
                Err(BatchError::Cancelled)
            }
        };
        unregister_child(pgid);
        outcome
    }
}

/// Kill a process group by PID. Sends SIGTERM, polls for exit, then SIGKILL if needed.
///
/// The poll-and-sleep loop runs on the blocking pool so async workers keep going.
async fn kill_process_group(pgid: i32) {
    tokio::task::spawn_blocking(move || {
        use nix::sys::signal::{killpg, Signal};

        let pgid = Pid::from_raw(pgid);

        if let Err(nix::errno::Errno::ESRCH) = killpg(pgid, Signal::SIGTERM) {
            return;
        }

        let deadline =
            std::time::Instant::now() + Duration::from_secs(SIGTERM_GRACE_PERIOD_SECONDS);
        let poll_interval = Duration::from_millis(KILL_POLL_INTERVAL_MS);

        while std::time::Instant::now() < deadline {
            match killpg(pgid, None) {
                Err(nix::errno::Errno::ESRCH) => return,
                _ => std::thread::sleep(poll_interval),
            }
        }

        let _ = killpg(pgid, Signal::SIGKILL);
    })
    .await
    .unwrap_or_else(|e| log_warn!("kill_process_group task panicked: {}", e));
}

// --- Mock ---

/// Scripted result of one mock process run.
#[derive(Debug, Clone)]
pub enum MockOutcome {
    Exit(i32),
    SpawnError(String),
    /// Exit with the code after the delay, unless the batch is cancelled first.
    Delayed(Duration, i32),
}

#[derive(Default)]
struct MockState {
    scripts: HashMap<String, VecDeque<MockOutcome>>,
    started: Vec<String>,
    completed: Vec<String>,
    envs: HashMap<String, BTreeMap<String, String>>,
}

/// Mock process runner for scheduler tests.
///
/// Each command pops outcomes from its script in order; once the script is
/// empty (or absent) runs exit 0 immediately.
#[derive(Default)]
pub struct MockProcessRunner {
    state: Mutex<MockState>,
    running: AtomicUsize,
    peak: AtomicUsize,
}

impl MockProcessRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(self, command: &str, outcomes: Vec<MockOutcome>) -> Self {
        self.lock()
            .scripts
            .insert(command.to_string(), outcomes.into());
        self
    }

    /// Commands in the order their processes started, one entry per attempt.
    pub fn started(&self) -> Vec<String> {
        self.lock().started.clone()
    }

    /// Commands whose process ran to an exit, one entry per attempt.
    pub fn completed(&self) -> Vec<String> {
        self.lock().completed.clone()
    }

    pub fn attempts(&self, command: &str) -> usize {
        self.lock().started.iter().filter(|c| *c == command).count()
    }

    /// Environment passed to the command's most recent run.
    pub fn env_of(&self, command: &str) -> Option<BTreeMap<String, String>> {
        self.lock().envs.get(command).cloned()
    }

    /// Highest number of processes observed running at once.
    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl ProcessRunner for MockProcessRunner {
    async fn run(
        &self,
        request: RunRequest,
        cancel: &CancellationToken,
    ) -> Result<ProcessExit, BatchError> {
        let outcome = {
            let mut state = self.lock();
            state.started.push(request.command.clone());
            state
                .envs
                .insert(request.command.clone(), request.env.clone());
            state
                .scripts
                .get_mut(&request.command)
                .and_then(|s| s.pop_front())
                .unwrap_or(MockOutcome::Exit(0))
        };

        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);

        let result = match outcome {
            MockOutcome::Exit(code) => Ok(ProcessExit { code: Some(code) }),
            MockOutcome::SpawnError(message) => Err(BatchError::Execution {
                command: request.command.clone(),
                message,
            }),
            MockOutcome::Delayed(delay, code) => tokio::select! {
                _ = tokio::time::sleep(delay) => Ok(ProcessExit { code: Some(code) }),
                _ = cancel.cancelled() => Err(BatchError::Cancelled),
            },
        };

        self.running.fetch_sub(1, Ordering::SeqCst);
        if result.is_ok() {
            self.lock().completed.push(request.command.clone());
        }
        result
    }
}
