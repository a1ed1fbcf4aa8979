use std::io;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};
use std::time::Duration;

use cc_executor_error::ExecutorError;
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tokio::sync::watch;
use tokio::time::Instant;

use crate::config::ServerConfig;
use crate::control::{self, ProcessState};

/// Allow-list check applied to every command before it is spawned.
#[derive(Debug, Clone, Default)]
pub struct CommandPolicy {
    allowed: Option<Vec<String>>,
}

impl CommandPolicy {
    pub fn new(allowed: Option<Vec<String>>) -> Self {
        Self { allowed }
    }

    pub fn check(&self, command: &str) -> Result<(), ExecutorError> {
        let Some(base) = command.split_whitespace().next() else {
            return Err(ExecutorError::CommandNotAllowed {
                command: command.to_string(),
                reason: "command is empty".to_string(),
            });
        };
        if let Some(allowed) = &self.allowed {
            if !allowed.iter().any(|entry| entry.trim() == base) {
                return Err(ExecutorError::CommandNotAllowed {
                    command: command.to_string(),
                    reason: format!("`{base}` is not in the allowed command list"),
                });
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalKind {
    Pause,
    Resume,
    /// SIGTERM now, SIGKILL once the grace period runs out.
    TerminateGraceful,
    TerminateForced,
}

impl SignalKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pause => "pause",
            Self::Resume => "resume",
            Self::TerminateGraceful => "terminate_graceful",
            Self::TerminateForced => "terminate_forced",
        }
    }
}

/// Shared view of one spawned process. The `Child` itself is owned by
/// whoever calls [`Supervisor::wait`].
#[derive(Debug)]
pub struct ProcessHandle {
    pid: u32,
    pgid: i32,
    command: String,
    started_at: Instant,
    state: Mutex<ProcessState>,
    exit_code: OnceLock<i32>,
    exited: AtomicBool,
    reported: AtomicBool,
    output_bytes: AtomicU64,
    kill_deadline: watch::Sender<Option<Instant>>,
}

impl ProcessHandle {
    fn new(pid: u32, pgid: i32, command: String) -> Self {
        let (kill_deadline, _) = watch::channel(None);
        Self {
            pid,
            pgid,
            command,
            started_at: Instant::now(),
            state: Mutex::new(ProcessState::NotStarted),
            exit_code: OnceLock::new(),
            exited: AtomicBool::new(false),
            reported: AtomicBool::new(false),
            output_bytes: AtomicU64::new(0),
            kill_deadline,
        }
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn pgid(&self) -> i32 {
        self.pgid
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    pub fn started_at(&self) -> Instant {
        self.started_at
    }

    pub fn state(&self) -> ProcessState {
        *self.lock_state()
    }

    /// Holding this guard serializes state transitions against each other.
    pub(crate) fn lock_state(&self) -> MutexGuard<'_, ProcessState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.exit_code.get().copied()
    }

    pub fn has_exited(&self) -> bool {
        self.exited.load(Ordering::SeqCst)
    }

    /// True once the exit (or a failed wait) has been reported to the client.
    pub fn is_reported(&self) -> bool {
        self.reported.load(Ordering::SeqCst)
    }

    pub(crate) fn mark_reported(&self) {
        self.reported.store(true, Ordering::SeqCst);
    }

    pub fn record_output(&self, bytes: usize) {
        self.output_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn output_bytes(&self) -> u64 {
        self.output_bytes.load(Ordering::Relaxed)
    }

    pub fn kill_deadline(&self) -> Option<Instant> {
        *self.kill_deadline.borrow()
    }

    fn mark_exited(&self, code: i32) {
        let _ = self.exit_code.set(code);
        self.exited.store(true, Ordering::SeqCst);
    }

    fn arm_kill_deadline(&self, deadline: Instant) {
        self.kill_deadline.send_if_modified(|current| {
            if current.is_none() {
                *current = Some(deadline);
                true
            } else {
                false
            }
        });
    }
}

pub struct SpawnedProcess {
    pub handle: Arc<ProcessHandle>,
    pub child: Child,
    pub stdout: ChildStdout,
    pub stderr: ChildStderr,
}

#[derive(Debug)]
pub struct Supervisor {
    policy: CommandPolicy,
    shell: PathBuf,
    working_dir: Option<PathBuf>,
    termination_grace: Duration,
}

impl Supervisor {
    pub fn new(config: &ServerConfig) -> Self {
        Self {
            policy: CommandPolicy::new(config.allowed_commands.clone()),
            shell: config.shell.clone(),
            working_dir: config.working_dir.clone(),
            termination_grace: config.termination_grace,
        }
    }

    pub fn policy(&self) -> &CommandPolicy {
        &self.policy
    }

    pub fn termination_grace(&self) -> Duration {
        self.termination_grace
    }

    /// Spawns `command` through the configured shell in a fresh process
    /// group with stdin closed and both output pipes captured.
    pub fn spawn(&self, command: &str) -> Result<SpawnedProcess, ExecutorError> {
        self.policy.check(command)?;

        let mut child_command = Command::new(&self.shell);
        child_command
            .arg("-c")
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .env("PYTHONUNBUFFERED", "1")
            .env("NODE_NO_READLINE", "1")
            .kill_on_drop(true);
        if let Some(dir) = &self.working_dir {
            child_command.current_dir(dir);
        }
        #[cfg(unix)]
        child_command.process_group(0);

        let mut child = child_command.spawn().map_err(|err| {
            tracing::error!(command = %command, error = %err, "failed to spawn process");
            ExecutorError::SpawnFailed {
                command: command.to_string(),
                message: err.to_string(),
            }
        })?;

        let pid = child.id().ok_or_else(|| ExecutorError::SpawnFailed {
            command: command.to_string(),
            message: "process exited before its pid was read".to_string(),
        })?;
        let stdout = child.stdout.take().ok_or_else(|| ExecutorError::SpawnFailed {
            command: command.to_string(),
            message: "failed to capture stdout".to_string(),
        })?;
        let stderr = child.stderr.take().ok_or_else(|| ExecutorError::SpawnFailed {
            command: command.to_string(),
            message: "failed to capture stderr".to_string(),
        })?;

        let pgid = process_group_of(pid);
        tracing::info!(command = %command, pid, pgid, "spawned process");

        let handle = Arc::new(ProcessHandle::new(pid, pgid, command.to_string()));
        control::start(&handle)?;

        Ok(SpawnedProcess {
            handle,
            child,
            stdout,
            stderr,
        })
    }

    /// Delivers `kind` to the whole process group of `handle`.
    pub fn signal(&self, handle: &ProcessHandle, kind: SignalKind) -> Result<(), ExecutorError> {
        if handle.has_exited() {
            return Err(ExecutorError::ProcessNotFound {
                message: format!("process {} has already exited", handle.pid()),
            });
        }

        let result = match kind {
            SignalKind::Pause => signal_group(handle.pgid(), GroupSignal::Stop),
            SignalKind::Resume => signal_group(handle.pgid(), GroupSignal::Continue),
            SignalKind::TerminateGraceful => {
                let result = signal_group(handle.pgid(), GroupSignal::Terminate);
                if result.is_ok() {
                    // Stopped members only act on SIGTERM once continued.
                    let _ = signal_group(handle.pgid(), GroupSignal::Continue);
                    handle.arm_kill_deadline(Instant::now() + self.termination_grace);
                }
                result
            }
            SignalKind::TerminateForced => signal_group(handle.pgid(), GroupSignal::Kill),
        };

        match result {
            Ok(()) => {
                tracing::debug!(
                    pid = handle.pid(),
                    pgid = handle.pgid(),
                    signal = kind.as_str(),
                    "signal delivered"
                );
                Ok(())
            }
            Err(err) if is_no_such_process(&err) => Err(ExecutorError::ProcessNotFound {
                message: format!("process group {} no longer exists", handle.pgid()),
            }),
            Err(err) => {
                tracing::warn!(
                    pid = handle.pid(),
                    pgid = handle.pgid(),
                    signal = kind.as_str(),
                    error = %err,
                    "signal delivery failed"
                );
                Err(ExecutorError::Internal {
                    message: format!("failed to {} process: {err}", kind.as_str()),
                })
            }
        }
    }

    /// Waits for the process to exit and returns its exit code, or the
    /// negated signal number when it was killed. Escalates to SIGKILL when a
    /// graceful termination outlives the grace period. Does not return while
    /// other members of the process group survive the leader: they get the
    /// rest of an armed grace period, otherwise they are killed at once.
    /// Must be called once per process.
    pub async fn wait(
        &self,
        handle: &ProcessHandle,
        child: &mut Child,
    ) -> Result<i32, ExecutorError> {
        let mut deadline_rx = handle.kill_deadline.subscribe();
        let mut killed = false;
        let mut leader_exit: Option<i32> = None;
        let mut group_poll = tokio::time::interval(GROUP_POLL_INTERVAL);

        loop {
            let deadline = *deadline_rx.borrow_and_update();
            let armed = deadline.is_some() && !killed;
            let sleep_until = deadline.unwrap_or_else(|| Instant::now() + FAR_FUTURE);

            tokio::select! {
                status = child.wait(), if leader_exit.is_none() => {
                    let status = status.map_err(|err| ExecutorError::Internal {
                        message: format!("failed to wait for process {}: {err}", handle.pid()),
                    })?;
                    let code = exit_code(status);
                    handle.mark_exited(code);
                    tracing::info!(
                        pid = handle.pid(),
                        exit_code = code,
                        runtime_ms = handle.started_at().elapsed().as_millis() as u64,
                        "process exited"
                    );
                    if !armed {
                        kill_stragglers(handle);
                        return Ok(code);
                    }
                    leader_exit = Some(code);
                }
                changed = deadline_rx.changed(), if !killed && leader_exit.is_none() => {
                    if changed.is_err() {
                        killed = true;
                    }
                }
                _ = group_poll.tick(), if leader_exit.is_some() => {
                    if let Some(code) = leader_exit.filter(|_| !group_exists(handle.pgid())) {
                        return Ok(code);
                    }
                }
                _ = tokio::time::sleep_until(sleep_until), if armed => {
                    tracing::warn!(
                        pid = handle.pid(),
                        pgid = handle.pgid(),
                        grace_ms = self.termination_grace.as_millis() as u64,
                        leader_exited = leader_exit.is_some(),
                        "grace period elapsed; killing process group"
                    );
                    if let Err(err) = signal_group(handle.pgid(), GroupSignal::Kill) {
                        if !is_no_such_process(&err) {
                            tracing::error!(pgid = handle.pgid(), error = %err, "failed to kill process group");
                        }
                    }
                    killed = true;
                    if let Some(code) = leader_exit {
                        return Ok(code);
                    }
                }
            }
        }
    }
}

/// Kills whatever is left in the group once its leader has exited.
fn kill_stragglers(handle: &ProcessHandle) {
    match signal_group(handle.pgid(), GroupSignal::Kill) {
        Ok(()) => tracing::debug!(
            pid = handle.pid(),
            pgid = handle.pgid(),
            "killed processes left behind in the group"
        ),
        Err(err) if is_no_such_process(&err) => {}
        Err(err) => {
            tracing::error!(pgid = handle.pgid(), error = %err, "failed to kill process group");
        }
    }
}

fn group_exists(pgid: i32) -> bool {
    match signal_group(pgid, GroupSignal::Probe) {
        Ok(()) => true,
        Err(err) => !is_no_such_process(&err),
    }
}

const GROUP_POLL_INTERVAL: Duration = Duration::from_millis(50);
const FAR_FUTURE: Duration = Duration::from_secs(60 * 60 * 24 * 365);

#[derive(Debug, Clone, Copy)]
enum GroupSignal {
    Stop,
    Continue,
    Terminate,
    Kill,
    /// Signal 0: existence check only.
    Probe,
}

#[cfg(unix)]
fn signal_group(pgid: i32, signal: GroupSignal) -> io::Result<()> {
    let signal = match signal {
        GroupSignal::Stop => libc::SIGSTOP,
        GroupSignal::Continue => libc::SIGCONT,
        GroupSignal::Terminate => libc::SIGTERM,
        GroupSignal::Kill => libc::SIGKILL,
        GroupSignal::Probe => 0,
    };
    let rc = unsafe { libc::killpg(pgid, signal) };
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

#[cfg(not(unix))]
fn signal_group(_pgid: i32, _signal: GroupSignal) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "process group signals require a unix platform",
    ))
}

#[cfg(unix)]
fn is_no_such_process(err: &io::Error) -> bool {
    err.raw_os_error() == Some(libc::ESRCH)
}

#[cfg(not(unix))]
fn is_no_such_process(_err: &io::Error) -> bool {
    false
}

#[cfg(unix)]
fn process_group_of(pid: u32) -> i32 {
    let pgid = unsafe { libc::getpgid(pid as libc::pid_t) };
    if pgid > 0 {
        pgid
    } else {
        pid as i32
    }
}

#[cfg(not(unix))]
fn process_group_of(pid: u32) -> i32 {
    pid as i32
}

fn exit_code(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return -signal;
        }
    }
    -1
}
