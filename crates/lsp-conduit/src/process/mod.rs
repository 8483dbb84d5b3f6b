//! Language server subprocess exposed as a [`ByteTransport`].
//!
//! Standard output is read on a dedicated thread and handed to the read
//! handler chunk by chunk. Standard error is read line by line on a second
//! thread, logged under `lsp_conduit::stderr` and forwarded to an optional
//! sink; it never reaches the framer.

mod lifecycle;
mod state;

use std::io::{self, BufRead, BufReader, ErrorKind, Read, Write};
use std::mem;
use std::process::{ChildStderr, ChildStdout, Command, ExitStatus, Stdio};
use std::sync::{Arc, Mutex, MutexGuard, TryLockError};
use std::thread;

use tracing::{debug, trace, warn};

pub use self::state::ProcessStatus;

use self::state::{ProcessState, SharedStdin};
use crate::config::ServerConfig;
use crate::error::{ProcessError, TransportError};
use crate::transport::{ByteTransport, ReadHandler};

/// Log target for process management.
pub(crate) const PROCESS_TARGET: &str = "lsp_conduit::process";

/// Log target for lines the server writes to standard error.
const STDERR_TARGET: &str = "lsp_conduit::stderr";

const READ_BUFFER_SIZE: usize = 8 * 1024;

type SharedReadHandler = Arc<dyn Fn(&[u8]) + Send + Sync>;
type StderrSink = Arc<dyn Fn(&str) + Send + Sync>;
type TerminationHook = Box<dyn FnOnce(Option<ExitStatus>) + Send>;

#[derive(Default)]
struct TerminationHooks {
    fired: Option<Option<ExitStatus>>,
    pending: Vec<TerminationHook>,
}

struct Inner {
    state: Mutex<ProcessState>,
    read_handler: Mutex<Option<SharedReadHandler>>,
    stderr_sink: Mutex<Option<StderrSink>>,
    hooks: Mutex<TerminationHooks>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    // Recover from poisoning so shutdown still runs after a panic.
    mutex.lock().unwrap_or_else(|poison| poison.into_inner())
}

impl Inner {
    fn deliver(&self, chunk: &[u8]) {
        let handler = lock(&self.read_handler).clone();
        match handler {
            Some(handler) => handler(chunk),
            None => debug!(
                target: PROCESS_TARGET,
                len = chunk.len(),
                "dropping stdout bytes, no read handler registered"
            ),
        }
    }

    fn forward_stderr(&self, line: &str) {
        let sink = lock(&self.stderr_sink).clone();
        if let Some(sink) = sink {
            sink(line);
        }
    }

    /// Moves a running process to `Terminated`, reaps it and fires the
    /// termination hooks. Does nothing unless the process is running.
    fn terminate(&self) {
        let running = {
            let mut state = lock(&self.state);
            match mem::replace(&mut *state, ProcessState::Terminated { status: None }) {
                ProcessState::Running { child, stdin, grace } => Some((child, stdin, grace)),
                other => {
                    *state = other;
                    None
                }
            }
        };
        let Some((mut child, stdin, grace)) = running else {
            return;
        };

        let pid = child.id();
        debug!(target: PROCESS_TARGET, pid, "terminating language server");
        close_stdin(&stdin, pid);
        let status = lifecycle::terminate_child(&mut child, grace);
        if let ProcessState::Terminated { status: slot } = &mut *lock(&self.state) {
            *slot = status;
        }
        debug!(target: PROCESS_TARGET, pid, ?status, "language server terminated");
        self.fire_hooks(status);
    }

    fn fire_hooks(&self, status: Option<ExitStatus>) {
        let pending = {
            let mut hooks = lock(&self.hooks);
            if hooks.fired.is_some() {
                return;
            }
            hooks.fired = Some(status);
            mem::take(&mut hooks.pending)
        };
        for hook in pending {
            hook(status);
        }
    }
}

/// A language server child process speaking over its standard streams.
///
/// Writes go to the child's stdin; stdout chunks go to the read handler.
/// Dropping the transport stops the process.
pub struct ProcessTransport {
    inner: Arc<Inner>,
}

impl Default for ProcessTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessTransport {
    /// Creates a transport with no process.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(ProcessState::NotStarted),
                read_handler: Mutex::new(None),
                stderr_sink: Mutex::new(None),
                hooks: Mutex::new(TerminationHooks::default()),
            }),
        }
    }

    /// Spawns the process described by `config` and starts its reader
    /// threads.
    ///
    /// # Errors
    ///
    /// Returns [`ProcessError::AlreadyStarted`] if a process is running,
    /// [`ProcessError::Terminated`] if it has already exited,
    /// [`ProcessError::BinaryNotFound`] when the executable does not exist
    /// and [`ProcessError::SpawnFailed`] for other spawn failures.
    pub fn start(&self, config: &ServerConfig) -> Result<(), ProcessError> {
        let mut state = lock(&self.inner.state);
        match &*state {
            ProcessState::NotStarted => {}
            ProcessState::Running { .. } => return Err(ProcessError::AlreadyStarted),
            ProcessState::Terminated { .. } => return Err(ProcessError::Terminated),
        }

        debug!(
            target: PROCESS_TARGET,
            command = %config.command.display(),
            args = ?config.args,
            "spawning language server process"
        );

        let mut command = Command::new(&config.command);
        command
            .args(&config.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(env) = &config.env {
            command.env_clear().envs(env);
        }
        if let Some(dir) = &config.working_dir {
            command.current_dir(dir);
        }

        let mut child = command.spawn().map_err(|error| {
            if error.kind() == ErrorKind::NotFound {
                ProcessError::BinaryNotFound {
                    command: config.command.display().to_string(),
                    source: Arc::new(error),
                }
            } else {
                ProcessError::SpawnFailed {
                    message: format!("failed to start {}", config.command.display()),
                    source: Arc::new(error),
                }
            }
        })?;

        let pid = child.id();
        let (Some(stdin), Some(stdout), Some(stderr)) =
            (child.stdin.take(), child.stdout.take(), child.stderr.take())
        else {
            lifecycle::terminate_child(&mut child, config.shutdown_grace());
            return Err(ProcessError::SpawnFailed {
                message: String::from("failed to capture standard streams"),
                source: Arc::new(io::Error::other("missing stdio pipe")),
            });
        };

        if let Err(error) = self.spawn_readers(pid, stdout, stderr) {
            drop(stdin);
            lifecycle::terminate_child(&mut child, config.shutdown_grace());
            return Err(error);
        }

        *state = ProcessState::Running {
            child,
            stdin: Arc::new(Mutex::new(Some(stdin))),
            grace: config.shutdown_grace(),
        };
        debug!(target: PROCESS_TARGET, pid, "language server process spawned");
        Ok(())
    }

    fn spawn_readers(
        &self,
        pid: u32,
        stdout: ChildStdout,
        stderr: ChildStderr,
    ) -> Result<(), ProcessError> {
        let stdout_inner = Arc::clone(&self.inner);
        thread::Builder::new()
            .name(format!("lsp-stdout-{pid}"))
            .spawn(move || read_stdout(&stdout_inner, pid, stdout))
            .map_err(reader_spawn_failed)?;

        let stderr_inner = Arc::clone(&self.inner);
        thread::Builder::new()
            .name(format!("lsp-stderr-{pid}"))
            .spawn(move || read_stderr(&stderr_inner, pid, stderr))
            .map_err(reader_spawn_failed)?;
        Ok(())
    }

    /// Closes stdin, waits the configured grace period and then kills the
    /// process. Idempotent; does nothing before [`Self::start`].
    pub fn stop(&self) {
        self.inner.terminate();
    }

    /// The process identifier while running.
    #[must_use]
    pub fn pid(&self) -> Option<u32> {
        match self.status() {
            ProcessStatus::Running { pid } => Some(pid),
            ProcessStatus::NotStarted | ProcessStatus::Terminated { .. } => None,
        }
    }

    /// The current lifecycle state.
    #[must_use]
    pub fn status(&self) -> ProcessStatus {
        lock(&self.inner.state).status()
    }

    /// Registers a hook run once when the process terminates. Hooks
    /// registered after termination run immediately.
    pub fn on_termination<F>(&self, hook: F)
    where
        F: FnOnce(Option<ExitStatus>) + Send + 'static,
    {
        let mut hooks = lock(&self.inner.hooks);
        let fired = hooks.fired;
        match fired {
            Some(status) => {
                drop(hooks);
                hook(status);
            }
            None => hooks.pending.push(Box::new(hook)),
        }
    }

    #[cfg(test)]
    pub(crate) fn termination_hook_count(&self) -> usize {
        lock(&self.inner.hooks).pending.len()
    }

    /// Installs the sink for lines the server writes to standard error.
    pub fn on_stderr<F>(&self, sink: F)
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        *lock(&self.inner.stderr_sink) = Some(Arc::new(sink));
    }
}

impl ByteTransport for ProcessTransport {
    fn write(&self, bytes: &[u8]) -> Result<(), TransportError> {
        let stdin = match &*lock(&self.inner.state) {
            ProcessState::NotStarted => return Err(TransportError::NotStarted),
            ProcessState::Terminated { .. } => {
                trace!(
                    target: PROCESS_TARGET,
                    len = bytes.len(),
                    "process terminated, discarding write"
                );
                return Ok(());
            }
            ProcessState::Running { stdin, .. } => Arc::clone(stdin),
        };

        let outcome = {
            let mut guard = lock(&stdin);
            let Some(pipe) = guard.as_mut() else {
                trace!(
                    target: PROCESS_TARGET,
                    len = bytes.len(),
                    "stdin closed, discarding write"
                );
                return Ok(());
            };
            pipe.write_all(bytes).and_then(|()| pipe.flush())
        };
        outcome.or_else(|error| {
            if self.status().is_terminated() {
                trace!(
                    target: PROCESS_TARGET,
                    %error,
                    "write interrupted by termination, discarding"
                );
                return Ok(());
            }
            warn!(target: PROCESS_TARGET, %error, "write to language server failed");
            self.inner.terminate();
            Err(TransportError::from(error))
        })
    }

    fn set_read_handler(&self, handler: ReadHandler) {
        *lock(&self.inner.read_handler) = Some(Arc::from(handler));
    }
}

impl Drop for ProcessTransport {
    fn drop(&mut self) {
        self.inner.terminate();
    }
}

impl std::fmt::Debug for ProcessTransport {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("ProcessTransport")
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

/// Closes stdin unless a write is in progress. A blocked writer keeps the
/// pipe until the child is killed, after which its write fails.
fn close_stdin(stdin: &SharedStdin, pid: u32) {
    match stdin.try_lock() {
        Ok(mut pipe) => drop(pipe.take()),
        Err(TryLockError::Poisoned(poison)) => drop(poison.into_inner().take()),
        Err(TryLockError::WouldBlock) => debug!(
            target: PROCESS_TARGET,
            pid,
            "write in progress, stdin closes when the process exits"
        ),
    }
}

fn reader_spawn_failed(error: io::Error) -> ProcessError {
    ProcessError::SpawnFailed {
        message: String::from("failed to start reader thread"),
        source: Arc::new(error),
    }
}

fn read_stdout(inner: &Inner, pid: u32, mut stdout: ChildStdout) {
    let mut buffer = vec![0_u8; READ_BUFFER_SIZE];
    loop {
        match stdout.read(&mut buffer) {
            Ok(0) => {
                debug!(target: PROCESS_TARGET, pid, "language server closed stdout");
                break;
            }
            Ok(read) => inner.deliver(buffer.get(..read).unwrap_or_default()),
            Err(error) if error.kind() == ErrorKind::Interrupted => {}
            Err(error) => {
                warn!(target: PROCESS_TARGET, pid, %error, "failed to read language server stdout");
                break;
            }
        }
    }
    inner.terminate();
}

fn read_stderr(inner: &Inner, pid: u32, stderr: ChildStderr) {
    let mut reader = BufReader::new(stderr);
    let mut line = Vec::new();
    loop {
        line.clear();
        match reader.read_until(b'\n', &mut line) {
            Ok(0) => break,
            Ok(_) => {
                let text = String::from_utf8_lossy(&line);
                let trimmed = text.trim_end_matches(['\r', '\n']);
                debug!(target: STDERR_TARGET, pid, line = trimmed, "language server stderr");
                inner.forward_stderr(trimmed);
            }
            Err(error) if error.kind() == ErrorKind::Interrupted => {}
            Err(error) => {
                debug!(
                    target: PROCESS_TARGET,
                    pid,
                    %error,
                    "stopped reading language server stderr"
                );
                break;
            }
        }
    }
}
