//! Owner of one language server process and the connection speaking to it.

use std::process::ExitStatus;
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, warn};

use crate::config::ServerConfig;
use crate::connection::Connection;
use crate::error::{ProcessError, RpcError};
use crate::process::{PROCESS_TARGET, ProcessStatus, ProcessTransport};
use crate::transport::ByteTransport;

enum HostState {
    Idle,
    Running { connection: Connection },
    Stopped,
}

/// Spawns a language server on demand and ties its lifetime to a
/// [`Connection`].
///
/// When the process terminates for any reason, every outstanding request
/// fails with [`RpcError::ServerUnavailable`] and later requests fail the
/// same way. A host starts at most one process; dropping it stops the
/// process.
///
/// # Example
///
/// ```no_run
/// use lsp_conduit::{LanguageServerProcess, ServerConfig};
///
/// let host = LanguageServerProcess::new(ServerConfig::new("rust-analyzer"));
/// let connection = host.get_or_start()?;
/// let pending = connection.request::<lsp_types::request::Shutdown>(())?;
/// pending.wait()?;
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// ```
pub struct LanguageServerProcess {
    config: ServerConfig,
    transport: Arc<ProcessTransport>,
    state: Mutex<HostState>,
}

impl LanguageServerProcess {
    /// Creates a host for `config` without starting the process.
    #[must_use]
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            transport: Arc::new(ProcessTransport::new()),
            state: Mutex::new(HostState::Idle),
        }
    }

    /// The configuration the process is started with.
    #[must_use]
    pub const fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Starts the process and returns its connection.
    ///
    /// # Errors
    ///
    /// Returns [`ProcessError::AlreadyStarted`] if the process was already
    /// started, [`ProcessError::Terminated`] after [`Self::stop`], or the
    /// spawn failure.
    pub fn start(&self) -> Result<Connection, ProcessError> {
        let mut state = self.lock_state();
        match &*state {
            HostState::Idle => {}
            HostState::Running { .. } => return Err(ProcessError::AlreadyStarted),
            HostState::Stopped => return Err(ProcessError::Terminated),
        }
        let connection = self.spawn()?;
        *state = HostState::Running {
            connection: connection.clone(),
        };
        Ok(connection)
    }

    /// Returns the running connection, starting the process on first use.
    ///
    /// # Errors
    ///
    /// Returns [`ProcessError::Terminated`] once the process has exited or
    /// been stopped, or the spawn failure on first use.
    pub fn get_or_start(&self) -> Result<Connection, ProcessError> {
        let mut state = self.lock_state();
        match &*state {
            HostState::Running { connection } => {
                if self.transport.status().is_terminated() {
                    return Err(ProcessError::Terminated);
                }
                return Ok(connection.clone());
            }
            HostState::Stopped => return Err(ProcessError::Terminated),
            HostState::Idle => {}
        }
        let connection = self.spawn()?;
        *state = HostState::Running {
            connection: connection.clone(),
        };
        Ok(connection)
    }

    /// Stops the process and shuts the connection down. Idempotent.
    pub fn stop(&self) {
        let previous = std::mem::replace(&mut *self.lock_state(), HostState::Stopped);
        self.transport.stop();
        if let HostState::Running { connection } = previous {
            connection.shutdown();
        }
    }

    /// The running connection, if the process has been started.
    #[must_use]
    pub fn connection(&self) -> Option<Connection> {
        match &*self.lock_state() {
            HostState::Running { connection } => Some(connection.clone()),
            HostState::Idle | HostState::Stopped => None,
        }
    }

    /// The process lifecycle state.
    #[must_use]
    pub fn status(&self) -> ProcessStatus {
        self.transport.status()
    }

    /// The process identifier while running.
    #[must_use]
    pub fn pid(&self) -> Option<u32> {
        self.transport.pid()
    }

    /// Registers a hook run once when the process terminates.
    pub fn on_termination<F>(&self, hook: F)
    where
        F: FnOnce(Option<ExitStatus>) + Send + 'static,
    {
        self.transport.on_termination(hook);
    }

    /// Installs the sink for the server's standard error lines.
    pub fn on_stderr<F>(&self, sink: F)
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.transport.on_stderr(sink);
    }

    fn spawn(&self) -> Result<Connection, ProcessError> {
        let connection = Connection::with_options(
            Arc::clone(&self.transport) as Arc<dyn ByteTransport>,
            self.config.connection_options(),
        );
        if let Err(error) = self.transport.start(&self.config) {
            warn!(
                target: PROCESS_TARGET,
                command = %self.config.command.display(),
                %error,
                "failed to start language server"
            );
            connection.shutdown();
            return Err(error);
        }

        // Runs immediately if the process already exited.
        let closer = connection.closer();
        self.transport.on_termination(move |status| {
            debug!(
                target: PROCESS_TARGET,
                ?status,
                "language server terminated, closing connection"
            );
            closer.close(RpcError::ServerUnavailable);
        });
        Ok(connection)
    }

    fn lock_state(&self) -> MutexGuard<'_, HostState> {
        self.state
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
    }
}

impl Drop for LanguageServerProcess {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for LanguageServerProcess {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("LanguageServerProcess")
            .field("command", &self.config.command)
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

#[cfg(all(test, unix))]
mod tests {
    use std::sync::mpsc;
    use std::time::Duration;

    use rstest::rstest;
    use serde_json::{Value, json};

    use super::*;
    use crate::connection::PendingRequest;

    const WAIT: Duration = Duration::from_secs(5);

    fn host(command: &str, args: &[&str]) -> LanguageServerProcess {
        LanguageServerProcess::new(
            ServerConfig::new(command)
                .with_args(args.iter().copied())
                .with_shutdown_grace(Duration::from_millis(50)),
        )
    }

    #[rstest]
    fn get_or_start_spawns_once() {
        let server = host("cat", &[]);

        server.get_or_start().expect("start failed");
        let pid = server.pid();
        server.get_or_start().expect("second call failed");

        assert!(pid.is_some());
        assert_eq!(server.pid(), pid);
        assert!(matches!(server.start(), Err(ProcessError::AlreadyStarted)));
    }

    #[rstest]
    fn request_echoed_by_cat_is_answered_method_not_found() {
        // cat echoes the request back as a peer request; the unhandled
        // request reply is echoed again and resolves the original call.
        let server = host("cat", &[]);
        let connection = server.get_or_start().expect("start failed");

        let pending: PendingRequest<Value> = connection
            .send_request("custom/echo", json!({"n": 1}))
            .expect("send failed");

        assert!(matches!(
            pending.wait(),
            Err(RpcError::Server { code: -32601, .. })
        ));
    }

    #[rstest]
    fn notification_echoed_by_cat_reaches_handler() {
        let server = host("cat", &[]);
        let connection = server.get_or_start().expect("start failed");
        let (sender, received) = mpsc::channel();
        connection.on_notification("custom/ping", move |notification| {
            drop(sender.send(notification.params.clone()));
        });

        connection
            .send_notification("custom/ping", json!([1, 2]))
            .expect("notify failed");

        assert_eq!(
            received.recv_timeout(WAIT).expect("handler not called"),
            Some(json!([1, 2]))
        );
    }

    #[rstest]
    fn process_exit_fails_pending_requests() {
        let server = host("/bin/sh", &["-c", "head -c 1 >/dev/null"]);
        let connection = server.get_or_start().expect("start failed");

        let pending: PendingRequest<Value> = connection
            .send_request("initialize", json!({}))
            .expect("send failed");

        assert!(matches!(pending.wait(), Err(RpcError::ServerUnavailable)));
        assert!(matches!(
            server.get_or_start(),
            Err(ProcessError::Terminated)
        ));
        let later: PendingRequest<Value> = connection
            .send_request("late", ())
            .expect("send failed");
        assert!(matches!(later.wait(), Err(RpcError::ServerUnavailable)));
    }

    #[rstest]
    fn stop_fails_outstanding_requests() {
        let server = host("sleep", &["30"]);
        let connection = server.get_or_start().expect("start failed");
        let (sender, terminated) = mpsc::channel();
        server.on_termination(move |_| drop(sender.send(())));
        let pending: PendingRequest<Value> = connection
            .send_request("slow", ())
            .expect("send failed");

        server.stop();

        terminated.recv_timeout(WAIT).expect("hook not fired");
        assert!(matches!(pending.wait(), Err(RpcError::ServerUnavailable)));
        assert!(server.connection().is_none());
        assert!(matches!(server.start(), Err(ProcessError::Terminated)));
    }

    #[rstest]
    fn failed_start_leaves_host_idle() {
        let server = host("/nonexistent/lsp-conduit-server", &[]);

        let result = server.get_or_start();
        let retry = server.get_or_start();

        assert!(matches!(result, Err(ProcessError::BinaryNotFound { .. })));
        assert!(matches!(retry, Err(ProcessError::BinaryNotFound { .. })));
        assert!(server.connection().is_none());
        assert_eq!(server.status(), ProcessStatus::NotStarted);
        assert_eq!(server.transport.termination_hook_count(), 0);
    }

    #[rstest]
    fn started_host_registers_one_termination_hook() {
        let server = host("cat", &[]);

        server.get_or_start().expect("start failed");
        server.get_or_start().expect("second call failed");

        assert_eq!(server.transport.termination_hook_count(), 1);
    }

    #[rstest]
    fn immediate_exit_still_closes_the_connection() {
        let server = host("/bin/sh", &["-c", "exit 0"]);
        let connection = server.get_or_start().expect("start failed");
        let (sender, terminated) = mpsc::channel();
        server.on_termination(move |_| drop(sender.send(())));
        terminated.recv_timeout(WAIT).expect("hook not fired");

        let pending: PendingRequest<Value> = connection
            .send_request("initialize", json!({}))
            .expect("send failed");

        assert!(matches!(pending.wait(), Err(RpcError::ServerUnavailable)));
    }

    #[rstest]
    fn stderr_is_forwarded() {
        let server = host("/bin/sh", &["-c", "echo booting >&2; cat"]);
        let (sender, lines) = mpsc::channel();
        server.on_stderr(move |line| drop(sender.send(line.to_owned())));

        server.get_or_start().expect("start failed");

        assert_eq!(lines.recv_timeout(WAIT).expect("no stderr"), "booting");
    }
}
