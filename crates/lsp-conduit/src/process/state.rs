//! Lifecycle state of the language server process.

use std::process::{Child, ChildStdin, ExitStatus};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// The child's standard input, locked separately from the lifecycle state
/// so a blocked write never holds the state lock. `None` once closed.
pub(super) type SharedStdin = Arc<Mutex<Option<ChildStdin>>>;

/// Internal state of the language server process.
pub(super) enum ProcessState {
    /// Process has not been started.
    NotStarted,
    /// Process is running and accepting writes.
    Running {
        /// The child process handle.
        child: Child,
        /// The write end of the child's standard input.
        stdin: SharedStdin,
        /// How long termination waits before killing.
        grace: Duration,
    },
    /// Process has exited or was stopped. `status` is filled in once the
    /// child has been reaped.
    Terminated { status: Option<ExitStatus> },
}

impl ProcessState {
    pub(super) fn status(&self) -> ProcessStatus {
        match self {
            Self::NotStarted => ProcessStatus::NotStarted,
            Self::Running { child, .. } => ProcessStatus::Running { pid: child.id() },
            Self::Terminated { status } => ProcessStatus::Terminated { exit: *status },
        }
    }
}

/// Observable state of a [`super::ProcessTransport`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessStatus {
    /// The process has not been started.
    NotStarted,
    /// The process is running.
    Running {
        /// Operating system process identifier.
        pid: u32,
    },
    /// The process has exited or was stopped.
    Terminated {
        /// Exit status, once the child has been reaped.
        exit: Option<ExitStatus>,
    },
}

impl ProcessStatus {
    /// Returns true once the process has terminated.
    #[must_use]
    pub const fn is_terminated(self) -> bool {
        matches!(self, Self::Terminated { .. })
    }
}
