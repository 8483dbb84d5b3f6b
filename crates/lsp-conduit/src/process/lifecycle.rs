//! Child process termination.

use std::process::{Child, ExitStatus};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use super::PROCESS_TARGET;

const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Polls the child for up to `grace`, then kills it. A grace period too
/// large to be represented as an instant waits for the child to exit.
fn wait_then_kill(child: &mut Child, grace: Duration) -> Option<ExitStatus> {
    let pid = child.id();
    let deadline = Instant::now().checked_add(grace);
    loop {
        if let Ok(Some(status)) = child.try_wait() {
            debug!(
                target: PROCESS_TARGET,
                pid,
                ?status,
                "language server exited during grace period"
            );
            return Some(status);
        }
        let remaining = deadline.map_or(POLL_INTERVAL, |deadline| {
            deadline.saturating_duration_since(Instant::now())
        });
        if remaining.is_zero() {
            break;
        }
        thread::sleep(remaining.min(POLL_INTERVAL));
    }

    warn!(
        target: PROCESS_TARGET,
        pid,
        grace_ms = grace.as_millis(),
        "language server did not exit gracefully, killing"
    );
    if let Err(error) = child.kill() {
        warn!(target: PROCESS_TARGET, pid, %error, "failed to kill language server");
    }
    match child.wait() {
        Ok(status) => Some(status),
        Err(error) => {
            warn!(target: PROCESS_TARGET, pid, %error, "failed to reap language server");
            None
        }
    }
}

/// Reaps a child whose stdin has been closed, killing it if it does not
/// exit within `grace`.
///
/// Returns the exit status when the child could be reaped.
pub(super) fn terminate_child(child: &mut Child, grace: Duration) -> Option<ExitStatus> {
    match child.try_wait() {
        Ok(Some(status)) => {
            debug!(
                target: PROCESS_TARGET,
                pid = child.id(),
                ?status,
                "language server exited"
            );
            Some(status)
        }
        Ok(None) => wait_then_kill(child, grace),
        Err(error) => {
            warn!(
                target: PROCESS_TARGET,
                pid = child.id(),
                %error,
                "failed to check process status, waiting before killing"
            );
            wait_then_kill(child, grace)
        }
    }
}
