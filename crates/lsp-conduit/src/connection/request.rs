//! Per-request options and the caller-side handle for an outstanding
//! request.

use std::collections::HashMap;
use std::fmt;
use std::mem;
use std::sync::mpsc::{Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use serde::de::DeserializeOwned;
use tracing::debug;

use super::{CONNECTION_TARGET, Command};
use crate::error::RpcError;
use crate::jsonrpc::{JsonRpcResponse, MessageId};

type CancelHook = Box<dyn FnOnce() + Send>;

#[derive(Default)]
struct TokenState {
    cancelled: bool,
    next_key: u64,
    hooks: HashMap<u64, CancelHook>,
}

fn lock_state(state: &Mutex<TokenState>) -> MutexGuard<'_, TokenState> {
    state.lock().unwrap_or_else(|poison| poison.into_inner())
}

/// Detaches a cancellation hook from its token when dropped.
pub(crate) struct CancelRegistration {
    state: Weak<Mutex<TokenState>>,
    key: u64,
}

impl Drop for CancelRegistration {
    fn drop(&mut self) {
        if let Some(state) = self.state.upgrade() {
            lock_state(&state).hooks.remove(&self.key);
        }
    }
}

/// A shared flag that cancels every request it is attached to.
///
/// Cancelling is idempotent. Requests attached after cancellation fail with
/// [`RpcError::Cancelled`] without being written.
#[derive(Clone, Default)]
pub struct CancellationToken {
    state: Arc<Mutex<TokenState>>,
}

impl CancellationToken {
    /// Creates an untriggered token.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Triggers the token.
    pub fn cancel(&self) {
        let hooks = {
            let mut state = self.lock();
            if state.cancelled {
                return;
            }
            state.cancelled = true;
            mem::take(&mut state.hooks)
        };
        for hook in hooks.into_values() {
            hook();
        }
    }

    /// Returns true once [`Self::cancel`] has been called.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.lock().cancelled
    }

    /// Runs `hook` on cancellation, or immediately if already cancelled.
    ///
    /// The hook stays attached until the returned registration is dropped.
    /// Returns `None` when the hook already ran.
    pub(crate) fn on_cancel(
        &self,
        hook: impl FnOnce() + Send + 'static,
    ) -> Option<CancelRegistration> {
        let mut state = self.lock();
        if state.cancelled {
            drop(state);
            hook();
            return None;
        }
        let key = state.next_key;
        state.next_key += 1;
        state.hooks.insert(key, Box::new(hook));
        Some(CancelRegistration {
            state: Arc::downgrade(&self.state),
            key,
        })
    }

    #[cfg(test)]
    pub(crate) fn hook_count(&self) -> usize {
        self.lock().hooks.len()
    }

    fn lock(&self) -> MutexGuard<'_, TokenState> {
        lock_state(&self.state)
    }
}

impl fmt::Debug for CancellationToken {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("CancellationToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// Options for a single request.
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    /// Overrides the connection's default timeout.
    pub timeout: Option<Duration>,
    /// Cancels the request when triggered.
    pub cancellation: Option<CancellationToken>,
}

impl RequestOptions {
    /// Creates options that defer to the connection defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the request timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Attaches a cancellation token.
    #[must_use]
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }
}

/// Handle to an outstanding request.
///
/// The outcome is delivered exactly once. Blocking on it from inside a
/// handler or callback deadlocks, since those run on the connection worker
/// that would deliver the outcome.
pub struct PendingRequest<R> {
    id: MessageId,
    outcome: Receiver<Result<R, RpcError>>,
    commands: Sender<Command>,
}

impl<R> PendingRequest<R> {
    pub(crate) fn new(
        id: MessageId,
        outcome: Receiver<Result<R, RpcError>>,
        commands: Sender<Command>,
    ) -> Self {
        Self {
            id,
            outcome,
            commands,
        }
    }

    /// The identifier written on the wire.
    #[must_use]
    pub const fn id(&self) -> &MessageId {
        &self.id
    }

    /// Blocks until the outcome arrives.
    ///
    /// # Errors
    ///
    /// Returns the failure that ended the request.
    pub fn wait(self) -> Result<R, RpcError> {
        self.outcome.recv().unwrap_or(Err(RpcError::ConnectionClosed))
    }

    /// Blocks for at most `timeout`. On expiry the request is cancelled so
    /// a late response is dropped as unmatched.
    ///
    /// # Errors
    ///
    /// Returns [`RpcError::Timeout`] on expiry, otherwise the failure that
    /// ended the request.
    pub fn wait_timeout(self, timeout: Duration) -> Result<R, RpcError> {
        match self.outcome.recv_timeout(timeout) {
            Ok(outcome) => outcome,
            Err(RecvTimeoutError::Timeout) => {
                self.cancel();
                Err(RpcError::Timeout { timeout })
            }
            Err(RecvTimeoutError::Disconnected) => Err(RpcError::ConnectionClosed),
        }
    }

    /// Returns the outcome if it has already arrived.
    #[must_use]
    pub fn try_result(&self) -> Option<Result<R, RpcError>> {
        match self.outcome.try_recv() {
            Ok(outcome) => Some(outcome),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => Some(Err(RpcError::ConnectionClosed)),
        }
    }

    /// Abandons the request. The outcome becomes [`RpcError::Cancelled`]
    /// unless the response already arrived.
    pub fn cancel(&self) {
        if self.commands.send(Command::Cancel(self.id.clone())).is_err() {
            debug!(
                target: CONNECTION_TARGET,
                id = %self.id,
                "connection already closed, nothing to cancel"
            );
        }
    }
}

impl<R> fmt::Debug for PendingRequest<R> {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("PendingRequest")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

/// Decodes a matched response payload into the caller's result type.
pub(crate) fn decode_outcome<R>(outcome: Result<Vec<u8>, RpcError>) -> Result<R, RpcError>
where
    R: DeserializeOwned,
{
    let payload = outcome?;
    let response: JsonRpcResponse =
        serde_json::from_slice(&payload).map_err(|error| RpcError::Decoding {
            message: error.to_string(),
        })?;
    let value = response
        .into_result()
        .map_err(RpcError::from_response_error)?;
    serde_json::from_value(value).map_err(|error| RpcError::Decoding {
        message: error.to_string(),
    })
}
