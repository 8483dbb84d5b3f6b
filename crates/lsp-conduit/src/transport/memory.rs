//! In-process loopback transport.

use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tracing::debug;

use super::{ByteTransport, ReadHandler};
use crate::error::TransportError;

const MEMORY_TARGET: &str = "lsp_conduit::transport::memory";

type SharedHandler = Arc<dyn Fn(&[u8]) + Send + Sync>;

#[derive(Default)]
struct MemoryState {
    writes: Vec<Vec<u8>>,
    reject_writes: bool,
}

/// A [`ByteTransport`] that records outbound writes and lets the embedder
/// inject inbound bytes from any thread.
///
/// Useful for driving a [`crate::Connection`] against a scripted peer.
#[derive(Default)]
pub struct MemoryTransport {
    state: Mutex<MemoryState>,
    written: Condvar,
    handler: Mutex<Option<SharedHandler>>,
}

impl MemoryTransport {
    /// Creates an empty transport.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Delivers `bytes` to the registered read handler as one chunk.
    ///
    /// Bytes fed before a handler is registered are dropped.
    pub fn feed(&self, bytes: impl AsRef<[u8]>) {
        let handler = self
            .handler
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
            .clone();
        match handler {
            Some(handler) => handler(bytes.as_ref()),
            None => debug!(
                target: MEMORY_TARGET,
                len = bytes.as_ref().len(),
                "dropping inbound bytes, no read handler registered"
            ),
        }
    }

    /// Returns every chunk written so far, in order.
    #[must_use]
    pub fn written(&self) -> Vec<Vec<u8>> {
        self.lock_state().writes.clone()
    }

    /// Returns every byte written so far as one buffer.
    #[must_use]
    pub fn written_bytes(&self) -> Vec<u8> {
        self.lock_state().writes.concat()
    }

    /// Blocks until at least `count` chunks were written or `timeout`
    /// elapsed, then returns what was written.
    #[must_use]
    pub fn wait_for_writes(&self, count: usize, timeout: Duration) -> Vec<Vec<u8>> {
        let deadline = Instant::now() + timeout;
        let mut state = self.lock_state();
        while state.writes.len() < count {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            state = self
                .written
                .wait_timeout(state, remaining)
                .unwrap_or_else(|poison| poison.into_inner())
                .0;
        }
        state.writes.clone()
    }

    /// Makes subsequent writes fail with [`TransportError::Closed`].
    pub fn set_reject_writes(&self, reject: bool) {
        self.lock_state().reject_writes = reject;
    }

    /// Returns true once a read handler has been registered.
    #[must_use]
    pub fn has_read_handler(&self) -> bool {
        self.handler
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
            .is_some()
    }

    fn lock_state(&self) -> MutexGuard<'_, MemoryState> {
        self.state
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
    }
}

impl ByteTransport for MemoryTransport {
    fn write(&self, bytes: &[u8]) -> Result<(), TransportError> {
        let mut state = self.lock_state();
        if state.reject_writes {
            return Err(TransportError::Closed);
        }
        state.writes.push(bytes.to_vec());
        drop(state);
        self.written.notify_all();
        Ok(())
    }

    fn set_read_handler(&self, handler: ReadHandler) {
        *self
            .handler
            .lock()
            .unwrap_or_else(|poison| poison.into_inner()) = Some(Arc::from(handler));
    }
}
