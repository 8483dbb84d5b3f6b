//! Raw duplex byte channels.
//!
//! A [`ByteTransport`] knows nothing about framing: it writes arbitrary
//! bytes out and hands arbitrary chunks to a single registered read handler
//! as they arrive. [`crate::ProcessTransport`] backs it with a child
//! process's stdio; [`MemoryTransport`] is an in-process loopback.

mod memory;

pub use memory::MemoryTransport;

use crate::error::TransportError;

/// Callback receiving inbound byte chunks. Invoked from whichever thread the
/// transport reads on.
pub type ReadHandler = Box<dyn Fn(&[u8]) + Send + Sync>;

/// A duplex byte channel with a single inbound callback.
#[cfg_attr(test, mockall::automock)]
pub trait ByteTransport: Send + Sync {
    /// Writes `bytes` to the peer.
    ///
    /// # Errors
    ///
    /// Returns a [`TransportError`] when the bytes could not be handed to
    /// the underlying channel.
    fn write(&self, bytes: &[u8]) -> Result<(), TransportError>;

    /// Registers the handler for inbound bytes, replacing any previous one.
    fn set_read_handler(&self, handler: ReadHandler);
}
