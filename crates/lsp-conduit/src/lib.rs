//! JSON-RPC 2.0 client plumbing for talking to Language Server Protocol
//! servers over byte streams.
//!
//! The crate is layered bottom-up:
//!
//! - [`framing`] splits a byte stream into `Content-Length` framed payloads.
//! - [`jsonrpc`] models the message envelopes and classifies payloads.
//! - [`Connection`] correlates requests with responses, dispatches incoming
//!   notifications and requests to registered handlers, and enforces
//!   cancellation and timeouts.
//! - [`ProcessTransport`] and [`LanguageServerProcess`] run a language
//!   server as a child process and fail outstanding work when it exits.
//!
//! Any [`ByteTransport`] can carry a connection; [`MemoryTransport`] is an
//! in-process implementation for tests and embedding.
//!
//! ```
//! use std::sync::Arc;
//!
//! use lsp_conduit::{ByteTransport, Connection, MemoryTransport};
//!
//! let transport = Arc::new(MemoryTransport::new());
//! let connection = Connection::new(Arc::clone(&transport) as Arc<dyn ByteTransport>);
//! connection.send_notification("initialized", serde_json::json!({}))?;
//! assert!(transport.written_bytes().starts_with(b"Content-Length: "));
//! # connection.shutdown();
//! # Ok::<(), lsp_conduit::RpcError>(())
//! ```

mod config;
mod connection;
mod diagnostics;
mod dispatch;
mod error;
pub mod framing;
mod host;
pub mod jsonrpc;
mod process;
mod transport;
mod typed;

pub use config::{ConnectionOptions, ServerConfig};
pub use connection::{CancellationToken, Connection, PendingRequest, RequestOptions};
pub use diagnostics::{ConnectionStats, ProtocolEvent, StatsSnapshot};
pub use dispatch::{
    EventHandler, IncomingNotification, IncomingRequest, NotificationHandler, RequestHandler,
    RequestResponder, UndecodableHandler,
};
pub use error::{ProcessError, RpcError, TransportError};
pub use host::LanguageServerProcess;
pub use jsonrpc::{ErrorCode, MessageId, ResponseError};
pub use process::{ProcessStatus, ProcessTransport};
pub use transport::{ByteTransport, MemoryTransport, ReadHandler};

#[cfg(test)]
mod tests;
