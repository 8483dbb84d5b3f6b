//! The request/response correlation engine.
//!
//! A [`Connection`] owns one worker thread that is the only place the
//! framer, the pending table and the handler registry are touched. Callers
//! on any thread talk to it through a command queue:
//!
//! - sending a request allocates the next identifier and enqueues the
//!   request under one lock, so wire order matches identifier order;
//! - inbound bytes are queued by the transport's read callback and decoded
//!   in arrival order;
//! - responses are matched by identifier and each pending entry is removed
//!   before its completion runs, so every request completes exactly once.
//!
//! Response callbacks and peer message handlers run on the worker thread.
//! They must not block waiting for another response on the same
//! connection.

mod pending;
mod request;
mod worker;

use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, trace, warn};

pub use self::request::{CancellationToken, PendingRequest, RequestOptions};

use self::pending::Responder;
use self::request::decode_outcome;
use self::worker::Worker;
use crate::config::ConnectionOptions;
use crate::diagnostics::{ConnectionStats, ProtocolEvent, StatsSnapshot};
use crate::dispatch::{IncomingNotification, IncomingRequest, Registration, RequestResponder};
use crate::error::RpcError;
use crate::framing::MessageTransport;
use crate::jsonrpc::{JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, MessageId};
use crate::transport::ByteTransport;

pub(crate) const CONNECTION_TARGET: &str = "lsp_conduit::connection";

const FIRST_REQUEST_ID: i64 = 1;

/// A request queued for the worker.
pub(crate) struct OutgoingRequest {
    message: JsonRpcRequest,
    timeout: Option<Duration>,
    cancellation: Option<CancellationToken>,
    responder: Responder,
}

/// Work for the connection worker.
pub(crate) enum Command {
    Request(OutgoingRequest),
    Notification {
        message: JsonRpcNotification,
        ack: Option<Sender<Result<(), RpcError>>>,
    },
    Reply(JsonRpcResponse),
    Received(Vec<u8>),
    Cancel(MessageId),
    FailPending(RpcError),
    Close(RpcError),
    Register(Registration),
    ResetFramer,
    Shutdown,
}

struct Outbox {
    next_id: i64,
    commands: Sender<Command>,
}

struct Shared {
    outbox: Mutex<Outbox>,
    stats: Arc<ConnectionStats>,
    worker_id: ThreadId,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Shared {
    fn outbox(&self) -> MutexGuard<'_, Outbox> {
        self.outbox
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        if self.outbox().commands.send(Command::Shutdown).is_err() {
            trace!(target: CONNECTION_TARGET, "connection worker already stopped");
        }
    }
}

/// Closes a connection without keeping it alive.
///
/// Held by process termination hooks, which must not own the connection
/// they close.
#[derive(Clone)]
pub(crate) struct ConnectionCloser {
    commands: Sender<Command>,
}

impl ConnectionCloser {
    pub(crate) fn close(&self, error: RpcError) {
        if self.commands.send(Command::Close(error)).is_err() {
            trace!(target: CONNECTION_TARGET, "connection already shut down");
        }
    }
}

/// A JSON-RPC endpoint over a [`ByteTransport`].
///
/// Cheap to clone; all clones share one worker. The worker stops when the
/// last clone is dropped or [`Connection::shutdown`] is called, failing any
/// outstanding request with [`RpcError::ConnectionClosed`].
#[derive(Clone)]
pub struct Connection {
    shared: Arc<Shared>,
}

impl Connection {
    /// Creates a connection with default options and installs its read
    /// handler on `transport`.
    #[must_use]
    pub fn new(transport: Arc<dyn ByteTransport>) -> Self {
        Self::with_options(transport, ConnectionOptions::default())
    }

    /// Creates a connection with explicit options.
    #[must_use]
    pub fn with_options(transport: Arc<dyn ByteTransport>, options: ConnectionOptions) -> Self {
        let (commands, inbox) = mpsc::channel();
        let stats = Arc::new(ConnectionStats::default());

        let reader = commands.clone();
        transport.set_read_handler(Box::new(move |chunk| {
            if reader.send(Command::Received(chunk.to_vec())).is_err() {
                trace!(
                    target: CONNECTION_TARGET,
                    len = chunk.len(),
                    "connection shut down, discarding inbound bytes"
                );
            }
        }));

        let worker = Worker::new(
            MessageTransport::new(transport),
            commands.clone(),
            Arc::clone(&stats),
            options,
        );
        let handle = thread::spawn(move || worker.run(&inbox));
        let worker_id = handle.thread().id();

        Self {
            shared: Arc::new(Shared {
                outbox: Mutex::new(Outbox {
                    next_id: FIRST_REQUEST_ID,
                    commands,
                }),
                stats,
                worker_id,
                worker: Mutex::new(Some(handle)),
            }),
        }
    }

    /// Sends a request and returns a handle to its typed outcome.
    ///
    /// # Errors
    ///
    /// Returns [`RpcError::Encoding`] when `params` cannot be serialized and
    /// [`RpcError::ConnectionClosed`] after shutdown. Nothing is written in
    /// either case.
    pub fn send_request<P, R>(&self, method: &str, params: P) -> Result<PendingRequest<R>, RpcError>
    where
        P: Serialize,
        R: DeserializeOwned + Send + 'static,
    {
        self.send_request_with_options(method, params, RequestOptions::default())
    }

    /// Sends a request with a per-request timeout or cancellation token.
    ///
    /// # Errors
    ///
    /// See [`Connection::send_request`].
    pub fn send_request_with_options<P, R>(
        &self,
        method: &str,
        params: P,
        options: RequestOptions,
    ) -> Result<PendingRequest<R>, RpcError>
    where
        P: Serialize,
        R: DeserializeOwned + Send + 'static,
    {
        let encoded = encode_params(params)?;
        let (sender, outcome) = mpsc::channel();
        let id = self.enqueue_request(method, encoded, options, channel_responder(sender))?;
        Ok(PendingRequest::new(id, outcome, self.commands()))
    }

    /// Sends a request and invokes `callback` with its typed outcome on the
    /// connection worker.
    ///
    /// # Errors
    ///
    /// See [`Connection::send_request`]. The callback is not invoked when
    /// an error is returned.
    pub fn send_request_with<P, R, F>(
        &self,
        method: &str,
        params: P,
        options: RequestOptions,
        callback: F,
    ) -> Result<MessageId, RpcError>
    where
        P: Serialize,
        R: DeserializeOwned + 'static,
        F: FnOnce(Result<R, RpcError>) + Send + 'static,
    {
        let encoded = encode_params(params)?;
        self.enqueue_request(method, encoded, options, callback_responder(callback))
    }

    /// Sends a request whose callback receives the matched response payload
    /// undecoded.
    ///
    /// # Errors
    ///
    /// Returns [`RpcError::ConnectionClosed`] after shutdown.
    pub fn send_raw_request<F>(
        &self,
        method: &str,
        params: Option<Value>,
        options: RequestOptions,
        callback: F,
    ) -> Result<MessageId, RpcError>
    where
        F: FnOnce(Result<Vec<u8>, RpcError>) + Send + 'static,
    {
        self.enqueue_request(method, params, options, Box::new(callback))
    }

    /// Sends a notification and waits until it has been written.
    ///
    /// Called from a handler on the worker thread, it returns once the
    /// notification is queued instead.
    ///
    /// # Errors
    ///
    /// Returns [`RpcError::Encoding`] when `params` cannot be serialized, or
    /// the transport failure reported by the write.
    pub fn send_notification<P: Serialize>(&self, method: &str, params: P) -> Result<(), RpcError> {
        let message = JsonRpcNotification::new(method, encode_params(params)?);
        if self.on_worker_thread() {
            return self.send_command(Command::Notification { message, ack: None });
        }
        let (ack, written) = mpsc::channel();
        self.send_command(Command::Notification {
            message,
            ack: Some(ack),
        })?;
        written.recv().unwrap_or(Err(RpcError::ConnectionClosed))
    }

    /// Installs the handler for notifications with `method`.
    pub fn on_notification<F>(&self, method: &str, handler: F)
    where
        F: Fn(&IncomingNotification) + Send + 'static,
    {
        self.register(Registration::Notification {
            method: method.to_owned(),
            handler: Box::new(handler),
        });
    }

    /// Installs the handler for peer requests with `method`.
    pub fn on_request<F>(&self, method: &str, handler: F)
    where
        F: Fn(IncomingRequest, RequestResponder) + Send + 'static,
    {
        self.register(Registration::Request {
            method: method.to_owned(),
            handler: Box::new(handler),
        });
    }

    /// Installs the fallback for notifications without a method handler.
    pub fn on_any_notification<F>(&self, handler: F)
    where
        F: Fn(&IncomingNotification) + Send + 'static,
    {
        self.register(Registration::AnyNotification(Box::new(handler)));
    }

    /// Installs the fallback for peer requests without a method handler.
    /// Without one, such requests are answered with `MethodNotFound`.
    pub fn on_any_request<F>(&self, handler: F)
    where
        F: Fn(IncomingRequest, RequestResponder) + Send + 'static,
    {
        self.register(Registration::AnyRequest(Box::new(handler)));
    }

    /// Installs the handler for payloads that match no envelope shape.
    pub fn on_undecodable<F>(&self, handler: F)
    where
        F: Fn(&[u8]) + Send + 'static,
    {
        self.register(Registration::Undecodable(Box::new(handler)));
    }

    /// Adds an observer for protocol anomalies.
    pub fn on_event<F>(&self, handler: F)
    where
        F: Fn(&ProtocolEvent) + Send + 'static,
    {
        self.register(Registration::Event(Box::new(handler)));
    }

    /// Cancels the pending request with `id`, if any.
    pub fn cancel(&self, id: &MessageId) {
        self.send_or_trace(Command::Cancel(id.clone()));
    }

    /// Fails every pending request with `error`. The connection stays
    /// usable.
    pub fn fail_pending(&self, error: RpcError) {
        self.send_or_trace(Command::FailPending(error));
    }

    /// Fails every pending request with `error` and rejects all later
    /// requests and notifications with it.
    pub fn close(&self, error: RpcError) {
        self.send_or_trace(Command::Close(error));
    }

    /// Discards buffered inbound bytes, clearing a stalled header.
    pub fn reset_framer(&self) {
        self.send_or_trace(Command::ResetFramer);
    }

    /// Current traffic counters.
    #[must_use]
    pub fn stats(&self) -> StatsSnapshot {
        self.shared.stats.snapshot()
    }

    /// Stops the worker, failing outstanding requests with
    /// [`RpcError::ConnectionClosed`], and waits for it to exit.
    pub fn shutdown(&self) {
        self.send_or_trace(Command::Shutdown);
        if self.on_worker_thread() {
            return;
        }
        let handle = self
            .shared
            .worker
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
            .take();
        if let Some(handle) = handle
            && handle.join().is_err()
        {
            warn!(target: CONNECTION_TARGET, "connection worker panicked");
        }
    }

    pub(crate) fn closer(&self) -> ConnectionCloser {
        ConnectionCloser {
            commands: self.commands(),
        }
    }

    fn enqueue_request(
        &self,
        method: &str,
        params: Option<Value>,
        options: RequestOptions,
        responder: Responder,
    ) -> Result<MessageId, RpcError> {
        let mut outbox = self.shared.outbox();
        let id = MessageId::Number(outbox.next_id);
        let request = OutgoingRequest {
            message: JsonRpcRequest::new(id.clone(), method, params),
            timeout: options.timeout,
            cancellation: options.cancellation,
            responder,
        };
        outbox
            .commands
            .send(Command::Request(request))
            .map_err(|_| RpcError::ConnectionClosed)?;
        outbox.next_id += 1;
        Ok(id)
    }

    fn register(&self, registration: Registration) {
        self.send_or_trace(Command::Register(registration));
    }

    fn send_command(&self, command: Command) -> Result<(), RpcError> {
        self.shared
            .outbox()
            .commands
            .send(command)
            .map_err(|_| RpcError::ConnectionClosed)
    }

    fn send_or_trace(&self, command: Command) {
        if self.send_command(command).is_err() {
            debug!(target: CONNECTION_TARGET, "connection worker has stopped");
        }
    }

    fn commands(&self) -> Sender<Command> {
        self.shared.outbox().commands.clone()
    }

    fn on_worker_thread(&self) -> bool {
        thread::current().id() == self.shared.worker_id
    }
}

/// Serializes parameters in the caller's thread. `null` means no params.
fn encode_params<P: Serialize>(params: P) -> Result<Option<Value>, RpcError> {
    match serde_json::to_value(params)? {
        Value::Null => Ok(None),
        value => Ok(Some(value)),
    }
}

fn channel_responder<R>(sender: Sender<Result<R, RpcError>>) -> Responder
where
    R: DeserializeOwned + Send + 'static,
{
    Box::new(move |raw| {
        if sender.send(decode_outcome(raw)).is_err() {
            trace!(target: CONNECTION_TARGET, "request handle dropped before outcome");
        }
    })
}

fn callback_responder<R, F>(callback: F) -> Responder
where
    R: DeserializeOwned + 'static,
    F: FnOnce(Result<R, RpcError>) + Send + 'static,
{
    Box::new(move |raw| callback(decode_outcome(raw)))
}
