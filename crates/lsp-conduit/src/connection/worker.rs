//! The connection worker: sole owner of the framer, the pending table and
//! the handler registry.

use std::sync::Arc;
use std::sync::mpsc::{Receiver, RecvTimeoutError, Sender};
use std::time::Instant;

use tracing::{debug, trace, warn};

use super::pending::{PendingEntry, PendingTable};
use super::request::{CancelRegistration, CancellationToken};
use super::{CONNECTION_TARGET, Command, OutgoingRequest};
use crate::config::ConnectionOptions;
use crate::diagnostics::{ConnectionStats, ProtocolEvent};
use crate::dispatch::{HandlerRegistry, IncomingNotification, IncomingRequest, RequestResponder};
use crate::error::RpcError;
use crate::framing::MessageTransport;
use crate::jsonrpc::{IncomingMessage, JsonRpcNotification, JsonRpcResponse, MessageId};

pub(super) struct Worker {
    framer: MessageTransport,
    pending: PendingTable,
    handlers: HandlerRegistry,
    commands: Sender<Command>,
    stats: Arc<ConnectionStats>,
    options: ConnectionOptions,
    closed: Option<RpcError>,
}

impl Worker {
    pub(super) fn new(
        framer: MessageTransport,
        commands: Sender<Command>,
        stats: Arc<ConnectionStats>,
        options: ConnectionOptions,
    ) -> Self {
        Self {
            framer,
            pending: PendingTable::default(),
            handlers: HandlerRegistry::default(),
            commands,
            stats,
            options,
            closed: None,
        }
    }

    /// Processes commands until shutdown, waking early for the nearest
    /// request deadline.
    pub(super) fn run(mut self, inbox: &Receiver<Command>) {
        debug!(target: CONNECTION_TARGET, "connection worker started");
        loop {
            let next = match self.pending.next_deadline() {
                Some(deadline) => {
                    match inbox.recv_timeout(deadline.saturating_duration_since(Instant::now())) {
                        Ok(command) => Some(command),
                        Err(RecvTimeoutError::Timeout) => None,
                        Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                None => match inbox.recv() {
                    Ok(command) => Some(command),
                    Err(_) => break,
                },
            };
            if let Some(command) = next
                && !self.handle(command)
            {
                break;
            }
            self.expire(Instant::now());
        }
        self.fail_all(&RpcError::ConnectionClosed);
        debug!(target: CONNECTION_TARGET, "connection worker stopped");
    }

    /// Returns false once the worker should stop.
    fn handle(&mut self, command: Command) -> bool {
        match command {
            Command::Request(request) => self.start_request(request),
            Command::Notification { message, ack } => {
                let outcome = self.write_notification(&message);
                if let Some(ack) = ack
                    && ack.send(outcome).is_err()
                {
                    trace!(target: CONNECTION_TARGET, "notification sender went away");
                }
            }
            Command::Reply(response) => self.write_reply(&response),
            Command::Received(chunk) => self.receive(&chunk),
            Command::Cancel(id) => self.cancel(&id),
            Command::FailPending(error) => self.fail_all(&error),
            Command::Close(error) => {
                self.fail_all(&error);
                self.closed = Some(error);
            }
            Command::Register(registration) => self.handlers.register(registration),
            Command::ResetFramer => self.framer.reset(),
            Command::Shutdown => return false,
        }
        true
    }

    fn start_request(&mut self, request: OutgoingRequest) {
        let OutgoingRequest {
            message,
            timeout,
            cancellation,
            responder,
        } = request;

        if let Some(error) = &self.closed {
            responder(Err(error.clone()));
            return;
        }
        if cancellation
            .as_ref()
            .is_some_and(CancellationToken::is_cancelled)
        {
            debug!(
                target: CONNECTION_TARGET,
                id = %message.id,
                method = %message.method,
                "request cancelled before it was written"
            );
            responder(Err(RpcError::Cancelled));
            return;
        }
        let payload = match serde_json::to_vec(&message) {
            Ok(payload) => payload,
            Err(error) => {
                responder(Err(RpcError::from(error)));
                return;
            }
        };

        let id = message.id;
        let registration = cancellation.and_then(|token| self.watch_cancellation(&token, &id));
        self.pending.insert(
            id.clone(),
            PendingEntry::new(
                message.method.clone(),
                responder,
                timeout.or(self.options.default_timeout),
            )
            .with_cancellation(registration),
        );
        debug!(
            target: CONNECTION_TARGET,
            id = %id,
            method = %message.method,
            "sending request"
        );

        if let Err(error) = self.framer.write(&payload) {
            warn!(
                target: CONNECTION_TARGET,
                id = %id,
                method = %message.method,
                %error,
                "failed to write request"
            );
            let entry = self.pending.remove(&id);
            self.sync_pending();
            if let Some(entry) = entry {
                entry.fail(RpcError::Transport(error));
            }
            return;
        }
        self.stats.record_request_sent();
        self.sync_pending();
    }

    /// Queues a cancel for `id` when `token` fires. A token that fires
    /// before the entry is written is seen once the write completes.
    fn watch_cancellation(
        &self,
        token: &CancellationToken,
        id: &MessageId,
    ) -> Option<CancelRegistration> {
        let commands = self.commands.clone();
        let cancelled = id.clone();
        token.on_cancel(move || {
            if commands.send(Command::Cancel(cancelled)).is_err() {
                trace!(target: CONNECTION_TARGET, "connection closed before cancellation");
            }
        })
    }

    fn write_notification(&self, message: &JsonRpcNotification) -> Result<(), RpcError> {
        if let Some(error) = &self.closed {
            return Err(error.clone());
        }
        let payload = serde_json::to_vec(message)?;
        debug!(
            target: CONNECTION_TARGET,
            method = %message.method,
            "sending notification"
        );
        self.framer.write(&payload).inspect_err(|error| {
            warn!(
                target: CONNECTION_TARGET,
                method = %message.method,
                %error,
                "failed to write notification"
            );
        })?;
        self.stats.record_notification_sent();
        Ok(())
    }

    fn write_reply(&self, response: &JsonRpcResponse) {
        let payload = match serde_json::to_vec(response) {
            Ok(payload) => payload,
            Err(error) => {
                warn!(
                    target: CONNECTION_TARGET,
                    id = %response.id,
                    %error,
                    "failed to encode reply"
                );
                return;
            }
        };
        if let Err(error) = self.framer.write(&payload) {
            warn!(target: CONNECTION_TARGET, id = %response.id, %error, "failed to write reply");
        }
    }

    fn receive(&mut self, chunk: &[u8]) {
        let batch = self.framer.receive(chunk);
        if let Some(error) = batch.error {
            self.emit(&ProtocolEvent::MalformedHeader { error });
        }
        for payload in batch.messages {
            self.route(payload);
        }
    }

    fn route(&mut self, payload: Vec<u8>) {
        match IncomingMessage::classify(&payload) {
            IncomingMessage::Response(response) => self.resolve(&response.id, payload),
            IncomingMessage::Notification(notification) => {
                self.stats.record_incoming_notification();
                let incoming = IncomingNotification {
                    method: notification.method,
                    params: notification.params,
                    raw: payload,
                };
                if !self.handlers.dispatch_notification(&incoming) {
                    debug!(
                        target: CONNECTION_TARGET,
                        method = %incoming.method,
                        "no handler for notification"
                    );
                    self.emit(&ProtocolEvent::UnhandledNotification {
                        method: incoming.method,
                    });
                }
            }
            IncomingMessage::Request(request) => {
                self.stats.record_incoming_request();
                let responder = RequestResponder::new(
                    request.id.clone(),
                    request.method.clone(),
                    self.commands.clone(),
                );
                let incoming = IncomingRequest {
                    id: request.id,
                    method: request.method,
                    params: request.params,
                    raw: payload,
                };
                self.handlers.dispatch_request(incoming, responder);
            }
            IncomingMessage::Unrecognized(reason) => {
                warn!(
                    target: CONNECTION_TARGET,
                    len = payload.len(),
                    %reason,
                    "dropping unrecognized payload"
                );
                self.emit(&ProtocolEvent::UndecodablePayload {
                    len: payload.len(),
                    reason: reason.to_string(),
                });
                self.handlers.undecodable(&payload);
            }
        }
    }

    fn resolve(&mut self, id: &MessageId, payload: Vec<u8>) {
        match self.pending.remove(id) {
            Some(entry) => {
                trace!(
                    target: CONNECTION_TARGET,
                    id = %id,
                    method = entry.method(),
                    "response matched"
                );
                self.stats.record_response_matched();
                self.sync_pending();
                entry.complete(payload);
            }
            None => {
                warn!(
                    target: CONNECTION_TARGET,
                    id = %id,
                    "no matching responder, dropping message"
                );
                self.emit(&ProtocolEvent::UnmatchedResponse { id: id.clone() });
            }
        }
    }

    fn cancel(&mut self, id: &MessageId) {
        let Some(entry) = self.pending.remove(id) else {
            return;
        };
        debug!(
            target: CONNECTION_TARGET,
            id = %id,
            method = entry.method(),
            "request cancelled"
        );
        self.sync_pending();
        self.emit(&ProtocolEvent::RequestCancelled {
            id: id.clone(),
            method: entry.method().to_owned(),
        });
        entry.fail(RpcError::Cancelled);
    }

    fn expire(&mut self, now: Instant) {
        let expired = self.pending.expire(now);
        if expired.is_empty() {
            return;
        }
        self.sync_pending();
        for (id, entry) in expired {
            warn!(
                target: CONNECTION_TARGET,
                id = %id,
                method = entry.method(),
                "request timed out"
            );
            self.emit(&ProtocolEvent::RequestTimedOut {
                id,
                method: entry.method().to_owned(),
            });
            let error = entry
                .timeout()
                .map_or(RpcError::Cancelled, |timeout| RpcError::Timeout { timeout });
            entry.fail(error);
        }
    }

    fn fail_all(&mut self, error: &RpcError) {
        let drained = self.pending.drain();
        if drained.is_empty() {
            return;
        }
        debug!(
            target: CONNECTION_TARGET,
            count = drained.len(),
            %error,
            "failing pending requests"
        );
        self.sync_pending();
        for (_, entry) in drained {
            entry.fail(error.clone());
        }
    }

    fn emit(&self, event: &ProtocolEvent) {
        self.stats.record_event(event);
        self.handlers.emit(event);
    }

    fn sync_pending(&self) {
        self.stats.set_pending(self.pending.len());
    }
}
