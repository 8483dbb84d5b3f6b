//! Routing of peer-initiated messages to registered handlers.
//!
//! Handlers run on the connection worker, one at a time, in arrival order.
//! A request handler receives a [`RequestResponder`] and may reply from any
//! thread; dropping the responder without replying sends an internal error
//! so the peer is never left waiting.

use std::collections::HashMap;
use std::fmt;
use std::sync::mpsc::Sender;

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, warn};

use crate::connection::{CONNECTION_TARGET, Command};
use crate::diagnostics::ProtocolEvent;
use crate::jsonrpc::{ErrorCode, JsonRpcResponse, MessageId, ResponseError};

/// Handles a notification for one method, or every unhandled method.
pub type NotificationHandler = Box<dyn Fn(&IncomingNotification) + Send>;
/// Handles a peer request. Must eventually reply through the responder.
pub type RequestHandler = Box<dyn Fn(IncomingRequest, RequestResponder) + Send>;
/// Receives payloads that matched no envelope shape.
pub type UndecodableHandler = Box<dyn Fn(&[u8]) + Send>;
/// Observes protocol anomalies.
pub type EventHandler = Box<dyn Fn(&ProtocolEvent) + Send>;

/// A notification received from the peer.
#[derive(Debug, Clone, PartialEq)]
pub struct IncomingNotification {
    /// The notification method.
    pub method: String,
    /// Parameters, if present.
    pub params: Option<Value>,
    /// The complete payload as received.
    pub raw: Vec<u8>,
}

impl IncomingNotification {
    /// Decodes the parameters. Absent parameters decode as `null`.
    ///
    /// # Errors
    ///
    /// Returns the deserialization error when the parameters do not match
    /// `T`.
    pub fn params_as<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.params.clone().unwrap_or(Value::Null))
    }
}

/// A request received from the peer.
#[derive(Debug, Clone, PartialEq)]
pub struct IncomingRequest {
    /// The peer's identifier, echoed on the reply.
    pub id: MessageId,
    /// The request method.
    pub method: String,
    /// Parameters, if present.
    pub params: Option<Value>,
    /// The complete payload as received.
    pub raw: Vec<u8>,
}

impl IncomingRequest {
    /// Decodes the parameters. Absent parameters decode as `null`.
    ///
    /// # Errors
    ///
    /// Returns the deserialization error when the parameters do not match
    /// `T`.
    pub fn params_as<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.params.clone().unwrap_or(Value::Null))
    }
}

/// Sends exactly one reply to a peer request.
pub struct RequestResponder {
    id: MessageId,
    method: String,
    commands: Option<Sender<Command>>,
}

impl RequestResponder {
    pub(crate) const fn new(id: MessageId, method: String, commands: Sender<Command>) -> Self {
        Self {
            id,
            method,
            commands: Some(commands),
        }
    }

    /// The identifier of the request being answered.
    #[must_use]
    pub const fn id(&self) -> &MessageId {
        &self.id
    }

    /// The method of the request being answered.
    #[must_use]
    pub fn method(&self) -> &str {
        &self.method
    }

    /// Replies with a result value or an error object.
    pub fn respond(mut self, outcome: Result<Value, ResponseError>) {
        self.send(outcome);
    }

    /// Replies with a serializable result. A result that fails to serialize
    /// is reported to the peer as an internal error.
    pub fn respond_ok<T: Serialize>(self, result: &T) {
        let outcome = serde_json::to_value(result).map_err(|error| {
            ResponseError::new(
                ErrorCode::InternalError,
                format!("failed to encode result: {error}"),
            )
        });
        self.respond(outcome);
    }

    /// Replies with an error object.
    pub fn respond_err(self, error: ResponseError) {
        self.respond(Err(error));
    }

    fn send(&mut self, outcome: Result<Value, ResponseError>) {
        let Some(commands) = self.commands.take() else {
            return;
        };
        let response = match outcome {
            Ok(result) => JsonRpcResponse::success(self.id.clone(), result),
            Err(error) => JsonRpcResponse::failure(self.id.clone(), error),
        };
        if commands.send(Command::Reply(response)).is_err() {
            debug!(
                target: CONNECTION_TARGET,
                id = %self.id,
                method = %self.method,
                "connection closed before reply was sent"
            );
        }
    }
}

impl Drop for RequestResponder {
    fn drop(&mut self) {
        if self.commands.is_some() {
            warn!(
                target: CONNECTION_TARGET,
                id = %self.id,
                method = %self.method,
                "request dropped without a reply"
            );
            self.send(Err(ResponseError::new(
                ErrorCode::InternalError,
                format!("request was not answered: {}", self.method),
            )));
        }
    }
}

impl fmt::Debug for RequestResponder {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("RequestResponder")
            .field("id", &self.id)
            .field("method", &self.method)
            .field("replied", &self.commands.is_none())
            .finish()
    }
}

/// A handler installed through the connection's command queue.
pub(crate) enum Registration {
    Notification {
        method: String,
        handler: NotificationHandler,
    },
    Request {
        method: String,
        handler: RequestHandler,
    },
    AnyNotification(NotificationHandler),
    AnyRequest(RequestHandler),
    Undecodable(UndecodableHandler),
    Event(EventHandler),
}

/// Handlers owned by the connection worker.
///
/// Method handlers take precedence over the catch-all handlers. Registering
/// a second handler for the same method replaces the first.
#[derive(Default)]
pub(crate) struct HandlerRegistry {
    notifications: HashMap<String, NotificationHandler>,
    requests: HashMap<String, RequestHandler>,
    any_notification: Option<NotificationHandler>,
    any_request: Option<RequestHandler>,
    undecodable: Option<UndecodableHandler>,
    events: Vec<EventHandler>,
}

impl HandlerRegistry {
    pub(crate) fn register(&mut self, registration: Registration) {
        match registration {
            Registration::Notification { method, handler } => {
                self.notifications.insert(method, handler);
            }
            Registration::Request { method, handler } => {
                self.requests.insert(method, handler);
            }
            Registration::AnyNotification(handler) => self.any_notification = Some(handler),
            Registration::AnyRequest(handler) => self.any_request = Some(handler),
            Registration::Undecodable(handler) => self.undecodable = Some(handler),
            Registration::Event(handler) => self.events.push(handler),
        }
    }

    /// Runs the matching notification handler. Returns false when nothing
    /// handled it.
    pub(crate) fn dispatch_notification(&self, notification: &IncomingNotification) -> bool {
        let handler = self
            .notifications
            .get(&notification.method)
            .or(self.any_notification.as_ref());
        match handler {
            Some(handler) => {
                handler(notification);
                true
            }
            None => false,
        }
    }

    /// Runs the matching request handler, or replies `MethodNotFound`.
    pub(crate) fn dispatch_request(&self, request: IncomingRequest, responder: RequestResponder) {
        let handler = self
            .requests
            .get(&request.method)
            .or(self.any_request.as_ref());
        match handler {
            Some(handler) => handler(request, responder),
            None => {
                debug!(
                    target: CONNECTION_TARGET,
                    method = %request.method,
                    "no handler for request, replying method not found"
                );
                responder.respond_err(ResponseError::method_not_found(&request.method));
            }
        }
    }

    pub(crate) fn undecodable(&self, payload: &[u8]) {
        if let Some(handler) = &self.undecodable {
            handler(payload);
        }
    }

    pub(crate) fn emit(&self, event: &ProtocolEvent) {
        for handler in &self.events {
            handler(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc::{self, Receiver};
    use std::sync::{Arc, Mutex};

    use rstest::{fixture, rstest};
    use serde_json::json;

    use super::*;

    fn notification(method: &str) -> IncomingNotification {
        IncomingNotification {
            method: method.to_owned(),
            params: Some(json!({"uri": "file:///a.rs"})),
            raw: Vec::new(),
        }
    }

    fn request(id: i64, method: &str) -> IncomingRequest {
        IncomingRequest {
            id: MessageId::Number(id),
            method: method.to_owned(),
            params: None,
            raw: Vec::new(),
        }
    }

    fn next_reply(commands: &Receiver<Command>) -> JsonRpcResponse {
        match commands.try_recv() {
            Ok(Command::Reply(response)) => response,
            _ => panic!("expected a queued reply"),
        }
    }

    #[fixture]
    fn channel() -> (Sender<Command>, Receiver<Command>) {
        mpsc::channel()
    }

    #[rstest]
    fn method_handler_wins_over_catch_all() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut registry = HandlerRegistry::default();
        let specific = Arc::clone(&seen);
        registry.register(Registration::Notification {
            method: String::from("textDocument/publishDiagnostics"),
            handler: Box::new(move |_| specific.lock().expect("lock poisoned").push("specific")),
        });
        let fallback = Arc::clone(&seen);
        registry.register(Registration::AnyNotification(Box::new(move |_| {
            fallback.lock().expect("lock poisoned").push("fallback");
        })));

        assert!(registry.dispatch_notification(&notification("textDocument/publishDiagnostics")));
        assert!(registry.dispatch_notification(&notification("$/progress")));

        assert_eq!(*seen.lock().expect("lock poisoned"), vec!["specific", "fallback"]);
    }

    #[rstest]
    fn unhandled_notification_reports_false() {
        let registry = HandlerRegistry::default();

        assert!(!registry.dispatch_notification(&notification("window/logMessage")));
    }

    #[rstest]
    fn unhandled_request_replies_method_not_found(
        channel: (Sender<Command>, Receiver<Command>),
    ) {
        let (sender, receiver) = channel;
        let registry = HandlerRegistry::default();
        let responder = RequestResponder::new(
            MessageId::Number(7),
            String::from("workspace/configuration"),
            sender,
        );

        registry.dispatch_request(request(7, "workspace/configuration"), responder);

        let reply = next_reply(&receiver);
        assert_eq!(reply.id, MessageId::Number(7));
        let error = reply.error.expect("expected error reply");
        assert_eq!(error.kind(), ErrorCode::MethodNotFound);
        assert_eq!(error.message, "method not handled: workspace/configuration");
    }

    #[rstest]
    fn responder_sends_exactly_one_reply(channel: (Sender<Command>, Receiver<Command>)) {
        let (sender, receiver) = channel;
        let responder =
            RequestResponder::new(MessageId::from("abc"), String::from("custom"), sender);

        responder.respond_ok(&json!({"applied": true}));

        let reply = next_reply(&receiver);
        assert_eq!(reply.id, MessageId::from("abc"));
        assert_eq!(reply.result, Some(json!({"applied": true})));
        assert!(receiver.try_recv().is_err());
    }

    #[rstest]
    fn dropped_responder_replies_internal_error(channel: (Sender<Command>, Receiver<Command>)) {
        let (sender, receiver) = channel;
        let responder = RequestResponder::new(MessageId::Number(3), String::from("custom"), sender);

        drop(responder);

        let reply = next_reply(&receiver);
        let error = reply.error.expect("expected error reply");
        assert_eq!(error.kind(), ErrorCode::InternalError);
    }

    #[rstest]
    fn event_handlers_all_observe() {
        let seen = Arc::new(Mutex::new(0_usize));
        let mut registry = HandlerRegistry::default();
        for _ in 0..2 {
            let counter = Arc::clone(&seen);
            registry.register(Registration::Event(Box::new(move |_| {
                *counter.lock().expect("lock poisoned") += 1;
            })));
        }

        registry.emit(&ProtocolEvent::UnmatchedResponse {
            id: MessageId::Number(1),
        });

        assert_eq!(*seen.lock().expect("lock poisoned"), 2);
    }

    #[rstest]
    fn params_decode_absent_as_null() {
        let incoming = request(1, "shutdown");

        let params: Option<Value> = incoming.params_as().expect("decode failed");

        assert_eq!(params, None);
    }
}
