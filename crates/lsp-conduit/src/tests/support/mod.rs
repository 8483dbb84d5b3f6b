//! Shared world and helpers for behavioural tests.

use std::sync::Arc;
use std::sync::mpsc::{self, Receiver};
use std::time::Duration;

use serde_json::Value;

use crate::framing::encode_frame;
use crate::{
    ByteTransport, Connection, LanguageServerProcess, MemoryTransport, PendingRequest,
    ProtocolEvent, RpcError,
};

/// Upper bound for anything a scenario waits on.
pub const WAIT: Duration = Duration::from_secs(5);

/// State threaded through the steps of one scenario.
#[derive(Default)]
pub struct World {
    /// Scripted peer side of the connection, when one is used.
    pub transport: Option<Arc<MemoryTransport>>,
    /// The connection under test.
    pub connection: Option<Connection>,
    /// Host owning a real server process, when one is used.
    pub host: Option<LanguageServerProcess>,
    /// Requests sent by the scenario, in send order.
    pub pending: Vec<PendingRequest<Value>>,
    /// Protocol events observed on the connection.
    pub events: Option<Receiver<ProtocolEvent>>,
    /// Notification parameters delivered to a handler.
    pub delivered: Option<Receiver<Value>>,
}

impl World {
    /// Wires a connection to a fresh memory transport and records its
    /// protocol events.
    pub fn connect_memory(&mut self) {
        let transport = Arc::new(MemoryTransport::new());
        let connection = Connection::new(Arc::clone(&transport) as Arc<dyn ByteTransport>);
        let (sender, events) = mpsc::channel();
        connection.on_event(move |event| {
            drop(sender.send(event.clone()));
        });
        self.transport = Some(transport);
        self.connection = Some(connection);
        self.events = Some(events);
    }

    /// The connection under test.
    pub fn connection(&self) -> &Connection {
        self.connection.as_ref().expect("no connection in world")
    }

    /// Frames `payload` and delivers it as if the peer had written it.
    pub fn peer_sends(&self, payload: &str) {
        self.transport
            .as_ref()
            .expect("no memory transport in world")
            .feed(encode_frame(payload.as_bytes()));
    }

    /// Blocks until the connection has written `count` frames.
    pub fn await_writes(&self, count: usize) {
        let written = self
            .transport
            .as_ref()
            .expect("no memory transport in world")
            .wait_for_writes(count, WAIT);
        assert!(written.len() >= count, "expected {count} writes, saw {}", written.len());
    }

    /// Sends a request with `params` and keeps its handle.
    pub fn send(&mut self, method: &str, params: Value) {
        let pending = self
            .connection()
            .send_request(method, params)
            .expect("request could not be sent");
        self.pending.push(pending);
    }

    /// Waits for every sent request, in send order.
    pub fn outcomes(&mut self) -> Vec<Result<Value, RpcError>> {
        self.pending.drain(..).map(PendingRequest::wait).collect()
    }
}

impl Drop for World {
    fn drop(&mut self) {
        if let Some(connection) = self.connection.take() {
            connection.shutdown();
        }
    }
}
