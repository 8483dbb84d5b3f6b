//! Observable protocol anomalies and traffic counters.
//!
//! Unmatched responses, undecodable payloads and stalled headers are never
//! fatal. They are logged and surfaced here so a desynchronised peer can be
//! detected in tests and by embedders.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use crate::framing::FrameError;
use crate::jsonrpc::MessageId;

/// A non-fatal event observed by the correlation engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolEvent {
    /// A response arrived for an identifier with no pending request.
    UnmatchedResponse {
        /// The identifier carried by the response.
        id: MessageId,
    },
    /// A payload matched none of the envelope shapes.
    UndecodablePayload {
        /// Payload length in bytes.
        len: usize,
        /// Why classification failed.
        reason: String,
    },
    /// The frame decoder stalled on a malformed header block.
    MalformedHeader {
        /// The header problem.
        error: FrameError,
    },
    /// A notification arrived with no handler for its method.
    UnhandledNotification {
        /// The notification method.
        method: String,
    },
    /// A pending request expired.
    RequestTimedOut {
        /// The expired request identifier.
        id: MessageId,
        /// The request method.
        method: String,
    },
    /// A pending request was cancelled locally.
    RequestCancelled {
        /// The cancelled request identifier.
        id: MessageId,
        /// The request method.
        method: String,
    },
}

/// Counters maintained by the correlation engine.
#[derive(Debug, Default)]
pub struct ConnectionStats {
    requests_sent: AtomicU64,
    notifications_sent: AtomicU64,
    responses_matched: AtomicU64,
    unmatched_responses: AtomicU64,
    incoming_notifications: AtomicU64,
    incoming_requests: AtomicU64,
    undecodable_payloads: AtomicU64,
    malformed_headers: AtomicU64,
    pending: AtomicUsize,
}

/// A point-in-time copy of [`ConnectionStats`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// Requests written to the transport.
    pub requests_sent: u64,
    /// Notifications written to the transport.
    pub notifications_sent: u64,
    /// Responses that resolved a pending request.
    pub responses_matched: u64,
    /// Responses dropped for lack of a pending request.
    pub unmatched_responses: u64,
    /// Notifications received from the peer.
    pub incoming_notifications: u64,
    /// Requests received from the peer.
    pub incoming_requests: u64,
    /// Payloads that could not be classified.
    pub undecodable_payloads: u64,
    /// Header blocks on which the decoder stalled.
    pub malformed_headers: u64,
    /// Requests currently awaiting a response.
    pub pending: usize,
}

impl ConnectionStats {
    /// Copies the current counter values.
    #[must_use]
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            requests_sent: self.requests_sent.load(Ordering::Relaxed),
            notifications_sent: self.notifications_sent.load(Ordering::Relaxed),
            responses_matched: self.responses_matched.load(Ordering::Relaxed),
            unmatched_responses: self.unmatched_responses.load(Ordering::Relaxed),
            incoming_notifications: self.incoming_notifications.load(Ordering::Relaxed),
            incoming_requests: self.incoming_requests.load(Ordering::Relaxed),
            undecodable_payloads: self.undecodable_payloads.load(Ordering::Relaxed),
            malformed_headers: self.malformed_headers.load(Ordering::Relaxed),
            pending: self.pending.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn record_request_sent(&self) {
        self.requests_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_notification_sent(&self) {
        self.notifications_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_response_matched(&self) {
        self.responses_matched.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_incoming_notification(&self) {
        self.incoming_notifications.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_incoming_request(&self) {
        self.incoming_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_event(&self, event: &ProtocolEvent) {
        let counter = match event {
            ProtocolEvent::UnmatchedResponse { .. } => &self.unmatched_responses,
            ProtocolEvent::UndecodablePayload { .. } => &self.undecodable_payloads,
            ProtocolEvent::MalformedHeader { .. } => &self.malformed_headers,
            ProtocolEvent::UnhandledNotification { .. }
            | ProtocolEvent::RequestTimedOut { .. }
            | ProtocolEvent::RequestCancelled { .. } => return,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn set_pending(&self, pending: usize) {
        self.pending.store(pending, Ordering::Relaxed);
    }
}
