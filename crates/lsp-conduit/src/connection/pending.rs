//! The pending request table.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use super::request::CancelRegistration;
use crate::error::RpcError;
use crate::jsonrpc::MessageId;

/// One-shot completion for an outstanding request. Receives the raw
/// response payload or the failure that ended the wait.
pub(crate) type Responder = Box<dyn FnOnce(Result<Vec<u8>, RpcError>) + Send>;

#[derive(Debug, Clone, Copy)]
struct Deadline {
    at: Instant,
    timeout: Duration,
}

/// An outstanding request awaiting its response.
pub(crate) struct PendingEntry {
    method: String,
    responder: Responder,
    deadline: Option<Deadline>,
    cancellation: Option<CancelRegistration>,
}

impl PendingEntry {
    /// A timeout too large to be represented as an instant means no
    /// deadline.
    pub(crate) fn new(method: String, responder: Responder, timeout: Option<Duration>) -> Self {
        Self {
            method,
            responder,
            deadline: timeout.and_then(|timeout| {
                Instant::now()
                    .checked_add(timeout)
                    .map(|at| Deadline { at, timeout })
            }),
            cancellation: None,
        }
    }

    /// Keeps the token hook attached for as long as the entry is pending.
    pub(crate) fn with_cancellation(mut self, registration: Option<CancelRegistration>) -> Self {
        self.cancellation = registration;
        self
    }

    pub(crate) fn method(&self) -> &str {
        &self.method
    }

    /// The configured timeout, if the entry has one.
    pub(crate) fn timeout(&self) -> Option<Duration> {
        self.deadline.map(|deadline| deadline.timeout)
    }

    pub(crate) fn complete(self, payload: Vec<u8>) {
        self.finish(Ok(payload));
    }

    pub(crate) fn fail(self, error: RpcError) {
        self.finish(Err(error));
    }

    fn finish(self, outcome: Result<Vec<u8>, RpcError>) {
        let Self {
            responder,
            cancellation,
            ..
        } = self;
        drop(cancellation);
        responder(outcome);
    }
}

/// Outstanding requests keyed by identifier.
///
/// Entries are removed before their responder runs, so a responder fires at
/// most once and a duplicate response finds nothing.
#[derive(Default)]
pub(crate) struct PendingTable {
    entries: HashMap<MessageId, PendingEntry>,
}

impl PendingTable {
    pub(crate) fn insert(&mut self, id: MessageId, entry: PendingEntry) {
        self.entries.insert(id, entry);
    }

    pub(crate) fn remove(&mut self, id: &MessageId) -> Option<PendingEntry> {
        self.entries.remove(id)
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    /// Removes every entry, ordered by identifier.
    pub(crate) fn drain(&mut self) -> Vec<(MessageId, PendingEntry)> {
        let mut drained: Vec<_> = self.entries.drain().collect();
        drained.sort_by(|(left, _), (right, _)| left.cmp(right));
        drained
    }

    /// The earliest deadline among the entries.
    pub(crate) fn next_deadline(&self) -> Option<Instant> {
        self.entries
            .values()
            .filter_map(|entry| entry.deadline.map(|deadline| deadline.at))
            .min()
    }

    /// Removes and returns every entry whose deadline is at or before `now`.
    pub(crate) fn expire(&mut self, now: Instant) -> Vec<(MessageId, PendingEntry)> {
        let expired: Vec<MessageId> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.deadline.is_some_and(|deadline| deadline.at <= now))
            .map(|(id, _)| id.clone())
            .collect();

        let mut removed: Vec<_> = expired
            .into_iter()
            .filter_map(|id| self.entries.remove(&id).map(|entry| (id, entry)))
            .collect();
        removed.sort_by(|(left, _), (right, _)| left.cmp(right));
        removed
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use rstest::rstest;

    use super::*;
    use crate::connection::CancellationToken;

    type Outcomes = Arc<Mutex<Vec<Result<Vec<u8>, String>>>>;

    fn recording_entry(outcomes: &Outcomes, timeout: Option<Duration>) -> PendingEntry {
        let sink = Arc::clone(outcomes);
        PendingEntry::new(
            String::from("textDocument/hover"),
            Box::new(move |outcome| {
                sink.lock()
                    .expect("lock poisoned")
                    .push(outcome.map_err(|error| error.to_string()));
            }),
            timeout,
        )
    }

    #[rstest]
    fn removed_entry_cannot_complete_twice() {
        let outcomes = Outcomes::default();
        let mut table = PendingTable::default();
        table.insert(MessageId::Number(1), recording_entry(&outcomes, None));

        table
            .remove(&MessageId::Number(1))
            .expect("entry missing")
            .complete(b"payload".to_vec());

        assert!(table.remove(&MessageId::Number(1)).is_none());
        assert_eq!(
            *outcomes.lock().expect("lock poisoned"),
            vec![Ok(b"payload".to_vec())]
        );
    }

    #[rstest]
    fn drain_orders_entries_by_identifier() {
        let outcomes = Outcomes::default();
        let mut table = PendingTable::default();
        for id in [3, 1, 2] {
            table.insert(MessageId::Number(id), recording_entry(&outcomes, None));
        }

        let ids: Vec<MessageId> = table.drain().into_iter().map(|(id, _)| id).collect();

        assert_eq!(ids, vec![MessageId::from(1), MessageId::from(2), MessageId::from(3)]);
        assert_eq!(table.len(), 0);
    }

    #[rstest]
    fn expire_removes_only_elapsed_entries() {
        let outcomes = Outcomes::default();
        let mut table = PendingTable::default();
        table.insert(
            MessageId::Number(1),
            recording_entry(&outcomes, Some(Duration::from_millis(1))),
        );
        table.insert(
            MessageId::Number(2),
            recording_entry(&outcomes, Some(Duration::from_secs(3600))),
        );
        table.insert(MessageId::Number(3), recording_entry(&outcomes, None));

        let expired = table.expire(Instant::now() + Duration::from_millis(5));

        assert_eq!(expired.len(), 1);
        let (id, entry) = expired.into_iter().next().expect("expired entry missing");
        assert_eq!(id, MessageId::Number(1));
        assert_eq!(entry.timeout(), Some(Duration::from_millis(1)));
        assert_eq!(entry.method(), "textDocument/hover");
        assert_eq!(table.len(), 2);
        assert!(table.next_deadline().is_some());
    }

    #[rstest]
    fn unrepresentable_timeout_means_no_deadline() {
        let outcomes = Outcomes::default();
        let mut table = PendingTable::default();
        table.insert(
            MessageId::Number(1),
            recording_entry(&outcomes, Some(Duration::MAX)),
        );

        assert_eq!(table.next_deadline(), None);
        assert!(table.expire(Instant::now()).is_empty());
        assert_eq!(table.len(), 1);
    }

    #[rstest]
    fn finished_entry_detaches_cancellation_hook() {
        let outcomes = Outcomes::default();
        let token = CancellationToken::new();
        let entry = recording_entry(&outcomes, None).with_cancellation(token.on_cancel(|| {}));
        assert_eq!(token.hook_count(), 1);

        entry.complete(b"done".to_vec());

        assert_eq!(token.hook_count(), 0);
    }

    #[rstest]
    fn next_deadline_is_none_without_timeouts() {
        let outcomes = Outcomes::default();
        let mut table = PendingTable::default();
        table.insert(MessageId::Number(1), recording_entry(&outcomes, None));

        assert_eq!(table.next_deadline(), None);
    }
}
