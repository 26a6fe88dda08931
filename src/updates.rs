//! Post-commit change-event propagation
//!
//! Mutating operations buffer typed events while their transaction is open
//! and publish them only after commit, so a slow subscriber can never stall
//! a transaction's visible duration. The queue is bounded and the send
//! blocks when it is full; the core knows nothing about subscribers or
//! their retry policy.

use std::sync::mpsc::{sync_channel, Receiver, SyncSender};

/// A change event, published strictly after its transaction committed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Update {
    /// Mailbox-level status change (message appeared, counters moved).
    Mailbox { user: String, mailbox: String },
    /// A message's flag set changed. Carries the full resulting set, not a
    /// delta.
    Message {
        user: String,
        mailbox: String,
        uid: u32,
        seqnum: u32,
        flags: Vec<String>,
    },
    /// A message was expunged. `seqnum` is its rank immediately before
    /// removal; events for one operation are emitted in descending seqnum
    /// order so earlier events do not shift later ones.
    Expunge {
        user: String,
        mailbox: String,
        uid: u32,
        seqnum: u32,
    },
}

/// Sending half of the bounded update queue, held by the store.
#[derive(Clone)]
pub struct UpdateSink(SyncSender<Update>);

/// Create a bounded update queue. The receiver is consumed by whatever
/// pushes notifications to connected clients.
pub fn update_channel(capacity: usize) -> (UpdateSink, Receiver<Update>) {
    let (tx, rx) = sync_channel(capacity);
    (UpdateSink(tx), rx)
}

impl UpdateSink {
    /// Blocking publish. A dropped receiver is not an error for the store;
    /// the remaining events are discarded.
    pub(crate) fn publish(&self, updates: Vec<Update>) {
        for update in updates {
            if self.0.send(update).is_err() {
                log::debug!("update receiver dropped, discarding remaining events");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_publish_preserves_order() {
        let (sink, rx) = update_channel(8);
        sink.publish(vec![
            Update::Mailbox {
                user: "u".into(),
                mailbox: "INBOX".into(),
            },
            Update::Expunge {
                user: "u".into(),
                mailbox: "INBOX".into(),
                uid: 3,
                seqnum: 2,
            },
        ]);
        assert!(matches!(rx.recv().unwrap(), Update::Mailbox { .. }));
        assert!(matches!(rx.recv().unwrap(), Update::Expunge { uid: 3, .. }));
    }

    #[test]
    fn test_dropped_receiver_is_not_fatal() {
        let (sink, rx) = update_channel(1);
        drop(rx);
        sink.publish(vec![Update::Mailbox {
            user: "u".into(),
            mailbox: "INBOX".into(),
        }]);
    }
}
