//! Deferred session teardown.
//!
//! Carrier callbacks must never re-enter the carrier that is calling them.
//! Any failure path that wants a session gone enqueues it here; the queue is
//! drained into [`Io::Disconnect`](super::output::Io) intents on the next
//! output drain, outside every carrier call stack.
use super::output::Outbox;
use super::DisconnectReason;
use crate::session::SessionId;

/// Queue of sessions awaiting teardown.
#[derive(Debug, Default)]
pub struct KillQueue {
    pending: Vec<(SessionId, DisconnectReason)>,
}

impl KillQueue {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue a session for teardown. Re-queuing a session already pending
    /// is silently merged; the first reason wins.
    pub fn enqueue(&mut self, session: SessionId, reason: DisconnectReason) {
        if self.pending.iter().any(|(s, _)| *s == session) {
            return;
        }
        self.pending.push((session, reason));
    }

    /// Forget a session without disconnecting it. Used when the carrier
    /// announced the end itself while the kill was pending.
    pub fn forget(&mut self, session: SessionId) {
        self.pending.retain(|(s, _)| *s != session);
    }

    /// Whether a session is pending teardown.
    pub fn contains(&self, session: SessionId) -> bool {
        self.pending.iter().any(|(s, _)| *s == session)
    }

    /// Number of pending teardowns.
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Whether the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Emit a disconnect intent for every pending session.
    pub fn drain(&mut self, outbox: &mut Outbox) -> usize {
        let drained = self.pending.len();
        for (session, reason) in self.pending.drain(..) {
            outbox.disconnect(session, reason);
        }
        drained
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fsm::output::Io;

    fn session(table: &mut crate::session::SessionTable, peer: u8) -> SessionId {
        use switchyard_common::address::Address;
        use switchyard_common::identity::PeerId;
        use switchyard_common::time::LocalTime;

        let peer = PeerId::from_bytes([peer; 32]);
        table.insert(crate::session::SessionInfo {
            plugin: "tcp".to_owned(),
            peer,
            address: Address::new("tcp", vec![1], peer),
            link: crate::plugin::Link::Outbound,
            since: LocalTime::from_secs(0),
        })
    }

    #[test]
    fn test_duplicates_are_merged() {
        let mut table = crate::session::SessionTable::new();
        let mut queue = KillQueue::new();
        let mut outbox = Outbox::new();
        let s = session(&mut table, 1);

        queue.enqueue(s, DisconnectReason::Denied);
        queue.enqueue(s, DisconnectReason::Command);
        assert_eq!(queue.len(), 1);

        assert_eq!(queue.drain(&mut outbox), 1);
        assert!(queue.is_empty());
        assert!(
            matches!(outbox.next(), Some(Io::Disconnect(id, DisconnectReason::Denied)) if id == s)
        );
        assert!(outbox.next().is_none());
    }

    #[test]
    fn test_forget() {
        let mut table = crate::session::SessionTable::new();
        let mut queue = KillQueue::new();
        let mut outbox = Outbox::new();
        let s = session(&mut table, 1);

        queue.enqueue(s, DisconnectReason::Denied);
        queue.forget(s);
        assert_eq!(queue.drain(&mut outbox), 0);
        assert!(outbox.next().is_none());
    }
}
