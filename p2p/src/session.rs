//! Carrier session handles.
//!
//! A session is one live carrier-level conversation, owned by the carrier
//! driver that minted it. The core only ever holds a [`SessionId`]: a
//! generation-tagged index into a [`SessionTable`] slot. Looking up a stale
//! id after the carrier tore the session down is a defined no-op.
use std::fmt;

use switchyard_common::address::Address;
use switchyard_common::identity::PeerId;
use switchyard_common::time::LocalTime;

use crate::plugin::Link;

/// Generation-tagged session handle. Cheap to copy; never dangles.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SessionId {
    index: u32,
    generation: u32,
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "s{}.{}", self.index, self.generation)
    }
}

/// What the core knows about a live session.
#[derive(Debug, Clone)]
pub struct SessionInfo {
    /// Name of the carrier driver owning the session.
    pub plugin: String,
    /// The remote peer.
    pub peer: PeerId,
    /// The address the session is bound to.
    pub address: Address,
    /// Whether the remote initiated the session.
    pub link: Link,
    /// When the session was registered.
    pub since: LocalTime,
}

#[derive(Debug)]
enum Slot {
    Vacant { generation: u32 },
    Occupied { generation: u32, info: SessionInfo },
}

/// Registry of live sessions. Slots are recycled with a bumped generation,
/// so ids handed out for a previous occupant never resolve again.
#[derive(Debug, Default)]
pub struct SessionTable {
    slots: Vec<Slot>,
    free: Vec<u32>,
    len: usize,
}

impl SessionTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a session, returning its handle.
    pub fn insert(&mut self, info: SessionInfo) -> SessionId {
        self.len += 1;

        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            let generation = match slot {
                Slot::Vacant { generation } => *generation,
                Slot::Occupied { .. } => unreachable!("free list only holds vacant slots"),
            };
            *slot = Slot::Occupied { generation, info };

            SessionId { index, generation }
        } else {
            let index = self.slots.len() as u32;
            self.slots.push(Slot::Occupied {
                generation: 0,
                info,
            });

            SessionId {
                index,
                generation: 0,
            }
        }
    }

    /// Resolve a handle. Stale handles return `None`.
    pub fn get(&self, id: SessionId) -> Option<&SessionInfo> {
        match self.slots.get(id.index as usize) {
            Some(Slot::Occupied { generation, info }) if *generation == id.generation => {
                Some(info)
            }
            _ => None,
        }
    }

    /// Resolve a handle mutably.
    pub fn get_mut(&mut self, id: SessionId) -> Option<&mut SessionInfo> {
        match self.slots.get_mut(id.index as usize) {
            Some(Slot::Occupied { generation, info }) if *generation == id.generation => {
                Some(info)
            }
            _ => None,
        }
    }

    /// Remove a session. Removing a stale handle is a no-op.
    pub fn remove(&mut self, id: SessionId) -> Option<SessionInfo> {
        match self.slots.get_mut(id.index as usize) {
            Some(Slot::Occupied { generation, .. }) if *generation == id.generation => {
                let next = generation.wrapping_add(1);
                let slot = std::mem::replace(
                    &mut self.slots[id.index as usize],
                    Slot::Vacant { generation: next },
                );
                self.free.push(id.index);
                self.len -= 1;

                match slot {
                    Slot::Occupied { info, .. } => Some(info),
                    Slot::Vacant { .. } => unreachable!("matched occupied above"),
                }
            }
            _ => None,
        }
    }

    /// Number of live sessions.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the table is empty.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Iterate over live sessions.
    pub fn iter(&self) -> impl Iterator<Item = (SessionId, &SessionInfo)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| match slot {
                Slot::Occupied { generation, info } => Some((
                    SessionId {
                        index: index as u32,
                        generation: *generation,
                    },
                    info,
                )),
                Slot::Vacant { .. } => None,
            })
    }

    /// Sessions bound to the given peer.
    pub fn by_peer<'a>(
        &'a self,
        peer: &'a PeerId,
    ) -> impl Iterator<Item = (SessionId, &'a SessionInfo)> {
        self.iter().filter(move |(_, info)| info.peer == *peer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use switchyard_common::identity::PeerId;

    fn info(peer: u8) -> SessionInfo {
        let peer = PeerId::from_bytes([peer; 32]);
        SessionInfo {
            plugin: "tcp".to_owned(),
            peer,
            address: Address::new("tcp", vec![127, 0, 0, 1], peer),
            link: Link::Outbound,
            since: LocalTime::from_secs(1),
        }
    }

    #[test]
    fn test_stale_handle_is_noop() {
        let mut table = SessionTable::new();
        let id = table.insert(info(1));

        assert!(table.get(id).is_some());
        assert!(table.remove(id).is_some());

        // The handle is now stale.
        assert!(table.get(id).is_none());
        assert!(table.remove(id).is_none());

        // The slot is recycled under a new generation.
        let next = table.insert(info(2));
        assert!(table.get(id).is_none());
        assert!(table.get(next).is_some());
        assert_ne!(id, next);
    }

    #[test]
    fn test_by_peer() {
        let mut table = SessionTable::new();
        let a = table.insert(info(1));
        let _ = table.insert(info(2));
        let c = table.insert(info(1));

        let peer = PeerId::from_bytes([1; 32]);
        let ids: Vec<_> = table.by_peer(&peer).map(|(id, _)| id).collect();
        assert_eq!(ids, vec![a, c]);
        assert_eq!(table.len(), 3);
    }
}
