//! State machine output capabilities.
//!
//! Everything the protocol wants done in the world is pushed into an
//! [`Outbox`] and drained by the reactor; nothing is ever executed from
//! inside a carrier callback.
use std::collections::VecDeque;

use log::*;

use switchyard_common::time::LocalDuration;

use super::event::Event;
use super::DisconnectReason;
use crate::message::Message;
use crate::session::SessionId;
use switchyard_common::address::Address;

/// Output of a state transition.
#[derive(Debug, Clone)]
pub enum Io {
    /// Hand a message to the carrier owning the session.
    Write(SessionId, Message),
    /// Ask carriers to open a session to the given address.
    Connect(Address),
    /// Tear a session down. Carried out by the owning carrier, outside the
    /// call stack that requested it.
    Disconnect(SessionId, DisconnectReason),
    /// Ask the reactor to wake us after the given duration.
    SetTimer(LocalDuration),
    /// Emit an event.
    Event(Event),
}

/// Queue of pending outputs.
#[derive(Debug, Clone, Default)]
pub struct Outbox {
    outbound: VecDeque<Io>,
}

impl Outbox {
    /// Create an empty outbox.
    pub fn new() -> Self {
        Self::default()
    }

    /// Push an output to the queue.
    pub fn push(&mut self, output: Io) {
        self.outbound.push_back(output);
    }

    /// Drain the next output.
    pub fn next(&mut self) -> Option<Io> {
        self.outbound.pop_front()
    }

    /// Queue a message for a session.
    pub fn message(&mut self, session: SessionId, message: Message) {
        trace!(target: "p2p", "Sending {} on {}", message.cmd(), session);
        self.push(Io::Write(session, message));
    }

    /// Queue a dial request.
    pub fn connect(&mut self, address: Address) {
        self.push(Io::Connect(address));
    }

    /// Queue a session teardown.
    pub fn disconnect(&mut self, session: SessionId, reason: DisconnectReason) {
        debug!(target: "p2p", "Disconnecting {}: {}", session, reason);
        self.push(Io::Disconnect(session, reason));
    }

    /// Queue a wakeup request.
    pub fn set_timer(&mut self, duration: LocalDuration) -> &mut Self {
        self.push(Io::SetTimer(duration));
        self
    }

    /// Queue an event.
    pub fn event(&mut self, event: Event) {
        self.push(Io::Event(event));
    }

    /// Number of queued outputs.
    pub fn len(&self) -> usize {
        self.outbound.len()
    }

    /// Whether the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.outbound.is_empty()
    }
}
