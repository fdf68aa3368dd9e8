//! Message transport: delivery of [`Envelope`]s between the Dispatcher and
//! Vehicle agents.
//!
//! `spec.md` §1 and §9 scope the real XMPP transport out of this crate; the
//! Dispatcher/Vehicle systems only depend on the [`MessageTransport`] trait.
//! [`InMemoryTransport`] is the one implementation this crate ships, used by
//! both the simulation runner and tests. A message sent during tick N is only
//! visible to `drain` calls from tick N+1 onward (see [`InMemoryTransport::advance`]),
//! which models one simulation step of network latency and keeps delivery
//! order deterministic without a dedicated "deliver" event kind.

use std::collections::VecDeque;

use bevy_ecs::prelude::Resource;

use crate::message::Envelope;

pub trait MessageTransport {
    fn send(&mut self, envelope: Envelope);
    /// Remove and return every envelope currently addressed to `to`, in FIFO order.
    fn drain_for(&mut self, to: &str) -> Vec<Envelope>;
}

/// In-process message bus. Envelopes sent via [`send`](MessageTransport::send)
/// land in a staging queue and only become visible to [`drain_for`] after the
/// next call to [`advance`](InMemoryTransport::advance) — the runner calls
/// `advance` once per tick, before any system drains its inbox.
#[derive(Debug, Default, Resource)]
pub struct InMemoryTransport {
    staged: VecDeque<Envelope>,
    inbox: VecDeque<Envelope>,
    pub sent_count: u64,
    pub delivered_count: u64,
}

impl InMemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Moves all staged envelopes into the deliverable inbox. Call once per tick.
    pub fn advance(&mut self) {
        self.delivered_count += self.staged.len() as u64;
        self.inbox.extend(self.staged.drain(..));
    }

    pub fn is_idle(&self) -> bool {
        self.staged.is_empty() && self.inbox.is_empty()
    }
}

impl MessageTransport for InMemoryTransport {
    fn send(&mut self, envelope: Envelope) {
        self.sent_count += 1;
        self.staged.push_back(envelope);
    }

    fn drain_for(&mut self, to: &str) -> Vec<Envelope> {
        let (matching, rest): (VecDeque<_>, VecDeque<_>) =
            self.inbox.drain(..).partition(|envelope| envelope.to == to);
        self.inbox = rest;
        matching.into_iter().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Message;

    #[test]
    fn envelopes_are_not_visible_until_advance() {
        let mut bus = InMemoryTransport::new();
        bus.send(Envelope::new("dispatcher", "vehicle1", Message::no_bid("T1")));
        assert!(bus.drain_for("vehicle1").is_empty());

        bus.advance();
        let delivered = bus.drain_for("vehicle1");
        assert_eq!(delivered.len(), 1);
        assert!(bus.drain_for("vehicle1").is_empty());
    }

    #[test]
    fn drain_only_returns_matching_recipient() {
        let mut bus = InMemoryTransport::new();
        bus.send(Envelope::new("dispatcher", "vehicle1", Message::no_bid("T1")));
        bus.send(Envelope::new("dispatcher", "vehicle2", Message::no_bid("T1")));
        bus.advance();

        let v1 = bus.drain_for("vehicle1");
        assert_eq!(v1.len(), 1);
        assert_eq!(v1[0].to, "vehicle1");

        let v2 = bus.drain_for("vehicle2");
        assert_eq!(v2.len(), 1);
        assert_eq!(v2[0].to, "vehicle2");
    }
}
