//! Acknowledged delivery on top of plain datagrams.
//!
//! Every non-ACK message sent to a peer stays in the [`OutstandingTable`]
//! until the peer acknowledges its sequence number, and is resent on every
//! ping cycle until then. Receivers consult a [`DedupWindow`] so that a
//! retransmitted message is acknowledged again but acted on only once.

use log::debug;
use shared::{GameMessage, MessageBody};
use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::time::{Duration, Instant};

/// Per-node counter for outgoing message sequence numbers.
#[derive(Debug)]
pub struct MessageSequence {
    next: u64,
}

impl Default for MessageSequence {
    fn default() -> Self {
        Self { next: 1 }
    }
}

impl MessageSequence {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next(&mut self) -> u64 {
        let seq = self.next;
        self.next += 1;
        seq
    }
}

#[derive(Debug, Default)]
pub struct OutstandingTable {
    by_destination: HashMap<SocketAddr, BTreeMap<u64, GameMessage>>,
}

impl OutstandingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `message` for retransmission. ACKs are never tracked, and a
    /// new STATE replaces any older one still waiting for the same peer.
    pub fn track(&mut self, destination: SocketAddr, message: GameMessage) {
        if message.is_ack() {
            return;
        }

        let pending = self.by_destination.entry(destination).or_default();
        if matches!(message.body, MessageBody::State { .. }) {
            pending.retain(|_, queued| !matches!(queued.body, MessageBody::State { .. }));
        }
        pending.insert(message.msg_seq, message);
    }

    /// Removes and returns the message acknowledged by `seq`, if any.
    pub fn acknowledge(&mut self, destination: SocketAddr, seq: u64) -> Option<GameMessage> {
        let pending = self.by_destination.get_mut(&destination)?;
        let acked = pending.remove(&seq);
        if pending.is_empty() {
            self.by_destination.remove(&destination);
        }
        acked
    }

    pub fn pending(&self, destination: SocketAddr) -> usize {
        self.by_destination
            .get(&destination)
            .map(BTreeMap::len)
            .unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.by_destination.values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.by_destination.is_empty()
    }

    /// Drops everything queued for a peer that is gone.
    pub fn forget(&mut self, destination: SocketAddr) -> usize {
        self.by_destination
            .remove(&destination)
            .map(|pending| pending.len())
            .unwrap_or(0)
    }

    /// Takes everything queued for `destination` in sequence order.
    pub fn drain(&mut self, destination: SocketAddr) -> Vec<GameMessage> {
        self.by_destination
            .remove(&destination)
            .map(|pending| pending.into_values().collect())
            .unwrap_or_default()
    }

    /// Moves traffic for a lost peer over to its successor.
    pub fn retarget(&mut self, from: SocketAddr, to: SocketAddr, receiver_id: Option<u32>) -> usize {
        let moved = self.drain(from);
        let count = moved.len();
        for mut message in moved {
            message.receiver_id = receiver_id;
            self.track(to, message);
        }
        if count > 0 {
            debug!("Moved {} outstanding messages from {} to {}", count, from, to);
        }
        count
    }

    /// Collects one send per outstanding message. Each destination in
    /// `heartbeat_targets` with nothing queued first gets a tracked PING.
    pub fn resend_batch(
        &mut self,
        heartbeat_targets: &[(SocketAddr, Option<u32>)],
        sequence: &mut MessageSequence,
        sender_id: Option<u32>,
    ) -> Vec<(SocketAddr, GameMessage)> {
        for (destination, receiver_id) in heartbeat_targets {
            if self.pending(*destination) == 0 {
                let ping = GameMessage::new(sequence.next(), MessageBody::Ping)
                    .with_sender(sender_id)
                    .with_receiver(*receiver_id);
                self.track(*destination, ping);
            }
        }

        let mut batch: Vec<(SocketAddr, GameMessage)> = self
            .by_destination
            .iter()
            .flat_map(|(destination, pending)| {
                pending
                    .values()
                    .map(move |message| (*destination, message.clone()))
            })
            .collect();
        batch.sort_by_key(|(destination, message)| (*destination, message.msg_seq));
        batch
    }
}

/// Recently seen (source, sequence) pairs.
#[derive(Debug, Default)]
pub struct DedupWindow {
    seen: HashMap<SocketAddr, HashMap<u64, Instant>>,
}

impl DedupWindow {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records the pair and returns true if it had not been seen before.
    pub fn check_and_record(&mut self, source: SocketAddr, seq: u64, now: Instant) -> bool {
        let seen = self.seen.entry(source).or_default();
        if seen.contains_key(&seq) {
            return false;
        }
        seen.insert(seq, now);
        true
    }

    /// Forgets entries older than `ttl`.
    pub fn prune(&mut self, now: Instant, ttl: Duration) {
        for seen in self.seen.values_mut() {
            seen.retain(|_, at| now.saturating_duration_since(*at) <= ttl);
        }
        self.seen.retain(|_, seen| !seen.is_empty());
    }

    pub fn forget(&mut self, source: SocketAddr) {
        self.seen.remove(&source);
    }

    pub fn len(&self) -> usize {
        self.seen.values().map(HashMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}
