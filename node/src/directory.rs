//! Known peers of this node, indexed by endpoint.
//!
//! A peer is *tracked* once `last_ack` is set: tracked peers receive
//! heartbeats and are swept when they stop acknowledging. Peers learned only
//! from a roster stay untracked so they can be resolved to ids without being
//! pinged.

use log::info;
use shared::NodeRole;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, PartialEq)]
pub struct Peer {
    pub addr: SocketAddr,
    /// Unknown for a master we have sent a join to but not heard back from.
    pub id: Option<u32>,
    pub role: NodeRole,
    pub last_ack: Option<Instant>,
}

impl Peer {
    pub fn is_timed_out(&self, now: Instant, timeout: Duration) -> bool {
        self.last_ack
            .map(|last| now.saturating_duration_since(last) > timeout)
            .unwrap_or(false)
    }
}

#[derive(Debug, Default)]
pub struct PeerDirectory {
    peers: HashMap<SocketAddr, Peer>,
}

impl PeerDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or updates a peer, keeping its liveness state.
    pub fn upsert(&mut self, addr: SocketAddr, id: Option<u32>, role: NodeRole) {
        match self.peers.get_mut(&addr) {
            Some(peer) => {
                if id.is_some() {
                    peer.id = id;
                }
                peer.role = role;
            }
            None => {
                self.peers.insert(
                    addr,
                    Peer {
                        addr,
                        id,
                        role,
                        last_ack: None,
                    },
                );
            }
        }
    }

    /// Starts or refreshes liveness tracking for `addr`.
    pub fn touch(&mut self, addr: SocketAddr, now: Instant) -> bool {
        match self.peers.get_mut(&addr) {
            Some(peer) => {
                peer.last_ack = Some(now);
                true
            }
            None => false,
        }
    }

    /// Tracks only `addr` from now on; used when following a new master.
    pub fn track_only(&mut self, addr: SocketAddr, now: Instant) {
        for peer in self.peers.values_mut() {
            peer.last_ack = if peer.addr == addr { Some(now) } else { None };
        }
    }

    pub fn track_all(&mut self, now: Instant) {
        for peer in self.peers.values_mut() {
            peer.last_ack = Some(now);
        }
    }

    pub fn remove(&mut self, addr: SocketAddr) -> Option<Peer> {
        let removed = self.peers.remove(&addr);
        if let Some(peer) = &removed {
            info!("Peer {:?} at {} removed from directory", peer.id, addr);
        }
        removed
    }

    pub fn get(&self, addr: SocketAddr) -> Option<&Peer> {
        self.peers.get(&addr)
    }

    pub fn contains(&self, addr: SocketAddr) -> bool {
        self.peers.contains_key(&addr)
    }

    pub fn id_of(&self, addr: SocketAddr) -> Option<u32> {
        self.peers.get(&addr).and_then(|peer| peer.id)
    }

    pub fn addr_of(&self, id: u32) -> Option<SocketAddr> {
        self.peers
            .values()
            .find(|peer| peer.id == Some(id))
            .map(|peer| peer.addr)
    }

    pub fn set_role(&mut self, addr: SocketAddr, role: NodeRole) {
        if let Some(peer) = self.peers.get_mut(&addr) {
            peer.role = role;
        }
    }

    /// Tracked peers whose last acknowledgment is older than `timeout`.
    pub fn timed_out(&self, now: Instant, timeout: Duration) -> Vec<SocketAddr> {
        let mut dead: Vec<SocketAddr> = self
            .peers
            .values()
            .filter(|peer| peer.is_timed_out(now, timeout))
            .map(|peer| peer.addr)
            .collect();
        dead.sort();
        dead
    }

    /// Tracked peers with their ids, ordered by id.
    pub fn tracked(&self) -> Vec<(SocketAddr, Option<u32>)> {
        let mut tracked: Vec<&Peer> = self
            .peers
            .values()
            .filter(|peer| peer.last_ack.is_some())
            .collect();
        tracked.sort_by_key(|peer| (peer.id, peer.addr));
        tracked.iter().map(|peer| (peer.addr, peer.id)).collect()
    }

    /// All peers ordered by id, then address.
    pub fn peers(&self) -> Vec<&Peer> {
        let mut peers: Vec<&Peer> = self.peers.values().collect();
        peers.sort_by_key(|peer| (peer.id, peer.addr));
        peers
    }

    /// Removes every peer for which `keep` is false and returns their addresses.
    pub fn retain<F>(&mut self, mut keep: F) -> Vec<SocketAddr>
    where
        F: FnMut(&Peer) -> bool,
    {
        let gone: Vec<SocketAddr> = self
            .peers
            .values()
            .filter(|peer| !keep(peer))
            .map(|peer| peer.addr)
            .collect();
        for addr in &gone {
            self.peers.remove(addr);
        }
        gone
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}
