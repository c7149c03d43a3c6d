//! Session discovery over the multicast group.
//!
//! A master sends an ANNOUNCEMENT from its game socket to the group once a
//! second. Listeners key sessions by the master's game endpoint, which is
//! the datagram's source address combined with the port the MASTER player
//! lists in the roster, and drop sessions not refreshed within
//! [`SESSION_TTL`].

use crate::error::NodeError;
use crate::transport::{Datagram, MulticastTransport};
use log::{debug, info};
use shared::{GameAnnouncement, MessageBody, NodeRole, SESSION_TTL};
use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, RwLock};
use tokio::time::interval;

#[derive(Debug, Clone, PartialEq)]
pub struct DiscoveredSession {
    pub endpoint: SocketAddr,
    pub announcement: GameAnnouncement,
    pub last_seen: Instant,
}

impl DiscoveredSession {
    pub fn master_name(&self) -> Option<&str> {
        self.announcement.master().map(|p| p.name.as_str())
    }

    pub fn active_players(&self) -> usize {
        self.announcement
            .players
            .iter()
            .filter(|p| p.role != NodeRole::Viewer)
            .count()
    }
}

#[derive(Debug)]
pub struct SessionTable {
    sessions: HashMap<SocketAddr, DiscoveredSession>,
    ttl: Duration,
}

impl Default for SessionTable {
    fn default() -> Self {
        Self::new(SESSION_TTL)
    }
}

impl SessionTable {
    pub fn new(ttl: Duration) -> Self {
        Self {
            sessions: HashMap::new(),
            ttl,
        }
    }

    /// Stores or refreshes the session that sent `announcement` from `source`.
    pub fn record(
        &mut self,
        source: SocketAddr,
        announcement: GameAnnouncement,
        now: Instant,
    ) -> SocketAddr {
        let endpoint = announcement
            .master()
            .filter(|master| master.port != 0)
            .map(|master| SocketAddr::new(source.ip(), master.port))
            .unwrap_or(source);

        if !self.sessions.contains_key(&endpoint) {
            info!("Discovered session at {}", endpoint);
        }
        self.sessions.insert(
            endpoint,
            DiscoveredSession {
                endpoint,
                announcement,
                last_seen: now,
            },
        );
        endpoint
    }

    /// Drops stale sessions and returns how many were removed.
    pub fn prune(&mut self, now: Instant) -> usize {
        let before = self.sessions.len();
        let ttl = self.ttl;
        self.sessions
            .retain(|_, session| now.saturating_duration_since(session.last_seen) <= ttl);
        before - self.sessions.len()
    }

    pub fn get(&self, endpoint: SocketAddr) -> Option<&DiscoveredSession> {
        self.sessions.get(&endpoint)
    }

    pub fn sessions(&self) -> Vec<DiscoveredSession> {
        let mut sessions: Vec<DiscoveredSession> = self.sessions.values().cloned().collect();
        sessions.sort_by_key(|session| session.endpoint);
        sessions
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

/// Background listener that keeps a [`SessionTable`] current.
pub struct DiscoveryListener {
    table: Arc<RwLock<SessionTable>>,
    running: Arc<AtomicBool>,
    local_addr: SocketAddr,
}

impl DiscoveryListener {
    /// Joins `group` on `port` and starts listening.
    pub async fn spawn(group: Ipv4Addr, port: u16) -> Result<Self, NodeError> {
        let transport = MulticastTransport::bind(group, port).await?;
        Self::start(transport)
    }

    /// Listens on a plain socket, without joining any group.
    pub async fn spawn_on(addr: SocketAddr) -> Result<Self, NodeError> {
        let transport = MulticastTransport::bind_unicast(addr).await?;
        Self::start(transport)
    }

    fn start(transport: MulticastTransport) -> Result<Self, NodeError> {
        let local_addr = transport.local_addr()?;
        let table = Arc::new(RwLock::new(SessionTable::default()));
        let running = Arc::new(AtomicBool::new(true));

        let (tx, rx) = mpsc::unbounded_channel();
        transport.spawn_receiver(tx, Arc::clone(&running));
        tokio::spawn(run_listener(rx, Arc::clone(&table), Arc::clone(&running)));

        Ok(Self {
            table,
            running,
            local_addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub async fn sessions(&self) -> Vec<DiscoveredSession> {
        self.table.read().await.sessions()
    }

    pub fn shutdown(&self) {
        self.running.store(false, Ordering::SeqCst);
    }
}

impl Drop for DiscoveryListener {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn run_listener(
    mut inbound: mpsc::UnboundedReceiver<Datagram>,
    table: Arc<RwLock<SessionTable>>,
    running: Arc<AtomicBool>,
) {
    let mut prune_interval = interval(Duration::from_secs(1));

    while running.load(Ordering::SeqCst) {
        tokio::select! {
            datagram = inbound.recv() => match datagram {
                Some(Datagram { message, from }) => {
                    if let MessageBody::Announcement(announcement) = message.body {
                        table.write().await.record(from, announcement, Instant::now());
                    } else {
                        debug!("Ignoring {} on discovery channel from {}", message.kind(), from);
                    }
                }
                None => break,
            },
            _ = prune_interval.tick() => {
                let removed = table.write().await.prune(Instant::now());
                if removed > 0 {
                    debug!("Expired {} stale sessions", removed);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::{GameConfig, GameMessage, GamePlayer, PlayerType};
    use std::net::IpAddr;
    use tokio::net::UdpSocket;

    fn announcement(master_port: u16) -> GameAnnouncement {
        GameAnnouncement {
            players: vec![
                GamePlayer {
                    id: 1,
                    name: "host".into(),
                    role: NodeRole::Master,
                    player_type: PlayerType::Human,
                    score: 3,
                    ip_address: None,
                    port: master_port,
                },
                GamePlayer {
                    id: 2,
                    name: "guest".into(),
                    role: NodeRole::Viewer,
                    player_type: PlayerType::Robot,
                    score: 0,
                    ip_address: None,
                    port: 6000,
                },
            ],
            config: GameConfig::default(),
            can_join: true,
        }
    }

    fn source() -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::new(192, 168, 0, 9)), 41000)
    }

    #[test]
    fn test_endpoint_uses_master_port() {
        let mut table = SessionTable::default();
        let endpoint = table.record(source(), announcement(5000), Instant::now());

        assert_eq!(endpoint, "192.168.0.9:5000".parse().unwrap());
        let session = table.get(endpoint).unwrap();
        assert_eq!(session.master_name(), Some("host"));
        assert_eq!(session.active_players(), 1);
    }

    #[test]
    fn test_refresh_replaces_entry() {
        let mut table = SessionTable::default();
        let start = Instant::now();
        table.record(source(), announcement(5000), start);

        let mut updated = announcement(5000);
        updated.can_join = false;
        table.record(source(), updated, start + Duration::from_secs(1));

        assert_eq!(table.len(), 1);
        assert!(!table.sessions()[0].announcement.can_join);
    }

    #[test]
    fn test_stale_sessions_expire() {
        let mut table = SessionTable::new(Duration::from_secs(5));
        let start = Instant::now();
        table.record(source(), announcement(5000), start);
        table.record(source(), announcement(5001), start + Duration::from_secs(3));

        assert_eq!(table.prune(start + Duration::from_secs(6)), 1);
        assert_eq!(table.sessions()[0].endpoint.port(), 5001);
    }

    #[test]
    fn test_missing_master_falls_back_to_source() {
        let mut table = SessionTable::default();
        let mut orphan = announcement(5000);
        orphan.players.retain(|p| p.role != NodeRole::Master);

        assert_eq!(table.record(source(), orphan, Instant::now()), source());
    }

    #[tokio::test]
    async fn test_listener_collects_announcements() {
        let listener = DiscoveryListener::spawn_on("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        let message = GameMessage::new(1, MessageBody::Announcement(announcement(7000)));
        sender
            .send_to(&message.encode().unwrap(), listener.local_addr())
            .await
            .unwrap();

        let mut sessions = Vec::new();
        for _ in 0..50 {
            sessions = listener.sessions().await;
            if !sessions.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].endpoint, "127.0.0.1:7000".parse().unwrap());
        listener.shutdown();
    }
}
