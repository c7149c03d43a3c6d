//! UDP sockets for the unicast game channel and the multicast discovery
//! channel.
//!
//! Receive loops run as spawned tasks that poll the socket with a short
//! bounded timeout, so clearing the shared `running` flag stops them within
//! one poll period even when no traffic arrives.

use crate::error::NodeError;
use log::{debug, error, warn};
use shared::{GameMessage, MAX_DATAGRAM_SIZE};
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::timeout;

/// Upper bound on how long a receive loop blocks before rechecking `running`.
pub const RECV_POLL: Duration = Duration::from_millis(100);

/// A decoded message and the endpoint it came from.
#[derive(Debug, Clone)]
pub struct Datagram {
    pub message: GameMessage,
    pub from: SocketAddr,
}

pub struct UnicastTransport {
    socket: Arc<UdpSocket>,
    local_addr: SocketAddr,
}

impl UnicastTransport {
    pub async fn bind(addr: SocketAddr) -> Result<Self, NodeError> {
        let socket = UdpSocket::bind(addr)
            .await
            .map_err(|source| NodeError::Bind { addr, source })?;
        let local_addr = socket.local_addr()?;

        Ok(Self {
            socket: Arc::new(socket),
            local_addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub async fn send(&self, message: &GameMessage, addr: SocketAddr) -> Result<usize, NodeError> {
        let data = message.encode()?;
        let sent = self.socket.send_to(&data, addr).await?;
        debug!("Sent {} #{} to {}", message.kind(), message.msg_seq, addr);
        Ok(sent)
    }

    /// Starts the receive loop for this socket.
    pub fn spawn_receiver(
        &self,
        inbound: mpsc::UnboundedSender<Datagram>,
        running: Arc<AtomicBool>,
    ) -> tokio::task::JoinHandle<()> {
        spawn_receive_loop(Arc::clone(&self.socket), inbound, running, "unicast")
    }
}

/// Socket listening on the discovery group.
pub struct MulticastTransport {
    socket: Arc<UdpSocket>,
}

impl MulticastTransport {
    /// Binds `port` on all interfaces and joins `group`. Failing to join is
    /// logged and tolerated: announcements sent straight to the port still
    /// arrive.
    pub async fn bind(group: Ipv4Addr, port: u16) -> Result<Self, NodeError> {
        let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));
        let socket = UdpSocket::bind(addr)
            .await
            .map_err(|source| NodeError::Bind { addr, source })?;

        if let Err(e) = socket.join_multicast_v4(group, Ipv4Addr::UNSPECIFIED) {
            warn!("Could not join multicast group {}: {}", group, e);
        }

        Ok(Self {
            socket: Arc::new(socket),
        })
    }

    /// Plain unicast listener, used when no multicast group is wanted.
    pub async fn bind_unicast(addr: SocketAddr) -> Result<Self, NodeError> {
        let socket = UdpSocket::bind(addr)
            .await
            .map_err(|source| NodeError::Bind { addr, source })?;
        Ok(Self {
            socket: Arc::new(socket),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, NodeError> {
        Ok(self.socket.local_addr()?)
    }

    pub fn spawn_receiver(
        &self,
        inbound: mpsc::UnboundedSender<Datagram>,
        running: Arc<AtomicBool>,
    ) -> tokio::task::JoinHandle<()> {
        spawn_receive_loop(Arc::clone(&self.socket), inbound, running, "multicast")
    }
}

fn spawn_receive_loop(
    socket: Arc<UdpSocket>,
    inbound: mpsc::UnboundedSender<Datagram>,
    running: Arc<AtomicBool>,
    label: &'static str,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut buffer = vec![0u8; MAX_DATAGRAM_SIZE];

        while running.load(Ordering::SeqCst) {
            let received = match timeout(RECV_POLL, socket.recv_from(&mut buffer)).await {
                Ok(result) => result,
                Err(_) => continue,
            };

            match received {
                Ok((len, from)) => match GameMessage::decode(&buffer[..len]) {
                    Ok(message) => {
                        if inbound.send(Datagram { message, from }).is_err() {
                            debug!("{} receiver stopping, event loop is gone", label);
                            break;
                        }
                    }
                    Err(e) => warn!("Dropping malformed {} datagram from {}: {}", label, from, e),
                },
                Err(e) => {
                    error!("Error receiving on {} socket: {}", label, e);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
            }
        }
    })
}
