//! Cloneable handle through which a presentation layer drives a node.

use crate::error::SessionEnd;
use crate::game::GameView;
use shared::{Direction, NodeRole};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};

/// Requests from the presentation layer to the event loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeCommand {
    Steer(Direction),
    BecomeViewer,
    Exit,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NodeStatus {
    pub role: NodeRole,
    pub player_id: Option<u32>,
    pub master: Option<SocketAddr>,
    pub deputy: Option<SocketAddr>,
    pub local_addr: SocketAddr,
    pub ended: Option<SessionEnd>,
}

/// What the event loop last published.
#[derive(Debug, Clone)]
pub(crate) struct Published {
    pub view: GameView,
    pub status: NodeStatus,
}

#[derive(Debug, Clone)]
pub struct NodeHandle {
    commands: mpsc::UnboundedSender<NodeCommand>,
    published: Arc<RwLock<Published>>,
}

impl NodeHandle {
    pub(crate) fn new(
        commands: mpsc::UnboundedSender<NodeCommand>,
        published: Arc<RwLock<Published>>,
    ) -> Self {
        Self {
            commands,
            published,
        }
    }

    /// Latest game picture; replaced atomically after every event.
    pub async fn view(&self) -> GameView {
        self.published.read().await.view.clone()
    }

    pub async fn status(&self) -> NodeStatus {
        self.published.read().await.status.clone()
    }

    /// Queues a direction change. Returns false once the node has stopped.
    pub fn steer(&self, direction: Direction) -> bool {
        self.commands.send(NodeCommand::Steer(direction)).is_ok()
    }

    pub fn become_viewer(&self) -> bool {
        self.commands.send(NodeCommand::BecomeViewer).is_ok()
    }

    /// Leaves the session after handing off any role that needs a successor.
    pub fn exit(&self) -> bool {
        self.commands.send(NodeCommand::Exit).is_ok()
    }
}
