//! Error and outcome types for a running node.

use shared::{BodyError, CodecError, ConfigError};
use std::fmt;
use std::net::SocketAddr;
use thiserror::Error;

/// Failures that stop a node from starting or that surface from a single
/// network operation. Only a bind failure is fatal; everything else is
/// logged by the event loop and retried on the next cycle.
#[derive(Debug, Error)]
pub enum NodeError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        source: std::io::Error,
    },
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("network error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Game(#[from] GameError),
}

#[derive(Debug, Error, PartialEq)]
pub enum GameError {
    #[error("No place for you")]
    NoPlace,
    #[error("unknown player {0}")]
    UnknownPlayer(u32),
    #[error("malformed body for snake {player_id}: {source}")]
    MalformedSnake { player_id: u32, source: BodyError },
    #[error("snapshot carries an invalid configuration: {0}")]
    InvalidConfig(ConfigError),
}

/// Why a session stopped. These are expected protocol outcomes, not faults.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEnd {
    GameOver,
    Exited,
    Rejected(String),
    MasterUnreachable,
    NoHandoffTarget,
    JoinTimedOut,
}

impl fmt::Display for SessionEnd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionEnd::GameOver => write!(f, "game over"),
            SessionEnd::Exited => write!(f, "exited"),
            SessionEnd::Rejected(reason) => write!(f, "rejected by master: {}", reason),
            SessionEnd::MasterUnreachable => write!(f, "master unreachable and no deputy known"),
            SessionEnd::NoHandoffTarget => write!(f, "no deputy to hand the session to"),
            SessionEnd::JoinTimedOut => write!(f, "master never answered the join request"),
        }
    }
}
