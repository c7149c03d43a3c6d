use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;
use thiserror::Error;

pub mod body;
pub mod config;

pub use body::{decode_body, encode_body, BodyError};
pub use config::{ConfigError, GameConfig};

pub const MULTICAST_GROUP: Ipv4Addr = Ipv4Addr::new(239, 192, 0, 4);
pub const MULTICAST_PORT: u16 = 9192;
pub const MAX_DATAGRAM_SIZE: usize = 8192;
pub const ANNOUNCE_INTERVAL: Duration = Duration::from_secs(1);
pub const SESSION_TTL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Coord {
    pub x: i32,
    pub y: i32,
}

impl Coord {
    pub const ZERO: Coord = Coord { x: 0, y: 0 };

    pub const fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }

    pub fn offset(self, delta: Coord) -> Self {
        Self::new(self.x + delta.x, self.y + delta.y)
    }

    pub fn scale(self, factor: i32) -> Self {
        Self::new(self.x * factor, self.y * factor)
    }

    /// Maps the coordinate onto a toroidal `width` x `height` grid.
    pub fn wrapped(self, width: i32, height: i32) -> Self {
        Self::new(self.x.rem_euclid(width), self.y.rem_euclid(height))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    Up,
    Down,
    Left,
    Right,
}

impl Direction {
    pub const ALL: [Direction; 4] = [
        Direction::Up,
        Direction::Down,
        Direction::Left,
        Direction::Right,
    ];

    pub fn opposite(self) -> Self {
        match self {
            Direction::Up => Direction::Down,
            Direction::Down => Direction::Up,
            Direction::Left => Direction::Right,
            Direction::Right => Direction::Left,
        }
    }

    pub fn delta(self) -> Coord {
        match self {
            Direction::Up => Coord::new(0, -1),
            Direction::Down => Coord::new(0, 1),
            Direction::Left => Coord::new(-1, 0),
            Direction::Right => Coord::new(1, 0),
        }
    }

    pub fn from_delta(delta: Coord) -> Option<Self> {
        Self::ALL.into_iter().find(|dir| dir.delta() == delta)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeRole {
    Normal,
    Master,
    Deputy,
    Viewer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum PlayerType {
    #[default]
    Human,
    Robot,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SnakeState {
    Alive,
    Zombie,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GamePlayer {
    pub id: u32,
    pub name: String,
    pub role: NodeRole,
    pub player_type: PlayerType,
    pub score: u32,
    /// Empty for the master's own record until a receiver stamps it with
    /// the address the snapshot arrived from.
    pub ip_address: Option<IpAddr>,
    pub port: u16,
}

impl GamePlayer {
    pub fn endpoint(&self) -> Option<SocketAddr> {
        self.ip_address.map(|ip| SocketAddr::new(ip, self.port))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnakeSnapshot {
    pub player_id: u32,
    /// Head cell followed by run-length offsets, see [`body`].
    pub points: Vec<Coord>,
    pub state: SnakeState,
    pub head_direction: Direction,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GameSnapshot {
    pub state_order: u64,
    pub snakes: Vec<SnakeSnapshot>,
    pub foods: Vec<Coord>,
    pub players: Vec<GamePlayer>,
    pub config: GameConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GameAnnouncement {
    pub players: Vec<GamePlayer>,
    pub config: GameConfig,
    pub can_join: bool,
}

impl GameAnnouncement {
    pub fn master(&self) -> Option<&GamePlayer> {
        self.players.iter().find(|p| p.role == NodeRole::Master)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MessageBody {
    Ping,
    Steer {
        direction: Direction,
    },
    Ack,
    State {
        state: GameSnapshot,
    },
    Announcement(GameAnnouncement),
    Join {
        name: String,
        only_view: bool,
        player_type: PlayerType,
    },
    Error {
        message: String,
    },
    RoleChange {
        sender_role: Option<NodeRole>,
        receiver_role: Option<NodeRole>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GameMessage {
    pub msg_seq: u64,
    pub sender_id: Option<u32>,
    pub receiver_id: Option<u32>,
    pub body: MessageBody,
}

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("serialization failed: {0}")]
    Serialize(bincode::Error),
    #[error("deserialization failed: {0}")]
    Deserialize(bincode::Error),
    #[error("encoded message is {0} bytes, over the datagram limit")]
    TooLarge(usize),
}

impl GameMessage {
    pub fn new(msg_seq: u64, body: MessageBody) -> Self {
        Self {
            msg_seq,
            sender_id: None,
            receiver_id: None,
            body,
        }
    }

    pub fn with_sender(mut self, sender_id: Option<u32>) -> Self {
        self.sender_id = sender_id;
        self
    }

    pub fn with_receiver(mut self, receiver_id: Option<u32>) -> Self {
        self.receiver_id = receiver_id;
        self
    }

    /// Acknowledgment echoing the sequence number of `acked`.
    pub fn ack_for(acked: &GameMessage, sender_id: Option<u32>, receiver_id: u32) -> Self {
        Self::new(acked.msg_seq, MessageBody::Ack)
            .with_sender(sender_id)
            .with_receiver(Some(receiver_id))
    }

    pub fn is_ack(&self) -> bool {
        matches!(self.body, MessageBody::Ack)
    }

    pub fn kind(&self) -> &'static str {
        match self.body {
            MessageBody::Ping => "ping",
            MessageBody::Steer { .. } => "steer",
            MessageBody::Ack => "ack",
            MessageBody::State { .. } => "state",
            MessageBody::Announcement(_) => "announcement",
            MessageBody::Join { .. } => "join",
            MessageBody::Error { .. } => "error",
            MessageBody::RoleChange { .. } => "role_change",
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        let data = bincode::serialize(self).map_err(CodecError::Serialize)?;
        if data.len() > MAX_DATAGRAM_SIZE {
            return Err(CodecError::TooLarge(data.len()));
        }
        Ok(data)
    }

    pub fn decode(data: &[u8]) -> Result<Self, CodecError> {
        bincode::deserialize(data).map_err(CodecError::Deserialize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_player(id: u32, role: NodeRole) -> GamePlayer {
        GamePlayer {
            id,
            name: format!("player-{}", id),
            role,
            player_type: PlayerType::Human,
            score: 0,
            ip_address: Some(IpAddr::V4(Ipv4Addr::LOCALHOST)),
            port: 4000 + id as u16,
        }
    }

    #[test]
    fn test_coord_wrapping() {
        assert_eq!(Coord::new(-1, 0).wrapped(10, 10), Coord::new(9, 0));
        assert_eq!(Coord::new(10, 25).wrapped(10, 10), Coord::new(0, 5));
        assert_eq!(Coord::new(3, 4).wrapped(10, 10), Coord::new(3, 4));
    }

    #[test]
    fn test_direction_opposites() {
        for dir in Direction::ALL {
            assert_eq!(dir.opposite().opposite(), dir);
            assert_eq!(dir.delta().offset(dir.opposite().delta()), Coord::ZERO);
        }
    }

    #[test]
    fn test_direction_from_delta() {
        assert_eq!(Direction::from_delta(Coord::new(1, 0)), Some(Direction::Right));
        assert_eq!(Direction::from_delta(Coord::new(0, -1)), Some(Direction::Up));
        assert_eq!(Direction::from_delta(Coord::new(1, 1)), None);
    }

    #[test]
    fn test_player_endpoint() {
        let mut player = sample_player(3, NodeRole::Normal);
        assert_eq!(
            player.endpoint(),
            Some(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 4003))
        );

        player.ip_address = None;
        assert_eq!(player.endpoint(), None);
    }

    #[test]
    fn test_ack_echoes_sequence() {
        let steer = GameMessage::new(77, MessageBody::Steer { direction: Direction::Up })
            .with_sender(Some(2))
            .with_receiver(Some(1));

        let ack = GameMessage::ack_for(&steer, Some(1), 2);
        assert!(ack.is_ack());
        assert_eq!(ack.msg_seq, 77);
        assert_eq!(ack.sender_id, Some(1));
        assert_eq!(ack.receiver_id, Some(2));
    }

    #[test]
    fn test_state_message_serialization() {
        let state = GameSnapshot {
            state_order: 42,
            snakes: vec![SnakeSnapshot {
                player_id: 1,
                points: vec![Coord::new(5, 5), Coord::new(0, 2)],
                state: SnakeState::Alive,
                head_direction: Direction::Up,
            }],
            foods: vec![Coord::new(1, 1), Coord::new(7, 3)],
            players: vec![sample_player(1, NodeRole::Master), sample_player(2, NodeRole::Deputy)],
            config: GameConfig::default(),
        };

        let message = GameMessage::new(9, MessageBody::State { state: state.clone() });
        let data = message.encode().unwrap();
        let decoded = GameMessage::decode(&data).unwrap();

        match decoded.body {
            MessageBody::State { state: received } => assert_eq!(received, state),
            _ => panic!("Wrong message type after deserialization"),
        }
    }

    #[test]
    fn test_role_change_serialization() {
        let message = GameMessage::new(
            3,
            MessageBody::RoleChange {
                sender_role: Some(NodeRole::Viewer),
                receiver_role: None,
            },
        )
        .with_sender(Some(4));

        let decoded = GameMessage::decode(&message.encode().unwrap()).unwrap();
        assert_eq!(decoded, message);
        assert_eq!(decoded.kind(), "role_change");
    }

    #[test]
    fn test_garbage_fails_to_decode() {
        let result = GameMessage::decode(&[0xff, 0xff, 0xff, 0xff, 0x01]);
        assert!(matches!(result, Err(CodecError::Deserialize(_))));
    }

    #[test]
    fn test_oversized_message_is_rejected() {
        let message = GameMessage::new(
            1,
            MessageBody::Error {
                message: "x".repeat(MAX_DATAGRAM_SIZE),
            },
        );
        assert!(matches!(message.encode(), Err(CodecError::TooLarge(_))));
    }

    #[test]
    fn test_announcement_master_lookup() {
        let announcement = GameAnnouncement {
            players: vec![sample_player(2, NodeRole::Normal), sample_player(1, NodeRole::Master)],
            config: GameConfig::default(),
            can_join: true,
        };

        assert_eq!(announcement.master().map(|p| p.id), Some(1));
    }
}
