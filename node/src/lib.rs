//! # Snake Arena Node
//!
//! A peer in a multiplayer snake session. Exactly one node, the MASTER,
//! owns the authoritative game and replicates it to every other node over
//! UDP. The session survives the loss of its master: a designated DEPUTY
//! takes over and the remaining nodes follow it.
//!
//! ## Roles
//!
//! - **Master** runs the simulation, admits players and broadcasts a STATE
//!   snapshot every tick.
//! - **Deputy** plays normally and is the successor if the master goes
//!   silent.
//! - **Normal** plays and forwards direction changes to the master.
//! - **Viewer** only watches.
//!
//! ## Delivery
//!
//! Datagrams can be lost or duplicated. Every message except an ACK is
//! kept in an outstanding table and resent each ping cycle until the
//! receiver acknowledges its sequence number. Receivers acknowledge every
//! copy but act on each `(source, sequence)` pair once, so handlers stay
//! idempotent under retransmission. A peer that acknowledges nothing for a
//! full node timeout is considered dead.
//!
//! ## Module Organization
//!
//! ### Simulation (`game`, `snake`)
//! Toroidal grid, snake movement and growth, collisions and scoring, food
//! placement, and snapshot load/store. All randomness comes from a seedable
//! generator so scenarios replay exactly.
//!
//! ### Protocol (`transport`, `directory`, `reliable`, `membership`)
//! Sockets with bounded receive polls, the endpoint/id/role/liveness table,
//! acknowledged delivery with deduplication, and the pure role state
//! machine that decides every failover step.
//!
//! ### Event Loop (`network`, `handle`)
//! [`Node`] owns all of the above and runs as a single task. A
//! [`NodeHandle`] lets a presentation layer read the latest game view and
//! submit steering, viewer and exit requests.
//!
//! ### Discovery (`discovery`)
//! Masters announce their session on a multicast group once a second;
//! [`DiscoveryListener`] keeps a table of live sessions.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use node::{Node, NodeOptions};
//! use shared::GameConfig;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let (node, handle) = Node::create(GameConfig::default(), NodeOptions::default()).await?;
//!     let session = tokio::spawn(node.run());
//!
//!     handle.steer(shared::Direction::Up);
//!     let view = handle.view().await;
//!     println!("{} players on a {}x{} board", view.players.len(), view.width, view.height);
//!
//!     handle.exit();
//!     println!("session ended: {}", session.await?);
//!     Ok(())
//! }
//! ```

pub mod directory;
pub mod discovery;
pub mod error;
pub mod game;
pub mod handle;
pub mod membership;
pub mod network;
pub mod reliable;
pub mod snake;
pub mod transport;

pub use discovery::{DiscoveredSession, DiscoveryListener, SessionTable};
pub use error::{GameError, NodeError, SessionEnd};
pub use game::{GameState, GameView, SnakeView};
pub use handle::{NodeCommand, NodeHandle, NodeStatus};
pub use network::{Node, NodeOptions};
