use clap::{Args as ClapArgs, Parser, Subcommand};
use log::{info, warn};
use node::{DiscoveryListener, GameView, Node, NodeHandle, NodeOptions};
use shared::{Direction, GameConfig, NodeRole, PlayerType, MULTICAST_GROUP, MULTICAST_PORT};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::time::{interval, sleep, Instant};

#[derive(Parser, Debug)]
#[command(author, version, about = "Peer-to-peer snake arena node", long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start a new session and act as its master
    Create {
        #[command(flatten)]
        player: PlayerArgs,

        #[command(flatten)]
        config: ConfigArgs,

        /// Do not announce the session on the multicast group
        #[arg(long)]
        no_announce: bool,
    },

    /// Join the session whose master listens on the given address
    Join {
        /// Master address, as printed by `list`
        master: SocketAddr,

        #[command(flatten)]
        player: PlayerArgs,

        /// Watch without playing
        #[arg(long)]
        view: bool,

        /// Seconds to wait for the session announcement before falling back
        /// to the configuration flags
        #[arg(long, default_value = "3")]
        discover_secs: u64,

        #[command(flatten)]
        config: ConfigArgs,
    },

    /// Print the sessions announced on the local network
    List {
        /// Seconds to listen before printing
        #[arg(short = 'w', long, default_value = "3")]
        wait_secs: u64,
    },
}

#[derive(ClapArgs, Debug)]
struct PlayerArgs {
    /// Display name
    #[arg(short = 'n', long, default_value = "player")]
    name: String,

    /// Local address to bind the game socket to
    #[arg(short = 'b', long, default_value = "0.0.0.0:0")]
    bind: SocketAddr,

    /// Register as a robot player
    #[arg(long)]
    robot: bool,

    /// Seed for the simulation's random source
    #[arg(long)]
    seed: Option<u64>,
}

#[derive(ClapArgs, Debug)]
struct ConfigArgs {
    /// Board width in cells
    #[arg(long, default_value = "20")]
    width: i32,

    /// Board height in cells
    #[arg(long, default_value = "20")]
    height: i32,

    /// Food always on the board
    #[arg(long, default_value = "1")]
    food_static: u32,

    /// Extra food per living snake
    #[arg(long, default_value = "1.0")]
    food_per_player: f32,

    /// Milliseconds between game ticks
    #[arg(long, default_value = "500")]
    state_delay_ms: u32,

    /// Chance that a cell of a crashed snake turns into food
    #[arg(long, default_value = "0.5")]
    dead_food_prob: f32,

    /// Milliseconds between resends and heartbeats
    #[arg(long, default_value = "100")]
    ping_delay_ms: u32,

    /// Milliseconds of silence before a peer counts as gone
    #[arg(long, default_value = "5000")]
    node_timeout_ms: u32,
}

impl From<&ConfigArgs> for GameConfig {
    fn from(args: &ConfigArgs) -> Self {
        GameConfig {
            width: args.width,
            height: args.height,
            food_static: args.food_static,
            food_per_player: args.food_per_player,
            state_delay_ms: args.state_delay_ms,
            dead_food_prob: args.dead_food_prob,
            ping_delay_ms: args.ping_delay_ms,
            node_timeout_ms: args.node_timeout_ms,
        }
    }
}

impl PlayerArgs {
    fn options(&self, announce: bool) -> NodeOptions {
        NodeOptions {
            bind_addr: self.bind,
            name: self.name.clone(),
            player_type: if self.robot {
                PlayerType::Robot
            } else {
                PlayerType::Human
            },
            announce_group: announce.then(|| SocketAddr::from((MULTICAST_GROUP, MULTICAST_PORT))),
            seed: self.seed,
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let args = Args::parse();

    match args.command {
        Command::Create {
            player,
            config,
            no_announce,
        } => {
            let options = player.options(!no_announce);
            let (node, handle) = Node::create(GameConfig::from(&config), options).await?;
            info!("Session open on {}", node.local_addr());
            play(node, handle).await
        }

        Command::Join {
            master,
            player,
            view,
            discover_secs,
            config,
        } => {
            let config = match discover_config(master, Duration::from_secs(discover_secs)).await {
                Some(announced) => announced,
                None => {
                    warn!("No announcement from {}, using command line configuration", master);
                    GameConfig::from(&config)
                }
            };
            let (node, handle) = Node::join(master, config, view, player.options(false)).await?;
            play(node, handle).await
        }

        Command::List { wait_secs } => list_sessions(Duration::from_secs(wait_secs)).await,
    }
}

/// Forwards stdin commands to the node and logs the scores on every new tick
/// until the session ends.
async fn play(node: Node, handle: NodeHandle) -> Result<(), Box<dyn std::error::Error>> {
    info!("Controls: w/a/s/d then Enter to steer, v to watch, q to quit");

    let mut session = tokio::spawn(node.run());
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    let mut scoreboard = interval(Duration::from_millis(100));
    let mut last_order = 0;

    loop {
        tokio::select! {
            end = &mut session => {
                println!("Session ended: {}", end?);
                return Ok(());
            },

            line = lines.next_line(), if stdin_open => match line? {
                Some(line) => handle_input(&handle, line.trim()),
                None => stdin_open = false,
            },

            _ = scoreboard.tick() => {
                let view = handle.view().await;
                if view.state_order != last_order {
                    last_order = view.state_order;
                    log_scores(&view);
                }
            },

            _ = tokio::signal::ctrl_c() => {
                info!("Received Ctrl+C, leaving the session");
                handle.exit();
            },
        }
    }
}

fn handle_input(handle: &NodeHandle, line: &str) {
    let accepted = match line {
        "w" => handle.steer(Direction::Up),
        "a" => handle.steer(Direction::Left),
        "s" => handle.steer(Direction::Down),
        "d" => handle.steer(Direction::Right),
        "v" => handle.become_viewer(),
        "q" => handle.exit(),
        "" => true,
        other => {
            warn!("Unknown command {:?}", other);
            true
        }
    };
    if !accepted {
        warn!("Node is no longer running");
    }
}

fn log_scores(view: &GameView) {
    info!(
        "State {} on {}x{}, {} food",
        view.state_order,
        view.width,
        view.height,
        view.foods.len()
    );

    let mut players: Vec<_> = view.players.iter().collect();
    players.sort_by(|a, b| b.score.cmp(&a.score).then(a.id.cmp(&b.id)));
    for player in players {
        let marker = match player.role {
            NodeRole::Master => " (master)",
            NodeRole::Deputy => " (deputy)",
            NodeRole::Viewer => " (viewer)",
            NodeRole::Normal => "",
        };
        info!("  {:>4}  {}{}", player.score, player.name, marker);
    }
    if view.game_over {
        info!("Game over");
    }
}

/// Waits for the announcement of the session at `master` and returns its
/// configuration.
async fn discover_config(master: SocketAddr, wait: Duration) -> Option<GameConfig> {
    let listener = match DiscoveryListener::spawn(MULTICAST_GROUP, MULTICAST_PORT).await {
        Ok(listener) => listener,
        Err(e) => {
            warn!("Discovery unavailable: {}", e);
            return None;
        }
    };

    let deadline = Instant::now() + wait;
    while Instant::now() < deadline {
        let sessions = listener.sessions().await;
        if let Some(session) = sessions.into_iter().find(|s| s.endpoint == master) {
            return Some(session.announcement.config);
        }
        sleep(Duration::from_millis(200)).await;
    }
    None
}

async fn list_sessions(wait: Duration) -> Result<(), Box<dyn std::error::Error>> {
    let listener = DiscoveryListener::spawn(MULTICAST_GROUP, MULTICAST_PORT).await?;
    info!("Listening for announcements on {}:{}", MULTICAST_GROUP, MULTICAST_PORT);
    sleep(wait).await;

    let sessions = listener.sessions().await;
    if sessions.is_empty() {
        println!("No sessions found");
        return Ok(());
    }

    println!(
        "{:<22} {:<12} {:>7} {:>7} {:>5} {:>8}",
        "ENDPOINT", "MASTER", "PLAYERS", "GRID", "FOOD", "CAN JOIN"
    );
    for session in sessions {
        let config = &session.announcement.config;
        println!(
            "{:<22} {:<12} {:>7} {:>7} {:>5} {:>8}",
            session.endpoint,
            session.master_name().unwrap_or("?"),
            session.active_players(),
            format!("{}x{}", config.width, config.height),
            format!("{}+{}x", config.food_static, config.food_per_player),
            if session.announcement.can_join { "yes" } else { "no" }
        );
    }
    Ok(())
}
