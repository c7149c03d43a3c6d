//! Joins a master with hand-built messages and prints what comes back.
//!
//! Useful for checking a running session without the full node: every
//! received message is acknowledged, snapshots are summarised, and a few
//! steers are sent along the way.

use clap::Parser;
use shared::{Direction, GameMessage, MessageBody, PlayerType, MAX_DATAGRAM_SIZE};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::{sleep, timeout, Instant};

#[derive(Parser, Debug)]
#[command(author, version, about = "Raw protocol probe for a snake arena master")]
struct Args {
    /// Master address to join
    #[arg(short = 's', long, default_value = "127.0.0.1:9000")]
    master: SocketAddr,

    /// Display name to join with
    #[arg(short = 'n', long, default_value = "probe")]
    name: String,

    /// Join as a viewer
    #[arg(long)]
    view: bool,

    /// Seconds to keep listening after joining
    #[arg(short = 'd', long, default_value = "10")]
    duration_secs: u64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let socket = UdpSocket::bind("0.0.0.0:0").await?;
    println!("Probe socket bound to {}", socket.local_addr()?);

    let mut seq = 1;
    let join = GameMessage::new(
        seq,
        MessageBody::Join {
            name: args.name.clone(),
            only_view: args.view,
            player_type: PlayerType::Robot,
        },
    );
    println!("Sending join to {}", args.master);
    socket.send_to(&join.encode()?, args.master).await?;

    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
    let mut my_id = None;
    let mut master_id = None;

    // Wait for the join to be answered, resending like the real node does.
    while my_id.is_none() {
        match timeout(Duration::from_millis(500), socket.recv_from(&mut buf)).await {
            Ok(Ok((len, from))) => {
                let message = GameMessage::decode(&buf[..len])?;
                match &message.body {
                    MessageBody::Ack if message.msg_seq == join.msg_seq => {
                        my_id = message.receiver_id;
                        master_id = message.sender_id;
                        println!("Joined as player {:?} (master {:?})", my_id, master_id);
                    }
                    MessageBody::Error { message } => {
                        println!("Join refused by {}: {}", from, message);
                        return Ok(());
                    }
                    other => println!("Ignoring {:?} before join completed", other),
                }
            }
            Ok(Err(e)) => println!("Error receiving: {}", e),
            Err(_) => {
                println!("No answer yet, resending join");
                socket.send_to(&join.encode()?, args.master).await?;
            }
        }
    }

    let steers = [
        Direction::Up,
        Direction::Left,
        Direction::Down,
        Direction::Right,
    ];
    let deadline = Instant::now() + Duration::from_secs(args.duration_secs);
    let mut next_steer = Instant::now() + Duration::from_secs(1);
    let mut steer_index = 0;

    while Instant::now() < deadline {
        if !args.view && Instant::now() >= next_steer {
            seq += 1;
            let direction = steers[steer_index % steers.len()];
            steer_index += 1;
            let steer = GameMessage::new(seq, MessageBody::Steer { direction })
                .with_sender(my_id)
                .with_receiver(master_id);
            println!("Sending steer {:?}", direction);
            socket.send_to(&steer.encode()?, args.master).await?;
            next_steer = Instant::now() + Duration::from_secs(1);
        }

        let (len, from) = match timeout(Duration::from_millis(200), socket.recv_from(&mut buf)).await {
            Ok(Ok(received)) => received,
            Ok(Err(e)) => {
                println!("Error receiving: {}", e);
                sleep(Duration::from_millis(10)).await;
                continue;
            }
            Err(_) => continue,
        };

        let message = match GameMessage::decode(&buf[..len]) {
            Ok(message) => message,
            Err(e) => {
                println!("Failed to decode datagram from {}: {}", from, e);
                continue;
            }
        };

        match &message.body {
            MessageBody::State { state } => {
                println!(
                    "State {}: {} snakes, {} food, {} players",
                    state.state_order,
                    state.snakes.len(),
                    state.foods.len(),
                    state.players.len()
                );
                for player in &state.players {
                    println!("  Player {} {:?}: {} ({:?})", player.id, player.name, player.score, player.role);
                }
            }
            MessageBody::Ack => {
                println!("Ack #{} from {}", message.msg_seq, from);
                continue;
            }
            other => println!("Received {:?} from {}", other, from),
        }

        if let Some(id) = message.sender_id {
            let ack = GameMessage::ack_for(&message, my_id, id);
            socket.send_to(&ack.encode()?, from).await?;
        }
    }

    println!("Probe finished");
    Ok(())
}
