//! Performance benchmarks for the simulation and protocol hot paths

use assert_approx_eq::assert_approx_eq;
use node::game::GameState;
use node::reliable::{DedupWindow, MessageSequence, OutstandingTable};
use node::{Node, NodeOptions};
use serde::{de::DeserializeOwned, Serialize};
use shared::{
    decode_body, encode_body, Coord, Direction, GameConfig, GameMessage, GameSnapshot,
    MessageBody, NodeRole, PlayerType,
};
use std::net::SocketAddr;
use std::time::{Duration, Instant};

/// Serializes `value` with bincode and reads it back, returning the size.
fn bincode_round_trip<T: Serialize + DeserializeOwned>(value: &T) -> (usize, T) {
    let bytes = bincode::serialize(value).unwrap();
    (bytes.len(), bincode::deserialize(&bytes).unwrap())
}

fn crowded_game() -> GameState {
    let config = GameConfig {
        width: 100,
        height: 100,
        food_static: 50,
        food_per_player: 2.0,
        ..GameConfig::default()
    };
    let mut game = GameState::new(config, Some(42));
    for i in 0..20 {
        if game
            .add_player(&format!("bot{}", i), PlayerType::Robot, NodeRole::Normal, None)
            .is_err()
        {
            break;
        }
    }
    game
}

/// Benchmarks a full simulation tick on a busy board
#[test]
fn benchmark_game_tick() {
    let mut game = crowded_game();
    let ids: Vec<u32> = game.players().map(|p| p.id).collect();

    let iterations = 1_000;
    let start = Instant::now();

    for i in 0..iterations {
        let direction = Direction::ALL[i % Direction::ALL.len()];
        for id in &ids {
            let _ = game.steer(*id, direction);
        }
        game.tick();
    }

    let duration = start.elapsed();
    println!(
        "Game tick: {} iterations in {:?} ({:.2} μs/iter)",
        iterations,
        duration,
        duration.as_micros() as f64 / iterations as f64
    );

    // Generous bound; a tick runs every few hundred milliseconds in play
    assert!(duration.as_secs() < 5);
}

/// Benchmarks run-length body encoding and decoding of a winding snake
#[test]
fn benchmark_body_codec() {
    let mut body = Vec::new();
    let mut cursor = Coord::new(50, 50);
    for i in 0..400 {
        body.push(cursor);
        let step = if (i / 7) % 2 == 0 {
            Direction::Left
        } else {
            Direction::Down
        };
        cursor = cursor.offset(step.delta()).wrapped(100, 100);
    }

    let iterations = 10_000;
    let start = Instant::now();

    for _ in 0..iterations {
        let points = encode_body(&body);
        let decoded = decode_body(&points, 100, 100).unwrap();
        assert_eq!(decoded.len(), body.len());
    }

    let duration = start.elapsed();
    println!(
        "Body codec: {} iterations in {:?} ({:.2} μs/iter)",
        iterations,
        duration,
        duration.as_micros() as f64 / iterations as f64
    );

    assert!(duration.as_secs() < 5);
}

/// Benchmarks STATE message serialization
#[test]
fn benchmark_state_serialization() {
    let mut game = crowded_game();
    for _ in 0..10 {
        game.tick();
    }
    let state = game.next_snapshot();
    let message = GameMessage::new(1, MessageBody::State { state }).with_sender(Some(1));

    let encoded_size = message.encode().unwrap().len();
    assert!(encoded_size <= shared::MAX_DATAGRAM_SIZE);

    // The envelope adds only a few fixed fields to the bare snapshot.
    let MessageBody::State { state } = &message.body else {
        unreachable!()
    };
    let (snapshot_size, decoded): (usize, GameSnapshot) = bincode_round_trip(state);
    assert!(snapshot_size < encoded_size);
    assert!(encoded_size - snapshot_size <= 32);
    assert_eq!(decoded.players.len(), state.players.len());
    assert_approx_eq!(decoded.config.food_per_player, 2.0, 1e-6);
    assert_approx_eq!(decoded.config.dead_food_prob, 0.5, 1e-6);

    let iterations = 10_000;
    let start = Instant::now();

    for _ in 0..iterations {
        let bytes = message.encode().unwrap();
        let _ = GameMessage::decode(&bytes).unwrap();
    }

    let duration = start.elapsed();
    println!(
        "State serialization ({} bytes): {} iterations in {:?} ({:.2} μs/iter)",
        encoded_size,
        iterations,
        duration,
        duration.as_micros() as f64 / iterations as f64
    );

    assert!(duration.as_secs() < 5);
}

/// Benchmarks outstanding message tracking and acknowledgement
#[test]
fn benchmark_outstanding_table() {
    let peers: Vec<SocketAddr> = (0..50)
        .map(|i| SocketAddr::from(([127, 0, 0, 1], 5000 + i)))
        .collect();
    let mut table = OutstandingTable::new();
    let mut sequence = MessageSequence::new();

    let iterations = 1_000;
    let start = Instant::now();

    for _ in 0..iterations {
        let mut sent = Vec::with_capacity(peers.len());
        for peer in &peers {
            let message = GameMessage::new(
                sequence.next(),
                MessageBody::Steer {
                    direction: Direction::Up,
                },
            );
            sent.push((*peer, message.msg_seq));
            table.track(*peer, message);
        }
        for (peer, seq) in sent {
            assert!(table.acknowledge(peer, seq).is_some());
        }
    }

    let duration = start.elapsed();
    println!(
        "Outstanding table: {} track/ack rounds over {} peers in {:?}",
        iterations,
        peers.len(),
        duration
    );

    assert!(table.is_empty());
    assert!(duration.as_secs() < 5);
}

/// Benchmarks duplicate detection with periodic pruning
#[test]
fn benchmark_dedup_window() {
    let source = SocketAddr::from(([127, 0, 0, 1], 6000));
    let mut window = DedupWindow::new();
    let now = Instant::now();

    let iterations = 100_000u64;
    let start = Instant::now();

    for seq in 0..iterations {
        assert!(window.check_and_record(source, seq, now));
        assert!(!window.check_and_record(source, seq, now));
    }
    window.prune(now + Duration::from_secs(10), Duration::from_secs(1));

    let duration = start.elapsed();
    println!(
        "Dedup window: {} sequence numbers in {:?} ({:.2} ns/iter)",
        iterations,
        duration,
        duration.as_nanos() as f64 / iterations as f64
    );

    assert!(window.is_empty());
    assert!(duration.as_secs() < 5);
}

/// Benchmarks creating a master node, socket bind included
#[test]
fn benchmark_node_startup() {
    let options = NodeOptions {
        bind_addr: "127.0.0.1:0".parse().unwrap(),
        announce_group: None,
        seed: Some(1),
        ..NodeOptions::default()
    };

    let iterations = 50;
    let start = Instant::now();

    for _ in 0..iterations {
        let addr = tokio_test::block_on(async {
            let (node, _handle) = Node::create(GameConfig::default(), options.clone())
                .await
                .unwrap();
            node.local_addr()
        });
        assert_ne!(addr.port(), 0);
    }

    let duration = start.elapsed();
    println!(
        "Node startup: {} iterations in {:?} ({:.2} μs/iter)",
        iterations,
        duration,
        duration.as_micros() as f64 / iterations as f64
    );

    assert!(duration.as_secs() < 5);
}
