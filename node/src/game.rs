//! Authoritative snake simulation on a toroidal grid.
//!
//! Only the master calls [`GameState::tick`]; every other node keeps a copy
//! that is replaced wholesale by [`GameState::load_snapshot`]. All randomness
//! (spawn direction, food placement, dead-body drops) comes from one seedable
//! `StdRng` so a given seed replays the same game.

use crate::error::GameError;
use crate::snake::Snake;
use log::{debug, info};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use shared::{
    Coord, Direction, GameConfig, GamePlayer, GameSnapshot, NodeRole, PlayerType, SnakeState,
};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::net::{IpAddr, SocketAddr};

/// Side of the square that must be empty around a new snake.
const SPAWN_REGION: i32 = 5;
const SPAWN_MARGIN: i32 = SPAWN_REGION / 2;

/// Read-only picture of the game for a presentation layer.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GameView {
    pub state_order: u64,
    pub width: i32,
    pub height: i32,
    pub players: Vec<GamePlayer>,
    pub snakes: Vec<SnakeView>,
    pub foods: Vec<Coord>,
    pub game_over: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SnakeView {
    pub player_id: u32,
    pub cells: Vec<Coord>,
    pub state: SnakeState,
    pub heading: Direction,
}

#[derive(Debug)]
pub struct GameState {
    config: GameConfig,
    players: BTreeMap<u32, GamePlayer>,
    snakes: BTreeMap<u32, Snake>,
    foods: BTreeSet<Coord>,
    /// Players whose snakes crashed, kept so they can come back as viewers.
    retired: BTreeMap<u32, GamePlayer>,
    state_order: u64,
    next_player_id: u32,
    rng: StdRng,
}

impl GameState {
    pub fn new(config: GameConfig, seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        Self {
            config,
            players: BTreeMap::new(),
            snakes: BTreeMap::new(),
            foods: BTreeSet::new(),
            retired: BTreeMap::new(),
            state_order: 0,
            next_player_id: 1,
            rng,
        }
    }

    pub fn config(&self) -> &GameConfig {
        &self.config
    }

    pub fn state_order(&self) -> u64 {
        self.state_order
    }

    pub fn player(&self, id: u32) -> Option<&GamePlayer> {
        self.players.get(&id)
    }

    pub fn players(&self) -> impl Iterator<Item = &GamePlayer> {
        self.players.values()
    }

    pub fn find_role(&self, role: NodeRole) -> Option<&GamePlayer> {
        self.players.values().find(|p| p.role == role)
    }

    pub fn snake(&self, id: u32) -> Option<&Snake> {
        self.snakes.get(&id)
    }

    pub fn foods(&self) -> &BTreeSet<Coord> {
        &self.foods
    }

    /// Admits a player. Viewers never need room on the board; everyone else
    /// gets a fresh two-cell snake or [`GameError::NoPlace`].
    pub fn add_player(
        &mut self,
        name: &str,
        player_type: PlayerType,
        role: NodeRole,
        endpoint: Option<SocketAddr>,
    ) -> Result<u32, GameError> {
        let spawn = if role == NodeRole::Viewer {
            None
        } else {
            Some(self.find_spawn().ok_or(GameError::NoPlace)?)
        };

        let id = self.next_player_id;
        self.next_player_id += 1;

        if let Some(anchor) = spawn {
            let direction = Direction::ALL[self.rng.gen_range(0..Direction::ALL.len())];
            let tail = anchor.offset(direction.delta());
            self.snakes.insert(id, Snake::new(id, anchor, tail));
            debug!("Spawned snake {} at {:?} heading {:?}", id, anchor, direction.opposite());
        }

        self.players.insert(
            id,
            GamePlayer {
                id,
                name: name.to_string(),
                role,
                player_type,
                score: 0,
                ip_address: endpoint.map(|addr| addr.ip()),
                port: endpoint.map(|addr| addr.port()).unwrap_or(0),
            },
        );
        info!("Added player {} ({}) as {:?}", id, name, role);

        self.replenish_food();
        Ok(id)
    }

    /// Registers the port of a player whose record has no address yet
    /// (the master's own record).
    pub fn set_local_port(&mut self, id: u32, port: u16) {
        if let Some(player) = self.players.get_mut(&id) {
            player.port = port;
        }
    }

    pub fn set_role(&mut self, id: u32, role: NodeRole) -> bool {
        match self.players.get_mut(&id) {
            Some(player) => {
                player.role = role;
                true
            }
            None => false,
        }
    }

    /// Moves a player to the viewers. Its snake, if any, stays behind as a
    /// zombie; a player whose snake already crashed is listed again.
    pub fn make_viewer(&mut self, id: u32) -> bool {
        self.zombify_snake(id);
        if let Some(player) = self.players.get_mut(&id) {
            player.role = NodeRole::Viewer;
            return true;
        }
        match self.retired.remove(&id) {
            Some(mut player) => {
                player.role = NodeRole::Viewer;
                self.players.insert(id, player);
                true
            }
            None => false,
        }
    }

    /// Leaves the snake on the board as an uncontrolled obstacle.
    pub fn zombify_snake(&mut self, id: u32) {
        if let Some(snake) = self.snakes.get_mut(&id) {
            snake.state = SnakeState::Zombie;
        }
    }

    /// Handles a player whose node is gone: the snake becomes a zombie and
    /// the roster entry disappears.
    pub fn zombify_player(&mut self, id: u32) -> Option<GamePlayer> {
        self.zombify_snake(id);
        let removed = self.players.remove(&id);
        if removed.is_some() {
            info!("Player {} removed, snake left as zombie", id);
        }
        removed
    }

    pub fn steer(&mut self, id: u32, direction: Direction) -> Result<bool, GameError> {
        let snake = self
            .snakes
            .get_mut(&id)
            .filter(|snake| snake.is_alive())
            .ok_or(GameError::UnknownPlayer(id))?;
        Ok(snake.steer(direction))
    }

    /// Advances the simulation by one step and returns the ids of snakes
    /// that crashed and were removed.
    pub fn tick(&mut self) -> Vec<u32> {
        let (width, height) = (self.config.width, self.config.height);

        for (id, snake) in self.snakes.iter_mut() {
            let head = snake.next_head(width, height);
            let ate = self.foods.remove(&head);
            snake.advance_to(head, ate);

            if ate && snake.is_alive() {
                if let Some(player) = self.players.get_mut(id) {
                    player.score += 1;
                }
            }
        }

        let mut crashed = Vec::new();
        let mut scorers = Vec::new();
        for (id, snake) in &self.snakes {
            let head = snake.head();
            let mut hit = snake.bites_itself();

            for (other_id, other) in &self.snakes {
                if other_id == id {
                    continue;
                }
                for (index, cell) in other.cells().enumerate() {
                    if *cell == head {
                        hit = true;
                        if index > 0 {
                            scorers.push(*other_id);
                        }
                    }
                }
            }

            if hit {
                crashed.push(*id);
            }
        }

        for id in scorers {
            if let Some(player) = self.players.get_mut(&id) {
                player.score += 1;
            }
        }

        let removed: Vec<Snake> = crashed
            .iter()
            .filter_map(|id| self.snakes.remove(id))
            .collect();
        let occupied = self.occupied_cells();
        for snake in &removed {
            info!("Snake {} crashed at {:?}", snake.player_id, snake.head());
            for cell in snake.cells().skip(1) {
                if occupied.contains(cell) || self.foods.contains(cell) {
                    continue;
                }
                if self.rng.gen_bool(self.config.dead_food_prob as f64) {
                    self.foods.insert(*cell);
                }
            }
            if let Some(player) = self.players.remove(&snake.player_id) {
                self.retired.insert(player.id, player);
            }
        }

        self.replenish_food();
        crashed
    }

    /// Tops food up to the configured target without exceeding free cells.
    fn replenish_food(&mut self) {
        let alive = self.snakes.values().filter(|s| s.is_alive()).count();
        let target = self.config.food_target(alive);
        if self.foods.len() >= target {
            return;
        }

        let occupied = self.occupied_cells();
        let free = self
            .config
            .cell_count()
            .saturating_sub(occupied.len() + self.foods.len());
        let missing = (target - self.foods.len()).min(free);

        for _ in 0..missing {
            loop {
                let cell = Coord::new(
                    self.rng.gen_range(0..self.config.width),
                    self.rng.gen_range(0..self.config.height),
                );
                if !occupied.contains(&cell) && self.foods.insert(cell) {
                    break;
                }
            }
        }
    }

    fn occupied_cells(&self) -> HashSet<Coord> {
        self.snakes
            .values()
            .flat_map(|snake| snake.cells().copied())
            .collect()
    }

    /// Centre of the first fully free 5x5 region, scanned row by row.
    fn find_spawn(&self) -> Option<Coord> {
        let occupied = self.occupied_cells();
        let free = |cell: &Coord| !occupied.contains(cell) && !self.foods.contains(cell);

        for y in SPAWN_MARGIN..self.config.height - SPAWN_MARGIN {
            for x in SPAWN_MARGIN..self.config.width - SPAWN_MARGIN {
                let region_free = (-SPAWN_MARGIN..=SPAWN_MARGIN).all(|dy| {
                    (-SPAWN_MARGIN..=SPAWN_MARGIN).all(|dx| free(&Coord::new(x + dx, y + dy)))
                });
                if region_free {
                    return Some(Coord::new(x, y));
                }
            }
        }
        None
    }

    pub fn can_join(&self) -> bool {
        self.find_spawn().is_some()
    }

    /// Over once nobody is left playing.
    pub fn is_game_over(&self) -> bool {
        self.players.values().all(|p| p.role == NodeRole::Viewer)
    }

    pub fn snapshot(&self) -> GameSnapshot {
        GameSnapshot {
            state_order: self.state_order,
            snakes: self.snakes.values().map(Snake::to_snapshot).collect(),
            foods: self.foods.iter().copied().collect(),
            players: self.players.values().cloned().collect(),
            config: self.config.clone(),
        }
    }

    /// Bumps the sequence counter and captures the state under the new number.
    pub fn next_snapshot(&mut self) -> GameSnapshot {
        self.state_order += 1;
        self.snapshot()
    }

    /// Replaces the local state with `snapshot` unless it is not newer than
    /// what was last applied. Players without an address are stamped with
    /// `sender_ip`. Returns whether the snapshot was applied.
    pub fn load_snapshot(
        &mut self,
        snapshot: GameSnapshot,
        sender_ip: Option<IpAddr>,
    ) -> Result<bool, GameError> {
        if snapshot.state_order <= self.state_order {
            debug!(
                "Ignoring stale snapshot {} (have {})",
                snapshot.state_order, self.state_order
            );
            return Ok(false);
        }
        snapshot
            .config
            .validate()
            .map_err(GameError::InvalidConfig)?;

        let (width, height) = (snapshot.config.width, snapshot.config.height);
        let mut snakes = BTreeMap::new();
        for snake in &snapshot.snakes {
            let decoded = Snake::from_snapshot(snake, width, height).map_err(|source| {
                GameError::MalformedSnake {
                    player_id: snake.player_id,
                    source,
                }
            })?;
            snakes.insert(snake.player_id, decoded);
        }

        let mut players = BTreeMap::new();
        for mut player in snapshot.players {
            if player.ip_address.is_none() {
                player.ip_address = sender_ip;
            }
            players.insert(player.id, player);
        }

        let highest_id = players.keys().chain(snakes.keys()).max().copied().unwrap_or(0);
        self.next_player_id = self.next_player_id.max(highest_id + 1);
        self.snakes = snakes;
        self.players = players;
        self.foods = snapshot.foods.into_iter().collect();
        self.retired.clear();
        self.config = snapshot.config;
        self.state_order = snapshot.state_order;
        Ok(true)
    }

    pub fn view(&self) -> GameView {
        GameView {
            state_order: self.state_order,
            width: self.config.width,
            height: self.config.height,
            players: self.players.values().cloned().collect(),
            snakes: self
                .snakes
                .values()
                .map(|snake| SnakeView {
                    player_id: snake.player_id,
                    cells: snake.cells().copied().collect(),
                    state: snake.state,
                    heading: snake.heading(),
                })
                .collect(),
            foods: self.foods.iter().copied().collect(),
            game_over: !self.players.is_empty() && self.is_game_over(),
        }
    }

    #[cfg(test)]
    fn place_snake(&mut self, snake: Snake) {
        self.snakes.insert(snake.player_id, snake);
    }

    #[cfg(test)]
    fn set_foods(&mut self, foods: &[Coord]) {
        self.foods = foods.iter().copied().collect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn test_game(seed: u64) -> GameState {
        GameState::new(GameConfig::default(), Some(seed))
    }

    fn add(game: &mut GameState, name: &str) -> u32 {
        game.add_player(name, PlayerType::Human, NodeRole::Normal, None)
            .unwrap()
    }

    fn assert_food_off_snakes(game: &GameState) {
        let occupied = game.occupied_cells();
        for food in game.foods() {
            assert!(!occupied.contains(food), "food {:?} under a snake", food);
        }
    }

    fn assert_food_within_target(game: &GameState) {
        let alive = game.snakes.values().filter(|s| s.is_alive()).count();
        assert!(game.foods().len() <= game.config.food_target(alive));
    }

    #[test]
    fn test_first_spawn_is_first_free_region() {
        let mut game = test_game(1);
        let id = add(&mut game, "alice");

        let snake = game.snake(id).unwrap();
        assert_eq!(snake.head(), Coord::new(2, 2));
        assert_eq!(snake.len(), 2);

        let tail = snake.cells().nth(1).copied().unwrap();
        let delta = Coord::new(tail.x - 2, tail.y - 2);
        assert_eq!(Direction::from_delta(delta).map(Direction::opposite), Some(snake.heading()));
    }

    #[test]
    fn test_admitting_player_places_food() {
        let mut game = test_game(7);
        add(&mut game, "alice");

        // 1 static + 1.0 per living snake
        assert_eq!(game.foods().len(), 2);
        assert_food_off_snakes(&game);
        assert_food_within_target(&game);
    }

    #[test]
    fn test_viewer_gets_no_snake() {
        let mut game = test_game(3);
        let id = game
            .add_player("watcher", PlayerType::Human, NodeRole::Viewer, None)
            .unwrap();

        assert!(game.snake(id).is_none());
        assert_eq!(game.player(id).unwrap().role, NodeRole::Viewer);
        assert!(game.is_game_over());
    }

    #[test]
    fn test_player_ids_are_not_reused() {
        let mut game = test_game(3);
        let first = add(&mut game, "a");
        game.zombify_player(first);
        let second = add(&mut game, "b");
        assert!(second > first);
    }

    #[test]
    fn test_no_place_when_board_is_full() {
        let config = GameConfig {
            width: 10,
            height: 10,
            food_static: 100,
            ..GameConfig::default()
        };
        let mut game = GameState::new(config, Some(5));
        game.add_player("master", PlayerType::Human, NodeRole::Master, None)
            .unwrap();

        assert_eq!(game.foods().len(), 98);
        assert!(!game.can_join());
        assert_eq!(
            game.add_player("late", PlayerType::Human, NodeRole::Normal, None),
            Err(GameError::NoPlace)
        );
        assert!(game
            .add_player("watcher", PlayerType::Human, NodeRole::Viewer, None)
            .is_ok());
    }

    #[test]
    fn test_snakes_move_forward_without_steering() {
        let mut game = test_game(11);
        game.set_foods(&[]);
        game.place_snake(Snake::new(1, Coord::new(5, 5), Coord::new(4, 5)));
        game.place_snake(Snake::new(2, Coord::new(5, 10), Coord::new(5, 11)));
        game.config.food_static = 0;
        game.config.food_per_player = 0.0;

        for _ in 0..25 {
            assert!(game.tick().is_empty());
        }

        // 25 steps on a 20-wide board wraps once.
        assert_eq!(game.snake(1).unwrap().head(), Coord::new(10, 5));
        assert_eq!(game.snake(2).unwrap().head(), Coord::new(5, 5));
    }

    #[test]
    fn test_reverse_steer_keeps_heading() {
        let mut game = test_game(2);
        game.place_snake(Snake::new(1, Coord::new(5, 5), Coord::new(4, 5)));
        game.set_foods(&[]);

        assert_eq!(game.steer(1, Direction::Left), Ok(false));
        game.tick();
        assert_eq!(game.snake(1).unwrap().head(), Coord::new(6, 5));
        assert_eq!(game.steer(99, Direction::Up), Err(GameError::UnknownPlayer(99)));
    }

    #[test]
    fn test_eating_grows_and_scores() {
        let mut game = test_game(42);
        let id = add(&mut game, "alice");
        assert_eq!(game.foods().len(), 2);

        let snake = game.snake(id).unwrap();
        let target = snake.next_head(20, 20);
        let mut foods: Vec<Coord> = game.foods().iter().copied().collect();
        foods[0] = target;
        game.set_foods(&foods);

        let crashed = game.tick();
        assert!(crashed.is_empty());
        assert_eq!(game.snake(id).unwrap().len(), 3);
        assert_eq!(game.player(id).unwrap().score, 1);
        assert_eq!(game.foods().len(), 2);
        assert!(!game.foods().contains(&target));
        assert_food_off_snakes(&game);
        assert_food_within_target(&game);
    }

    #[test]
    fn test_collision_with_body_scores_for_owner() {
        let mut game = test_game(9);
        game.config.dead_food_prob = 0.0;
        game.players.insert(
            1,
            GamePlayer {
                id: 1,
                name: "wall".into(),
                role: NodeRole::Master,
                player_type: PlayerType::Human,
                score: 0,
                ip_address: None,
                port: 0,
            },
        );
        game.players.insert(
            2,
            GamePlayer {
                id: 2,
                name: "runner".into(),
                role: NodeRole::Normal,
                player_type: PlayerType::Human,
                score: 0,
                ip_address: None,
                port: 0,
            },
        );
        game.set_foods(&[]);

        // Snake 1 runs up along x=5; snake 2 runs right into its body.
        game.place_snake(Snake::new(1, Coord::new(5, 4), Coord::new(5, 5)));
        game.place_snake(Snake::new(2, Coord::new(4, 4), Coord::new(3, 4)));

        let crashed = game.tick();
        assert_eq!(crashed, vec![2]);
        assert!(game.snake(2).is_none());
        assert!(game.player(2).is_none());
        assert_eq!(game.player(1).unwrap().score, 1);

        // The crashed player can come back to watch.
        assert!(game.make_viewer(2));
        assert_eq!(game.player(2).unwrap().role, NodeRole::Viewer);
        assert!(!game.make_viewer(77));
    }

    #[test]
    fn test_viewer_leaves_zombie_behind() {
        let mut game = test_game(21);
        let a = add(&mut game, "a");
        let b = add(&mut game, "b");

        assert!(game.make_viewer(a));
        assert_eq!(game.snake(a).unwrap().state, SnakeState::Zombie);
        assert_eq!(game.steer(a, Direction::Up), Err(GameError::UnknownPlayer(a)));
        assert!(!game.is_game_over());

        game.make_viewer(b);
        assert!(game.is_game_over());
        assert!(game.view().game_over);
    }

    #[test]
    fn test_head_on_collision_kills_both() {
        let mut game = test_game(9);
        game.set_foods(&[]);
        game.place_snake(Snake::new(1, Coord::new(4, 5), Coord::new(3, 5)));
        game.place_snake(Snake::new(2, Coord::new(6, 5), Coord::new(7, 5)));

        let mut crashed = game.tick();
        crashed.sort();
        assert_eq!(crashed, vec![1, 2]);
    }

    #[test]
    fn test_dead_snake_drops_food_off_head() {
        let mut game = test_game(4);
        game.config.dead_food_prob = 1.0;
        game.config.food_static = 0;
        game.config.food_per_player = 0.0;
        game.set_foods(&[]);

        let mut long = Snake::new(1, Coord::new(5, 4), Coord::new(5, 5));
        for grow in [true, true] {
            let head = long.next_head(20, 20);
            long.advance_to(head, grow);
        }
        game.place_snake(long);
        game.place_snake(Snake::new(2, Coord::new(4, 4), Coord::new(3, 4)));

        let crashed = game.tick();
        assert_eq!(crashed, vec![2]);
        // Snake 2 occupied (5,4) as head and (4,4) as the rest when it died.
        assert!(game.foods().contains(&Coord::new(4, 4)));
        assert!(!game.foods().contains(&Coord::new(5, 4)));
    }

    #[test]
    fn test_food_invariants_hold_over_many_ticks() {
        let mut game = test_game(1234);
        for name in ["a", "b", "c"] {
            add(&mut game, name);
        }

        // Bodies dropped by crashed snakes may push food past the target,
        // so the cap is only checked until the first crash.
        let mut anyone_died = false;
        for round in 0..200 {
            let ids: Vec<u32> = game.snakes.keys().copied().collect();
            for id in ids {
                let direction = Direction::ALL[(round + id as usize) % 4];
                let _ = game.steer(id, direction);
            }
            anyone_died |= !game.tick().is_empty();
            assert_food_off_snakes(&game);
            if !anyone_died {
                assert_food_within_target(&game);
            }
        }
    }

    #[test]
    fn test_snapshot_order_is_monotonic() {
        let mut source = test_game(8);
        add(&mut source, "alice");
        let first = source.next_snapshot();
        source.tick();
        let second = source.next_snapshot();

        let mut replica = GameState::new(GameConfig::default(), Some(1));
        assert_eq!(replica.load_snapshot(second.clone(), None), Ok(true));
        assert_eq!(replica.load_snapshot(first, None), Ok(false));
        assert_eq!(replica.load_snapshot(second.clone(), None), Ok(false));
        assert_eq!(replica.state_order(), second.state_order);
        assert_eq!(replica.view().snakes, source.view().snakes);
    }

    #[test]
    fn test_load_backfills_master_address() {
        let mut source = test_game(8);
        let id = source
            .add_player("master", PlayerType::Human, NodeRole::Master, None)
            .unwrap();
        source.set_local_port(id, 4500);

        let mut replica = test_game(1);
        let ip = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 7));
        replica.load_snapshot(source.next_snapshot(), Some(ip)).unwrap();

        let master = replica.find_role(NodeRole::Master).unwrap();
        assert_eq!(master.endpoint(), Some(SocketAddr::new(ip, 4500)));
    }

    #[test]
    fn test_promoted_replica_continues_ids_and_order() {
        let mut source = test_game(8);
        add(&mut source, "a");
        add(&mut source, "b");
        let snapshot = source.next_snapshot();

        let mut replica = test_game(2);
        replica.load_snapshot(snapshot, None).unwrap();
        let id = add(&mut replica, "c");
        assert_eq!(id, 3);
        assert_eq!(replica.next_snapshot().state_order, 2);
    }

    #[test]
    fn test_malformed_snapshot_leaves_state_untouched() {
        let mut source = test_game(8);
        add(&mut source, "a");
        let mut snapshot = source.next_snapshot();
        snapshot.snakes[0].points.push(Coord::ZERO);

        let mut replica = test_game(2);
        let result = replica.load_snapshot(snapshot, None);
        assert!(matches!(result, Err(GameError::MalformedSnake { player_id: 1, .. })));
        assert_eq!(replica.state_order(), 0);
        assert!(replica.view().players.is_empty());
    }

    #[test]
    fn test_snapshot_with_invalid_config_is_rejected() {
        let mut source = test_game(8);
        add(&mut source, "a");
        let snapshot = source.next_snapshot();

        let mut replica = test_game(2);
        let mut zero_width = snapshot.clone();
        zero_width.config.width = 0;
        let result = replica.load_snapshot(zero_width, None);
        assert!(matches!(result, Err(GameError::InvalidConfig(_))));

        let mut bad_probability = snapshot.clone();
        bad_probability.config.dead_food_prob = 2.0;
        let result = replica.load_snapshot(bad_probability, None);
        assert!(matches!(result, Err(GameError::InvalidConfig(_))));

        assert_eq!(replica.state_order(), 0);
        assert!(replica.load_snapshot(snapshot, None).unwrap());
    }
}
