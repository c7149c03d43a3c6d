use serde::{Deserialize, Serialize};
use std::ops::RangeInclusive;
use std::time::Duration;
use thiserror::Error;

const GRID_RANGE: RangeInclusive<i32> = 10..=100;
const FOOD_STATIC_RANGE: RangeInclusive<u32> = 0..=100;
const FOOD_PER_PLAYER_RANGE: RangeInclusive<f32> = 0.0..=100.0;
const PROBABILITY_RANGE: RangeInclusive<f32> = 0.0..=1.0;
const DELAY_RANGE_MS: RangeInclusive<u32> = 1..=10_000;

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("{field} must be within {min}..={max}, got {value}")]
    OutOfRange {
        field: &'static str,
        min: f64,
        max: f64,
        value: f64,
    },
}

/// Session parameters fixed by the master at creation and copied verbatim
/// to every joiner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GameConfig {
    pub width: i32,
    pub height: i32,
    pub food_static: u32,
    pub food_per_player: f32,
    pub state_delay_ms: u32,
    pub dead_food_prob: f32,
    pub ping_delay_ms: u32,
    pub node_timeout_ms: u32,
}

impl Default for GameConfig {
    fn default() -> Self {
        Self {
            width: 20,
            height: 20,
            food_static: 1,
            food_per_player: 1.0,
            state_delay_ms: 500,
            dead_food_prob: 0.5,
            ping_delay_ms: 100,
            node_timeout_ms: 5000,
        }
    }
}

impl GameConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        check("width", &GRID_RANGE, self.width)?;
        check("height", &GRID_RANGE, self.height)?;
        check("food_static", &FOOD_STATIC_RANGE, self.food_static)?;
        check("food_per_player", &FOOD_PER_PLAYER_RANGE, self.food_per_player)?;
        check("dead_food_prob", &PROBABILITY_RANGE, self.dead_food_prob)?;
        check("state_delay_ms", &DELAY_RANGE_MS, self.state_delay_ms)?;
        check("ping_delay_ms", &DELAY_RANGE_MS, self.ping_delay_ms)?;
        check("node_timeout_ms", &DELAY_RANGE_MS, self.node_timeout_ms)?;
        Ok(())
    }

    /// Number of food cells the board should hold for `players` living snakes.
    pub fn food_target(&self, players: usize) -> usize {
        self.food_static as usize + (self.food_per_player * players as f32) as usize
    }

    pub fn cell_count(&self) -> usize {
        (self.width.max(0) * self.height.max(0)) as usize
    }

    pub fn state_delay(&self) -> Duration {
        Duration::from_millis(self.state_delay_ms as u64)
    }

    pub fn ping_delay(&self) -> Duration {
        Duration::from_millis(self.ping_delay_ms as u64)
    }

    pub fn node_timeout(&self) -> Duration {
        Duration::from_millis(self.node_timeout_ms as u64)
    }
}

fn check<T>(field: &'static str, range: &RangeInclusive<T>, value: T) -> Result<(), ConfigError>
where
    T: PartialOrd + Copy + Into<f64>,
{
    if range.contains(&value) {
        Ok(())
    } else {
        Err(ConfigError::OutOfRange {
            field,
            min: (*range.start()).into(),
            max: (*range.end()).into(),
            value: value.into(),
        })
    }
}
