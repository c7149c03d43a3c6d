use shared::{decode_body, encode_body, BodyError, Coord, Direction, SnakeSnapshot, SnakeState};
use std::collections::VecDeque;

/// A snake on the toroidal grid, head first.
#[derive(Debug, Clone, PartialEq)]
pub struct Snake {
    pub player_id: u32,
    body: VecDeque<Coord>,
    pub state: SnakeState,
    /// Direction of the last move actually made.
    heading: Direction,
    /// Direction the next move will take.
    intent: Direction,
}

impl Snake {
    /// Creates a two-cell snake whose heading points from `tail` to `head`.
    pub fn new(player_id: u32, head: Coord, tail: Coord) -> Self {
        let heading = Direction::from_delta(Coord::new(head.x - tail.x, head.y - tail.y))
            .unwrap_or(Direction::Right);

        Self {
            player_id,
            body: VecDeque::from(vec![head, tail]),
            state: SnakeState::Alive,
            heading,
            intent: heading,
        }
    }

    pub fn head(&self) -> Coord {
        self.body[0]
    }

    pub fn len(&self) -> usize {
        self.body.len()
    }

    pub fn is_empty(&self) -> bool {
        self.body.is_empty()
    }

    pub fn cells(&self) -> impl Iterator<Item = &Coord> {
        self.body.iter()
    }

    pub fn heading(&self) -> Direction {
        self.heading
    }

    pub fn intent(&self) -> Direction {
        self.intent
    }

    pub fn is_alive(&self) -> bool {
        self.state == SnakeState::Alive
    }

    /// Records the direction for the next move. Reversing onto the body is
    /// refused and leaves the previous intent in place.
    pub fn steer(&mut self, direction: Direction) -> bool {
        if direction == self.heading.opposite() {
            return false;
        }
        self.intent = direction;
        true
    }

    pub fn next_head(&self, width: i32, height: i32) -> Coord {
        self.head().offset(self.intent.delta()).wrapped(width, height)
    }

    /// Moves the head to `head`. The tail stays in place when the snake grows.
    pub fn advance_to(&mut self, head: Coord, grow: bool) {
        self.heading = self.intent;
        self.body.push_front(head);
        if !grow {
            self.body.pop_back();
        }
    }

    /// True when the head overlaps any other segment of the same snake.
    pub fn bites_itself(&self) -> bool {
        let head = self.head();
        self.body.iter().skip(1).any(|cell| *cell == head)
    }

    pub fn to_snapshot(&self) -> SnakeSnapshot {
        let cells: Vec<Coord> = self.body.iter().copied().collect();
        SnakeSnapshot {
            player_id: self.player_id,
            points: encode_body(&cells),
            state: self.state,
            head_direction: self.intent,
        }
    }

    pub fn from_snapshot(snapshot: &SnakeSnapshot, width: i32, height: i32) -> Result<Self, BodyError> {
        let cells = decode_body(&snapshot.points, width, height)?;
        Ok(Self {
            player_id: snapshot.player_id,
            body: cells.into(),
            state: snapshot.state,
            heading: snapshot.head_direction,
            intent: snapshot.head_direction,
        })
    }
}
