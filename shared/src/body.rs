//! Run-length encoding of snake bodies for state snapshots.
//!
//! A body travels as its head cell followed by one offset per straight
//! stretch of the body. Each offset is a unit step multiplied by the length
//! of the stretch, so `(3, 0)` means "three cells to the right of the
//! previous key point". Steps that cross the grid edge show up as a jump of
//! `width - 1` (or `height - 1`) between neighbouring cells and are folded
//! back to a unit step in the opposite direction before counting.

use crate::Coord;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BodyError {
    #[error("snake body has no head point")]
    Empty,
    #[error("zero-length run at point {0}")]
    ZeroRun(usize),
    #[error("snake body longer than the {0} cells of the grid")]
    TooLong(usize),
}

fn clamp_axis(delta: i32) -> i32 {
    if delta > 1 {
        -1
    } else if delta < -1 {
        1
    } else {
        delta
    }
}

fn unit_step(from: Coord, to: Coord) -> Coord {
    Coord::new(clamp_axis(to.x - from.x), clamp_axis(to.y - from.y))
}

/// Collapses a head-first body into key points.
pub fn encode_body(body: &[Coord]) -> Vec<Coord> {
    let Some(&head) = body.first() else {
        return Vec::new();
    };

    let mut points = vec![head];
    let mut run: Option<(Coord, i32)> = None;

    for pair in body.windows(2) {
        let step = unit_step(pair[0], pair[1]);
        if step == Coord::ZERO {
            continue;
        }

        run = match run {
            Some((current, len)) if current == step => Some((current, len + 1)),
            Some((current, len)) => {
                points.push(current.scale(len));
                Some((step, 1))
            }
            None => Some((step, 1)),
        };
    }

    if let Some((step, len)) = run {
        points.push(step.scale(len));
    }

    points
}

/// Expands key points back into the full cell sequence, wrapping every cell
/// into the `width` x `height` grid.
pub fn decode_body(points: &[Coord], width: i32, height: i32) -> Result<Vec<Coord>, BodyError> {
    let (&head, runs) = points.split_first().ok_or(BodyError::Empty)?;
    let limit = width.max(1) as usize * height.max(1) as usize;

    let mut cursor = head.wrapped(width, height);
    let mut body = vec![cursor];

    for (index, run) in runs.iter().enumerate() {
        let (step, len) = if run.x.unsigned_abs() >= run.y.unsigned_abs() {
            (Coord::new(run.x.signum(), 0), run.x.unsigned_abs())
        } else {
            (Coord::new(0, run.y.signum()), run.y.unsigned_abs())
        };

        if len == 0 {
            return Err(BodyError::ZeroRun(index + 1));
        }
        if body.len() + len as usize > limit {
            return Err(BodyError::TooLong(limit));
        }

        for _ in 0..len {
            cursor = cursor.offset(step).wrapped(width, height);
            body.push(cursor);
        }
    }

    Ok(body)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cells(points: &[(i32, i32)]) -> Vec<Coord> {
        points.iter().map(|&(x, y)| Coord::new(x, y)).collect()
    }

    #[test]
    fn test_single_cell_body() {
        let body = cells(&[(4, 7)]);
        let encoded = encode_body(&body);

        assert_eq!(encoded, body);
        assert_eq!(decode_body(&encoded, 20, 20).unwrap(), body);
    }

    #[test]
    fn test_straight_body_is_one_run() {
        let body = cells(&[(5, 5), (4, 5), (3, 5), (2, 5)]);
        let encoded = encode_body(&body);

        assert_eq!(encoded, cells(&[(5, 5), (-3, 0)]));
        assert_eq!(decode_body(&encoded, 20, 20).unwrap(), body);
    }

    #[test]
    fn test_turns_start_new_runs() {
        // Head at (5,5), body runs down two cells, then right three.
        let body = cells(&[(5, 5), (5, 6), (5, 7), (6, 7), (7, 7), (8, 7)]);
        let encoded = encode_body(&body);

        assert_eq!(encoded, cells(&[(5, 5), (0, 2), (3, 0)]));
        assert_eq!(decode_body(&encoded, 20, 20).unwrap(), body);
    }

    #[test]
    fn test_body_wrapping_horizontally() {
        let body = cells(&[(1, 3), (0, 3), (19, 3), (18, 3)]);
        let encoded = encode_body(&body);

        assert_eq!(encoded, cells(&[(1, 3), (-3, 0)]));
        assert_eq!(decode_body(&encoded, 20, 20).unwrap(), body);
    }

    #[test]
    fn test_body_wrapping_vertically_with_turn() {
        let body = cells(&[(4, 13), (4, 14), (4, 0), (4, 1), (5, 1), (6, 1)]);
        let encoded = encode_body(&body);

        assert_eq!(encoded, cells(&[(4, 13), (0, 3), (2, 0)]));
        assert_eq!(decode_body(&encoded, 10, 15).unwrap(), body);
    }

    #[test]
    fn test_body_wrapping_both_axes() {
        let body = cells(&[(0, 0), (9, 0), (9, 9), (9, 8), (0, 8)]);
        let encoded = encode_body(&body);

        assert_eq!(decode_body(&encoded, 10, 10).unwrap(), body);
    }

    #[test]
    fn test_decode_rejects_empty_and_zero_runs() {
        assert_eq!(decode_body(&[], 10, 10), Err(BodyError::Empty));
        assert_eq!(
            decode_body(&cells(&[(1, 1), (0, 0)]), 10, 10),
            Err(BodyError::ZeroRun(1))
        );
    }

    #[test]
    fn test_decode_rejects_bodies_longer_than_grid() {
        let result = decode_body(&cells(&[(1, 1), (500, 0)]), 10, 10);
        assert_eq!(result, Err(BodyError::TooLong(100)));
    }

    #[test]
    fn test_decode_rejects_extreme_runs() {
        let result = decode_body(&cells(&[(1, 1), (i32::MIN, 0)]), 10, 10);
        assert_eq!(result, Err(BodyError::TooLong(100)));

        let result = decode_body(&cells(&[(1, 1), (0, i32::MIN)]), 10, 10);
        assert_eq!(result, Err(BodyError::TooLong(100)));
    }

    #[test]
    fn test_decode_wraps_out_of_range_head() {
        let body = decode_body(&cells(&[(-1, 12), (2, 0)]), 10, 10).unwrap();
        assert_eq!(body, cells(&[(9, 2), (0, 2), (1, 2)]));
    }
}
