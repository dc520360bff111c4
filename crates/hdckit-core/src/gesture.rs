//! Compiles per-finger gestures into a pointer matrix.
//!
//! A [`Gesture`] describes one finger as a start point followed by moves and
//! pauses. [`compile`] samples every gesture at [`INJECTION_DELAY_MS`]
//! intervals and produces a [`PointerMatrix`]: for each finger, an ordered
//! list of points where each point also carries how long the pointer stays
//! there. The device expects that duration packed into the x coordinate as
//! `x + 65536 * duration`.

use serde::Serialize;
use thiserror::Error;

/// Sampling interval of a compiled gesture.
pub const INJECTION_DELAY_MS: u32 = 50;

/// Largest coordinate that survives packing.
pub const MAX_COORDINATE: i32 = 0xFFFF;

const PACK_FACTOR: i64 = 65536;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GestureError {
    #[error("gesture list is empty")]
    Empty,

    #[error("finger {finger}: gesture must begin with a start step")]
    MissingStart { finger: usize },

    #[error("finger {finger}: start may only appear once")]
    RepeatedStart { finger: usize },

    #[error("finger {finger}: point ({x}, {y}) outside 0..={MAX_COORDINATE}")]
    CoordinateOutOfRange { finger: usize, x: i32, y: i32 },

    #[error("finger {finger}: duration {duration_ms}ms does not fit the packed coordinate")]
    DurationTooLong { finger: usize, duration_ms: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Point {
    pub x: i32,
    pub y: i32,
}

impl Point {
    pub const fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }
}

impl From<(i32, i32)> for Point {
    fn from((x, y): (i32, i32)) -> Self {
        Self { x, y }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GestureStep {
    Start { point: Point, duration_ms: u32 },
    Move { point: Point, duration_ms: u32 },
    Pause { duration_ms: u32 },
}

/// The steps of one finger.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Gesture {
    steps: Vec<GestureStep>,
}

impl Gesture {
    /// Begin a gesture by pressing at `point`.
    pub fn start(point: impl Into<Point>, duration_ms: u32) -> Self {
        Self {
            steps: vec![GestureStep::Start {
                point: point.into(),
                duration_ms,
            }],
        }
    }

    /// Build a gesture from raw steps. Ordering is checked by [`compile`].
    pub fn from_steps(steps: Vec<GestureStep>) -> Self {
        Self { steps }
    }

    /// Move to `point` over `duration_ms`.
    pub fn move_to(mut self, point: impl Into<Point>, duration_ms: u32) -> Self {
        self.steps.push(GestureStep::Move {
            point: point.into(),
            duration_ms,
        });
        self
    }

    /// Hold the current point for `duration_ms`.
    pub fn pause(mut self, duration_ms: u32) -> Self {
        self.steps.push(GestureStep::Pause { duration_ms });
        self
    }

    pub fn steps(&self) -> &[GestureStep] {
        &self.steps
    }

    /// Sum of all step durations.
    pub fn duration_ms(&self) -> u64 {
        self.steps
            .iter()
            .map(|step| match *step {
                GestureStep::Start { duration_ms, .. }
                | GestureStep::Move { duration_ms, .. }
                | GestureStep::Pause { duration_ms } => u64::from(duration_ms),
            })
            .sum()
    }
}

/// One sampled point of one finger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PointerSample {
    pub finger: usize,
    pub step: usize,
    pub point: Point,
    pub duration_ms: u32,
}

impl PointerSample {
    /// X coordinate with the duration packed in.
    pub fn packed_x(&self) -> i64 {
        i64::from(self.point.x) + PACK_FACTOR * i64::from(self.duration_ms)
    }

    /// Recover `(x, duration_ms)` from a packed value.
    pub fn unpack_x(packed: i64) -> (i32, u32) {
        ((packed % PACK_FACTOR) as i32, (packed / PACK_FACTOR) as u32)
    }
}

/// Finger count and longest per-finger sample count of a matrix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FingerStats {
    pub fingers: usize,
    pub max_steps: usize,
}

/// Compiled samples for all fingers, ordered by finger then step.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PointerMatrix {
    samples: Vec<PointerSample>,
}

impl PointerMatrix {
    pub fn samples(&self) -> &[PointerSample] {
        &self.samples
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn finger_index_stats(&self) -> FingerStats {
        let mut counts: Vec<usize> = Vec::new();
        for sample in &self.samples {
            if counts.len() <= sample.finger {
                counts.resize(sample.finger + 1, 0);
            }
            counts[sample.finger] += 1;
        }
        FingerStats {
            fingers: counts.iter().filter(|&&n| n > 0).count(),
            max_steps: counts.into_iter().max().unwrap_or(0),
        }
    }
}

/// Compile one gesture per finger; the finger index is the position in
/// `gestures`.
pub fn compile(gestures: &[Gesture]) -> Result<PointerMatrix, GestureError> {
    if gestures.is_empty() {
        return Err(GestureError::Empty);
    }
    let mut samples = Vec::new();
    for (finger, gesture) in gestures.iter().enumerate() {
        compile_finger(finger, gesture, &mut samples)?;
    }
    Ok(PointerMatrix { samples })
}

fn compile_finger(
    finger: usize,
    gesture: &Gesture,
    out: &mut Vec<PointerSample>,
) -> Result<(), GestureError> {
    let mut current: Option<Point> = None;
    let mut step = 0usize;
    let mut emit = |point: Point, duration_ms: u32| -> Result<(), GestureError> {
        check_point(finger, point)?;
        let sample = PointerSample {
            finger,
            step,
            point,
            duration_ms,
        };
        if sample.packed_x() > i64::from(i32::MAX) {
            return Err(GestureError::DurationTooLong { finger, duration_ms });
        }
        out.push(sample);
        step += 1;
        Ok(())
    };

    for gesture_step in gesture.steps() {
        match (*gesture_step, current) {
            (GestureStep::Start { point, duration_ms }, None) => {
                emit(point, duration_ms)?;
                current = Some(point);
            }
            (GestureStep::Start { .. }, Some(_)) => {
                return Err(GestureError::RepeatedStart { finger });
            }
            (GestureStep::Move { .. } | GestureStep::Pause { .. }, None) => {
                return Err(GestureError::MissingStart { finger });
            }
            (GestureStep::Move { point, duration_ms }, Some(from)) => {
                let count = sample_count(duration_ms);
                for i in 1..=count {
                    emit(interpolate(from, point, i, count), split_duration(duration_ms, i, count))?;
                }
                current = Some(point);
            }
            (GestureStep::Pause { duration_ms }, Some(at)) => {
                let count = sample_count(duration_ms);
                for i in 1..=count {
                    emit(at, split_duration(duration_ms, i, count))?;
                }
            }
        }
    }
    Ok(())
}

fn sample_count(duration_ms: u32) -> u32 {
    duration_ms / INJECTION_DELAY_MS + 1
}

/// Every sample but the last holds one interval; the last holds the remainder.
fn split_duration(duration_ms: u32, index: u32, count: u32) -> u32 {
    if index < count {
        INJECTION_DELAY_MS
    } else {
        duration_ms % INJECTION_DELAY_MS
    }
}

fn interpolate(from: Point, to: Point, index: u32, count: u32) -> Point {
    let lerp = |a: i32, b: i32| -> i32 {
        let delta = i64::from(b) - i64::from(a);
        (i64::from(a) + delta * i64::from(index) / i64::from(count)) as i32
    };
    Point::new(lerp(from.x, to.x), lerp(from.y, to.y))
}

fn check_point(finger: usize, point: Point) -> Result<(), GestureError> {
    let range = 0..=MAX_COORDINATE;
    if range.contains(&point.x) && range.contains(&point.y) {
        Ok(())
    } else {
        Err(GestureError::CoordinateOutOfRange {
            finger,
            x: point.x,
            y: point.y,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn finger_samples(matrix: &PointerMatrix, finger: usize) -> Vec<PointerSample> {
        matrix
            .samples()
            .iter()
            .filter(|s| s.finger == finger)
            .copied()
            .collect()
    }

    #[test]
    fn move_of_one_interval_yields_two_samples() {
        let matrix = compile(&[Gesture::start((0, 0), 0).move_to((100, 0), 50)]).unwrap();
        let moves = &matrix.samples()[1..];
        assert_eq!(moves.len(), 2);
        assert_eq!(moves[0].duration_ms, 50);
        assert_eq!(moves[1].duration_ms, 0);
        assert_eq!(moves[1].point, Point::new(100, 0));
        assert_eq!(PointerSample::unpack_x(moves[1].packed_x()), (100, 0));
    }

    #[test]
    fn zero_length_move_yields_one_sample() {
        let matrix = compile(&[Gesture::start((10, 10), 0).move_to((20, 20), 0)]).unwrap();
        let moves = &matrix.samples()[1..];
        assert_eq!(moves.len(), 1);
        assert_eq!(moves[0].duration_ms, 0);
        assert_eq!(moves[0].point, Point::new(20, 20));
    }

    #[test]
    fn short_move_carries_remainder() {
        let matrix = compile(&[Gesture::start((0, 0), 0).move_to((5, 5), 30)]).unwrap();
        assert_eq!(matrix.samples()[1].duration_ms, 30);
    }

    #[test]
    fn move_interpolates_towards_target() {
        let matrix = compile(&[Gesture::start((0, 0), 0).move_to((300, 150), 100)]).unwrap();
        let points: Vec<Point> = matrix.samples()[1..].iter().map(|s| s.point).collect();
        assert_eq!(
            points,
            vec![Point::new(100, 50), Point::new(200, 100), Point::new(300, 150)]
        );
    }

    #[test]
    fn pause_repeats_current_point() {
        let matrix = compile(&[Gesture::start((7, 9), 0).pause(120)]).unwrap();
        let pause = &matrix.samples()[1..];
        assert_eq!(pause.len(), 3);
        assert!(pause.iter().all(|s| s.point == Point::new(7, 9)));
        let durations: Vec<u32> = pause.iter().map(|s| s.duration_ms).collect();
        assert_eq!(durations, vec![50, 50, 20]);
    }

    #[test]
    fn start_keeps_its_own_duration() {
        let matrix = compile(&[Gesture::start((1, 2), 500)]).unwrap();
        assert_eq!(matrix.len(), 1);
        assert_eq!(matrix.samples()[0].packed_x(), 1 + 65536 * 500);
    }

    #[test]
    fn two_finger_stats() {
        let gestures = [
            Gesture::start((0, 0), 0).move_to((10, 10), 100),
            Gesture::start((5, 5), 0),
        ];
        let matrix = compile(&gestures).unwrap();
        let stats = matrix.finger_index_stats();
        assert_eq!(stats.fingers, 2);
        assert_eq!(stats.max_steps, finger_samples(&matrix, 0).len());
        assert_eq!(finger_samples(&matrix, 1).len(), 1);
        assert!(stats.max_steps >= 1);
    }

    #[test]
    fn steps_are_numbered_per_finger() {
        let gestures = [
            Gesture::start((0, 0), 0).pause(60),
            Gesture::start((1, 1), 0).pause(60),
        ];
        let matrix = compile(&gestures).unwrap();
        let steps: Vec<usize> = finger_samples(&matrix, 1).iter().map(|s| s.step).collect();
        assert_eq!(steps, vec![0, 1, 2]);
    }

    #[test]
    fn move_before_start_is_rejected() {
        let gesture = Gesture::from_steps(vec![GestureStep::Move {
            point: Point::new(1, 1),
            duration_ms: 10,
        }]);
        assert_eq!(compile(&[gesture]), Err(GestureError::MissingStart { finger: 0 }));
    }

    #[test]
    fn pause_before_start_is_rejected() {
        let gesture = Gesture::from_steps(vec![GestureStep::Pause { duration_ms: 10 }]);
        assert_eq!(compile(&[gesture]), Err(GestureError::MissingStart { finger: 0 }));
    }

    #[test]
    fn second_start_is_rejected() {
        let gesture = Gesture::from_steps(vec![
            GestureStep::Start { point: Point::new(0, 0), duration_ms: 0 },
            GestureStep::Start { point: Point::new(1, 1), duration_ms: 0 },
        ]);
        assert_eq!(compile(&[gesture]), Err(GestureError::RepeatedStart { finger: 0 }));
    }

    #[test]
    fn out_of_range_coordinate_is_rejected() {
        let result = compile(&[Gesture::start((70_000, 0), 0)]);
        assert!(matches!(result, Err(GestureError::CoordinateOutOfRange { x: 70_000, .. })));

        let result = compile(&[Gesture::start((-1, 0), 0)]);
        assert!(matches!(result, Err(GestureError::CoordinateOutOfRange { .. })));
    }

    #[test]
    fn oversized_duration_is_rejected() {
        let result = compile(&[Gesture::start((0, 0), 40_000)]);
        assert!(matches!(result, Err(GestureError::DurationTooLong { duration_ms: 40_000, .. })));
    }

    #[test]
    fn empty_gesture_list_is_rejected() {
        assert_eq!(compile(&[]), Err(GestureError::Empty));
    }

    #[test]
    fn total_duration() {
        let gesture = Gesture::start((0, 0), 10).move_to((1, 1), 100).pause(40);
        assert_eq!(gesture.duration_ms(), 150);
    }
}
