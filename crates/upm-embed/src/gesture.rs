//! Pure gesture recognizers.
//!
//! Recognizers look at the current set of active contact points and the
//! phase that triggered the evaluation, and return zero or more semantic
//! gestures. They hold no state: the per-embed contact maps live in the
//! runtime's gesture tracker, and time is passed in explicitly.
//!
//! | Points | Gesture    | Phase      | Qualifies when                                  |
//! |--------|------------|------------|-------------------------------------------------|
//! | 1      | swipe      | end        | distance ≥ 50px and speed ≥ 0.5px/ms            |
//! | 1      | tap        | end        | duration ≤ 200ms and distance ≤ 10px            |
//! | 1      | long-press | move, end  | duration ≥ 500ms and distance ≤ 10px            |
//! | 2      | pinch      | move       | \|scale − 1\| ≥ 0.1                              |
//! | 2      | rotate     | move       | \|angle\| ≥ 5°                                   |

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ParseError;

/// One active contact (touch or pointer).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputPoint {
    pub identifier: i64,
    pub start_x: f64,
    pub start_y: f64,
    pub current_x: f64,
    pub current_y: f64,
    pub start_time_ms: u64,
    pub pointer_type: Option<String>,
}

impl InputPoint {
    pub fn new(identifier: i64, x: f64, y: f64, start_time_ms: u64) -> Self {
        Self {
            identifier,
            start_x: x,
            start_y: y,
            current_x: x,
            current_y: y,
            start_time_ms,
            pointer_type: None,
        }
    }

    pub fn with_pointer_type(mut self, pointer_type: impl Into<String>) -> Self {
        self.pointer_type = Some(pointer_type.into());
        self
    }

    pub fn move_to(&mut self, x: f64, y: f64) {
        self.current_x = x;
        self.current_y = y;
    }

    fn dx(&self) -> f64 {
        self.current_x - self.start_x
    }

    fn dy(&self) -> f64 {
        self.current_y - self.start_y
    }

    /// Straight-line displacement from the start position.
    pub fn displacement(&self) -> f64 {
        self.dx().hypot(self.dy())
    }

    /// Milliseconds since the contact started, never less than 1.
    pub fn elapsed_ms(&self, now_ms: u64) -> u64 {
        now_ms.saturating_sub(self.start_time_ms).max(1)
    }
}

/// The input phase that triggered recognition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Start,
    Move,
    End,
}

/// Dominant-axis direction of a swipe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SwipeDirection {
    Left,
    Right,
    Up,
    Down,
}

/// Recognizer thresholds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GestureThresholds {
    pub swipe_min_distance: f64,
    pub swipe_min_velocity: f64,
    pub tap_max_distance: f64,
    pub tap_max_duration_ms: u64,
    pub long_press_min_duration_ms: u64,
    pub long_press_max_distance: f64,
    pub pinch_min_scale_delta: f64,
    pub rotate_min_degrees: f64,
}

impl Default for GestureThresholds {
    fn default() -> Self {
        Self {
            swipe_min_distance: 50.0,
            swipe_min_velocity: 0.5,
            tap_max_distance: 10.0,
            tap_max_duration_ms: 200,
            long_press_min_duration_ms: 500,
            long_press_max_distance: 10.0,
            pinch_min_scale_delta: 0.1,
            rotate_min_degrees: 5.0,
        }
    }
}

/// A recognized gesture. Serializes as `{"gesture": "<kind>", ...fields}`,
/// which is exactly the gesture telemetry body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "gesture", rename_all = "camelCase")]
pub enum Gesture {
    Swipe {
        direction: SwipeDirection,
        distance: f64,
        velocity: f64,
        angle: f64,
    },
    Tap {
        x: f64,
        y: f64,
        duration: u64,
    },
    LongPress {
        x: f64,
        y: f64,
        duration: u64,
    },
    #[serde(rename_all = "camelCase")]
    Pinch {
        scale: f64,
        center_x: f64,
        center_y: f64,
    },
    #[serde(rename_all = "camelCase")]
    Rotate {
        angle: f64,
        center_x: f64,
        center_y: f64,
    },
    #[serde(rename_all = "camelCase")]
    Zoom {
        scale: f64,
        center_x: f64,
        center_y: f64,
    },
}

impl Gesture {
    pub fn kind(&self) -> GestureKind {
        match self {
            Self::Swipe { .. } => GestureKind::Swipe,
            Self::Tap { .. } => GestureKind::Tap,
            Self::LongPress { .. } => GestureKind::LongPress,
            Self::Pinch { .. } => GestureKind::Pinch,
            Self::Rotate { .. } => GestureKind::Rotate,
            Self::Zoom { .. } => GestureKind::Zoom,
        }
    }
}

/// Gesture kinds, used as listener keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GestureKind {
    Swipe,
    Tap,
    LongPress,
    Pinch,
    Rotate,
    Zoom,
}

impl GestureKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Swipe => "swipe",
            Self::Tap => "tap",
            Self::LongPress => "longPress",
            Self::Pinch => "pinch",
            Self::Rotate => "rotate",
            Self::Zoom => "zoom",
        }
    }
}

impl fmt::Display for GestureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for GestureKind {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "swipe" => Ok(Self::Swipe),
            "tap" => Ok(Self::Tap),
            "longPress" | "long-press" => Ok(Self::LongPress),
            "pinch" => Ok(Self::Pinch),
            "rotate" => Ok(Self::Rotate),
            "zoom" => Ok(Self::Zoom),
            other => Err(ParseError::UnknownGesture(other.to_string())),
        }
    }
}

/// Run every recognizer that applies to `inputs` for `phase`.
///
/// Single-point recognizers run in the order swipe, tap, long-press;
/// two-point recognizers in the order pinch, rotate. Any other point count
/// recognizes nothing.
pub fn recognize(
    inputs: &[&InputPoint],
    phase: Phase,
    now_ms: u64,
    thresholds: &GestureThresholds,
) -> Vec<Gesture> {
    match inputs {
        [one] => [
            recognize_swipe(one, phase, now_ms, thresholds),
            recognize_tap(one, phase, now_ms, thresholds),
            recognize_long_press(one, phase, now_ms, thresholds),
        ]
        .into_iter()
        .flatten()
        .collect(),
        [a, b] => [
            recognize_pinch(a, b, phase, thresholds),
            recognize_rotate(a, b, phase, thresholds),
        ]
        .into_iter()
        .flatten()
        .collect(),
        _ => Vec::new(),
    }
}

pub fn recognize_swipe(
    input: &InputPoint,
    phase: Phase,
    now_ms: u64,
    thresholds: &GestureThresholds,
) -> Option<Gesture> {
    if phase != Phase::End {
        return None;
    }
    let distance = input.displacement();
    if distance < thresholds.swipe_min_distance {
        return None;
    }
    let velocity = distance / input.elapsed_ms(now_ms) as f64;
    if velocity < thresholds.swipe_min_velocity {
        return None;
    }

    let (dx, dy) = (input.dx(), input.dy());
    let direction = if dx.abs() > dy.abs() {
        if dx > 0.0 {
            SwipeDirection::Right
        } else {
            SwipeDirection::Left
        }
    } else if dy > 0.0 {
        SwipeDirection::Down
    } else {
        SwipeDirection::Up
    };

    Some(Gesture::Swipe {
        direction,
        distance,
        velocity,
        angle: dy.atan2(dx).to_degrees(),
    })
}

pub fn recognize_tap(
    input: &InputPoint,
    phase: Phase,
    now_ms: u64,
    thresholds: &GestureThresholds,
) -> Option<Gesture> {
    if phase != Phase::End {
        return None;
    }
    let duration = now_ms.saturating_sub(input.start_time_ms);
    if duration > thresholds.tap_max_duration_ms {
        return None;
    }
    if input.displacement() > thresholds.tap_max_distance {
        return None;
    }
    Some(Gesture::Tap {
        x: input.current_x,
        y: input.current_y,
        duration,
    })
}

pub fn recognize_long_press(
    input: &InputPoint,
    phase: Phase,
    now_ms: u64,
    thresholds: &GestureThresholds,
) -> Option<Gesture> {
    if phase == Phase::Start {
        return None;
    }
    let duration = now_ms.saturating_sub(input.start_time_ms);
    if duration < thresholds.long_press_min_duration_ms {
        return None;
    }
    if input.displacement() > thresholds.long_press_max_distance {
        return None;
    }
    Some(Gesture::LongPress {
        x: input.current_x,
        y: input.current_y,
        duration,
    })
}

pub fn recognize_pinch(
    a: &InputPoint,
    b: &InputPoint,
    phase: Phase,
    thresholds: &GestureThresholds,
) -> Option<Gesture> {
    if phase != Phase::Move {
        return None;
    }
    let start = (b.start_x - a.start_x).hypot(b.start_y - a.start_y);
    if start == 0.0 {
        return None;
    }
    let current = (b.current_x - a.current_x).hypot(b.current_y - a.current_y);
    let scale = current / start;
    if (scale - 1.0).abs() < thresholds.pinch_min_scale_delta {
        return None;
    }
    let (center_x, center_y) = center(a, b);
    Some(Gesture::Pinch {
        scale,
        center_x,
        center_y,
    })
}

pub fn recognize_rotate(
    a: &InputPoint,
    b: &InputPoint,
    phase: Phase,
    thresholds: &GestureThresholds,
) -> Option<Gesture> {
    if phase != Phase::Move {
        return None;
    }
    let start = (b.start_y - a.start_y)
        .atan2(b.start_x - a.start_x)
        .to_degrees();
    let current = (b.current_y - a.current_y)
        .atan2(b.current_x - a.current_x)
        .to_degrees();
    let angle = normalize_degrees(current - start);
    if angle.abs() < thresholds.rotate_min_degrees {
        return None;
    }
    let (center_x, center_y) = center(a, b);
    Some(Gesture::Rotate {
        angle,
        center_x,
        center_y,
    })
}

/// Wheel input maps to a fixed zoom step.
pub fn wheel_zoom(delta_y: f64, x: f64, y: f64) -> Gesture {
    Gesture::Zoom {
        scale: if delta_y > 0.0 { 0.9 } else { 1.1 },
        center_x: x,
        center_y: y,
    }
}

fn center(a: &InputPoint, b: &InputPoint) -> (f64, f64) {
    (
        (a.current_x + b.current_x) / 2.0,
        (a.current_y + b.current_y) / 2.0,
    )
}

fn normalize_degrees(mut angle: f64) -> f64 {
    if angle > 180.0 {
        angle -= 360.0;
    }
    if angle < -180.0 {
        angle += 360.0;
    }
    angle
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn point(id: i64, x: f64, y: f64, t: u64) -> InputPoint {
        InputPoint::new(id, x, y, t)
    }

    #[test]
    fn test_swipe_right() {
        let mut p = point(1, 0.0, 0.0, 0);
        p.move_to(80.0, 5.0);
        let gestures = recognize(&[&p], Phase::End, 100, &GestureThresholds::default());
        assert_eq!(gestures.len(), 1);
        match &gestures[0] {
            Gesture::Swipe {
                direction,
                distance,
                velocity,
                ..
            } => {
                assert_eq!(*direction, SwipeDirection::Right);
                assert!(*distance >= 80.0 && *distance < 81.0);
                assert!(*velocity >= 0.8 && *velocity < 0.81);
            }
            other => panic!("expected swipe, got {other:?}"),
        }
    }

    #[test]
    fn test_swipe_needs_end_phase() {
        let mut p = point(1, 0.0, 0.0, 0);
        p.move_to(80.0, 0.0);
        let t = GestureThresholds::default();
        assert!(recognize_swipe(&p, Phase::Move, 100, &t).is_none());
    }

    #[test]
    fn test_slow_drag_is_not_a_swipe() {
        let mut p = point(1, 0.0, 0.0, 0);
        p.move_to(0.0, -60.0);
        let t = GestureThresholds::default();
        // 60px over 400ms = 0.15 px/ms
        assert!(recognize_swipe(&p, Phase::End, 400, &t).is_none());
        let fast = recognize_swipe(&p, Phase::End, 50, &t).unwrap();
        assert!(matches!(
            fast,
            Gesture::Swipe {
                direction: SwipeDirection::Up,
                ..
            }
        ));
    }

    #[test]
    fn test_tap() {
        let mut p = point(1, 10.0, 10.0, 1_000);
        p.move_to(13.0, 14.0);
        let gestures = recognize(&[&p], Phase::End, 1_150, &GestureThresholds::default());
        assert_eq!(
            gestures,
            vec![Gesture::Tap {
                x: 13.0,
                y: 14.0,
                duration: 150
            }]
        );
    }

    #[test]
    fn test_long_press_on_move_and_end() {
        let p = point(1, 5.0, 5.0, 0);
        let t = GestureThresholds::default();
        assert!(recognize_long_press(&p, Phase::Move, 499, &t).is_none());
        assert!(recognize_long_press(&p, Phase::Move, 500, &t).is_some());
        assert!(recognize_long_press(&p, Phase::Start, 900, &t).is_none());
        let at_end = recognize(&[&p], Phase::End, 700, &t);
        assert_eq!(
            at_end,
            vec![Gesture::LongPress {
                x: 5.0,
                y: 5.0,
                duration: 700
            }]
        );
    }

    #[test]
    fn test_pinch_scale() {
        let t = GestureThresholds::default();
        let a = point(1, 0.0, 0.0, 0);
        let mut b = point(2, 100.0, 0.0, 0);
        b.move_to(150.0, 0.0);
        match recognize_pinch(&a, &b, Phase::Move, &t) {
            Some(Gesture::Pinch { scale, center_x, .. }) => {
                assert!((scale - 1.5).abs() < 1e-9);
                assert!((center_x - 75.0).abs() < 1e-9);
            }
            other => panic!("expected pinch, got {other:?}"),
        }

        b.move_to(105.0, 0.0);
        assert!(recognize_pinch(&a, &b, Phase::Move, &t).is_none());
    }

    #[test]
    fn test_pinch_ignores_coincident_start() {
        let t = GestureThresholds::default();
        let a = point(1, 10.0, 10.0, 0);
        let mut b = point(2, 10.0, 10.0, 0);
        b.move_to(90.0, 10.0);
        assert!(recognize_pinch(&a, &b, Phase::Move, &t).is_none());
    }

    #[test]
    fn test_rotate() {
        let t = GestureThresholds::default();
        let a = point(1, 0.0, 0.0, 0);
        let mut b = point(2, 100.0, 0.0, 0);
        // Quarter turn clockwise in screen coordinates; same distance so no pinch.
        b.move_to(0.0, 100.0);
        let gestures = recognize(&[&a, &b], Phase::Move, 10, &t);
        assert_eq!(gestures.len(), 1);
        match &gestures[0] {
            Gesture::Rotate { angle, .. } => assert!((angle - 90.0).abs() < 1e-9),
            other => panic!("expected rotate, got {other:?}"),
        }

        b.move_to(100.0, 4.0);
        assert!(recognize_rotate(&a, &b, Phase::Move, &t).is_none());
    }

    #[test]
    fn test_rotate_normalizes_across_180() {
        let t = GestureThresholds::default();
        let a = point(1, 0.0, 0.0, 0);
        let mut b = point(2, -100.0, 1.0, 0);
        b.move_to(-100.0, -1.0);
        // Bearing goes from just under 180° to just over -180°: a ~1° turn.
        assert!(recognize_rotate(&a, &b, Phase::Move, &t).is_none());
    }

    #[test]
    fn test_three_points_recognize_nothing() {
        let t = GestureThresholds::default();
        let a = point(1, 0.0, 0.0, 0);
        let b = point(2, 10.0, 0.0, 0);
        let c = point(3, 20.0, 0.0, 0);
        assert!(recognize(&[&a, &b, &c], Phase::Move, 10, &t).is_empty());
    }

    #[test]
    fn test_gesture_wire_format() {
        let pinch = Gesture::Pinch {
            scale: 1.5,
            center_x: 1.0,
            center_y: 2.0,
        };
        let v = serde_json::to_value(&pinch).unwrap();
        assert_eq!(v["gesture"], "pinch");
        assert_eq!(v["scale"], 1.5);
        assert_eq!(v["centerX"], 1.0);

        let lp = Gesture::LongPress {
            x: 0.0,
            y: 0.0,
            duration: 600,
        };
        assert_eq!(serde_json::to_value(&lp).unwrap()["gesture"], "longPress");
    }

    #[test]
    fn test_wheel_zoom() {
        assert_eq!(
            wheel_zoom(3.0, 1.0, 1.0),
            Gesture::Zoom {
                scale: 0.9,
                center_x: 1.0,
                center_y: 1.0
            }
        );
        assert!(matches!(
            wheel_zoom(-3.0, 0.0, 0.0),
            Gesture::Zoom { scale, .. } if scale > 1.0
        ));
    }
}
