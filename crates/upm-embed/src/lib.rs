//! UPM Embed core types shared by the network intermediary and the host-page runtime.
//!
//! Nothing in this crate performs I/O: cache rules and namespaces, analytics
//! event records, embed status values, the clock abstraction, and the pure
//! gesture recognizers all live here so both runtimes agree on them.

pub mod clock;
pub mod error;
pub mod gesture;
pub mod types;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::ParseError;
pub use gesture::{
    Gesture, GestureKind, GestureThresholds, InputPoint, Phase, SwipeDirection,
};
pub use types::*;
