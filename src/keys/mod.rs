//! Per-key edge tracking and the registry of tracked keys

pub mod key_state;
pub mod registry;

pub use key_state::{KeyCount, KeyState};
pub use registry::{KeyRegistry, PressOutcome, TrackAll};
