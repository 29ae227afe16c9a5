//! Keys-per-second input aggregation engine
//!
//! Turns a stream of raw key, button and cursor events into live throughput
//! statistics (current, average and maximum presses per second), per-key
//! totals and command actions bound to key chords.
//!
//! # Architecture
//!
//! ```text
//! input source ──► input ──► keys ──────────► sampling ──► watch<SamplingSnapshot>
//!   (hook/replay)  (normalize)  (edge counts)   (rolling window)
//!                      │
//!                      └──► commands ──► engine actions ──► mpsc<CommandAction>
//! ```
//!
//! [`engine::Engine`] wires these together; [`config`] and [`persistence`]
//! handle the TOML files around it.

pub mod commands;
pub mod config;
pub mod engine;
pub mod input;
pub mod keys;
pub mod persistence;
pub mod sampling;

pub use engine::{Engine, EngineError, StatsSnapshot};
