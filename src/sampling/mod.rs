//! Rolling-window throughput sampling
//!
//! The event path bumps an [`IntervalCounter`]; once per interval the
//! ticking task drains it into the [`SamplingAggregator`] and publishes a
//! [`SamplingSnapshot`] on a watch channel.
//!
//! ```text
//! press ──► IntervalCounter ──(tick)──► SamplingAggregator ──► watch<SamplingSnapshot>
//!                                            ▲
//!                  SamplerCommand ───────────┘
//! ```

pub mod aggregator;
pub mod ticker;

pub use aggregator::{
    window_for, AggregateState, CursorSample, IntervalCounter, SamplingAggregator, SamplingError,
    SamplingSnapshot,
};
pub use ticker::{
    ReconfigureRequest, SamplerCommand, SamplerHandle, SamplerSettings, SamplerShared,
    SamplingTicker, TickerState,
};
