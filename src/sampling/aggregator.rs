use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, trace};

#[derive(Debug, thiserror::Error)]
pub enum SamplingError {
    #[error("Window invariant violated: history holds {len} samples, window is {window}")]
    InvariantViolation { len: usize, window: usize },

    #[error("Invalid sampling interval: {0} ms")]
    InvalidInterval(u64),

    #[error("Sampler channel error: {0}")]
    ChannelError(String),
}

/// Presses counted since the last tick.
///
/// Incremented from the event path and drained by the ticking task with a
/// single atomic swap, so no press is lost or counted twice across a tick.
#[derive(Debug, Default)]
pub struct IntervalCounter(AtomicU64);

impl IntervalCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment(&self) {
        self.0.fetch_add(1, Ordering::AcqRel);
    }

    pub fn take(&self) -> u64 {
        self.0.swap(0, Ordering::AcqRel)
    }

    pub fn reset(&self) {
        self.0.store(0, Ordering::Release);
    }

    pub fn load(&self) -> u64 {
        self.0.load(Ordering::Acquire)
    }

    pub fn set(&self, value: u64) {
        self.0.store(value, Ordering::Release);
    }
}

/// Number of intervals that make up one second, rounded up
pub fn window_for(interval_ms: u64) -> usize {
    let interval_ms = interval_ms.max(1);
    1000u64.div_ceil(interval_ms).max(1) as usize
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CursorSample {
    pub x: i32,
    pub y: i32,
    /// Sampler clock at capture, in milliseconds
    pub at_ms: u64,
}

/// Aggregate values carried across restarts
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct AggregateState {
    pub n: u64,
    pub average: f64,
    pub max: u64,
    pub previous: u64,
    pub total_hits: u64,
    /// Presses counted in the interval in progress
    pub pending: u64,
}

/// Published view of the aggregator after each tick
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SamplingSnapshot {
    /// Presses in the last full window
    pub current: u64,
    pub average: f64,
    pub max: u64,
    pub total_hits: u64,
    pub n: u64,
    pub interval_ms: u64,
    pub window: usize,
    pub ticks: u64,
    /// Published values, most recent first
    pub graph: Vec<u64>,
    /// Cursor positions, most recent first
    pub cursor_trail: Vec<CursorSample>,
}

impl SamplingSnapshot {
    pub fn format_average(&self, precision: u8) -> String {
        format!("{:.*}", usize::from(precision.min(3)), self.average)
    }
}

/// Rolling one-second window over per-interval press counts
#[derive(Debug)]
pub struct SamplingAggregator {
    counter: Arc<IntervalCounter>,
    interval_ms: u64,
    window: usize,
    history: VecDeque<u64>,
    n: u64,
    average: f64,
    max: u64,
    previous: u64,
    total_hits: u64,
    ticks: u64,
    clock_ms: u64,
    graph_backlog: usize,
    graph: VecDeque<u64>,
    cursor_backlog_ms: u64,
    cursor_trail: VecDeque<CursorSample>,
}

impl SamplingAggregator {
    pub fn new(counter: Arc<IntervalCounter>, interval_ms: u64) -> Result<Self, SamplingError> {
        if interval_ms == 0 {
            return Err(SamplingError::InvalidInterval(interval_ms));
        }
        let window = window_for(interval_ms);
        debug!(
            "Sampling aggregator created: interval {} ms, window {}",
            interval_ms, window
        );
        Ok(Self {
            counter,
            interval_ms,
            window,
            history: VecDeque::with_capacity(window),
            n: 0,
            average: 0.0,
            max: 0,
            previous: 0,
            total_hits: 0,
            ticks: 0,
            clock_ms: 0,
            graph_backlog: 0,
            graph: VecDeque::new(),
            cursor_backlog_ms: 0,
            cursor_trail: VecDeque::new(),
        })
    }

    pub fn with_backlogs(mut self, graph_backlog: usize, cursor_backlog_ms: u64) -> Self {
        self.set_backlogs(graph_backlog, cursor_backlog_ms);
        self
    }

    pub fn set_backlogs(&mut self, graph_backlog: usize, cursor_backlog_ms: u64) {
        self.graph_backlog = graph_backlog;
        self.graph.truncate(graph_backlog);
        self.cursor_backlog_ms = cursor_backlog_ms;
        if cursor_backlog_ms == 0 {
            self.cursor_trail.clear();
        }
    }

    pub fn counter(&self) -> &Arc<IntervalCounter> {
        &self.counter
    }

    pub fn interval_ms(&self) -> u64 {
        self.interval_ms
    }

    pub fn window(&self) -> usize {
        self.window
    }

    pub fn history_len(&self) -> usize {
        self.history.len()
    }

    /// Folds the interval counter into the window and returns the new
    /// published value.
    pub fn tick(&mut self) -> Result<u64, SamplingError> {
        if self.history.len() >= self.window {
            return Err(SamplingError::InvariantViolation {
                len: self.history.len(),
                window: self.window,
            });
        }

        let cur = self.counter.take();
        let total = cur + self.history.iter().sum::<u64>();

        self.max = self.max.max(total);
        if total != 0 {
            self.average = (self.average * self.n as f64 + total as f64) / (self.n + 1) as f64;
            self.n += 1;
            self.total_hits += cur;
        }
        self.previous = total;

        self.history.push_front(cur);
        if self.history.len() >= self.window {
            self.history.pop_back();
        }

        self.ticks += 1;
        self.clock_ms += self.interval_ms;

        if self.graph_backlog > 0 {
            self.graph.push_front(total);
            self.graph.truncate(self.graph_backlog);
        }
        self.expire_cursor_samples();

        trace!(
            "Tick {}: cur={} total={} max={} avg={:.3} n={}",
            self.ticks,
            cur,
            total,
            self.max,
            self.average,
            self.n
        );
        Ok(total)
    }

    /// Records the cursor position for the current tick
    pub fn record_cursor(&mut self, x: i32, y: i32) {
        if self.cursor_backlog_ms == 0 {
            return;
        }
        self.cursor_trail.push_front(CursorSample {
            x,
            y,
            at_ms: self.clock_ms,
        });
        self.expire_cursor_samples();
    }

    fn expire_cursor_samples(&mut self) {
        let horizon = self.clock_ms.saturating_sub(self.cursor_backlog_ms);
        while self
            .cursor_trail
            .back()
            .is_some_and(|sample| sample.at_ms < horizon)
        {
            self.cursor_trail.pop_back();
        }
    }

    /// Zeroes the aggregate statistics. Window history and the pending
    /// counter are left alone.
    pub fn reset(&mut self) {
        self.n = 0;
        self.average = 0.0;
        self.max = 0;
        self.total_hits = 0;
        self.graph.clear();
        debug!("Aggregate statistics reset");
    }

    /// Switches to a new interval, rescaling the average weight so the
    /// running mean keeps its meaning in elapsed time.
    pub fn change_interval(&mut self, new_ms: u64) -> Result<(), SamplingError> {
        if new_ms == 0 {
            return Err(SamplingError::InvalidInterval(new_ms));
        }
        let old_ms = self.interval_ms;
        self.n = (u128::from(self.n) * u128::from(old_ms) / u128::from(new_ms)) as u64;
        self.counter.reset();
        self.history.clear();
        self.interval_ms = new_ms;
        self.window = window_for(new_ms);
        debug!(
            "Interval changed {} ms -> {} ms, window {}, n rescaled to {}",
            old_ms, new_ms, self.window, self.n
        );
        Ok(())
    }

    pub fn state(&self) -> AggregateState {
        AggregateState {
            n: self.n,
            average: self.average,
            max: self.max,
            previous: self.previous,
            total_hits: self.total_hits,
            pending: self.counter.load(),
        }
    }

    pub fn restore(&mut self, state: AggregateState) {
        self.n = state.n;
        self.average = state.average;
        self.max = state.max;
        self.previous = state.previous;
        self.total_hits = state.total_hits;
        self.counter.set(state.pending);
        debug!("Aggregate state restored: {:?}", state);
    }

    pub fn snapshot(&self) -> SamplingSnapshot {
        SamplingSnapshot {
            current: self.previous,
            average: self.average,
            max: self.max,
            total_hits: self.total_hits,
            n: self.n,
            interval_ms: self.interval_ms,
            window: self.window,
            ticks: self.ticks,
            graph: self.graph.iter().copied().collect(),
            cursor_trail: self.cursor_trail.iter().copied().collect(),
        }
    }
}
