//! Fixed-rate sampling task
//!
//! One tokio task owns the [`SamplingAggregator`] and drives it through a
//! typestate machine. Ticks and control commands are handled strictly one at
//! a time from a single `select!` loop, so an interval change can never be
//! observed half-applied by a tick.
//!
//! ```text
//!            start                 tick
//! Stopped ─────────► Running ◄──────────┐
//!    ▲                 │  │             │
//!    │      stop       │  └─────────────┘
//!    ├─────────────────┘  │
//!    │                    │ change_interval
//!    └──── Reconfiguring ◄┘
//! ```

use crate::config::{MAX_UPDATE_RATE_MS, MIN_UPDATE_RATE_MS};
use crate::sampling::aggregator::{
    AggregateState, IntervalCounter, SamplingAggregator, SamplingError, SamplingSnapshot,
};
use statum::{machine, state};
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{Duration, Instant, Interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Clone, Debug)]
pub struct SamplerSettings {
    pub interval_ms: u64,
    pub graph_backlog: usize,
    pub cursor_backlog_ms: u64,
    /// Start ticking as soon as the task is spawned
    pub autostart: bool,
}

impl Default for SamplerSettings {
    fn default() -> Self {
        Self {
            interval_ms: 1000,
            graph_backlog: 0,
            cursor_backlog_ms: 0,
            autostart: true,
        }
    }
}

/// State shared between the event path and the ticking task
#[derive(Debug, Default)]
pub struct SamplerShared {
    counter: Arc<IntervalCounter>,
    paused: AtomicBool,
    cursor_seen: AtomicBool,
    cursor_x: AtomicI32,
    cursor_y: AtomicI32,
}

impl SamplerShared {
    pub fn counter(&self) -> &Arc<IntervalCounter> {
        &self.counter
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    pub fn set_paused(&self, paused: bool) {
        self.paused.store(paused, Ordering::Release);
    }

    /// Flips the pause flag and returns the new value
    pub fn toggle_paused(&self) -> bool {
        !self.paused.fetch_xor(true, Ordering::AcqRel)
    }

    pub fn set_cursor(&self, x: i32, y: i32) {
        self.cursor_x.store(x, Ordering::Relaxed);
        self.cursor_y.store(y, Ordering::Relaxed);
        self.cursor_seen.store(true, Ordering::Release);
    }

    pub fn cursor(&self) -> Option<(i32, i32)> {
        if !self.cursor_seen.load(Ordering::Acquire) {
            return None;
        }
        Some((
            self.cursor_x.load(Ordering::Relaxed),
            self.cursor_y.load(Ordering::Relaxed),
        ))
    }
}

/// A validated interval change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconfigureRequest {
    interval_ms: u64,
}

impl ReconfigureRequest {
    pub fn new(interval_ms: u64) -> Result<Self, SamplingError> {
        if !(MIN_UPDATE_RATE_MS..=MAX_UPDATE_RATE_MS).contains(&interval_ms) {
            return Err(SamplingError::InvalidInterval(interval_ms));
        }
        Ok(Self { interval_ms })
    }

    pub fn interval_ms(&self) -> u64 {
        self.interval_ms
    }
}

#[state]
#[derive(Debug, Clone)]
pub enum TickerState {
    Stopped,
    Running,
    Reconfiguring(ReconfigureRequest),
}

#[machine]
#[derive(Debug)]
pub struct SamplingTicker<S: TickerState> {
    aggregator: SamplingAggregator,
    shared: Arc<SamplerShared>,
    snapshot_tx: watch::Sender<SamplingSnapshot>,
}

// Available in every state
impl<S: TickerState> SamplingTicker<S> {
    pub fn interval_ms(&self) -> u64 {
        self.aggregator.interval_ms()
    }

    pub fn snapshot(&self) -> SamplingSnapshot {
        self.aggregator.snapshot()
    }

    fn publish(&self) {
        self.snapshot_tx.send_replace(self.aggregator.snapshot());
    }

    pub fn reset_stats(&mut self) {
        self.aggregator.reset();
        self.publish();
    }

    pub fn restore(&mut self, state: AggregateState) {
        self.aggregator.restore(state);
        self.publish();
    }

    pub fn set_backlogs(&mut self, graph_backlog: usize, cursor_backlog_ms: u64) {
        self.aggregator.set_backlogs(graph_backlog, cursor_backlog_ms);
        self.publish();
    }
}

impl SamplingTicker<Stopped> {
    pub fn create(
        settings: &SamplerSettings,
        shared: Arc<SamplerShared>,
        snapshot_tx: watch::Sender<SamplingSnapshot>,
    ) -> Result<Self, SamplingError> {
        let aggregator = SamplingAggregator::new(shared.counter().clone(), settings.interval_ms)?
            .with_backlogs(settings.graph_backlog, settings.cursor_backlog_ms);
        snapshot_tx.send_replace(aggregator.snapshot());
        Ok(Self::new(aggregator, shared, snapshot_tx))
    }

    pub fn start(self) -> SamplingTicker<Running> {
        info!("Sampling started at {} ms", self.interval_ms());
        self.transition()
    }

    pub fn reconfigure(self, request: ReconfigureRequest) -> SamplingTicker<Reconfiguring> {
        self.transition_with(request)
    }
}

impl SamplingTicker<Running> {
    /// One sampling step. Returns `None` while paused.
    pub fn tick(&mut self) -> Result<Option<u64>, SamplingError> {
        if self.shared.is_paused() {
            debug!("Tick skipped while paused");
            return Ok(None);
        }

        let total = self.aggregator.tick()?;
        if let Some((x, y)) = self.shared.cursor() {
            self.aggregator.record_cursor(x, y);
        }
        self.publish();
        Ok(Some(total))
    }

    pub fn stop(self) -> SamplingTicker<Stopped> {
        info!("Sampling stopped");
        self.transition()
    }

    pub fn reconfigure(self, request: ReconfigureRequest) -> SamplingTicker<Reconfiguring> {
        debug!("Stopping ticks for reconfiguration to {} ms", request.interval_ms());
        self.transition_with(request)
    }
}

impl SamplingTicker<Reconfiguring> {
    /// Applies the pending interval and lands in `Stopped`
    pub fn apply(mut self) -> Result<SamplingTicker<Stopped>, SamplingError> {
        let request = match self.get_state_data() {
            Some(request) => *request,
            None => {
                warn!("Reconfiguring without a request, keeping current interval");
                return Ok(self.transition());
            }
        };

        self.aggregator.change_interval(request.interval_ms())?;
        self.publish();
        info!("Sampling interval now {} ms", request.interval_ms());
        Ok(self.transition())
    }
}

#[derive(Debug)]
pub enum SamplerCommand {
    Start,
    Stop,
    ResetStats,
    Restore(AggregateState),
    SetBacklogs {
        graph_backlog: usize,
        cursor_backlog_ms: u64,
    },
    ChangeInterval {
        interval_ms: u64,
        response_tx: Option<oneshot::Sender<Result<(), SamplingError>>>,
    },
}

enum TickerTask {
    Stopped(SamplingTicker<Stopped>),
    Running(SamplingTicker<Running>, Interval),
}

enum LoopEvent {
    Cancelled,
    Command(Option<SamplerCommand>),
    Tick,
}

fn timer(interval_ms: u64) -> Interval {
    let period = Duration::from_millis(interval_ms);
    tokio::time::interval_at(Instant::now() + period, period)
}

fn run(ticker: SamplingTicker<Stopped>) -> TickerTask {
    let interval = timer(ticker.interval_ms());
    TickerTask::Running(ticker.start(), interval)
}

fn respond(response_tx: Option<oneshot::Sender<Result<(), SamplingError>>>, result: Result<(), SamplingError>) {
    if let Some(tx) = response_tx {
        if tx.send(result).is_err() {
            debug!("Interval change requester went away");
        }
    }
}

fn handle_command(task: TickerTask, command: SamplerCommand) -> Result<TickerTask, SamplingError> {
    debug!("Sampler command: {:?}", command);
    let task = match (task, command) {
        (TickerTask::Stopped(ticker), SamplerCommand::Start) => run(ticker),
        (TickerTask::Running(ticker, _), SamplerCommand::Start) => {
            debug!("Start while running, restarting timer");
            run(ticker.stop())
        }
        (TickerTask::Running(ticker, _), SamplerCommand::Stop) => TickerTask::Stopped(ticker.stop()),
        (task @ TickerTask::Stopped(_), SamplerCommand::Stop) => task,

        (TickerTask::Stopped(mut ticker), SamplerCommand::ResetStats) => {
            ticker.reset_stats();
            TickerTask::Stopped(ticker)
        }
        (TickerTask::Running(mut ticker, interval), SamplerCommand::ResetStats) => {
            ticker.reset_stats();
            TickerTask::Running(ticker, interval)
        }

        (TickerTask::Stopped(mut ticker), SamplerCommand::Restore(state)) => {
            ticker.restore(state);
            TickerTask::Stopped(ticker)
        }
        (TickerTask::Running(mut ticker, interval), SamplerCommand::Restore(state)) => {
            ticker.restore(state);
            TickerTask::Running(ticker, interval)
        }

        (
            TickerTask::Stopped(mut ticker),
            SamplerCommand::SetBacklogs {
                graph_backlog,
                cursor_backlog_ms,
            },
        ) => {
            ticker.set_backlogs(graph_backlog, cursor_backlog_ms);
            TickerTask::Stopped(ticker)
        }
        (
            TickerTask::Running(mut ticker, interval),
            SamplerCommand::SetBacklogs {
                graph_backlog,
                cursor_backlog_ms,
            },
        ) => {
            ticker.set_backlogs(graph_backlog, cursor_backlog_ms);
            TickerTask::Running(ticker, interval)
        }

        (
            task,
            SamplerCommand::ChangeInterval {
                interval_ms,
                response_tx,
            },
        ) => {
            let request = match ReconfigureRequest::new(interval_ms) {
                Ok(request) => request,
                Err(e) => {
                    warn!("Rejected interval change: {}", e);
                    respond(response_tx, Err(e));
                    return Ok(task);
                }
            };
            let next = match task {
                TickerTask::Stopped(ticker) => TickerTask::Stopped(ticker.reconfigure(request).apply()?),
                TickerTask::Running(ticker, _) => run(ticker.reconfigure(request).apply()?),
            };
            respond(response_tx, Ok(()));
            next
        }
    };
    Ok(task)
}

async fn run_ticker_loop(
    ticker: SamplingTicker<Stopped>,
    autostart: bool,
    mut control_rx: mpsc::UnboundedReceiver<SamplerCommand>,
    cancel: CancellationToken,
) -> Result<(), SamplingError> {
    let mut task = if autostart {
        run(ticker)
    } else {
        TickerTask::Stopped(ticker)
    };

    loop {
        let event = match &mut task {
            TickerTask::Stopped(_) => {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => LoopEvent::Cancelled,
                    command = control_rx.recv() => LoopEvent::Command(command),
                }
            }
            TickerTask::Running(_, interval) => {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => LoopEvent::Cancelled,
                    command = control_rx.recv() => LoopEvent::Command(command),
                    _ = interval.tick() => LoopEvent::Tick,
                }
            }
        };

        task = match event {
            LoopEvent::Cancelled => {
                info!("Sampler cancelled");
                break;
            }
            LoopEvent::Command(None) => {
                info!("All sampler handles dropped");
                break;
            }
            LoopEvent::Command(Some(command)) => handle_command(task, command)?,
            LoopEvent::Tick => match task {
                TickerTask::Running(mut ticker, interval) => {
                    if let Some(total) = ticker.tick()? {
                        debug!("Published {} presses in the last second", total);
                    }
                    TickerTask::Running(ticker, interval)
                }
                stopped => stopped,
            },
        };
    }

    if let TickerTask::Running(ticker, _) = task {
        ticker.stop();
    }
    Ok(())
}

/// Cloneable handle to the sampling task. Every method except
/// [`SamplerHandle::change_interval`] is synchronous and safe to call from
/// non-runtime threads.
#[derive(Clone, Debug)]
pub struct SamplerHandle {
    control_tx: mpsc::UnboundedSender<SamplerCommand>,
    snapshot_rx: watch::Receiver<SamplingSnapshot>,
    shared: Arc<SamplerShared>,
    cancel: CancellationToken,
}

impl SamplerHandle {
    /// Creates the aggregator and spawns its task on the current runtime
    pub fn spawn(settings: SamplerSettings, cancel: CancellationToken) -> Result<Self, SamplingError> {
        info!("Spawning sampler with settings: {:?}", settings);

        let shared = Arc::new(SamplerShared::default());
        let (snapshot_tx, snapshot_rx) = watch::channel(SamplingSnapshot::default());
        let ticker = SamplingTicker::create(&settings, shared.clone(), snapshot_tx)?;
        let (control_tx, control_rx) = mpsc::unbounded_channel();

        let task_cancel = cancel.clone();
        tokio::spawn(async move {
            debug!("Sampler task started");
            match run_ticker_loop(ticker, settings.autostart, control_rx, task_cancel).await {
                Ok(()) => info!("Sampler task finished"),
                Err(e) => error!("Sampler task terminated with error: {}", e),
            }
        });

        Ok(Self {
            control_tx,
            snapshot_rx,
            shared,
            cancel,
        })
    }

    fn send(&self, command: SamplerCommand) -> Result<(), SamplingError> {
        self.control_tx
            .send(command)
            .map_err(|e| SamplingError::ChannelError(format!("Sampler task is gone: {:?}", e.0)))
    }

    pub fn start(&self) -> Result<(), SamplingError> {
        self.send(SamplerCommand::Start)
    }

    pub fn stop(&self) -> Result<(), SamplingError> {
        self.send(SamplerCommand::Stop)
    }

    pub fn reset_stats(&self) -> Result<(), SamplingError> {
        self.send(SamplerCommand::ResetStats)
    }

    pub fn restore(&self, state: AggregateState) -> Result<(), SamplingError> {
        self.send(SamplerCommand::Restore(state))
    }

    pub fn set_backlogs(&self, graph_backlog: usize, cursor_backlog_ms: u64) -> Result<(), SamplingError> {
        self.send(SamplerCommand::SetBacklogs {
            graph_backlog,
            cursor_backlog_ms,
        })
    }

    /// Changes the interval and waits until the task applied it
    pub async fn change_interval(&self, interval_ms: u64) -> Result<(), SamplingError> {
        let (response_tx, response_rx) = oneshot::channel();
        self.send(SamplerCommand::ChangeInterval {
            interval_ms,
            response_tx: Some(response_tx),
        })?;
        response_rx
            .await
            .map_err(|_| SamplingError::ChannelError("Sampler dropped interval change".to_string()))?
    }

    pub fn record_press(&self) {
        self.shared.counter().increment();
    }

    pub fn pending(&self) -> u64 {
        self.shared.counter().load()
    }

    pub fn set_cursor(&self, x: i32, y: i32) {
        self.shared.set_cursor(x, y);
    }

    pub fn is_paused(&self) -> bool {
        self.shared.is_paused()
    }

    pub fn set_paused(&self, paused: bool) {
        self.shared.set_paused(paused);
    }

    pub fn toggle_pause(&self) -> bool {
        let paused = self.shared.toggle_paused();
        info!("Sampling {}", if paused { "paused" } else { "resumed" });
        paused
    }

    pub fn snapshot(&self) -> SamplingSnapshot {
        self.snapshot_rx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SamplingSnapshot> {
        self.snapshot_rx.clone()
    }

    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Resolves once the sampling task has exited
    pub async fn stopped(&self) {
        let mut rx = self.snapshot_rx.clone();
        while rx.changed().await.is_ok() {}
    }
}
