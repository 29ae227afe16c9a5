//! Engine handle
//!
//! [`Engine`] owns the key registry, the command bindings and the sampler.
//! Input events enter synchronously from whatever thread the input hook
//! runs on; a single mutex around [`EventState`] serializes them against
//! each other and against configuration reloads. Reloads and interval
//! changes additionally take an async lock so the sampler and the stored
//! configuration are always updated together.
//!
//! ```text
//! InputEvent ──► Engine::handle ──► normalize ──► KeyRegistry ──► IntervalCounter
//!                      │                                                │
//!                      └──► CommandDispatcher ──► actions          (sampler task)
//! ```

mod reload;

use crate::commands::{CommandAction, CommandDispatcher};
use crate::config::{ConfigError, ConfigSource, EngineConfig, KeyEntry};
use crate::input::{normalize, DeviceClass, ExtendedCode, InputEvent, Modifiers};
use crate::keys::{KeyCount, KeyRegistry, KeyState, PressOutcome, TrackAll};
use crate::persistence::{PersistedKey, PersistedStats, PersistenceError};
use crate::sampling::{AggregateState, SamplerHandle, SamplerSettings, SamplingError, SamplingSnapshot};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub use reload::ReloadRequest;

/// Per-key counts as published to subscribers
pub type KeyCountsSnapshot = Vec<KeyCount>;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Sampling error: {0}")]
    Sampling(#[from] SamplingError),

    #[error("Persistence error: {0}")]
    Persistence(#[from] PersistenceError),

    #[error("Channel error: {0}")]
    ChannelError(String),

    #[error("Initialization error: {0}")]
    InitializationError(String),
}

/// Headline statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct StatsSnapshot {
    pub current: u64,
    pub average: f64,
    pub max: u64,
    pub total_hits: u64,
}

impl From<&SamplingSnapshot> for StatsSnapshot {
    fn from(snapshot: &SamplingSnapshot) -> Self {
        Self {
            current: snapshot.current,
            average: snapshot.average,
            max: snapshot.max,
            total_hits: snapshot.total_hits,
        }
    }
}

/// Everything the event path touches, guarded by one mutex
#[derive(Debug)]
pub struct EventState {
    registry: KeyRegistry,
    dispatcher: CommandDispatcher,
    config: EngineConfig,
}

impl EventState {
    fn from_config(config: EngineConfig) -> Self {
        let registry = KeyRegistry::from_entries(&config.keys, track_all(&config), config.key_modifier_tracking);
        let dispatcher = CommandDispatcher::from_config(&config.commands);
        Self {
            registry,
            dispatcher,
            config,
        }
    }

    /// Builds the state for `config` from this one, carrying key counts and
    /// held command keys over
    fn rebuilt(&self, config: EngineConfig) -> Self {
        let registry = self
            .registry
            .rebuild(&config.keys, track_all(&config), config.key_modifier_tracking);
        let mut dispatcher = CommandDispatcher::from_config(&config.commands);
        dispatcher.carry_over(&self.dispatcher);
        Self {
            registry,
            dispatcher,
            config,
        }
    }
}

fn track_all(config: &EngineConfig) -> TrackAll {
    TrackAll {
        keys: config.track_all_keys,
        buttons: config.track_all_buttons,
    }
}

struct EngineInner {
    state: Mutex<EventState>,
    reconfigure: tokio::sync::Mutex<()>,
    sampler: SamplerHandle,
    counts_tx: watch::Sender<KeyCountsSnapshot>,
    action_tx: mpsc::UnboundedSender<CommandAction>,
    reload_tx: mpsc::UnboundedSender<ReloadRequest>,
    source: Arc<dyn ConfigSource>,
    visible: AtomicBool,
    cancel: CancellationToken,
}

/// Cloneable handle to a running engine
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("config_source", &self.inner.source.describe())
            .field("paused", &self.is_paused())
            .finish_non_exhaustive()
    }
}

impl Engine {
    /// Validates `config`, spawns the sampler and reload worker on the
    /// current runtime and returns the engine with its action stream.
    pub fn spawn(
        config: EngineConfig,
        source: Arc<dyn ConfigSource>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<CommandAction>), EngineError> {
        config.validate()?;
        info!(
            "Initializing engine from {} ({} keys, {} ms interval)",
            source.describe(),
            config.keys.len(),
            config.update_rate_ms
        );

        let cancel = CancellationToken::new();
        let sampler = SamplerHandle::spawn(
            SamplerSettings {
                interval_ms: config.update_rate_ms,
                graph_backlog: config.graph_backlog,
                cursor_backlog_ms: config.cursor_backlog_ms,
                autostart: true,
            },
            cancel.child_token(),
        )?;

        let state = EventState::from_config(config);
        let (counts_tx, _) = watch::channel(state.registry.counts());
        let (action_tx, action_rx) = mpsc::unbounded_channel();
        let (reload_tx, reload_rx) = mpsc::unbounded_channel();

        let engine = Self {
            inner: Arc::new(EngineInner {
                state: Mutex::new(state),
                reconfigure: tokio::sync::Mutex::new(()),
                sampler,
                counts_tx,
                action_tx,
                reload_tx,
                source,
                visible: AtomicBool::new(true),
                cancel,
            }),
        };

        reload::spawn_reload_worker(engine.clone(), reload_rx);
        info!("Engine initialized");
        Ok((engine, action_rx))
    }

    fn lock(&self) -> MutexGuard<'_, EventState> {
        self.inner.state.lock().unwrap_or_else(|poisoned| {
            warn!("Engine state lock poisoned, recovering");
            poisoned.into_inner()
        })
    }

    fn publish_counts(&self, state: &EventState) {
        self.inner.counts_tx.send_replace(state.registry.counts());
    }

    /// Updates one entry of the published counts in place
    fn publish_key(&self, key: &KeyState) {
        self.inner.counts_tx.send_modify(|counts| {
            match counts.binary_search_by(|c| c.code.cmp(&key.code())) {
                Ok(i) => {
                    counts[i].count = key.count();
                    counts[i].down = key.is_down();
                }
                Err(i) => counts.insert(i, key.to_count()),
            }
        });
    }

    fn publish_down_flags(&self, registry: &KeyRegistry) {
        self.inner.counts_tx.send_modify(|counts| {
            for count in counts.iter_mut() {
                if let Some(key) = registry.get(count.code) {
                    count.down = key.is_down();
                }
            }
        });
    }

    /// Feeds one input event. Returns the command it triggered, if any.
    pub fn handle(&self, event: InputEvent) -> Option<CommandAction> {
        match event {
            InputEvent::Press {
                raw,
                device,
                modifiers,
            } => self.press(raw, device, modifiers),
            InputEvent::Release {
                raw,
                device,
                modifiers,
            } => {
                self.release(raw, device, modifiers);
                None
            }
            InputEvent::CursorMoved { x, y } => {
                self.inner.sampler.set_cursor(x, y);
                None
            }
        }
    }

    pub fn press(&self, raw: u32, device: DeviceClass, modifiers: Modifiers) -> Option<CommandAction> {
        let action = {
            let mut state = self.lock();

            if !self.inner.sampler.is_paused() {
                let code = normalize(raw, device, state.config.key_modifier_tracking, modifiers);
                match state.registry.on_press(code) {
                    PressOutcome::Counted => {
                        self.inner.sampler.record_press();
                        let chorded = code.modifiers().has_any();
                        if chorded && state.registry.modifier_tracking() {
                            self.publish_down_flags(&state.registry);
                        }
                        if let Some(key) = state.registry.get(code) {
                            self.publish_key(key);
                        }
                        debug!("Counted press of {}", code);
                    }
                    PressOutcome::Repeat => {}
                    PressOutcome::Untracked => {}
                }
            }

            // Command chords always carry modifiers
            match device {
                DeviceClass::Keyboard => state
                    .dispatcher
                    .on_key_press(normalize(raw, device, true, modifiers)),
                DeviceClass::Pointer => None,
            }
        };

        if let Some(action) = action {
            self.dispatch(action);
        }
        action
    }

    pub fn release(&self, raw: u32, device: DeviceClass, modifiers: Modifiers) {
        let mut state = self.lock();
        // Command keys re-arm even while paused so the pause key can resume
        if matches!(device, DeviceClass::Keyboard) {
            state
                .dispatcher
                .on_key_release(normalize(raw, device, true, modifiers));
        }
        if self.inner.sampler.is_paused() {
            return;
        }

        let code = normalize(raw, device, state.config.key_modifier_tracking, modifiers);
        let released = state.registry.on_release(code);
        if released > 0 {
            self.publish_down_flags(&state.registry);
            debug!("Release of {} released {} keys", code, released);
        }
    }

    /// Runs the internal effect of `action` and forwards it on the action stream
    pub fn dispatch(&self, action: CommandAction) {
        match action {
            CommandAction::ResetStats => self.reset_stats(),
            CommandAction::ResetTotals => self.reset_totals(),
            CommandAction::Exit => info!("Exit requested"),
            CommandAction::ToggleVisibility => {
                self.toggle_visibility();
            }
            CommandAction::TogglePause => {
                self.toggle_pause();
            }
            CommandAction::ReloadConfig => self.request_reload(),
        }

        if self.inner.action_tx.send(action).is_err() {
            debug!("No action listener for '{}'", action);
        }
    }

    pub fn reset_stats(&self) {
        if let Err(e) = self.inner.sampler.reset_stats() {
            warn!("Failed to reset statistics: {}", e);
        }
    }

    pub fn reset_totals(&self) {
        let mut state = self.lock();
        state.registry.reset_totals();
        self.publish_counts(&state);
        info!("Key totals reset");
    }

    pub fn toggle_pause(&self) -> bool {
        self.inner.sampler.toggle_pause()
    }

    pub fn is_paused(&self) -> bool {
        self.inner.sampler.is_paused()
    }

    pub fn toggle_visibility(&self) -> bool {
        let visible = !self.inner.visible.fetch_xor(true, Ordering::AcqRel);
        info!("Display {}", if visible { "shown" } else { "hidden" });
        visible
    }

    pub fn is_visible(&self) -> bool {
        self.inner.visible.load(Ordering::Acquire)
    }

    /// Queues a configuration reload without waiting for it
    pub fn request_reload(&self) {
        if self
            .inner
            .reload_tx
            .send(ReloadRequest { response_tx: None })
            .is_err()
        {
            warn!("Reload worker is gone, reload ignored");
        }
    }

    /// Reloads the configuration and waits for the outcome. On error the
    /// running configuration is left untouched.
    pub async fn reload(&self) -> Result<(), EngineError> {
        let (response_tx, response_rx) = oneshot::channel();
        self.inner
            .reload_tx
            .send(ReloadRequest {
                response_tx: Some(response_tx),
            })
            .map_err(|_| EngineError::ChannelError("Reload worker is gone".to_string()))?;
        response_rx
            .await
            .map_err(|_| EngineError::ChannelError("Reload worker dropped the request".to_string()))?
    }

    /// Swaps in a validated configuration. The sampler is reconfigured
    /// first; the key registry and bindings are only replaced once it
    /// accepted the change.
    pub async fn apply_config(&self, config: EngineConfig) -> Result<(), EngineError> {
        config.validate()?;
        let _reconfiguring = self.inner.reconfigure.lock().await;

        let current = self.config();
        self.reconfigure_sampler(&current, &config).await?;

        let mut state = self.lock();
        let next = state.rebuilt(config);
        *state = next;
        self.publish_counts(&state);
        info!("Configuration applied");
        Ok(())
    }

    async fn reconfigure_sampler(&self, current: &EngineConfig, next: &EngineConfig) -> Result<(), EngineError> {
        let sampler = &self.inner.sampler;
        sampler.set_backlogs(next.graph_backlog, next.cursor_backlog_ms)?;
        if current.update_rate_ms == next.update_rate_ms {
            return Ok(());
        }
        if let Err(e) = sampler.change_interval(next.update_rate_ms).await {
            if let Err(revert) = sampler.set_backlogs(current.graph_backlog, current.cursor_backlog_ms) {
                warn!("Failed to restore sampler backlogs: {}", revert);
            }
            return Err(e.into());
        }
        Ok(())
    }

    /// Changes the sampling interval, keeping every total
    pub async fn change_interval(&self, interval_ms: u64) -> Result<(), EngineError> {
        let _reconfiguring = self.inner.reconfigure.lock().await;
        self.inner.sampler.change_interval(interval_ms).await?;
        self.lock().config.update_rate_ms = interval_ms;
        Ok(())
    }

    pub fn add_key(&self, entry: KeyEntry) -> Result<(), EngineError> {
        let mut state = self.lock();
        if state.registry.get(entry.code).is_some() {
            return Err(ConfigError::Invalid(format!("key {} is already tracked", entry.code)).into());
        }
        info!("Tracking key {} ({})", entry.name, entry.code);
        state
            .registry
            .insert(KeyState::new(entry.code, entry.name.clone()).with_visibility(entry.visible));
        state.config.keys.push(entry);
        self.publish_counts(&state);
        Ok(())
    }

    pub fn remove_key(&self, code: ExtendedCode) -> bool {
        let mut state = self.lock();
        let removed = state.registry.remove(code).is_some();
        state.config.keys.retain(|entry| entry.code != code);
        if removed {
            self.publish_counts(&state);
        }
        removed
    }

    pub fn config(&self) -> EngineConfig {
        self.lock().config.clone()
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot::from(&self.inner.sampler.snapshot())
    }

    pub fn sampling_snapshot(&self) -> SamplingSnapshot {
        self.inner.sampler.snapshot()
    }

    pub fn subscribe_stats(&self) -> watch::Receiver<SamplingSnapshot> {
        self.inner.sampler.subscribe()
    }

    pub fn key_counts(&self) -> KeyCountsSnapshot {
        self.inner.counts_tx.borrow().clone()
    }

    pub fn subscribe_key_counts(&self) -> watch::Receiver<KeyCountsSnapshot> {
        self.inner.counts_tx.subscribe()
    }

    pub fn persisted_stats(&self) -> PersistedStats {
        let snapshot = self.inner.sampler.snapshot();
        let keys = self
            .lock()
            .registry
            .iter()
            .map(|key| PersistedKey {
                code: key.code(),
                name: key.name().to_string(),
                count: key.count(),
                visible: key.visible(),
            })
            .collect();

        PersistedStats {
            saved_at: Some(chrono::Local::now()),
            total: snapshot.total_hits,
            average: snapshot.average,
            maximum: snapshot.max,
            seconds: snapshot.n,
            previous: snapshot.current,
            current: self.inner.sampler.pending(),
            keys,
        }
    }

    /// Restores saved statistics. Saved keys that are neither configured nor
    /// covered by track-all are skipped.
    pub fn restore(&self, stats: &PersistedStats) -> Result<(), EngineError> {
        self.inner.sampler.restore(AggregateState {
            n: stats.seconds,
            average: stats.average,
            max: stats.maximum,
            previous: stats.previous,
            total_hits: stats.total,
            pending: stats.current,
        })?;

        let mut state = self.lock();
        let track_all = state.registry.track_all();
        for saved in &stats.keys {
            if let Some(key) = state.registry.get_mut(saved.code) {
                key.set_count(saved.count);
                continue;
            }
            if track_all.covers(saved.code) {
                let mut key = KeyState::new(saved.code, saved.name.clone()).with_visibility(saved.visible);
                key.set_count(saved.count);
                state.registry.insert(key);
            } else {
                debug!("Skipping saved key {} ({}), not tracked", saved.name, saved.code);
            }
        }
        self.publish_counts(&state);
        info!("Restored statistics for {} saved keys", stats.keys.len());
        Ok(())
    }

    pub fn shutdown(&self) {
        if !self.inner.cancel.is_cancelled() {
            info!("Shutting down engine");
        }
        self.inner.cancel.cancel();
    }

    /// Resolves once the sampler task has exited
    pub async fn stopped(&self) {
        self.inner.sampler.stopped().await;
    }

    fn cancel_token(&self) -> &CancellationToken {
        &self.inner.cancel
    }

    fn config_source(&self) -> Arc<dyn ConfigSource> {
        self.inner.source.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MemoryConfig;
    use crate::input::{VC_CONTROL, VC_SHIFT};

    const A: u32 = 0x1E;

    fn engine(config: EngineConfig) -> (Engine, mpsc::UnboundedReceiver<CommandAction>) {
        let source = Arc::new(MemoryConfig::new(config.clone()));
        Engine::spawn(config, source).unwrap()
    }

    fn config_with(keys: &[(u32, &str)]) -> EngineConfig {
        EngineConfig {
            keys: keys
                .iter()
                .map(|(raw, name)| KeyEntry {
                    name: name.to_string(),
                    code: ExtendedCode::from_raw(*raw as i32),
                    visible: true,
                })
                .collect(),
            ..EngineConfig::default()
        }
    }

    fn tap(engine: &Engine, raw: u32) {
        engine.press(raw, DeviceClass::Keyboard, Modifiers::NONE);
        engine.release(raw, DeviceClass::Keyboard, Modifiers::NONE);
    }

    #[tokio::test(start_paused = true)]
    async fn counts_tracked_presses_once() {
        let (engine, _actions) = engine(config_with(&[(A, "A")]));
        for _ in 0..5 {
            engine.press(A, DeviceClass::Keyboard, Modifiers::NONE);
        }
        engine.release(A, DeviceClass::Keyboard, Modifiers::NONE);
        tap(&engine, 0x30);

        let counts = engine.key_counts();
        assert_eq!(counts.len(), 1);
        assert_eq!(counts[0].count, 1);
        assert_eq!(engine.inner.sampler.pending(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn command_press_dispatches_and_forwards() {
        let (engine, mut actions) = engine(EngineConfig::default());
        let action = engine.press(0x14, DeviceClass::Keyboard, Modifiers::ctrl());
        assert_eq!(action, Some(CommandAction::TogglePause));
        assert!(engine.is_paused());
        assert_eq!(actions.recv().await, Some(CommandAction::TogglePause));

        // Modifier tracking is off, yet the chord still matches
        assert!(!engine.config().key_modifier_tracking);
        assert_eq!(engine.press(0x14, DeviceClass::Keyboard, Modifiers::NONE), None);
        assert_eq!(
            engine.press(0x15, DeviceClass::Keyboard, Modifiers::ctrl()),
            Some(CommandAction::ToggleVisibility)
        );
        assert!(!engine.is_visible());
    }

    #[tokio::test(start_paused = true)]
    async fn paused_engine_ignores_presses() {
        let (engine, _actions) = engine(config_with(&[(A, "A")]));
        engine.toggle_pause();
        tap(&engine, A);
        assert_eq!(engine.key_counts()[0].count, 0);
        assert_eq!(engine.inner.sampler.pending(), 0);

        engine.toggle_pause();
        tap(&engine, A);
        assert_eq!(engine.key_counts()[0].count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn reset_totals_zeroes_keys() {
        let (engine, _actions) = engine(config_with(&[(A, "A")]));
        tap(&engine, A);
        tap(&engine, A);
        assert_eq!(
            engine.press(0x17, DeviceClass::Keyboard, Modifiers::ctrl()),
            Some(CommandAction::ResetTotals)
        );
        assert_eq!(engine.key_counts()[0].count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn add_and_remove_keys() {
        let (engine, _actions) = engine(config_with(&[]));
        let code = ExtendedCode::from_raw(A as i32);
        engine
            .add_key(KeyEntry {
                name: "A".to_string(),
                code,
                visible: true,
            })
            .unwrap();
        assert!(engine
            .add_key(KeyEntry {
                name: "A again".to_string(),
                code,
                visible: true,
            })
            .is_err());
        tap(&engine, A);
        assert_eq!(engine.key_counts()[0].count, 1);
        assert!(engine.remove_key(code));
        assert!(!engine.remove_key(code));
        assert!(engine.key_counts().is_empty());
        assert!(engine.config().keys.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn pointer_buttons_never_trigger_commands() {
        let (engine, _actions) = engine(EngineConfig::default());
        assert_eq!(engine.press(0x19, DeviceClass::Pointer, Modifiers::ctrl()), None);
    }

    #[tokio::test(start_paused = true)]
    async fn held_modifier_keys_count_once_with_tracking() {
        let (engine, _actions) = engine(EngineConfig {
            key_modifier_tracking: true,
            keys: vec![
                KeyEntry {
                    name: "Ctrl".to_string(),
                    code: ExtendedCode::CTRL,
                    visible: true,
                },
                KeyEntry {
                    name: "Shift".to_string(),
                    code: ExtendedCode::LSHIFT,
                    visible: true,
                },
            ],
            ..EngineConfig::default()
        });
        let shift = Modifiers {
            ctrl: false,
            alt: false,
            shift: true,
        };
        for _ in 0..5 {
            engine.press(VC_CONTROL, DeviceClass::Keyboard, Modifiers::ctrl());
        }
        for _ in 0..5 {
            engine.press(VC_SHIFT, DeviceClass::Keyboard, shift);
        }

        let counts = engine.key_counts();
        assert!(counts.iter().all(|k| k.count == 1 && k.down));
        assert_eq!(engine.inner.sampler.pending(), 2);

        engine.release(VC_CONTROL, DeviceClass::Keyboard, Modifiers::NONE);
        engine.press(VC_CONTROL, DeviceClass::Keyboard, Modifiers::ctrl());
        let ctrl = engine.key_counts().into_iter().find(|k| k.code == ExtendedCode::CTRL);
        assert_eq!(ctrl.map(|k| k.count), Some(2));
    }

    #[tokio::test(start_paused = true)]
    async fn held_command_chord_fires_once() {
        let (engine, mut actions) = engine(EngineConfig::default());
        for _ in 0..4 {
            engine.press(0x14, DeviceClass::Keyboard, Modifiers::ctrl());
        }
        assert!(engine.is_paused());
        assert_eq!(actions.recv().await, Some(CommandAction::TogglePause));
        assert!(actions.try_recv().is_err());

        // Released while paused, the key still re-arms
        engine.release(0x14, DeviceClass::Keyboard, Modifiers::ctrl());
        assert_eq!(
            engine.press(0x14, DeviceClass::Keyboard, Modifiers::ctrl()),
            Some(CommandAction::TogglePause)
        );
        assert!(!engine.is_paused());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_sampler_update_leaves_state_untouched() {
        let config = EngineConfig {
            update_rate_ms: 100,
            ..config_with(&[(A, "A")])
        };
        let (engine, _actions) = engine(config.clone());
        tap(&engine, A);
        engine.shutdown();
        engine.stopped().await;

        let result = engine
            .apply_config(EngineConfig {
                update_rate_ms: 250,
                ..config_with(&[(0x10, "Q")])
            })
            .await;
        assert!(matches!(result, Err(EngineError::Sampling(_))));
        assert_eq!(engine.config(), config);
        let counts = engine.key_counts();
        assert_eq!(counts.len(), 1);
        assert_eq!((counts[0].name.as_str(), counts[0].count), ("A", 1));
        assert_eq!(engine.sampling_snapshot().interval_ms, 100);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_interval_change_and_reload_stay_in_step() {
        let store = MemoryConfig::new(EngineConfig {
            update_rate_ms: 250,
            ..EngineConfig::default()
        });
        let (engine, _actions) = Engine::spawn(EngineConfig::default(), Arc::new(store.clone())).unwrap();

        let (changed, reloaded) = tokio::join!(engine.change_interval(500), engine.reload());
        changed.unwrap();
        reloaded.unwrap();
        assert_eq!(engine.config().update_rate_ms, engine.sampling_snapshot().interval_ms);
    }

    #[tokio::test(start_paused = true)]
    async fn published_counts_follow_presses_in_code_order() {
        let (engine, _actions) = engine(EngineConfig {
            track_all_keys: true,
            ..config_with(&[(0x30, "B")])
        });
        let mut rx = engine.subscribe_key_counts();
        rx.borrow_and_update();

        engine.press(0x2E, DeviceClass::Keyboard, Modifiers::NONE);
        engine.press(A, DeviceClass::Keyboard, Modifiers::NONE);
        assert!(rx.has_changed().unwrap());
        let codes: Vec<ExtendedCode> = rx.borrow_and_update().iter().map(|k| k.code).collect();
        assert_eq!(
            codes,
            [A, 0x2E, 0x30].map(|raw| ExtendedCode::from_raw(raw as i32))
        );

        engine.release(A, DeviceClass::Keyboard, Modifiers::NONE);
        let published = rx.borrow_and_update().clone();
        assert_eq!(published, engine.inner.state.lock().unwrap().registry.counts());
        assert!(published.iter().any(|k| k.code == ExtendedCode::from_raw(0x2E) && k.down));
        assert!(published.iter().any(|k| k.code == ExtendedCode::from_raw(A as i32) && !k.down));
    }
}
