use kps_engine::commands::CommandAction;
use kps_engine::config::{CommandKeySpec, EngineConfig, KeyEntry, MemoryConfig};
use kps_engine::input::{normalize, DeviceClass, ExtendedCode, Modifiers, ReplaySource};
use kps_engine::sampling::SamplingSnapshot;
use kps_engine::Engine;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};

const A: u32 = 0x1E;
const B: u32 = 0x30;
const C: u32 = 0x2E;

fn key(code: ExtendedCode, name: &str) -> KeyEntry {
    KeyEntry {
        name: name.to_string(),
        code,
        visible: true,
    }
}

fn plain(raw: u32) -> ExtendedCode {
    ExtendedCode::from_raw(raw as i32)
}

fn ctrl_chord(raw: u32) -> ExtendedCode {
    normalize(raw, DeviceClass::Keyboard, true, Modifiers::ctrl())
}

fn start(config: EngineConfig) -> (Engine, mpsc::UnboundedReceiver<CommandAction>) {
    let source = Arc::new(MemoryConfig::new(config.clone()));
    Engine::spawn(config, source).unwrap()
}

fn replay(engine: &Engine, source: &mut ReplaySource, lines: &[&str]) -> Vec<CommandAction> {
    lines
        .iter()
        .filter_map(|line| source.parse_line(line).unwrap())
        .filter_map(|event| engine.handle(event))
        .collect()
}

fn tap(engine: &Engine, raw: u32, times: u64) {
    for _ in 0..times {
        engine.press(raw, DeviceClass::Keyboard, Modifiers::NONE);
        engine.release(raw, DeviceClass::Keyboard, Modifiers::NONE);
    }
}

async fn next_snapshot(rx: &mut watch::Receiver<SamplingSnapshot>) -> SamplingSnapshot {
    rx.changed().await.unwrap();
    rx.borrow_and_update().clone()
}

fn count_of(engine: &Engine, code: ExtendedCode) -> Option<(u64, bool)> {
    engine
        .key_counts()
        .into_iter()
        .find(|k| k.code == code)
        .map(|k| (k.count, k.down))
}

#[tokio::test(start_paused = true)]
async fn two_presses_in_one_second_interval() {
    let (engine, _actions) = start(EngineConfig {
        update_rate_ms: 1000,
        keys: vec![key(plain(A), "A")],
        ..EngineConfig::default()
    });
    let mut rx = engine.subscribe_stats();
    rx.borrow_and_update();

    tap(&engine, A, 2);
    let snapshot = next_snapshot(&mut rx).await;
    assert_eq!(snapshot.current, 2);
    assert_eq!(snapshot.max, 2);
    assert_eq!(snapshot.average, 2.0);
    assert_eq!(snapshot.n, 1);

    let stats = engine.snapshot();
    assert_eq!(stats.current, 2);
    assert_eq!(stats.total_hits, 2);
}

#[tokio::test(start_paused = true)]
async fn window_spans_one_second_at_200ms() {
    let (engine, _actions) = start(EngineConfig {
        update_rate_ms: 200,
        keys: vec![key(plain(A), "A")],
        ..EngineConfig::default()
    });
    let mut rx = engine.subscribe_stats();
    rx.borrow_and_update();

    let mut last = SamplingSnapshot::default();
    for count in [3, 0, 2, 0, 1] {
        tap(&engine, A, count);
        last = next_snapshot(&mut rx).await;
    }
    assert_eq!(last.current, 6);
    assert_eq!(last.window, 5);
    assert_eq!(count_of(&engine, plain(A)), Some((6, false)));
}

#[tokio::test(start_paused = true)]
async fn idle_intervals_keep_average() {
    let (engine, _actions) = start(EngineConfig {
        keys: vec![key(plain(A), "A")],
        ..EngineConfig::default()
    });
    let mut rx = engine.subscribe_stats();
    rx.borrow_and_update();

    tap(&engine, A, 3);
    let busy = next_snapshot(&mut rx).await;
    for _ in 0..4 {
        next_snapshot(&mut rx).await;
    }
    let idle = engine.sampling_snapshot();
    assert_eq!(idle.current, 0);
    assert_eq!(idle.n, busy.n);
    assert_eq!(idle.average, busy.average);
    assert_eq!(idle.ticks, busy.ticks + 4);
}

#[tokio::test(start_paused = true)]
async fn releasing_ctrl_releases_every_ctrl_chord() {
    let chords = [ctrl_chord(A), ctrl_chord(B), ctrl_chord(C)];
    let mut keys: Vec<KeyEntry> = chords.iter().map(|c| key(*c, "chord")).collect();
    keys.push(key(ExtendedCode::CTRL, "Ctrl"));
    let (engine, _actions) = start(EngineConfig {
        key_modifier_tracking: true,
        keys,
        ..EngineConfig::default()
    });

    let mut source = ReplaySource::new();
    replay(
        &engine,
        &mut source,
        &["press key 0x1D", "press key 0x1E", "press key 0x30", "press key 0x2E"],
    );
    for chord in chords {
        assert_eq!(count_of(&engine, chord), Some((1, true)));
    }

    replay(&engine, &mut source, &["release key 0x1D"]);
    for chord in chords {
        assert_eq!(count_of(&engine, chord), Some((1, false)));
    }
    assert_eq!(count_of(&engine, ExtendedCode::CTRL), Some((1, false)));
}

#[tokio::test(start_paused = true)]
async fn releasing_ctrl_without_tracking_only_releases_ctrl() {
    let (engine, _actions) = start(EngineConfig {
        key_modifier_tracking: false,
        keys: vec![key(plain(0x1D), "Ctrl"), key(plain(A), "A"), key(plain(B), "B")],
        ..EngineConfig::default()
    });

    let mut source = ReplaySource::new();
    replay(
        &engine,
        &mut source,
        &["press key 0x1D", "press key 0x1E", "press key 0x30", "release key 0x1D"],
    );
    assert_eq!(count_of(&engine, plain(0x1D)), Some((1, false)));
    assert_eq!(count_of(&engine, plain(A)), Some((1, true)));
    assert_eq!(count_of(&engine, plain(B)), Some((1, true)));
}

#[tokio::test(start_paused = true)]
async fn key_repeat_counts_once() {
    let (engine, _actions) = start(EngineConfig {
        keys: vec![key(plain(A), "A")],
        ..EngineConfig::default()
    });
    let mut source = ReplaySource::new();
    let repeats = ["press key 0x1E"; 25];
    replay(&engine, &mut source, &repeats);
    replay(&engine, &mut source, &["release key 0x1E"]);
    assert_eq!(count_of(&engine, plain(A)), Some((1, false)));
}

#[tokio::test(start_paused = true)]
async fn shared_binding_fires_highest_priority_only() {
    let shared = CommandKeySpec::ctrl(A);
    let mut config = EngineConfig::default();
    config.commands.exit = shared;
    config.commands.reset_stats = shared;
    config.commands.toggle_pause = shared;
    let (engine, mut actions) = start(config);

    let mut source = ReplaySource::new();
    let fired = replay(&engine, &mut source, &["press key 0x1D", "press key 0x1E"]);
    assert_eq!(fired, vec![CommandAction::ResetStats]);
    assert_eq!(actions.recv().await, Some(CommandAction::ResetStats));
    assert!(actions.try_recv().is_err());
    assert!(!engine.is_paused());
}

#[tokio::test(start_paused = true)]
async fn pause_key_freezes_counting_and_sampling() {
    let (engine, _actions) = start(EngineConfig {
        keys: vec![key(plain(A), "A")],
        ..EngineConfig::default()
    });
    let mut rx = engine.subscribe_stats();
    rx.borrow_and_update();

    let mut source = ReplaySource::new();
    let fired = replay(
        &engine,
        &mut source,
        &["press key 0x1D", "press key 0x14", "release key 0x14", "release key 0x1D"],
    );
    assert_eq!(fired, vec![CommandAction::TogglePause]);
    assert!(engine.is_paused());

    tap(&engine, A, 4);
    tokio::time::sleep(std::time::Duration::from_millis(3500)).await;
    assert_eq!(engine.sampling_snapshot().ticks, 0);
    assert_eq!(count_of(&engine, plain(A)), Some((0, false)));

    replay(&engine, &mut source, &["press key 0x1D", "press key 0x14"]);
    assert!(!engine.is_paused());
    tap(&engine, A, 1);
    let snapshot = next_snapshot(&mut rx).await;
    assert_eq!(snapshot.current, 1);
}

#[tokio::test(start_paused = true)]
async fn reset_stats_key_clears_aggregates_but_not_totals() {
    let (engine, mut actions) = start(EngineConfig {
        keys: vec![key(plain(A), "A")],
        graph_backlog: 5,
        ..EngineConfig::default()
    });
    let mut rx = engine.subscribe_stats();
    rx.borrow_and_update();

    tap(&engine, A, 5);
    let busy = next_snapshot(&mut rx).await;
    assert_eq!(busy.max, 5);
    assert_eq!(busy.graph, vec![5]);

    assert_eq!(
        engine.press(0x19, DeviceClass::Keyboard, Modifiers::ctrl()),
        Some(CommandAction::ResetStats)
    );
    assert_eq!(actions.recv().await, Some(CommandAction::ResetStats));
    let reset = next_snapshot(&mut rx).await;
    assert_eq!((reset.max, reset.n, reset.total_hits), (0, 0, 0));
    assert!(reset.graph.is_empty());
    assert_eq!(count_of(&engine, plain(A)), Some((5, false)));
}

#[tokio::test(start_paused = true)]
async fn track_all_buttons_counts_any_button() {
    let (engine, _actions) = start(EngineConfig {
        track_all_buttons: true,
        keys: vec![],
        ..EngineConfig::default()
    });
    let mut source = ReplaySource::new();
    replay(
        &engine,
        &mut source,
        &["press mouse 1", "release mouse 1", "press mouse 2", "press key 0x1E"],
    );
    let counts = engine.key_counts();
    assert_eq!(counts.len(), 2);
    assert!(counts.iter().all(|k| k.code.is_pointer() && k.count == 1));
}

#[tokio::test(start_paused = true)]
async fn cursor_trail_follows_motion() {
    let (engine, _actions) = start(EngineConfig {
        update_rate_ms: 100,
        cursor_backlog_ms: 300,
        ..EngineConfig::default()
    });
    let mut rx = engine.subscribe_stats();
    rx.borrow_and_update();

    let mut source = ReplaySource::new();
    for i in 0..6 {
        let line = format!("move {} {}", i * 10, i);
        replay(&engine, &mut source, &[line.as_str()]);
        next_snapshot(&mut rx).await;
    }
    let trail = engine.sampling_snapshot().cursor_trail;
    assert_eq!(trail.first().map(|s| (s.x, s.y)), Some((50, 5)));
    assert!(trail.len() <= 4);
}

#[tokio::test(start_paused = true)]
async fn interval_change_preserves_totals() {
    let (engine, _actions) = start(EngineConfig {
        update_rate_ms: 100,
        keys: vec![key(plain(A), "A")],
        ..EngineConfig::default()
    });
    let mut rx = engine.subscribe_stats();
    rx.borrow_and_update();

    for _ in 0..20 {
        tap(&engine, A, 1);
        next_snapshot(&mut rx).await;
    }
    let before = engine.sampling_snapshot();
    assert_eq!(before.total_hits, 20);

    engine.change_interval(500).await.unwrap();
    let after = engine.sampling_snapshot();
    assert_eq!(after.total_hits, before.total_hits);
    assert_eq!(after.max, before.max);
    assert_eq!(after.average, before.average);
    assert_eq!(after.n, before.n * 100 / 500);
    assert_eq!(after.window, 2);
    assert_eq!(engine.config().update_rate_ms, 500);
    assert_eq!(count_of(&engine, plain(A)), Some((20, false)));

    assert!(engine.change_interval(0).await.is_err());
    assert_eq!(engine.config().update_rate_ms, 500);
}

#[tokio::test(start_paused = true)]
async fn shutdown_is_idempotent() {
    let (engine, _actions) = start(EngineConfig::default());
    engine.shutdown();
    engine.shutdown();
    engine.stopped().await;
    let clone = engine.clone();
    std::thread::spawn(move || clone.shutdown()).join().unwrap();
}
