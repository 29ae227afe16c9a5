use color_eyre::{eyre::eyre, Result};
use kps_engine::commands::CommandAction;
use kps_engine::config::{default_config_path, EngineConfig, TomlConfigFile};
use kps_engine::input::ReplaySource;
use kps_engine::{persistence, Engine};
use std::io::BufRead;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

#[tokio::main]
async fn main() -> Result<()> {
    setup()?;

    let config_path = std::env::args_os()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(default_config_path);
    info!("Using configuration file {}", config_path.display());

    let config = EngineConfig::load_or_create(&config_path)
        .await
        .map_err(|e| eyre!("Failed to load configuration: {}", e))?;
    let stats_settings = config.stats.clone();

    let (engine, mut actions) = Engine::spawn(config, Arc::new(TomlConfigFile::new(&config_path)))
        .map_err(|e| eyre!("Failed to start engine: {}", e))?;

    if let Err(e) = persistence::load_on_launch(&engine, &stats_settings).await {
        warn!("Could not load saved statistics: {}", e);
    }

    let autosave_cancel = CancellationToken::new();
    let _autosave_handle = persistence::start_autosave_task(engine.clone(), autosave_cancel.clone());

    spawn_input_reader(engine.clone())?;

    let mut stats_rx = engine.subscribe_stats();
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    info!("Reading input events from stdin");
    loop {
        tokio::select! {
            action = actions.recv() => match action {
                Some(CommandAction::Exit) | None => break,
                Some(CommandAction::ResetStats) => println!("Reset max & avg"),
                Some(CommandAction::ResetTotals) => println!("Reset key totals"),
                Some(CommandAction::TogglePause) => {
                    println!("{}", if engine.is_paused() { "Paused" } else { "Resumed" });
                }
                Some(action) => debug!("Command '{}' handled", action),
            },
            changed = stats_rx.changed() => {
                if changed.is_err() {
                    error!("Sampler stopped unexpectedly");
                    break;
                }
                let snapshot = stats_rx.borrow_and_update().clone();
                if snapshot.current != 0 {
                    let precision = engine.config().average_precision;
                    println!(
                        "Current keys per second: {} (avg {}, max {})",
                        snapshot.current,
                        snapshot.format_average(precision),
                        snapshot.max
                    );
                }
            },
            _ = &mut ctrl_c => {
                info!("Interrupted");
                break;
            }
        }
    }

    let settings = engine.config().stats;
    if let Err(e) = persistence::save_on_exit(&engine, &settings).await {
        error!("Failed to save statistics on exit: {}", e);
    }

    autosave_cancel.cancel();
    engine.shutdown();
    engine.stopped().await;
    info!("Shutdown complete");
    Ok(())
}

fn setup() -> Result<()> {
    if std::env::var("RUST_LIB_BACKTRACE").is_err() {
        std::env::set_var("RUST_LIB_BACKTRACE", "0")
    }
    color_eyre::install()?;
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info")
    }
    setup_logging_env();
    Ok(())
}

fn setup_logging_env() {
    FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .with_writer(std::io::stderr)
        .pretty()
        .init();
}

// Stands in for the OS input hook: events arrive on a plain thread
fn spawn_input_reader(engine: Engine) -> Result<()> {
    std::thread::Builder::new()
        .name("input-reader".to_string())
        .spawn(move || {
            let mut source = ReplaySource::new();
            for line in std::io::stdin().lock().lines() {
                let line = match line {
                    Ok(line) => line,
                    Err(e) => {
                        error!("Failed to read input: {}", e);
                        break;
                    }
                };
                match source.parse_line(&line) {
                    Ok(Some(event)) => {
                        engine.handle(event);
                    }
                    Ok(None) => {}
                    Err(e) => warn!("Skipping input line: {}", e),
                }
            }
            info!("Input stream closed");
        })
        .map_err(|e| eyre!("Failed to spawn input reader: {}", e))?;
    Ok(())
}
