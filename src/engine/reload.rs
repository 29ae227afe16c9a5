//! Reload worker
//!
//! Reload requests are queued from the event path (the reload command key)
//! or from async callers. The worker reads the configuration off the
//! runtime threads and only touches the engine once the new configuration
//! parsed and validated.

use super::{Engine, EngineError};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info};

#[derive(Debug)]
pub struct ReloadRequest {
    pub response_tx: Option<oneshot::Sender<Result<(), EngineError>>>,
}

pub(super) fn spawn_reload_worker(engine: Engine, mut rx: mpsc::UnboundedReceiver<ReloadRequest>) {
    let cancel = engine.cancel_token().clone();
    tokio::spawn(async move {
        debug!("Reload worker started");
        loop {
            let request = tokio::select! {
                _ = cancel.cancelled() => break,
                request = rx.recv() => match request {
                    Some(request) => request,
                    None => break,
                },
            };

            let result = reload(&engine).await;
            if let Err(e) = &result {
                error!("Configuration reload failed, keeping current configuration: {}", e);
            }
            if let Some(response_tx) = request.response_tx {
                if response_tx.send(result).is_err() {
                    debug!("Reload requester went away");
                }
            }
        }
        debug!("Reload worker finished");
    });
}

async fn reload(engine: &Engine) -> Result<(), EngineError> {
    let source = engine.config_source();
    info!("Reloading configuration from {}", source.describe());

    let config = tokio::task::spawn_blocking(move || source.load())
        .await
        .map_err(|e| EngineError::ChannelError(format!("Reload task failed: {}", e)))??;

    engine.apply_config(config).await
}
