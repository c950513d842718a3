use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use tracing::info;
use wombat_config::Config;

mod generation;
mod http;
mod journal;
mod mediator;
mod prompts;
mod store;
mod trigger;

pub use generation::{DisabledGenerator, GenerationError, Generator, HttpGenerator};
pub use http::USER_HEADER;
pub use journal::{verify_journal, Journal, JournalRecord};
pub use mediator::{redacted_view, ActionOutcome, Clock, MediationError, Mediator};
pub use prompts::{
    BS_METER_FALLBACK, EMERGENCY_FALLBACK, TRANSLATION_FALLBACK, VERDICT_SENTINEL, WAGER_SENTINEL,
};
pub use store::{BackendStore, FeedEvent, ProblemFeed, ProblemStore, StoreError, WriteResult};
pub use trigger::{CheckpointTrigger, TriggerOutcome};

pub async fn serve(cfg: Config) -> Result<(), String> {
    let addr: SocketAddr = cfg
        .server
        .listen_addr
        .parse()
        .map_err(|e| format!("invalid listen_addr: {e}"))?;

    let app = build_app(cfg).await?;

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| format!("bind failed: {e}"))?;
    info!(%addr, "wombat listening");
    axum::serve(listener, app)
        .await
        .map_err(|e| format!("serve failed: {e}"))
}

pub async fn build_app(cfg: Config) -> Result<Router, String> {
    let generator = generation::from_config(&cfg.generation)?;
    build_app_with(cfg, generator).await
}

/// Wires store, journal, mediator and checkpoint trigger around `generator`.
pub async fn build_app_with(cfg: Config, generator: Arc<dyn Generator>) -> Result<Router, String> {
    let store: Arc<dyn ProblemStore> =
        Arc::new(BackendStore::from_config(&cfg.store).map_err(|e| e.to_string())?);
    let journal = Arc::new(Journal::open(&cfg.journal.jsonl_path).await?);
    let mediator = Arc::new(
        Mediator::new(
            Arc::clone(&store),
            generator,
            cfg.mediation.max_write_attempts,
        )
        .with_journal(journal),
    );

    let trigger = CheckpointTrigger::new(Arc::clone(&mediator)).with_retry(
        cfg.mediation.checkpoint_retry_attempts,
        Duration::from_millis(cfg.mediation.checkpoint_retry_backoff_ms),
    );
    tokio::spawn(Arc::new(trigger).run(store.subscribe(None)));

    Ok(http::router(http::AppState { mediator }))
}
