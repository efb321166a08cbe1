use std::sync::Arc;

use api::AppState;
use axum::{routing::get, Router};
use runtime::{open_store, CandleCache, FileCandleSource, Orchestrator, SystemTimeSource};

use crate::config::Config;

pub fn build_state(config: &Config) -> AppState {
    let store = open_store(config.job_db_path.as_deref());
    let source = Arc::new(FileCandleSource::new(config.candle_dir.clone()));
    let cache = Arc::new(CandleCache::new(source, config.cache_bytes));
    let orchestrator = Orchestrator::new(
        config.orchestrator_config(),
        store,
        cache,
        Arc::new(SystemTimeSource),
    );
    AppState::new(orchestrator)
}

pub fn build_app(state: AppState) -> Router {
    api::app(state).route("/health", get(healthcheck))
}

async fn healthcheck() -> &'static str {
    "ok"
}
