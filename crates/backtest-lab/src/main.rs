mod config;
mod wiring;

use std::error::Error;
use std::fs;
use std::time::Duration;

use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

const SWEEP_INTERVAL: Duration = Duration::from_secs(10 * 60);

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = config::Config::from_env()?;
    prepare_output_dirs(&config)?;

    let state = wiring::build_state(&config);
    let recovery = state.orchestrator().recover()?;
    info!(
        resumed = recovery.resumed,
        failed = recovery.failed,
        "recovered interrupted runs"
    );
    state.orchestrator().spawn_sweeper(SWEEP_INTERVAL);

    let listener = TcpListener::bind(config.listen_addr).await?;
    info!(addr = %config.listen_addr, candles = %config.candle_dir.display(), "backtest lab listening");
    axum::serve(listener, wiring::build_app(state)).await?;
    Ok(())
}

fn prepare_output_dirs(config: &config::Config) -> Result<(), std::io::Error> {
    if let Some(parent) = config
        .job_db_path
        .as_deref()
        .and_then(|path| path.parent())
        .filter(|parent| !parent.as_os_str().is_empty())
    {
        fs::create_dir_all(parent)?;
    }
    if let Some(dir) = &config.trade_journal_dir {
        fs::create_dir_all(dir)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::prepare_output_dirs;
    use crate::config::Config;

    #[test]
    fn prepare_output_dirs_creates_database_parent_and_journal_dir() {
        let root = tempfile::tempdir().unwrap();
        let config = Config {
            job_db_path: Some(root.path().join("nested").join("jobs.sqlite3")),
            trade_journal_dir: Some(root.path().join("journals")),
            ..Config::default()
        };

        prepare_output_dirs(&config).expect("startup should create output directories");

        assert!(root.path().join("nested").is_dir());
        assert!(root.path().join("journals").is_dir());
        assert!(!root.path().join("nested").join("jobs.sqlite3").exists());
    }
}
