use runtime::{JobEvent, Orchestrator};
use tokio::sync::broadcast;

#[derive(Clone)]
pub struct AppState {
    orchestrator: Orchestrator,
}

impl AppState {
    pub fn new(orchestrator: Orchestrator) -> Self {
        Self { orchestrator }
    }

    pub fn orchestrator(&self) -> &Orchestrator {
        &self.orchestrator
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<JobEvent> {
        self.orchestrator.subscribe()
    }

    /// First frame every event stream receives.
    pub fn connected_event(&self) -> JobEvent {
        JobEvent::connected(self.orchestrator.active_runs())
    }

    /// Memory-backed orchestrator over two synthetic hourly series, `AAA` and `BBB`.
    #[cfg(test)]
    pub(crate) fn for_test() -> Self {
        use std::sync::Arc;
        use std::time::Duration;

        use core_sim::Candle;
        use runtime::{
            CandleCache, MemoryCandleSource, MemoryJobStore, OrchestratorConfig, StepBudget,
            SystemTimeSource, Timeframe,
        };

        fn wave(n: usize, base: f64, period: f64) -> Vec<Candle> {
            let price = |t: f64| base * (1.0 + 0.05 * (t / period).sin() + 0.0005 * t);
            (0..n)
                .map(|i| {
                    let t = i as f64;
                    let open = price(t - 1.0);
                    let close = price(t);
                    Candle {
                        timestamp: i as i64 * 3_600_000,
                        open,
                        high: open.max(close) * 1.002,
                        low: open.min(close) * 0.998,
                        close,
                        volume: 500.0 + (t * 0.7).cos().abs() * 100.0,
                    }
                })
                .collect()
        }

        let source = MemoryCandleSource::new()
            .with("AAA", Timeframe::H1, wave(300, 100.0, 12.0))
            .with("BBB", Timeframe::H1, wave(300, 40.0, 17.0));
        let cache = Arc::new(CandleCache::new(Arc::new(source), usize::MAX));
        let config = OrchestratorConfig {
            heartbeat_interval: Duration::ZERO,
            budget: StepBudget {
                ticks: 25,
                simulations: 50,
            },
            ..OrchestratorConfig::default()
        };

        Self::new(Orchestrator::new(
            config,
            Arc::new(MemoryJobStore::new()),
            cache,
            Arc::new(SystemTimeSource),
        ))
    }
}

#[cfg(test)]
mod tests {
    use runtime::JobEvent;

    use super::AppState;

    #[tokio::test]
    async fn connected_event_reports_active_runs() {
        let state = AppState::for_test();

        assert_eq!(state.connected_event(), JobEvent::Connected { active_runs: 0 });
    }
}
