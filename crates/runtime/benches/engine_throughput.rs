use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use core_sim::{Candle, RngAlgorithm, SeededRng};
use runtime::{BacktestEngine, BacktestSpec, CandleSet, Timeframe};

const BARS_PER_SYMBOL: usize = 5_000;
const SYMBOLS: [&str; 3] = ["BTCUSDT", "ETHUSDT", "SOLUSDT"];

fn random_walk(seed: i64) -> Vec<Candle> {
    let mut rng = SeededRng::new(seed, RngAlgorithm::Xorshift128);
    let mut close = 100.0;
    (0..BARS_PER_SYMBOL)
        .map(|i| {
            let open = close;
            close = (close * (1.0 + rng.random_normal(0.0, 0.01))).max(1.0);
            Candle {
                timestamp: i as i64 * 3_600_000,
                open,
                high: open.max(close) * 1.002,
                low: open.min(close) * 0.998,
                close,
                volume: rng.random_float(10.0, 100.0),
            }
        })
        .collect()
}

fn bench_engine_throughput(c: &mut Criterion) {
    let candles: CandleSet = SYMBOLS
        .iter()
        .enumerate()
        .map(|(i, symbol)| (symbol.to_string(), Arc::<[Candle]>::from(random_walk(i as i64 + 1))))
        .collect();
    let spec = BacktestSpec {
        symbols: SYMBOLS.iter().map(|symbol| symbol.to_string()).collect(),
        timeframe: Timeframe::H1,
        ..BacktestSpec::default()
    };

    let mut group = c.benchmark_group("engine_throughput");
    let bars = (BARS_PER_SYMBOL * SYMBOLS.len()) as u64;
    group.throughput(Throughput::Elements(bars));
    group.bench_function(BenchmarkId::new("full_backtest", bars), |b| {
        b.iter(|| {
            let engine = BacktestEngine::new("bench", &spec, &candles).expect("valid bench spec");
            black_box(engine.finish().expect("bench run completes"));
        });
    });
    group.finish();
}

criterion_group!(benches, bench_engine_throughput);
criterion_main!(benches);
