use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use core_sim::{
    Direction, MonteCarloConfig, MonteCarloSimulator, PositionId, ResamplingMethod, RngAlgorithm,
    SeededRng, Trade,
};

const TRADES: usize = 250;
const SIMULATIONS: u32 = 1_000;

fn trades() -> Vec<Trade> {
    let mut rng = SeededRng::new(99, RngAlgorithm::Mulberry32);
    (0..TRADES)
        .map(|i| Trade {
            id: PositionId(i as u64 + 1),
            symbol: "BTCUSDT".to_string(),
            direction: if i % 2 == 0 { Direction::Long } else { Direction::Short },
            entry_price: 100.0,
            exit_price: 100.0,
            size: 1.0,
            open_timestamp: i as i64,
            close_timestamp: i as i64 + 1,
            profit: rng.random_normal(20.0, 400.0),
            commission: 1.0,
        })
        .collect()
}

fn bench_monte_carlo(c: &mut Criterion) {
    let trades = trades();
    let mut group = c.benchmark_group("monte_carlo");
    group.throughput(Throughput::Elements(u64::from(SIMULATIONS)));

    for method in [ResamplingMethod::BlockBootstrap, ResamplingMethod::TradeResampling] {
        let config = MonteCarloConfig {
            simulations: SIMULATIONS,
            method,
            ..MonteCarloConfig::default()
        };
        group.bench_function(BenchmarkId::new("run", format!("{method:?}")), |b| {
            b.iter(|| {
                let simulator = MonteCarloSimulator::new(config, &trades).expect("valid bench config");
                black_box(simulator.run().expect("simulation completes"));
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_monte_carlo);
criterion_main!(benches);
