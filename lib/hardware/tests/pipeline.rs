//! End-to-end runs combining the scheduler and the hardware models.

use bitslice::{IntMatrix, ProbabilityDistribution};
use hardware::{AccumulatorStrategy, EngineConfig, Mmu, MmuConfig, ShakeUnit};
use rand::rngs::SmallRng;
use rand::SeedableRng;
use runtime::{HwModule, Instant, Simulator};

fn random_matrix(rng: &mut SmallRng, rows: usize, cols: usize, span: i64) -> IntMatrix {
    let dist =
        ProbabilityDistribution::new(&(-span..=span).map(|v| (v, 1.0)).collect::<Vec<_>>())
            .unwrap();
    dist.generate_matrix(rows, cols, rng)
}

fn config_with(strategy: AccumulatorStrategy) -> MmuConfig {
    MmuConfig {
        n_engines: 4,
        engine: EngineConfig {
            data_simulate_enable: true,
            accumulator_strategy: strategy,
            ..EngineConfig::default()
        },
    }
}

#[tokio::test]
async fn every_strategy_agrees_on_the_product() {
    let mut rng = SmallRng::seed_from_u64(101);
    let s = random_matrix(&mut rng, 24, 8, 3);
    let a = random_matrix(&mut rng, 4, 24, 7);
    let reference = a.matmul(&s);

    for strategy in [
        AccumulatorStrategy::DoubleRegisters,
        AccumulatorStrategy::BankRam,
        AccumulatorStrategy::NoFifo,
        AccumulatorStrategy::CacheRegisters,
    ] {
        let sim = Simulator::new();
        let mmu = Mmu::new("mmu", sim.clone(), config_with(strategy), None);
        let handle = sim.spawn(mmu.execute_left(s.clone(), a.clone(), 5).unwrap());
        sim.run().await;

        let (result, latency) = handle.result().unwrap();
        assert_eq!(result, reference, "strategy {strategy} computed a wrong product");
        assert!(latency > 0);
        assert_eq!(sim.now(), Instant::from_cycles(latency));
    }
}

#[tokio::test]
async fn paused_run_resumes_to_the_same_result() {
    let mut rng = SmallRng::seed_from_u64(103);
    let s = random_matrix(&mut rng, 16, 8, 3);
    let a = random_matrix(&mut rng, 4, 16, 7);
    let reference = a.matmul(&s);

    let sim = Simulator::new();
    let mmu = Mmu::new(
        "mmu",
        sim.clone(),
        config_with(AccumulatorStrategy::DoubleRegisters),
        None,
    );
    let handle = sim.spawn(mmu.execute_left(s, a, 5).unwrap());

    sim.run_until(Instant::from_cycles(1)).await;
    assert!(!handle.done());

    sim.run().await;
    let (result, latency) = handle.result().unwrap();
    assert_eq!(result, reference);
    assert_eq!(sim.now(), Instant::from_cycles(latency));
}

#[tokio::test]
async fn independent_units_share_one_timeline() {
    let mut rng = SmallRng::seed_from_u64(107);
    let s = random_matrix(&mut rng, 16, 8, 3);
    let a = random_matrix(&mut rng, 4, 16, 7);

    let sim = Simulator::new();
    let mmu = Mmu::new(
        "mmu",
        sim.clone(),
        config_with(AccumulatorStrategy::DoubleRegisters),
        None,
    );
    let shake = ShakeUnit::new("shake", sim.clone(), ShakeUnit::DEFAULT_LATENCY, false, None);

    let multiply = sim.spawn(mmu.execute_left(s, a, 5).unwrap());
    let expand = sim.spawn(shake.squeeze128(b"seed".to_vec(), 2 * 168).unwrap());
    sim.run().await;

    let (_, mmu_latency) = multiply.result().unwrap();
    assert!(expand.done());
    let shake_latency = shake.core().stat("total_permutations").unwrap() * ShakeUnit::DEFAULT_LATENCY;
    // Both units ran concurrently on the shared clock.
    assert_eq!(
        sim.now(),
        Instant::from_cycles(mmu_latency.max(shake_latency))
    );
}

#[tokio::test]
async fn sparsity_never_beats_the_dense_reference_on_correctness() {
    let mut rng = SmallRng::seed_from_u64(109);
    let dist = ProbabilityDistribution::new(&[(-1, 0.25), (0, 0.5), (1, 0.25)]).unwrap();
    let s = dist.generate_matrix(24, 8, &mut rng);
    let a = random_matrix(&mut rng, 4, 24, 7);
    let reference = a.matmul(&s);

    let mut latencies = Vec::new();
    for sparse_enable in [false, true] {
        let sim = Simulator::new();
        let mut config = config_with(AccumulatorStrategy::DoubleRegisters);
        config.engine.sparse_enable = sparse_enable;
        let mmu = Mmu::new("mmu", sim.clone(), config, None);
        let handle = sim.spawn(mmu.execute_left(s.clone(), a.clone(), 5).unwrap());
        sim.run().await;

        let (result, latency) = handle.result().unwrap();
        assert_eq!(result, reference);
        latencies.push(latency);
    }
    // Skipping all-zero bit rows can only shorten the drain.
    assert!(latencies[1] <= latencies[0]);
}
