mod load_config;

use std::path::PathBuf;

use anyhow::{anyhow, Result};
use bitslice::{IntMatrix, ProbabilityDistribution};
use clap::{Parser, ValueEnum};
use hardware::Mmu;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use runtime::{HwModule, Simulator};

use load_config::{load_settings, SimulatorSettings};

/// Parameter set under evaluation: secret-coefficient distribution, matrix
/// dimension, and quantization width.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum Mode {
    #[value(name = "scloud")]
    Scloud,
    #[value(name = "frodo-640")]
    Frodo640,
    #[value(name = "frodo-976")]
    Frodo976,
    #[value(name = "frodo-1344")]
    Frodo1344,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum MultiplyType {
    Left,
    Right,
}

#[derive(Parser, Debug)]
#[command(
    name = "pqc-mmu-sim",
    about = "Cycle-level latency evaluation of the lattice-KEM matrix-multiply unit"
)]
struct Args {
    /// Parameter set to evaluate.
    #[arg(long, value_enum, default_value = "frodo-1344")]
    mode: Mode,

    /// Multiply direction.
    #[arg(long, value_enum, default_value = "left")]
    multiply: MultiplyType,

    /// Accumulator strategy override (double_registers, bank_ram, no_fifo,
    /// cache_registers).
    #[arg(long)]
    strategy: Option<String>,

    /// Engine count override.
    #[arg(long)]
    engines: Option<usize>,

    /// Number of sparsity-enabled sample runs.
    #[arg(long, default_value_t = 10)]
    batch: usize,

    /// RNG seed for the generated operands.
    #[arg(long, default_value_t = 42)]
    seed: u64,

    /// Optional TOML settings file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Print the module statistics tree after the last run.
    #[arg(long)]
    report: bool,
}

/// Secret-coefficient distribution of each parameter set, as percentages.
fn distribution(mode: Mode) -> Result<(ProbabilityDistribution, usize, u32)> {
    let (table, n, s_bits): (&[(i64, f64)], usize, u32) = match mode {
        Mode::Scloud => (&[(-1, 0.25), (0, 0.5), (1, 0.25)], 600, 2),
        Mode::Frodo640 => (
            &[
                (0, 14.17),
                (1, 13.30),
                (-1, 13.30),
                (2, 11.01),
                (-2, 11.01),
                (3, 8.03),
                (-3, 8.03),
                (4, 5.16),
                (-4, 5.16),
                (5, 2.93),
                (-5, 2.93),
                (6, 1.46),
                (-6, 1.46),
                (7, 0.64),
                (-7, 0.64),
                (-8, 0.25),
                (9, 0.085),
                (-9, 0.085),
                (10, 0.026),
                (-10, 0.026),
                (11, 0.006),
                (-11, 0.006),
                (12, 0.0015),
                (-12, 0.0015),
            ],
            640,
            5,
        ),
        Mode::Frodo976 => (
            &[
                (0, 17.21),
                (1, 15.68),
                (-1, 15.68),
                (2, 11.86),
                (-2, 11.86),
                (3, 7.45),
                (-3, 7.45),
                (4, 3.88),
                (-4, 3.88),
                (5, 1.68),
                (-5, 1.68),
                (6, 0.60),
                (-6, 0.60),
                (7, 0.18),
                (-7, 0.18),
                (-8, 0.044),
                (9, 0.009),
                (-9, 0.009),
                (10, 0.0015),
                (-10, 0.0015),
            ],
            976,
            5,
        ),
        Mode::Frodo1344 => (
            &[
                (0, 27.90),
                (1, 21.85),
                (-1, 21.85),
                (2, 10.49),
                (-2, 10.49),
                (3, 3.09),
                (-3, 3.09),
                (4, 0.555),
                (-4, 0.555),
                (5, 0.061),
                (-5, 0.061),
                (6, 0.003),
                (-6, 0.003),
            ],
            1344,
            5,
        ),
    };
    Ok((ProbabilityDistribution::new(table)?, n, s_bits))
}

fn uniform_matrix(rng: &mut SmallRng, rows: usize, cols: usize) -> IntMatrix {
    let mut out = IntMatrix::zeros(rows, cols);
    for r in 0..rows {
        for c in 0..cols {
            out[(r, c)] = rng.random_range(-7..8);
        }
    }
    out
}

/// One full simulation: fresh simulator and MMU, generated operands, run to
/// completion, report the modeled latency.
async fn run_once(
    settings: &SimulatorSettings,
    sparse_enable: bool,
    mode: Mode,
    multiply: MultiplyType,
    report: bool,
    rng: &mut SmallRng,
) -> Result<u64> {
    let (dist, n, s_bits) = distribution(mode)?;
    let sim = Simulator::new();
    let mmu = Mmu::new("mmu", sim.clone(), settings.mmu_config(sparse_enable)?, None);

    let handle = match multiply {
        MultiplyType::Left => {
            let s_matrix = dist.generate_matrix(n, 8, rng);
            let a_matrix = uniform_matrix(rng, 4, n);
            sim.spawn(mmu.execute_left(s_matrix, a_matrix, s_bits)?)
        }
        MultiplyType::Right => {
            let s_matrix = dist.generate_matrix(8, 4, rng);
            let a_matrix = uniform_matrix(rng, 4, n);
            sim.spawn(mmu.execute_right(s_matrix, a_matrix, s_bits)?)
        }
    };

    sim.run().await;
    let (_, latency) = handle
        .result()
        .ok_or_else(|| anyhow!("mmu operation did not complete"))?;
    if report {
        mmu.report_stats();
    }
    Ok(latency)
}

fn percentile(sorted: &[f64], p: f64) -> f64 {
    if sorted.len() == 1 {
        return sorted[0];
    }
    let rank = p / 100.0 * (sorted.len() - 1) as f64;
    let lo = rank.floor() as usize;
    let hi = rank.ceil() as usize;
    sorted[lo] + (sorted[hi] - sorted[lo]) * (rank - lo as f64)
}

fn print_summary(mode: Mode, multiply: MultiplyType, samples: &[u64], reference: u64) {
    let values: Vec<f64> = samples.iter().map(|&v| v as f64).collect();
    let mut sorted = values.clone();
    sorted.sort_by(|a, b| a.total_cmp(b));

    let mean = values.iter().sum::<f64>() / values.len() as f64;
    let variance =
        values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / values.len() as f64;

    println!("{}", "=".repeat(60));
    println!("sparse latency evaluation - {mode:?} - {multiply:?}");
    println!("{}", "=".repeat(60));
    println!("samples   : {}", samples.len());
    println!("mean      : {mean:.2} cycles");
    println!("median    : {:.2} cycles", percentile(&sorted, 50.0));
    println!("std       : {:.2} cycles", variance.sqrt());
    println!("min       : {} cycles", samples.iter().min().unwrap());
    println!("max       : {} cycles", samples.iter().max().unwrap());
    for p in [75.0, 90.0, 95.0, 99.0] {
        println!("p{p:<8} : {:.2} cycles", percentile(&sorted, p));
    }
    println!("reference : {reference} cycles (sparsity off)");
    if reference > 0 {
        println!("vs ref    : {:.2}%", 100.0 * mean / reference as f64);
    }
    println!("{}", "=".repeat(60));
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    let mut settings = load_settings(args.config.as_deref())?;
    if let Some(strategy) = &args.strategy {
        settings.accumulator_strategy = strategy.clone();
    }
    if let Some(engines) = args.engines {
        settings.n_engines = engines;
    }
    // Surface a bad strategy before the batch starts.
    settings.mmu_config(true)?;

    let mut rng = SmallRng::seed_from_u64(args.seed);

    log::info!(
        "evaluating {:?} {:?} with strategy {} over {} engines",
        args.mode,
        args.multiply,
        settings.accumulator_strategy,
        settings.n_engines
    );

    let reference = run_once(&settings, false, args.mode, args.multiply, false, &mut rng).await?;

    let mut samples = Vec::with_capacity(args.batch);
    for i in 0..args.batch {
        let report = args.report && i + 1 == args.batch;
        samples.push(run_once(&settings, true, args.mode, args.multiply, report, &mut rng).await?);
    }

    if samples.is_empty() {
        println!("reference latency: {reference} cycles (sparsity off)");
    } else {
        print_summary(args.mode, args.multiply, &samples, reference);
    }
    Ok(())
}
