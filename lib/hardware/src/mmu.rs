use std::future::Future;
use std::sync::Arc;

use anyhow::{ensure, Result};
use bitslice::IntMatrix;
use runtime::{join_all, HwModule, ModuleCore, Simulator};

use crate::engine::{Engine, EngineConfig, PE_LANES};

#[derive(Clone, Copy, Debug)]
pub struct MmuConfig {
    pub n_engines: usize,
    pub engine: EngineConfig,
}

impl Default for MmuConfig {
    fn default() -> Self {
        Self {
            n_engines: 4,
            engine: EngineConfig::default(),
        }
    }
}

/// The matrix-multiply unit: a row of engines working spatially in parallel.
///
/// An operation splits its shared dimension across the engines (zero-padding
/// each share to a multiple of the PE width), runs every engine as a
/// concurrent task, and joins on all of them. The reported latency is the
/// slowest engine's, not the sum.
pub struct Mmu {
    core: ModuleCore,
    sim: Simulator,
    engines: Vec<Arc<Engine>>,
}

impl HwModule for Mmu {
    fn core(&self) -> &ModuleCore {
        &self.core
    }
}

/// Split `total` into `parts` shares, spreading the remainder one element at
/// a time over the leading shares.
fn split_evenly(total: usize, parts: usize) -> Vec<usize> {
    let base = total / parts;
    let remainder = total % parts;
    (0..parts)
        .map(|i| base + usize::from(i < remainder))
        .collect()
}

fn padded_to_lanes(span: usize) -> usize {
    span.div_ceil(PE_LANES) * PE_LANES
}

impl Mmu {
    pub fn new(
        name: &str,
        sim: Simulator,
        config: MmuConfig,
        parent: Option<&ModuleCore>,
    ) -> Arc<Self> {
        assert!(config.n_engines > 0, "mmu needs at least one engine");
        let core = ModuleCore::new(name, parent);
        let engines: Vec<Arc<Engine>> = (0..config.n_engines)
            .map(|i| Engine::new(&format!("engine_{i}"), sim.clone(), config.engine, Some(&core)))
            .collect();
        let mmu = Arc::new(Self { core, sim, engines });
        for engine in &mmu.engines {
            mmu.core.adopt(engine.clone() as Arc<dyn HwModule>);
        }
        mmu
    }

    pub fn engines(&self) -> &[Arc<Engine>] {
        &self.engines
    }

    /// Release everything reserved so far after a partial issue failure.
    fn release(&self, issued: usize) {
        for engine in &self.engines[..issued] {
            engine.core().set_idle();
        }
        self.core.set_idle();
    }

    /// Left multiply: `a (4 x n)` times `s (n x out_cols)`, the `n` dimension
    /// split across the engines; partial products sum elementwise.
    pub fn execute_left(
        self: &Arc<Self>,
        s_matrix: IntMatrix,
        a_matrix: IntMatrix,
        s_bits: u32,
    ) -> Result<impl Future<Output = (IntMatrix, u64)> + Send + 'static> {
        ensure!(
            s_matrix.rows() == a_matrix.cols(),
            "s_matrix row count {} does not match a_matrix column count {}",
            s_matrix.rows(),
            a_matrix.cols()
        );
        ensure!(
            a_matrix.rows() == PE_LANES,
            "a_matrix must have {PE_LANES} rows, got {}",
            a_matrix.rows()
        );
        ensure!(
            self.core.try_set_busy(),
            "mmu {} is busy",
            self.core.full_name()
        );

        let n = s_matrix.rows();
        let out_cols = s_matrix.cols();
        let spans = split_evenly(n, self.engines.len());
        log::debug!(
            "{}: left multiply of n={n} split {spans:?} over {} engines",
            self.core.full_name(),
            self.engines.len()
        );

        let mut ops = Vec::with_capacity(self.engines.len());
        let mut start = 0;
        for (engine, &span) in self.engines.iter().zip(&spans) {
            let end = start + span;
            let mut a_slice = a_matrix.block(0..PE_LANES, start..end);
            let mut s_slice = s_matrix.block(start..end, 0..out_cols);
            if span % PE_LANES != 0 {
                let padded = padded_to_lanes(span);
                a_slice = a_slice.padded_cols(padded);
                s_slice = s_slice.padded_rows(padded);
            }
            match engine.execute_left(s_slice, a_slice, s_bits) {
                Ok(op) => ops.push(op),
                Err(e) => {
                    self.release(ops.len());
                    return Err(e);
                }
            }
            start = end;
        }

        let this = self.clone();
        Ok(async move {
            let handles = ops.into_iter().map(|op| this.sim.spawn(op)).collect();
            let results = join_all(handles).await;

            let mut result = IntMatrix::zeros(PE_LANES, out_cols);
            let mut max_latency = 0;
            for (partial, latency) in results {
                result.add_assign(&partial);
                max_latency = max_latency.max(latency);
            }
            this.core.set_idle();
            (result, max_latency)
        })
    }

    /// Right multiply: `s (mbar x 4)` times `a (4 x n)`, the `n` dimension
    /// split across the engines; the unpadded partial blocks concatenate
    /// left to right.
    pub fn execute_right(
        self: &Arc<Self>,
        s_matrix: IntMatrix,
        a_matrix: IntMatrix,
        s_bits: u32,
    ) -> Result<impl Future<Output = (IntMatrix, u64)> + Send + 'static> {
        ensure!(
            s_matrix.cols() == a_matrix.rows(),
            "s_matrix column count {} does not match a_matrix row count {}",
            s_matrix.cols(),
            a_matrix.rows()
        );
        ensure!(
            a_matrix.rows() == PE_LANES,
            "a_matrix must have {PE_LANES} rows, got {}",
            a_matrix.rows()
        );
        ensure!(
            self.core.try_set_busy(),
            "mmu {} is busy",
            self.core.full_name()
        );

        let n = a_matrix.cols();
        let mbar = s_matrix.rows();
        let spans = split_evenly(n, self.engines.len());
        log::debug!(
            "{}: right multiply of n={n} split {spans:?} over {} engines",
            self.core.full_name(),
            self.engines.len()
        );

        let mut ops = Vec::with_capacity(self.engines.len());
        let mut start = 0;
        for (engine, &span) in self.engines.iter().zip(&spans) {
            let end = start + span;
            let mut a_slice = a_matrix.block(0..PE_LANES, start..end);
            if span % PE_LANES != 0 {
                a_slice = a_slice.padded_cols(padded_to_lanes(span));
            }
            // Every engine consumes the same s operand.
            match engine.execute_right(s_matrix.clone(), a_slice, s_bits) {
                Ok(op) => ops.push(op),
                Err(e) => {
                    self.release(ops.len());
                    return Err(e);
                }
            }
            start = end;
        }

        let this = self.clone();
        Ok(async move {
            let handles = ops.into_iter().map(|op| this.sim.spawn(op)).collect();
            let results = join_all(handles).await;

            let mut parts = Vec::with_capacity(results.len());
            let mut max_latency = 0;
            for ((partial, latency), &span) in results.iter().zip(&spans) {
                // Strip the padded columns again.
                parts.push(partial.block(0..mbar, 0..span));
                max_latency = max_latency.max(*latency);
            }
            this.core.set_idle();
            (IntMatrix::hstack(&parts), max_latency)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitslice::ProbabilityDistribution;
    use rand::rngs::SmallRng;
    use rand::SeedableRng;
    use runtime::Instant;

    fn random_matrix(rng: &mut SmallRng, rows: usize, cols: usize, span: i64) -> IntMatrix {
        let dist = ProbabilityDistribution::new(
            &(-span..=span).map(|v| (v, 1.0)).collect::<Vec<_>>(),
        )
        .unwrap();
        dist.generate_matrix(rows, cols, rng)
    }

    fn data_config() -> MmuConfig {
        MmuConfig {
            n_engines: 4,
            engine: EngineConfig {
                data_simulate_enable: true,
                ..EngineConfig::default()
            },
        }
    }

    #[tokio::test]
    async fn left_multiply_splits_and_sums() {
        let mut rng = SmallRng::seed_from_u64(31);
        let s = random_matrix(&mut rng, 16, 8, 3);
        let a = random_matrix(&mut rng, 4, 16, 7);
        let reference = a.matmul(&s);

        let sim = Simulator::new();
        let mmu = Mmu::new("mmu", sim.clone(), data_config(), None);
        let handle = sim.spawn(mmu.execute_left(s, a, 5).unwrap());
        sim.run().await;

        let (result, latency) = handle.result().unwrap();
        assert_eq!(result, reference);
        // The engines ran concurrently: virtual time is the slowest engine,
        // and every engine saw an equal share here.
        assert_eq!(sim.now(), Instant::from_cycles(latency));
        let per_engine: Vec<u64> = mmu
            .engines()
            .iter()
            .map(|e| e.core().stat("total_latency_calculated").unwrap())
            .collect();
        assert_eq!(latency, per_engine.iter().copied().max().unwrap());
    }

    #[tokio::test]
    async fn left_multiply_pads_uneven_shares() {
        let mut rng = SmallRng::seed_from_u64(37);
        // 10 does not divide over 4 engines: shares 3,3,2,2, all padded to 4.
        let s = random_matrix(&mut rng, 10, 8, 3);
        let a = random_matrix(&mut rng, 4, 10, 7);
        let reference = a.matmul(&s);

        let sim = Simulator::new();
        let mmu = Mmu::new("mmu", sim.clone(), data_config(), None);
        let handle = sim.spawn(mmu.execute_left(s, a, 5).unwrap());
        sim.run().await;

        assert_eq!(handle.result().unwrap().0, reference);
    }

    #[tokio::test]
    async fn right_multiply_splits_and_concatenates() {
        let mut rng = SmallRng::seed_from_u64(41);
        let s = random_matrix(&mut rng, 8, 4, 1);
        let a = random_matrix(&mut rng, 4, 24, 7);
        let reference = s.matmul(&a);

        let sim = Simulator::new();
        let mmu = Mmu::new("mmu", sim.clone(), data_config(), None);
        let handle = sim.spawn(mmu.execute_right(s, a, 2).unwrap());
        sim.run().await;

        let (result, latency) = handle.result().unwrap();
        assert_eq!(result, reference);
        assert_eq!(sim.now(), Instant::from_cycles(latency));
    }

    #[tokio::test]
    async fn right_multiply_pads_uneven_shares() {
        let mut rng = SmallRng::seed_from_u64(43);
        let s = random_matrix(&mut rng, 8, 4, 1);
        let a = random_matrix(&mut rng, 4, 20, 7); // shares 5,5,5,5 -> padded to 8
        let reference = s.matmul(&a);

        let sim = Simulator::new();
        let mmu = Mmu::new("mmu", sim.clone(), data_config(), None);
        let handle = sim.spawn(mmu.execute_right(s, a, 2).unwrap());
        sim.run().await;

        assert_eq!(handle.result().unwrap().0, reference);
    }

    #[tokio::test]
    async fn busy_mmu_rejects_overlapping_operations() {
        let sim = Simulator::new();
        let mmu = Mmu::new("mmu", sim.clone(), data_config(), None);
        let first = mmu
            .execute_left(IntMatrix::zeros(16, 8), IntMatrix::zeros(4, 16), 5)
            .unwrap();
        let err = mmu
            .execute_left(IntMatrix::zeros(16, 8), IntMatrix::zeros(4, 16), 5)
            .err()
            .unwrap();
        assert!(err.to_string().contains("busy"));

        let handle = sim.spawn(first);
        sim.run().await;
        assert!(handle.done());
        assert!(!mmu.core().is_busy());
    }

    #[tokio::test]
    async fn module_tree_carries_the_engine_names() {
        let sim = Simulator::new();
        let mmu = Mmu::new("mmu", sim, data_config(), None);
        assert_eq!(mmu.core().full_name(), "mmu");
        assert_eq!(mmu.engines()[0].core().full_name(), "mmu.engine_0");
        assert_eq!(mmu.core().children().len(), 4);
    }
}
