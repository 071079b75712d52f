use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{bail, ensure, Result};
use bitslice::{slice_matrix, IntMatrix, MatrixSlice};
use runtime::{HwModule, ModuleCore, Simulator};

use crate::accumulator_cache::AccumulatorCache;

/// Processing elements per engine; each handles one row of the input operand.
pub const PE_LANES: usize = 4;

/// How an engine accumulates bit-level partial products into output channels.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum AccumulatorStrategy {
    /// One ping-pong register pair per lane.
    #[default]
    DoubleRegisters,
    /// Accumulators in a banked RAM behind the adder tree.
    BankRam,
    /// Straight adder tree without input FIFOs (no sparsity skipping).
    NoFifo,
    /// A small shared register file with spill-on-eviction.
    CacheRegisters,
}

impl FromStr for AccumulatorStrategy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s {
            "double_registers" => Self::DoubleRegisters,
            "bank_ram" => Self::BankRam,
            "no_fifo" => Self::NoFifo,
            "cache_registers" => Self::CacheRegisters,
            other => bail!(
                "unknown accumulator strategy {other:?}, expected one of \
                 double_registers, bank_ram, no_fifo, cache_registers"
            ),
        })
    }
}

impl core::fmt::Display for AccumulatorStrategy {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(match self {
            Self::DoubleRegisters => "double_registers",
            Self::BankRam => "bank_ram",
            Self::NoFifo => "no_fifo",
            Self::CacheRegisters => "cache_registers",
        })
    }
}

#[derive(Clone, Copy, Debug)]
pub struct EngineConfig {
    /// Compute actual values alongside the timing model.
    pub data_simulate_enable: bool,
    pub accumulator_strategy: AccumulatorStrategy,
    /// Cycles per accumulator-memory access for the RAM-backed strategies.
    pub bank_ram_latency: u64,
    /// Skip all-zero bit rows.
    pub sparse_enable: bool,
    /// Register-file capacity for the cache_registers strategy.
    pub num_cache_registers: usize,
    /// Output channels of the accumulator file (left multiplies).
    pub nbar: usize,
    /// Maximum output rows of a right multiply.
    pub mbar: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            data_simulate_enable: false,
            accumulator_strategy: AccumulatorStrategy::default(),
            bank_ram_latency: 1,
            sparse_enable: true,
            num_cache_registers: 4,
            nbar: 12,
            mbar: 12,
        }
    }
}

/// Counters gathered from one cache_registers replacement walk.
struct CacheWalk {
    /// Post-flush memory accesses of a single PE's cache. The four caches see
    /// identical allocation streams and stall in lockstep, so one lane's
    /// count is the latency contribution.
    lane_memory_accesses: u64,
}

/// A bit-serial multiply-accumulate engine with four PE lanes.
///
/// Inputs arrive as bit-sliced weight rows distributed over per-bit-level
/// FIFOs; two FIFO lanes drain per cycle. The engine's operations compute the
/// exact product (optionally) and the cycle count the hardware would take,
/// then occupy the unit for exactly that long in virtual time.
pub struct Engine {
    core: ModuleCore,
    sim: Simulator,
    config: EngineConfig,
}

impl HwModule for Engine {
    fn core(&self) -> &ModuleCore {
        &self.core
    }
}

impl Engine {
    pub fn new(
        name: &str,
        sim: Simulator,
        config: EngineConfig,
        parent: Option<&ModuleCore>,
    ) -> Arc<Self> {
        let core = ModuleCore::new(name, parent);
        core.register_stat("total_latency_calculated", 0);
        core.register_stat("cache_replace_count", 0);
        core.register_stat("cache_memory_access_count", 0);
        Arc::new(Self { core, sim, config })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Distribute sliced rows into FIFO lanes: for S=5 one lane per bit
    /// position, for S=2 four lanes fed pair-interleaved. Sparsity drops
    /// all-zero rows before they ever enter a FIFO.
    fn fifo_lanes(&self, slice: &MatrixSlice, s_bits: u32) -> Vec<MatrixSlice> {
        match s_bits {
            5 => {
                debug_assert_eq!(slice.num_rows() % 5, 0);
                let mut lanes = vec![MatrixSlice::default(); 5];
                for (r, row) in slice.rows().iter().enumerate() {
                    if self.config.sparse_enable && row.popcount == 0 {
                        continue;
                    }
                    lanes[r % 5].push(row.clone());
                }
                lanes
            }
            2 => {
                debug_assert_eq!(slice.num_rows() % 2, 0);
                let mut lanes = vec![MatrixSlice::default(); 4];
                for (r, row) in slice.rows().iter().enumerate() {
                    if self.config.sparse_enable && row.popcount == 0 {
                        continue;
                    }
                    let (pair, position) = (r / 2, r % 2);
                    lanes[pair % 2 + position].push(row.clone());
                }
                lanes
            }
            _ => unreachable!("s_bits validated at the operation entry"),
        }
    }

    /// Drain model of the ping-pong register file: two rotating lanes are
    /// served per cycle until every FIFO is empty.
    fn latency_double_registers(lanes: &[MatrixSlice]) -> u64 {
        let width = lanes.len();
        let mut remaining: Vec<usize> = lanes.iter().map(|l| l.num_rows()).collect();
        let mut cnt = 0usize;
        let mut latency = 0u64;
        while remaining.iter().copied().max().unwrap_or(0) > 0 {
            latency += 1;
            let lane0 = cnt % width;
            let lane1 = (cnt + 1) % width;
            if remaining[lane0] > 0 {
                remaining[lane0] -= 1;
            }
            if remaining[lane1] > 0 {
                remaining[lane1] -= 1;
            }
            cnt += 1;
        }
        latency
    }

    fn latency_no_fifo(slice: &MatrixSlice, s_bits: u32) -> u64 {
        let lanes = if s_bits == 5 { 5 } else { 4 };
        // Two adder-tree stages on top of the row feed.
        (slice.num_rows() / lanes) as u64 + 2
    }

    fn latency(
        &self,
        lanes: &[MatrixSlice],
        slice: &MatrixSlice,
        walk: Option<&CacheWalk>,
        s_bits: u32,
    ) -> u64 {
        match self.config.accumulator_strategy {
            // The FIFO stage adds one cycle.
            AccumulatorStrategy::DoubleRegisters => Self::latency_double_registers(lanes) + 1,
            AccumulatorStrategy::BankRam => {
                Self::latency_double_registers(lanes) + self.config.bank_ram_latency + 1
            }
            AccumulatorStrategy::NoFifo => Self::latency_no_fifo(slice, s_bits),
            AccumulatorStrategy::CacheRegisters => {
                let accesses = walk.map_or(0, |w| w.lane_memory_accesses);
                Self::latency_double_registers(lanes)
                    + accesses * self.config.bank_ram_latency
                    + 1
            }
        }
    }

    /// Partial product of one bit row against one PE's operand column.
    /// The MSB plane carries the two's-complement sign and is subtracted.
    fn partial_product(row_bits: &[bool], weights: &IntMatrix, pe: usize, bit_level: u32, s_bits: u32) -> i64 {
        let mut delta = 0i64;
        for (j, &bit) in row_bits.iter().enumerate() {
            if bit {
                let part = weights[(pe, j)] << bit_level;
                if bit_level == s_bits - 1 {
                    delta -= part;
                } else {
                    delta += part;
                }
            }
        }
        delta
    }

    /// Accumulate one operand block. `weights` is the PE-lane operand
    /// (`PE_LANES x PE_LANES`); returns the `PE_LANES x nbar` accumulator and,
    /// for the cache_registers strategy, the replacement-walk counters.
    fn compute(
        &self,
        lanes: &[MatrixSlice],
        weights: &IntMatrix,
        s_bits: u32,
    ) -> (IntMatrix, Option<CacheWalk>) {
        debug_assert_eq!(weights.rows(), PE_LANES);
        debug_assert_eq!(weights.cols(), PE_LANES);

        if self.config.accumulator_strategy == AccumulatorStrategy::CacheRegisters {
            let (accumulator, walk) = self.compute_with_cache(lanes, weights, s_bits);
            return (accumulator, Some(walk));
        }

        let mut accumulator = IntMatrix::zeros(PE_LANES, self.config.nbar);
        if self.config.data_simulate_enable {
            for lane in lanes {
                for row in lane.rows() {
                    let channel = row.target_accumulator;
                    for pe in 0..PE_LANES {
                        accumulator[(pe, channel)] +=
                            Self::partial_product(&row.bits, weights, pe, row.bit_level, s_bits);
                    }
                }
            }
        }
        (accumulator, None)
    }

    /// The cache_registers strategy: each PE owns an `AccumulatorCache`
    /// narrower than the channel count. Rows are replayed bit level by bit
    /// level, most significant first; finished channels are retired after
    /// each level and everything left is harvested at the end. The walk runs
    /// even without data simulation, because its eviction counters are the
    /// latency contribution.
    fn compute_with_cache(
        &self,
        lanes: &[MatrixSlice],
        weights: &IntMatrix,
        s_bits: u32,
    ) -> (IntMatrix, CacheWalk) {
        let mut caches: Vec<AccumulatorCache> = (0..PE_LANES)
            .map(|_| {
                AccumulatorCache::new(
                    self.config.num_cache_registers,
                    s_bits,
                    self.config.sparse_enable,
                )
            })
            .collect();

        for bit_level in (0..s_bits).rev() {
            for lane in lanes {
                for row in lane.rows_at_level(bit_level) {
                    let channel = row.target_accumulator;
                    for (pe, cache) in caches.iter_mut().enumerate() {
                        let (reg_idx, _) = cache.get_or_allocate(channel, bit_level);
                        if self.config.data_simulate_enable {
                            let delta =
                                Self::partial_product(&row.bits, weights, pe, bit_level, s_bits);
                            cache.add(reg_idx, delta);
                        }
                        cache.update_progress(reg_idx, bit_level);
                    }
                }
            }
            for cache in &mut caches {
                cache.retire_completed(bit_level);
            }
        }

        let mut accumulator = IntMatrix::zeros(PE_LANES, self.config.nbar);
        for (pe, cache) in caches.iter_mut().enumerate() {
            for (channel, sum) in cache.flush_all() {
                if channel < self.config.nbar {
                    accumulator[(pe, channel)] = sum;
                }
            }
        }

        let mut replacements = 0;
        let mut accesses = 0;
        for cache in &caches {
            let stats = cache.statistics();
            replacements += stats.replace_count;
            accesses += stats.memory_access_count;
        }
        self.core.increment_stat("cache_replace_count", replacements);
        self.core.increment_stat("cache_memory_access_count", accesses);

        let walk = CacheWalk {
            lane_memory_accesses: caches[0].statistics().memory_access_count,
        };
        (accumulator, walk)
    }

    fn check_mode(&self, s_bits: u32) -> Result<()> {
        ensure!(s_bits == 2 || s_bits == 5, "s_bits must be 2 or 5, got {s_bits}");
        if self.config.accumulator_strategy == AccumulatorStrategy::CacheRegisters {
            ensure!(
                self.config.num_cache_registers > 0,
                "cache_registers strategy needs at least one register"
            );
        }
        Ok(())
    }

    /// Left multiply: `a (4 x n)` times `s (n x out_cols)`, processing `s` in
    /// 4-row blocks. Validates and reserves the unit synchronously; the
    /// returned future performs the operation, holds the unit busy for the
    /// modeled cycle count, and resolves to `(product, latency)`.
    pub fn execute_left(
        self: &Arc<Self>,
        s_matrix: IntMatrix,
        a_matrix: IntMatrix,
        s_bits: u32,
    ) -> Result<impl Future<Output = (IntMatrix, u64)> + Send + 'static> {
        self.check_mode(s_bits)?;
        ensure!(
            s_matrix.cols() <= self.config.nbar,
            "s_matrix has {} output channels but the accumulator file holds {}",
            s_matrix.cols(),
            self.config.nbar
        );
        ensure!(
            s_matrix.rows() % PE_LANES == 0,
            "s_matrix row count {} is not a multiple of {PE_LANES}",
            s_matrix.rows()
        );
        ensure!(
            a_matrix.rows() == PE_LANES,
            "a_matrix must have {PE_LANES} rows, got {}",
            a_matrix.rows()
        );
        ensure!(
            a_matrix.cols() == s_matrix.rows(),
            "a_matrix column count {} does not match s_matrix row count {}",
            a_matrix.cols(),
            s_matrix.rows()
        );
        ensure!(
            self.core.try_set_busy(),
            "engine {} is busy",
            self.core.full_name()
        );

        let this = self.clone();
        Ok(async move {
            let out_cols = s_matrix.cols();
            let mut result = IntMatrix::zeros(PE_LANES, out_cols);
            let mut latency = 0u64;

            for block in 0..s_matrix.rows() / PE_LANES {
                let s_block = s_matrix
                    .block(block * PE_LANES..(block + 1) * PE_LANES, 0..out_cols)
                    .transpose();
                let weights =
                    a_matrix.block(0..PE_LANES, block * PE_LANES..(block + 1) * PE_LANES);
                let slice = slice_matrix(&s_block, s_bits);
                let lanes = this.fifo_lanes(&slice, s_bits);

                let (accumulator, walk) = this.compute(&lanes, &weights, s_bits);
                let block_latency = this.latency(&lanes, &slice, walk.as_ref(), s_bits);
                result.add_assign(&accumulator.block(0..PE_LANES, 0..out_cols));
                // One cycle to slice, one to update the operand.
                latency += block_latency + 2;
            }

            log::trace!(
                "{}: left multiply took {latency} cycles",
                this.core.full_name()
            );
            this.core.increment_stat("total_latency_calculated", latency);
            this.sim.delay(latency).await;
            this.core.set_idle();
            (result, latency)
        })
    }

    /// Right multiply: `s (mbar x 4)` times `a (4 x n)`, processing `a` in
    /// 4-column blocks against the shared `s` slice.
    pub fn execute_right(
        self: &Arc<Self>,
        s_matrix: IntMatrix,
        a_matrix: IntMatrix,
        s_bits: u32,
    ) -> Result<impl Future<Output = (IntMatrix, u64)> + Send + 'static> {
        self.check_mode(s_bits)?;
        ensure!(
            s_matrix.rows() <= self.config.mbar && s_matrix.rows() <= self.config.nbar,
            "s_matrix has {} output rows but the engine supports {}",
            s_matrix.rows(),
            self.config.mbar.min(self.config.nbar)
        );
        ensure!(
            s_matrix.cols() == PE_LANES,
            "s_matrix must have {PE_LANES} columns, got {}",
            s_matrix.cols()
        );
        ensure!(
            a_matrix.rows() == PE_LANES,
            "a_matrix must have {PE_LANES} rows, got {}",
            a_matrix.rows()
        );
        ensure!(
            a_matrix.cols() % PE_LANES == 0,
            "a_matrix column count {} is not a multiple of {PE_LANES}",
            a_matrix.cols()
        );
        ensure!(
            self.core.try_set_busy(),
            "engine {} is busy",
            self.core.full_name()
        );

        let this = self.clone();
        Ok(async move {
            let mbar = s_matrix.rows();
            let width = a_matrix.cols();
            // Accumulated transposed: one 4-column block of the product per
            // round, flipped once at the end.
            let mut result_t = IntMatrix::zeros(width, mbar);
            let mut latency = 0u64;

            let slice = slice_matrix(&s_matrix, s_bits);
            let lanes = this.fifo_lanes(&slice, s_bits);

            for block in 0..width / PE_LANES {
                let weights = a_matrix
                    .block(0..PE_LANES, block * PE_LANES..(block + 1) * PE_LANES)
                    .transpose();
                let (accumulator, walk) = this.compute(&lanes, &weights, s_bits);
                let block_latency = this.latency(&lanes, &slice, walk.as_ref(), s_bits);
                for pe in 0..PE_LANES {
                    for channel in 0..mbar {
                        result_t[(block * PE_LANES + pe, channel)] = accumulator[(pe, channel)];
                    }
                }
                latency += block_latency + 2;
            }

            log::trace!(
                "{}: right multiply took {latency} cycles",
                this.core.full_name()
            );
            this.core.increment_stat("total_latency_calculated", latency);
            this.sim.delay(latency).await;
            this.core.set_idle();
            (result_t.transpose(), latency)
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

    fn engine_with(config: EngineConfig) -> (Simulator, Arc<Engine>) {
        let sim = Simulator::new();
        let engine = Engine::new("engine", sim.clone(), config, None);
        (sim, engine)
    }

    #[tokio::test]
    async fn left_multiply_matches_reference() {
        let mut rng = SmallRng::seed_from_u64(7);
        let s = random_matrix(&mut rng, 8, 8, 3);
        let a = random_matrix(&mut rng, 4, 8, 7);
        let reference = a.matmul(&s);

        let (sim, engine) = engine_with(EngineConfig {
            data_simulate_enable: true,
            sparse_enable: false,
            ..EngineConfig::default()
        });
        let handle = sim.spawn(engine.execute_left(s, a, 5).unwrap());
        sim.run().await;

        let (result, latency) = handle.result().unwrap();
        assert_eq!(result, reference);
        assert!(latency > 0);
        assert_eq!(sim.now(), Instant::from_cycles(latency));
        assert_eq!(engine.core().stat("total_latency_calculated"), Some(latency));
    }

    #[tokio::test]
    async fn right_multiply_matches_reference() {
        let mut rng = SmallRng::seed_from_u64(11);
        let s = random_matrix(&mut rng, 8, 4, 1);
        let a = random_matrix(&mut rng, 4, 8, 7);
        let reference = s.matmul(&a);

        let (sim, engine) = engine_with(EngineConfig {
            data_simulate_enable: true,
            ..EngineConfig::default()
        });
        let handle = sim.spawn(engine.execute_right(s, a, 2).unwrap());
        sim.run().await;

        let (result, _) = handle.result().unwrap();
        assert_eq!(result, reference);
    }

    #[tokio::test]
    async fn cache_strategy_computes_the_same_product() {
        let mut rng = SmallRng::seed_from_u64(23);
        let s = random_matrix(&mut rng, 8, 8, 3);
        let a = random_matrix(&mut rng, 4, 8, 7);
        let reference = a.matmul(&s);

        let (sim, engine) = engine_with(EngineConfig {
            data_simulate_enable: true,
            accumulator_strategy: AccumulatorStrategy::CacheRegisters,
            num_cache_registers: 4,
            ..EngineConfig::default()
        });
        let handle = sim.spawn(engine.execute_left(s, a, 5).unwrap());
        sim.run().await;

        let (result, _) = handle.result().unwrap();
        assert_eq!(result, reference);
        // Eight channels through four registers: the walk must have spilled.
        assert!(engine.core().stat("cache_memory_access_count").unwrap() > 0);
        assert!(engine.core().stat("cache_replace_count").unwrap() > 0);
    }

    #[tokio::test]
    async fn no_fifo_latency_is_the_row_feed_plus_adder_tree() {
        // One 4-row block of an 8-channel operand: 8 * 5 = 40 sliced rows,
        // 40 / 5 + 2 = 10 cycles, plus 2 per-block cycles.
        let s = IntMatrix::zeros(4, 8);
        let a = IntMatrix::zeros(4, 4);
        let (sim, engine) = engine_with(EngineConfig {
            accumulator_strategy: AccumulatorStrategy::NoFifo,
            sparse_enable: false,
            ..EngineConfig::default()
        });
        let handle = sim.spawn(engine.execute_left(s, a, 5).unwrap());
        sim.run().await;
        let (_, latency) = handle.result().unwrap();
        assert_eq!(latency, 12);
        assert_eq!(sim.now(), Instant::from_cycles(12));
    }

    #[tokio::test]
    async fn double_register_latency_drains_two_lanes_per_cycle() {
        // Dense 4x8 block: five lanes of 8 rows each, two lanes served per
        // cycle in rotation -> 20 cycles, +1 FIFO, +2 per block.
        let mut rng = SmallRng::seed_from_u64(3);
        let s = random_matrix(&mut rng, 4, 8, 3);
        let a = random_matrix(&mut rng, 4, 4, 7);
        let (sim, engine) = engine_with(EngineConfig {
            sparse_enable: false,
            ..EngineConfig::default()
        });
        let handle = sim.spawn(engine.execute_left(s, a, 5).unwrap());
        sim.run().await;
        let (_, latency) = handle.result().unwrap();
        assert_eq!(latency, 23);
    }

    #[tokio::test]
    async fn sparsity_shortens_the_drain() {
        let s = IntMatrix::zeros(4, 8); // every bit row is all-zero
        let a = IntMatrix::zeros(4, 4);
        let (sim, engine) = engine_with(EngineConfig {
            sparse_enable: true,
            ..EngineConfig::default()
        });
        let handle = sim.spawn(engine.execute_left(s, a, 5).unwrap());
        sim.run().await;
        let (_, latency) = handle.result().unwrap();
        // Nothing to drain: only the FIFO cycle and the per-block overhead.
        assert_eq!(latency, 3);
    }

    #[tokio::test]
    async fn busy_engine_rejects_a_second_operation() {
        let (sim, engine) = engine_with(EngineConfig::default());
        let first = engine
            .execute_left(IntMatrix::zeros(4, 8), IntMatrix::zeros(4, 4), 5)
            .unwrap();
        let err = engine
            .execute_left(IntMatrix::zeros(4, 8), IntMatrix::zeros(4, 4), 5)
            .err()
            .unwrap();
        assert!(err.to_string().contains("busy"));

        let handle = sim.spawn(first);
        sim.run().await;
        assert!(handle.done());
        // Idle again after completion.
        assert!(engine
            .execute_left(IntMatrix::zeros(4, 8), IntMatrix::zeros(4, 4), 5)
            .is_ok());
    }

    #[tokio::test]
    async fn shape_violations_fail_fast() {
        let (_sim, engine) = engine_with(EngineConfig::default());
        // Row count not a multiple of the PE lanes.
        assert!(engine
            .execute_left(IntMatrix::zeros(6, 8), IntMatrix::zeros(4, 6), 5)
            .is_err());
        // Mismatched inner dimension.
        assert!(engine
            .execute_left(IntMatrix::zeros(8, 8), IntMatrix::zeros(4, 4), 5)
            .is_err());
        // Unsupported quantization width.
        assert!(engine
            .execute_left(IntMatrix::zeros(8, 8), IntMatrix::zeros(4, 8), 3)
            .is_err());
        // Too many output channels for the accumulator file.
        assert!(engine
            .execute_left(IntMatrix::zeros(8, 16), IntMatrix::zeros(4, 8), 5)
            .is_err());
        // The failed checks must not leave the unit reserved.
        assert!(!engine.core().is_busy());
    }
}
