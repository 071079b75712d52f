use std::future::Future;
use std::sync::Arc;

use anyhow::{ensure, Result};
use runtime::{HwModule, ModuleCore, Simulator};
use sha3::digest::{ExtendableOutput, Update, XofReader};
use sha3::{Shake128, Shake256};

/// SHAKE-128 sponge rate in bytes.
pub const SHAKE128_RATE: usize = 168;
/// SHAKE-256 sponge rate in bytes.
pub const SHAKE256_RATE: usize = 136;

/// SHAKE XOF hardware model.
///
/// Timing is one fixed latency per Keccak permutation; absorbing `m` bytes
/// and squeezing `n` costs `ceil((m+1)/rate) + ceil(n/rate) - 1` permutations
/// (the first output block falls out of the final absorb permutation). The
/// digest itself comes from the external `sha3` library when data simulation
/// is on, otherwise the output is zeroed filler of the right length.
pub struct ShakeUnit {
    core: ModuleCore,
    sim: Simulator,
    latency_per_permutation: u64,
    data_simulate_enable: bool,
}

impl HwModule for ShakeUnit {
    fn core(&self) -> &ModuleCore {
        &self.core
    }
}

impl ShakeUnit {
    pub const DEFAULT_LATENCY: u64 = 24;

    pub fn new(
        name: &str,
        sim: Simulator,
        latency_per_permutation: u64,
        data_simulate_enable: bool,
        parent: Option<&ModuleCore>,
    ) -> Arc<Self> {
        let core = ModuleCore::new(name, parent);
        core.register_stat("total_permutations", 0);
        core.register_stat("total_bytes_squeezed", 0);
        Arc::new(Self {
            core,
            sim,
            latency_per_permutation,
            data_simulate_enable,
        })
    }

    fn permutations(input_len: usize, output_len: usize, rate: usize) -> u64 {
        let absorb = (input_len + 1).div_ceil(rate).max(1);
        let squeeze = output_len.div_ceil(rate);
        (absorb + squeeze.saturating_sub(1)) as u64
    }

    /// Absorb `input` and squeeze `output_len` bytes through SHAKE-128.
    pub fn squeeze128(
        self: &Arc<Self>,
        input: Vec<u8>,
        output_len: usize,
    ) -> Result<impl Future<Output = Vec<u8>> + Send + 'static> {
        self.squeeze(input, output_len, SHAKE128_RATE, |input, out| {
            let mut hasher = Shake128::default();
            hasher.update(input);
            hasher.finalize_xof().read(out);
        })
    }

    /// Absorb `input` and squeeze `output_len` bytes through SHAKE-256.
    pub fn squeeze256(
        self: &Arc<Self>,
        input: Vec<u8>,
        output_len: usize,
    ) -> Result<impl Future<Output = Vec<u8>> + Send + 'static> {
        self.squeeze(input, output_len, SHAKE256_RATE, |input, out| {
            let mut hasher = Shake256::default();
            hasher.update(input);
            hasher.finalize_xof().read(out);
        })
    }

    fn squeeze(
        self: &Arc<Self>,
        input: Vec<u8>,
        output_len: usize,
        rate: usize,
        digest: impl Fn(&[u8], &mut [u8]) + Send + 'static,
    ) -> Result<impl Future<Output = Vec<u8>> + Send + 'static> {
        ensure!(
            self.core.try_set_busy(),
            "shake unit {} is busy",
            self.core.full_name()
        );

        let this = self.clone();
        Ok(async move {
            let permutations = Self::permutations(input.len(), output_len, rate);
            log::trace!(
                "{}: {} byte squeeze, {permutations} permutations",
                this.core.full_name(),
                output_len
            );
            this.core.increment_stat("total_permutations", permutations);
            this.core
                .increment_stat("total_bytes_squeezed", output_len as u64);
            this.sim
                .delay(permutations * this.latency_per_permutation)
                .await;

            let mut output = vec![0u8; output_len];
            if this.data_simulate_enable {
                digest(&input, &mut output);
            }
            this.core.set_idle();
            output
        })
    }
}
