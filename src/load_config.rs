use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use hardware::{AccumulatorStrategy, EngineConfig, MmuConfig};
use serde::{Deserialize, Serialize};

/// Accelerator knobs loaded from a TOML file; every field falls back to the
/// hardware defaults, so a partial file (or none at all) is fine.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct SimulatorSettings {
    pub n_engines: usize,
    pub accumulator_strategy: String,
    pub bank_ram_latency: u64,
    pub num_cache_registers: usize,
    pub nbar: usize,
    pub mbar: usize,
    pub data_simulate_enable: bool,
}

impl Default for SimulatorSettings {
    fn default() -> Self {
        let engine = EngineConfig::default();
        Self {
            n_engines: MmuConfig::default().n_engines,
            accumulator_strategy: engine.accumulator_strategy.to_string(),
            bank_ram_latency: engine.bank_ram_latency,
            num_cache_registers: engine.num_cache_registers,
            nbar: engine.nbar,
            mbar: engine.mbar,
            data_simulate_enable: engine.data_simulate_enable,
        }
    }
}

impl SimulatorSettings {
    /// Resolve into an MMU configuration; sparsity is chosen per run by the
    /// test-bench, not by the settings file.
    pub fn mmu_config(&self, sparse_enable: bool) -> Result<MmuConfig> {
        let accumulator_strategy: AccumulatorStrategy = self.accumulator_strategy.parse()?;
        Ok(MmuConfig {
            n_engines: self.n_engines,
            engine: EngineConfig {
                data_simulate_enable: self.data_simulate_enable,
                accumulator_strategy,
                bank_ram_latency: self.bank_ram_latency,
                sparse_enable,
                num_cache_registers: self.num_cache_registers,
                nbar: self.nbar,
                mbar: self.mbar,
            },
        })
    }
}

pub fn load_settings(path: Option<&Path>) -> Result<SimulatorSettings> {
    let Some(path) = path else {
        return Ok(SimulatorSettings::default());
    };
    let content = fs::read_to_string(path)
        .with_context(|| format!("failed to read settings from {}", path.display()))?;
    toml::from_str(&content)
        .with_context(|| format!("failed to parse settings in {}", path.display()))
}
