//! Cycle-level models of the accelerator's hardware units.
//!
//! Every unit is a [`runtime::HwModule`] driven by the discrete-event
//! scheduler: operations validate and reserve the unit synchronously, then
//! return a future that performs the work, occupies the unit for the modeled
//! cycle count, and resolves to the result.

mod accumulator_cache;
mod engine;
mod mmu;
mod shake;

pub use accumulator_cache::{AccumulatorCache, CacheStatistics};
pub use engine::{AccumulatorStrategy, Engine, EngineConfig, PE_LANES};
pub use mmu::{Mmu, MmuConfig};
pub use shake::{ShakeUnit, SHAKE128_RATE, SHAKE256_RATE};
