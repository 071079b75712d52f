//! Discrete-event coroutine runtime for cycle-level hardware models.
//!
//! Hardware units are written as plain `async` procedures. At each suspension
//! point a procedure awaits one of the scheduler's primitives: a [`Delay`]
//! (park for N cycles, with a tie-break priority), a sub-future (serial wait),
//! a [`TaskHandle`] (wait on a spawned task's result), a [`JoinBarrier`]
//! (fan-in over several handles), or [`yield_now`] (a fresh zero-time
//! scheduling round). The [`Simulator`] interleaves every task on one thread
//! of control and advances virtual time only when all work at the current
//! instant has settled.

mod executor;
mod join;
mod module;
mod task;
mod time;

pub use executor::{yield_now, Delay, Simulator, YieldNow, DEFAULT_PRIORITY};
pub use join::{join_all, JoinBarrier};
pub use module::{HwModule, ModuleCore};
pub use task::TaskHandle;
pub use time::{Deadline, Duration, Instant};
