//! Monitoring subsystem: liveness, the stall watchdog, global interrupts and
//! the dispatch loop that ties them to the task registry and scenarios.
//!
//! `cycle` runs one tick; `runner` wraps it in a start/stop supervisor and a
//! polling loop. `deferred` holds follow-up steps that must not run inside
//! the tick.

pub mod actions;
pub mod cycle;
pub mod deferred;
pub mod interrupt;
pub mod liveness;
pub mod page;
pub mod runner;
pub mod stall;

pub use cycle::{requires_forced_recheck, DispatchLoop, LoopState, TickOutcome, TickReport};
pub use deferred::{DeferredEffect, DeferredQueue, DeferredStep};
pub use runner::{Clock, ManualClock, RunSummary, Supervisor, SystemClock};
pub use stall::{StallCheck, StallWatchdog};
