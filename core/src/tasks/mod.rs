//! Task tracking: classification, lifecycle and dispatch priority.

pub mod classify;
pub mod priority;
pub mod registry;

pub use priority::PendingOp;
pub use registry::{TaskRegistry, TaskSnapshot, UpdateReport, TASK_ID_ATTR};
