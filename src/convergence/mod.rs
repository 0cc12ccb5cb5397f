//! Periodic reconciliation of desired and actual state.

pub mod driver;
pub mod resolver;

pub use driver::{ConvergenceDriver, ConvergenceReport, DEFAULT_KICK_TASK_DURATION};
pub use resolver::TaskResolver;
