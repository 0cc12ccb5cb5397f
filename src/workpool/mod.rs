//! Bounded-concurrency delivery of task completion callbacks.
//!
//! - [`client`] - Callback transport and failure classification
//! - [`pool`] - Fixed worker set, bounded queue, retry with backoff

pub mod client;
pub mod pool;

pub use client::{CallbackClient, DeliveryError, HttpCallbackClient};
pub use pool::{
    CallbackJob, CallbackWorkPool, CompletionHandler, PoolStats, SubmissionPolicy, WorkPoolConfig,
};
