//! Bulletin - encrypted, migratable metadata store for a container
//! orchestration control plane.
//!
//! Bulletin persists desired long-running processes (LRPs), their actual
//! instances and one-off tasks. Exactly one process in a deployment holds the
//! cluster lock and serves writes; it migrates the store to the current
//! schema before accepting traffic, seals every record with authenticated
//! encryption, fans state changes out to subscribers, delivers task
//! completion callbacks, and periodically converges actual state toward
//! desired state.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        Lock Coordinator                         │
//! │          acquire │ renew at ttl/3 │ fail stop on loss           │
//! └─────────────────────────────────────────────────────────────────┘
//!                                  │ held
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                       Migration Manager                         │
//! │     version record │ ordered migrations │ readiness gate        │
//! └─────────────────────────────────────────────────────────────────┘
//!                                  │ ready
//! ┌──────────────────────┐ ┌─────────────────┐ ┌───────────────────┐
//! │  Convergence Driver  │ │    Event Hub    │ │ Callback Work Pool│
//! └──────────────────────┘ └─────────────────┘ └───────────────────┘
//!                                  │
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                RecordStore (validate, seal, publish)            │
//! │                  Cryptor │ key rotation │ codec                 │
//! └─────────────────────────────────────────────────────────────────┘
//!                                  │
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                         Backend Store                           │
//! │          key-value engine   │   relational engine               │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Module Organization
//!
//! ## Core
//! - [`core::config`] - Configuration parsing and validation
//! - [`core::runtime`] - Startup sequencing and shutdown
//! - [`core::time`] - Lease clock and time helpers
//! - [`core::error`] - Error types and mapping
//!
//! ## Records
//! - [`models`] - LRP, task and volume mount records with validation
//! - [`crypto`] - Key derivation, AES-GCM sealing, record codec, rotation
//! - [`storage`] - Backend interface, both engines, typed record store
//!
//! ## Coordination
//! - [`lock`] - Cluster lock maintenance
//! - [`migration`] - Versioned migration pipeline
//!
//! ## Background work
//! - [`events`] - Per-category event fan-out
//! - [`workpool`] - Bounded callback delivery
//! - [`convergence`] - Desired/actual reconciliation
//!
//! ## CLI
//! - [`cli::commands`] - CLI command implementations
//!
//! # Key Invariants
//!
//! - At most one process believes it holds the lock at any time
//! - No traffic is served before migrations reach the target version
//! - Every record at rest is sealed under a known key
//! - A write never silently overwrites a concurrent write
//! - Publishing an event never blocks on a subscriber

// Core infrastructure
pub mod core;

// Record models and encoding
pub mod crypto;
pub mod models;

// Storage layer
pub mod storage;

// Coordination
pub mod lock;
pub mod migration;

// Background work
pub mod convergence;
pub mod events;
pub mod workpool;

// CLI
pub mod cli;

// Re-exports for convenience
pub use self::core::{config, error, runtime, time};
pub use self::core::error::{BulletinError, BulletinResult};
pub use self::core::runtime::Runtime;
