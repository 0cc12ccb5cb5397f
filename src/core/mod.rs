//! Core runtime infrastructure.
//!
//! This module contains the essential components for running Bulletin:
//! - [`config`] - Configuration parsing and validation
//! - [`runtime`] - Main runtime orchestration
//! - [`time`] - Lease ticks and timestamps
//! - [`error`] - Error types and request-layer mapping

pub mod config;
pub mod error;
pub mod runtime;
pub mod time;
