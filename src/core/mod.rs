//! Core runtime infrastructure.
//!
//! This module contains the process-level pieces around the engine:
//! - [`config`] - Configuration parsing and validation
//! - [`runtime`] - Main runtime orchestration and the scheduling loop
//! - [`error`] - Error types and gRPC status mapping

pub mod config;
pub mod error;
pub mod runtime;
