//! Common utilities for Argyll
//!
//! Environment-driven runtime configuration and telemetry initialization.

pub mod config;
pub mod telemetry;

pub use config::{ConfigError, RuntimeConfig};
pub use telemetry::init_tracing;
