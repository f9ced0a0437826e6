//! Shared utilities for the tunnel manager components.
//!
//! This crate provides functionality used by both the manager service and
//! its command-line front end: configuration loading and logging setup.

pub mod config;
pub mod logging;

// Re-export commonly used items for convenience
pub use config::{Config, ConfigError, ManagerConfig};
