// src/config/mod.rs
//! Configuration management
//!
//! This module handles all configuration-related functionality including:
//! - Loading and parsing the JSON configuration file
//! - Following the one-shot `userConfiguration` redirect of the bootstrap file
//! - Retaining load details for the admin plane
//! - Generating configuration templates

/// Core configuration implementation
///
/// Contains the [`Config`] struct and related types that define
/// the supervisor's configuration structure and behavior.
pub mod config;

// Re-export key items for easy access
pub use config::{Config, ConfigTracker, DiffMultipliers, PoolConfig};

use std::path::PathBuf;

/// Loads the supervisor configuration from a JSON file
///
/// # Arguments
/// * `path` - Path to the configuration file
/// * `specified` - Whether the path came from the command line; only the
///   default bootstrap file may chain via `userConfiguration`
///
/// # Returns
/// The load tracker (always) and the configuration when the file parsed
pub fn load(path: impl Into<PathBuf>, specified: bool) -> (ConfigTracker, Option<Config>) {
    config::load(path, specified)
}

/// Generates a configuration template
///
/// # Returns
/// String containing a ready-to-edit JSON configuration template
pub fn generate_template() -> String {
    Config::generate_template()
}
