//! Gantry Core - shared data model and configuration
//!
//! This crate provides the test unit descriptors handed to the engine by the
//! discovery layer, error handling, configuration loading and the unit
//! manifest format.

pub mod config;
pub mod error;
pub mod manifest;
pub mod unit;

pub use config::{
    Config, ExecutionConfig, FilteredDependencyPolicy, Isolation, LoggingConfig, ParallelMode,
    WorkerCount,
};
pub use error::{ConfigError, GantryError, ManifestError, Result};
pub use manifest::{load_manifest, UnitManifest};
pub use unit::{Executable, Invocation, Priority, TestUnit};
