//! Engine error types

use std::path::PathBuf;

use gantry_core::ParallelMode;
use thiserror::Error;

/// Errors raised while building the dependency graph. Always fatal.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    /// Two units share an id
    #[error("Duplicate test unit id '{0}'")]
    DuplicateId(String),

    /// A unit depends on an id that was never discovered
    #[error("Unit '{unit}' depends on unknown unit '{dependency}'")]
    UnknownDependency { unit: String, dependency: String },

    /// The graph contains a cycle
    #[error("Cyclic dependency detected: {}", .path.join(" -> "))]
    CyclicDependency { path: Vec<String> },

    /// A unit depends on a unit removed by filtering and the policy rejects it
    #[error("Unit '{unit}' depends on '{dependency}', which was removed by filtering")]
    FilteredDependency { unit: String, dependency: String },
}

/// Internal consistency failure in the scheduler
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchedulingError {
    /// Nodes remain but none is ready
    #[error("Scheduling frontier exhausted with {} unit(s) remaining: {}", .remaining.len(), .remaining.join(", "))]
    FrontierExhausted { remaining: Vec<String> },
}

/// Partitioning errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PartitionError {
    /// The requested parallel mode is not implemented
    #[error("Parallel mode '{0}' is not implemented; use 'service'")]
    UnsupportedMode(ParallelMode),
}

/// Protocol corruption detected by the result aggregator. Fatal to the run.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AggregationError {
    /// A result arrived for a unit that was never scheduled
    #[error("Result reported for unknown unit '{0}'")]
    UnknownUnit(String),

    /// A second result arrived for the same unit
    #[error("Result reported twice for unit '{0}'")]
    DuplicateResult(String),

    /// The run ended without a result for some scheduled units
    #[error("No result recorded for {} unit(s): {}", .0.len(), .0.join(", "))]
    MissingResults(Vec<String>),

    /// The aggregator stopped before the run finished
    #[error("Result aggregator is no longer running")]
    Closed,
}

/// Worker transport and process errors
#[derive(Debug, Error)]
pub enum WorkerError {
    /// The worker binary could not be located
    #[error("Worker program not found (looked for {0}); set execution.worker_program or GANTRY_WORKER_BIN")]
    ProgramNotFound(String),

    /// Spawning the worker failed
    #[error("Failed to spawn worker {program}: {source}")]
    Spawn {
        program: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The worker did not complete its handshake
    #[error("Worker failed to start: {0}")]
    Startup(String),

    /// The worker sent something unexpected
    #[error("Worker protocol error: {0}")]
    Protocol(String),

    /// Malformed message on the wire
    #[error("Invalid worker message: {0}")]
    Decode(#[from] serde_json::Error),

    /// IO error on the worker pipe
    #[error("Worker IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Error returned by a lifecycle listener
#[derive(Debug, Clone, Error)]
#[error("{0}")]
pub struct HookError(pub String);

impl HookError {
    /// Create a hook error from a message
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Top-level engine error
#[derive(Debug, Error)]
pub enum EngineError {
    /// Graph validation failed
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// Scheduler invariant broken
    #[error(transparent)]
    Scheduling(#[from] SchedulingError),

    /// Partitioning failed
    #[error(transparent)]
    Partition(#[from] PartitionError),

    /// Result stream corrupted
    #[error(transparent)]
    Aggregation(#[from] AggregationError),

    /// Workers could not be started at all
    #[error(transparent)]
    Worker(#[from] WorkerError),

    /// Invalid unit filter
    #[error("Invalid service pattern '{pattern}': {message}")]
    Filter { pattern: String, message: String },

    /// A partition runner task died
    #[error("Partition runner failed: {0}")]
    Runner(String),
}

impl EngineError {
    /// Whether the error was raised before any unit executed
    pub fn is_planning_error(&self) -> bool {
        matches!(
            self,
            Self::Validation(_) | Self::Scheduling(_) | Self::Partition(_) | Self::Filter { .. }
        )
    }
}
