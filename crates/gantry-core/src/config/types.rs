//! Configuration types

use std::collections::BTreeSet;
use std::fmt;
use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Main configuration for Gantry
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Version of the config schema
    #[serde(rename = "$schema", skip_serializing_if = "Option::is_none")]
    pub schema: Option<String>,

    /// Execution settings
    pub execution: ExecutionConfig,

    /// Logging settings
    pub logging: LoggingConfig,
}

/// Resolved execution settings handed to the engine
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    /// Worker count: a positive integer, "auto" or "disabled"
    pub max_workers: WorkerCount,

    /// Partition granularity
    pub mode: ParallelMode,

    /// Worker isolation
    pub isolation: Isolation,

    /// Only run units carrying at least one of these tags
    pub tag_include: BTreeSet<String>,

    /// Never run units carrying any of these tags
    pub tag_exclude: BTreeSet<String>,

    /// Only run partitions matching these glob patterns
    pub services: Vec<String>,

    /// Abort the whole run when a worker crashes
    pub abort_on_crash: bool,

    /// Per-unit timeout in seconds
    pub unit_timeout: Option<u64>,

    /// Per-partition timeout in seconds
    pub partition_timeout: Option<u64>,

    /// What to do with dependencies removed by filtering
    pub filtered_dependency: FilteredDependencyPolicy,

    /// Path to the worker executable (defaults to `gantry-worker`)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worker_program: Option<PathBuf>,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            max_workers: WorkerCount::Auto,
            mode: ParallelMode::Service,
            isolation: Isolation::Process,
            tag_include: BTreeSet::new(),
            tag_exclude: BTreeSet::new(),
            services: Vec::new(),
            abort_on_crash: false,
            unit_timeout: None,
            partition_timeout: None,
            filtered_dependency: FilteredDependencyPolicy::Satisfied,
            worker_program: None,
        }
    }
}

impl ExecutionConfig {
    /// Per-unit timeout as a duration
    pub fn unit_timeout_duration(&self) -> Option<Duration> {
        self.unit_timeout.map(Duration::from_secs)
    }

    /// Per-partition timeout as a duration
    pub fn partition_timeout_duration(&self) -> Option<Duration> {
        self.partition_timeout.map(Duration::from_secs)
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Console level used when RUST_LOG is unset
    pub level: String,

    /// Write debug-level JSON logs to ~/.gantry/logs
    pub file: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "warn".to_string(),
            file: true,
        }
    }
}

/// Number of worker processes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "WorkerCountRepr", into = "WorkerCountRepr")]
pub enum WorkerCount {
    /// One worker per logical core
    #[default]
    Auto,
    /// Run in the caller's process, sequentially, without isolation
    Disabled,
    /// Fixed number of workers
    Fixed(NonZeroUsize),
}

impl WorkerCount {
    /// Resolve to a concrete worker count; 0 means in-process sequential
    pub fn resolve(&self) -> usize {
        match self {
            Self::Auto => std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            Self::Disabled => 0,
            Self::Fixed(n) => n.get(),
        }
    }

    /// Whether workers are disabled entirely
    pub fn is_disabled(&self) -> bool {
        matches!(self, Self::Disabled)
    }
}

impl From<usize> for WorkerCount {
    fn from(n: usize) -> Self {
        NonZeroUsize::new(n).map(Self::Fixed).unwrap_or(Self::Disabled)
    }
}

impl fmt::Display for WorkerCount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Auto => write!(f, "auto"),
            Self::Disabled => write!(f, "disabled"),
            Self::Fixed(n) => write!(f, "{}", n),
        }
    }
}

impl FromStr for WorkerCount {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "auto" => Ok(Self::Auto),
            "disabled" | "off" | "no" => Ok(Self::Disabled),
            other => other
                .parse::<usize>()
                .map(Self::from)
                .map_err(|_| {
                    format!(
                        "Invalid worker count '{}': expected a number, 'auto' or 'disabled'",
                        s
                    )
                }),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
enum WorkerCountRepr {
    Count(usize),
    Keyword(String),
}

impl TryFrom<WorkerCountRepr> for WorkerCount {
    type Error = String;

    fn try_from(repr: WorkerCountRepr) -> Result<Self, Self::Error> {
        match repr {
            WorkerCountRepr::Count(n) => Ok(Self::from(n)),
            WorkerCountRepr::Keyword(s) => s.parse(),
        }
    }
}

impl From<WorkerCount> for WorkerCountRepr {
    fn from(count: WorkerCount) -> Self {
        match count {
            WorkerCount::Fixed(n) => Self::Count(n.get()),
            other => Self::Keyword(other.to_string()),
        }
    }
}

/// Partition granularity
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParallelMode {
    /// One partition per partition key
    #[default]
    Service,
    /// One partition per unit (not supported)
    Test,
}

impl fmt::Display for ParallelMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Service => write!(f, "service"),
            Self::Test => write!(f, "test"),
        }
    }
}

/// Worker isolation level
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Isolation {
    /// Each partition runs in its own OS process
    #[default]
    Process,
    /// Workers run inside the caller's process (debugging only)
    None,
}

/// Policy for a dependency that was removed by filtering
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FilteredDependencyPolicy {
    /// Treat the dependency as satisfied and warn
    #[default]
    Satisfied,
    /// Keep the dependent but record it as filtered without running it
    Skip,
    /// Fail the build
    Reject,
}
