//! Gantry Engine - test planning and parallel execution
//!
//! Discovered units flow through the engine in one direction:
//!
//! ```text
//! filter -> dag -> scheduler -> partition -> pool (workers) -> aggregator
//! ```
//!
//! The [`Orchestrator`] wires the stages together; each stage is also usable
//! on its own.

pub mod aggregator;
pub mod dag;
pub mod error;
pub mod filter;
pub mod hooks;
pub mod orchestrator;
pub mod partition;
pub mod pool;
pub mod report;
pub mod scheduler;
pub mod worker;

pub use aggregator::{Aggregator, AggregatorHandle};
pub use dag::{DependencyGraph, GraphNode};
pub use error::{
    AggregationError, EngineError, HookError, PartitionError, SchedulingError, ValidationError,
    WorkerError,
};
pub use filter::{FilterOutcome, FilterReason, UnitFilter};
pub use hooks::{
    CollectingListener, EventDispatcher, EventSender, ListenerRegistry, SuiteEvent,
    SuiteListener, TracingListener,
};
pub use orchestrator::{ExecutionPlan, Orchestrator};
pub use partition::{Partition, PartitionSet, Partitioner};
pub use pool::{PoolOptions, WorkerId, WorkerPool, WorkerState};
pub use report::{PartitionSummary, ResultRecord, RunReport, RunStatus, StatusCounts, UnitStatus};
pub use scheduler::{Schedule, Scheduler, Stage};
pub use worker::{WorkerHandle, WorkerLauncher};
