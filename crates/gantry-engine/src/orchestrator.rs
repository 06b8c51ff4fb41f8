//! Planning and execution entry points

use std::collections::HashSet;
use std::sync::Arc;

use tracing::{info, instrument};

use gantry_core::{ExecutionConfig, TestUnit};

use crate::dag::DependencyGraph;
use crate::error::EngineError;
use crate::filter::UnitFilter;
use crate::hooks::ListenerRegistry;
use crate::partition::{PartitionSet, Partitioner};
use crate::pool::{PoolOptions, WorkerPool};
use crate::report::RunReport;
use crate::scheduler::{Schedule, Scheduler};

/// Everything decided before the first unit runs
#[derive(Debug, Clone)]
pub struct ExecutionPlan {
    /// Validated graph of retained units
    pub graph: DependencyGraph,
    /// Stage order
    pub schedule: Schedule,
    /// Isolation groups in execution order
    pub partitions: PartitionSet,
    /// Ids removed by filtering; they get no result record
    pub filtered: HashSet<String>,
}

impl ExecutionPlan {
    /// Number of units that will receive a result
    pub fn unit_count(&self) -> usize {
        self.schedule.len()
    }

    /// Human-readable plan: stages, then partitions
    pub fn describe(&self) -> String {
        let mut out = self.schedule.execution_plan(&self.graph);
        out.push_str(&format!("Partitions ({}):\n", self.partitions.len()));
        for partition in self.partitions.iter() {
            out.push_str(&format!(
                "  {}: {}\n",
                partition.key,
                partition.units.join(", ")
            ));
        }
        if !self.filtered.is_empty() {
            let mut filtered: Vec<&str> = self.filtered.iter().map(String::as_str).collect();
            filtered.sort_unstable();
            out.push_str(&format!("Filtered out: {}\n", filtered.join(", ")));
        }
        for warning in self.graph.warnings() {
            out.push_str(&format!("Warning: {}\n", warning));
        }
        out
    }
}

/// Filters, plans and runs test units
pub struct Orchestrator {
    config: ExecutionConfig,
    listeners: Arc<ListenerRegistry>,
}

impl Orchestrator {
    /// Create an orchestrator with the default listeners
    pub fn new(config: ExecutionConfig) -> Self {
        Self {
            config,
            listeners: Arc::new(ListenerRegistry::new()),
        }
    }

    /// Replace the lifecycle listeners
    pub fn with_listeners(mut self, listeners: ListenerRegistry) -> Self {
        self.listeners = Arc::new(listeners);
        self
    }

    /// Execution settings
    pub fn config(&self) -> &ExecutionConfig {
        &self.config
    }

    /// Filter, validate, schedule and partition
    #[instrument(skip_all, fields(units = units.len()))]
    pub fn plan(&self, units: Vec<TestUnit>) -> Result<ExecutionPlan, EngineError> {
        let filter = UnitFilter::from_config(&self.config)?;
        let outcome = filter.apply(units);

        let graph = DependencyGraph::build_filtered(
            outcome.retained,
            &outcome.removed,
            self.config.filtered_dependency,
        )?;
        let schedule = Scheduler::schedule(&graph)?;
        let partitions = Partitioner::partition(&graph, &schedule, self.config.mode)?;

        info!(
            units = schedule.len(),
            stages = schedule.stages().len(),
            partitions = partitions.len(),
            filtered = outcome.removed.len(),
            "execution plan ready"
        );
        Ok(ExecutionPlan {
            graph,
            schedule,
            partitions,
            filtered: outcome.removed,
        })
    }

    /// Plan and execute
    pub async fn run(&self, units: Vec<TestUnit>) -> Result<RunReport, EngineError> {
        let plan = self.plan(units)?;
        self.execute(&plan).await
    }

    /// Execute a plan
    pub async fn execute(&self, plan: &ExecutionPlan) -> Result<RunReport, EngineError> {
        let options = if plan.partitions.is_empty() {
            PoolOptions::default()
        } else {
            PoolOptions::from_config(&self.config)?
        };
        WorkerPool::new(options, self.listeners.clone())
            .run(plan)
            .await
    }
}
