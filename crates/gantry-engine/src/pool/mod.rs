//! Worker pool - runs partitions on isolated workers
//!
//! The supervisor owns a FIFO queue of partitions and a fixed set of worker
//! slots. An idle slot claims the next queued partition, so fast partitions
//! free their slot early and slow ones never hold up the queue. Each claim is
//! numbered by a monotonically increasing assignment counter and served by a
//! fresh worker.
//!
//! Execution permits cap the units running at once at the configured worker
//! count. Overflow slots only exist to break dependency waits and never add
//! concurrency; with workers disabled every unit runs strictly one at a time.

mod runner;

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, info, instrument, warn};

use gantry_core::{ExecutionConfig, Isolation};

use crate::aggregator::{Aggregator, AggregatorHandle};
use crate::error::{AggregationError, EngineError, WorkerError};
use crate::hooks::{EventDispatcher, ListenerRegistry};
use crate::orchestrator::ExecutionPlan;
use crate::partition::Partition;
use crate::report::{ResultRecord, RunReport, UnitStatus};
use crate::worker::WorkerLauncher;

use runner::{PartitionRunner, UnitJob};

/// Worker slot number
pub type WorkerId = usize;

/// Lifecycle of a worker slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Idle,
    Assigned,
    Running,
    Completed,
    Crashed,
    TimedOut,
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "IDLE",
            Self::Assigned => "ASSIGNED",
            Self::Running => "RUNNING",
            Self::Completed => "COMPLETED",
            Self::Crashed => "CRASHED",
            Self::TimedOut => "TIMED_OUT",
        };
        write!(f, "{}", s)
    }
}

/// Notifications from partition runners to the supervisor
#[derive(Debug, Clone, Copy)]
pub(crate) enum PoolEvent {
    Running(WorkerId),
    Blocked(WorkerId),
    Unblocked(WorkerId),
}

/// Options for the worker pool
#[derive(Debug, Clone)]
pub struct PoolOptions {
    /// Worker slots; 0 runs one sequential in-process worker
    pub workers: usize,
    /// How workers are started
    pub launcher: WorkerLauncher,
    /// Per-unit timeout
    pub unit_timeout: Option<Duration>,
    /// Per-partition timeout
    pub partition_timeout: Option<Duration>,
    /// Abort everything when a worker crashes
    pub abort_on_crash: bool,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            workers: 0,
            launcher: WorkerLauncher::InProcess,
            unit_timeout: None,
            partition_timeout: None,
            abort_on_crash: false,
        }
    }
}

impl PoolOptions {
    /// Resolve pool options from execution settings.
    ///
    /// Fails when process isolation is requested and the worker program
    /// cannot be found.
    pub fn from_config(config: &ExecutionConfig) -> Result<Self, WorkerError> {
        let workers = config.max_workers.resolve();
        let launcher = if config.max_workers.is_disabled() || config.isolation == Isolation::None {
            WorkerLauncher::InProcess
        } else {
            WorkerLauncher::process(config.worker_program.as_deref())?
        };

        Ok(Self {
            workers,
            launcher,
            unit_timeout: config.unit_timeout_duration(),
            partition_timeout: config.partition_timeout_duration(),
            abort_on_crash: config.abort_on_crash,
        })
    }

    /// In-process workers
    pub fn in_process(workers: usize) -> Self {
        Self {
            workers,
            ..Default::default()
        }
    }

    /// Set the per-unit timeout
    pub fn with_unit_timeout(mut self, timeout: Duration) -> Self {
        self.unit_timeout = Some(timeout);
        self
    }

    /// Set the per-partition timeout
    pub fn with_partition_timeout(mut self, timeout: Duration) -> Self {
        self.partition_timeout = Some(timeout);
        self
    }

    /// Abort the run on the first crash
    pub fn with_abort_on_crash(mut self, abort: bool) -> Self {
        self.abort_on_crash = abort;
        self
    }

    /// Number of regular worker slots
    pub fn slots(&self) -> usize {
        self.workers.max(1)
    }
}

#[derive(Debug)]
struct WorkerSlot {
    state: WorkerState,
    blocked: bool,
    /// Started only to break a dependency wait; retired after one partition
    overflow: bool,
}

impl WorkerSlot {
    fn new(overflow: bool) -> Self {
        Self {
            state: WorkerState::Idle,
            blocked: false,
            overflow,
        }
    }

    fn is_active(&self) -> bool {
        matches!(self.state, WorkerState::Assigned | WorkerState::Running)
    }
}

/// Runs an execution plan on a pool of workers
pub struct WorkerPool {
    options: PoolOptions,
    listeners: Arc<ListenerRegistry>,
}

impl WorkerPool {
    /// Create a new pool
    pub fn new(options: PoolOptions, listeners: Arc<ListenerRegistry>) -> Self {
        Self { options, listeners }
    }

    /// Pool options
    pub fn options(&self) -> &PoolOptions {
        &self.options
    }

    /// Execute every partition of the plan and return the report.
    ///
    /// Unit failures, timeouts and crashes end up in the report; only a
    /// corrupted result stream is returned as an error.
    #[instrument(skip_all, fields(partitions = plan.partitions.len(), workers = self.options.slots()))]
    pub async fn run(&self, plan: &ExecutionPlan) -> Result<RunReport, EngineError> {
        let (aggregator, aggregator_task) =
            Aggregator::new(&plan.schedule, &plan.partitions).spawn();
        let (events, dispatcher) = EventDispatcher::start(self.listeners.clone());
        let (abort_tx, abort_rx) = watch::channel(false);
        let (pool_tx, mut pool_rx) = mpsc::unbounded_channel::<PoolEvent>();
        let permits = Arc::new(Semaphore::new(self.options.slots()));

        let mut queue: VecDeque<Partition> = plan.partitions.iter().cloned().collect();
        let mut slots: Vec<WorkerSlot> = (0..self.options.slots())
            .map(|_| WorkerSlot::new(false))
            .collect();
        let mut runners: JoinSet<(WorkerId, Result<WorkerState, AggregationError>)> =
            JoinSet::new();
        let mut sequence: u64 = 0;
        let mut aborted = false;
        let mut fatal: Option<EngineError> = None;

        info!(
            partitions = queue.len(),
            workers = slots.len(),
            isolation = if self.options.launcher == WorkerLauncher::InProcess { "none" } else { "process" },
            "starting worker pool"
        );

        loop {
            // Hand queued partitions to idle slots
            if !aborted {
                for worker in 0..slots.len() {
                    if queue.is_empty() {
                        break;
                    }
                    let slot = &mut slots[worker];
                    if slot.state != WorkerState::Idle || slot.overflow {
                        continue;
                    }
                    if let Some(partition) = queue.pop_front() {
                        sequence += 1;
                        slot.state = WorkerState::Assigned;
                        debug!(worker, sequence, partition = %partition.key, "IDLE -> ASSIGNED");
                        runners.spawn(self.runner(
                            worker, sequence, &partition, plan, &aggregator, &events, &pool_tx, &abort_rx,
                            &permits,
                        ));
                    }
                }
            }

            let any_active = slots.iter().any(WorkerSlot::is_active);
            let all_blocked = slots.iter().filter(|s| s.is_active()).all(|s| s.blocked);
            if !aborted && !queue.is_empty() && any_active && all_blocked {
                if let Some(partition) = queue.pop_front() {
                    let worker = slots.len();
                    sequence += 1;
                    warn!(
                        worker,
                        partition = %partition.key,
                        "all workers are waiting on dependencies, starting overflow worker"
                    );
                    let mut slot = WorkerSlot::new(true);
                    slot.state = WorkerState::Assigned;
                    slots.push(slot);
                    runners.spawn(self.runner(
                        worker, sequence, &partition, plan, &aggregator, &events, &pool_tx, &abort_rx,
                        &permits,
                    ));
                }
            }

            if runners.is_empty() {
                break;
            }

            // Runner notifications are applied before completions
            tokio::select! {
                biased;
                Some(event) = pool_rx.recv() => match event {
                    PoolEvent::Running(worker) => {
                        debug!(worker, "ASSIGNED -> RUNNING");
                        slots[worker].state = WorkerState::Running;
                    }
                    PoolEvent::Blocked(worker) => slots[worker].blocked = true,
                    PoolEvent::Unblocked(worker) => slots[worker].blocked = false,
                },
                Some(joined) = runners.join_next() => {
                    let (worker, result) = match joined {
                        Ok(finished) => finished,
                        Err(e) => {
                            fatal.get_or_insert(EngineError::Runner(e.to_string()));
                            let _ = abort_tx.send(true);
                            aborted = true;
                            continue;
                        }
                    };

                    let slot = &mut slots[worker];
                    slot.blocked = false;
                    match result {
                        Ok(state) => {
                            debug!(worker, "RUNNING -> {}", state);
                            slot.state = state;
                            if state == WorkerState::Crashed && self.options.abort_on_crash && !aborted {
                                warn!(worker, "worker crashed, aborting run");
                                aborted = true;
                                aggregator.abort();
                                let _ = abort_tx.send(true);
                            }
                        }
                        Err(e) => {
                            fatal.get_or_insert(e.into());
                            aborted = true;
                            let _ = abort_tx.send(true);
                        }
                    }
                    // A slot whose partition is done can take another one
                    if !slot.overflow {
                        slot.state = WorkerState::Idle;
                    }
                }
            }
        }

        drop(pool_tx);
        drop(events);
        dispatcher.drain().await;

        if let Some(e) = fatal {
            aggregator_task.abort();
            return Err(e);
        }

        for partition in queue.drain(..) {
            debug!(partition = %partition.key, "partition not started, run aborted");
            record_aborted(&aggregator, &partition).await?;
        }

        let report = aggregator.finish().await?;
        info!(
            status = %report.status,
            units = report.totals.total,
            assignments = sequence,
            "worker pool finished"
        );
        Ok(report)
    }

    #[allow(clippy::too_many_arguments)]
    fn runner(
        &self,
        worker: WorkerId,
        sequence: u64,
        partition: &Partition,
        plan: &ExecutionPlan,
        aggregator: &AggregatorHandle,
        events: &crate::hooks::EventSender,
        pool: &mpsc::UnboundedSender<PoolEvent>,
        abort: &watch::Receiver<bool>,
        permits: &Arc<Semaphore>,
    ) -> impl std::future::Future<Output = (WorkerId, Result<WorkerState, AggregationError>)> {
        let jobs = partition
            .units
            .iter()
            .filter_map(|id| plan.graph.node(id))
            .map(|node| UnitJob {
                id: node.unit.id.clone(),
                executable: node.unit.executable.clone(),
                dependencies: plan
                    .graph
                    .dependencies_of(&node.unit.id)
                    .into_iter()
                    .map(String::from)
                    .collect(),
                filtered_dependency: node
                    .is_blocked_by_filter()
                    .then(|| node.filtered_dependencies().first().cloned())
                    .flatten(),
            })
            .collect::<Vec<_>>();

        let runner = PartitionRunner {
            worker,
            sequence,
            partition: partition.key.clone(),
            results: Vec::with_capacity(jobs.len()),
            jobs,
            launcher: self.options.launcher.clone(),
            aggregator: aggregator.clone(),
            events: events.clone(),
            pool: pool.clone(),
            abort: abort.clone(),
            permits: permits.clone(),
            unit_timeout: self.options.unit_timeout,
            partition_timeout: self.options.partition_timeout,
        };
        async move { (worker, runner.run().await) }
    }
}

/// Record every unit of a partition that never started as aborted
async fn record_aborted(
    aggregator: &AggregatorHandle,
    partition: &Partition,
) -> Result<(), AggregationError> {
    for id in &partition.units {
        aggregator
            .record(
                ResultRecord::new(id, &partition.key, UnitStatus::SkippedAborted)
                    .with_detail("run aborted before the partition started"),
            )
            .await?;
    }
    Ok(())
}
