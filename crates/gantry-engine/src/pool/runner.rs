//! Drives one partition through one worker

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch, OwnedSemaphorePermit, Semaphore};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn};

use gantry_core::Executable;

use crate::aggregator::AggregatorHandle;
use crate::error::AggregationError;
use crate::hooks::{EventSender, SuiteEvent};
use crate::report::{ResultRecord, UnitStatus};
use crate::worker::{Command, Outcome, Reply, WorkerHandle, WorkerLauncher};

use super::{PoolEvent, WorkerId, WorkerState};

/// One unit as the runner sees it
#[derive(Debug, Clone)]
pub(crate) struct UnitJob {
    pub id: String,
    pub executable: Executable,
    /// Dependencies that are part of the run
    pub dependencies: Vec<String>,
    /// Set when a dependency was filtered out under the skip policy
    pub filtered_dependency: Option<String>,
}

/// Why waiting stopped early
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Interrupt {
    UnitTimeout,
    PartitionTimeout,
    Abort,
}

enum Dependencies {
    Satisfied,
    Failed { dependency: String, status: UnitStatus },
    Interrupted(Interrupt),
}

/// How a partition ended
enum Ending {
    Completed,
    Crashed(String),
    Interrupted(Interrupt),
}

pub(crate) struct PartitionRunner {
    pub worker: WorkerId,
    pub sequence: u64,
    pub partition: String,
    pub jobs: Vec<UnitJob>,
    pub launcher: WorkerLauncher,
    pub aggregator: AggregatorHandle,
    pub events: EventSender,
    pub pool: mpsc::UnboundedSender<PoolEvent>,
    pub abort: watch::Receiver<bool>,
    /// One permit per configured worker, held while a unit executes
    pub permits: Arc<Semaphore>,
    /// Records of this partition in the order they were produced
    pub results: Vec<ResultRecord>,
    pub unit_timeout: Option<Duration>,
    pub partition_timeout: Option<Duration>,
}

impl PartitionRunner {
    /// Run every unit of the partition and record exactly one result for each
    pub async fn run(mut self) -> Result<WorkerState, AggregationError> {
        let partition_deadline = self.partition_timeout.map(|t| Instant::now() + t);
        self.aggregator.assignment(&self.partition, self.worker);
        self.events.emit(SuiteEvent::BeforeSuite {
            partition: self.partition.clone(),
            worker: self.worker,
        });

        let jobs = std::mem::take(&mut self.jobs);
        let ending = self.execute(&jobs, partition_deadline).await?;

        let state = match ending {
            Ending::Completed => WorkerState::Completed,
            Ending::Crashed(detail) => {
                self.events.emit(SuiteEvent::WorkerCrashed {
                    partition: self.partition.clone(),
                    worker: self.worker,
                    detail,
                });
                WorkerState::Crashed
            }
            Ending::Interrupted(Interrupt::Abort) => WorkerState::Completed,
            Ending::Interrupted(_) => WorkerState::TimedOut,
        };

        self.events.emit(SuiteEvent::AfterSuite {
            partition: self.partition.clone(),
            worker: self.worker,
            results: std::mem::take(&mut self.results),
        });
        info!(partition = %self.partition, worker = self.worker, ?state, "partition finished");
        Ok(state)
    }

    async fn execute(
        &mut self,
        jobs: &[UnitJob],
        partition_deadline: Option<Instant>,
    ) -> Result<Ending, AggregationError> {
        let mut abort = self.abort.clone();
        if *abort.borrow() {
            self.record_rest(jobs, UnitStatus::SkippedAborted, "run aborted before the partition started")
                .await?;
            return Ok(Ending::Interrupted(Interrupt::Abort));
        }

        let launched = tokio::select! {
            result = self.start_worker() => result.map_err(Some),
            _ = sleep_until_opt(partition_deadline) => Err(None),
            _ = aborted(&mut abort) => Err(None),
        };
        let mut handle = match launched {
            Ok(handle) => handle,
            Err(Some(detail)) => {
                warn!(partition = %self.partition, worker = self.worker, %detail, "worker failed to start");
                self.record_rest(jobs, UnitStatus::ErrorWorkerCrashed, &detail).await?;
                return Ok(Ending::Crashed(detail));
            }
            Err(None) => {
                let interrupt = if *abort.borrow() {
                    Interrupt::Abort
                } else {
                    Interrupt::PartitionTimeout
                };
                let detail = self.interrupt_detail(interrupt, None);
                self.record_rest(jobs, interrupt.status(), &detail).await?;
                return Ok(Ending::Interrupted(interrupt));
            }
        };
        let _ = self.pool.send(PoolEvent::Running(self.worker));

        for (index, job) in jobs.iter().enumerate() {
            if *abort.borrow() {
                handle.kill().await;
                self.record_rest(&jobs[index..], UnitStatus::SkippedAborted, "run aborted")
                    .await?;
                return Ok(Ending::Interrupted(Interrupt::Abort));
            }

            if let Some(dependency) = &job.filtered_dependency {
                let detail = format!("dependency '{}' was removed by filtering", dependency);
                self.record(job, UnitStatus::SkippedFiltered, Duration::ZERO, Some(detail))
                    .await?;
                continue;
            }

            match self.check_dependencies(job, partition_deadline, &mut abort).await? {
                Dependencies::Satisfied => {}
                Dependencies::Failed { dependency, status } => {
                    let detail = format!("dependency '{}' finished with {}", dependency, status);
                    self.record(job, UnitStatus::SkippedDependencyFailed, Duration::ZERO, Some(detail))
                        .await?;
                    continue;
                }
                Dependencies::Interrupted(interrupt) => {
                    handle.kill().await;
                    let detail = self.interrupt_detail(interrupt, None);
                    self.record_rest(&jobs[index..], interrupt.status(), &detail).await?;
                    return Ok(Ending::Interrupted(interrupt));
                }
            }

            // Released at the end of the iteration, after any kill
            let _permit = match self.acquire_permit(partition_deadline, &mut abort).await {
                Ok(permit) => permit,
                Err(interrupt) => {
                    handle.kill().await;
                    let detail = self.interrupt_detail(interrupt, None);
                    self.record_rest(&jobs[index..], interrupt.status(), &detail).await?;
                    return Ok(Ending::Interrupted(interrupt));
                }
            };

            let started = Instant::now();
            let unit_deadline = self.unit_timeout.map(|t| started + t);
            let deadline = earliest(unit_deadline, partition_deadline);
            let deadline_kind = match (unit_deadline, partition_deadline) {
                (Some(unit), Some(partition)) if partition < unit => Interrupt::PartitionTimeout,
                (Some(_), _) => Interrupt::UnitTimeout,
                _ => Interrupt::PartitionTimeout,
            };

            debug!(unit = %job.id, worker = self.worker, "dispatching unit");
            let sent = handle
                .send(&Command::Run {
                    unit_id: job.id.clone(),
                    executable: job.executable.clone(),
                })
                .await;

            let result = match sent {
                Err(e) => Err(Some(format!("failed to send unit to worker: {}", e))),
                Ok(()) => tokio::select! {
                    reply = handle.recv() => match reply {
                        Ok(Some(Reply::Finished { unit_id, outcome, duration_ms })) if unit_id == job.id => {
                            Ok((outcome, Duration::from_millis(duration_ms)))
                        }
                        Ok(Some(other)) => Err(Some(format!("unexpected reply from worker: {:?}", other))),
                        Ok(None) => Err(Some("worker exited while running the unit".to_string())),
                        Err(e) => Err(Some(e.to_string())),
                    },
                    _ = sleep_until_opt(deadline) => Err(None),
                    _ = aborted(&mut abort) => Err(None),
                },
            };

            match result {
                Ok((Outcome::Passed, duration)) => {
                    self.record(job, UnitStatus::Passed, duration, None).await?;
                }
                Ok((Outcome::Failed { detail }, duration)) => {
                    self.record(job, UnitStatus::Failed, duration, Some(detail)).await?;
                }
                Err(Some(detail)) => {
                    handle.kill().await;
                    warn!(unit = %job.id, worker = self.worker, %detail, "worker crashed");
                    self.record(job, UnitStatus::ErrorWorkerCrashed, started.elapsed(), Some(detail.clone()))
                        .await?;
                    let rest = format!("not run: worker crashed on '{}'", job.id);
                    self.record_rest(&jobs[index + 1..], UnitStatus::ErrorWorkerCrashed, &rest)
                        .await?;
                    return Ok(Ending::Crashed(detail));
                }
                Err(None) if *abort.borrow() => {
                    handle.kill().await;
                    self.record_rest(&jobs[index..], UnitStatus::SkippedAborted, "run aborted")
                        .await?;
                    return Ok(Ending::Interrupted(Interrupt::Abort));
                }
                Err(None) => {
                    handle.kill().await;
                    let detail = self.interrupt_detail(deadline_kind, Some(started.elapsed()));
                    warn!(unit = %job.id, worker = self.worker, %detail, "unit timed out");
                    self.record(job, UnitStatus::ErrorTimeout, started.elapsed(), Some(detail.clone()))
                        .await?;
                    let rest = format!("not run: worker timed out on '{}'", job.id);
                    self.record_rest(&jobs[index + 1..], UnitStatus::ErrorTimeout, &rest)
                        .await?;
                    return Ok(Ending::Interrupted(deadline_kind));
                }
            }
        }

        handle.shutdown().await;
        Ok(Ending::Completed)
    }

    /// Launch the worker and complete the handshake; errors come back as text
    async fn start_worker(&self) -> Result<WorkerHandle, String> {
        let mut handle = self
            .launcher
            .launch()
            .await
            .map_err(|e| e.to_string())?;
        if let Err(e) = handle.assign(self.worker, self.sequence, &self.partition).await {
            handle.kill().await;
            return Err(e.to_string());
        }
        Ok(handle)
    }

    /// Wait for an execution permit so no more than the configured number of
    /// units run at once, overflow workers included
    async fn acquire_permit(
        &self,
        partition_deadline: Option<Instant>,
        abort: &mut watch::Receiver<bool>,
    ) -> Result<OwnedSemaphorePermit, Interrupt> {
        tokio::select! {
            permit = self.permits.clone().acquire_owned() => permit.map_err(|_| Interrupt::Abort),
            _ = sleep_until_opt(partition_deadline) => Err(Interrupt::PartitionTimeout),
            _ = aborted(abort) => Err(Interrupt::Abort),
        }
    }

    /// Wait for every dependency to finish; the first non-passing one wins
    async fn check_dependencies(
        &self,
        job: &UnitJob,
        partition_deadline: Option<Instant>,
        abort: &mut watch::Receiver<bool>,
    ) -> Result<Dependencies, AggregationError> {
        for dependency in &job.dependencies {
            let status = match self.aggregator.status_of(dependency).await? {
                Some(status) => status,
                None => {
                    debug!(unit = %job.id, %dependency, "waiting for dependency");
                    let _ = self.pool.send(PoolEvent::Blocked(self.worker));
                    let waited = tokio::select! {
                        status = self.aggregator.wait_for(dependency) => Ok(status),
                        _ = sleep_until_opt(partition_deadline) => Err(Interrupt::PartitionTimeout),
                        _ = aborted(abort) => Err(Interrupt::Abort),
                    };
                    let _ = self.pool.send(PoolEvent::Unblocked(self.worker));
                    match waited {
                        Ok(status) => status?,
                        Err(interrupt) => return Ok(Dependencies::Interrupted(interrupt)),
                    }
                }
            };

            if !status.is_passed() {
                return Ok(Dependencies::Failed {
                    dependency: dependency.clone(),
                    status,
                });
            }
        }
        Ok(Dependencies::Satisfied)
    }

    fn interrupt_detail(&self, interrupt: Interrupt, elapsed: Option<Duration>) -> String {
        let after = elapsed
            .map(|e| format!(" after {}ms", e.as_millis()))
            .unwrap_or_default();
        match interrupt {
            Interrupt::UnitTimeout => format!(
                "unit exceeded its timeout of {}s{}",
                self.unit_timeout.unwrap_or_default().as_secs_f64(),
                after
            ),
            Interrupt::PartitionTimeout => format!(
                "partition '{}' exceeded its timeout of {}s{}",
                self.partition,
                self.partition_timeout.unwrap_or_default().as_secs_f64(),
                after
            ),
            Interrupt::Abort => "run aborted".to_string(),
        }
    }

    async fn record(
        &mut self,
        job: &UnitJob,
        status: UnitStatus,
        duration: Duration,
        detail: Option<String>,
    ) -> Result<(), AggregationError> {
        let mut record = ResultRecord::new(&job.id, &self.partition, status)
            .with_duration(duration)
            .with_worker(Some(self.worker));
        record.error_detail = detail;
        self.results.push(record.clone());
        self.aggregator.record(record).await
    }

    async fn record_rest(
        &mut self,
        jobs: &[UnitJob],
        status: UnitStatus,
        detail: &str,
    ) -> Result<(), AggregationError> {
        for job in jobs {
            self.record(job, status, Duration::ZERO, Some(detail.to_string()))
                .await?;
        }
        Ok(())
    }
}

impl Interrupt {
    fn status(self) -> UnitStatus {
        match self {
            Self::UnitTimeout | Self::PartitionTimeout => UnitStatus::ErrorTimeout,
            Self::Abort => UnitStatus::SkippedAborted,
        }
    }
}

fn earliest(a: Option<Instant>, b: Option<Instant>) -> Option<Instant> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Resolves once the abort flag is raised; never if the sender is gone
pub(crate) async fn aborted(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_earliest_deadline() {
        let now = Instant::now();
        let later = now + Duration::from_secs(5);
        assert_eq!(earliest(Some(now), Some(later)), Some(now));
        assert_eq!(earliest(None, Some(later)), Some(later));
        assert_eq!(earliest(None, None), None);
    }

    #[tokio::test]
    async fn test_aborted_waits_for_flag() {
        let (tx, mut rx) = watch::channel(false);
        let waiter = tokio::spawn(async move { aborted(&mut rx).await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());

        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_aborted_never_fires_without_sender() {
        let (tx, mut rx) = watch::channel(false);
        drop(tx);
        let result = tokio::time::timeout(Duration::from_millis(20), aborted(&mut rx)).await;
        assert!(result.is_err());
    }
}
