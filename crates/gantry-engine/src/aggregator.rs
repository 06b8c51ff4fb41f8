//! Result aggregation
//!
//! A single task owns every recorded result. Partition runners talk to it
//! through an [`AggregatorHandle`]: they record outcomes, query dependency
//! status and suspend until a dependency completes. Records are slotted at
//! their schedule position, so the final report order never depends on which
//! worker finished first.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::error::AggregationError;
use crate::partition::PartitionSet;
use crate::report::{ResultRecord, RunReport, UnitStatus};
use crate::scheduler::Schedule;

type Reply<T> = oneshot::Sender<Result<T, AggregationError>>;

enum Message {
    Record {
        record: ResultRecord,
        reply: Reply<()>,
    },
    Status {
        unit_id: String,
        reply: Reply<Option<UnitStatus>>,
    },
    WaitFor {
        unit_id: String,
        reply: Reply<UnitStatus>,
    },
    Assignment {
        partition: String,
        worker: usize,
    },
    Abort,
    Finish {
        reply: Reply<RunReport>,
    },
}

/// Cloneable handle to the aggregator task
#[derive(Debug, Clone)]
pub struct AggregatorHandle {
    tx: mpsc::UnboundedSender<Message>,
}

impl AggregatorHandle {
    async fn request<T>(
        &self,
        make: impl FnOnce(Reply<T>) -> Message,
    ) -> Result<T, AggregationError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(make(reply))
            .map_err(|_| AggregationError::Closed)?;
        rx.await.map_err(|_| AggregationError::Closed)?
    }

    /// Record a unit's result; rejects unknown and duplicate units
    pub async fn record(&self, record: ResultRecord) -> Result<(), AggregationError> {
        self.request(|reply| Message::Record { record, reply }).await
    }

    /// Current status of a unit, `None` while it is pending
    pub async fn status_of(&self, unit_id: &str) -> Result<Option<UnitStatus>, AggregationError> {
        let unit_id = unit_id.to_string();
        self.request(|reply| Message::Status { unit_id, reply }).await
    }

    /// Suspend until the unit has a result
    pub async fn wait_for(&self, unit_id: &str) -> Result<UnitStatus, AggregationError> {
        let unit_id = unit_id.to_string();
        self.request(|reply| Message::WaitFor { unit_id, reply }).await
    }

    /// Note which worker slot took a partition
    pub fn assignment(&self, partition: &str, worker: usize) {
        let _ = self.tx.send(Message::Assignment {
            partition: partition.to_string(),
            worker,
        });
    }

    /// Mark the run as aborted
    pub fn abort(&self) {
        let _ = self.tx.send(Message::Abort);
    }

    /// Close the aggregator and build the report.
    ///
    /// Fails with [`AggregationError::MissingResults`] when a scheduled unit
    /// never received a record.
    pub async fn finish(&self) -> Result<RunReport, AggregationError> {
        self.request(|reply| Message::Finish { reply }).await
    }
}

/// Sole owner of result state
pub struct Aggregator {
    positions: HashMap<String, usize>,
    order: Vec<String>,
    slots: Vec<Option<ResultRecord>>,
    waiters: HashMap<String, Vec<Reply<UnitStatus>>>,
    partition_order: Vec<String>,
    workers: HashMap<String, usize>,
    aborted: bool,
    started_at: DateTime<Utc>,
}

impl Aggregator {
    /// Create an aggregator expecting one record per scheduled unit
    pub fn new(schedule: &Schedule, partitions: &PartitionSet) -> Self {
        let order = schedule.order().to_vec();
        let positions = order
            .iter()
            .enumerate()
            .map(|(i, id)| (id.clone(), i))
            .collect();
        Self {
            positions,
            slots: vec![None; order.len()],
            order,
            waiters: HashMap::new(),
            partition_order: partitions.iter().map(|p| p.key.clone()).collect(),
            workers: HashMap::new(),
            aborted: false,
            started_at: Utc::now(),
        }
    }

    /// Start the aggregator task
    pub fn spawn(self) -> (AggregatorHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(self.run(rx));
        (AggregatorHandle { tx }, task)
    }

    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Message>) {
        while let Some(message) = rx.recv().await {
            match message {
                Message::Record { record, reply } => {
                    let _ = reply.send(self.record(record));
                }
                Message::Status { unit_id, reply } => {
                    let _ = reply.send(self.status(&unit_id));
                }
                Message::WaitFor { unit_id, reply } => match self.status(&unit_id) {
                    Ok(Some(status)) => {
                        let _ = reply.send(Ok(status));
                    }
                    Ok(None) => self.waiters.entry(unit_id).or_default().push(reply),
                    Err(e) => {
                        let _ = reply.send(Err(e));
                    }
                },
                Message::Assignment { partition, worker } => {
                    self.workers.insert(partition, worker);
                }
                Message::Abort => {
                    if !self.aborted {
                        warn!("run marked as aborted");
                    }
                    self.aborted = true;
                }
                Message::Finish { reply } => {
                    let _ = reply.send(self.finish());
                    return;
                }
            }
        }
        debug!("all aggregator handles dropped");
    }

    fn record(&mut self, record: ResultRecord) -> Result<(), AggregationError> {
        let Some(&position) = self.positions.get(&record.unit_id) else {
            error!(unit = %record.unit_id, "result for unknown unit");
            return Err(AggregationError::UnknownUnit(record.unit_id));
        };
        if self.slots[position].is_some() {
            error!(unit = %record.unit_id, "duplicate result");
            return Err(AggregationError::DuplicateResult(record.unit_id));
        }

        debug!(unit = %record.unit_id, status = %record.status, "result recorded");
        let status = record.status;
        if let Some(waiters) = self.waiters.remove(&record.unit_id) {
            for waiter in waiters {
                let _ = waiter.send(Ok(status));
            }
        }
        self.slots[position] = Some(record);
        Ok(())
    }

    fn status(&self, unit_id: &str) -> Result<Option<UnitStatus>, AggregationError> {
        let position = self
            .positions
            .get(unit_id)
            .ok_or_else(|| AggregationError::UnknownUnit(unit_id.to_string()))?;
        Ok(self.slots[*position].as_ref().map(|r| r.status))
    }

    fn finish(&mut self) -> Result<RunReport, AggregationError> {
        let missing: Vec<String> = self
            .slots
            .iter()
            .zip(&self.order)
            .filter(|(slot, _)| slot.is_none())
            .map(|(_, id)| id.clone())
            .collect();
        if !missing.is_empty() {
            return Err(AggregationError::MissingResults(missing));
        }

        let records = self.slots.iter_mut().filter_map(Option::take).collect();
        Ok(RunReport::new(
            records,
            &self.partition_order,
            &self.workers,
            self.aborted,
            self.started_at,
        ))
    }
}
