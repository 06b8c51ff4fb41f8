//! Run results and the final report

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Outcome of a single unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UnitStatus {
    Passed,
    Failed,
    /// A dependency did not pass; the unit was never invoked
    SkippedDependencyFailed,
    /// A dependency was removed by filtering (skip policy)
    SkippedFiltered,
    /// The run was aborted before the unit ran
    SkippedAborted,
    ErrorTimeout,
    ErrorWorkerCrashed,
}

impl UnitStatus {
    /// Returns the string representation of the status
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Passed => "PASSED",
            Self::Failed => "FAILED",
            Self::SkippedDependencyFailed => "SKIPPED_DEPENDENCY_FAILED",
            Self::SkippedFiltered => "SKIPPED_FILTERED",
            Self::SkippedAborted => "SKIPPED_ABORTED",
            Self::ErrorTimeout => "ERROR_TIMEOUT",
            Self::ErrorWorkerCrashed => "ERROR_WORKER_CRASHED",
        }
    }

    /// Whether the unit passed
    pub fn is_passed(&self) -> bool {
        matches!(self, Self::Passed)
    }

    /// Whether the unit was skipped without being invoked
    pub fn is_skipped(&self) -> bool {
        matches!(
            self,
            Self::SkippedDependencyFailed | Self::SkippedFiltered | Self::SkippedAborted
        )
    }

    /// Whether this status makes the run fail
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            Self::Failed | Self::ErrorTimeout | Self::ErrorWorkerCrashed
        )
    }
}

impl fmt::Display for UnitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Result of one scheduled unit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultRecord {
    pub unit_id: String,
    pub status: UnitStatus,
    #[serde(rename = "duration_ms", with = "duration_ms")]
    pub duration: Duration,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_detail: Option<String>,
    pub partition_key: String,
    /// Worker slot that handled the unit
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker: Option<usize>,
}

impl ResultRecord {
    /// Create a record with no duration and no detail
    pub fn new(
        unit_id: impl Into<String>,
        partition_key: impl Into<String>,
        status: UnitStatus,
    ) -> Self {
        Self {
            unit_id: unit_id.into(),
            status,
            duration: Duration::ZERO,
            error_detail: None,
            partition_key: partition_key.into(),
            worker: None,
        }
    }

    /// Set the duration
    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = duration;
        self
    }

    /// Set the error detail
    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.error_detail = Some(detail.into());
        self
    }

    /// Set the worker slot
    pub fn with_worker(mut self, worker: Option<usize>) -> Self {
        self.worker = worker;
        self
    }
}

/// Per-status counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCounts {
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub skipped_dependency_failed: usize,
    pub skipped_filtered: usize,
    pub skipped_aborted: usize,
    pub error_timeout: usize,
    pub error_worker_crashed: usize,
}

impl StatusCounts {
    /// Count one more record
    pub fn add(&mut self, status: UnitStatus) {
        self.total += 1;
        match status {
            UnitStatus::Passed => self.passed += 1,
            UnitStatus::Failed => self.failed += 1,
            UnitStatus::SkippedDependencyFailed => self.skipped_dependency_failed += 1,
            UnitStatus::SkippedFiltered => self.skipped_filtered += 1,
            UnitStatus::SkippedAborted => self.skipped_aborted += 1,
            UnitStatus::ErrorTimeout => self.error_timeout += 1,
            UnitStatus::ErrorWorkerCrashed => self.error_worker_crashed += 1,
        }
    }

    /// Total skipped units of any kind
    pub fn skipped(&self) -> usize {
        self.skipped_dependency_failed + self.skipped_filtered + self.skipped_aborted
    }

    /// Total errored units (timeouts and crashes)
    pub fn errors(&self) -> usize {
        self.error_timeout + self.error_worker_crashed
    }
}

impl<'a> FromIterator<&'a ResultRecord> for StatusCounts {
    fn from_iter<I: IntoIterator<Item = &'a ResultRecord>>(iter: I) -> Self {
        let mut counts = Self::default();
        for record in iter {
            counts.add(record.status);
        }
        counts
    }
}

/// Summary of one partition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionSummary {
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker: Option<usize>,
    pub counts: StatusCounts,
    /// Sum of unit durations
    #[serde(rename = "duration_ms", with = "duration_ms")]
    pub duration: Duration,
}

/// Terminal status of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    Success,
    Failure,
    Aborted,
}

impl RunStatus {
    /// Derive the terminal status from the records.
    ///
    /// Abort takes precedence; otherwise any failed or errored unit fails the
    /// run. Skipped units alone never do.
    pub fn from_records(records: &[ResultRecord], aborted: bool) -> Self {
        if aborted {
            Self::Aborted
        } else if records.iter().any(|r| r.status.is_failure()) {
            Self::Failure
        } else {
            Self::Success
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success => write!(f, "SUCCESS"),
            Self::Failure => write!(f, "FAILURE"),
            Self::Aborted => write!(f, "ABORTED"),
        }
    }
}

/// Final report of a run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    /// Records in global schedule order
    pub records: Vec<ResultRecord>,
    /// Partition summaries in partition order
    pub partitions: Vec<PartitionSummary>,
    pub totals: StatusCounts,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    #[serde(rename = "duration_ms", with = "duration_ms")]
    pub duration: Duration,
}

impl RunReport {
    /// Assemble a report from ordered records
    pub fn new(
        records: Vec<ResultRecord>,
        partition_order: &[String],
        workers: &HashMap<String, usize>,
        aborted: bool,
        started_at: DateTime<Utc>,
    ) -> Self {
        let finished_at = Utc::now();

        let mut grouped: HashMap<&str, (StatusCounts, Duration)> = HashMap::new();
        for record in &records {
            let (counts, duration) = grouped.entry(record.partition_key.as_str()).or_default();
            counts.add(record.status);
            *duration += record.duration;
        }
        let partitions = partition_order
            .iter()
            .map(|key| {
                let (counts, duration) = grouped.remove(key.as_str()).unwrap_or_default();
                PartitionSummary {
                    key: key.clone(),
                    worker: workers.get(key).copied(),
                    counts,
                    duration,
                }
            })
            .collect();

        Self {
            totals: records.iter().collect(),
            status: RunStatus::from_records(&records, aborted),
            records,
            partitions,
            started_at,
            finished_at,
            duration: (finished_at - started_at).to_std().unwrap_or_default(),
        }
    }

    /// Look up a unit's record
    pub fn record(&self, unit_id: &str) -> Option<&ResultRecord> {
        self.records.iter().find(|r| r.unit_id == unit_id)
    }

    /// Look up a partition summary
    pub fn partition(&self, key: &str) -> Option<&PartitionSummary> {
        self.partitions.iter().find(|p| p.key == key)
    }

    /// Unit ids in report order
    pub fn unit_ids(&self) -> Vec<&str> {
        self.records.iter().map(|r| r.unit_id.as_str()).collect()
    }

    /// Serialize to pretty JSON
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: &str, partition: &str, status: UnitStatus) -> ResultRecord {
        ResultRecord::new(id, partition, status).with_duration(Duration::from_millis(20))
    }

    #[test]
    fn test_run_status_precedence() {
        let passed = vec![record("a", "p", UnitStatus::Passed)];
        let skipped = vec![
            record("a", "p", UnitStatus::Passed),
            record("b", "p", UnitStatus::SkippedFiltered),
            record("c", "p", UnitStatus::SkippedDependencyFailed),
        ];
        let failed = vec![
            record("a", "p", UnitStatus::Passed),
            record("b", "p", UnitStatus::ErrorTimeout),
        ];

        assert_eq!(RunStatus::from_records(&passed, false), RunStatus::Success);
        assert_eq!(RunStatus::from_records(&skipped, false), RunStatus::Success);
        assert_eq!(RunStatus::from_records(&failed, false), RunStatus::Failure);
        assert_eq!(RunStatus::from_records(&failed, true), RunStatus::Aborted);
        assert_eq!(RunStatus::from_records(&[], false), RunStatus::Success);
    }

    #[test]
    fn test_report_summaries() {
        let records = vec![
            record("auth::login", "auth", UnitStatus::Passed),
            record("users::list", "users", UnitStatus::Failed),
            record("auth::logout", "auth", UnitStatus::SkippedDependencyFailed),
        ];
        let workers: HashMap<String, usize> = [("auth".to_string(), 1)].into();
        let report = RunReport::new(
            records,
            &["auth".to_string(), "users".to_string(), "orders".to_string()],
            &workers,
            false,
            Utc::now(),
        );

        assert_eq!(report.status, RunStatus::Failure);
        assert_eq!(report.totals.total, 3);
        assert_eq!(report.totals.skipped(), 1);

        let auth = report.partition("auth").unwrap();
        assert_eq!(auth.worker, Some(1));
        assert_eq!(auth.counts.passed, 1);
        assert_eq!(auth.duration, Duration::from_millis(40));
        assert_eq!(report.partition("users").unwrap().worker, None);
        assert_eq!(report.partition("users").unwrap().counts.failed, 1);
        let orders = report.partition("orders").unwrap();
        assert_eq!(orders.counts, StatusCounts::default());
        assert_eq!(orders.duration, Duration::ZERO);
        assert_eq!(
            report.unit_ids(),
            vec!["auth::login", "users::list", "auth::logout"]
        );
    }

    #[test]
    fn test_report_json_shape() {
        let records = vec![record("a", "p", UnitStatus::ErrorWorkerCrashed).with_detail("boom")];
        let report = RunReport::new(records, &["p".to_string()], &HashMap::new(), false, Utc::now());
        let value: serde_json::Value = serde_json::from_str(&report.to_json().unwrap()).unwrap();

        assert_eq!(value["status"], "FAILURE");
        assert_eq!(value["records"][0]["status"], "ERROR_WORKER_CRASHED");
        assert_eq!(value["records"][0]["duration_ms"], 20);
        assert_eq!(value["records"][0]["error_detail"], "boom");
        assert_eq!(value["totals"]["error_worker_crashed"], 1);
    }

    #[test]
    fn test_status_classification() {
        assert!(UnitStatus::Passed.is_passed());
        assert!(UnitStatus::SkippedAborted.is_skipped());
        assert!(!UnitStatus::SkippedAborted.is_failure());
        assert!(UnitStatus::ErrorWorkerCrashed.is_failure());
    }
}
