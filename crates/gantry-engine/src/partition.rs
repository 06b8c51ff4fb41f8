//! Partitioning of the schedule into isolation groups

use std::collections::HashMap;

use serde::Serialize;
use tracing::{debug, info};

use gantry_core::ParallelMode;

use crate::dag::DependencyGraph;
use crate::error::PartitionError;
use crate::scheduler::Schedule;

/// Units sharing a partition key, in global schedule order
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Partition {
    /// Partition key (service name)
    pub key: String,
    /// Unit ids in schedule order
    pub units: Vec<String>,
}

impl Partition {
    /// Number of units
    pub fn len(&self) -> usize {
        self.units.len()
    }

    /// Check if the partition is empty
    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }
}

/// Partitions ordered by the schedule position of their first unit
#[derive(Debug, Clone, Default)]
pub struct PartitionSet {
    partitions: Vec<Partition>,
}

impl PartitionSet {
    /// All partitions
    pub fn partitions(&self) -> &[Partition] {
        &self.partitions
    }

    /// Look up a partition by key
    pub fn get(&self, key: &str) -> Option<&Partition> {
        self.partitions.iter().find(|p| p.key == key)
    }

    /// Number of partitions
    pub fn len(&self) -> usize {
        self.partitions.len()
    }

    /// Check if there are no partitions
    pub fn is_empty(&self) -> bool {
        self.partitions.is_empty()
    }

    /// Iterate over partitions
    pub fn iter(&self) -> std::slice::Iter<'_, Partition> {
        self.partitions.iter()
    }
}

impl IntoIterator for PartitionSet {
    type Item = Partition;
    type IntoIter = std::vec::IntoIter<Partition>;

    fn into_iter(self) -> Self::IntoIter {
        self.partitions.into_iter()
    }
}

/// Splits a schedule into partitions
#[derive(Debug, Default, Clone, Copy)]
pub struct Partitioner;

impl Partitioner {
    /// Group scheduled units by partition key.
    ///
    /// Only service-level partitioning exists; test-level mode is rejected
    /// rather than silently downgraded.
    pub fn partition(
        graph: &DependencyGraph,
        schedule: &Schedule,
        mode: ParallelMode,
    ) -> Result<PartitionSet, PartitionError> {
        if mode != ParallelMode::Service {
            return Err(PartitionError::UnsupportedMode(mode));
        }

        let mut partitions: Vec<Partition> = Vec::new();
        let mut by_key: HashMap<&str, usize> = HashMap::new();

        for id in schedule.order() {
            let Some(unit) = graph.get(id) else {
                continue;
            };
            let slot = *by_key.entry(unit.partition_key.as_str()).or_insert_with(|| {
                partitions.push(Partition {
                    key: unit.partition_key.clone(),
                    units: Vec::new(),
                });
                partitions.len() - 1
            });
            partitions[slot].units.push(id.clone());
        }

        for partition in &partitions {
            debug!(partition = %partition.key, units = partition.len(), "partition built");
        }
        info!(partitions = partitions.len(), %mode, "schedule partitioned");

        Ok(PartitionSet { partitions })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::Scheduler;
    use gantry_core::{Executable, Priority, TestUnit};

    fn unit(id: &str, partition: &str, priority: Priority, deps: &[&str]) -> TestUnit {
        deps.iter().fold(
            TestUnit::new(id, partition, Executable::shell("true")).with_priority(priority),
            |u, d| u.depends_on(*d),
        )
    }

    fn plan(units: Vec<TestUnit>) -> (DependencyGraph, Schedule) {
        let graph = DependencyGraph::build(units).unwrap();
        let schedule = Scheduler::schedule(&graph).unwrap();
        (graph, schedule)
    }

    #[test]
    fn test_partitions_follow_schedule_order() {
        let (graph, schedule) = plan(vec![
            unit("users::list", "users", Priority::Low, &[]),
            unit("auth::login", "auth", Priority::Critical, &[]),
            unit("users::create", "users", Priority::High, &["auth::login"]),
            unit("auth::logout", "auth", Priority::Medium, &["auth::login"]),
        ]);

        let set = Partitioner::partition(&graph, &schedule, ParallelMode::Service).unwrap();
        assert_eq!(set.len(), 2);

        // auth::login is first in the schedule, so auth comes first
        let keys: Vec<_> = set.iter().map(|p| p.key.as_str()).collect();
        assert_eq!(keys, vec!["auth", "users"]);

        assert_eq!(
            set.get("users").unwrap().units,
            vec!["users::list", "users::create"]
        );
        assert_eq!(
            set.get("auth").unwrap().units,
            vec!["auth::login", "auth::logout"]
        );
    }

    #[test]
    fn test_every_unit_in_exactly_one_partition() {
        let (graph, schedule) = plan(vec![
            unit("a", "one", Priority::Medium, &[]),
            unit("b", "two", Priority::Medium, &["a"]),
            unit("c", "one", Priority::Medium, &["b"]),
            unit("d", "three", Priority::Medium, &[]),
        ]);

        let set = Partitioner::partition(&graph, &schedule, ParallelMode::Service).unwrap();
        let total: usize = set.iter().map(Partition::len).sum();
        assert_eq!(total, 4);
        assert!(set.get("missing").is_none());
    }

    #[test]
    fn test_empty_schedule_gives_no_partitions() {
        let (graph, schedule) = plan(Vec::new());
        let set = Partitioner::partition(&graph, &schedule, ParallelMode::Service).unwrap();
        assert!(set.is_empty());
    }

    #[test]
    fn test_test_mode_is_rejected() {
        let (graph, schedule) = plan(vec![unit("a", "one", Priority::Medium, &[])]);
        let err = Partitioner::partition(&graph, &schedule, ParallelMode::Test).unwrap_err();
        assert_eq!(err, PartitionError::UnsupportedMode(ParallelMode::Test));
    }
}
