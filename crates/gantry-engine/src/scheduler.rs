//! Stage scheduling - deterministic topological order with priority tie-breaks

use std::cmp::Reverse;
use std::collections::HashMap;

use serde::Serialize;
use tracing::{debug, info, instrument};

use crate::dag::DependencyGraph;
use crate::error::SchedulingError;

/// A set of mutually independent units whose dependencies all ran in earlier
/// stages. Ordered by descending priority, then discovery order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Stage {
    /// Stage number, starting at 0
    pub index: usize,
    /// Unit ids in execution order
    pub units: Vec<String>,
}

impl Stage {
    /// Number of units in the stage
    pub fn len(&self) -> usize {
        self.units.len()
    }

    /// Check if the stage is empty
    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }
}

/// Totally ordered sequence of stages
#[derive(Debug, Clone, Default)]
pub struct Schedule {
    stages: Vec<Stage>,
    order: Vec<String>,
    positions: HashMap<String, usize>,
}

impl Schedule {
    fn from_stages(stages: Vec<Stage>) -> Self {
        let order: Vec<String> = stages.iter().flat_map(|s| s.units.iter().cloned()).collect();
        let positions = order
            .iter()
            .enumerate()
            .map(|(i, id)| (id.clone(), i))
            .collect();
        Self {
            stages,
            order,
            positions,
        }
    }

    /// All stages in execution order
    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    /// Flattened global schedule order
    pub fn order(&self) -> &[String] {
        &self.order
    }

    /// Position of a unit in the global order
    pub fn position(&self, id: &str) -> Option<usize> {
        self.positions.get(id).copied()
    }

    /// Number of scheduled units
    pub fn len(&self) -> usize {
        self.order.len()
    }

    /// Check if nothing was scheduled
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Get a human-readable summary of the schedule
    pub fn execution_plan(&self, graph: &DependencyGraph) -> String {
        let mut plan = String::new();
        for stage in &self.stages {
            plan.push_str(&format!("Stage {} ({} units):\n", stage.index, stage.len()));
            for id in &stage.units {
                let Some(unit) = graph.get(id) else {
                    continue;
                };
                let deps = graph.dependencies_of(id);
                if deps.is_empty() {
                    plan.push_str(&format!(
                        "  {} [{}, {}]\n",
                        id, unit.priority, unit.partition_key
                    ));
                } else {
                    plan.push_str(&format!(
                        "  {} [{}, {}] (after: {})\n",
                        id,
                        unit.priority,
                        unit.partition_key,
                        deps.join(", ")
                    ));
                }
            }
        }
        plan
    }
}

/// Computes stages from a validated graph
#[derive(Debug, Default, Clone, Copy)]
pub struct Scheduler;

impl Scheduler {
    /// Repeated frontier extraction (Kahn's algorithm).
    ///
    /// Each frontier of zero in-degree units becomes one stage; completing a
    /// stage releases successors into the next frontier.
    #[instrument(skip_all, fields(units = graph.len()))]
    pub fn schedule(graph: &DependencyGraph) -> Result<Schedule, SchedulingError> {
        let mut in_degree: Vec<usize> = graph
            .nodes()
            .iter()
            .map(|n| n.dependency_indices().len())
            .collect();

        let mut frontier: Vec<usize> = (0..graph.len()).filter(|&i| in_degree[i] == 0).collect();
        let mut stages: Vec<Stage> = Vec::new();
        let mut scheduled = 0;

        while !frontier.is_empty() {
            frontier.sort_by_key(|&i| (Reverse(graph.node_at(i).unit.priority), i));

            let mut next = Vec::new();
            for &i in &frontier {
                for &dependent in graph.node_at(i).dependent_indices() {
                    in_degree[dependent] -= 1;
                    if in_degree[dependent] == 0 {
                        next.push(dependent);
                    }
                }
            }

            scheduled += frontier.len();
            let stage = Stage {
                index: stages.len(),
                units: frontier
                    .iter()
                    .map(|&i| graph.node_at(i).unit.id.clone())
                    .collect(),
            };
            debug!(stage = stage.index, units = stage.len(), "stage scheduled");
            stages.push(stage);
            frontier = next;
        }

        if scheduled != graph.len() {
            let remaining = (0..graph.len())
                .filter(|&i| in_degree[i] > 0)
                .map(|i| graph.node_at(i).unit.id.clone())
                .collect();
            return Err(SchedulingError::FrontierExhausted { remaining });
        }

        info!(stages = stages.len(), units = scheduled, "schedule computed");
        Ok(Schedule::from_stages(stages))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gantry_core::{Executable, Priority, TestUnit};

    fn unit(id: &str, priority: Priority, deps: &[&str]) -> TestUnit {
        deps.iter().fold(
            TestUnit::new(id, "svc", Executable::shell("true")).with_priority(priority),
            |u, d| u.depends_on(*d),
        )
    }

    fn sample_units() -> Vec<TestUnit> {
        vec![
            unit("health", Priority::Low, &[]),
            unit("login", Priority::Critical, &[]),
            unit("signup", Priority::Medium, &[]),
            unit("profile", Priority::High, &["login"]),
            unit("orders", Priority::Medium, &["login", "signup"]),
            unit("checkout", Priority::Critical, &["orders", "profile"]),
            unit("audit", Priority::Medium, &[]),
        ]
    }

    #[test]
    fn test_empty_schedule() {
        let graph = DependencyGraph::build(Vec::new()).unwrap();
        let schedule = Scheduler::schedule(&graph).unwrap();
        assert!(schedule.is_empty());
        assert!(schedule.stages().is_empty());
    }

    #[test]
    fn test_stages_respect_priority_then_discovery() {
        let graph = DependencyGraph::build(sample_units()).unwrap();
        let schedule = Scheduler::schedule(&graph).unwrap();

        let stages: Vec<Vec<&str>> = schedule
            .stages()
            .iter()
            .map(|s| s.units.iter().map(String::as_str).collect())
            .collect();

        assert_eq!(
            stages,
            vec![
                vec!["login", "signup", "audit", "health"],
                vec!["profile", "orders"],
                vec!["checkout"],
            ]
        );
    }

    #[test]
    fn test_dependencies_always_in_earlier_stage() {
        let graph = DependencyGraph::build(sample_units()).unwrap();
        let schedule = Scheduler::schedule(&graph).unwrap();

        let stage_of: HashMap<&str, usize> = schedule
            .stages()
            .iter()
            .flat_map(|s| s.units.iter().map(move |u| (u.as_str(), s.index)))
            .collect();

        for unit in graph.units() {
            for dep in &unit.depends_on {
                assert!(
                    stage_of[dep.as_str()] < stage_of[unit.id.as_str()],
                    "{} scheduled before its dependency {}",
                    unit.id,
                    dep
                );
            }
        }
    }

    #[test]
    fn test_schedule_is_reproducible() {
        let first = Scheduler::schedule(&DependencyGraph::build(sample_units()).unwrap()).unwrap();
        for _ in 0..10 {
            let again =
                Scheduler::schedule(&DependencyGraph::build(sample_units()).unwrap()).unwrap();
            assert_eq!(again.stages(), first.stages());
            assert_eq!(again.order(), first.order());
        }
    }

    #[test]
    fn test_positions_follow_global_order() {
        let graph = DependencyGraph::build(sample_units()).unwrap();
        let schedule = Scheduler::schedule(&graph).unwrap();

        assert_eq!(schedule.len(), 7);
        for (i, id) in schedule.order().iter().enumerate() {
            assert_eq!(schedule.position(id), Some(i));
        }
        assert_eq!(schedule.position("checkout"), Some(6));
        assert_eq!(schedule.position("missing"), None);
    }

    #[test]
    fn test_equal_priority_keeps_discovery_order() {
        let units = (0..5)
            .map(|i| unit(&format!("t{}", i), Priority::Medium, &[]))
            .collect();
        let graph = DependencyGraph::build(units).unwrap();
        let schedule = Scheduler::schedule(&graph).unwrap();
        assert_eq!(schedule.order(), ["t0", "t1", "t2", "t3", "t4"]);
    }

    #[test]
    fn test_frontier_exhausted_on_cycle() {
        let graph = DependencyGraph::build_unchecked(vec![
            unit("free", Priority::Medium, &[]),
            unit("a", Priority::Medium, &["b"]),
            unit("b", Priority::Medium, &["a"]),
        ])
        .unwrap();

        let err = Scheduler::schedule(&graph).unwrap_err();
        assert_eq!(
            err,
            SchedulingError::FrontierExhausted {
                remaining: vec!["a".to_string(), "b".to_string()],
            }
        );
    }

    #[test]
    fn test_execution_plan_output() {
        let graph = DependencyGraph::build(sample_units()).unwrap();
        let schedule = Scheduler::schedule(&graph).unwrap();
        let plan = schedule.execution_plan(&graph);

        assert!(plan.contains("Stage 0 (4 units)"));
        assert!(plan.contains("checkout [critical, svc] (after: orders, profile)"));
    }
}
