//! Dependency graph construction and validation

use std::collections::{HashMap, HashSet};

use tracing::{info, instrument, warn};

use gantry_core::{FilteredDependencyPolicy, TestUnit};

use crate::error::ValidationError;

/// A node in the dependency graph arena
#[derive(Debug, Clone)]
pub struct GraphNode {
    /// The unit descriptor
    pub unit: TestUnit,
    /// Position in discovery order
    pub discovery_index: usize,
    /// Arena indices of units that must complete first
    dependencies: Vec<usize>,
    /// Arena indices of units waiting on this one, in discovery order
    dependents: Vec<usize>,
    /// Dependencies dropped because they were filtered out
    filtered_dependencies: Vec<String>,
    /// Recorded as filtered without running (skip policy)
    blocked_by_filter: bool,
}

impl GraphNode {
    /// Dependencies that were removed by filtering
    pub fn filtered_dependencies(&self) -> &[String] {
        &self.filtered_dependencies
    }

    /// Whether this unit must be recorded as filtered instead of running
    pub fn is_blocked_by_filter(&self) -> bool {
        self.blocked_by_filter
    }

    pub(crate) fn dependency_indices(&self) -> &[usize] {
        &self.dependencies
    }

    pub(crate) fn dependent_indices(&self) -> &[usize] {
        &self.dependents
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum VisitState {
    Unvisited,
    InProgress,
    Done,
}

/// Validated directed acyclic graph of test units.
///
/// An edge A -> B means A must complete before B starts, i.e. B lists A in
/// its `depends_on`.
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    nodes: Vec<GraphNode>,
    index: HashMap<String, usize>,
    warnings: Vec<String>,
}

impl DependencyGraph {
    /// Build a graph where every dependency must be present in `units`
    pub fn build(units: Vec<TestUnit>) -> Result<Self, ValidationError> {
        Self::build_filtered(units, &HashSet::new(), FilteredDependencyPolicy::Satisfied)
    }

    /// Build a graph from the units that survived filtering.
    ///
    /// `removed` holds the ids dropped by the filter; dependencies on them are
    /// handled according to `policy` instead of being reported as unknown.
    #[instrument(skip_all, fields(units = units.len(), removed = removed.len()))]
    pub fn build_filtered(
        units: Vec<TestUnit>,
        removed: &HashSet<String>,
        policy: FilteredDependencyPolicy,
    ) -> Result<Self, ValidationError> {
        Self::assemble(units, removed, policy, true)
    }

    /// Build without cycle detection, for exercising scheduler invariants
    #[cfg(test)]
    pub(crate) fn build_unchecked(units: Vec<TestUnit>) -> Result<Self, ValidationError> {
        Self::assemble(
            units,
            &HashSet::new(),
            FilteredDependencyPolicy::Satisfied,
            false,
        )
    }

    fn assemble(
        units: Vec<TestUnit>,
        removed: &HashSet<String>,
        policy: FilteredDependencyPolicy,
        validate_acyclic: bool,
    ) -> Result<Self, ValidationError> {
        let mut graph = Self::default();

        for unit in units {
            if graph.index.contains_key(&unit.id) {
                return Err(ValidationError::DuplicateId(unit.id));
            }
            let discovery_index = graph.nodes.len();
            graph.index.insert(unit.id.clone(), discovery_index);
            graph.nodes.push(GraphNode {
                unit,
                discovery_index,
                dependencies: Vec::new(),
                dependents: Vec::new(),
                filtered_dependencies: Vec::new(),
                blocked_by_filter: false,
            });
        }

        // Wire up edges
        for i in 0..graph.nodes.len() {
            let deps: Vec<String> = graph.nodes[i].unit.depends_on.iter().cloned().collect();
            for dep in deps {
                if let Some(&j) = graph.index.get(&dep) {
                    graph.nodes[i].dependencies.push(j);
                    graph.nodes[j].dependents.push(i);
                    continue;
                }

                let unit_id = graph.nodes[i].unit.id.clone();
                if !removed.contains(&dep) {
                    return Err(ValidationError::UnknownDependency {
                        unit: unit_id,
                        dependency: dep,
                    });
                }

                match policy {
                    FilteredDependencyPolicy::Reject => {
                        return Err(ValidationError::FilteredDependency {
                            unit: unit_id,
                            dependency: dep,
                        });
                    }
                    FilteredDependencyPolicy::Satisfied => {
                        warn!(unit = %unit_id, dependency = %dep, "dependency was filtered out, treating it as satisfied");
                        graph.warnings.push(format!(
                            "'{}' depends on filtered-out '{}'; treated as satisfied",
                            unit_id, dep
                        ));
                    }
                    FilteredDependencyPolicy::Skip => {
                        warn!(unit = %unit_id, dependency = %dep, "dependency was filtered out, unit will be skipped");
                        graph.warnings.push(format!(
                            "'{}' depends on filtered-out '{}'; unit will be skipped",
                            unit_id, dep
                        ));
                        graph.nodes[i].blocked_by_filter = true;
                    }
                }
                graph.nodes[i].filtered_dependencies.push(dep);
            }
        }

        if validate_acyclic {
            Self::detect_cycle(&graph.nodes)?;
        }

        info!(
            units = graph.nodes.len(),
            edges = graph.edge_count(),
            warnings = graph.warnings.len(),
            "dependency graph built"
        );
        Ok(graph)
    }

    /// Three-state depth-first traversal along execution edges.
    ///
    /// Reaching a node that is still in progress means the current stack
    /// closes a cycle; the reported path starts and ends with the same id.
    fn detect_cycle(nodes: &[GraphNode]) -> Result<(), ValidationError> {
        let mut state = vec![VisitState::Unvisited; nodes.len()];

        for root in 0..nodes.len() {
            if state[root] != VisitState::Unvisited {
                continue;
            }

            // (node, cursor into its dependents)
            let mut stack: Vec<(usize, usize)> = vec![(root, 0)];
            state[root] = VisitState::InProgress;

            while let Some(frame) = stack.last_mut() {
                let node = frame.0;
                let Some(&next) = nodes[node].dependents.get(frame.1) else {
                    state[node] = VisitState::Done;
                    stack.pop();
                    continue;
                };
                frame.1 += 1;

                match state[next] {
                    VisitState::Unvisited => {
                        state[next] = VisitState::InProgress;
                        stack.push((next, 0));
                    }
                    VisitState::InProgress => {
                        let start = stack.iter().position(|(n, _)| *n == next).unwrap_or(0);
                        let mut path: Vec<String> = stack[start..]
                            .iter()
                            .map(|(n, _)| nodes[*n].unit.id.clone())
                            .collect();
                        path.push(nodes[next].unit.id.clone());
                        return Err(ValidationError::CyclicDependency { path });
                    }
                    VisitState::Done => {}
                }
            }
        }

        Ok(())
    }

    /// Get a node by unit id
    pub fn node(&self, id: &str) -> Option<&GraphNode> {
        self.index.get(id).map(|&i| &self.nodes[i])
    }

    /// Get a unit by id
    pub fn get(&self, id: &str) -> Option<&TestUnit> {
        self.node(id).map(|n| &n.unit)
    }

    /// All nodes in discovery order
    pub fn nodes(&self) -> &[GraphNode] {
        &self.nodes
    }

    pub(crate) fn node_at(&self, index: usize) -> &GraphNode {
        &self.nodes[index]
    }

    /// All units in discovery order
    pub fn units(&self) -> impl Iterator<Item = &TestUnit> {
        self.nodes.iter().map(|n| &n.unit)
    }

    /// Position of a unit in discovery order
    pub fn discovery_index(&self, id: &str) -> Option<usize> {
        self.index.get(id).copied()
    }

    /// Direct dependencies of a unit that are part of the graph
    pub fn dependencies_of(&self, id: &str) -> Vec<&str> {
        self.node(id)
            .map(|n| {
                n.dependencies
                    .iter()
                    .map(|&j| self.nodes[j].unit.id.as_str())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Direct dependents of a unit, in discovery order
    pub fn dependents_of(&self, id: &str) -> Vec<&str> {
        self.node(id)
            .map(|n| {
                n.dependents
                    .iter()
                    .map(|&j| self.nodes[j].unit.id.as_str())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Build-time warnings (filtered dependencies)
    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }

    /// Number of edges
    pub fn edge_count(&self) -> usize {
        self.nodes.iter().map(|n| n.dependencies.len()).sum()
    }

    /// Number of units
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Check if the graph is empty
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gantry_core::Executable;

    fn unit(id: &str, deps: &[&str]) -> TestUnit {
        deps.iter().fold(
            TestUnit::new(id, "svc", Executable::shell("true")),
            |u, d| u.depends_on(*d),
        )
    }

    #[test]
    fn test_build_graph() {
        let graph = DependencyGraph::build(vec![
            unit("login", &[]),
            unit("create_user", &["login"]),
            unit("create_order", &["login", "create_user"]),
        ])
        .unwrap();

        assert_eq!(graph.len(), 3);
        assert_eq!(graph.edge_count(), 3);
        assert_eq!(graph.dependents_of("login"), vec!["create_user", "create_order"]);
        assert_eq!(graph.discovery_index("create_order"), Some(2));
        assert!(graph.warnings().is_empty());
    }

    #[test]
    fn test_empty_graph() {
        let graph = DependencyGraph::build(Vec::new()).unwrap();
        assert!(graph.is_empty());
    }

    #[test]
    fn test_duplicate_id() {
        let err = DependencyGraph::build(vec![unit("a", &[]), unit("a", &[])]).unwrap_err();
        assert_eq!(err, ValidationError::DuplicateId("a".to_string()));
    }

    #[test]
    fn test_unknown_dependency() {
        let err = DependencyGraph::build(vec![unit("a", &["ghost"])]).unwrap_err();
        assert_eq!(
            err,
            ValidationError::UnknownDependency {
                unit: "a".to_string(),
                dependency: "ghost".to_string(),
            }
        );
    }

    #[test]
    fn test_three_node_cycle() {
        // A -> B -> C -> A
        let err = DependencyGraph::build(vec![
            unit("A", &["C"]),
            unit("B", &["A"]),
            unit("C", &["B"]),
        ])
        .unwrap_err();

        match err {
            ValidationError::CyclicDependency { path } => {
                assert_eq!(path, vec!["A", "B", "C", "A"]);
            }
            other => panic!("expected cycle, got {:?}", other),
        }
    }

    #[test]
    fn test_self_dependency_is_a_cycle() {
        let err = DependencyGraph::build(vec![unit("solo", &["solo"])]).unwrap_err();
        assert_eq!(
            err,
            ValidationError::CyclicDependency {
                path: vec!["solo".to_string(), "solo".to_string()],
            }
        );
    }

    #[test]
    fn test_cycle_behind_acyclic_prefix() {
        let err = DependencyGraph::build(vec![
            unit("root", &[]),
            unit("x", &["root", "z"]),
            unit("y", &["x"]),
            unit("z", &["y"]),
        ])
        .unwrap_err();

        match err {
            ValidationError::CyclicDependency { path } => {
                assert_eq!(path.first(), path.last());
                assert!(!path.contains(&"root".to_string()));
                assert_eq!(path.len(), 4);
            }
            other => panic!("expected cycle, got {:?}", other),
        }
    }

    #[test]
    fn test_diamond_is_not_a_cycle() {
        let graph = DependencyGraph::build(vec![
            unit("a", &[]),
            unit("b", &["a"]),
            unit("c", &["a"]),
            unit("d", &["b", "c"]),
        ])
        .unwrap();
        assert_eq!(graph.dependencies_of("d"), vec!["b", "c"]);
    }

    #[test]
    fn test_filtered_dependency_treated_as_satisfied() {
        let removed: HashSet<String> = ["slow_setup".to_string()].into();
        let graph = DependencyGraph::build_filtered(
            vec![unit("a", &["slow_setup"])],
            &removed,
            FilteredDependencyPolicy::Satisfied,
        )
        .unwrap();

        let node = graph.node("a").unwrap();
        assert!(!node.is_blocked_by_filter());
        assert_eq!(node.filtered_dependencies(), ["slow_setup".to_string()]);
        assert!(graph.dependencies_of("a").is_empty());
        assert_eq!(graph.warnings().len(), 1);
    }

    #[test]
    fn test_filtered_dependency_skip_policy() {
        let removed: HashSet<String> = ["slow_setup".to_string()].into();
        let graph = DependencyGraph::build_filtered(
            vec![unit("a", &["slow_setup"]), unit("b", &["a"])],
            &removed,
            FilteredDependencyPolicy::Skip,
        )
        .unwrap();

        assert!(graph.node("a").unwrap().is_blocked_by_filter());
        assert!(!graph.node("b").unwrap().is_blocked_by_filter());
    }

    #[test]
    fn test_filtered_dependency_reject_policy() {
        let removed: HashSet<String> = ["slow_setup".to_string()].into();
        let err = DependencyGraph::build_filtered(
            vec![unit("a", &["slow_setup"])],
            &removed,
            FilteredDependencyPolicy::Reject,
        )
        .unwrap_err();
        assert!(matches!(err, ValidationError::FilteredDependency { .. }));
    }
}
