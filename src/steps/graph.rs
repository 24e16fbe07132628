//! Dependency graph over the step table.
//!
//! The graph is built once at startup. A duplicate id, an unknown dependency
//! or a cycle is a programming error and is reported as a [`RegistryError`].

use super::StepDef;
use crate::errors::RegistryError;
use std::collections::HashMap;

/// Index into the step table.
pub type StepIndex = usize;

/// A validated directed acyclic graph of steps.
#[derive(Debug)]
pub struct StepGraph {
    steps: Vec<StepDef>,
    index_map: HashMap<&'static str, StepIndex>,
    /// index -> steps it depends on
    reverse_edges: Vec<Vec<StepIndex>>,
    /// Topological order, ties broken by table position
    order: Vec<StepIndex>,
}

impl StepGraph {
    /// Build and validate a graph from a step table.
    pub fn build(steps: Vec<StepDef>) -> Result<Self, RegistryError> {
        let mut index_map = HashMap::new();
        for (i, step) in steps.iter().enumerate() {
            if index_map.insert(step.id, i).is_some() {
                return Err(RegistryError::DuplicateStep(step.id.to_string()));
            }
        }

        let mut forward_edges: Vec<Vec<StepIndex>> = vec![Vec::new(); steps.len()];
        let mut reverse_edges: Vec<Vec<StepIndex>> = vec![Vec::new(); steps.len()];

        for (to_idx, step) in steps.iter().enumerate() {
            for dep in step.dependencies {
                let from_idx =
                    *index_map
                        .get(dep)
                        .ok_or_else(|| RegistryError::UnknownDependency {
                            step: step.id.to_string(),
                            dependency: dep.to_string(),
                        })?;
                forward_edges[from_idx].push(to_idx);
                reverse_edges[to_idx].push(from_idx);
            }
        }

        let order = topological_order(&steps, &forward_edges, &reverse_edges)?;

        Ok(Self {
            steps,
            index_map,
            reverse_edges,
            order,
        })
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// Steps in table order.
    pub fn steps(&self) -> &[StepDef] {
        &self.steps
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&StepDef> {
        self.index_map.get(id).map(|&i| &self.steps[i])
    }

    pub fn contains(&self, id: &str) -> bool {
        self.index_map.contains_key(id)
    }

    /// Steps in dependency order.
    pub fn ordered(&self) -> impl Iterator<Item = &StepDef> {
        self.order.iter().map(|&i| &self.steps[i])
    }

    /// Ids of the steps `id` depends on.
    pub fn dependencies(&self, id: &str) -> Vec<&'static str> {
        self.index_map
            .get(id)
            .map(|&i| self.reverse_edges[i].iter().map(|&d| self.steps[d].id).collect())
            .unwrap_or_default()
    }
}

/// Kahn's algorithm. Among ready steps the one earliest in the table runs first,
/// so the order is deterministic and matches the table when the table is sorted.
fn topological_order(
    steps: &[StepDef],
    forward_edges: &[Vec<StepIndex>],
    reverse_edges: &[Vec<StepIndex>],
) -> Result<Vec<StepIndex>, RegistryError> {
    let mut in_degree: Vec<usize> = reverse_edges.iter().map(|deps| deps.len()).collect();
    let mut ready: Vec<StepIndex> = in_degree
        .iter()
        .enumerate()
        .filter(|&(_, deg)| *deg == 0)
        .map(|(i, _)| i)
        .collect();
    let mut order = Vec::with_capacity(steps.len());

    while !ready.is_empty() {
        ready.sort_unstable_by(|a, b| b.cmp(a));
        let Some(node) = ready.pop() else { break };
        order.push(node);
        for &dependent in &forward_edges[node] {
            in_degree[dependent] -= 1;
            if in_degree[dependent] == 0 {
                ready.push(dependent);
            }
        }
    }

    if order.len() != steps.len() {
        let stuck: Vec<&str> = in_degree
            .iter()
            .enumerate()
            .filter(|&(_, deg)| *deg > 0)
            .map(|(i, _)| steps[i].id)
            .collect();
        return Err(RegistryError::Cycle(stuck.join(", ")));
    }

    Ok(order)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::steps::StepKind;

    fn step(id: &'static str, dependencies: &'static [&'static str]) -> StepDef {
        StepDef {
            id,
            label: id,
            description: "",
            dependencies,
            kind: StepKind::ValidateConfig,
        }
    }

    #[test]
    fn test_linear_graph_orders_by_dependency() {
        let graph =
            StepGraph::build(vec![step("c", &["b"]), step("a", &[]), step("b", &["a"])]).unwrap();
        let ids: Vec<&str> = graph.ordered().map(|s| s.id).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_ties_follow_table_order() {
        let graph = StepGraph::build(vec![
            step("root", &[]),
            step("x", &["root"]),
            step("y", &["root"]),
            step("join", &["y", "x"]),
        ])
        .unwrap();
        let ids: Vec<&str> = graph.ordered().map(|s| s.id).collect();
        assert_eq!(ids, vec!["root", "x", "y", "join"]);
    }

    #[test]
    fn test_unknown_dependency_is_rejected() {
        let err = StepGraph::build(vec![step("a", &["ghost"])]).unwrap_err();
        assert_eq!(
            err,
            RegistryError::UnknownDependency {
                step: "a".into(),
                dependency: "ghost".into()
            }
        );
    }

    #[test]
    fn test_duplicate_id_is_rejected() {
        let err = StepGraph::build(vec![step("a", &[]), step("a", &[])]).unwrap_err();
        assert_eq!(err, RegistryError::DuplicateStep("a".into()));
    }

    #[test]
    fn test_cycle_is_rejected() {
        let err = StepGraph::build(vec![
            step("a", &["c"]),
            step("b", &["a"]),
            step("c", &["b"]),
        ])
        .unwrap_err();
        match err {
            RegistryError::Cycle(members) => {
                assert!(members.contains('a'));
                assert!(members.contains('c'));
            }
            other => panic!("Expected Cycle, got {:?}", other),
        }
    }

    #[test]
    fn test_dependencies_lookup() {
        let graph =
            StepGraph::build(vec![step("a", &[]), step("b", &["a"]), step("c", &["a"])]).unwrap();
        assert_eq!(graph.dependencies("c"), vec!["a"]);
        assert!(graph.dependencies("missing").is_empty());
    }
}
