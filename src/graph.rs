//! Task dependency graph

use std::collections::{BTreeSet, HashMap};

use serde::{Deserialize, Serialize};

use crate::error::CouncilError;
use crate::types::{TaskName, TaskState};

/// A task and the tasks it must wait for
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskSpec {
    pub name: TaskName,
    #[serde(default)]
    pub depends_on: BTreeSet<TaskName>,
}

impl TaskSpec {
    pub fn new(name: TaskName, depends_on: impl IntoIterator<Item = TaskName>) -> Self {
        Self {
            name,
            depends_on: depends_on.into_iter().collect(),
        }
    }

    /// A task with no declared dependencies
    pub fn independent(name: TaskName) -> Self {
        Self::new(name, [])
    }

    /// Linear chain: every task depends on its predecessor
    pub fn chain(order: &[TaskName]) -> Vec<TaskSpec> {
        order
            .iter()
            .enumerate()
            .map(|(i, name)| match i {
                0 => TaskSpec::independent(*name),
                _ => TaskSpec::new(*name, [order[i - 1]]),
            })
            .collect()
    }
}

#[derive(Debug, Clone)]
struct GraphNode {
    depends_on: Vec<TaskName>,
    dependents: Vec<TaskName>,
    state: TaskState,
}

/// Validated DAG over the tasks of one run
#[derive(Debug, Clone)]
pub struct TaskGraph {
    nodes: HashMap<TaskName, GraphNode>,
    /// Declaration order, used to keep stage contents stable
    order: Vec<TaskName>,
}

impl TaskGraph {
    /// Build and validate a graph. Rejects duplicates, unknown dependencies
    /// and cycles.
    pub fn build(specs: &[TaskSpec]) -> Result<Self, CouncilError> {
        let mut nodes: HashMap<TaskName, GraphNode> = HashMap::new();
        let mut order = Vec::with_capacity(specs.len());

        for spec in specs {
            if nodes.contains_key(&spec.name) {
                return Err(CouncilError::DuplicateTask(spec.name));
            }
            nodes.insert(
                spec.name,
                GraphNode {
                    depends_on: spec.depends_on.iter().copied().collect(),
                    dependents: Vec::new(),
                    state: TaskState::Pending,
                },
            );
            order.push(spec.name);
        }

        for spec in specs {
            for dep in &spec.depends_on {
                match nodes.get_mut(dep) {
                    Some(node) => node.dependents.push(spec.name),
                    None => {
                        return Err(CouncilError::UnknownDependency {
                            task: spec.name,
                            missing: *dep,
                        })
                    }
                }
            }
        }

        let graph = Self { nodes, order };
        if let Some(cycle) = graph.find_cycle() {
            let path: Vec<&str> = cycle.iter().map(|n| n.as_str()).collect();
            return Err(CouncilError::CyclicDependency(path.join(" -> ")));
        }
        Ok(graph)
    }

    fn position(&self, name: TaskName) -> usize {
        self.order
            .iter()
            .position(|n| *n == name)
            .unwrap_or(usize::MAX)
    }

    fn find_cycle(&self) -> Option<Vec<TaskName>> {
        let mut visited = BTreeSet::new();
        let mut path = Vec::new();

        for name in &self.order {
            if !visited.contains(name) {
                if let Some(cycle) = self.visit(*name, &mut visited, &mut path) {
                    return Some(cycle);
                }
            }
        }
        None
    }

    fn visit(
        &self,
        name: TaskName,
        visited: &mut BTreeSet<TaskName>,
        path: &mut Vec<TaskName>,
    ) -> Option<Vec<TaskName>> {
        visited.insert(name);
        path.push(name);

        if let Some(node) = self.nodes.get(&name) {
            for dep in &node.depends_on {
                if let Some(pos) = path.iter().position(|n| n == dep) {
                    let mut cycle = path[pos..].to_vec();
                    cycle.push(*dep);
                    return Some(cycle);
                }
                if !visited.contains(dep) {
                    if let Some(cycle) = self.visit(*dep, visited, path) {
                        return Some(cycle);
                    }
                }
            }
        }

        path.pop();
        None
    }

    /// Kahn layering: tasks within a stage have no mutual dependency
    pub fn stages(&self) -> Vec<Vec<TaskName>> {
        let mut in_degree: HashMap<TaskName, usize> = self
            .nodes
            .iter()
            .map(|(name, node)| (*name, node.depends_on.len()))
            .collect();

        let mut current: Vec<TaskName> = self
            .order
            .iter()
            .copied()
            .filter(|n| in_degree.get(n) == Some(&0))
            .collect();
        let mut stages = Vec::new();

        while !current.is_empty() {
            let mut next = Vec::new();
            for name in &current {
                let Some(node) = self.nodes.get(name) else {
                    continue;
                };
                for dependent in &node.dependents {
                    if let Some(degree) = in_degree.get_mut(dependent) {
                        *degree -= 1;
                        if *degree == 0 {
                            next.push(*dependent);
                        }
                    }
                }
            }
            next.sort_by_key(|n| self.position(*n));
            stages.push(std::mem::take(&mut current));
            current = next;
        }

        stages
    }

    /// Flattened topological order
    pub fn topological_order(&self) -> Vec<TaskName> {
        self.stages().into_iter().flatten().collect()
    }

    pub fn state(&self, name: TaskName) -> Option<TaskState> {
        self.nodes.get(&name).map(|n| n.state)
    }

    pub fn set_state(&mut self, name: TaskName, state: TaskState) {
        if let Some(node) = self.nodes.get_mut(&name) {
            node.state = state;
        }
    }

    pub fn dependencies(&self, name: TaskName) -> Vec<TaskName> {
        self.nodes
            .get(&name)
            .map(|n| n.depends_on.clone())
            .unwrap_or_default()
    }

    pub fn is_complete(&self) -> bool {
        self.nodes.values().all(|n| n.state.is_terminal())
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use TaskName::*;

    #[test]
    fn test_chain_specs() {
        let specs = TaskSpec::chain(&[Finance, Legal, Operations]);
        assert!(specs[0].depends_on.is_empty());
        assert_eq!(specs[1].depends_on, BTreeSet::from([Finance]));
        assert_eq!(specs[2].depends_on, BTreeSet::from([Legal]));
    }

    #[test]
    fn test_chain_stages_follow_plan_order() {
        let graph = TaskGraph::build(&TaskSpec::chain(&[Finance, Legal, Operations])).unwrap();
        assert_eq!(
            graph.stages(),
            vec![vec![Finance], vec![Legal], vec![Operations]]
        );
    }

    #[test]
    fn test_independent_tasks_share_a_stage() {
        let specs = vec![
            TaskSpec::independent(Legal),
            TaskSpec::independent(Compliance),
            TaskSpec::independent(Finance),
            TaskSpec::new(Operations, [Legal, Finance]),
        ];
        let graph = TaskGraph::build(&specs).unwrap();

        assert_eq!(
            graph.stages(),
            vec![vec![Legal, Compliance, Finance], vec![Operations]]
        );
        assert_eq!(graph.topological_order(), vec![Legal, Compliance, Finance, Operations]);
        assert_eq!(graph.dependencies(Operations), vec![Legal, Finance]);
    }

    #[test]
    fn test_cycle_detected() {
        let specs = vec![
            TaskSpec::new(Legal, [Finance]),
            TaskSpec::new(Finance, [Compliance]),
            TaskSpec::new(Compliance, [Legal]),
        ];
        let err = TaskGraph::build(&specs).unwrap_err();
        match err {
            CouncilError::CyclicDependency(path) => {
                assert_eq!(path, "legal -> finance -> compliance -> legal")
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_self_dependency_is_cycle() {
        let err = TaskGraph::build(&[TaskSpec::new(Legal, [Legal])]).unwrap_err();
        assert!(matches!(err, CouncilError::CyclicDependency(_)));
    }

    #[test]
    fn test_unknown_dependency() {
        let err = TaskGraph::build(&[TaskSpec::new(Legal, [Finance])]).unwrap_err();
        assert!(matches!(
            err,
            CouncilError::UnknownDependency {
                task: Legal,
                missing: Finance
            }
        ));
    }

    #[test]
    fn test_duplicate_task() {
        let err = TaskGraph::build(&[TaskSpec::independent(Legal), TaskSpec::independent(Legal)])
            .unwrap_err();
        assert!(matches!(err, CouncilError::DuplicateTask(Legal)));
    }

    #[test]
    fn test_state_tracking() {
        let mut graph = TaskGraph::build(&TaskSpec::chain(&[Legal, Finance])).unwrap();
        assert_eq!(graph.state(Legal), Some(TaskState::Pending));
        assert!(!graph.is_complete());

        graph.set_state(Legal, TaskState::Done);
        graph.set_state(Finance, TaskState::Failed);
        assert!(graph.is_complete());
        assert_eq!(graph.len(), 2);
    }
}
