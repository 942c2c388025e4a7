//! Pipeline execution graph
//!
//! Stages have no edges between them; the assembler depends on every stage.
//! The graph is kept general so the runner can simply walk its parallel
//! groups: everything in one group may run concurrently, and a group starts
//! only after the previous one has fully finished.
use crate::error::{BuildError, BuildResult};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// A node in the execution graph
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum NodeId {
    /// A build stage, by name
    Stage(String),
    /// The final assembly step
    Assembler,
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stage(name) => write!(f, "stage '{}'", name),
            Self::Assembler => write!(f, "assembler"),
        }
    }
}

/// Execution graph: node -> nodes it waits for
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutionGraph {
    nodes: BTreeMap<NodeId, BTreeSet<NodeId>>,
}

impl ExecutionGraph {
    /// Create a new empty graph
    pub fn new() -> Self {
        Self::default()
    }

    /// Independent stages joined by one assembler
    pub fn fan_in<'a, I>(stages: I) -> Self
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut graph = Self::new();
        let mut all = BTreeSet::new();
        for stage in stages {
            let id = NodeId::Stage(stage.to_string());
            graph.add_node(id.clone(), BTreeSet::new());
            all.insert(id);
        }
        graph.add_node(NodeId::Assembler, all);
        graph
    }

    /// Add a node with its dependencies
    pub fn add_node(&mut self, id: NodeId, dependencies: BTreeSet<NodeId>) {
        self.nodes.insert(id, dependencies);
    }

    /// Dependencies of a node
    pub fn dependencies(&self, id: &NodeId) -> Option<&BTreeSet<NodeId>> {
        self.nodes.get(id)
    }

    /// Get node count
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Check if graph is empty
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Check all dependencies exist
    pub fn validate(&self) -> BuildResult<()> {
        for (id, deps) in &self.nodes {
            for dep in deps {
                if !self.nodes.contains_key(dep) {
                    return Err(BuildError::InvalidDefinition(format!(
                        "{} depends on unknown {}",
                        id, dep
                    )));
                }
            }
        }
        Ok(())
    }

    /// Groups of nodes that can run concurrently, in execution order
    pub fn parallel_groups(&self) -> BuildResult<Vec<Vec<NodeId>>> {
        self.validate()?;

        let mut groups = Vec::new();
        let mut done: BTreeSet<NodeId> = BTreeSet::new();

        loop {
            let group: Vec<NodeId> = self
                .nodes
                .iter()
                .filter(|(id, deps)| !done.contains(*id) && deps.iter().all(|d| done.contains(d)))
                .map(|(id, _)| id.clone())
                .collect();

            if group.is_empty() {
                break;
            }
            done.extend(group.iter().cloned());
            groups.push(group);
        }

        if done.len() != self.nodes.len() {
            return Err(BuildError::InvalidDefinition(format!(
                "circular dependency: {}",
                self.find_cycle()
            )));
        }

        Ok(groups)
    }

    /// Find a cycle in the graph (for error reporting)
    fn find_cycle(&self) -> String {
        let mut visited = BTreeSet::new();
        let mut path = Vec::new();

        for id in self.nodes.keys() {
            if let Some(cycle) = self.dfs_find_cycle(id, &mut visited, &mut path) {
                return cycle;
            }
        }

        "unknown cycle".to_string()
    }

    fn dfs_find_cycle(
        &self,
        id: &NodeId,
        visited: &mut BTreeSet<NodeId>,
        path: &mut Vec<NodeId>,
    ) -> Option<String> {
        if let Some(start) = path.iter().position(|n| n == id) {
            let mut cycle: Vec<String> = path[start..].iter().map(ToString::to_string).collect();
            cycle.push(id.to_string());
            return Some(cycle.join(" -> "));
        }
        if !visited.insert(id.clone()) {
            return None;
        }

        path.push(id.clone());
        if let Some(deps) = self.nodes.get(id) {
            for dep in deps {
                if let Some(cycle) = self.dfs_find_cycle(dep, visited, path) {
                    return Some(cycle);
                }
            }
        }
        path.pop();
        None
    }
}
