//! Validated, immutable workflow graph.
//!
//! A [`Graph`] is built once from task definitions and `upstream -> downstream`
//! edges. Every structural problem (duplicate names, dangling edges, cycles)
//! is reported by [`Graph::build`]; a graph that exists is always runnable.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};

use thiserror::Error;

use crate::{TaskDefinition, find_cycle};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GraphError {
    #[error("Circular dependency detected: {}", .0.join(" -> "))]
    Cycle(Vec<String>),
    #[error("Task '{0}' depends on itself")]
    SelfDependency(String),
    #[error("Edge {upstream} -> {downstream} references unknown task '{missing}'")]
    UnknownTask {
        upstream: String,
        downstream: String,
        missing: String,
    },
    #[error("Duplicate task '{0}'")]
    DuplicateTask(String),
}

#[derive(Debug, Clone)]
pub struct Graph {
    id: String,
    tasks: Vec<TaskDefinition>,
    index: HashMap<String, usize>,
    upstream: HashMap<String, Vec<String>>,
    dependents: HashMap<String, Vec<String>>,
    ancestors: HashMap<String, HashSet<String>>,
    order: Vec<String>,
}

impl Graph {
    pub fn build<I, A, B>(
        id: impl Into<String>,
        tasks: Vec<TaskDefinition>,
        edges: I,
    ) -> Result<Self, GraphError>
    where
        I: IntoIterator<Item = (A, B)>,
        A: Into<String>,
        B: Into<String>,
    {
        let mut index = HashMap::new();
        for (pos, task) in tasks.iter().enumerate() {
            if index.insert(task.name().to_string(), pos).is_some() {
                return Err(GraphError::DuplicateTask(task.name().to_string()));
            }
        }

        let mut upstream: HashMap<String, Vec<String>> = HashMap::new();
        let mut dependents: HashMap<String, Vec<String>> = HashMap::new();
        for task in &tasks {
            upstream.insert(task.name().to_string(), Vec::new());
            dependents.insert(task.name().to_string(), Vec::new());
        }

        for (from, to) in edges {
            let (from, to): (String, String) = (from.into(), to.into());
            for name in [&from, &to] {
                if !index.contains_key(name) {
                    return Err(GraphError::UnknownTask {
                        upstream: from.clone(),
                        downstream: to.clone(),
                        missing: name.clone(),
                    });
                }
            }
            if from == to {
                return Err(GraphError::SelfDependency(from));
            }

            // 重复的边只保留一条
            let parents = upstream.entry(to.clone()).or_default();
            if parents.contains(&from) {
                continue;
            }
            parents.push(from.clone());
            dependents.entry(from).or_default().push(to);
        }

        let names: Vec<String> = tasks.iter().map(|t| t.name().to_string()).collect();
        if let Some(cycle) = find_cycle(&names, &dependents) {
            return Err(GraphError::Cycle(cycle));
        }

        let order = Self::topological_sort(&names, &index, &upstream, &dependents);
        let ancestors = Self::collect_ancestors(&order, &upstream);

        Ok(Self {
            id: id.into(),
            tasks,
            index,
            upstream,
            dependents,
            ancestors,
            order,
        })
    }

    // Kahn's algorithm; among ready tasks the earliest declared goes first.
    fn topological_sort(
        names: &[String],
        index: &HashMap<String, usize>,
        upstream: &HashMap<String, Vec<String>>,
        dependents: &HashMap<String, Vec<String>>,
    ) -> Vec<String> {
        let mut in_degrees: HashMap<&str, usize> = upstream
            .iter()
            .map(|(name, parents)| (name.as_str(), parents.len()))
            .collect();

        let mut ready: BinaryHeap<Reverse<usize>> = names
            .iter()
            .enumerate()
            .filter(|(_, name)| in_degrees[name.as_str()] == 0)
            .map(|(pos, _)| Reverse(pos))
            .collect();

        let mut order = Vec::with_capacity(names.len());
        while let Some(Reverse(pos)) = ready.pop() {
            let name = &names[pos];
            order.push(name.clone());
            for child in &dependents[name] {
                if let Some(degree) = in_degrees.get_mut(child.as_str()) {
                    *degree -= 1;
                    if *degree == 0 {
                        ready.push(Reverse(index[child]));
                    }
                }
            }
        }

        order
    }

    fn collect_ancestors(
        order: &[String],
        upstream: &HashMap<String, Vec<String>>,
    ) -> HashMap<String, HashSet<String>> {
        let mut ancestors: HashMap<String, HashSet<String>> = HashMap::new();
        for name in order {
            let mut set = HashSet::new();
            for parent in &upstream[name] {
                set.insert(parent.clone());
                if let Some(grand) = ancestors.get(parent) {
                    set.extend(grand.iter().cloned());
                }
            }
            ancestors.insert(name.clone(), set);
        }
        ancestors
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Task definitions in declaration order.
    pub fn tasks(&self) -> &[TaskDefinition] {
        &self.tasks
    }

    pub fn task(&self, name: &str) -> Option<&TaskDefinition> {
        self.index.get(name).map(|&pos| &self.tasks[pos])
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    /// Direct upstream tasks.
    pub fn predecessors(&self, name: &str) -> &[String] {
        self.upstream.get(name).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Direct downstream tasks.
    pub fn successors(&self, name: &str) -> &[String] {
        self.dependents.get(name).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Every task `name` depends on, directly or transitively.
    pub fn ancestors(&self, name: &str) -> Option<&HashSet<String>> {
        self.ancestors.get(name)
    }

    /// Deterministic topological order, ties broken by declaration order.
    pub fn topological_order(&self) -> &[String] {
        &self.order
    }

    pub fn roots(&self) -> impl Iterator<Item = &str> {
        self.order
            .iter()
            .filter(|name| self.predecessors(name).is_empty())
            .map(String::as_str)
    }

    /// Renders every root followed by its downstream chains.
    pub fn render(&self) -> String {
        let mut out = String::new();
        for root in self.roots() {
            out.push_str(root);
            out.push('\n');
            self.render_chain(root, "  ", &mut out);
        }
        out
    }

    fn render_chain(&self, name: &str, prefix: &str, out: &mut String) {
        for child in self.successors(name) {
            out.push_str(&format!("{}└─> {}\n", prefix, child));
            self.render_chain(child, &format!("{}    ", prefix), out);
        }
    }

    pub fn print_graph(&self) {
        print!("{}", self.render());
    }
}

/// Incremental construction of a [`Graph`].
#[derive(Debug, Default)]
pub struct GraphBuilder {
    id: String,
    tasks: Vec<TaskDefinition>,
    edges: Vec<(String, String)>,
}

impl GraphBuilder {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Default::default()
        }
    }

    pub fn task(mut self, task: TaskDefinition) -> Self {
        self.tasks.push(task);
        self
    }

    pub fn edge(mut self, upstream: impl Into<String>, downstream: impl Into<String>) -> Self {
        self.edges.push((upstream.into(), downstream.into()));
        self
    }

    /// Adds `names[0] -> names[1] -> ...`.
    pub fn chain(mut self, names: &[&str]) -> Self {
        for pair in names.windows(2) {
            self.edges.push((pair[0].to_string(), pair[1].to_string()));
        }
        self
    }

    pub fn build(self) -> Result<Graph, GraphError> {
        Graph::build(self.id, self.tasks, self.edges)
    }
}
