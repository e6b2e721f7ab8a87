// src/dag/graph.rs

use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

use petgraph::algo::toposort;
use petgraph::graphmap::DiGraphMap;
use thiserror::Error;

use crate::engine::TaskName;
use crate::types::{BackoffStrategy, SensorMode, TaskKind, TriggerRule};

/// Structural problems detected while building or validating a [`Graph`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphError {
    #[error("cycle detected in task graph involving task '{task}'")]
    Cycle { task: TaskName },

    #[error("edge '{from}' -> '{to}' references unknown task '{missing}'")]
    DanglingEdge {
        from: TaskName,
        to: TaskName,
        missing: TaskName,
    },

    #[error("duplicate task name '{0}'")]
    DuplicateTask(TaskName),

    #[error("sensor task '{0}' has no poke interval / timeout")]
    MissingSensorSpec(TaskName),

    #[error("sensor task '{0}' has a zero poke interval")]
    ZeroPokeInterval(TaskName),

    #[error("group '{0}' has no tasks")]
    EmptyGroup(String),

    #[error("group name '{0}' is already used by a task or another group")]
    DuplicateGroup(String),

    #[error("group '{group}' lists unknown task '{task}'")]
    UnknownGroupMember { group: String, task: TaskName },
}

/// Retry behaviour of a single task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total number of attempts, including the first one. Always >= 1.
    pub max_attempts: u32,
    /// Delay before the task re-enters the queue after a failed attempt.
    pub backoff_delay: Duration,
    pub backoff_strategy: BackoffStrategy,
    /// Upper bound on a single attempt; `None` means unbounded.
    pub per_attempt_timeout: Option<Duration>,
    /// Whether an attempt (or sensor) timeout may be retried.
    pub retry_on_timeout: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 1,
            backoff_delay: Duration::ZERO,
            backoff_strategy: BackoffStrategy::Constant,
            per_attempt_timeout: None,
            retry_on_timeout: true,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, backoff_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff_delay,
            ..Self::default()
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.per_attempt_timeout = Some(timeout);
        self
    }

    pub fn with_strategy(mut self, strategy: BackoffStrategy) -> Self {
        self.backoff_strategy = strategy;
        self
    }

    pub fn with_retry_on_timeout(mut self, retry: bool) -> Self {
        self.retry_on_timeout = retry;
        self
    }

    /// Delay to wait after the given (1-based) failed attempt.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        match self.backoff_strategy {
            BackoffStrategy::Constant => self.backoff_delay,
            BackoffStrategy::Exponential => {
                let exponent = attempt.saturating_sub(1).min(16);
                self.backoff_delay.saturating_mul(1u32 << exponent)
            }
        }
    }
}

/// Polling settings of a sensor task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SensorSpec {
    pub poke_interval: Duration,
    /// Measured from the first poke of the current attempt.
    pub timeout: Duration,
    pub mode: SensorMode,
}

impl SensorSpec {
    pub fn new(poke_interval: Duration, timeout: Duration, mode: SensorMode) -> Self {
        Self {
            poke_interval,
            timeout,
            mode,
        }
    }
}

/// Immutable description of one task in the graph.
#[derive(Debug, Clone)]
pub struct TaskNode {
    pub name: TaskName,
    pub kind: TaskKind,
    pub retry: RetryPolicy,
    pub trigger_rule: TriggerRule,
    /// Present for (and only meaningful on) sensor tasks.
    pub sensor: Option<SensorSpec>,
    /// Tasks that must reach a terminal state before this one is evaluated.
    pub upstream: Vec<TaskName>,
    /// Tasks that depend on this one.
    pub downstream: Vec<TaskName>,
}

impl TaskNode {
    pub fn new(name: impl Into<TaskName>) -> Self {
        Self {
            name: name.into(),
            kind: TaskKind::Plain,
            retry: RetryPolicy::default(),
            trigger_rule: TriggerRule::AllSuccess,
            sensor: None,
            upstream: Vec::new(),
            downstream: Vec::new(),
        }
    }

    pub fn sensor(name: impl Into<TaskName>, spec: SensorSpec) -> Self {
        let mut node = Self::new(name);
        node.kind = TaskKind::Sensor;
        node.sensor = Some(spec);
        node
    }

    pub fn branch(name: impl Into<TaskName>) -> Self {
        let mut node = Self::new(name);
        node.kind = TaskKind::Branch;
        node
    }

    pub fn sink(name: impl Into<TaskName>) -> Self {
        let mut node = Self::new(name);
        node.kind = TaskKind::Sink;
        node
    }

    /// Declare an upstream dependency.
    pub fn after(mut self, upstream: impl Into<TaskName>) -> Self {
        self.upstream.push(upstream.into());
        self
    }

    /// Declare a downstream dependent.
    pub fn before(mut self, downstream: impl Into<TaskName>) -> Self {
        self.downstream.push(downstream.into());
        self
    }

    pub fn with_trigger_rule(mut self, rule: TriggerRule) -> Self {
        self.trigger_rule = rule;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

/// Named set of tasks that behaves as one unit in dependency declarations.
///
/// Depending on a group means depending on its leaves (members with no
/// downstream inside the group); a group's own upstream feeds its roots
/// (members with no upstream inside the group).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskGroup {
    pub name: String,
    pub tasks: Vec<TaskName>,
    /// Tasks or groups the whole group waits for.
    pub upstream: Vec<String>,
}

impl TaskGroup {
    pub fn new<I, T>(name: impl Into<String>, tasks: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<TaskName>,
    {
        Self {
            name: name.into(),
            tasks: tasks.into_iter().map(Into::into).collect(),
            upstream: Vec::new(),
        }
    }

    pub fn after(mut self, upstream: impl Into<String>) -> Self {
        self.upstream.push(upstream.into());
        self
    }

    pub fn contains(&self, task: &str) -> bool {
        self.tasks.iter().any(|t| t == task)
    }
}

/// Validated, immutable task graph.
///
/// Upstream and downstream lists are kept consistent: declaring `B.after(A)`
/// or `A.before(B)` yields the same graph. Nodes keep their declaration
/// order, which is used to break ties in [`Graph::topological_order`].
#[derive(Debug, Clone)]
pub struct Graph {
    name: String,
    nodes: Vec<TaskNode>,
    index: HashMap<TaskName, usize>,
    groups: Vec<TaskGroup>,
}

impl Graph {
    /// Build and validate a graph from its nodes.
    pub fn new(name: impl Into<String>, nodes: Vec<TaskNode>) -> Result<Self, GraphError> {
        let mut index = HashMap::with_capacity(nodes.len());
        for (i, node) in nodes.iter().enumerate() {
            if index.insert(node.name.clone(), i).is_some() {
                return Err(GraphError::DuplicateTask(node.name.clone()));
            }
            if node.kind == TaskKind::Sensor {
                match node.sensor {
                    None => return Err(GraphError::MissingSensorSpec(node.name.clone())),
                    Some(spec) if spec.poke_interval.is_zero() => {
                        return Err(GraphError::ZeroPokeInterval(node.name.clone()));
                    }
                    Some(_) => {}
                }
            }
        }

        let mut graph = Self {
            name: name.into(),
            nodes,
            index,
            groups: Vec::new(),
        };
        graph.check_edges()?;
        graph.link();
        graph.validate()?;
        Ok(graph)
    }

    /// Build a graph whose edges may name groups as well as tasks.
    ///
    /// Group references are expanded into task edges before validation: an
    /// edge into a group lands on its roots and an edge out of a group leaves
    /// from its leaves. Groups do not nest.
    pub fn with_groups(
        name: impl Into<String>,
        mut nodes: Vec<TaskNode>,
        groups: Vec<TaskGroup>,
    ) -> Result<Self, GraphError> {
        let tasks: BTreeSet<&str> = nodes.iter().map(|n| n.name.as_str()).collect();
        let mut seen = BTreeSet::new();
        for group in &groups {
            if tasks.contains(group.name.as_str()) || !seen.insert(group.name.as_str()) {
                return Err(GraphError::DuplicateGroup(group.name.clone()));
            }
            if group.tasks.is_empty() {
                return Err(GraphError::EmptyGroup(group.name.clone()));
            }
            if let Some(task) = group.tasks.iter().find(|t| !tasks.contains(t.as_str())) {
                return Err(GraphError::UnknownGroupMember {
                    group: group.name.clone(),
                    task: task.clone(),
                });
            }
        }

        let edges = declared_edges(&nodes);
        let ends: HashMap<&str, GroupEnds> = groups
            .iter()
            .map(|g| (g.name.as_str(), GroupEnds::of(g, &edges)))
            .collect();

        let mut extra: Vec<(usize, TaskName)> = Vec::new();
        for group in &groups {
            let upstream = expand(&group.upstream, &ends, |e| &e.leaves);
            for root in &ends[group.name.as_str()].roots {
                if let Some(i) = nodes.iter().position(|n| &n.name == root) {
                    extra.extend(upstream.iter().map(|up| (i, up.clone())));
                }
            }
        }
        for node in &mut nodes {
            node.upstream = expand(&node.upstream, &ends, |e| &e.leaves);
            node.downstream = expand(&node.downstream, &ends, |e| &e.roots);
        }
        for (i, up) in extra {
            nodes[i].upstream.push(up);
        }

        let mut graph = Self::new(name, nodes)?;
        graph.groups = groups;
        Ok(graph)
    }

    /// Check the structural invariants: every edge endpoint exists and the
    /// edge set is acyclic.
    pub fn validate(&self) -> Result<(), GraphError> {
        self.check_edges()?;

        // Edge direction: upstream -> downstream.
        let mut graph: DiGraphMap<&str, ()> = DiGraphMap::new();
        for node in &self.nodes {
            graph.add_node(node.name.as_str());
        }
        for node in &self.nodes {
            for down in &node.downstream {
                graph.add_edge(node.name.as_str(), down.as_str(), ());
            }
        }

        match toposort(&graph, None) {
            Ok(_order) => Ok(()),
            Err(cycle) => Err(GraphError::Cycle {
                task: cycle.node_id().to_string(),
            }),
        }
    }

    /// Lazy iterator over task names in dependency order.
    ///
    /// Every call starts a fresh traversal. Among tasks that are ready at the
    /// same time, the one declared first comes first.
    pub fn topological_order(&self) -> TopologicalOrder<'_> {
        let in_degree: Vec<usize> = self.nodes.iter().map(|n| n.upstream.len()).collect();
        let ready = in_degree
            .iter()
            .enumerate()
            .filter(|(_, d)| **d == 0)
            .map(|(i, _)| i)
            .collect();

        TopologicalOrder {
            graph: self,
            in_degree,
            ready,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    pub fn node(&self, name: &str) -> Option<&TaskNode> {
        self.index.get(name).map(|&i| &self.nodes[i])
    }

    /// Nodes in declaration order.
    pub fn nodes(&self) -> impl Iterator<Item = &TaskNode> {
        self.nodes.iter()
    }

    /// Task names in declaration order.
    pub fn tasks(&self) -> impl Iterator<Item = &str> {
        self.nodes.iter().map(|n| n.name.as_str())
    }

    pub fn upstream_of(&self, name: &str) -> &[TaskName] {
        self.node(name).map(|n| n.upstream.as_slice()).unwrap_or(&[])
    }

    pub fn downstream_of(&self, name: &str) -> &[TaskName] {
        self.node(name).map(|n| n.downstream.as_slice()).unwrap_or(&[])
    }

    pub fn group(&self, name: &str) -> Option<&TaskGroup> {
        self.groups.iter().find(|g| g.name == name)
    }

    pub fn groups(&self) -> impl Iterator<Item = &TaskGroup> {
        self.groups.iter()
    }

    /// Direct downstream tasks of `branch` selected by the choice `chosen`.
    ///
    /// A task name selects itself; a group name selects its members that
    /// follow `branch` directly. `None` when the choice selects nothing.
    pub fn branch_targets(&self, branch: &str, chosen: &str) -> Option<Vec<TaskName>> {
        let downstream = self.downstream_of(branch);
        if downstream.iter().any(|d| d == chosen) {
            return Some(vec![chosen.to_string()]);
        }
        let group = self.group(chosen)?;
        let targets: Vec<TaskName> = downstream
            .iter()
            .filter(|d| group.contains(d))
            .cloned()
            .collect();
        (!targets.is_empty()).then_some(targets)
    }

    /// Tasks without upstream dependencies.
    pub fn roots(&self) -> impl Iterator<Item = &str> {
        self.nodes
            .iter()
            .filter(|n| n.upstream.is_empty())
            .map(|n| n.name.as_str())
    }

    fn check_edges(&self) -> Result<(), GraphError> {
        for node in &self.nodes {
            for up in &node.upstream {
                if !self.index.contains_key(up) {
                    return Err(GraphError::DanglingEdge {
                        from: up.clone(),
                        to: node.name.clone(),
                        missing: up.clone(),
                    });
                }
            }
            for down in &node.downstream {
                if !self.index.contains_key(down) {
                    return Err(GraphError::DanglingEdge {
                        from: node.name.clone(),
                        to: down.clone(),
                        missing: down.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Make upstream/downstream lists mirror each other, without duplicates.
    fn link(&mut self) {
        for node in &mut self.nodes {
            dedup_in_order(&mut node.upstream);
            dedup_in_order(&mut node.downstream);
        }

        let mut edges: Vec<(usize, usize)> = Vec::new();
        for (i, node) in self.nodes.iter().enumerate() {
            for up in &node.upstream {
                if let Some(&j) = self.index.get(up) {
                    edges.push((j, i));
                }
            }
            for down in &node.downstream {
                if let Some(&j) = self.index.get(down) {
                    edges.push((i, j));
                }
            }
        }

        for (from, to) in edges {
            let from_name = self.nodes[from].name.clone();
            let to_name = self.nodes[to].name.clone();
            if !self.nodes[from].downstream.contains(&to_name) {
                self.nodes[from].downstream.push(to_name);
            }
            if !self.nodes[to].upstream.contains(&from_name) {
                self.nodes[to].upstream.push(from_name);
            }
        }
    }
}

/// Entry and exit tasks of a group.
struct GroupEnds {
    roots: Vec<TaskName>,
    leaves: Vec<TaskName>,
}

impl GroupEnds {
    fn of(group: &TaskGroup, edges: &[(TaskName, TaskName)]) -> Self {
        let internal: Vec<&(TaskName, TaskName)> = edges
            .iter()
            .filter(|(from, to)| group.contains(from) && group.contains(to))
            .collect();
        let roots = group
            .tasks
            .iter()
            .filter(|t| !internal.iter().any(|(_, to)| to == *t))
            .cloned()
            .collect();
        let leaves = group
            .tasks
            .iter()
            .filter(|t| !internal.iter().any(|(from, _)| from == *t))
            .cloned()
            .collect();
        Self { roots, leaves }
    }
}

/// Edges as declared on the nodes, upstream -> downstream.
fn declared_edges(nodes: &[TaskNode]) -> Vec<(TaskName, TaskName)> {
    let mut edges = Vec::new();
    for node in nodes {
        edges.extend(node.upstream.iter().map(|up| (up.clone(), node.name.clone())));
        edges.extend(node.downstream.iter().map(|down| (node.name.clone(), down.clone())));
    }
    edges
}

/// Replace group names in `names` with the chosen end of each group.
fn expand(
    names: &[String],
    ends: &HashMap<&str, GroupEnds>,
    pick: impl Fn(&GroupEnds) -> &Vec<TaskName>,
) -> Vec<TaskName> {
    names
        .iter()
        .flat_map(|name| match ends.get(name.as_str()) {
            Some(end) => pick(end).clone(),
            None => vec![name.clone()],
        })
        .collect()
}

fn dedup_in_order(names: &mut Vec<TaskName>) {
    let mut seen = BTreeSet::new();
    names.retain(|n| seen.insert(n.clone()));
}

/// Kahn-style traversal produced by [`Graph::topological_order`].
#[derive(Debug, Clone)]
pub struct TopologicalOrder<'g> {
    graph: &'g Graph,
    in_degree: Vec<usize>,
    /// Declaration indices whose upstreams have all been yielded.
    ready: BTreeSet<usize>,
}

impl<'g> Iterator for TopologicalOrder<'g> {
    type Item = &'g str;

    fn next(&mut self) -> Option<Self::Item> {
        let idx = self.ready.pop_first()?;
        let node = &self.graph.nodes[idx];

        for down in &node.downstream {
            if let Some(&j) = self.graph.index.get(down) {
                self.in_degree[j] = self.in_degree[j].saturating_sub(1);
                if self.in_degree[j] == 0 {
                    self.ready.insert(j);
                }
            }
        }

        Some(node.name.as_str())
    }
}
