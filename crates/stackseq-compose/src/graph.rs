//! Dependency graph management using `petgraph`.
//!
//! Builds a directed graph from `depends_on` declarations and resolves
//! the startup order. Edges point from a dependency to its dependent and
//! carry the condition the dependent waits for.

use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet, BinaryHeap, HashMap, VecDeque};

use petgraph::Direction;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;
use stackseq_common::error::{Result, StackError};
use stackseq_common::types::DependencyCondition;

use crate::model::EffectiveStack;

/// A dependency graph of services.
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    graph: DiGraph<String, DependencyCondition>,
    nodes: BTreeMap<String, NodeIndex>,
}

impl DependencyGraph {
    /// Creates an empty dependency graph.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds the graph for every service in `stack`.
    ///
    /// # Errors
    ///
    /// Returns [`StackError::UnknownService`] if a dependency names a
    /// service that is not defined.
    pub fn from_stack(stack: &EffectiveStack) -> Result<Self> {
        let mut graph = Self::new();
        for name in stack.names() {
            let _ = graph.add_service(name);
        }
        for svc in stack.services.values() {
            for (dependency, condition) in &svc.depends_on {
                if !graph.contains(dependency) {
                    return Err(StackError::UnknownService {
                        service: svc.name.clone(),
                        dependency: dependency.clone(),
                        origin: svc.origin_of("depends_on").to_owned(),
                    });
                }
                graph.add_dependency(&svc.name, dependency, *condition);
            }
        }
        tracing::debug!(
            services = graph.len(),
            edges = graph.graph.edge_count(),
            "dependency graph built"
        );
        Ok(graph)
    }

    /// Adds a service node, returning the existing one if present.
    pub fn add_service(&mut self, name: &str) -> NodeIndex {
        if let Some(&idx) = self.nodes.get(name) {
            return idx;
        }
        let idx = self.graph.add_node(name.to_owned());
        let _ = self.nodes.insert(name.to_owned(), idx);
        idx
    }

    /// Adds a dependency edge: `dependent` waits for `dependency` to reach
    /// `condition`. Missing nodes are created.
    pub fn add_dependency(
        &mut self,
        dependent: &str,
        dependency: &str,
        condition: DependencyCondition,
    ) {
        let to = self.add_service(dependent);
        let from = self.add_service(dependency);
        let _ = self.graph.update_edge(from, to, condition);
    }

    /// Returns `true` if `name` is a node of the graph.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.nodes.contains_key(name)
    }

    /// Number of services.
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Returns `true` if the graph has no services.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Direct dependencies of `name` with their conditions, alphabetical.
    #[must_use]
    pub fn dependencies(&self, name: &str) -> Vec<(String, DependencyCondition)> {
        let Some(&idx) = self.nodes.get(name) else {
            return Vec::new();
        };
        let mut deps: Vec<_> = self
            .graph
            .edges_directed(idx, Direction::Incoming)
            .map(|e| (self.graph[e.source()].clone(), *e.weight()))
            .collect();
        deps.sort();
        deps
    }

    /// Services that depend directly on `name`, alphabetical.
    #[must_use]
    pub fn dependents(&self, name: &str) -> Vec<String> {
        let Some(&idx) = self.nodes.get(name) else {
            return Vec::new();
        };
        let mut out: Vec<_> = self
            .graph
            .neighbors_directed(idx, Direction::Outgoing)
            .map(|n| self.graph[n].clone())
            .collect();
        out.sort();
        out
    }

    /// Returns a topological ordering of services for startup.
    ///
    /// Dependencies come before their dependents. Among services that are
    /// ready at the same time, the alphabetically smallest goes first, so
    /// the order is stable for a given stack.
    ///
    /// # Errors
    ///
    /// Returns [`StackError::CyclicDependency`] with the full cycle if the
    /// graph is not acyclic.
    pub fn resolve_order(&self) -> Result<Vec<String>> {
        let (order, _) = self.kahn()?;
        tracing::debug!(?order, "startup order resolved");
        Ok(order)
    }

    /// Groups services into waves that may start in parallel.
    ///
    /// Wave `n` holds the services whose longest dependency chain has
    /// length `n`. Each wave is alphabetical.
    ///
    /// # Errors
    ///
    /// Returns [`StackError::CyclicDependency`] if the graph is not
    /// acyclic.
    pub fn startup_waves(&self) -> Result<Vec<Vec<String>>> {
        let (order, depth) = self.kahn()?;
        let mut waves: Vec<Vec<String>> = Vec::new();
        for name in order {
            let level = depth.get(&name).copied().unwrap_or(0);
            if waves.len() <= level {
                waves.resize_with(level + 1, Vec::new);
            }
            waves[level].push(name);
        }
        for wave in &mut waves {
            wave.sort();
        }
        Ok(waves)
    }

    /// Kahn's algorithm with an alphabetical ready queue. Also returns the
    /// depth of every node.
    fn kahn(&self) -> Result<(Vec<String>, HashMap<String, usize>)> {
        let mut in_degree: HashMap<NodeIndex, usize> = self
            .graph
            .node_indices()
            .map(|n| {
                let count = self.graph.edges_directed(n, Direction::Incoming).count();
                (n, count)
            })
            .collect();
        let mut ready: BinaryHeap<Reverse<(&str, NodeIndex)>> = in_degree
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(&n, _)| Reverse((self.graph[n].as_str(), n)))
            .collect();
        let mut depth: HashMap<String, usize> = HashMap::new();
        let mut order = Vec::with_capacity(self.len());

        while let Some(Reverse((name, idx))) = ready.pop() {
            let level = depth.get(name).copied().unwrap_or(0);
            order.push(name.to_owned());
            for next in self.graph.neighbors_directed(idx, Direction::Outgoing) {
                let next_name = self.graph[next].as_str();
                let entry = depth.entry(next_name.to_owned()).or_insert(0);
                *entry = (*entry).max(level + 1);
                if let Some(d) = in_degree.get_mut(&next) {
                    *d -= 1;
                    if *d == 0 {
                        ready.push(Reverse((next_name, next)));
                    }
                }
            }
            let _ = depth.entry(name.to_owned()).or_insert(level);
        }

        if order.len() < self.len() {
            let cycle = self.find_cycle().unwrap_or_default();
            return Err(StackError::CyclicDependency { cycle });
        }
        Ok((order, depth))
    }

    /// Finds one dependency cycle, if any.
    ///
    /// The cycle starts and ends at the alphabetically smallest service of
    /// the first strongly connected component (by that name) that is
    /// cyclic, and follows "depends on" edges along a shortest path, e.g.
    /// `["a", "b", "a"]`. A self-dependency yields `["a", "a"]`.
    #[must_use]
    pub fn find_cycle(&self) -> Option<Vec<String>> {
        let start = petgraph::algo::tarjan_scc(&self.graph)
            .into_iter()
            .filter(|scc| scc.len() > 1 || self.graph.contains_edge(scc[0], scc[0]))
            .filter_map(|scc| {
                let members: BTreeSet<NodeIndex> = scc.iter().copied().collect();
                let start = scc.into_iter().min_by(|a, b| self.graph[*a].cmp(&self.graph[*b]))?;
                Some((start, members))
            })
            .min_by(|(a, _), (b, _)| self.graph[*a].cmp(&self.graph[*b]))?;
        let (start, members) = start;

        // Breadth-first search along "depends on" edges back to `start`.
        let mut parent: HashMap<NodeIndex, NodeIndex> = HashMap::new();
        let mut queue = VecDeque::from([start]);
        while let Some(node) = queue.pop_front() {
            for dep in self.sorted_dependencies(node) {
                if !members.contains(&dep) {
                    continue;
                }
                if dep == start {
                    let mut path = vec![self.graph[start].clone()];
                    let mut cursor = node;
                    let mut tail = Vec::new();
                    while cursor != start {
                        tail.push(self.graph[cursor].clone());
                        cursor = *parent.get(&cursor)?;
                    }
                    tail.reverse();
                    path.extend(tail);
                    path.push(self.graph[start].clone());
                    return Some(path);
                }
                if let std::collections::hash_map::Entry::Vacant(e) = parent.entry(dep) {
                    let _ = e.insert(node);
                    queue.push_back(dep);
                }
            }
        }
        None
    }

    fn sorted_dependencies(&self, idx: NodeIndex) -> Vec<NodeIndex> {
        let mut deps: Vec<_> = self
            .graph
            .neighbors_directed(idx, Direction::Incoming)
            .collect();
        deps.sort_by(|a, b| self.graph[*a].cmp(&self.graph[*b]));
        deps
    }
}
