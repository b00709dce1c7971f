use crate::error::GraphError;
use petgraph::algo::tarjan_scc;
use petgraph::graphmap::DiGraphMap;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, VecDeque};

/// Relationship carried by an edge
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EdgeType {
    /// `to` is derived from `from`
    #[default]
    Derives,
    /// A change to `from` affects `to`
    Affects,
    /// `to` merely mentions `from`
    References,
}

/// One upstream to downstream relationship
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DependencyEdge {
    /// Upstream artifact ID
    pub from: String,
    /// Downstream artifact ID
    pub to: String,
    /// Relationship kind
    #[serde(rename = "type", default)]
    pub edge_type: EdgeType,
}

/// Directed graph of artifact IDs
///
/// The edge list is the persisted form; the upstream/downstream indexes are
/// rebuilt from it on deserialization. At most one edge exists per
/// `(from, to)` pair.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "EdgeList", into = "EdgeList")]
pub struct DependencyGraph {
    edges: Vec<DependencyEdge>,
    downstream: BTreeMap<String, BTreeSet<String>>,
    upstream: BTreeMap<String, BTreeSet<String>>,
}

#[derive(Serialize, Deserialize)]
struct EdgeList {
    #[serde(default)]
    edges: Vec<DependencyEdge>,
}

impl From<EdgeList> for DependencyGraph {
    fn from(list: EdgeList) -> Self {
        let mut graph = Self {
            edges: list.edges,
            ..Self::default()
        };
        graph.rebuild_from_edges();
        graph
    }
}

impl From<DependencyGraph> for EdgeList {
    fn from(graph: DependencyGraph) -> Self {
        Self { edges: graph.edges }
    }
}

impl DependencyGraph {
    /// Empty graph
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    // ------------------------------------------------------------------
    // Edges
    // ------------------------------------------------------------------

    /// Add an edge; returns false if `(from, to)` already exists
    pub fn add_edge(&mut self, from: impl Into<String>, to: impl Into<String>, edge_type: EdgeType) -> bool {
        let (from, to) = (from.into(), to.into());
        if self.has_edge(&from, &to) {
            return false;
        }
        self.index(&from, &to);
        self.edges.push(DependencyEdge { from, to, edge_type });
        true
    }

    /// Remove an edge; returns false if it did not exist
    pub fn remove_edge(&mut self, from: &str, to: &str) -> bool {
        let before = self.edges.len();
        self.edges.retain(|e| !(e.from == from && e.to == to));
        if self.edges.len() == before {
            return false;
        }
        unindex(&mut self.downstream, from, to);
        unindex(&mut self.upstream, to, from);
        true
    }

    /// Remove every edge touching `id`; returns the number removed
    pub fn remove_node(&mut self, id: &str) -> usize {
        let before = self.edges.len();
        self.edges.retain(|e| e.from != id && e.to != id);
        let removed = before - self.edges.len();
        if removed > 0 {
            self.rebuild_from_edges();
        }
        removed
    }

    /// Whether `(from, to)` exists
    #[must_use]
    pub fn has_edge(&self, from: &str, to: &str) -> bool {
        self.downstream.get(from).is_some_and(|set| set.contains(to))
    }

    /// All edges in insertion order
    #[inline]
    #[must_use]
    pub fn edges(&self) -> &[DependencyEdge] {
        &self.edges
    }

    /// Rebuild the adjacency indexes from the edge list
    ///
    /// Drops duplicate `(from, to)` pairs, keeping the first.
    pub fn rebuild_from_edges(&mut self) {
        self.downstream.clear();
        self.upstream.clear();
        let edges = std::mem::take(&mut self.edges);
        for edge in edges {
            if !self.has_edge(&edge.from, &edge.to) {
                self.index(&edge.from, &edge.to);
                self.edges.push(edge);
            }
        }
    }

    /// Replace the graph with `derives` edges from each artifact's upstream IDs
    pub fn build_from_artifacts<'a, I, U>(&mut self, artifacts: I)
    where
        I: IntoIterator<Item = (&'a str, U)>,
        U: IntoIterator<Item = &'a str>,
    {
        self.edges.clear();
        self.downstream.clear();
        self.upstream.clear();
        for (id, upstream) in artifacts {
            for up in upstream {
                self.add_edge(up, id, EdgeType::Derives);
            }
        }
    }

    fn index(&mut self, from: &str, to: &str) {
        self.downstream
            .entry(from.to_string())
            .or_default()
            .insert(to.to_string());
        self.upstream
            .entry(to.to_string())
            .or_default()
            .insert(from.to_string());
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    /// Direct downstream IDs, sorted
    #[must_use]
    pub fn get_downstream(&self, id: &str) -> Vec<String> {
        neighbors(&self.downstream, id).map(str::to_string).collect()
    }

    /// Direct upstream IDs, sorted
    #[must_use]
    pub fn get_upstream(&self, id: &str) -> Vec<String> {
        neighbors(&self.upstream, id).map(str::to_string).collect()
    }

    /// Transitive downstream closure of `id`, excluding `id`
    #[must_use]
    pub fn get_all_downstream(&self, id: &str) -> Vec<String> {
        reachable(&self.downstream, id)
    }

    /// Transitive upstream closure of `id`, excluding `id`
    #[must_use]
    pub fn get_all_upstream(&self, id: &str) -> Vec<String> {
        reachable(&self.upstream, id)
    }

    /// Everything a change to `id` affects
    #[inline]
    #[must_use]
    pub fn get_affected_by_change(&self, id: &str) -> Vec<String> {
        self.get_all_downstream(id)
    }

    /// Nodes with no upstream
    #[must_use]
    pub fn get_roots(&self) -> Vec<String> {
        self.node_set()
            .into_iter()
            .filter(|n| !self.upstream.get(*n).is_some_and(|s| !s.is_empty()))
            .map(str::to_string)
            .collect()
    }

    /// Nodes with no downstream
    #[must_use]
    pub fn get_leaves(&self) -> Vec<String> {
        self.node_set()
            .into_iter()
            .filter(|n| !self.downstream.get(*n).is_some_and(|s| !s.is_empty()))
            .map(str::to_string)
            .collect()
    }

    /// Every node touched by an edge, sorted
    #[must_use]
    pub fn get_nodes(&self) -> Vec<String> {
        self.node_set().into_iter().map(str::to_string).collect()
    }

    /// Number of distinct nodes
    #[must_use]
    pub fn node_count(&self) -> usize {
        self.node_set().len()
    }

    /// Number of edges
    #[inline]
    #[must_use]
    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    /// Whether the graph has no edges
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.edges.is_empty()
    }

    fn node_set(&self) -> BTreeSet<&str> {
        self.edges
            .iter()
            .flat_map(|e| [e.from.as_str(), e.to.as_str()])
            .collect()
    }

    // ------------------------------------------------------------------
    // Ordering
    // ------------------------------------------------------------------

    /// Total order of all nodes consistent with every edge
    ///
    /// Kahn's algorithm; ties are broken lexicographically so the result is
    /// deterministic.
    ///
    /// # Errors
    /// [`GraphError::CycleDetected`] naming the nodes on cycles.
    pub fn topological_sort(&self) -> Result<Vec<String>, GraphError> {
        let nodes = self.node_set();
        Ok(self.levels_within(&nodes)?.into_iter().flatten().collect())
    }

    /// Nodes that sit on a cycle, including self-loops; empty when acyclic
    #[must_use]
    pub fn detect_cycle(&self) -> Vec<String> {
        self.cycle_members(None)
    }

    /// Order in which `changed` and everything downstream must be re-derived
    ///
    /// Only the induced subgraph of that closure is ordered, so IDs without
    /// edges are still returned and cycles elsewhere do not interfere.
    ///
    /// # Errors
    /// [`GraphError::CycleDetected`] if the closure contains a cycle.
    pub fn get_derivation_order<S: AsRef<str>>(&self, changed: &[S]) -> Result<Vec<String>, GraphError> {
        Ok(self.get_derivation_levels(changed)?.into_iter().flatten().collect())
    }

    /// Derivation order grouped by depth
    ///
    /// Every node in level `n` depends only on nodes in levels `< n`, so the
    /// members of one level can be derived independently.
    ///
    /// # Errors
    /// [`GraphError::CycleDetected`] if the closure contains a cycle.
    pub fn get_derivation_levels<S: AsRef<str>>(&self, changed: &[S]) -> Result<Vec<Vec<String>>, GraphError> {
        let mut closure: BTreeSet<&str> = BTreeSet::new();
        let mut queue: VecDeque<&str> = changed.iter().map(AsRef::as_ref).collect();
        while let Some(id) = queue.pop_front() {
            if closure.insert(id) {
                queue.extend(neighbors(&self.downstream, id));
            }
        }
        let levels = self.levels_within(&closure)?;
        tracing::debug!(
            changed = changed.len(),
            total = closure.len(),
            levels = levels.len(),
            "computed derivation order"
        );
        Ok(levels)
    }

    /// Kahn's algorithm over the subgraph induced by `nodes`, level by level
    fn levels_within<'a>(&'a self, nodes: &BTreeSet<&'a str>) -> Result<Vec<Vec<String>>, GraphError> {
        let mut in_degree: BTreeMap<&str, usize> = nodes
            .iter()
            .map(|n| {
                let degree = neighbors(&self.upstream, n)
                    .filter(|u| nodes.contains(u))
                    .count();
                (*n, degree)
            })
            .collect();

        let mut frontier: Vec<&str> = in_degree
            .iter()
            .filter(|(_, degree)| **degree == 0)
            .map(|(n, _)| *n)
            .collect();
        let mut levels = Vec::new();
        let mut placed = 0;

        while !frontier.is_empty() {
            let mut next = BTreeSet::new();
            for node in &frontier {
                for child in neighbors(&self.downstream, node) {
                    if let Some(degree) = in_degree.get_mut(child) {
                        *degree -= 1;
                        if *degree == 0 {
                            next.insert(child);
                        }
                    }
                }
            }
            placed += frontier.len();
            levels.push(frontier.iter().map(|n| (*n).to_string()).collect());
            frontier = next.into_iter().collect();
        }

        if placed < nodes.len() {
            return Err(GraphError::CycleDetected {
                nodes: self.cycle_members(Some(nodes)),
            });
        }
        Ok(levels)
    }

    fn cycle_members(&self, within: Option<&BTreeSet<&str>>) -> Vec<String> {
        let keep = |id: &str| within.map_or(true, |set| set.contains(&id));
        let mut graph: DiGraphMap<&str, ()> = DiGraphMap::new();
        for edge in &self.edges {
            if keep(edge.from.as_str()) && keep(edge.to.as_str()) {
                graph.add_edge(edge.from.as_str(), edge.to.as_str(), ());
            }
        }

        let mut members = BTreeSet::new();
        for scc in tarjan_scc(&graph) {
            let self_loop = scc.len() == 1 && graph.contains_edge(scc[0], scc[0]);
            if scc.len() > 1 || self_loop {
                members.extend(scc);
            }
        }
        members.into_iter().map(str::to_string).collect()
    }
}

fn neighbors<'a>(index: &'a BTreeMap<String, BTreeSet<String>>, id: &str) -> impl Iterator<Item = &'a str> {
    index.get(id).into_iter().flatten().map(String::as_str)
}

fn reachable(index: &BTreeMap<String, BTreeSet<String>>, start: &str) -> Vec<String> {
    let mut seen: BTreeSet<&str> = BTreeSet::new();
    let mut queue: VecDeque<&str> = neighbors(index, start).collect();
    while let Some(id) = queue.pop_front() {
        if seen.insert(id) {
            queue.extend(neighbors(index, id));
        }
    }
    seen.into_iter()
        .filter(|id| *id != start)
        .map(str::to_string)
        .collect()
}

fn unindex(index: &mut BTreeMap<String, BTreeSet<String>>, key: &str, value: &str) {
    if let Some(set) = index.get_mut(key) {
        set.remove(value);
        if set.is_empty() {
            index.remove(key);
        }
    }
}
