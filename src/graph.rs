//! Directed multigraph with deny-edges, SCC-based cycle detection,
//! topological sort, sub-graph induction, and traversal.
//!
//! A reusable utility the planner builds its conflict graph on top of:
//! vertices are systems, edges are inferred or declared orderings, and deny
//! edges mark pairs that must never be ordered against each other. Cycles
//! are diagnosed with Tarjan's algorithm before a schedule is sealed with a
//! Kahn topological sort, rather than discovered lazily while running.

use fxhash::{FxHashMap, FxHashSet};

use crate::error::{WorldError, WorldResult};

pub type VertexId = usize;
pub type EdgeLabel = u32;

/// The label used for edges that carry no semantic tag (plain write/read
/// conflict edges inferred by the planner use this).
pub const DEFAULT_LABEL: EdgeLabel = 0;

#[derive(Debug, Default, Clone)]
struct AdjList {
    /// Successors reachable by at least one non-denied (label) edge.
    out: FxHashMap<VertexId, FxHashSet<EdgeLabel>>,
}

/// A directed multigraph over a dense `0..vertex_count` vertex space.
///
/// Edges are keyed by `(from, to, label)`; a `deny_edge` for a given key
/// suppresses any `add_edge` with the same key, regardless of call order.
/// Self-loops are never materialized: `add_edge(v, v, _)` is a silent no-op.
#[derive(Debug, Clone)]
pub struct Graph {
    vertex_count: usize,
    added: FxHashMap<VertexId, AdjList>,
    denied: FxHashSet<(VertexId, VertexId, EdgeLabel)>,
    sealed_order: Option<Vec<VertexId>>,
}

impl Graph {
    pub fn new(vertex_count: usize) -> Self {
        Graph {
            vertex_count,
            added: FxHashMap::default(),
            denied: FxHashSet::default(),
            sealed_order: None,
        }
    }

    pub fn vertex_count(&self) -> usize {
        self.vertex_count
    }

    pub fn add_edge(&mut self, from: VertexId, to: VertexId, label: EdgeLabel) {
        if from == to {
            return;
        }
        self.sealed_order = None;
        self.added
            .entry(from)
            .or_default()
            .out
            .entry(to)
            .or_default()
            .insert(label);
    }

    pub fn deny_edge(&mut self, from: VertexId, to: VertexId, label: EdgeLabel) {
        if from == to {
            return;
        }
        self.sealed_order = None;
        self.denied.insert((from, to, label));
    }

    fn is_denied(&self, from: VertexId, to: VertexId, label: EdgeLabel) -> bool {
        self.denied.contains(&(from, to, label))
    }

    /// True if `from -> to` holds for some non-denied label.
    pub fn has_edge(&self, from: VertexId, to: VertexId) -> bool {
        self.added
            .get(&from)
            .map(|adj| {
                adj.out
                    .get(&to)
                    .map(|labels| labels.iter().any(|l| !self.is_denied(from, to, *l)))
                    .unwrap_or(false)
            })
            .unwrap_or(false)
    }

    /// Successors of `v` reachable by a non-denied edge, in vertex-id order.
    fn successors(&self, v: VertexId) -> Vec<VertexId> {
        let mut out: Vec<VertexId> = self
            .added
            .get(&v)
            .map(|adj| {
                adj.out
                    .iter()
                    .filter(|(to, labels)| labels.iter().any(|l| !self.is_denied(v, **to, *l)))
                    .map(|(to, _)| *to)
                    .collect()
            })
            .unwrap_or_default();
        out.sort_unstable();
        out
    }

    fn all_effective_edges(&self) -> Vec<(VertexId, VertexId)> {
        let mut edges = Vec::new();
        for v in 0..self.vertex_count {
            for to in self.successors(v) {
                edges.push((v, to));
            }
        }
        edges
    }

    /// Tarjan's SCC algorithm, returning only non-singleton components
    /// (self-loops cannot occur, so a singleton component is never a
    /// cycle). Within each reported cycle, vertices are ordered by DFS
    /// discovery order, matching the order they were first reached while
    /// walking successors in ascending vertex-id order.
    pub fn find_cycles(&self) -> Vec<Vec<VertexId>> {
        struct State {
            index: Vec<Option<usize>>,
            lowlink: Vec<usize>,
            on_stack: Vec<bool>,
            stack: Vec<VertexId>,
            next_index: usize,
            sccs: Vec<Vec<VertexId>>,
        }

        fn strongconnect(g: &Graph, v: VertexId, s: &mut State) {
            s.index[v] = Some(s.next_index);
            s.lowlink[v] = s.next_index;
            s.next_index += 1;
            s.stack.push(v);
            s.on_stack[v] = true;

            for w in g.successors(v) {
                if s.index[w].is_none() {
                    strongconnect(g, w, s);
                    s.lowlink[v] = s.lowlink[v].min(s.lowlink[w]);
                } else if s.on_stack[w] {
                    s.lowlink[v] = s.lowlink[v].min(s.index[w].unwrap());
                }
            }

            if s.lowlink[v] == s.index[v].unwrap() {
                let mut component = Vec::new();
                loop {
                    let w = s.stack.pop().unwrap();
                    s.on_stack[w] = false;
                    component.push(w);
                    if w == v {
                        break;
                    }
                }
                component.reverse();
                s.sccs.push(component);
            }
        }

        let mut state = State {
            index: vec![None; self.vertex_count],
            lowlink: vec![0; self.vertex_count],
            on_stack: vec![false; self.vertex_count],
            stack: Vec::new(),
            next_index: 0,
            sccs: Vec::new(),
        };

        for v in 0..self.vertex_count {
            if state.index[v].is_none() {
                strongconnect(self, v, &mut state);
            }
        }

        state
            .sccs
            .into_iter()
            .filter(|c| c.len() > 1)
            .collect()
    }

    /// Computes and caches a topological order via Kahn's algorithm. Must
    /// succeed (no cycle) before `topologically_sorted_vertices` or
    /// `traverse` can be used.
    pub fn seal(&mut self) -> WorldResult<()> {
        if !self.find_cycles().is_empty() {
            self.sealed_order = None;
            return Err(WorldError::internal(
                "attempted to seal a graph containing a schedule cycle",
            ));
        }

        let mut indegree = vec![0usize; self.vertex_count];
        for v in 0..self.vertex_count {
            for to in self.successors(v) {
                indegree[to] += 1;
            }
        }

        let mut ready: Vec<VertexId> = (0..self.vertex_count)
            .filter(|&v| indegree[v] == 0)
            .collect();
        ready.sort_unstable();

        let mut order = Vec::with_capacity(self.vertex_count);
        let mut queue: std::collections::VecDeque<VertexId> = ready.into();

        while let Some(v) = queue.pop_front() {
            order.push(v);
            let mut newly_ready = Vec::new();
            for to in self.successors(v) {
                indegree[to] -= 1;
                if indegree[to] == 0 {
                    newly_ready.push(to);
                }
            }
            newly_ready.sort_unstable();
            for w in newly_ready {
                queue.push_back(w);
            }
        }

        debug_assert_eq!(order.len(), self.vertex_count, "seal() miscounted vertices on an acyclic graph");
        self.sealed_order = Some(order);
        Ok(())
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed_order.is_some()
    }

    pub fn topologically_sorted_vertices(&self) -> WorldResult<&[VertexId]> {
        self.sealed_order
            .as_deref()
            .ok_or_else(|| WorldError::internal("topologically_sorted_vertices called before seal()"))
    }

    /// Immediate successors of `v` in topological order, or the roots
    /// (vertices with no predecessor) when `v` is `None`. Requires `seal()`.
    pub fn traverse(&self, v: Option<VertexId>) -> WorldResult<Vec<VertexId>> {
        let order = self.topologically_sorted_vertices()?;
        let rank: FxHashMap<VertexId, usize> =
            order.iter().enumerate().map(|(i, &v)| (v, i)).collect();

        let mut result = match v {
            Some(v) => self.successors(v),
            None => {
                let mut has_pred = vec![false; self.vertex_count];
                for (from, to) in self.all_effective_edges() {
                    let _ = from;
                    has_pred[to] = true;
                }
                (0..self.vertex_count).filter(|&v| !has_pred[v]).collect()
            }
        };
        result.sort_by_key(|v| rank[v]);
        Ok(result)
    }

    /// A new graph over the given vertex subset, remapped to `0..vs.len()`,
    /// retaining only edges (and denials) between members of the subset.
    pub fn induce_subgraph(&self, vs: &[VertexId]) -> Graph {
        let remap: FxHashMap<VertexId, VertexId> =
            vs.iter().enumerate().map(|(i, &v)| (v, i)).collect();
        let mut sub = Graph::new(vs.len());
        for &from in vs {
            for to in self.successors(from) {
                if let (Some(&rf), Some(&rt)) = (remap.get(&from), remap.get(&to)) {
                    sub.add_edge(rf, rt, DEFAULT_LABEL);
                }
            }
        }
        sub
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn self_loops_are_ignored() {
        let mut g = Graph::new(2);
        g.add_edge(0, 0, DEFAULT_LABEL);
        assert!(!g.has_edge(0, 0));
        assert!(g.find_cycles().is_empty());
    }

    #[test]
    fn deny_beats_add() {
        let mut g = Graph::new(2);
        g.add_edge(0, 1, DEFAULT_LABEL);
        g.deny_edge(0, 1, DEFAULT_LABEL);
        assert!(!g.has_edge(0, 1));
    }

    #[test]
    fn scenario_cycle_diagnosis() {
        // a=0 b=1 c=2 d=3 e=4 g=5
        let mut g = Graph::new(6);
        g.add_edge(0, 1, DEFAULT_LABEL); // a -> b
        g.add_edge(1, 2, DEFAULT_LABEL); // b -> c
        g.add_edge(2, 3, DEFAULT_LABEL); // c -> d
        g.add_edge(3, 0, DEFAULT_LABEL); // d -> a
        g.add_edge(2, 4, DEFAULT_LABEL); // c -> e
        g.add_edge(5, 0, DEFAULT_LABEL); // g -> a

        let cycles = g.find_cycles();
        assert_eq!(cycles, vec![vec![0, 1, 2, 3]]);
        assert!(g.seal().is_err());
    }

    #[test]
    fn topo_sort_and_traverse() {
        let mut g = Graph::new(4);
        g.add_edge(0, 1, DEFAULT_LABEL);
        g.add_edge(0, 2, DEFAULT_LABEL);
        g.add_edge(1, 3, DEFAULT_LABEL);
        g.add_edge(2, 3, DEFAULT_LABEL);
        g.seal().unwrap();

        let order = g.topologically_sorted_vertices().unwrap().to_vec();
        assert_eq!(order[0], 0);
        assert_eq!(order[3], 3);

        let roots = g.traverse(None).unwrap();
        assert_eq!(roots, vec![0]);

        let succ = g.traverse(Some(0)).unwrap();
        assert_eq!(succ, vec![1, 2]);
    }

    #[test]
    fn induce_subgraph_remaps_vertices() {
        let mut g = Graph::new(3);
        g.add_edge(0, 1, DEFAULT_LABEL);
        g.add_edge(1, 2, DEFAULT_LABEL);
        let sub = g.induce_subgraph(&[0, 1]);
        assert!(sub.has_edge(0, 1));
        assert_eq!(sub.vertex_count(), 2);
    }
}
