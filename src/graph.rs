//! A generic directed graph with optionally typed edges.
//!
//! [`DirectedGraph`] owns no domain semantics. Nodes are addressed by a
//! caller-chosen id (usually content-derived, see [`Hash32`](crate::Hash32))
//! and carry an opaque payload. Edges are `(from, to, type)` triples where the
//! type is optional; two edges between the same pair of nodes with different
//! types are distinct.
//!
//! ## Orphan pruning
//!
//! Removing an edge may leave its target without any inbound edge. Such a node
//! is removed together with its outgoing edges, and the check cascades into the
//! targets of those edges. When the graph has a designated root, nodes that are
//! still referenced but only from a subgraph that became unreachable from the
//! root (e.g. an import cycle) are swept as well.
//!
//! Every mutating call returns the payloads it removed, so the owner can react
//! to removals (for example by releasing cached work) without a callback
//! holding a borrow of its state.

use std::collections::{HashMap, HashSet};
use std::fmt::Debug;
use std::hash::Hash;

use petgraph::Direction;
use petgraph::stable_graph::{EdgeIndex, NodeIndex, StableDiGraph};
use petgraph::visit::EdgeRef;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::GraphError;

struct Slot<K, N> {
    id: K,
    value: N,
}

/// A directed edge as stored in the graph.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Edge<K, E> {
    pub from: K,
    pub to: K,
    pub ty: Option<E>,
}

/// Nodes removed by a mutation, in removal order.
pub type Removed<K, N> = Vec<(K, N)>;

/// A directed graph of nodes addressed by id `K`, with payloads `N` and
/// optional edge types `E`.
///
/// Serializes as a flat list of nodes and edges, so indices never leak into
/// persisted state.
pub struct DirectedGraph<K, N, E = ()> {
    inner: StableDiGraph<Slot<K, N>, Option<E>>,
    index: HashMap<K, NodeIndex>,
    root: Option<K>,
}

impl<K, N, E> Default for DirectedGraph<K, N, E> {
    fn default() -> Self {
        Self {
            inner: StableDiGraph::default(),
            index: HashMap::new(),
            root: None,
        }
    }
}

impl<K, N, E> DirectedGraph<K, N, E>
where
    K: Clone + Eq + Hash + Debug,
    N: PartialEq,
    E: Clone + PartialEq,
{
    /// An empty graph without a root.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a graph containing a single node designated as the root.
    pub fn with_root(id: K, node: N) -> Self {
        let mut graph = Self::new();
        let index = graph.inner.add_node(Slot {
            id: id.clone(),
            value: node,
        });
        graph.index.insert(id.clone(), index);
        graph.root = Some(id);
        graph
    }

    /// The designated root, if any. It is never pruned.
    pub fn root(&self) -> Option<&K> {
        self.root.as_ref()
    }

    /// Designates an existing node as the root.
    pub fn set_root(&mut self, id: K) -> Result<(), GraphError> {
        self.ix(&id)?;
        self.root = Some(id);
        Ok(())
    }

    pub fn node_count(&self) -> usize {
        self.inner.node_count()
    }

    pub fn edge_count(&self) -> usize {
        self.inner.edge_count()
    }

    /// Whether a node with this id exists.
    pub fn has_node(&self, id: &K) -> bool {
        self.index.contains_key(id)
    }

    /// The payload of a node.
    pub fn get(&self, id: &K) -> Option<&N> {
        self.index.get(id).map(|&index| &self.inner[index].value)
    }

    pub fn get_mut(&mut self, id: &K) -> Option<&mut N> {
        let index = *self.index.get(id)?;
        Some(&mut self.inner[index].value)
    }

    /// Every node with its payload, in no guaranteed order.
    pub fn nodes(&self) -> impl Iterator<Item = (&K, &N)> {
        self.inner
            .node_weights()
            .map(|slot| (&slot.id, &slot.value))
    }

    pub fn nodes_mut(&mut self) -> impl Iterator<Item = (&K, &mut N)> {
        self.inner
            .node_weights_mut()
            .map(|slot| (&slot.id, &mut slot.value))
    }

    /// Inserts a node if absent.
    ///
    /// Re-adding an equal payload under the same id is a no-op, while a
    /// different payload under an existing id is rejected with
    /// [`GraphError::DuplicateNode`].
    pub fn add_node(&mut self, id: K, node: N) -> Result<K, GraphError> {
        if let Some(&index) = self.index.get(&id) {
            return if self.inner[index].value == node {
                Ok(id)
            } else {
                Err(GraphError::duplicate(&id))
            };
        }

        let index = self.inner.add_node(Slot {
            id: id.clone(),
            value: node,
        });
        self.index.insert(id.clone(), index);

        Ok(id)
    }

    /// Removes a node and all of its edges, then prunes whatever became
    /// orphaned. The removed node is the first element of the result.
    pub fn remove_node(&mut self, id: &K) -> Result<Removed<K, N>, GraphError> {
        let index = self.ix(id)?;
        let children: Vec<_> = self
            .inner
            .neighbors_directed(index, Direction::Outgoing)
            .collect();

        let mut removed = Vec::new();
        if let Some(slot) = self.inner.remove_node(index) {
            self.index.remove(&slot.id);
            removed.push((slot.id, slot.value));
        }

        if self.root.as_ref() == Some(id) {
            self.root = None;
        }

        removed.extend(self.prune(children));
        Ok(removed)
    }

    /// Adds an edge; adding an already existing `(from, to, type)` triple is a
    /// no-op.
    pub fn add_edge(&mut self, from: &K, to: &K, ty: Option<E>) -> Result<(), GraphError> {
        let a = self.ix(from)?;
        let b = self.ix(to)?;

        if self.find_edge(a, b, ty.as_ref()).is_none() {
            self.inner.add_edge(a, b, ty);
        }

        Ok(())
    }

    pub fn has_edge(&self, from: &K, to: &K, ty: Option<&E>) -> bool {
        match (self.index.get(from), self.index.get(to)) {
            (Some(&a), Some(&b)) => self.find_edge(a, b, ty).is_some(),
            _ => false,
        }
    }

    /// Removes an edge and prunes everything that became orphaned as a
    /// result. Removing an edge that does not exist removes nothing.
    pub fn remove_edge(
        &mut self,
        from: &K,
        to: &K,
        ty: Option<&E>,
    ) -> Result<Removed<K, N>, GraphError> {
        let a = self.ix(from)?;
        let b = self.ix(to)?;

        match self.find_edge(a, b, ty) {
            Some(edge) => {
                self.inner.remove_edge(edge);
                Ok(self.prune(vec![b]))
            }
            None => Ok(Vec::new()),
        }
    }

    /// Makes `children` the exact set of nodes connected from `from` through
    /// edges of type `ty`.
    ///
    /// Edges to children that are still present are kept untouched, so their
    /// subtrees and any state stored in them survive. New children are added
    /// to the graph if needed, and children no longer listed are disconnected
    /// and pruned. Edges of other types are not considered.
    pub fn replace_nodes_connected_from(
        &mut self,
        from: &K,
        children: Vec<(K, N)>,
        ty: Option<E>,
    ) -> Result<Removed<K, N>, GraphError> {
        let a = self.ix(from)?;

        // checked up front so that a rejected call leaves the graph untouched
        let mut listed: HashMap<&K, &N> = HashMap::with_capacity(children.len());
        for (id, node) in &children {
            if let Some(&index) = self.index.get(id)
                && self.inner[index].value != *node
            {
                return Err(GraphError::duplicate(id));
            }

            if let Some(&other) = listed.get(id)
                && other != node
            {
                return Err(GraphError::duplicate(id));
            }
            listed.insert(id, node);
        }

        let wanted: HashSet<&K> = children.iter().map(|(id, _)| id).collect();
        let stale: Vec<(EdgeIndex, NodeIndex)> = self
            .inner
            .edges_directed(a, Direction::Outgoing)
            .filter(|edge| edge.weight().as_ref() == ty.as_ref())
            .filter(|edge| !wanted.contains(&self.inner[edge.target()].id))
            .map(|edge| (edge.id(), edge.target()))
            .collect();

        for (id, node) in children {
            let id = self.add_node(id, node)?;
            let b = self.index[&id];

            if self.find_edge(a, b, ty.as_ref()).is_none() {
                self.inner.add_edge(a, b, ty.clone());
            }
        }

        let mut candidates = Vec::with_capacity(stale.len());
        for (edge, target) in stale {
            self.inner.remove_edge(edge);
            candidates.push(target);
        }

        Ok(self.prune(candidates))
    }

    /// A node is orphaned when nothing points at it and it is not the root.
    pub fn is_orphaned(&self, id: &K) -> bool {
        match self.index.get(id) {
            Some(&index) => {
                self.root.as_ref() != Some(id)
                    && self
                        .inner
                        .neighbors_directed(index, Direction::Incoming)
                        .next()
                        .is_none()
            }
            None => false,
        }
    }

    /// Ids of the nodes connected from `id`, in edge insertion order. With a
    /// type filter only edges of that type count.
    pub fn connected_from(&self, id: &K, ty: Option<&E>) -> Vec<K> {
        self.neighbors(id, ty, Direction::Outgoing)
    }

    /// Ids of the nodes with an edge pointing at `id`.
    pub fn connected_to(&self, id: &K, ty: Option<&E>) -> Vec<K> {
        self.neighbors(id, ty, Direction::Incoming)
    }

    /// All edges, grouped by source node.
    pub fn edges(&self) -> Vec<Edge<K, E>> {
        let mut edges = Vec::with_capacity(self.inner.edge_count());

        for index in self.inner.node_indices() {
            let mut outgoing: Vec<_> = self
                .inner
                .edges_directed(index, Direction::Outgoing)
                .map(|edge| Edge {
                    from: self.inner[edge.source()].id.clone(),
                    to: self.inner[edge.target()].id.clone(),
                    ty: edge.weight().clone(),
                })
                .collect();
            outgoing.reverse();
            edges.extend(outgoing);
        }

        edges
    }

    /// Depth-first, pre-order walk starting at `start` (or the root).
    ///
    /// With `filter` set, only edges of exactly that type are descended.
    /// Every reachable node is visited once; children are visited in the
    /// order their edges were added.
    pub fn traverse<F>(&self, start: Option<&K>, filter: Option<&E>, mut visit: F) -> Result<(), GraphError>
    where
        F: FnMut(&K, &N),
    {
        let start = match start {
            Some(id) => self.ix(id)?,
            None => {
                let root = self.root.as_ref().ok_or(GraphError::RootMissing)?;
                self.ix(root)?
            }
        };

        let mut visited = HashSet::new();
        let mut stack = vec![start];

        while let Some(index) = stack.pop() {
            if !visited.insert(index) {
                continue;
            }

            let slot = &self.inner[index];
            visit(&slot.id, &slot.value);

            // outgoing edges come newest first, so the oldest ends up on top
            stack.extend(
                self.inner
                    .edges_directed(index, Direction::Outgoing)
                    .filter(|edge| filter.is_none_or(|ty| edge.weight().as_ref() == Some(ty)))
                    .map(|edge| edge.target()),
            );
        }

        Ok(())
    }

    /// Collects the order produced by [`traverse`](Self::traverse).
    pub fn dfs(&self, start: Option<&K>, filter: Option<&E>) -> Result<Vec<K>, GraphError> {
        let mut order = Vec::new();
        self.traverse(start, filter, |id, _| order.push(id.clone()))?;
        Ok(order)
    }

    fn ix(&self, id: &K) -> Result<NodeIndex, GraphError> {
        self.index
            .get(id)
            .copied()
            .ok_or_else(|| GraphError::unknown(id))
    }

    fn find_edge(&self, a: NodeIndex, b: NodeIndex, ty: Option<&E>) -> Option<EdgeIndex> {
        self.inner
            .edges_directed(a, Direction::Outgoing)
            .find(|edge| edge.target() == b && edge.weight().as_ref() == ty)
            .map(|edge| edge.id())
    }

    fn neighbors(&self, id: &K, ty: Option<&E>, direction: Direction) -> Vec<K> {
        let Some(&index) = self.index.get(id) else {
            return Vec::new();
        };

        let mut seen = HashSet::new();
        self
            .inner
            .edges_directed(index, direction)
            .filter(|edge| ty.is_none_or(|ty| edge.weight().as_ref() == Some(ty)))
            .map(|edge| match direction {
                Direction::Outgoing => edge.target(),
                Direction::Incoming => edge.source(),
            })
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .filter(|index| seen.insert(*index))
            .map(|index| self.inner[index].id.clone())
            .collect()
    }

    fn prune(&mut self, candidates: Vec<NodeIndex>) -> Removed<K, N> {
        let root = self
            .root
            .as_ref()
            .and_then(|id| self.index.get(id))
            .copied();

        let mut removed = Vec::new();
        let mut survivors = Vec::new();
        let mut stack = candidates;

        while let Some(index) = stack.pop() {
            if !self.inner.contains_node(index) || Some(index) == root {
                continue;
            }

            if self
                .inner
                .neighbors_directed(index, Direction::Incoming)
                .next()
                .is_some()
            {
                survivors.push(index);
                continue;
            }

            stack.extend(self.inner.neighbors_directed(index, Direction::Outgoing));

            if let Some(slot) = self.inner.remove_node(index) {
                self.index.remove(&slot.id);
                removed.push((slot.id, slot.value));
            }
        }

        if let Some(root) = root
            && !survivors.is_empty()
        {
            removed.extend(self.sweep_unreachable(root, survivors));
        }

        removed
    }

    /// Removes nodes below `survivors` that can no longer be reached from the
    /// root, which happens when they only reference each other.
    ///
    /// Only the ancestors of the affected nodes are searched, so the cost does
    /// not grow with the size of the whole graph.
    fn sweep_unreachable(&mut self, root: NodeIndex, survivors: Vec<NodeIndex>) -> Removed<K, N> {
        let mut doomed = Vec::new();
        let mut seen = HashSet::new();

        for start in survivors {
            let mut stack = vec![start];

            while let Some(index) = stack.pop() {
                if index == root || !self.inner.contains_node(index) || !seen.insert(index) {
                    continue;
                }

                if self.is_anchored(index, root) {
                    continue;
                }

                doomed.push(index);
                stack.extend(self.inner.neighbors_directed(index, Direction::Outgoing));
            }
        }

        doomed
            .into_iter()
            .filter_map(|index| self.inner.remove_node(index))
            .map(|slot| {
                self.index.remove(&slot.id);
                (slot.id, slot.value)
            })
            .collect()
    }

    /// Whether some chain of inbound edges leads from `index` up to `root`.
    /// Searched depth first, one parent at a time.
    fn is_anchored(&self, index: NodeIndex, root: NodeIndex) -> bool {
        let mut seen = HashSet::from([index]);
        let mut stack = vec![self.inner.neighbors_directed(index, Direction::Incoming)];

        while let Some(parents) = stack.last_mut() {
            match parents.next() {
                Some(parent) if parent == root => return true,
                Some(parent) => {
                    if seen.insert(parent) {
                        stack.push(self.inner.neighbors_directed(parent, Direction::Incoming));
                    }
                }
                None => {
                    stack.pop();
                }
            }
        }

        false
    }
}

#[derive(Serialize)]
struct GraphRef<'a, K, N, E> {
    root: Option<&'a K>,
    nodes: Vec<(&'a K, &'a N)>,
    edges: Vec<(&'a K, &'a K, &'a Option<E>)>,
}

#[derive(Deserialize)]
struct GraphRepr<K, N, E> {
    root: Option<K>,
    nodes: Vec<(K, N)>,
    edges: Vec<(K, K, Option<E>)>,
}

impl<K, N, E> Serialize for DirectedGraph<K, N, E>
where
    K: Serialize,
    N: Serialize,
    E: Serialize,
{
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let nodes = self
            .inner
            .node_weights()
            .map(|slot| (&slot.id, &slot.value))
            .collect();

        // per-source insertion order is kept so that children come back in
        // the same order after a restore
        let mut edges = Vec::with_capacity(self.inner.edge_count());
        for index in self.inner.node_indices() {
            let mut outgoing: Vec<_> = self
                .inner
                .edges_directed(index, Direction::Outgoing)
                .map(|edge| {
                    (
                        &self.inner[edge.source()].id,
                        &self.inner[edge.target()].id,
                        edge.weight(),
                    )
                })
                .collect();
            outgoing.reverse();
            edges.extend(outgoing);
        }

        GraphRef {
            root: self.root.as_ref(),
            nodes,
            edges,
        }
        .serialize(serializer)
    }
}

impl<'de, K, N, E> Deserialize<'de> for DirectedGraph<K, N, E>
where
    K: Deserialize<'de> + Clone + Eq + Hash + Debug,
    N: Deserialize<'de> + PartialEq,
    E: Deserialize<'de> + Clone + PartialEq,
{
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let repr = GraphRepr::<K, N, E>::deserialize(deserializer)?;
        let mut graph = Self::new();

        for (id, node) in repr.nodes {
            graph.add_node(id, node).map_err(D::Error::custom)?;
        }

        for (from, to, ty) in repr.edges {
            graph.add_edge(&from, &to, ty).map_err(D::Error::custom)?;
        }

        if let Some(root) = repr.root {
            graph.set_root(root).map_err(D::Error::custom)?;
        }

        Ok(graph)
    }
}
