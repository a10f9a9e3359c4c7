//! Memoized, invalidation-aware execution of build requests.
//!
//! A request is a unit of build work addressed by a content-derived
//! [`RequestId`]. The [`RequestTracker`] stores the last result of every
//! request in a [`DirectedGraph`] together with what should invalidate it:
//!
//! * file nodes connected through `InvalidatedBy*` edges,
//! * other requests it consumed, connected through `SubRequest` edges,
//! * an `unpredictable` flag for work that must be redone after a restart.
//!
//! The tracker itself never executes anything concurrently. The orchestrator
//! runs work on the thread pool and reports back through
//! [`start_request`](RequestTracker::start_request),
//! [`complete_request`](RequestTracker::complete_request) and
//! [`reject_request`](RequestTracker::reject_request), while
//! [`run_request`](RequestTracker::run_request) covers the inline case.

mod context;

use std::collections::HashSet;
use std::hash::Hash;

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};

use crate::core::Hash32;
use crate::error::{GraphError, RequestFailure};
use crate::graph::DirectedGraph;

pub use context::{Cancellation, Invalidations, RequestContext};

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RequestId(Hash32);

impl RequestId {
    /// Derives the id from the request kind and its canonical input.
    pub fn new<T: Hash + ?Sized>(kind: &str, input: &T) -> Self {
        Self(Hash32::of(kind, input))
    }

    pub fn hash(&self) -> Hash32 {
        self.0
    }
}

impl std::fmt::Debug for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "RequestId({})", self.0.short())
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0.short())
    }
}

/// A unit of build work producing a result of type `R`.
pub trait Request<R> {
    fn id(&self) -> RequestId;

    /// Stable name of the request type, used in logs and errors.
    fn kind(&self) -> &'static str;

    fn run(&self, ctx: &mut RequestContext) -> anyhow::Result<R>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FsEventKind {
    Create,
    Update,
    Delete,
}

/// A change observed on the filesystem, either by a watcher or by comparing
/// snapshots.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FsEvent {
    pub path: Utf8PathBuf,
    pub kind: FsEventKind,
}

impl FsEvent {
    pub fn new(path: impl Into<Utf8PathBuf>, kind: FsEventKind) -> Self {
        Self {
            path: path.into(),
            kind,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RequestKey {
    Root,
    Request(RequestId),
    File(Utf8PathBuf),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RequestEdge {
    SubRequest,
    InvalidatedByUpdate,
    InvalidatedByCreate,
    InvalidatedByDelete,
    InvalidatedByDirectory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestNode<R> {
    pub id: RequestId,
    pub kind: String,
    pub result: Option<R>,
    /// Bumped on every successful run.
    pub revision: u64,
    pub valid: bool,
    pub unpredictable: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RequestGraphNode<R> {
    Root,
    Request(RequestNode<R>),
    File(Utf8PathBuf),
}

// Nodes are equal when they describe the same thing; the stored result does
// not take part.
impl<R> PartialEq for RequestGraphNode<R> {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Root, Self::Root) => true,
            (Self::Request(a), Self::Request(b)) => a.id == b.id,
            (Self::File(a), Self::File(b)) => a == b,
            _ => false,
        }
    }
}

pub type RequestGraph<R> = DirectedGraph<RequestKey, RequestGraphNode<R>, RequestEdge>;

/// Remembers the result of every request and what it was derived from.
///
/// Requests hang below a root node. Their outgoing edges point at the files
/// they subscribed to and at the requests they consumed, so a change to any
/// of those marks them invalid. Results are kept until the request is
/// untracked, and the whole tracker is persisted with the cache.
#[derive(Serialize, Deserialize)]
pub struct RequestTracker<R> {
    graph: RequestGraph<R>,
}

impl<R> Default for RequestTracker<R> {
    fn default() -> Self {
        Self {
            graph: DirectedGraph::with_root(RequestKey::Root, RequestGraphNode::Root),
        }
    }
}

impl<R> RequestTracker<R> {
    /// An empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn graph(&self) -> &RequestGraph<R> {
        &self.graph
    }

    /// The tracked request, valid or not.
    pub fn node(&self, id: &RequestId) -> Option<&RequestNode<R>> {
        match self.graph.get(&RequestKey::Request(*id)) {
            Some(RequestGraphNode::Request(node)) => Some(node),
            _ => None,
        }
    }

    fn node_mut(&mut self, id: &RequestId) -> Option<&mut RequestNode<R>> {
        match self.graph.get_mut(&RequestKey::Request(*id)) {
            Some(RequestGraphNode::Request(node)) => Some(node),
            _ => None,
        }
    }

    /// Every tracked request. File nodes and the root are skipped.
    pub fn requests(&self) -> impl Iterator<Item = &RequestNode<R>> {
        self.graph.nodes().filter_map(|(_, node)| match node {
            RequestGraphNode::Request(node) => Some(node),
            _ => None,
        })
    }

    /// Whether the request has a node, whatever the state of its result.
    pub fn is_tracked(&self, id: &RequestId) -> bool {
        self.node(id).is_some()
    }

    /// Whether a result is stored and nothing invalidated it since.
    pub fn has_valid_result(&self, id: &RequestId) -> bool {
        self.node(id)
            .is_some_and(|node| node.valid && node.result.is_some())
    }

    /// The stored result, if it is still valid.
    pub fn result(&self, id: &RequestId) -> Option<&R> {
        self.node(id)
            .filter(|node| node.valid)
            .and_then(|node| node.result.as_ref())
    }

    /// Registers a request that is about to run. A request that is already
    /// tracked keeps its old result but is no longer valid.
    pub fn start_request(&mut self, id: RequestId, kind: &str) -> Result<(), GraphError> {
        if let Some(node) = self.node_mut(&id) {
            node.valid = false;
            return Ok(());
        }

        let key = RequestKey::Request(id);
        let node = RequestNode {
            id,
            kind: kind.to_string(),
            result: None,
            revision: 0,
            valid: false,
            unpredictable: false,
        };

        self.graph.add_node(key.clone(), RequestGraphNode::Request(node))?;
        self.graph.add_edge(&RequestKey::Root, &key, None)?;

        Ok(())
    }

    /// Stores the result of a successful run and replaces the request's
    /// subscriptions with the ones it just declared.
    pub fn complete_request(
        &mut self,
        id: RequestId,
        result: R,
        invalidations: Invalidations,
    ) -> Result<(), GraphError> {
        let key = RequestKey::Request(id);
        let node = self.node_mut(&id).ok_or_else(|| GraphError::unknown(&key))?;

        node.result = Some(result);
        node.revision += 1;
        node.valid = true;
        node.unpredictable = invalidations.on_startup;

        let files = [
            (RequestEdge::InvalidatedByUpdate, invalidations.on_update),
            (RequestEdge::InvalidatedByCreate, invalidations.on_create),
            (RequestEdge::InvalidatedByDelete, invalidations.on_delete),
            (RequestEdge::InvalidatedByDirectory, invalidations.on_directory),
        ];

        for (edge, paths) in files {
            let children = paths
                .into_iter()
                .map(|path| (RequestKey::File(path.clone()), RequestGraphNode::File(path)))
                .collect();

            self.graph
                .replace_nodes_connected_from(&key, children, Some(edge))?;
        }

        let current = self
            .graph
            .connected_from(&key, Some(&RequestEdge::SubRequest));

        for child in current {
            let keep = matches!(&child, RequestKey::Request(id) if invalidations.sub_requests.contains(id));
            if !keep {
                self.graph
                    .remove_edge(&key, &child, Some(&RequestEdge::SubRequest))?;
            }
        }

        for sub in invalidations.sub_requests {
            let child = RequestKey::Request(sub);
            if self.graph.has_node(&child) {
                self.graph
                    .add_edge(&key, &child, Some(RequestEdge::SubRequest))?;
            } else {
                tracing::debug!("Request {id} depends on untracked request {sub}");
            }
        }

        Ok(())
    }

    /// Records a failed run. Failures are never cached, the request stays
    /// invalid and runs again the next time it is needed.
    pub fn reject_request(&mut self, id: RequestId) {
        if let Some(node) = self.node_mut(&id) {
            node.valid = false;
        }
    }

    /// Forgets a request along with the file subscriptions only it used.
    pub fn untrack_request(&mut self, id: RequestId) -> Result<(), GraphError> {
        let key = RequestKey::Request(id);
        if self.graph.has_node(&key) {
            self.graph.remove_node(&key)?;
        }
        Ok(())
    }

    /// Marks a request invalid together with every request that consumed it,
    /// transitively. Returns all requests touched.
    pub fn invalidate_request(&mut self, id: RequestId) -> Vec<RequestId> {
        let mut touched = Vec::new();
        let mut seen = HashSet::new();
        let mut stack = vec![id];

        while let Some(id) = stack.pop() {
            if !seen.insert(id) {
                continue;
            }

            let Some(node) = self.node_mut(&id) else {
                continue;
            };

            node.valid = false;
            touched.push(id);

            let parents = self.graph.connected_to(
                &RequestKey::Request(id),
                Some(&RequestEdge::SubRequest),
            );

            stack.extend(parents.into_iter().filter_map(|key| match key {
                RequestKey::Request(id) => Some(id),
                _ => None,
            }));
        }

        touched
    }

    /// Invalidates the requests that declared a dependency on the process
    /// environment rather than on files.
    pub fn invalidate_unpredictable_nodes(&mut self) -> Vec<RequestId> {
        let unpredictable: Vec<_> = self
            .requests()
            .filter(|node| node.unpredictable)
            .map(|node| node.id)
            .collect();

        unpredictable
            .into_iter()
            .flat_map(|id| self.invalidate_request(id))
            .collect()
    }

    /// Invalidates every request subscribed to one of the changed paths and
    /// returns the ids that were invalidated.
    pub fn respond_to_fs_events(&mut self, events: &[FsEvent]) -> HashSet<RequestId> {
        let mut hits = Vec::new();

        for event in events {
            let edges: &[RequestEdge] = match event.kind {
                FsEventKind::Update => &[RequestEdge::InvalidatedByUpdate],
                FsEventKind::Create => &[RequestEdge::InvalidatedByCreate],
                FsEventKind::Delete => &[
                    RequestEdge::InvalidatedByUpdate,
                    RequestEdge::InvalidatedByDelete,
                ],
            };

            let key = RequestKey::File(event.path.clone());
            for edge in edges {
                hits.extend(self.graph.connected_to(&key, Some(edge)));
            }

            hits.extend(self.directory_subscribers(&event.path));
        }

        let mut invalidated = HashSet::new();
        for key in hits {
            if let RequestKey::Request(id) = key {
                invalidated.extend(self.invalidate_request(id));
            }
        }

        if !invalidated.is_empty() {
            tracing::debug!(
                "{} filesystem events invalidated {} requests",
                events.len(),
                invalidated.len()
            );
        }

        invalidated
    }

    fn directory_subscribers(&self, path: &Utf8Path) -> Vec<RequestKey> {
        path.ancestors()
            .flat_map(|dir| {
                self.graph.connected_to(
                    &RequestKey::File(dir.to_owned()),
                    Some(&RequestEdge::InvalidatedByDirectory),
                )
            })
            .collect()
    }
}

impl<R: Clone> RequestTracker<R> {
    /// Runs a request on the calling thread unless a valid result is cached.
    pub fn run_request<Q>(&mut self, request: &Q, cancel: &Cancellation) -> Result<R, RequestFailure>
    where
        Q: Request<R> + ?Sized,
    {
        self.run_with(request, RequestContext::new(cancel.clone()))
    }

    /// Like [`run_request`](Self::run_request), with relative subscriptions
    /// resolved against `root`.
    pub fn run_request_in<Q>(
        &mut self,
        request: &Q,
        cancel: &Cancellation,
        root: &Utf8Path,
    ) -> Result<R, RequestFailure>
    where
        Q: Request<R> + ?Sized,
    {
        self.run_with(request, RequestContext::new(cancel.clone()).with_root(root))
    }

    fn run_with<Q>(&mut self, request: &Q, mut ctx: RequestContext) -> Result<R, RequestFailure>
    where
        Q: Request<R> + ?Sized,
    {
        let id = request.id();
        let kind = request.kind();

        if let Some(result) = self.result(&id) {
            return Ok(result.clone());
        }

        let failure = |error: anyhow::Error| RequestFailure { id, kind, error };

        ctx.check_cancelled().map_err(|e| failure(e.into()))?;
        self.start_request(id, kind).map_err(|e| failure(e.into()))?;

        match request.run(&mut ctx) {
            Ok(result) => {
                self.complete_request(id, result.clone(), ctx.into_invalidations())
                    .map_err(|e| failure(e.into()))?;
                Ok(result)
            }
            Err(error) => {
                self.reject_request(id);
                Err(failure(error))
            }
        }
    }
}
