use camino::Utf8PathBuf;
use thiserror::Error;

use crate::request::RequestId;

/// Structural errors of a [`DirectedGraph`](crate::graph::DirectedGraph).
///
/// These are programming errors: they abort the mutating call and are never
/// retried.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GraphError {
    #[error("Node {0} already exists with a different payload")]
    DuplicateNode(String),

    #[error("Node {0} does not exist")]
    UnknownNode(String),

    #[error("A root node is required to traverse")]
    RootMissing,
}

impl GraphError {
    pub(crate) fn duplicate(id: &impl std::fmt::Debug) -> Self {
        GraphError::DuplicateNode(format!("{id:?}"))
    }

    pub(crate) fn unknown(id: &impl std::fmt::Debug) -> Self {
        GraphError::UnknownNode(format!("{id:?}"))
    }
}

/// Returned by [`RequestContext::check_cancelled`](crate::RequestContext::check_cancelled)
/// when the build this request belongs to was cancelled.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("Build was cancelled")]
pub struct Cancelled;

/// A single request whose work function failed.
#[derive(Debug, Error)]
#[error("Request '{kind}' ({id}):\n{error:#}")]
pub struct RequestFailure {
    pub id: RequestId,
    pub kind: &'static str,
    pub error: anyhow::Error,
}

impl RequestFailure {
    pub fn is_cancelled(&self) -> bool {
        self.error.is::<Cancelled>()
    }
}

/// Every request failure recorded during one build, in submission order.
///
/// Only the first failure is shown when displayed; callers interested in all
/// of them can iterate.
#[derive(Debug)]
pub struct RequestFailures {
    failures: Vec<RequestFailure>,
}

impl std::fmt::Display for RequestFailures {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.first())?;

        if self.failures.len() > 1 {
            write!(f, "\n({} more requests failed)", self.failures.len() - 1)?;
        }

        Ok(())
    }
}

impl std::error::Error for RequestFailures {}

impl RequestFailures {
    /// Returns `None` for an empty list, since a build without failures is
    /// not an error.
    pub(crate) fn new(failures: Vec<RequestFailure>) -> Option<Self> {
        if failures.is_empty() {
            None
        } else {
            Some(Self { failures })
        }
    }

    pub fn first(&self) -> &RequestFailure {
        &self.failures[0]
    }

    pub fn len(&self) -> usize {
        self.failures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &RequestFailure> {
        self.failures.iter()
    }
}

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("Cache unavailable:\n{0}")]
    Unavailable(#[from] std::io::Error),

    #[error("Couldn't encode cache entry '{0}': {1}")]
    Encode(String, String),

    #[error("Couldn't decode cache entry '{0}': {1}")]
    Decode(String, String),
}

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("Couldn't read the filesystem:\n{0}")]
    Io(#[from] std::io::Error),

    #[error("Snapshot '{0}' does not exist")]
    Missing(Utf8PathBuf),

    #[error("Couldn't encode snapshot: {0}")]
    Encode(String),

    #[error("Couldn't decode snapshot '{0}': {1}")]
    Decode(Utf8PathBuf, String),
}

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("Worker function '{0}' is not registered")]
    UnknownFunction(String),

    #[error("Worker function '{0}':\n{1:#}")]
    Failed(String, anyhow::Error),
}

#[derive(Debug, Error)]
pub enum BuildError {
    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error(transparent)]
    Requests(#[from] RequestFailures),

    #[error("Build was cancelled")]
    Cancelled,

    #[error("Couldn't load configuration:\n{0}")]
    Config(RequestFailure),

    #[error("Error while persisting the cache:\n{0}")]
    Cache(#[from] CacheError),

    #[error("Error while writing the filesystem snapshot:\n{0}")]
    Snapshot(#[from] SnapshotError),

    #[error("Invalid progress bar template: {0}")]
    Progress(#[from] indicatif::style::TemplateError),

    #[cfg(feature = "live")]
    #[error("Error while watching for file changes:\n{0}")]
    Watch(#[from] WatchError),
}

#[cfg(feature = "live")]
#[derive(Debug, Error)]
pub enum WatchError {
    #[error(transparent)]
    Notify(#[from] notify::Error),

    #[error("Watcher channel disconnected")]
    Disconnected,
}
