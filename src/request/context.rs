use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};

use crate::error::Cancelled;
use crate::request::RequestId;

/// A cooperative cancellation token shared by every request of a build.
///
/// Cancelling stops the orchestrator from issuing new requests. Work that is
/// already running only stops if it polls the token, e.g. through
/// [`RequestContext::check_cancelled`].
#[derive(Debug, Clone, Default)]
pub struct Cancellation(Arc<AtomicBool>);

impl Cancellation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    pub fn check(&self) -> Result<(), Cancelled> {
        if self.is_cancelled() {
            Err(Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Everything a request declared about what should invalidate its result.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Invalidations {
    pub on_update: BTreeSet<Utf8PathBuf>,
    pub on_create: BTreeSet<Utf8PathBuf>,
    pub on_delete: BTreeSet<Utf8PathBuf>,
    pub on_directory: BTreeSet<Utf8PathBuf>,
    pub on_startup: bool,
    pub sub_requests: BTreeSet<RequestId>,
}

impl Invalidations {
    /// Joins every relative path onto `root`. Absolute paths are kept.
    pub fn resolve(self, root: &Utf8Path) -> Self {
        let join = |paths: BTreeSet<Utf8PathBuf>| paths.into_iter().map(|path| root.join(path)).collect();

        Self {
            on_update: join(self.on_update),
            on_create: join(self.on_create),
            on_delete: join(self.on_delete),
            on_directory: join(self.on_directory),
            ..self
        }
    }
}

/// Handed to [`Request::run`](crate::Request::run). Collects the
/// invalidation subscriptions of the running request and exposes the build's
/// cancellation token.
///
/// Inside a build, relative paths are taken relative to the project root and
/// stored as absolute paths, the same form filesystem events arrive in.
pub struct RequestContext {
    cancel: Cancellation,
    root: Option<Utf8PathBuf>,
    invalidations: Invalidations,
}

impl RequestContext {
    pub(crate) fn new(cancel: Cancellation) -> Self {
        Self {
            cancel,
            root: None,
            invalidations: Invalidations::default(),
        }
    }

    pub(crate) fn with_root(mut self, root: &Utf8Path) -> Self {
        self.root = Some(root.to_owned());
        self
    }

    /// Re-run when the file at `path` changes or is deleted.
    pub fn invalidate_on_file_update(&mut self, path: impl Into<Utf8PathBuf>) {
        self.invalidations.on_update.insert(path.into());
    }

    /// Re-run when a file appears at `path`, e.g. a resolution candidate that
    /// did not exist yet.
    pub fn invalidate_on_file_create(&mut self, path: impl Into<Utf8PathBuf>) {
        self.invalidations.on_create.insert(path.into());
    }

    pub fn invalidate_on_file_delete(&mut self, path: impl Into<Utf8PathBuf>) {
        self.invalidations.on_delete.insert(path.into());
    }

    /// Re-run on any change at or below `dir`.
    pub fn invalidate_on_directory(&mut self, dir: impl Into<Utf8PathBuf>) {
        self.invalidations.on_directory.insert(dir.into());
    }

    /// The result depends on state the filesystem does not capture, so it has
    /// to be recomputed after every restart.
    pub fn invalidate_on_startup(&mut self) {
        self.invalidations.on_startup = true;
    }

    /// Declares that this request consumed the result of another one.
    pub fn depends_on(&mut self, id: RequestId) {
        self.invalidations.sub_requests.insert(id);
    }

    pub fn check_cancelled(&self) -> Result<(), Cancelled> {
        self.cancel.check()
    }

    pub fn cancellation(&self) -> &Cancellation {
        &self.cancel
    }

    pub(crate) fn into_invalidations(self) -> Invalidations {
        match self.root {
            Some(root) => self.invalidations.resolve(&root),
            None => self.invalidations,
        }
    }
}
