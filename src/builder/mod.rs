//! The orchestrator: owns the build graph and the request tracker, drives
//! builds, and persists both between runs.

mod requests;
mod scheduler;
mod validate;

#[cfg(test)]
mod tests;

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fs;
use std::sync::Arc;
use std::time::{Duration, Instant};

use camino::Utf8PathBuf;

use crate::build_graph::BuildGraph;
use crate::cache::{self, Cache, FsCache};
use crate::core::{Hash32, as_overhead};
use crate::diagnostics;
use crate::error::{BuildError, CacheError, RequestFailure, RequestFailures};
use crate::options::BuildOptions;
use crate::plugin::{Config, Pipeline, Validator};
use crate::request::{Cancellation, FsEvent, Request, RequestId, RequestTracker};
use crate::snapshot::{HashingFs, InputFs};
use crate::types::{Asset, AssetGroup, EnvironmentContext};
use crate::workers::{LocalFarm, RUN_VALIDATE, ReverseHandle, WorkerFarm, WorkerHandle};

use self::requests::{ConfigResult, PipelineRequest, RequestInput};
use self::scheduler::Scheduler;

pub use self::requests::RequestResult;
pub use self::validate::ValidationReport;

/// External services a [`GraphBuilder`] works with.
#[derive(Clone)]
pub struct Services {
    pub cache: Arc<dyn Cache>,
    pub fs: Arc<dyn InputFs>,
    pub farm: Arc<dyn WorkerFarm>,
    /// Validators running in-process over every asset at once. Validators
    /// looking at one asset at a time belong to the farm.
    pub validators: Vec<Arc<dyn Validator>>,
}

impl Services {
    /// Services for a build on the local machine: a cache directory under the
    /// project, snapshots hashed from disk and an in-process farm.
    pub fn local(options: &BuildOptions, validators: Vec<Arc<dyn Validator>>) -> Result<Self, CacheError> {
        Ok(Self {
            cache: Arc::new(FsCache::new(options.cache_dir())?),
            fs: Arc::new(HashingFs),
            farm: Arc::new(LocalFarm::with_validators(validators.clone())),
            validators,
        })
    }
}

/// Where the persisted state of one set of options lives.
#[derive(Debug, Clone)]
struct CacheKeys {
    build_graph: Hash32,
    request_graph: Hash32,
    snapshot: Utf8PathBuf,
}

impl CacheKeys {
    fn new(options: &BuildOptions, cache: &dyn Cache) -> Self {
        let key = options.cache_key().to_hex();
        let snapshot = Hash32::hash(format!("{key}:snapshot"));

        Self {
            build_graph: Hash32::hash(format!("{key}:buildGraph")),
            request_graph: Hash32::hash(format!("{key}:requestGraph")),
            snapshot: cache.cache_path(&snapshot, ".txt"),
        }
    }
}

type Restored = (BuildGraph, RequestTracker<RequestResult>, Vec<FsEvent>);

#[derive(Debug, Clone, Default)]
pub struct BuildStats {
    /// Requests executed by this build.
    pub requests_run: usize,
    /// Requests whose stored result was applied without running them.
    pub requests_reused: usize,
    pub durations: HashMap<RequestId, Duration>,
    pub elapsed: Duration,
}

#[derive(Debug, Clone, Default)]
pub struct BuildOutput {
    /// Assets produced by requests that ran in this build, keyed by asset id.
    pub changed_assets: BTreeMap<String, Asset>,
    pub stats: BuildStats,
}

pub struct GraphBuilder {
    options: BuildOptions,
    pipeline: Arc<dyn Pipeline>,
    services: Services,
    keys: CacheKeys,
    graph: BuildGraph,
    tracker: RequestTracker<RequestResult>,
    config: Option<Arc<ConfigResult>>,
    validate_handle: WorkerHandle,
    reverse_handle: ReverseHandle,
    /// Asset groups transformed since the last validation.
    asset_requests: Vec<AssetGroup>,
    durations: HashMap<RequestId, Duration>,
}

impl GraphBuilder {
    /// Restores the state persisted for these options, or starts from an
    /// empty graph when there is none or it cannot be read.
    ///
    /// The project root is canonicalized when it exists, so that paths
    /// subscribed by requests and paths reported by the filesystem agree.
    pub fn init(
        mut options: BuildOptions,
        pipeline: Arc<dyn Pipeline>,
        services: Services,
    ) -> Result<Self, BuildError> {
        let s = Instant::now();

        if let Ok(root) = options.project_root.canonicalize_utf8() {
            options.project_root = root;
        }

        let keys = CacheKeys::new(&options, services.cache.as_ref());
        let validate_handle = services.farm.create_handle(RUN_VALIDATE);
        let reverse_handle = services.farm.create_reverse_handle(Box::new(|| {}));

        let mut builder = Self {
            options,
            pipeline,
            services,
            keys,
            graph: BuildGraph::new(),
            tracker: RequestTracker::new(),
            config: None,
            validate_handle,
            reverse_handle,
            asset_requests: Vec::new(),
            durations: HashMap::new(),
        };

        if !builder.options.disable_cache {
            match builder.read_from_cache() {
                Ok(Some((graph, tracker, events))) => {
                    builder.graph = graph;
                    builder.tracker = tracker;

                    let unpredictable = builder.tracker.invalidate_unpredictable_nodes();
                    let changed = builder.respond_to_fs_events(&events);

                    tracing::info!(
                        "Restored {} nodes, {} changes since last build invalidated {} requests",
                        builder.graph.node_count(),
                        events.len(),
                        changed.len() + unpredictable.len()
                    );
                }
                Ok(None) => tracing::debug!("No cached build state"),
                Err(e) => tracing::warn!("Ignoring cached build state:\n{e}"),
            }
        }

        let removed = builder
            .graph
            .initialize(&builder.options.entries, &builder.options.asset_groups)?;

        for (_, node) in removed {
            if let Some(request) = node.state.request {
                builder.tracker.untrack_request(request)?;
            }
        }

        builder.set_environment_filter(builder.options.contexts.clone());

        tracing::info!("Build graph ready {}", as_overhead(s));
        Ok(builder)
    }

    fn read_from_cache(&self) -> Result<Option<Restored>, BuildError> {
        let cache = self.services.cache.as_ref();

        let (Some(graph), Some(tracker)) = (
            cache.get(&self.keys.build_graph)?,
            cache.get(&self.keys.request_graph)?,
        ) else {
            return Ok(None);
        };

        let graph = cache::decode("buildGraph", &graph)?;
        let tracker = cache::decode("requestGraph", &tracker)?;
        let events = self.services.fs.events_since(
            &self.options.project_root,
            &self.keys.snapshot,
            &self.options.watcher_ignore(),
        )?;

        Ok(Some((graph, tracker, events)))
    }

    pub fn options(&self) -> &BuildOptions {
        &self.options
    }

    pub fn graph(&self) -> &BuildGraph {
        &self.graph
    }

    pub fn requests(&self) -> &RequestTracker<RequestResult> {
        &self.tracker
    }

    /// The configuration of the last build, if there was one.
    pub fn config(&self) -> Option<&Config> {
        self.config.as_deref().map(|result| &result.config)
    }

    pub fn reverse_handle(&self) -> ReverseHandle {
        self.reverse_handle
    }

    pub fn watcher_ignore(&self) -> Vec<Utf8PathBuf> {
        self.options.watcher_ignore()
    }

    /// Invalidates every request affected by the events. The affected nodes
    /// are rebuilt by the next [`build`](Self::build).
    ///
    /// Relative event paths are taken relative to the project root.
    pub fn respond_to_fs_events(&mut self, events: &[FsEvent]) -> HashSet<RequestId> {
        let root = &self.options.project_root;
        let events: Vec<FsEvent> = events
            .iter()
            .map(|event| FsEvent::new(root.join(&event.path), event.kind))
            .collect();

        self.tracker.respond_to_fs_events(&events)
    }

    pub fn set_environment_filter(&mut self, contexts: Option<BTreeSet<EnvironmentContext>>) {
        let reactivated = self.graph.set_environment_filter(contexts);
        if !reactivated.is_empty() {
            tracing::debug!("{} deferred asset groups reactivated", reactivated.len());
        }
    }

    /// Brings the build graph up to date and returns the assets that changed.
    ///
    /// On failure the graph keeps every result applied so far, so the next
    /// build only retries what did not finish.
    pub fn build(&mut self, cancel: &Cancellation) -> Result<BuildOutput, BuildError> {
        let s = Instant::now();

        let config = self.setup(cancel)?;
        let scheduler = Scheduler::new(
            &mut self.graph,
            &mut self.tracker,
            self.pipeline.clone(),
            config,
            cancel.clone(),
            self.options.project_root.clone(),
            self.options.concurrency(),
        );

        let outcome = scheduler.run()?;
        self.asset_requests.extend(outcome.asset_requests);

        if cancel.is_cancelled() {
            tracing::info!("Build cancelled {}", as_overhead(s));
            return Err(BuildError::Cancelled);
        }

        let failures: Vec<_> = outcome
            .failures
            .into_values()
            .filter(|failure| self.tracker.is_tracked(&failure.id))
            .collect();

        if let Some(failures) = RequestFailures::new(failures) {
            tracing::error!("Build failed {}", as_overhead(s));
            return Err(failures.into());
        }

        self.durations = outcome.durations.clone();
        self.dump_graphs();

        let stats = BuildStats {
            requests_run: outcome.durations.len(),
            requests_reused: outcome.reused,
            durations: outcome.durations,
            elapsed: s.elapsed(),
        };

        tracing::info!(
            "Built {} assets, ran {} requests {}",
            outcome.changed_assets.len(),
            stats.requests_run,
            as_overhead(s)
        );

        Ok(BuildOutput {
            changed_assets: outcome.changed_assets,
            stats,
        })
    }

    /// Loads the configuration and resets every node whose request was
    /// invalidated since the last build.
    fn setup(&mut self, cancel: &Cancellation) -> Result<Arc<ConfigResult>, BuildError> {
        let request = PipelineRequest::new(self.pipeline.clone(), RequestInput::Config);
        let id = request.id();

        let result = self
            .tracker
            .run_request_in(&request, cancel, &self.options.project_root)
            .map_err(|failure| {
                if failure.is_cancelled() {
                    BuildError::Cancelled
                } else {
                    BuildError::Config(failure)
                }
            })?;

        let name = result.name();
        let loaded = result.into_config().ok_or_else(|| {
            BuildError::Config(RequestFailure {
                id,
                kind: request.kind(),
                error: anyhow::anyhow!("Configuration request returned {name}"),
            })
        })?;

        let config = match &self.config {
            Some(current) if current.config_ref == loaded.config_ref => current.clone(),
            _ => {
                tracing::debug!("Using configuration {}", loaded.config_ref.short());
                let config = Arc::new(loaded);
                self.config = Some(config.clone());
                config
            }
        };

        let tracker = &self.tracker;
        let reset = self
            .graph
            .reset_invalidated(|id| tracker.has_valid_result(id));

        if reset > 0 {
            tracing::debug!("{reset} nodes need to be rebuilt");
        }

        Ok(config)
    }

    /// Persists both graphs and a snapshot of the project, so that the next
    /// [`init`](Self::init) only rebuilds what changed in between.
    pub fn write_to_cache(&self) -> Result<(), BuildError> {
        if self.options.disable_cache {
            return Ok(());
        }

        let s = Instant::now();
        let cache = self.services.cache.as_ref();

        cache.set(&self.keys.build_graph, &cache::encode("buildGraph", &self.graph)?)?;
        cache.set(&self.keys.request_graph, &cache::encode("requestGraph", &self.tracker)?)?;

        self.services.fs.write_snapshot(
            &self.options.project_root,
            &self.keys.snapshot,
            &self.options.watcher_ignore(),
        )?;

        tracing::info!("Persisted build state {}", as_overhead(s));
        Ok(())
    }

    fn dump_graphs(&self) {
        let Some(dir) = &self.options.dump_graphs else {
            return;
        };

        let build_graph = diagnostics::render_mermaid(self.graph.graph(), |_, node| node.kind.label());
        let request_graph = diagnostics::render_request_graph(self.tracker.graph(), &self.durations);

        let written = fs::create_dir_all(dir)
            .and_then(|_| fs::write(dir.join("build_graph.mmd"), build_graph))
            .and_then(|_| fs::write(dir.join("request_graph.mmd"), request_graph));

        if let Err(e) = written {
            tracing::warn!("Couldn't write graph dumps to {dir}: {e}");
        }
    }
}
