//! Traversal of the build graph that schedules the requests completing its
//! nodes.
//!
//! The walk runs on the calling thread, which is the only one touching the
//! graphs. Requests are spawned onto the rayon pool and report back over a
//! channel; their results are applied here before the children of the node
//! they completed are visited, so a child is only ever seen in its final
//! shape.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::sync::mpsc::{Sender, channel};
use std::time::{Duration, Instant};

use camino::Utf8PathBuf;
use indicatif::ProgressStyle;
use tracing::Level;
use tracing_indicatif::span_ext::IndicatifSpanExt;

use crate::build_graph::{BuildGraph, BuildNodeKind, NodeId};
use crate::builder::requests::{ConfigResult, PipelineRequest, RequestInput, RequestResult};
use crate::error::{BuildError, RequestFailure};
use crate::plugin::Pipeline;
use crate::request::{Cancellation, Invalidations, Request, RequestContext, RequestId, RequestTracker};
use crate::types::{Asset, AssetGroup};

enum Step {
    Visit(NodeId),
    VisitChildren(NodeId),
}

struct Job {
    seq: u64,
    request: PipelineRequest,
}

struct Completion {
    seq: u64,
    id: RequestId,
    kind: &'static str,
    outcome: anyhow::Result<RequestResult>,
    invalidations: Invalidations,
    elapsed: Duration,
}

/// What a traversal left behind for the caller to collect.
#[derive(Default)]
pub(crate) struct Outcome {
    /// Keyed by submission order.
    pub failures: BTreeMap<u64, RequestFailure>,
    pub changed_assets: BTreeMap<String, Asset>,
    pub asset_requests: Vec<AssetGroup>,
    pub durations: HashMap<RequestId, Duration>,
    pub reused: usize,
}

pub(crate) struct Scheduler<'a> {
    graph: &'a mut BuildGraph,
    tracker: &'a mut RequestTracker<RequestResult>,
    pipeline: Arc<dyn Pipeline>,
    config: Arc<ConfigResult>,
    cancel: Cancellation,
    /// Relative subscriptions are resolved against it.
    root: Utf8PathBuf,
    concurrency: usize,
    stack: Vec<Step>,
    visited: HashSet<NodeId>,
    /// Nodes waiting on each request that is queued or running.
    pending: HashMap<RequestId, Vec<NodeId>>,
    waiting: VecDeque<Job>,
    running: usize,
    seq: u64,
    outcome: Outcome,
}

impl<'a> Scheduler<'a> {
    pub fn new(
        graph: &'a mut BuildGraph,
        tracker: &'a mut RequestTracker<RequestResult>,
        pipeline: Arc<dyn Pipeline>,
        config: Arc<ConfigResult>,
        cancel: Cancellation,
        root: Utf8PathBuf,
        concurrency: usize,
    ) -> Self {
        Self {
            graph,
            tracker,
            pipeline,
            config,
            cancel,
            root,
            concurrency: concurrency.max(1),
            stack: Vec::new(),
            visited: HashSet::new(),
            pending: HashMap::new(),
            waiting: VecDeque::new(),
            running: 0,
            seq: 0,
            outcome: Outcome::default(),
        }
    }

    pub fn run(mut self) -> Result<Outcome, BuildError> {
        let span = tracing::span!(Level::INFO, "build");
        span.pb_set_style(&crate::utils::get_style_build()?);
        span.pb_set_message("Building...");
        let _enter = span.enter();

        let style = crate::utils::get_style_request()?;

        self.stack.push(Step::Visit(self.graph.root()));
        rayon::in_place_scope(|scope| self.drive(scope, &span, &style))?;

        Ok(self.outcome)
    }

    fn stopped(&self) -> bool {
        !self.outcome.failures.is_empty() || self.cancel.is_cancelled()
    }

    fn drive<'s>(
        &mut self,
        scope: &rayon::Scope<'s>,
        span: &tracing::Span,
        style: &ProgressStyle,
    ) -> Result<(), BuildError> {
        let (tx, rx) = channel::<Completion>();
        let mut submitted = 0;

        loop {
            while !self.stopped()
                && let Some(step) = self.stack.pop()
            {
                match step {
                    Step::Visit(id) => self.visit(id)?,
                    Step::VisitChildren(id) => self.visit_children(id),
                }
            }

            if self.stopped() {
                self.stack.clear();
                self.waiting.clear();
            }

            while self.running < self.concurrency
                && let Some(job) = self.waiting.pop_front()
            {
                if self.submit(scope, &tx, job, style)? {
                    submitted += 1;
                    span.pb_set_length(submitted);
                }
            }

            // nothing running means nothing is left to visit or submit
            if self.running == 0 {
                break;
            }

            // every running job holds a sender, so this only fails if one of
            // them disappeared without reporting
            let Ok(done) = rx.recv() else {
                tracing::error!("Lost track of {} running requests", self.running);
                break;
            };

            self.running -= 1;
            span.pb_inc(1);
            self.finish(done)?;
        }

        Ok(())
    }

    fn visit(&mut self, id: NodeId) -> Result<(), BuildError> {
        let Some(node) = self.graph.get(&id) else {
            return Ok(());
        };

        if self.visited.contains(&id) && !node.state.has_deferred_descendant {
            return Ok(());
        }

        self.visited.insert(id);
        self.graph.mark_visited(&id);

        let Some(request) = self.corresponding_request(&id) else {
            self.stack.push(Step::VisitChildren(id));
            return Ok(());
        };

        let request_id = request.id();

        // restored or re-created nodes can find their result already stored
        if let Some(result) = self.tracker.result(&request_id).cloned() {
            self.apply(id, request_id, result)?;
            self.outcome.reused += 1;
            self.stack.push(Step::VisitChildren(id));
            return Ok(());
        }

        self.queue(request, id);
        Ok(())
    }

    fn visit_children(&mut self, id: NodeId) {
        for child in self.graph.children(&id).into_iter().rev() {
            if self.graph.should_visit_child(&id, &child) {
                self.stack.push(Step::Visit(child));
            }
        }
    }

    fn corresponding_request(&self, id: &NodeId) -> Option<PipelineRequest> {
        let node = self.graph.get(id)?;
        if node.state.complete || node.state.deferred {
            return None;
        }

        let input = match &node.kind {
            BuildNodeKind::EntrySpecifier(specifier) => RequestInput::Entry(specifier.clone()),
            BuildNodeKind::EntryFile(entry) => RequestInput::Target(entry.clone()),
            BuildNodeKind::Dependency(dependency) => RequestInput::Dependency {
                dependency: dependency.clone(),
                config: self.config.clone(),
            },
            BuildNodeKind::AssetGroup(group) => RequestInput::Asset {
                group: group.clone(),
                config: self.config.clone(),
            },
            BuildNodeKind::Root | BuildNodeKind::Target { .. } | BuildNodeKind::Asset(_) => {
                return None;
            }
        };

        Some(PipelineRequest::new(self.pipeline.clone(), input))
    }

    /// At most one run per request id is in flight; later nodes asking for
    /// the same request wait for that run.
    fn queue(&mut self, request: PipelineRequest, node: NodeId) {
        let id = request.id();

        if let Some(nodes) = self.pending.get_mut(&id) {
            nodes.push(node);
            return;
        }

        self.pending.insert(id, vec![node]);
        self.seq += 1;
        self.waiting.push_back(Job {
            seq: self.seq,
            request,
        });
    }

    /// Returns whether the job was actually spawned.
    fn submit<'s>(
        &mut self,
        scope: &rayon::Scope<'s>,
        tx: &Sender<Completion>,
        job: Job,
        style: &ProgressStyle,
    ) -> Result<bool, BuildError> {
        let id = job.request.id();
        let kind = job.request.kind();

        // every node asking for it was pruned while it waited
        let alive = self
            .pending
            .get(&id)
            .is_some_and(|nodes| nodes.iter().any(|node| self.graph.get(node).is_some()));

        if !alive {
            self.pending.remove(&id);
            return Ok(false);
        }

        self.tracker.start_request(id, kind)?;
        self.running += 1;

        let tx = tx.clone();
        let cancel = self.cancel.clone();
        let root = self.root.clone();
        let style = style.clone();

        scope.spawn(move |_| {
            let Job { seq, request } = job;

            let span = tracing::span!(Level::INFO, "request", kind);
            span.pb_set_style(&style);
            span.pb_set_message(&format!("{kind} {}", request.label()));
            let _enter = span.enter();

            let start = Instant::now();
            let mut ctx = RequestContext::new(cancel).with_root(&root);

            let outcome = match ctx.check_cancelled() {
                Err(e) => Err(e.into()),
                Ok(()) => execute(&request, &mut ctx),
            };

            // the receiver is gone only if the control thread bailed out
            _ = tx.send(Completion {
                seq,
                id,
                kind,
                outcome,
                invalidations: ctx.into_invalidations(),
                elapsed: start.elapsed(),
            });
        });

        Ok(true)
    }

    fn finish(&mut self, done: Completion) -> Result<(), BuildError> {
        let nodes = self.pending.remove(&done.id).unwrap_or_default();

        if !self.tracker.is_tracked(&done.id) {
            tracing::debug!("Dropping result of untracked request {}", done.id);
            return Ok(());
        }

        let result = match done.outcome {
            Ok(result) => result,
            Err(error) => {
                self.tracker.reject_request(done.id);
                self.outcome.failures.insert(
                    done.seq,
                    RequestFailure {
                        id: done.id,
                        kind: done.kind,
                        error,
                    },
                );
                return Ok(());
            }
        };

        tracing::debug!("Finished {} {} in {:.2?}", done.kind, done.id, done.elapsed);

        self.tracker
            .complete_request(done.id, result.clone(), done.invalidations)?;
        self.outcome.durations.insert(done.id, done.elapsed);

        if let RequestResult::Assets(assets) = &result {
            for asset in assets {
                self.outcome
                    .changed_assets
                    .insert(asset.id.clone(), asset.clone());
            }
        }

        for node in nodes {
            if self.graph.get(&node).is_none() {
                continue;
            }

            if let Some(BuildNodeKind::AssetGroup(group)) = self.graph.get(&node).map(|n| &n.kind) {
                self.outcome.asset_requests.push(group.clone());
            }

            self.apply(node, done.id, result.clone())?;
            self.stack.push(Step::VisitChildren(node));
        }

        Ok(())
    }

    /// Writes a request result into the graph and forgets the requests of
    /// every node that got pruned by it.
    fn apply(&mut self, id: NodeId, request: RequestId, result: RequestResult) -> Result<(), BuildError> {
        let Some(node) = self.graph.get(&id) else {
            return Ok(());
        };

        let previous = node.state.request;
        let kind = node.kind.clone();

        let removed = match (kind, result) {
            (BuildNodeKind::EntrySpecifier(specifier), RequestResult::Entries(entries)) => {
                self.graph.resolve_entry(&specifier, entries, request)?
            }
            (BuildNodeKind::EntryFile(entry), RequestResult::Targets(targets)) => {
                self.graph.resolve_targets(&entry, targets, request)?
            }
            (BuildNodeKind::Dependency(dependency), RequestResult::Dependency(group)) => {
                self.graph.resolve_dependency(&dependency, group, request)?
            }
            (BuildNodeKind::AssetGroup(group), RequestResult::Assets(assets)) => {
                self.graph.resolve_asset_group(&group, assets, request)?
            }
            (kind, result) => {
                tracing::warn!(
                    "Request {request} returned {} for a {} node",
                    result.name(),
                    kind.name()
                );
                return Ok(());
            }
        };

        if let Some(previous) = previous
            && previous != request
        {
            self.tracker.untrack_request(previous)?;
        }

        for (_, node) in removed {
            if let Some(request) = node.state.request {
                self.tracker.untrack_request(request)?;
            }
        }

        Ok(())
    }
}

fn execute(request: &PipelineRequest, ctx: &mut RequestContext) -> anyhow::Result<RequestResult> {
    // A panicking pipeline only poisons its own request: the job owns its
    // input and the context is discarded with the failure.
    match std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| request.run(ctx))) {
        Ok(result) => result,
        Err(panic) => {
            let msg = if let Some(s) = panic.downcast_ref::<&str>() {
                format!("Request panicked: {s}")
            } else if let Some(s) = panic.downcast_ref::<String>() {
                format!("Request panicked: {s}")
            } else {
                String::from("Request panicked with unknown payload")
            };

            Err(anyhow::anyhow!(msg))
        }
    }
}
