use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};

use super::*;
use crate::cache::MemoryCache;
use crate::error::SnapshotError;
use crate::plugin::{Diagnostic, ValidatorScope};
use crate::request::{FsEventKind, RequestContext, RequestKey};
use crate::types::{Dependency, Entry, Environment, Target};

/// A bundler over an in-memory project: every `import <path>` line of a file
/// is a dependency on that path, `worker:<path>` imports a web worker and
/// `optional:<path>` may be missing.
#[derive(Default)]
struct TestPipeline {
    files: Mutex<BTreeMap<String, String>>,
    config: Mutex<Config>,
    failing: Mutex<HashSet<String>>,
    panicking: Mutex<HashSet<String>>,
    cancel_on: Mutex<Option<String>>,
    delay: Mutex<Duration>,
    /// Extra time spent resolving particular entries.
    slow_entries: Mutex<HashMap<String, Duration>>,
    log: Mutex<Vec<String>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl TestPipeline {
    fn new(files: &[(&str, &str)]) -> Self {
        let pipeline = Self::default();
        for (path, content) in files {
            pipeline.write(path, content);
        }
        pipeline
    }

    fn write(&self, path: &str, content: &str) {
        self.files
            .lock()
            .unwrap()
            .insert(path.to_string(), content.to_string());
    }

    fn exists(&self, path: &str) -> bool {
        self.files.lock().unwrap().contains_key(path)
    }

    fn fail(&self, path: &str) {
        self.failing.lock().unwrap().insert(path.to_string());
    }

    fn heal(&self, path: &str) {
        self.failing.lock().unwrap().remove(path);
    }

    fn record(&self, entry: String) {
        self.log.lock().unwrap().push(entry);
    }

    fn log(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }

    fn take_log(&self) -> Vec<String> {
        std::mem::take(&mut *self.log.lock().unwrap())
    }

    fn count(&self, prefix: &str) -> usize {
        self.log().iter().filter(|entry| entry.starts_with(prefix)).count()
    }
}

impl Pipeline for TestPipeline {
    fn load_config(&self, ctx: &mut RequestContext) -> anyhow::Result<Config> {
        self.record("config".into());
        ctx.invalidate_on_file_update(".kumikirc");
        Ok(self.config.lock().unwrap().clone())
    }

    fn resolve_entry(&self, specifier: &Utf8Path, ctx: &mut RequestContext) -> anyhow::Result<Vec<Entry>> {
        self.record(format!("entry:{specifier}"));
        ctx.invalidate_on_file_update(specifier);

        let slow = self.slow_entries.lock().unwrap().get(specifier.as_str()).copied();
        if let Some(slow) = slow {
            std::thread::sleep(slow);
        }

        let failing = self.failing.lock().unwrap().contains(specifier.as_str());
        anyhow::ensure!(!failing, "Failed to resolve entry {specifier}");
        anyhow::ensure!(self.exists(specifier.as_str()), "Entry {specifier} does not exist");

        Ok(vec![Entry {
            file_path: specifier.to_owned(),
            package_path: "".into(),
        }])
    }

    fn resolve_targets(&self, entry: &Entry, _: &mut RequestContext) -> anyhow::Result<Vec<Target>> {
        self.record(format!("target:{}", entry.file_path));

        Ok(vec![Target {
            name: "default".into(),
            dist_dir: "dist".into(),
            dist_entry: None,
            public_url: "/".into(),
            env: Environment::default(),
        }])
    }

    fn resolve_dependency(
        &self,
        dependency: &Dependency,
        _: &Config,
        ctx: &mut RequestContext,
    ) -> anyhow::Result<Option<AssetGroup>> {
        self.record(format!("dep:{}", dependency.specifier));

        let (path, env) = match dependency.specifier.strip_prefix("worker:") {
            Some(path) => (path, Environment::new(EnvironmentContext::WebWorker)),
            None => (dependency.specifier.as_str(), dependency.env.clone()),
        };

        if !self.exists(path) {
            ctx.invalidate_on_file_create(path);
            if dependency.is_optional {
                return Ok(None);
            }
            anyhow::bail!("Cannot resolve '{}'", dependency.specifier);
        }

        ctx.invalidate_on_file_delete(path);
        Ok(Some(AssetGroup::new(path, env)))
    }

    fn transform(&self, group: &AssetGroup, _: &Config, ctx: &mut RequestContext) -> anyhow::Result<Vec<Asset>> {
        let path = group.file_path.as_str();
        self.record(format!("transform:{path}"));
        ctx.invalidate_on_file_update(path);

        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(current, Ordering::SeqCst);
        let delay = *self.delay.lock().unwrap();
        std::thread::sleep(delay);
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        let cancel = self.cancel_on.lock().unwrap().as_deref() == Some(path);
        if cancel {
            ctx.cancellation().cancel();
            ctx.check_cancelled()?;
        }

        let panics = self.panicking.lock().unwrap().contains(path);
        if panics {
            panic!("transformer crashed on {path}");
        }

        let failing = self.failing.lock().unwrap().contains(path);
        anyhow::ensure!(!failing, "Failed to transform {path}");

        let content = self
            .files
            .lock()
            .unwrap()
            .get(path)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("{path} does not exist"))?;

        let dependencies = content
            .lines()
            .filter_map(|line| line.strip_prefix("import "))
            .map(|specifier| {
                let specifier = specifier.trim();
                let optional = specifier.strip_prefix("optional:");
                let mut dependency = Dependency::new(optional.unwrap_or(specifier), group.env.clone());
                dependency.resolve_from = Some(group.file_path.clone());
                dependency.is_optional = optional.is_some();
                dependency
            })
            .collect();

        Ok(vec![Asset {
            id: path.to_string(),
            file_path: group.file_path.clone(),
            asset_type: "js".into(),
            env: group.env.clone(),
            content_key: Hash32::hash(&content),
            dependencies,
        }])
    }
}

/// Reports whatever events the test queued, once a snapshot exists.
#[derive(Default)]
struct ScriptedFs {
    snapshot: AtomicBool,
    events: Mutex<Vec<FsEvent>>,
}

impl ScriptedFs {
    fn push(&self, event: FsEvent) {
        self.events.lock().unwrap().push(event);
    }
}

impl InputFs for ScriptedFs {
    fn events_since(
        &self,
        _: &Utf8Path,
        snapshot: &Utf8Path,
        _: &[Utf8PathBuf],
    ) -> Result<Vec<FsEvent>, SnapshotError> {
        if !self.snapshot.load(Ordering::SeqCst) {
            return Err(SnapshotError::Missing(snapshot.to_owned()));
        }

        Ok(std::mem::take(&mut *self.events.lock().unwrap()))
    }

    fn write_snapshot(&self, _: &Utf8Path, _: &Utf8Path, _: &[Utf8PathBuf]) -> Result<(), SnapshotError> {
        self.snapshot.store(true, Ordering::SeqCst);
        Ok(())
    }
}

struct NoTodo;

impl Validator for NoTodo {
    fn name(&self) -> &str {
        "no-todo"
    }

    fn scope(&self) -> ValidatorScope {
        ValidatorScope::Asset
    }

    fn validate(&self, groups: &[AssetGroup], _: &Config) -> anyhow::Result<Vec<Diagnostic>> {
        Ok(groups
            .iter()
            .map(|group| Diagnostic::warning("no-todo", "found a TODO").at(group.file_path.clone()))
            .collect())
    }
}

struct FileCount;

impl Validator for FileCount {
    fn name(&self) -> &str {
        "file-count"
    }

    fn scope(&self) -> ValidatorScope {
        ValidatorScope::Project
    }

    fn validate(&self, groups: &[AssetGroup], _: &Config) -> anyhow::Result<Vec<Diagnostic>> {
        Ok(vec![Diagnostic::warning("file-count", format!("{} files", groups.len()))])
    }
}

struct Fixture {
    pipeline: Arc<TestPipeline>,
    cache: Arc<MemoryCache>,
    fs: Arc<ScriptedFs>,
    farm_validators: Vec<Arc<dyn Validator>>,
    project_validators: Vec<Arc<dyn Validator>>,
}

impl Fixture {
    fn new(files: &[(&str, &str)]) -> Self {
        Self {
            pipeline: Arc::new(TestPipeline::new(files)),
            cache: Arc::new(MemoryCache::new("/cache")),
            fs: Arc::new(ScriptedFs::default()),
            farm_validators: Vec::new(),
            project_validators: Vec::new(),
        }
    }

    fn services(&self) -> Services {
        Services {
            cache: self.cache.clone(),
            fs: self.fs.clone(),
            farm: Arc::new(LocalFarm::with_validators(self.farm_validators.clone())),
            validators: self.project_validators.clone(),
        }
    }

    fn builder(&self, options: BuildOptions) -> GraphBuilder {
        GraphBuilder::init(options, self.pipeline.clone(), self.services()).unwrap()
    }
}

const APP: &[(&str, &str)] = &[
    ("src/index.js", "import src/a.js\nimport src/b.js"),
    ("src/a.js", "import src/b.js"),
    ("src/b.js", "export const b = 1;"),
];

fn options() -> BuildOptions {
    BuildOptions {
        entries: vec!["src/index.js".into()],
        project_root: "/project".into(),
        ..Default::default()
    }
}

fn build(builder: &mut GraphBuilder) -> BuildOutput {
    builder.build(&Cancellation::new()).unwrap()
}

fn count_requests(builder: &GraphBuilder, kind: &str) -> usize {
    builder
        .requests()
        .requests()
        .filter(|node| node.kind == kind)
        .count()
}

fn changed(output: &BuildOutput) -> Vec<&str> {
    output.changed_assets.keys().map(String::as_str).collect()
}

fn update(path: &str) -> FsEvent {
    FsEvent::new(path, FsEventKind::Update)
}

#[test]
fn test_initial_build_discovers_everything() {
    let fx = Fixture::new(APP);
    let mut builder = fx.builder(options());

    let output = build(&mut builder);

    assert_eq!(changed(&output), vec!["src/a.js", "src/b.js", "src/index.js"]);
    assert_eq!(builder.graph().assets().count(), 3);
    assert_eq!(fx.pipeline.count("config"), 1);
    assert_eq!(fx.pipeline.count("entry:"), 1);
    assert_eq!(fx.pipeline.count("target:"), 1);
    // the entry dependency, two imports of index and one of a
    assert_eq!(fx.pipeline.count("dep:"), 4);
    // b is imported twice but transformed once
    assert_eq!(fx.pipeline.count("transform:"), 3);
    assert_eq!(output.stats.requests_run, 9);
}

#[test]
fn test_rebuild_without_changes_runs_nothing() {
    let fx = Fixture::new(APP);
    let mut builder = fx.builder(options());
    build(&mut builder);
    fx.pipeline.take_log();

    let output = build(&mut builder);

    assert!(output.changed_assets.is_empty());
    assert_eq!(output.stats.requests_run, 0);
    assert!(fx.pipeline.log().is_empty());
}

#[test]
fn test_restore_from_cache_runs_nothing() {
    let fx = Fixture::new(APP);
    let mut builder = fx.builder(options());
    build(&mut builder);
    builder.write_to_cache().unwrap();
    assert!(!fx.cache.is_empty());
    fx.pipeline.take_log();

    let mut restored = fx.builder(options());
    assert_eq!(restored.graph().node_count(), builder.graph().node_count());

    let output = build(&mut restored);

    assert_eq!(output.stats.requests_run, 0);
    assert!(fx.pipeline.log().is_empty());
    assert_eq!(restored.graph().assets().count(), 3);
}

#[test]
fn test_restore_applies_changes_since_snapshot() {
    let fx = Fixture::new(APP);
    let mut builder = fx.builder(options());
    build(&mut builder);
    builder.write_to_cache().unwrap();
    fx.pipeline.take_log();

    fx.pipeline.write("src/a.js", "export const a = 1;");
    fx.fs.push(update("src/a.js"));

    let mut restored = fx.builder(options());
    let output = build(&mut restored);

    assert_eq!(fx.pipeline.log(), vec!["transform:src/a.js"]);
    assert_eq!(changed(&output), vec!["src/a.js"]);
    // b lost one importer but index still pulls it in
    assert_eq!(restored.graph().assets().count(), 3);
    assert_eq!(count_requests(&restored, "dep_path_request"), 3);
}

#[test]
fn test_restore_sees_changes_on_disk() {
    let project = tempfile::tempdir().unwrap();
    let root = Utf8PathBuf::try_from(project.path().to_path_buf())
        .unwrap()
        .canonicalize_utf8()
        .unwrap();
    for (path, content) in APP {
        let file = root.join(path);
        std::fs::create_dir_all(file.parent().unwrap()).unwrap();
        std::fs::write(&file, content).unwrap();
    }

    let fx = Fixture::new(APP);
    let cache = Arc::new(MemoryCache::new(root.join(".kumiki-cache")));
    let services = || Services {
        cache: cache.clone(),
        fs: Arc::new(HashingFs),
        farm: Arc::new(LocalFarm::new()),
        validators: Vec::new(),
    };
    let on_disk = || BuildOptions {
        project_root: root.clone(),
        ..options()
    };

    let mut builder = GraphBuilder::init(on_disk(), fx.pipeline.clone(), services()).unwrap();
    build(&mut builder);
    builder.write_to_cache().unwrap();
    fx.pipeline.take_log();

    std::fs::write(root.join("src/a.js"), "export const a = 1;").unwrap();
    fx.pipeline.write("src/a.js", "export const a = 1;");

    let mut restored = GraphBuilder::init(on_disk(), fx.pipeline.clone(), services()).unwrap();
    let output = build(&mut restored);

    assert_eq!(fx.pipeline.log(), vec!["transform:src/a.js"]);
    assert_eq!(changed(&output), vec!["src/a.js"]);
}

#[test]
fn test_missing_snapshot_starts_fresh() {
    let fx = Fixture::new(APP);
    let mut builder = fx.builder(options());
    build(&mut builder);

    // graphs are cached but the snapshot was never written
    let keys = CacheKeys::new(&options(), fx.cache.as_ref());
    fx.cache
        .set(&keys.build_graph, &cache::encode("buildGraph", builder.graph()).unwrap())
        .unwrap();
    fx.cache
        .set(&keys.request_graph, &cache::encode("requestGraph", builder.requests()).unwrap())
        .unwrap();
    fx.pipeline.take_log();

    let mut fresh = fx.builder(options());
    assert_eq!(fresh.graph().node_count(), 2);

    build(&mut fresh);
    assert_eq!(fx.pipeline.count("transform:"), 3);
}

#[test]
fn test_unreadable_cache_starts_fresh() {
    let fx = Fixture::new(APP);
    let keys = CacheKeys::new(&options(), fx.cache.as_ref());
    fx.cache.set(&keys.build_graph, b"garbage").unwrap();
    fx.cache.set(&keys.request_graph, b"garbage").unwrap();

    let mut builder = fx.builder(options());
    let output = build(&mut builder);

    assert_eq!(output.changed_assets.len(), 3);
}

#[test]
fn test_disabled_cache_is_never_written() {
    let fx = Fixture::new(APP);
    let mut builder = fx.builder(BuildOptions {
        disable_cache: true,
        ..options()
    });
    build(&mut builder);

    builder.write_to_cache().unwrap();

    assert!(fx.cache.is_empty());
    assert!(!fx.fs.snapshot.load(Ordering::SeqCst));
}

#[test]
fn test_fs_event_rebuilds_only_affected() {
    let fx = Fixture::new(APP);
    let mut builder = fx.builder(options());
    build(&mut builder);
    fx.pipeline.take_log();

    fx.pipeline.write("src/a.js", "import src/b.js\nimport src/c.js");
    fx.pipeline.write("src/c.js", "export const c = 3;");
    let invalidated = builder.respond_to_fs_events(&[
        update("src/a.js"),
        FsEvent::new("src/c.js", FsEventKind::Create),
    ]);
    assert_eq!(invalidated.len(), 1);

    let output = build(&mut builder);

    assert_eq!(
        fx.pipeline.log(),
        vec!["transform:src/a.js", "dep:src/c.js", "transform:src/c.js"]
    );
    assert_eq!(changed(&output), vec!["src/a.js", "src/c.js"]);
}

#[test]
fn test_created_file_resolves_optional_dependency() {
    let fx = Fixture::new(&[("src/index.js", "import optional:src/late.js")]);
    let mut builder = fx.builder(options());

    let output = build(&mut builder);
    assert_eq!(changed(&output), vec!["src/index.js"]);

    fx.pipeline.write("src/late.js", "export {};");
    let invalidated = builder.respond_to_fs_events(&[FsEvent::new("src/late.js", FsEventKind::Create)]);
    assert_eq!(invalidated.len(), 1);

    let output = build(&mut builder);
    assert_eq!(changed(&output), vec!["src/late.js"]);
}

#[test]
fn test_failed_request_runs_again() {
    let fx = Fixture::new(&[("src/index.js", "import src/late.js")]);
    let mut builder = fx.builder(options());

    let err = builder.build(&Cancellation::new()).unwrap_err();
    assert!(err.to_string().contains("Cannot resolve 'src/late.js'"));

    fx.pipeline.write("src/late.js", "export {};");
    let output = build(&mut builder);

    assert_eq!(changed(&output), vec!["src/late.js"]);
}

#[test]
fn test_first_failure_stops_scheduling() {
    let fx = Fixture::new(APP);
    fx.pipeline.fail("src/a.js");
    fx.pipeline.fail("src/b.js");
    let mut builder = fx.builder(BuildOptions {
        max_concurrency: Some(1),
        ..options()
    });

    let failures = match builder.build(&Cancellation::new()) {
        Err(BuildError::Requests(failures)) => failures,
        Err(other) => panic!("unexpected error {other}"),
        Ok(_) => panic!("build should fail"),
    };

    assert_eq!(failures.len(), 1);
    assert_eq!(failures.first().kind, "asset_request");
    assert!(failures.to_string().contains("src/a.js"));
    // b was queued behind a and never submitted
    assert_eq!(fx.pipeline.count("transform:src/b.js"), 0);

    fx.pipeline.heal("src/a.js");
    fx.pipeline.heal("src/b.js");
    fx.pipeline.take_log();

    let output = build(&mut builder);

    let mut log = fx.pipeline.log();
    log.sort();
    assert_eq!(log, vec!["dep:src/b.js", "transform:src/a.js", "transform:src/b.js"]);
    assert_eq!(output.changed_assets.len(), 2);
}

#[test]
fn test_first_failure_is_by_submission_order() {
    let fx = Fixture::new(APP);
    fx.pipeline.fail("src/a.js");
    fx.pipeline.fail("src/b.js");
    // a is submitted first but finishes last
    fx.pipeline
        .slow_entries
        .lock()
        .unwrap()
        .insert("src/a.js".into(), Duration::from_millis(200));

    let mut builder = fx.builder(BuildOptions {
        entries: vec!["src/a.js".into(), "src/b.js".into()],
        max_concurrency: Some(2),
        ..options()
    });

    let failures = match builder.build(&Cancellation::new()) {
        Err(BuildError::Requests(failures)) => failures,
        Err(other) => panic!("unexpected error {other}"),
        Ok(_) => panic!("build should fail"),
    };

    // the slow one was already running and drained
    assert_eq!(failures.len(), 2);
    assert_eq!(failures.first().kind, "entry_request");
    assert!(failures.first().to_string().contains("src/a.js"));

    let messages: Vec<String> = failures.iter().map(ToString::to_string).collect();
    assert!(messages[0].contains("src/a.js"));
    assert!(messages[1].contains("src/b.js"));
}

#[test]
fn test_panicking_request_fails_the_build() {
    let fx = Fixture::new(APP);
    fx.pipeline
        .panicking
        .lock()
        .unwrap()
        .insert("src/b.js".into());
    let mut builder = fx.builder(options());

    let err = builder.build(&Cancellation::new()).unwrap_err();

    assert!(err.to_string().contains("transformer crashed on src/b.js"));

    fx.pipeline.panicking.lock().unwrap().clear();
    build(&mut builder);
    assert_eq!(builder.graph().assets().count(), 3);
}

#[test]
fn test_bounded_concurrency() {
    let fx = Fixture::new(&[]);
    let imports: Vec<String> = (0..8).map(|i| format!("import src/{i}.js")).collect();
    fx.pipeline.write("src/index.js", &imports.join("\n"));
    for i in 0..8 {
        fx.pipeline.write(&format!("src/{i}.js"), "export {};");
    }
    *fx.pipeline.delay.lock().unwrap() = Duration::from_millis(10);

    let mut builder = fx.builder(BuildOptions {
        max_concurrency: Some(2),
        ..options()
    });
    build(&mut builder);

    let max = fx.pipeline.max_in_flight.load(Ordering::SeqCst);
    assert!((1..=2).contains(&max), "{max} transforms ran at once");
    assert_eq!(fx.pipeline.count("transform:"), 9);
}

#[test]
fn test_removed_import_prunes_and_untracks() {
    let fx = Fixture::new(APP);
    let mut builder = fx.builder(options());
    build(&mut builder);
    assert_eq!(count_requests(&builder, "asset_request"), 3);

    fx.pipeline.write("src/index.js", "import src/a.js");
    fx.pipeline.write("src/a.js", "export const a = 1;");
    builder.respond_to_fs_events(&[update("src/index.js"), update("src/a.js")]);
    build(&mut builder);

    let assets: BTreeSet<&str> = builder.graph().assets().map(|asset| asset.id.as_str()).collect();
    assert_eq!(assets, BTreeSet::from(["src/a.js", "src/index.js"]));
    assert_eq!(count_requests(&builder, "asset_request"), 2);
    assert_eq!(count_requests(&builder, "dep_path_request"), 2);
    assert!(
        !builder
            .requests()
            .graph()
            .has_node(&RequestKey::File("/project/src/b.js".into()))
    );
    assert!(
        builder
            .requests()
            .graph()
            .has_node(&RequestKey::File("/project/src/a.js".into()))
    );
}

#[test]
fn test_deferred_environment_is_built_when_reactivated() {
    let fx = Fixture::new(&[
        ("src/index.js", "import worker:src/w.js"),
        ("src/w.js", "self.onmessage = null;"),
    ]);
    let mut builder = fx.builder(BuildOptions {
        contexts: Some(BTreeSet::from([EnvironmentContext::Browser])),
        ..options()
    });

    let output = build(&mut builder);

    assert_eq!(changed(&output), vec!["src/index.js"]);
    assert_eq!(fx.pipeline.count("dep:worker:src/w.js"), 1);
    assert_eq!(fx.pipeline.count("transform:src/w.js"), 0);

    builder.set_environment_filter(None);
    let output = build(&mut builder);

    assert_eq!(changed(&output), vec!["src/w.js"]);
    assert_eq!(fx.pipeline.count("dep:"), 2);
}

#[test]
fn test_config_change_reruns_consumers() {
    let fx = Fixture::new(APP);
    let mut builder = fx.builder(options());
    build(&mut builder);
    fx.pipeline.take_log();

    *fx.pipeline.config.lock().unwrap() = Config::from_json(r#"{"settings": {"minify": true}}"#).unwrap();
    let invalidated = builder.respond_to_fs_events(&[update(".kumikirc")]);

    // the configuration, every dependency and every asset request
    assert_eq!(invalidated.len(), 8);

    build(&mut builder);

    assert_eq!(fx.pipeline.count("config"), 1);
    assert_eq!(fx.pipeline.count("dep:"), 4);
    assert_eq!(fx.pipeline.count("transform:"), 3);
    assert_eq!(count_requests(&builder, "asset_request"), 3);
    assert_eq!(
        builder.config().map(|config| config.settings["minify"].clone()),
        Some(serde_json::Value::Bool(true))
    );
}

#[test]
fn test_cancelled_before_start() {
    let fx = Fixture::new(APP);
    let mut builder = fx.builder(options());
    let cancel = Cancellation::new();
    cancel.cancel();

    let err = builder.build(&cancel).unwrap_err();

    assert!(matches!(err, BuildError::Cancelled));
    assert!(fx.pipeline.log().is_empty());
}

#[test]
fn test_cancelled_mid_build_resumes() {
    let fx = Fixture::new(APP);
    *fx.pipeline.cancel_on.lock().unwrap() = Some("src/a.js".into());
    let mut builder = fx.builder(options());

    let err = builder.build(&Cancellation::new()).unwrap_err();
    assert!(matches!(err, BuildError::Cancelled));

    *fx.pipeline.cancel_on.lock().unwrap() = None;
    let output = build(&mut builder);

    assert!(output.changed_assets.contains_key("src/a.js"));
    assert_eq!(builder.graph().assets().count(), 3);
}

#[test]
fn test_validation_splits_project_and_asset_validators() {
    let mut fx = Fixture::new(APP);
    fx.farm_validators = vec![Arc::new(NoTodo)];
    fx.project_validators = vec![Arc::new(FileCount)];
    *fx.pipeline.config.lock().unwrap() =
        Config::from_json(r#"{"validators": {"**/*.js": ["no-todo", "file-count"]}}"#).unwrap();

    let mut builder = fx.builder(options());
    assert!(builder.validate().diagnostics.is_empty());

    build(&mut builder);
    let report = builder.validate();

    assert!(report.errors.is_empty());
    assert!(!report.has_errors());

    let per_asset = report
        .diagnostics
        .iter()
        .filter(|diagnostic| diagnostic.origin == "no-todo")
        .count();
    let project: Vec<_> = report
        .diagnostics
        .iter()
        .filter(|diagnostic| diagnostic.origin == "file-count")
        .collect();

    assert_eq!(per_asset, 3);
    assert_eq!(project.len(), 1);
    assert_eq!(project[0].message, "3 files");

    // everything was validated already
    assert!(builder.validate().diagnostics.is_empty());
}

#[test]
fn test_unknown_worker_function_is_reported() {
    let fx = Fixture::new(APP);
    *fx.pipeline.config.lock().unwrap() =
        Config::from_json(r#"{"validators": {"**/*.js": ["no-todo"]}}"#).unwrap();

    let services = Services {
        farm: Arc::new(LocalFarm::new()),
        ..fx.services()
    };
    let mut builder = GraphBuilder::init(options(), fx.pipeline.clone(), services).unwrap();
    build(&mut builder);

    let report = builder.validate();

    assert_eq!(report.errors.len(), 3);
    assert!(report.has_errors());
}

#[test]
fn test_dump_graphs() {
    let dir = tempfile::tempdir().unwrap();
    let dump = Utf8PathBuf::try_from(dir.path().join("graphs")).unwrap();

    let fx = Fixture::new(APP);
    let mut builder = fx.builder(BuildOptions {
        dump_graphs: Some(dump.clone()),
        ..options()
    });
    build(&mut builder);

    let build_graph = std::fs::read_to_string(dump.join("build_graph.mmd")).unwrap();
    let request_graph = std::fs::read_to_string(dump.join("request_graph.mmd")).unwrap();

    assert!(build_graph.starts_with("graph LR"));
    assert!(build_graph.contains("asset: src/a.js"));
    assert!(request_graph.contains("asset_request"));
}
