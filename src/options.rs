use std::collections::BTreeSet;

use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};

use crate::core::Hash32;
use crate::types::{AssetGroup, EnvironmentContext};

/// Every option that affects a build.
///
/// Options that change the output (see [`cache_key`](Self::cache_key)) also
/// change where the persisted graphs are looked up, so switching them starts
/// from an empty cache instead of reusing incompatible results.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BuildOptions {
    pub name: String,
    pub entries: Vec<Utf8PathBuf>,
    pub asset_groups: Vec<AssetGroup>,
    pub project_root: Utf8PathBuf,
    /// Relative paths are resolved against `project_root`.
    pub cache_dir: Utf8PathBuf,
    pub dist_dir: Option<Utf8PathBuf>,
    pub public_url: String,
    pub minify: bool,
    pub scope_hoist: bool,
    pub hot: bool,
    pub disable_cache: bool,
    /// Upper bound on requests running at once; defaults to the size of the
    /// thread pool.
    pub max_concurrency: Option<usize>,
    /// Environments to build. `None` builds all of them.
    pub contexts: Option<BTreeSet<EnvironmentContext>>,
    /// Directory receiving Mermaid dumps of both graphs after each build.
    pub dump_graphs: Option<Utf8PathBuf>,
}

impl Default for BuildOptions {
    fn default() -> Self {
        Self {
            name: "default".into(),
            entries: Vec::new(),
            asset_groups: Vec::new(),
            project_root: ".".into(),
            cache_dir: ".kumiki-cache".into(),
            dist_dir: None,
            public_url: "/".into(),
            minify: false,
            scope_hoist: false,
            hot: false,
            disable_cache: false,
            max_concurrency: None,
            contexts: None,
            dump_graphs: None,
        }
    }
}

impl BuildOptions {
    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn concurrency(&self) -> usize {
        self.max_concurrency
            .filter(|&n| n > 0)
            .unwrap_or_else(rayon::current_num_threads)
    }

    pub fn cache_dir(&self) -> Utf8PathBuf {
        self.project_root.join(&self.cache_dir)
    }

    /// Hash of everything that invalidates the persisted graphs as a whole.
    pub fn cache_key(&self) -> Hash32 {
        let output = (
            self.hot,
            &self.public_url,
            &self.dist_dir,
            self.minify,
            self.scope_hoist,
        );

        Hash32::of("cache_key", &(crate::VERSION, &self.name, output, &self.entries))
    }

    /// Paths never reported as changes: the cache itself and version control
    /// metadata.
    pub fn watcher_ignore(&self) -> Vec<Utf8PathBuf> {
        vec![
            self.cache_dir(),
            self.project_root.join(".git"),
            self.project_root.join(".hg"),
        ]
    }
}
