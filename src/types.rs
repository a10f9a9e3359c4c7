//! Build-domain values carried by build graph nodes and request results.

use std::collections::BTreeSet;

use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};

use crate::core::Hash32;

/// Where the produced code is going to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EnvironmentContext {
    #[default]
    Browser,
    WebWorker,
    ServiceWorker,
    Node,
    ElectronMain,
    ElectronRenderer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Global,
    Commonjs,
    Esmodule,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Environment {
    pub context: EnvironmentContext,
    pub output_format: OutputFormat,
    /// Engine constraints as written by the user, e.g. `> 0.25%`.
    pub engines: Option<String>,
    pub is_library: bool,
    pub include_node_modules: bool,
}

impl Environment {
    pub fn new(context: EnvironmentContext) -> Self {
        Self {
            context,
            ..Default::default()
        }
    }

    /// Whether this environment is part of the current build. No filter means
    /// every environment is.
    pub fn is_compatible(&self, filter: Option<&BTreeSet<EnvironmentContext>>) -> bool {
        filter.is_none_or(|contexts| contexts.contains(&self.context))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Entry {
    pub file_path: Utf8PathBuf,
    /// Directory of the package the entry belongs to.
    pub package_path: Utf8PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Target {
    pub name: String,
    pub dist_dir: Utf8PathBuf,
    pub dist_entry: Option<String>,
    pub public_url: String,
    pub env: Environment,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Dependency {
    pub specifier: String,
    /// File the specifier is resolved relative to.
    pub resolve_from: Option<Utf8PathBuf>,
    pub env: Environment,
    pub target: Option<Target>,
    pub pipeline: Option<String>,
    pub is_entry: bool,
    pub is_optional: bool,
    pub is_async: bool,
}

impl Dependency {
    pub fn new(specifier: impl Into<String>, env: Environment) -> Self {
        Self {
            specifier: specifier.into(),
            resolve_from: None,
            env,
            target: None,
            pipeline: None,
            is_entry: false,
            is_optional: false,
            is_async: false,
        }
    }

    /// The entry dependency a target starts from.
    pub fn entry(entry: &Entry, target: &Target) -> Self {
        Self {
            specifier: entry.file_path.to_string(),
            resolve_from: None,
            env: target.env.clone(),
            target: Some(target.clone()),
            pipeline: None,
            is_entry: true,
            is_optional: false,
            is_async: false,
        }
    }

    pub fn id(&self) -> Hash32 {
        Hash32::of("dependency", self)
    }
}

/// A file to transform. The same file under a different environment or
/// pipeline is a different group.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssetGroup {
    pub file_path: Utf8PathBuf,
    pub env: Environment,
    pub pipeline: Option<String>,
    pub is_source: bool,
}

impl AssetGroup {
    pub fn new(file_path: impl Into<Utf8PathBuf>, env: Environment) -> Self {
        Self {
            file_path: file_path.into(),
            env,
            pipeline: None,
            is_source: true,
        }
    }

    pub fn id(&self) -> Hash32 {
        Hash32::of("asset_group", self)
    }
}

/// A compiled unit produced by transforming an asset group.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Asset {
    pub id: String,
    pub file_path: Utf8PathBuf,
    pub asset_type: String,
    pub env: Environment,
    /// Reference to the generated code in the cache.
    pub content_key: Hash32,
    pub dependencies: Vec<Dependency>,
}
