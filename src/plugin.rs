//! The interfaces through which the orchestrator reaches the parts of a
//! bundler it does not implement itself.

use std::collections::BTreeMap;

use camino::{Utf8Path, Utf8PathBuf};
use glob::Pattern;
use serde::{Deserialize, Serialize};

use crate::core::Hash32;
use crate::request::RequestContext;
use crate::types::{Asset, AssetGroup, Dependency, Entry, Target};

/// Bundler configuration, produced by [`Pipeline::load_config`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    /// Validator names keyed by the file glob they apply to.
    pub validators: BTreeMap<String, Vec<String>>,
    /// Anything else the pipeline wants to keep in its configuration.
    pub settings: serde_json::Value,
}

impl Config {
    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    /// Names of every validator configured for `path`, in configuration
    /// order and without duplicates.
    pub fn validator_names(&self, path: &Utf8Path) -> Vec<String> {
        let mut names = Vec::new();

        for (glob, validators) in &self.validators {
            let pattern = match Pattern::new(glob) {
                Ok(pattern) => pattern,
                Err(e) => {
                    tracing::warn!("Ignoring invalid validator glob '{glob}': {e}");
                    continue;
                }
            };

            if !pattern.matches(path.as_str()) {
                continue;
            }

            for name in validators {
                if !names.contains(name) {
                    names.push(name.clone());
                }
            }
        }

        names
    }

    /// Changes whenever the configuration does.
    pub fn config_ref(&self) -> Hash32 {
        Hash32::hash(serde_json::to_vec(self).unwrap_or_default())
    }
}

/// The bundler stages driven by the orchestrator.
///
/// Implementations receive the [`RequestContext`] of the request they run
/// in and must declare every file they read through it, otherwise changes to
/// those files will not trigger a rebuild.
///
/// Entry specifiers are passed exactly as configured in
/// [`BuildOptions::entries`](crate::BuildOptions::entries), usually relative
/// to the project root. Declared paths may be relative to the project root or
/// absolute. Either way they are stored as absolute paths below the
/// canonicalized root, which is the form snapshot and watcher events use.
pub trait Pipeline: Send + Sync {
    fn load_config(&self, ctx: &mut RequestContext) -> anyhow::Result<Config>;

    /// Expands an entry specifier (a file, directory or glob) into files.
    fn resolve_entry(&self, specifier: &Utf8Path, ctx: &mut RequestContext) -> anyhow::Result<Vec<Entry>>;

    fn resolve_targets(&self, entry: &Entry, ctx: &mut RequestContext) -> anyhow::Result<Vec<Target>>;

    /// `None` means the dependency is excluded from the build.
    fn resolve_dependency(
        &self,
        dependency: &Dependency,
        config: &Config,
        ctx: &mut RequestContext,
    ) -> anyhow::Result<Option<AssetGroup>>;

    fn transform(
        &self,
        group: &AssetGroup,
        config: &Config,
        ctx: &mut RequestContext,
    ) -> anyhow::Result<Vec<Asset>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ValidatorScope {
    /// Looks at one asset at a time, runs on the worker farm.
    Asset,
    /// Looks at every asset at once, runs in-process.
    Project,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Severity {
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub origin: String,
    pub severity: Severity,
    pub message: String,
    pub file_path: Option<Utf8PathBuf>,
}

impl Diagnostic {
    pub fn error(origin: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            origin: origin.into(),
            severity: Severity::Error,
            message: message.into(),
            file_path: None,
        }
    }

    pub fn warning(origin: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            origin: origin.into(),
            severity: Severity::Warning,
            message: message.into(),
            file_path: None,
        }
    }

    pub fn at(mut self, path: impl Into<Utf8PathBuf>) -> Self {
        self.file_path = Some(path.into());
        self
    }
}

pub trait Validator: Send + Sync {
    fn name(&self) -> &str;

    fn scope(&self) -> ValidatorScope;

    fn validate(&self, groups: &[AssetGroup], config: &Config) -> anyhow::Result<Vec<Diagnostic>>;
}
