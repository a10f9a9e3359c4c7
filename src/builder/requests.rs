//! The closed set of requests the orchestrator knows how to run.

use std::sync::Arc;

use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};

use crate::core::Hash32;
use crate::plugin::{Config, Pipeline};
use crate::request::{Request, RequestContext, RequestId};
use crate::types::{Asset, AssetGroup, Dependency, Entry, Target};

pub(crate) const CONFIG_REQUEST: &str = "config_request";
pub(crate) const ENTRY_REQUEST: &str = "entry_request";
pub(crate) const TARGET_REQUEST: &str = "target_request";
pub(crate) const DEP_PATH_REQUEST: &str = "dep_path_request";
pub(crate) const ASSET_REQUEST: &str = "asset_request";

/// The loaded configuration together with its fingerprint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigResult {
    pub config: Config,
    pub config_ref: Hash32,
}

impl ConfigResult {
    pub(crate) fn request_id() -> RequestId {
        RequestId::new(CONFIG_REQUEST, &())
    }
}

/// Everything a request can produce. Persisted in the request graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RequestResult {
    Config(ConfigResult),
    Entries(Vec<Entry>),
    Targets(Vec<Target>),
    Dependency(Option<AssetGroup>),
    Assets(Vec<Asset>),
}

impl RequestResult {
    pub fn name(&self) -> &'static str {
        match self {
            RequestResult::Config(_) => "config",
            RequestResult::Entries(_) => "entries",
            RequestResult::Targets(_) => "targets",
            RequestResult::Dependency(_) => "dependency",
            RequestResult::Assets(_) => "assets",
        }
    }

    pub(crate) fn into_config(self) -> Option<ConfigResult> {
        match self {
            RequestResult::Config(config) => Some(config),
            _ => None,
        }
    }
}

pub(crate) enum RequestInput {
    Config,
    Entry(Utf8PathBuf),
    Target(Entry),
    Dependency {
        dependency: Dependency,
        config: Arc<ConfigResult>,
    },
    Asset {
        group: AssetGroup,
        config: Arc<ConfigResult>,
    },
}

/// A request input bound to the pipeline that executes it.
pub(crate) struct PipelineRequest {
    pipeline: Arc<dyn Pipeline>,
    input: RequestInput,
}

impl PipelineRequest {
    pub fn new(pipeline: Arc<dyn Pipeline>, input: RequestInput) -> Self {
        Self { pipeline, input }
    }

    pub fn label(&self) -> String {
        match &self.input {
            RequestInput::Config => "configuration".into(),
            RequestInput::Entry(specifier) => specifier.to_string(),
            RequestInput::Target(entry) => entry.file_path.to_string(),
            RequestInput::Dependency { dependency, .. } => dependency.specifier.clone(),
            RequestInput::Asset { group, .. } => group.file_path.to_string(),
        }
    }
}

impl Request<RequestResult> for PipelineRequest {
    fn id(&self) -> RequestId {
        match &self.input {
            RequestInput::Config => ConfigResult::request_id(),
            RequestInput::Entry(specifier) => RequestId::new(ENTRY_REQUEST, specifier),
            RequestInput::Target(entry) => RequestId::new(TARGET_REQUEST, entry),
            RequestInput::Dependency { dependency, .. } => RequestId::new(DEP_PATH_REQUEST, dependency),
            // a new configuration means new asset results
            RequestInput::Asset { group, config } => {
                RequestId::new(ASSET_REQUEST, &(group, config.config_ref))
            }
        }
    }

    fn kind(&self) -> &'static str {
        match &self.input {
            RequestInput::Config => CONFIG_REQUEST,
            RequestInput::Entry(_) => ENTRY_REQUEST,
            RequestInput::Target(_) => TARGET_REQUEST,
            RequestInput::Dependency { .. } => DEP_PATH_REQUEST,
            RequestInput::Asset { .. } => ASSET_REQUEST,
        }
    }

    fn run(&self, ctx: &mut RequestContext) -> anyhow::Result<RequestResult> {
        let pipeline = self.pipeline.as_ref();

        match &self.input {
            RequestInput::Config => {
                let config = pipeline.load_config(ctx)?;
                let config_ref = config.config_ref();
                Ok(RequestResult::Config(ConfigResult { config, config_ref }))
            }
            RequestInput::Entry(specifier) => {
                let entries = pipeline.resolve_entry(specifier, ctx)?;
                Ok(RequestResult::Entries(entries))
            }
            RequestInput::Target(entry) => {
                let targets = pipeline.resolve_targets(entry, ctx)?;
                Ok(RequestResult::Targets(targets))
            }
            RequestInput::Dependency { dependency, config } => {
                ctx.depends_on(ConfigResult::request_id());
                let group = pipeline.resolve_dependency(dependency, &config.config, ctx)?;
                Ok(RequestResult::Dependency(group))
            }
            RequestInput::Asset { group, config } => {
                ctx.depends_on(ConfigResult::request_id());
                let assets = pipeline.transform(group, &config.config, ctx)?;
                Ok(RequestResult::Assets(assets))
            }
        }
    }
}
