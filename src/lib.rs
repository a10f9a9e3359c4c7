//! Incremental build orchestration for a module bundler.
//!
//! `kumiki` keeps two graphs. The [`BuildGraph`] describes the project as
//! the bundler understands it: entries, targets, dependencies, asset groups
//! and assets. The [`RequestTracker`] remembers the result of every unit of
//! work that produced a part of it, together with the files and other
//! requests that result was derived from.
//!
//! A [`GraphBuilder`] walks the build graph, runs the requests whose results
//! are missing or stale on a bounded thread pool, and applies their results
//! back onto the graph. Both graphs are persisted with a snapshot of the
//! project, so a restarted process only redoes the work affected by changes
//! made in between.
//!
//! The bundler stages themselves live behind the [`Pipeline`] trait:
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use kumiki::{BuildOptions, Cancellation, GraphBuilder, Pipeline, Services};
//!
//! fn run(pipeline: Arc<dyn Pipeline>) -> Result<(), Box<dyn std::error::Error>> {
//!     let options = BuildOptions {
//!         entries: vec!["src/index.js".into()],
//!         ..Default::default()
//!     };
//!
//!     let services = Services::local(&options, Vec::new())?;
//!     let mut builder = GraphBuilder::init(options, pipeline, services)?;
//!
//!     let output = builder.build(&Cancellation::new())?;
//!     println!("{} assets changed", output.changed_assets.len());
//!
//!     builder.validate();
//!     builder.write_to_cache()?;
//!     Ok(())
//! }
//! ```
//!
//! Long running work should poll
//! [`RequestContext::check_cancelled`](crate::RequestContext::check_cancelled)
//! so that a cancelled build stops early.

#![forbid(unsafe_code)]

mod build_graph;
mod builder;
mod cache;
mod core;
pub mod diagnostics;
mod error;
pub mod graph;
mod options;
mod plugin;
pub mod request;
mod snapshot;
mod types;
mod utils;
#[cfg(feature = "live")]
mod watch;
mod workers;

pub use crate::build_graph::{BuildEdge, BuildGraph, BuildNode, BuildNodeKind, NodeId, NodeState};
pub use crate::builder::{BuildOutput, BuildStats, GraphBuilder, RequestResult, Services, ValidationReport};
pub use crate::cache::{Cache, FsCache, MemoryCache, decode, encode};
pub use crate::core::Hash32;
pub use crate::error::*;
pub use crate::options::BuildOptions;
pub use crate::plugin::{Config, Diagnostic, Pipeline, Severity, Validator, ValidatorScope};
pub use crate::request::{
    Cancellation, FsEvent, FsEventKind, Invalidations, Request, RequestContext, RequestId, RequestTracker,
};
pub use crate::snapshot::{HashingFs, InputFs, Snapshot, diff_snapshots};
pub use crate::types::*;
#[cfg(feature = "live")]
pub use crate::watch::watch;
pub use crate::workers::{
    LocalFarm, RUN_VALIDATE, ReverseHandle, ValidationRequest, WorkerFarm, WorkerHandle, WorkerMessage,
    WorkerReply, validation_worker,
};

/// Version of this crate, part of every cache key so that state written by
/// another version is never restored.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(feature = "logging")]
static TRACING_INIT: std::sync::Once = std::sync::Once::new();

/// Installs a global subscriber printing log lines above the progress bars.
///
/// Filtered through `RUST_LOG`, defaulting to `info`. Does nothing if a
/// subscriber is already installed.
#[cfg(feature = "logging")]
pub fn init_logging() {
    TRACING_INIT.call_once(|| {
        use tracing_indicatif::IndicatifLayer;
        use tracing_subscriber::{EnvFilter, fmt, prelude::*};

        let indicatif_layer = IndicatifLayer::new();
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

        _ = tracing_subscriber::registry()
            .with(fmt::layer().with_writer(indicatif_layer.get_stderr_writer()))
            .with(indicatif_layer)
            .with(filter)
            .try_init();
    });
}
