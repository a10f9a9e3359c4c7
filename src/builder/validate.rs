use std::collections::HashSet;
use std::time::Instant;

use rayon::iter::{IntoParallelRefIterator, ParallelIterator};

use crate::build_graph::BuildNodeKind;
use crate::builder::GraphBuilder;
use crate::core::as_overhead;
use crate::plugin::{Diagnostic, Severity, ValidatorScope};
use crate::types::AssetGroup;
use crate::workers::{ValidationRequest, WorkerMessage};

/// Findings of one validation pass. Validation never fails a build; failing
/// validators end up in `errors`.
#[derive(Debug, Default)]
pub struct ValidationReport {
    pub diagnostics: Vec<Diagnostic>,
    pub errors: Vec<anyhow::Error>,
}

impl ValidationReport {
    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
            || self
                .diagnostics
                .iter()
                .any(|diagnostic| diagnostic.severity == Severity::Error)
    }

    fn extend(&mut self, other: ValidationReport) {
        self.diagnostics.extend(other.diagnostics);
        self.errors.extend(other.errors);
    }
}

impl GraphBuilder {
    /// Runs the configured validators over every asset group transformed
    /// since the last call.
    ///
    /// Project-wide validators registered with the builder run once on this
    /// thread, while every other configured validator is sent to the worker
    /// farm one asset group at a time. Both halves run concurrently.
    pub fn validate(&mut self) -> ValidationReport {
        let s = Instant::now();

        // a group transformed by several builds is validated once
        let mut seen = HashSet::new();
        let groups: Vec<AssetGroup> = std::mem::take(&mut self.asset_requests)
            .into_iter()
            .filter(|group| self.is_in_graph(group) && seen.insert(group.clone()))
            .collect();

        let Some(config) = self.config.clone() else {
            return ValidationReport::default();
        };

        let project: Vec<_> = self
            .services
            .validators
            .iter()
            .filter(|validator| validator.scope() == ValidatorScope::Project)
            .cloned()
            .collect();

        let is_project = |name: &String| project.iter().any(|validator| validator.name() == name.as_str());

        let dispatched: Vec<ValidationRequest> = groups
            .iter()
            .filter_map(|group| {
                let validators: Vec<String> = config
                    .config
                    .validator_names(&group.file_path)
                    .into_iter()
                    .filter(|name| !is_project(name))
                    .collect();

                (!validators.is_empty()).then(|| ValidationRequest {
                    group: group.clone(),
                    validators,
                    config: config.config.clone(),
                })
            })
            .collect();

        if dispatched.is_empty() && project.is_empty() {
            return ValidationReport::default();
        }

        let handle = &self.validate_handle;

        let (remote, local) = rayon::join(
            || {
                let replies: Vec<_> = dispatched
                    .par_iter()
                    .map(|request| handle.call(&WorkerMessage::Validate(request.clone())))
                    .collect();

                let mut report = ValidationReport::default();
                for reply in replies {
                    match reply {
                        Ok(reply) => report.diagnostics.extend(reply.diagnostics),
                        Err(e) => report.errors.push(e.into()),
                    }
                }
                report
            },
            || {
                let mut report = ValidationReport::default();

                for validator in &project {
                    let targeted: Vec<AssetGroup> = groups
                        .iter()
                        .filter(|group| {
                            config
                                .config
                                .validator_names(&group.file_path)
                                .iter()
                                .any(|name| name == validator.name())
                        })
                        .cloned()
                        .collect();

                    if targeted.is_empty() {
                        continue;
                    }

                    match validator.validate(&targeted, &config.config) {
                        Ok(diagnostics) => report.diagnostics.extend(diagnostics),
                        Err(e) => report
                            .errors
                            .push(e.context(format!("Validator '{}' failed", validator.name()))),
                    }
                }

                report
            },
        );

        let mut report = remote;
        report.extend(local);

        for diagnostic in &report.diagnostics {
            let file = diagnostic
                .file_path
                .as_ref()
                .map(|path| path.as_str())
                .unwrap_or("<project>");

            match diagnostic.severity {
                Severity::Warning => tracing::warn!("[{}] {file}: {}", diagnostic.origin, diagnostic.message),
                Severity::Error => tracing::error!("[{}] {file}: {}", diagnostic.origin, diagnostic.message),
            }
        }

        for error in &report.errors {
            tracing::error!("{error:#}");
        }

        tracing::info!(
            "Validated {} asset groups, {} diagnostics {}",
            groups.len(),
            report.diagnostics.len(),
            as_overhead(s)
        );

        report
    }

    fn is_in_graph(&self, group: &AssetGroup) -> bool {
        self.graph
            .get(&BuildNodeKind::AssetGroup(group.clone()).id())
            .is_some()
    }
}
