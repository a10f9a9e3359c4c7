//! Live rebuilds driven by filesystem notifications.
//!
//! The project root is watched recursively. Bursts of notifications are
//! debounced into a single batch, translated into [`FsEvent`]s and handed to
//! the builder, which invalidates the requests subscribed to those paths. If
//! anything was invalidated the graph is rebuilt and, on success, persisted.

use std::sync::mpsc::{self, RecvTimeoutError};
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use notify::event::ModifyKind;
use notify::{EventKind, RecursiveMode};
use notify_debouncer_full::{DebouncedEvent, new_debouncer};

use crate::builder::GraphBuilder;
use crate::error::{BuildError, WatchError};
use crate::request::{Cancellation, FsEvent, FsEventKind};

const DEBOUNCE: Duration = Duration::from_millis(250);
/// How often the loop wakes up to check for cancellation.
const POLL: Duration = Duration::from_millis(100);

/// Rebuilds on every relevant change under the project root until `cancel`
/// is triggered.
pub fn watch(builder: &mut GraphBuilder, cancel: &Cancellation) -> Result<(), BuildError> {
    let root = builder.options().project_root.clone();
    let ignore = builder.watcher_ignore();

    let (tx, rx) = mpsc::channel();
    let mut debouncer = new_debouncer(DEBOUNCE, None, tx).map_err(WatchError::from)?;
    debouncer
        .watch(&root, RecursiveMode::Recursive)
        .map_err(WatchError::from)?;

    tracing::info!("Watching {root} for changes...");

    while !cancel.is_cancelled() {
        let batch = match rx.recv_timeout(POLL) {
            Ok(Ok(batch)) => batch,
            Ok(Err(errors)) => {
                for e in errors {
                    tracing::error!("Watch error: {e}");
                }
                continue;
            }
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => return Err(WatchError::Disconnected.into()),
        };

        let events = to_fs_events(&batch, &ignore);
        if events.is_empty() {
            continue;
        }

        let invalidated = builder.respond_to_fs_events(&events);
        if invalidated.is_empty() {
            tracing::debug!("{} changes affect no request", events.len());
            continue;
        }

        tracing::info!(
            "{} changes invalidated {} requests, rebuilding...",
            events.len(),
            invalidated.len()
        );

        match builder.build(cancel) {
            Ok(output) => {
                tracing::info!("Rebuilt {} assets", output.changed_assets.len());
                builder.validate();

                if let Err(e) = builder.write_to_cache() {
                    tracing::warn!("{e}");
                }
            }
            Err(BuildError::Cancelled) => break,
            Err(e) => tracing::error!("Rebuild failed:\n{e}"),
        }
    }

    tracing::info!("Stopped watching {root}");
    Ok(())
}

/// Translates a debounced batch into filesystem events, skipping ignored
/// paths and duplicates.
fn to_fs_events(batch: &[DebouncedEvent], ignore: &[Utf8PathBuf]) -> Vec<FsEvent> {
    let mut events = Vec::new();

    for de in batch {
        for path in &de.event.paths {
            let Some(path) = Utf8Path::from_path(path) else {
                tracing::warn!("Ignoring non UTF-8 path {}", path.display());
                continue;
            };

            if ignore.iter().any(|ignored| path.starts_with(ignored)) {
                continue;
            }

            let Some(kind) = event_kind(&de.event.kind, path) else {
                continue;
            };

            let event = FsEvent::new(path, kind);
            if !events.contains(&event) {
                events.push(event);
            }
        }
    }

    events
}

fn event_kind(kind: &EventKind, path: &Utf8Path) -> Option<FsEventKind> {
    match kind {
        EventKind::Create(_) => Some(FsEventKind::Create),
        // both ends of a rename arrive as separate paths
        EventKind::Modify(ModifyKind::Name(_)) if path.exists() => Some(FsEventKind::Create),
        EventKind::Modify(ModifyKind::Name(_)) => Some(FsEventKind::Delete),
        EventKind::Modify(ModifyKind::Metadata(_)) => None,
        EventKind::Modify(_) => Some(FsEventKind::Update),
        EventKind::Remove(_) => Some(FsEventKind::Delete),
        _ => None,
    }
}
