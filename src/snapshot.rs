//! Filesystem checkpoints used to find out what changed between two runs.

use std::collections::BTreeMap;
use std::fs;

use camino::{Utf8Path, Utf8PathBuf};
use rayon::iter::{IntoParallelIterator, ParallelIterator};
use serde::{Deserialize, Serialize};

use crate::core::Hash32;
use crate::error::SnapshotError;
use crate::request::{FsEvent, FsEventKind};

pub trait InputFs: Send + Sync {
    /// Changes under `root` since the snapshot stored at `snapshot` was
    /// written. Paths starting with an entry of `ignore` are not reported.
    fn events_since(
        &self,
        root: &Utf8Path,
        snapshot: &Utf8Path,
        ignore: &[Utf8PathBuf],
    ) -> Result<Vec<FsEvent>, SnapshotError>;

    fn write_snapshot(
        &self,
        root: &Utf8Path,
        snapshot: &Utf8Path,
        ignore: &[Utf8PathBuf],
    ) -> Result<(), SnapshotError>;
}

/// Content hash of every file under a root.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub files: BTreeMap<Utf8PathBuf, Hash32>,
}

impl Snapshot {
    pub fn capture(root: &Utf8Path, ignore: &[Utf8PathBuf]) -> Result<Self, SnapshotError> {
        let mut paths = Vec::new();
        walk(root, ignore, &mut paths)?;

        let files = paths
            .into_par_iter()
            .map(|path| Hash32::hash_file(&path).map(|hash| (path, hash)))
            .collect::<Result<_, std::io::Error>>()?;

        Ok(Self { files })
    }

    pub fn load(path: &Utf8Path) -> Result<Self, SnapshotError> {
        let bytes = match fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(SnapshotError::Missing(path.to_owned()));
            }
            Err(e) => return Err(e.into()),
        };

        ciborium::from_reader(bytes.as_slice())
            .map_err(|e| SnapshotError::Decode(path.to_owned(), e.to_string()))
    }

    pub fn save(&self, path: &Utf8Path) -> Result<(), SnapshotError> {
        let mut buffer = Vec::new();
        ciborium::into_writer(self, &mut buffer).map_err(|e| SnapshotError::Encode(e.to_string()))?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        fs::write(path, buffer)?;
        Ok(())
    }
}

fn walk(dir: &Utf8Path, ignore: &[Utf8PathBuf], out: &mut Vec<Utf8PathBuf>) -> Result<(), SnapshotError> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = match Utf8PathBuf::try_from(entry.path()) {
            Ok(path) => path,
            Err(e) => {
                tracing::warn!("Skipping non UTF-8 path {:?}", e.into_path_buf());
                continue;
            }
        };

        if ignore.iter().any(|prefix| path.starts_with(prefix)) {
            continue;
        }

        let kind = entry.file_type()?;
        if kind.is_dir() {
            walk(&path, ignore, out)?;
        } else if kind.is_file() {
            out.push(path);
        }
    }

    Ok(())
}

/// Events turning `old` into `new`, ordered by path.
pub fn diff_snapshots(old: &Snapshot, new: &Snapshot) -> Vec<FsEvent> {
    let mut events = Vec::new();

    for (path, hash) in &new.files {
        match old.files.get(path) {
            None => events.push(FsEvent::new(path.clone(), FsEventKind::Create)),
            Some(prev) if prev != hash => events.push(FsEvent::new(path.clone(), FsEventKind::Update)),
            Some(_) => {}
        }
    }

    for path in old.files.keys() {
        if !new.files.contains_key(path) {
            events.push(FsEvent::new(path.clone(), FsEventKind::Delete));
        }
    }

    events.sort_by(|a, b| a.path.cmp(&b.path));
    events
}

/// Snapshot service backed by the real filesystem.
#[derive(Debug, Clone, Copy, Default)]
pub struct HashingFs;

impl InputFs for HashingFs {
    fn events_since(
        &self,
        root: &Utf8Path,
        snapshot: &Utf8Path,
        ignore: &[Utf8PathBuf],
    ) -> Result<Vec<FsEvent>, SnapshotError> {
        let old = Snapshot::load(snapshot)?;
        let new = Snapshot::capture(root, ignore)?;
        Ok(diff_snapshots(&old, &new))
    }

    fn write_snapshot(
        &self,
        root: &Utf8Path,
        snapshot: &Utf8Path,
        ignore: &[Utf8PathBuf],
    ) -> Result<(), SnapshotError> {
        Snapshot::capture(root, ignore)?.save(snapshot)
    }
}
