//! Face snapshot storage.
//!
//! Keys look like `events/2026-03-01/front-door/P001/142233_17.jpg`. Spoof
//! captures go under `spoofing/` so retention and review can treat them
//! separately.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Component, Path, PathBuf};
use std::sync::Mutex;

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, NaiveDate, Utc};

use crate::detect::SubjectKey;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SnapshotKind {
    Event,
    Spoofing,
}

impl SnapshotKind {
    pub fn dir(self) -> &'static str {
        match self {
            SnapshotKind::Event => "events",
            SnapshotKind::Spoofing => "spoofing",
        }
    }

    pub fn for_subject(subject: &SubjectKey) -> Self {
        match subject {
            SubjectKey::Spoof => SnapshotKind::Spoofing,
            _ => SnapshotKind::Event,
        }
    }

    const ALL: [SnapshotKind; 2] = [SnapshotKind::Event, SnapshotKind::Spoofing];
}

pub fn snapshot_key(subject: &SubjectKey, camera_id: &str, timestamp_ms: u64, event_id: u64) -> String {
    let at = DateTime::<Utc>::from_timestamp_millis(i64::try_from(timestamp_ms).unwrap_or(i64::MAX))
        .unwrap_or_default();
    format!(
        "{}/{}/{}/{}/{}_{}.jpg",
        SnapshotKind::for_subject(subject).dir(),
        at.format("%Y-%m-%d"),
        camera_id,
        subject,
        at.format("%H%M%S"),
        event_id
    )
}

pub trait BlobStore: Send + Sync {
    /// Stores `bytes` under `key` and returns where it landed.
    fn put(&self, key: &str, bytes: &[u8]) -> Result<String>;

    /// Deletes the snapshot under `key`. A missing key is not an error.
    fn remove(&self, key: &str) -> Result<()>;

    /// Removes every snapshot dated before `cutoff`. Returns the number of
    /// day directories removed.
    fn prune_before(&self, cutoff: NaiveDate) -> Result<usize>;
}

pub struct FilesystemBlobStore {
    root: PathBuf,
}

impl FilesystemBlobStore {
    pub fn open<P: Into<PathBuf>>(root: P) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)
            .with_context(|| format!("failed to create snapshot dir {}", root.display()))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, key: &str) -> Result<PathBuf> {
        let rel = Path::new(key);
        if rel
            .components()
            .any(|c| !matches!(c, Component::Normal(_)))
        {
            return Err(anyhow!("snapshot key {:?} escapes the snapshot dir", key));
        }
        Ok(self.root.join(rel))
    }

    /// Drops day directories older than `days` relative to today (UTC).
    pub fn prune_older_than(&self, days: u32) -> Result<usize> {
        let cutoff = Utc::now().date_naive() - chrono::Duration::days(days as i64);
        self.prune_before(cutoff)
    }
}

impl BlobStore for FilesystemBlobStore {
    fn put(&self, key: &str, bytes: &[u8]) -> Result<String> {
        let path = self.resolve(key)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        write_atomic(&path, bytes)
            .with_context(|| format!("failed to write snapshot {}", path.display()))?;
        Ok(path.to_string_lossy().into_owned())
    }

    fn remove(&self, key: &str) -> Result<()> {
        let path = self.resolve(key)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err).with_context(|| format!("failed to remove {}", path.display())),
        }
    }

    fn prune_before(&self, cutoff: NaiveDate) -> Result<usize> {
        let mut removed = 0;
        for kind in SnapshotKind::ALL {
            let dir = self.root.join(kind.dir());
            if !dir.is_dir() {
                continue;
            }
            for entry in fs::read_dir(&dir)? {
                let entry = entry?;
                let name = entry.file_name();
                let Some(date) = name
                    .to_str()
                    .and_then(|s| NaiveDate::parse_from_str(s, "%Y-%m-%d").ok())
                else {
                    continue;
                };
                if date < cutoff {
                    fs::remove_dir_all(entry.path())
                        .with_context(|| format!("failed to prune {}", entry.path().display()))?;
                    removed += 1;
                }
            }
        }
        Ok(removed)
    }
}

fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    let tmp_path = path.with_extension("tmp");
    {
        let mut file = File::create(&tmp_path)?;
        file.write_all(data)?;
        file.sync_all()?;
    }
    fs::rename(tmp_path, path)?;
    Ok(())
}

#[derive(Default)]
pub struct InMemoryBlobStore {
    blobs: Mutex<HashMap<String, Vec<u8>>>,
}

impl InMemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.blobs.lock().ok()?.get(key).cloned()
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = match self.blobs.lock() {
            Ok(guard) => guard.keys().cloned().collect(),
            Err(_) => Vec::new(),
        };
        keys.sort();
        keys
    }
}

impl BlobStore for InMemoryBlobStore {
    fn put(&self, key: &str, bytes: &[u8]) -> Result<String> {
        self.blobs
            .lock()
            .map_err(|_| anyhow!("blob store lock poisoned"))?
            .insert(key.to_string(), bytes.to_vec());
        Ok(format!("mem://{}", key))
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.blobs
            .lock()
            .map_err(|_| anyhow!("blob store lock poisoned"))?
            .remove(key);
        Ok(())
    }

    fn prune_before(&self, cutoff: NaiveDate) -> Result<usize> {
        let mut blobs = self
            .blobs
            .lock()
            .map_err(|_| anyhow!("blob store lock poisoned"))?;
        let before = blobs.len();
        blobs.retain(|key, _| {
            key.split('/')
                .nth(1)
                .and_then(|d| NaiveDate::parse_from_str(d, "%Y-%m-%d").ok())
                .map_or(true, |date| date >= cutoff)
        });
        Ok(before - blobs.len())
    }
}
