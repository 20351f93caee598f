use std::sync::Arc;

use anyhow::{anyhow, Result};
use chrono::NaiveDate;
use sha2::{Digest, Sha256};
use tempfile::TempDir;

use gatewatch::identity::IdentityMatch;
use gatewatch::{
    BlobStore, BoundingBox, DetectionCandidate, DetectionEvent, EventSink, EventStore,
    FilesystemBlobStore, Frame, InMemoryBlobStore, InMemoryEventStore, PersistenceError,
    Rotation, SqliteEventStore,
};

const TS: u64 = 1_772_374_953_500;

struct FullDisk;

impl BlobStore for FullDisk {
    fn put(&self, _key: &str, _bytes: &[u8]) -> Result<String> {
        Err(anyhow!("no space left on device"))
    }

    fn remove(&self, _key: &str) -> Result<()> {
        Ok(())
    }

    fn prune_before(&self, _cutoff: NaiveDate) -> Result<usize> {
        Ok(0)
    }
}

struct ReadOnlyStore;

impl EventStore for ReadOnlyStore {
    fn insert_event(&self, _ev: &DetectionEvent) -> Result<()> {
        Err(anyhow!("attempt to write a readonly database"))
    }

    fn max_event_id(&self) -> Result<u64> {
        Ok(0)
    }

    fn recent_events(&self, _limit: usize) -> Result<Vec<DetectionEvent>> {
        Ok(Vec::new())
    }
}

fn frame() -> Frame {
    Frame::from_rgb(vec![90; 64 * 48 * 3], 64, 48, 7).unwrap()
}

fn known(timestamp_ms: u64) -> DetectionCandidate {
    DetectionCandidate::live(
        "front-door",
        "Main Entrance",
        BoundingBox::new(8, 8, 32, 32, 0.93),
        vec![0.6, 0.8],
        Some(IdentityMatch {
            person_id: "P001".into(),
            display_name: "Ada".into(),
            distance: 0.12,
        }),
        Some(0.12),
        0.97,
        Rotation::None,
        timestamp_ms,
    )
}

#[test]
fn snapshot_failure_still_records_event() -> Result<()> {
    let store = Arc::new(InMemoryEventStore::new());
    let sink = EventSink::new(store.clone(), Arc::new(FullDisk))?;

    let event = sink.commit(&known(TS), &frame())?;
    assert!(event.snapshot_missing);
    assert_eq!(event.snapshot_path, None);
    assert_eq!(event.snapshot_sha256, None);
    assert_eq!(event.person_id.as_deref(), Some("P001"));
    assert_eq!(store.events(), vec![event]);
    Ok(())
}

#[test]
fn store_failure_is_reported_as_persistence_error() -> Result<()> {
    let blobs = Arc::new(InMemoryBlobStore::new());
    let sink = EventSink::new(Arc::new(ReadOnlyStore), blobs)?;

    let err = sink.commit(&known(TS), &frame()).unwrap_err();
    assert!(matches!(err, PersistenceError::Store(_)));
    assert!(err.to_string().contains("readonly"));
    Ok(())
}

#[test]
fn store_failure_leaves_no_orphaned_snapshot() -> Result<()> {
    let dir = TempDir::new()?;
    let blobs = Arc::new(InMemoryBlobStore::new());
    let sink = EventSink::new(Arc::new(ReadOnlyStore), blobs.clone())?;
    assert!(sink.commit(&known(TS), &frame()).is_err());
    assert!(blobs.keys().is_empty());

    let root = dir.path().join("snapshots");
    let sink = EventSink::new(
        Arc::new(ReadOnlyStore),
        Arc::new(FilesystemBlobStore::open(&root)?),
    )?;
    assert!(sink.commit(&known(TS), &frame()).is_err());
    let day = root.join("events/2026-03-01/front-door/P001");
    let left: Vec<_> = match std::fs::read_dir(&day) {
        Ok(entries) => entries.collect::<Result<_, _>>()?,
        Err(_) => Vec::new(),
    };
    assert!(left.is_empty(), "{:?}", left);
    Ok(())
}

#[test]
fn filesystem_snapshot_matches_recorded_digest() -> Result<()> {
    let dir = TempDir::new()?;
    let db_path = dir.path().join("gatewatch.db");
    let store = Arc::new(SqliteEventStore::open(db_path.to_str().unwrap())?);
    let blobs = Arc::new(FilesystemBlobStore::open(dir.path().join("snapshots"))?);
    let sink = EventSink::new(store.clone(), blobs)?;

    let event = sink.commit(&known(TS), &frame())?;
    let path = event.snapshot_path.clone().expect("snapshot written");
    assert!(path.ends_with("events/2026-03-01/front-door/P001/142233_1.jpg"));

    let bytes = std::fs::read(&path)?;
    assert_eq!(&bytes[..2], &[0xFF, 0xD8]);
    assert_eq!(
        event.snapshot_sha256.as_deref(),
        Some(hex::encode(Sha256::digest(&bytes)).as_str())
    );
    assert_eq!(store.latest_event()?, Some(event));
    Ok(())
}

#[test]
fn event_ids_stay_monotonic_across_reopen() -> Result<()> {
    let dir = TempDir::new()?;
    let db_path = dir.path().join("gatewatch.db");
    let db_path = db_path.to_str().unwrap();

    let first_ids: Vec<u64> = {
        let store = Arc::new(SqliteEventStore::open(db_path)?);
        let sink = EventSink::new(store, Arc::new(InMemoryBlobStore::new()))?;
        (0..3)
            .map(|i| sink.commit(&known(TS + i * 60_000), &frame()).map(|e| e.id))
            .collect::<Result<_, _>>()?
    };
    assert_eq!(first_ids, vec![1, 2, 3]);

    let store = Arc::new(SqliteEventStore::open(db_path)?);
    let sink = EventSink::new(store.clone(), Arc::new(InMemoryBlobStore::new()))?;
    let next = sink.commit(&known(TS + 600_000), &frame())?;
    assert_eq!(next.id, 4);

    let recent = store.recent_events(10)?;
    let ids: Vec<u64> = recent.iter().map(|e| e.id).collect();
    assert_eq!(ids, vec![4, 3, 2, 1]);
    Ok(())
}

#[test]
fn concurrent_commits_get_distinct_ids() -> Result<()> {
    let store = Arc::new(InMemoryEventStore::new());
    let sink = Arc::new(EventSink::new(store.clone(), Arc::new(InMemoryBlobStore::new()))?);

    let handles: Vec<_> = (0..4)
        .map(|t| {
            let sink = sink.clone();
            std::thread::spawn(move || {
                for i in 0..5 {
                    sink.commit(&known(TS + t * 1_000 + i), &frame()).unwrap();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let mut ids: Vec<u64> = store.events().iter().map(|e| e.id).collect();
    ids.sort_unstable();
    assert_eq!(ids, (1..=20).collect::<Vec<_>>());
    Ok(())
}
