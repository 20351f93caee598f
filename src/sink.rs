//! Event commit: id assignment, snapshot, durable record.
//!
//! The record is authoritative. A snapshot that cannot be written leaves the
//! event in place with `snapshot_missing` set.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::detect::DetectionCandidate;
use crate::error::PersistenceError;
use crate::frame::{BoundingBox, Frame};
use crate::snapshots::{snapshot_key, BlobStore};
use crate::storage::EventStore;

pub const SPOOFING_REASON: &str = "liveness check failed";
pub const SPOOFING_TYPE: &str = "print_or_screen";
pub const REQUEST_SOURCE: &str = "webcam";

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DetectionEvent {
    pub id: u64,
    pub camera_id: String,
    pub location: String,
    pub person_id: Option<String>,
    pub display_name: Option<String>,
    pub is_unknown: bool,
    pub spoofing_detected: bool,
    pub spoofing_reason: Option<String>,
    pub spoofing_type: Option<String>,
    pub confidence: Option<f32>,
    pub embedding_distance: Option<f32>,
    pub liveness_score: f32,
    pub bounding_box: BoundingBox,
    pub snapshot_path: Option<String>,
    /// Hex SHA-256 of the stored snapshot bytes.
    pub snapshot_sha256: Option<String>,
    pub snapshot_missing: bool,
    pub timestamp_ms: u64,
    pub request_source: String,
}

pub struct EventSink {
    store: Arc<dyn EventStore>,
    blobs: Arc<dyn BlobStore>,
    next_id: AtomicU64,
}

impl EventSink {
    /// Continues the id sequence after the highest id already in `store`.
    pub fn new(store: Arc<dyn EventStore>, blobs: Arc<dyn BlobStore>) -> Result<Self> {
        let next = store.max_event_id()? + 1;
        Ok(Self {
            store,
            blobs,
            next_id: AtomicU64::new(next),
        })
    }

    pub fn commit(
        &self,
        candidate: &DetectionCandidate,
        frame: &Frame,
    ) -> Result<DetectionEvent, PersistenceError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let subject = candidate.subject_key();

        let (blob_key, snapshot_path, snapshot_sha256) =
            match self.write_snapshot(candidate, frame, id) {
                Ok((key, path, digest)) => (Some(key), Some(path), Some(digest)),
                Err(err) => {
                    log::warn!(
                        "camera {}: event {} ({}) recorded without snapshot: {}",
                        candidate.camera_id,
                        id,
                        subject,
                        err
                    );
                    (None, None, None)
                }
            };

        // A spoof never carries an identity, whatever the candidate says.
        let (person_id, display_name) = if candidate.spoofed {
            (None, None)
        } else {
            (candidate.person_id.clone(), candidate.display_name.clone())
        };

        let event = DetectionEvent {
            id,
            camera_id: candidate.camera_id.clone(),
            location: candidate.location.clone(),
            is_unknown: !candidate.spoofed && person_id.is_none(),
            person_id,
            display_name,
            spoofing_detected: candidate.spoofed,
            spoofing_reason: candidate.spoofed.then(|| SPOOFING_REASON.to_string()),
            spoofing_type: candidate.spoofed.then(|| SPOOFING_TYPE.to_string()),
            confidence: if candidate.spoofed {
                None
            } else {
                candidate.confidence()
            },
            embedding_distance: candidate.distance,
            liveness_score: candidate.liveness_score,
            bounding_box: candidate.bbox,
            snapshot_missing: snapshot_path.is_none(),
            snapshot_path,
            snapshot_sha256,
            timestamp_ms: candidate.timestamp_ms,
            request_source: REQUEST_SOURCE.to_string(),
        };

        if let Err(err) = self.store.insert_event(&event) {
            // No row will ever point at the snapshot.
            if let Some(key) = blob_key {
                if let Err(remove_err) = self.blobs.remove(&key) {
                    log::warn!("event {}: orphaned snapshot {}: {}", id, key, remove_err);
                }
            }
            return Err(PersistenceError::Store(err));
        }
        Ok(event)
    }

    fn write_snapshot(
        &self,
        candidate: &DetectionCandidate,
        frame: &Frame,
        id: u64,
    ) -> Result<(String, String, String), PersistenceError> {
        let bytes = frame.snapshot_jpeg().map_err(PersistenceError::Snapshot)?;
        let key = snapshot_key(
            &candidate.subject_key(),
            &candidate.camera_id,
            candidate.timestamp_ms,
            id,
        );
        let path = self
            .blobs
            .put(&key, &bytes)
            .map_err(PersistenceError::Snapshot)?;
        let digest = hex::encode(Sha256::digest(&bytes));
        Ok((key, path, digest))
    }
}
