//! Gatewatch
//!
//! Multi-camera face identification: ingest MJPEG/RTSP streams, detect faces,
//! reject spoofs, match against enrolled identities, and record deduplicated
//! detection events with snapshot evidence.
//!
//! # Pipeline
//!
//! camera thread (connect, read, admit) → pipeline pool (detect → liveness →
//! recognize) → cooldown → event sink (snapshot + SQLite record).
//!
//! # Module Structure
//!
//! - `config`: file + environment configuration
//! - `ingest`: frame sources (MJPEG, RTSP, synthetic)
//! - `stream`: connection state machine, backoff, frame admission, supervisor
//! - `detect`: model traits, distance metrics, the detection pipeline
//! - `identity`: identity records and the atomically swapped cache
//! - `dedup`, `sink`, `storage`, `snapshots`: event commit path

use std::time::{SystemTime, UNIX_EPOCH};

pub mod config;
pub mod dedup;
pub mod detect;
pub mod error;
pub mod frame;
pub mod identity;
pub mod ingest;
pub mod pool;
pub mod processor;
pub mod runtime;
pub mod sink;
pub mod snapshots;
pub mod storage;
pub mod stream;

pub use config::{CameraSource, GatewatchConfig, StreamTiming, Thresholds, TransportKind};
pub use dedup::EventDeduplicator;
pub use detect::{DetectionCandidate, DetectionPipeline, ModelSet, SubjectKey};
pub use error::{ConfigurationError, GatewatchError, ModelError, PersistenceError, StreamError};
pub use frame::{BoundingBox, FaceCrop, Frame, Rotation};
pub use identity::{IdentityCache, IdentityRecord, IdentitySnapshot, IdentitySource};
pub use processor::FrameProcessor;
pub use runtime::{build_supervisor, Collaborators};
pub use sink::{DetectionEvent, EventSink};
pub use snapshots::{BlobStore, FilesystemBlobStore, InMemoryBlobStore};
pub use storage::{EventStore, InMemoryEventStore, SqliteEventStore, SqliteIdentitySource};
pub use stream::{ConnectionState, StreamStatus, StreamSupervisor, SystemStatus};

/// Wall-clock time in milliseconds since the Unix epoch (0 if the clock is
/// before the epoch).
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}
