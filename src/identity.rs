//! In-memory identity cache.
//!
//! Readers always hold an `Arc<IdentitySnapshot>`; a reload builds a complete
//! new snapshot off to the side and publishes it with a single pointer swap,
//! so a reader sees either the old set or the new set, never a mix.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use crate::detect::DistanceMetric;

pub type Embedding = Vec<f32>;

/// An enrolled person and their reference embeddings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct IdentityRecord {
    pub person_id: String,
    pub display_name: String,
    pub embeddings: Vec<Embedding>,
    pub active: bool,
}

/// Nearest enrolled identity for a probe embedding.
#[derive(Clone, Debug, PartialEq)]
pub struct IdentityMatch {
    pub person_id: String,
    pub display_name: String,
    pub distance: f32,
}

/// Immutable set of active identities.
#[derive(Debug, Default)]
pub struct IdentitySnapshot {
    records: Vec<IdentityRecord>,
    generation: u64,
    dimension: Option<usize>,
}

impl IdentitySnapshot {
    /// Filter and validate raw records into a publishable snapshot.
    ///
    /// Inactive records are dropped. Embeddings that are empty, non-finite, or
    /// differ in length from the first accepted embedding are skipped, and a
    /// record left with no embeddings is skipped entirely.
    pub fn build(raw: Vec<IdentityRecord>, generation: u64) -> Self {
        let mut dimension: Option<usize> = None;
        let mut records = Vec::with_capacity(raw.len());
        for mut record in raw {
            if !record.active {
                continue;
            }
            let before = record.embeddings.len();
            record.embeddings.retain(|embedding| {
                if embedding.is_empty() || embedding.iter().any(|v| !v.is_finite()) {
                    return false;
                }
                match dimension {
                    Some(dim) => embedding.len() == dim,
                    None => {
                        dimension = Some(embedding.len());
                        true
                    }
                }
            });
            if record.embeddings.len() != before {
                log::warn!(
                    "identity {}: skipped {} unusable reference embeddings",
                    record.person_id,
                    before - record.embeddings.len()
                );
            }
            if record.embeddings.is_empty() {
                log::warn!(
                    "identity {}: no usable reference embeddings, not loaded",
                    record.person_id
                );
                continue;
            }
            records.push(record);
        }
        Self {
            records,
            generation,
            dimension,
        }
    }

    pub fn records(&self) -> &[IdentityRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Increments by one on every successful reload.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn dimension(&self) -> Option<usize> {
        self.dimension
    }

    /// The identity whose closest reference embedding is nearest to `probe`.
    ///
    /// Each person's distance is the minimum over their references. The
    /// threshold decision is left to the caller.
    pub fn nearest(&self, probe: &[f32], metric: &dyn DistanceMetric) -> Option<IdentityMatch> {
        let mut best: Option<(&IdentityRecord, f32)> = None;
        for record in &self.records {
            let distance = record
                .embeddings
                .iter()
                .filter(|reference| reference.len() == probe.len())
                .map(|reference| metric.distance(probe, reference))
                .filter(|d| !d.is_nan())
                .fold(f32::INFINITY, f32::min);
            if !distance.is_finite() {
                continue;
            }
            if best.map_or(true, |(_, current)| distance < current) {
                best = Some((record, distance));
            }
        }
        best.map(|(record, distance)| IdentityMatch {
            person_id: record.person_id.clone(),
            display_name: record.display_name.clone(),
            distance,
        })
    }
}

/// Where enrolled identities come from (the relational store in production).
pub trait IdentitySource: Send + Sync {
    fn load_identities(&self) -> Result<Vec<IdentityRecord>>;
}

/// Identity source backed by a vector; used by tests and the stub daemon.
#[derive(Default)]
pub struct InMemoryIdentitySource {
    records: Mutex<Vec<IdentityRecord>>,
}

impl InMemoryIdentitySource {
    pub fn new(records: Vec<IdentityRecord>) -> Self {
        Self {
            records: Mutex::new(records),
        }
    }

    /// Replace the records the next `reload` will see.
    pub fn replace(&self, records: Vec<IdentityRecord>) {
        if let Ok(mut guard) = self.records.lock() {
            *guard = records;
        }
    }
}

impl IdentitySource for InMemoryIdentitySource {
    fn load_identities(&self) -> Result<Vec<IdentityRecord>> {
        let guard = self
            .records
            .lock()
            .map_err(|_| anyhow::anyhow!("identity source lock poisoned"))?;
        Ok(guard.clone())
    }
}

pub struct IdentityCache {
    source: Arc<dyn IdentitySource>,
    current: RwLock<Arc<IdentitySnapshot>>,
    generation: AtomicU64,
    reload_lock: Mutex<()>,
}

impl IdentityCache {
    /// Create an empty cache. Call `reload` to populate it.
    pub fn new(source: Arc<dyn IdentitySource>) -> Self {
        Self {
            source,
            current: RwLock::new(Arc::new(IdentitySnapshot::default())),
            generation: AtomicU64::new(0),
            reload_lock: Mutex::new(()),
        }
    }

    /// Create and populate from `source`.
    pub fn load(source: Arc<dyn IdentitySource>) -> Result<Self> {
        let cache = Self::new(source);
        cache.reload()?;
        Ok(cache)
    }

    /// A consistent snapshot of every loaded identity.
    pub fn lookup_all(&self) -> Arc<IdentitySnapshot> {
        match self.current.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Rebuild from the source and publish atomically.
    ///
    /// On a source error the previous snapshot stays in place.
    pub fn reload(&self) -> Result<usize> {
        let _serialized = self
            .reload_lock
            .lock()
            .map_err(|_| anyhow::anyhow!("identity reload lock poisoned"))?;
        let raw = self.source.load_identities()?;
        let generation = self.generation.load(Ordering::SeqCst) + 1;
        let snapshot = Arc::new(IdentitySnapshot::build(raw, generation));
        let count = snapshot.len();
        {
            let mut guard = match self.current.write() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            *guard = snapshot;
        }
        self.generation.store(generation, Ordering::SeqCst);
        log::info!(
            "identity cache loaded {} identities (generation {})",
            count,
            generation
        );
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::{CosineDistance, EuclideanDistance};

    fn record(id: &str, embeddings: Vec<Embedding>) -> IdentityRecord {
        IdentityRecord {
            person_id: id.to_string(),
            display_name: format!("Person {}", id),
            embeddings,
            active: true,
        }
    }

    #[test]
    fn build_skips_inactive_and_mismatched() {
        let mut inactive = record("P003", vec![vec![1.0, 0.0]]);
        inactive.active = false;
        let raw = vec![
            record("P001", vec![vec![1.0, 0.0], vec![0.0, 1.0, 0.0]]),
            record("P002", vec![vec![f32::NAN, 0.0]]),
            inactive,
        ];
        let snapshot = IdentitySnapshot::build(raw, 1);
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot.records()[0].embeddings.len(), 1);
        assert_eq!(snapshot.dimension(), Some(2));
    }

    #[test]
    fn nearest_uses_per_person_minimum() {
        let snapshot = IdentitySnapshot::build(
            vec![
                record("P001", vec![vec![0.0, 1.0], vec![0.9, 0.1]]),
                record("P002", vec![vec![0.8, 0.2]]),
            ],
            1,
        );
        let hit = snapshot.nearest(&[1.0, 0.0], &EuclideanDistance).unwrap();
        assert_eq!(hit.person_id, "P001");
        assert!(hit.distance < 0.2);
    }

    #[test]
    fn nearest_on_empty_snapshot_is_none() {
        let snapshot = IdentitySnapshot::default();
        assert!(snapshot.nearest(&[1.0, 0.0], &CosineDistance).is_none());
    }

    #[test]
    fn reload_swaps_whole_snapshot() -> Result<()> {
        let source = Arc::new(InMemoryIdentitySource::new(vec![record(
            "P001",
            vec![vec![1.0, 0.0]],
        )]));
        let cache = IdentityCache::load(source.clone())?;
        let before = cache.lookup_all();
        assert_eq!(before.len(), 1);

        source.replace(vec![
            record("P002", vec![vec![0.0, 1.0]]),
            record("P003", vec![vec![0.5, 0.5]]),
        ]);
        assert_eq!(cache.reload()?, 2);

        // The old handle is untouched by the swap.
        assert_eq!(before.len(), 1);
        assert_eq!(before.generation(), 1);
        let after = cache.lookup_all();
        assert_eq!(after.len(), 2);
        assert_eq!(after.generation(), 2);
        Ok(())
    }
}
