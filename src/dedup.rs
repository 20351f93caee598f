//! Per (camera, subject) cooldown.
//!
//! At most one candidate per key is accepted per cooldown window. Spoof
//! attempts share one bucket per camera. Stale entries are evicted while
//! checking, so the working set stays bounded without a sweeper thread.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use crate::config::Thresholds;
use crate::detect::{read_thresholds, DetectionCandidate, SharedThresholds, SubjectKey};

/// Entries idle for this many windows are dropped.
const EVICTION_GRACE: u32 = 4;
/// Full sweep cadence, in `accept` calls.
const SWEEP_EVERY: u64 = 128;

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct CooldownKey {
    pub camera_id: String,
    pub subject: SubjectKey,
}

impl CooldownKey {
    pub fn for_candidate(candidate: &DetectionCandidate) -> Self {
        Self {
            camera_id: candidate.camera_id.clone(),
            subject: candidate.subject_key(),
        }
    }
}

#[derive(Default)]
struct CooldownTable {
    /// Last accepted timestamp (ms since epoch) per key.
    entries: HashMap<CooldownKey, u64>,
    checks: u64,
}

pub struct EventDeduplicator {
    thresholds: SharedThresholds,
    table: Mutex<CooldownTable>,
}

impl EventDeduplicator {
    pub fn new(thresholds: SharedThresholds) -> Self {
        Self {
            thresholds,
            table: Mutex::new(CooldownTable::default()),
        }
    }

    pub fn with_cooldown(cooldown: Duration) -> Self {
        Self::new(Arc::new(RwLock::new(Thresholds {
            cooldown,
            ..Thresholds::default()
        })))
    }

    pub fn window(&self) -> Duration {
        read_thresholds(&self.thresholds).cooldown
    }

    /// True if `candidate` opens a new cooldown window for its key.
    ///
    /// Uses the candidate's frame timestamp as "now". A timestamp earlier than
    /// the last accepted one for the key counts as inside the window.
    pub fn accept(&self, candidate: &DetectionCandidate) -> bool {
        let window_ms = duration_ms(self.window());
        let grace_ms = window_ms.saturating_mul(EVICTION_GRACE as u64);
        let now = candidate.timestamp_ms;
        let key = CooldownKey::for_candidate(candidate);

        let mut table = match self.table.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        table.checks += 1;
        if table.checks % SWEEP_EVERY == 0 {
            let before = table.entries.len();
            table
                .entries
                .retain(|_, last| now.saturating_sub(*last) <= grace_ms);
            let evicted = before - table.entries.len();
            if evicted > 0 {
                log::debug!("cooldown sweep evicted {} entries", evicted);
            }
        }

        if let Some(&last) = table.entries.get(&key) {
            let elapsed = now.saturating_sub(last);
            if elapsed <= window_ms {
                return false;
            }
            if elapsed > grace_ms {
                table.entries.remove(&key);
            }
        }
        table.entries.insert(key, now);
        true
    }

    /// Number of keys currently tracked.
    pub fn tracked(&self) -> usize {
        match self.table.lock() {
            Ok(guard) => guard.entries.len(),
            Err(poisoned) => poisoned.into_inner().entries.len(),
        }
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
