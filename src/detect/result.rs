use serde::{Deserialize, Serialize};

use crate::frame::{BoundingBox, Rotation};
use crate::identity::{Embedding, IdentityMatch};

/// Cooldown bucket a candidate falls into.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SubjectKey {
    Person(String),
    Unknown,
    Spoof,
}

impl SubjectKey {
    pub fn as_str(&self) -> &str {
        match self {
            SubjectKey::Person(id) => id,
            SubjectKey::Unknown => "unknown",
            SubjectKey::Spoof => "spoof",
        }
    }
}

impl std::fmt::Display for SubjectKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One face in one frame, not yet deduplicated or committed.
#[derive(Clone, Debug, PartialEq)]
pub struct DetectionCandidate {
    pub camera_id: String,
    pub location: String,
    pub bbox: BoundingBox,
    /// Absent for spoofed faces; recognition never ran.
    pub embedding: Option<Embedding>,
    pub person_id: Option<String>,
    pub display_name: Option<String>,
    /// Distance to the nearest enrolled identity, matched or not.
    pub distance: Option<f32>,
    pub liveness_score: f32,
    pub spoofed: bool,
    pub rotation: Rotation,
    /// Capture time of the source frame, ms since the Unix epoch.
    pub timestamp_ms: u64,
}

impl DetectionCandidate {
    /// A face that failed the liveness gate. Never carries an identity.
    pub fn spoofed(
        camera_id: &str,
        location: &str,
        bbox: BoundingBox,
        liveness_score: f32,
        rotation: Rotation,
        timestamp_ms: u64,
    ) -> Self {
        Self {
            camera_id: camera_id.to_string(),
            location: location.to_string(),
            bbox,
            embedding: None,
            person_id: None,
            display_name: None,
            distance: None,
            liveness_score,
            spoofed: true,
            rotation,
            timestamp_ms,
        }
    }

    /// A live face. `matched` is the identity that cleared the threshold, if any;
    /// `nearest_distance` is recorded either way.
    #[allow(clippy::too_many_arguments)]
    pub fn live(
        camera_id: &str,
        location: &str,
        bbox: BoundingBox,
        embedding: Embedding,
        matched: Option<IdentityMatch>,
        nearest_distance: Option<f32>,
        liveness_score: f32,
        rotation: Rotation,
        timestamp_ms: u64,
    ) -> Self {
        let (person_id, display_name) = match matched {
            Some(m) => (Some(m.person_id), Some(m.display_name)),
            None => (None, None),
        };
        Self {
            camera_id: camera_id.to_string(),
            location: location.to_string(),
            bbox,
            embedding: Some(embedding),
            person_id,
            display_name,
            distance: nearest_distance,
            liveness_score,
            spoofed: false,
            rotation,
            timestamp_ms,
        }
    }

    pub fn is_unknown(&self) -> bool {
        !self.spoofed && self.person_id.is_none()
    }

    pub fn subject_key(&self) -> SubjectKey {
        if self.spoofed {
            return SubjectKey::Spoof;
        }
        match &self.person_id {
            Some(id) => SubjectKey::Person(id.clone()),
            None => SubjectKey::Unknown,
        }
    }

    /// `1 - distance` for matched faces, clamped to [0, 1].
    pub fn confidence(&self) -> Option<f32> {
        self.person_id.as_ref()?;
        self.distance.map(|d| (1.0 - d).clamp(0.0, 1.0))
    }
}
