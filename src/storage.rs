use anyhow::{anyhow, Context, Result};
use rusqlite::{params, Connection, Row};
use std::collections::BTreeMap;
use std::sync::Mutex;

use crate::frame::BoundingBox;
use crate::identity::{Embedding, IdentityRecord, IdentitySource};
use crate::sink::DetectionEvent;

pub trait EventStore: Send + Sync {
    fn insert_event(&self, ev: &DetectionEvent) -> Result<()>;

    /// Highest event id ever written, 0 for an empty store.
    fn max_event_id(&self) -> Result<u64>;

    /// Newest first.
    fn recent_events(&self, limit: usize) -> Result<Vec<DetectionEvent>>;

    fn latest_event(&self) -> Result<Option<DetectionEvent>> {
        Ok(self.recent_events(1)?.into_iter().next())
    }
}

pub struct SqliteEventStore {
    conn: Mutex<Connection>,
}

impl SqliteEventStore {
    pub fn open(db_path: &str) -> Result<Self> {
        let conn = Connection::open(db_path)
            .with_context(|| format!("failed to open event store {}", db_path))?;
        ensure_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("event store lock poisoned"))
    }
}

fn ensure_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        PRAGMA journal_mode=WAL;

        CREATE TABLE IF NOT EXISTS detection_events (
          id INTEGER PRIMARY KEY,
          camera_id TEXT NOT NULL,
          location TEXT NOT NULL,
          person_id TEXT,
          display_name TEXT,
          is_unknown INTEGER NOT NULL,
          spoofing_detected INTEGER NOT NULL,
          spoofing_reason TEXT,
          spoofing_type TEXT,
          confidence REAL,
          embedding_distance REAL,
          liveness_score REAL NOT NULL,
          bounding_box TEXT NOT NULL,
          snapshot_path TEXT,
          snapshot_sha256 TEXT,
          snapshot_missing INTEGER NOT NULL,
          timestamp_ms INTEGER NOT NULL,
          request_source TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_events_person_ts ON detection_events(person_id, timestamp_ms);
        CREATE INDEX IF NOT EXISTS idx_events_camera_ts ON detection_events(camera_id, timestamp_ms);
        CREATE INDEX IF NOT EXISTS idx_events_spoof_ts ON detection_events(spoofing_detected, timestamp_ms);

        CREATE TABLE IF NOT EXISTS persons (
          person_id TEXT PRIMARY KEY,
          display_name TEXT NOT NULL,
          is_active INTEGER NOT NULL DEFAULT 1
        );

        CREATE TABLE IF NOT EXISTS person_embeddings (
          id INTEGER PRIMARY KEY AUTOINCREMENT,
          person_id TEXT NOT NULL REFERENCES persons(person_id),
          embedding_json TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_embeddings_person ON person_embeddings(person_id);
        "#,
    )?;
    Ok(())
}

const EVENT_COLUMNS: &str = "id, camera_id, location, person_id, display_name, is_unknown, \
     spoofing_detected, spoofing_reason, spoofing_type, confidence, embedding_distance, \
     liveness_score, bounding_box, snapshot_path, snapshot_sha256, snapshot_missing, \
     timestamp_ms, request_source";

fn event_from_row(row: &Row<'_>) -> Result<DetectionEvent> {
    let id: i64 = row.get(0)?;
    let bbox_json: String = row.get(12)?;
    let bounding_box: BoundingBox =
        serde_json::from_str(&bbox_json).context("corrupt event row: bounding_box")?;
    let timestamp_ms: i64 = row.get(16)?;
    Ok(DetectionEvent {
        id: u64::try_from(id).map_err(|_| anyhow!("corrupt event row: negative id"))?,
        camera_id: row.get(1)?,
        location: row.get(2)?,
        person_id: row.get(3)?,
        display_name: row.get(4)?,
        is_unknown: row.get(5)?,
        spoofing_detected: row.get(6)?,
        spoofing_reason: row.get(7)?,
        spoofing_type: row.get(8)?,
        confidence: row.get::<_, Option<f64>>(9)?.map(|v| v as f32),
        embedding_distance: row.get::<_, Option<f64>>(10)?.map(|v| v as f32),
        liveness_score: row.get::<_, f64>(11)? as f32,
        bounding_box,
        snapshot_path: row.get(13)?,
        snapshot_sha256: row.get(14)?,
        snapshot_missing: row.get(15)?,
        timestamp_ms: u64::try_from(timestamp_ms).unwrap_or(0),
        request_source: row.get(17)?,
    })
}

impl EventStore for SqliteEventStore {
    fn insert_event(&self, ev: &DetectionEvent) -> Result<()> {
        let id = i64::try_from(ev.id).map_err(|_| anyhow!("event id exceeds i64 range"))?;
        let timestamp_ms = i64::try_from(ev.timestamp_ms)
            .map_err(|_| anyhow!("event timestamp exceeds i64 range"))?;
        let bounding_box = serde_json::to_string(&ev.bounding_box)?;
        self.conn()?.execute(
            r#"
            INSERT INTO detection_events(
              id, camera_id, location, person_id, display_name, is_unknown,
              spoofing_detected, spoofing_reason, spoofing_type, confidence,
              embedding_distance, liveness_score, bounding_box, snapshot_path,
              snapshot_sha256, snapshot_missing, timestamp_ms, request_source)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)
            "#,
            params![
                id,
                ev.camera_id,
                ev.location,
                ev.person_id,
                ev.display_name,
                ev.is_unknown,
                ev.spoofing_detected,
                ev.spoofing_reason,
                ev.spoofing_type,
                ev.confidence.map(f64::from),
                ev.embedding_distance.map(f64::from),
                f64::from(ev.liveness_score),
                bounding_box,
                ev.snapshot_path,
                ev.snapshot_sha256,
                ev.snapshot_missing,
                timestamp_ms,
                ev.request_source,
            ],
        )?;
        Ok(())
    }

    fn max_event_id(&self) -> Result<u64> {
        let max: Option<i64> = self
            .conn()?
            .query_row("SELECT MAX(id) FROM detection_events", [], |row| row.get(0))?;
        Ok(max.and_then(|v| u64::try_from(v).ok()).unwrap_or(0))
    }

    fn recent_events(&self, limit: usize) -> Result<Vec<DetectionEvent>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM detection_events ORDER BY id DESC LIMIT ?1",
            EVENT_COLUMNS
        ))?;
        let mut rows = stmt.query(params![limit as i64])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(event_from_row(row)?);
        }
        Ok(out)
    }

    fn latest_event(&self) -> Result<Option<DetectionEvent>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM detection_events ORDER BY id DESC LIMIT 1",
            EVENT_COLUMNS
        ))?;
        let mut rows = stmt.query([])?;
        match rows.next()? {
            Some(row) => Ok(Some(event_from_row(row)?)),
            None => Ok(None),
        }
    }
}

#[derive(Default)]
pub struct InMemoryEventStore {
    events: Mutex<Vec<DetectionEvent>>,
}

impl InMemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Oldest first.
    pub fn events(&self) -> Vec<DetectionEvent> {
        match self.events.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

impl EventStore for InMemoryEventStore {
    fn insert_event(&self, ev: &DetectionEvent) -> Result<()> {
        let mut events = self
            .events
            .lock()
            .map_err(|_| anyhow!("event store lock poisoned"))?;
        if events.iter().any(|e| e.id == ev.id) {
            return Err(anyhow!("duplicate event id {}", ev.id));
        }
        events.push(ev.clone());
        Ok(())
    }

    fn max_event_id(&self) -> Result<u64> {
        let events = self
            .events
            .lock()
            .map_err(|_| anyhow!("event store lock poisoned"))?;
        Ok(events.iter().map(|e| e.id).max().unwrap_or(0))
    }

    fn recent_events(&self, limit: usize) -> Result<Vec<DetectionEvent>> {
        let mut events = self.events();
        events.sort_by(|a, b| b.id.cmp(&a.id));
        events.truncate(limit);
        Ok(events)
    }
}

/// Enrolled persons read from the `persons` / `person_embeddings` tables.
///
/// Embeddings are stored as JSON arrays; one person may have several.
pub struct SqliteIdentitySource {
    conn: Mutex<Connection>,
}

impl SqliteIdentitySource {
    pub fn open(db_path: &str) -> Result<Self> {
        let conn = Connection::open(db_path)
            .with_context(|| format!("failed to open identity store {}", db_path))?;
        ensure_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Inserts or replaces a person together with their reference embeddings.
    pub fn enroll(&self, person_id: &str, display_name: &str, embeddings: &[Embedding]) -> Result<()> {
        let mut conn = self
            .conn
            .lock()
            .map_err(|_| anyhow!("identity store lock poisoned"))?;
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT OR REPLACE INTO persons(person_id, display_name, is_active) VALUES (?1, ?2, 1)",
            params![person_id, display_name],
        )?;
        tx.execute(
            "DELETE FROM person_embeddings WHERE person_id = ?1",
            params![person_id],
        )?;
        for embedding in embeddings {
            tx.execute(
                "INSERT INTO person_embeddings(person_id, embedding_json) VALUES (?1, ?2)",
                params![person_id, serde_json::to_string(embedding)?],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn set_active(&self, person_id: &str, active: bool) -> Result<bool> {
        let conn = self
            .conn
            .lock()
            .map_err(|_| anyhow!("identity store lock poisoned"))?;
        let changed = conn.execute(
            "UPDATE persons SET is_active = ?2 WHERE person_id = ?1",
            params![person_id, active],
        )?;
        Ok(changed > 0)
    }
}

impl IdentitySource for SqliteIdentitySource {
    fn load_identities(&self) -> Result<Vec<IdentityRecord>> {
        let conn = self
            .conn
            .lock()
            .map_err(|_| anyhow!("identity store lock poisoned"))?;
        let mut records: BTreeMap<String, IdentityRecord> = BTreeMap::new();
        {
            let mut stmt =
                conn.prepare("SELECT person_id, display_name, is_active FROM persons")?;
            let mut rows = stmt.query([])?;
            while let Some(row) = rows.next()? {
                let person_id: String = row.get(0)?;
                records.insert(
                    person_id.clone(),
                    IdentityRecord {
                        person_id,
                        display_name: row.get(1)?,
                        embeddings: Vec::new(),
                        active: row.get(2)?,
                    },
                );
            }
        }

        let mut stmt =
            conn.prepare("SELECT person_id, embedding_json FROM person_embeddings ORDER BY id")?;
        let mut rows = stmt.query([])?;
        while let Some(row) = rows.next()? {
            let person_id: String = row.get(0)?;
            let json: String = row.get(1)?;
            let Some(record) = records.get_mut(&person_id) else {
                log::warn!("embedding row for unknown person {}", person_id);
                continue;
            };
            match serde_json::from_str::<Embedding>(&json) {
                Ok(embedding) => record.embeddings.push(embedding),
                Err(e) => log::warn!("skipping corrupt embedding for {}: {}", person_id, e),
            }
        }
        Ok(records.into_values().collect())
    }
}
