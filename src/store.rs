//! Durable storage for the narrative core: the story-circle snapshot, the
//! raw interaction log, consolidated memory batches, and the processed
//! message dedup set. Raw JSON lives only here; everything above this module
//! works with typed structs.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use std::path::Path;
use std::sync::Mutex;

use crate::memory::MemoryEntry;
use crate::narrative::consolidation::ConsolidatedMemoryBatch;
use crate::narrative::{Phase, StoryCircle};

/// Abstract durable store the core talks to. Pure I/O; no business logic.
pub trait NarrativeStore: Send + Sync {
    /// The single circle flagged current, if any.
    fn current_story_circle(&self) -> Result<Option<StoryCircle>>;

    /// Upsert a circle. When the circle is current, every other circle is
    /// demoted in the same transaction — there is no observable window with
    /// zero or two current circles.
    fn save_story_circle(&self, circle: &StoryCircle) -> Result<()>;

    fn append_memory(&self, entry: &MemoryEntry) -> Result<()>;

    /// Entries not yet folded into a phase, oldest first.
    fn unconsolidated_memories(&self) -> Result<Vec<MemoryEntry>>;

    /// Newest `limit` entries, oldest first (for window rebuild on startup).
    fn recent_memories(&self, limit: usize) -> Result<Vec<MemoryEntry>>;

    /// Idempotent: marking an already-consolidated or unknown id is a no-op.
    fn mark_memories_consolidated(&self, ids: &[String]) -> Result<()>;

    /// Upsert keyed by (circle, phase); a consolidation re-run can never
    /// produce a second batch row for the same phase.
    fn save_consolidated_batch(&self, batch: &ConsolidatedMemoryBatch) -> Result<()>;

    fn list_consolidated_batches(&self) -> Result<Vec<ConsolidatedMemoryBatch>>;

    fn is_duplicate_message(&self, platform_id: &str) -> Result<bool>;

    fn record_processed_message(&self, platform_id: &str) -> Result<()>;
}

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Helper to lock the connection
    fn lock_conn(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| anyhow::anyhow!("Database lock poisoned: {}", e))
    }

    /// Create or open the database
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.ensure_schema()?;
        Ok(store)
    }

    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.ensure_schema()?;
        Ok(store)
    }

    fn ensure_schema(&self) -> Result<()> {
        let conn = self.lock_conn()?;

        conn.execute(
            r#"CREATE TABLE IF NOT EXISTS story_circles (
                id TEXT PRIMARY KEY,
                created_at TEXT NOT NULL,
                is_current INTEGER NOT NULL DEFAULT 0,
                narrative_json TEXT NOT NULL
            )"#,
            [],
        )?;

        conn.execute(
            r#"CREATE TABLE IF NOT EXISTS memory_entries (
                id TEXT PRIMARY KEY,
                content TEXT NOT NULL,
                created_at TEXT NOT NULL,
                consolidated INTEGER NOT NULL DEFAULT 0
            )"#,
            [],
        )?;

        conn.execute(
            r#"CREATE TABLE IF NOT EXISTS consolidated_batches (
                id TEXT PRIMARY KEY,
                story_circle_id TEXT NOT NULL,
                phase_name TEXT NOT NULL,
                memories_json TEXT NOT NULL,
                summary TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                UNIQUE(story_circle_id, phase_name)
            )"#,
            [],
        )?;

        conn.execute(
            r#"CREATE TABLE IF NOT EXISTS processed_messages (
                platform_message_id TEXT PRIMARY KEY
            )"#,
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_memory_entries_created_at
             ON memory_entries(created_at DESC)",
            [],
        )?;

        Ok(())
    }
}

impl NarrativeStore for SqliteStore {
    fn current_story_circle(&self) -> Result<Option<StoryCircle>> {
        let conn = self.lock_conn()?;
        let result = conn.query_row(
            "SELECT id, created_at, narrative_json FROM story_circles WHERE is_current = 1",
            [],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                ))
            },
        );

        match result {
            Ok((id, created_at, narrative_json)) => {
                let phases: Vec<Phase> = serde_json::from_str(&narrative_json)
                    .context("Failed to deserialize narrative phases")?;
                Ok(Some(StoryCircle {
                    id,
                    created_at: parse_rfc3339(&created_at)?,
                    is_current: true,
                    phases,
                }))
            }
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn save_story_circle(&self, circle: &StoryCircle) -> Result<()> {
        let narrative_json = serde_json::to_string(&circle.phases)
            .context("Failed to serialize narrative phases")?;

        let mut conn = self.lock_conn()?;
        let tx = conn.transaction()?;

        if circle.is_current {
            tx.execute(
                "UPDATE story_circles SET is_current = 0 WHERE id != ?1",
                [&circle.id],
            )?;
        }

        tx.execute(
            "INSERT OR REPLACE INTO story_circles (id, created_at, is_current, narrative_json)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                circle.id,
                circle.created_at.to_rfc3339(),
                circle.is_current as i64,
                narrative_json,
            ],
        )?;

        tx.commit()?;
        Ok(())
    }

    fn append_memory(&self, entry: &MemoryEntry) -> Result<()> {
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT OR REPLACE INTO memory_entries (id, content, created_at, consolidated)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                entry.id,
                entry.content,
                entry.created_at.to_rfc3339(),
                entry.consolidated as i64,
            ],
        )?;
        Ok(())
    }

    fn unconsolidated_memories(&self) -> Result<Vec<MemoryEntry>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, content, created_at, consolidated FROM memory_entries
             WHERE consolidated = 0 ORDER BY created_at ASC, id ASC",
        )?;
        let entries = stmt
            .query_map([], row_to_memory_entry)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(entries)
    }

    fn recent_memories(&self, limit: usize) -> Result<Vec<MemoryEntry>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, content, created_at, consolidated FROM memory_entries
             ORDER BY created_at DESC, id DESC LIMIT ?1",
        )?;
        let mut entries = stmt
            .query_map([limit as i64], row_to_memory_entry)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        entries.reverse();
        Ok(entries)
    }

    fn mark_memories_consolidated(&self, ids: &[String]) -> Result<()> {
        let mut conn = self.lock_conn()?;
        let tx = conn.transaction()?;
        {
            let mut stmt =
                tx.prepare("UPDATE memory_entries SET consolidated = 1 WHERE id = ?1")?;
            for id in ids {
                stmt.execute([id])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    fn save_consolidated_batch(&self, batch: &ConsolidatedMemoryBatch) -> Result<()> {
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT OR REPLACE INTO consolidated_batches
             (id, story_circle_id, phase_name, memories_json, summary, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                batch.id,
                batch.story_circle_id,
                batch.phase_name,
                batch.memories_json,
                batch.summary,
                batch.updated_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    fn list_consolidated_batches(&self) -> Result<Vec<ConsolidatedMemoryBatch>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, story_circle_id, phase_name, memories_json, summary, updated_at
             FROM consolidated_batches ORDER BY updated_at ASC",
        )?;
        let batches = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(5)?,
                ))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        batches
            .into_iter()
            .map(|(id, story_circle_id, phase_name, memories_json, summary, updated_at)| {
                Ok(ConsolidatedMemoryBatch {
                    id,
                    story_circle_id,
                    phase_name,
                    memories_json,
                    summary,
                    updated_at: parse_rfc3339(&updated_at)?,
                })
            })
            .collect()
    }

    fn is_duplicate_message(&self, platform_id: &str) -> Result<bool> {
        let conn = self.lock_conn()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM processed_messages WHERE platform_message_id = ?1",
            [platform_id],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    fn record_processed_message(&self, platform_id: &str) -> Result<()> {
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT OR IGNORE INTO processed_messages (platform_message_id) VALUES (?1)",
            [platform_id],
        )?;
        Ok(())
    }
}

fn row_to_memory_entry(row: &rusqlite::Row<'_>) -> rusqlite::Result<MemoryEntry> {
    let created_at: String = row.get(2)?;
    Ok(MemoryEntry {
        id: row.get(0)?,
        content: row.get(1)?,
        created_at: created_at.parse().map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(2, rusqlite::types::Type::Text, Box::new(e))
        })?,
        consolidated: row.get::<_, i64>(3)? != 0,
    })
}

fn parse_rfc3339(value: &str) -> Result<DateTime<Utc>> {
    value
        .parse()
        .with_context(|| format!("Invalid timestamp in store: {value}"))
}
