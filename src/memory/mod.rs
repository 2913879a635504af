//! The short-term memory window: a bounded, time-ordered buffer of recent
//! interaction summaries. Entries are appended on every interaction, evicted
//! oldest-first past a size or age threshold, and marked consolidated once
//! folded into a narrative phase (after which they are prune-eligible).

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use uuid::Uuid;

use crate::config::MemoryConfig;
use crate::{AgentError, CoreResult};

/// One raw interaction summary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryEntry {
    pub id: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub consolidated: bool,
}

impl MemoryEntry {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            content: content.into(),
            created_at: Utc::now(),
            consolidated: false,
        }
    }
}

/// Bounded recency buffer over [`MemoryEntry`].
///
/// Insertion order is arrival order; reads are newest-first. Eviction never
/// races consolidation because the agent owns the window behind one lock.
pub struct MemoryWindow {
    entries: VecDeque<MemoryEntry>,
    config: MemoryConfig,
}

impl MemoryWindow {
    pub fn new(config: MemoryConfig) -> Self {
        Self {
            entries: VecDeque::new(),
            config,
        }
    }

    /// Rebuild a window from persisted entries (oldest first), applying the
    /// same bounds as live appends.
    pub fn from_entries(config: MemoryConfig, entries: Vec<MemoryEntry>) -> Self {
        let mut window = Self::new(config);
        for entry in entries {
            window.entries.push_back(entry);
        }
        window.prune();
        window
    }

    /// Append one entry in arrival order, then prune.
    pub fn append(&mut self, entry: MemoryEntry) -> CoreResult<()> {
        if entry.content.trim().is_empty() {
            return Err(AgentError::Validation(
                "memory content must not be empty".to_string(),
            ));
        }

        self.entries.push_back(entry);
        self.prune();
        Ok(())
    }

    fn prune(&mut self) {
        while self.entries.len() > self.config.max_entries {
            self.entries.pop_front();
        }

        let cutoff = Utc::now() - ChronoDuration::hours(self.config.retention_hours);
        while self
            .entries
            .front()
            .map(|e| e.created_at < cutoff)
            .unwrap_or(false)
        {
            self.entries.pop_front();
        }
    }

    /// Newest-first view, bounded to the prompt window size.
    pub fn current_window(&self) -> impl Iterator<Item = &MemoryEntry> {
        self.entries.iter().rev().take(self.config.prompt_window)
    }

    /// All entries not yet folded into a phase, oldest first.
    pub fn unconsolidated(&self) -> Vec<&MemoryEntry> {
        self.entries.iter().filter(|e| !e.consolidated).collect()
    }

    /// Flag entries as consolidated. Idempotent: already-consolidated and
    /// unknown ids are no-ops.
    pub fn mark_consolidated(&mut self, ids: &[String]) {
        for entry in self.entries.iter_mut() {
            if ids.iter().any(|id| id == &entry.id) {
                entry.consolidated = true;
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
