//! Folds the memory window and a closing phase into a durable summary batch.
//!
//! Ordering is the whole point here: the batch row is written and the source
//! memories are marked consolidated *before* the phase flips to closed. A
//! crash or write failure at any step leaves the phase active and every
//! memory unconsolidated-or-already-folded, never half of each.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

use crate::llm_client::GenerationService;
use crate::memory::{MemoryEntry, MemoryWindow};
use crate::prompts;
use crate::store::NarrativeStore;
use crate::{AgentError, CoreResult};

use super::{PhaseStatus, StoryCircle};

/// Snapshot of which memory set was merged and when. One row per
/// (circle, phase); consolidation re-runs overwrite rather than duplicate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsolidatedMemoryBatch {
    pub id: String,
    pub story_circle_id: String,
    pub phase_name: String,
    /// JSON array of `{id, content}` for the folded entries.
    pub memories_json: String,
    pub summary: String,
    pub updated_at: DateTime<Utc>,
}

impl ConsolidatedMemoryBatch {
    pub fn new(
        story_circle_id: impl Into<String>,
        phase_name: impl Into<String>,
        memories_json: impl Into<String>,
        summary: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            story_circle_id: story_circle_id.into(),
            phase_name: phase_name.into(),
            memories_json: memories_json.into(),
            summary: summary.into(),
            updated_at: Utc::now(),
        }
    }

    /// The memory entry ids referenced by this batch.
    pub fn memory_ids(&self) -> Vec<String> {
        serde_json::from_str::<Vec<FoldedMemory>>(&self.memories_json)
            .map(|folded| folded.into_iter().map(|f| f.id).collect())
            .unwrap_or_default()
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct FoldedMemory {
    id: String,
    content: String,
}

#[derive(Debug, PartialEq, Eq)]
pub enum ConsolidationOutcome {
    /// The phase was already closed; nothing was touched.
    AlreadyClosed,
    /// The phase closed; these memory ids were folded into the batch.
    Consolidated { memory_ids: Vec<String> },
}

pub struct ConsolidationEngine {
    store: Arc<dyn NarrativeStore>,
    generation: Arc<dyn GenerationService>,
    max_retries: u32,
}

impl ConsolidationEngine {
    pub fn new(
        store: Arc<dyn NarrativeStore>,
        generation: Arc<dyn GenerationService>,
        max_retries: u32,
    ) -> Self {
        Self {
            store,
            generation,
            max_retries: max_retries.max(1),
        }
    }

    /// Consolidate the phase at `phase_idx`:
    /// select unconsolidated memories, summarize them together with the
    /// phase's events, write the batch, mark the memories, then close the
    /// phase in memory (the caller persists the circle).
    ///
    /// The summary call is not assumed idempotent, so each retry restarts
    /// from the summary step; attempts are bounded and logged. Any durable
    /// failure surfaces as `Consolidation` with the phase still active.
    pub async fn consolidate(
        &self,
        circle: &mut StoryCircle,
        phase_idx: usize,
        window: &mut MemoryWindow,
    ) -> CoreResult<ConsolidationOutcome> {
        let phase = circle
            .phases
            .get(phase_idx)
            .ok_or_else(|| AgentError::InvalidState(format!("no phase at index {phase_idx}")))?;

        // Idempotence is checked via phase status, not time.
        if phase.status == PhaseStatus::Closed {
            tracing::debug!(phase = %phase.name, "Phase already closed, consolidation is a no-op");
            return Ok(ConsolidationOutcome::AlreadyClosed);
        }

        let memories = self
            .store
            .unconsolidated_memories()
            .map_err(|e| AgentError::Consolidation(format!("failed to load memories: {e}")))?;
        let memory_ids: Vec<String> = memories.iter().map(|m| m.id.clone()).collect();

        let mut last_error = String::new();
        for attempt in 1..=self.max_retries {
            match self.fold_once(circle, phase_idx, &memories).await {
                Ok(()) => {
                    // Both durable steps succeeded; only now does the phase
                    // close.
                    circle.phases[phase_idx].status = PhaseStatus::Closed;
                    window.mark_consolidated(&memory_ids);
                    tracing::info!(
                        phase = %circle.phases[phase_idx].name,
                        folded = memory_ids.len(),
                        "Consolidated phase into memory batch"
                    );
                    return Ok(ConsolidationOutcome::Consolidated { memory_ids });
                }
                Err(e) => {
                    tracing::warn!(
                        attempt,
                        max = self.max_retries,
                        "Consolidation attempt failed: {}",
                        e
                    );
                    last_error = e.to_string();
                }
            }
        }

        Err(AgentError::Consolidation(format!(
            "gave up after {} attempts: {last_error}",
            self.max_retries
        )))
    }

    /// One attempt at steps (b)-(d): summary, batch write, memory marks.
    async fn fold_once(
        &self,
        circle: &StoryCircle,
        phase_idx: usize,
        memories: &[MemoryEntry],
    ) -> anyhow::Result<()> {
        let phase = &circle.phases[phase_idx];

        let request = prompts::consolidation_prompt(phase, memories);
        let summary = self.generation.generate(&request).await?;
        let summary = summary.trim();
        if summary.is_empty() {
            anyhow::bail!("summary generation returned empty text");
        }

        let folded: Vec<FoldedMemory> = memories
            .iter()
            .map(|m| FoldedMemory {
                id: m.id.clone(),
                content: m.content.clone(),
            })
            .collect();
        let memories_json = serde_json::to_string(&folded)?;

        let batch =
            ConsolidatedMemoryBatch::new(circle.id.clone(), phase.name.clone(), memories_json, summary);

        // Durable write first; if this fails nothing is observable.
        self.store.save_consolidated_batch(&batch)?;

        let ids: Vec<String> = memories.iter().map(|m| m.id.clone()).collect();
        self.store.mark_memories_consolidated(&ids)?;

        Ok(())
    }
}
