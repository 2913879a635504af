//! Story-circle narrative state machine.
//!
//! A persona's long-running story is a sequence of [`StoryCircle`]s, each
//! holding the eight Harmon phases in order. Exactly one circle is current
//! and exactly one of its phases is active; phases close strictly forward.
//! Closing a phase runs the consolidation pipeline (see [`consolidation`])
//! before the next phase may activate.

pub mod consolidation;

use anyhow::Result;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

use crate::config::NarrativeConfig;
use crate::llm_client::{extract_json, GenerationService};
use crate::memory::MemoryWindow;
use crate::prompts;
use crate::store::NarrativeStore;
use crate::{AgentError, CoreResult};

use consolidation::ConsolidationEngine;

/// Dan Harmon's story circle, in canonical order.
pub const PHASE_NAMES: [&str; 8] = [
    "You", "Need", "Go", "Search", "Find", "Take", "Return", "Change",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseStatus {
    Pending,
    Active,
    Closed,
}

impl PhaseStatus {
    pub fn as_db_str(self) -> &'static str {
        match self {
            PhaseStatus::Pending => "pending",
            PhaseStatus::Active => "active",
            PhaseStatus::Closed => "closed",
        }
    }

    pub fn from_db(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "active" => PhaseStatus::Active,
            "closed" => PhaseStatus::Closed,
            _ => PhaseStatus::Pending,
        }
    }
}

/// Something that happened to the persona. Immutable once recorded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub description: String,
    #[serde(default)]
    pub emotional_tag: Option<String>,
    /// IDs of the memory entries this event was distilled from.
    #[serde(default)]
    pub source_interaction_refs: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Phase {
    pub name: String,
    #[serde(default)]
    pub events: Vec<Event>,
    #[serde(default)]
    pub inner_dialogues: Vec<String>,
    pub status: PhaseStatus,
}

impl Phase {
    fn pending(name: &str) -> Self {
        Self {
            name: name.to_string(),
            events: Vec::new(),
            inner_dialogues: Vec::new(),
            status: PhaseStatus::Pending,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoryCircle {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub is_current: bool,
    pub phases: Vec<Phase>,
}

impl StoryCircle {
    /// A fresh circle with all eight phases, the first already active.
    pub fn fresh() -> Self {
        let mut phases: Vec<Phase> = PHASE_NAMES.iter().map(|n| Phase::pending(n)).collect();
        phases[0].status = PhaseStatus::Active;
        Self {
            id: Uuid::new_v4().to_string(),
            created_at: Utc::now(),
            is_current: true,
            phases,
        }
    }

    pub fn active_phase_index(&self) -> Option<usize> {
        self.phases
            .iter()
            .position(|p| p.status == PhaseStatus::Active)
    }

    pub fn active_phase(&self) -> Option<&Phase> {
        self.active_phase_index().map(|i| &self.phases[i])
    }

    pub fn active_phase_mut(&mut self) -> Option<&mut Phase> {
        self.active_phase_index().map(move |i| &mut self.phases[i])
    }
}

/// Read-only snapshot handed to the response composer.
#[derive(Debug, Clone, Default)]
pub struct NarrativeContext {
    pub active_phase_name: String,
    pub recent_events: Vec<String>,
    pub mood_hint: String,
}

/// Accumulated progress of the active phase, as seen by an advance policy.
#[derive(Debug, Clone, Copy)]
pub struct PhaseProgress {
    pub interactions: u32,
    pub activated_at: DateTime<Utc>,
    pub now: DateTime<Utc>,
}

/// Decides when the active phase has run its course.
///
/// The trigger condition is deliberately pluggable: interaction volume,
/// elapsed time, and explicit operator signals are all legitimate rules.
pub trait AdvancePolicy: Send + Sync {
    fn due(&self, progress: &PhaseProgress) -> bool;
}

/// Advance once a phase has absorbed `threshold` interactions.
pub struct InteractionCountPolicy {
    pub threshold: u32,
}

impl AdvancePolicy for InteractionCountPolicy {
    fn due(&self, progress: &PhaseProgress) -> bool {
        progress.interactions >= self.threshold
    }
}

/// Advance once a phase has been active for a fixed duration.
pub struct ElapsedTimePolicy {
    pub max_phase_age: ChronoDuration,
}

impl AdvancePolicy for ElapsedTimePolicy {
    fn due(&self, progress: &PhaseProgress) -> bool {
        progress.now - progress.activated_at >= self.max_phase_age
    }
}

#[derive(Debug, Deserialize)]
struct PhaseSeed {
    #[serde(default)]
    inner_dialogues: Vec<String>,
}

/// Owns the current story circle and serializes every transition.
///
/// Callers must route all mutations (`record_event`, `advance_if_due`)
/// through a single writer scope; `current_context` is safe alongside
/// concurrent event recording but not alongside an in-flight consolidation.
/// The agent enforces this with one `RwLock` around the engine.
pub struct NarrativeEngine {
    circle: StoryCircle,
    interactions_in_phase: u32,
    phase_activated_at: DateTime<Utc>,
    advance_requested: bool,
    policy: Box<dyn AdvancePolicy>,
    store: Arc<dyn NarrativeStore>,
    generation: Arc<dyn GenerationService>,
    consolidator: ConsolidationEngine,
    config: NarrativeConfig,
    persona_name: String,
}

impl NarrativeEngine {
    /// Resume the persisted current circle, or start a fresh one.
    pub fn load_or_create(
        store: Arc<dyn NarrativeStore>,
        generation: Arc<dyn GenerationService>,
        policy: Box<dyn AdvancePolicy>,
        config: NarrativeConfig,
        persona_name: String,
    ) -> Result<Self> {
        let circle = match store.current_story_circle()? {
            Some(circle) => {
                tracing::info!(
                    circle_id = %circle.id,
                    phase = circle.active_phase().map(|p| p.name.as_str()).unwrap_or("none"),
                    "Resumed story circle"
                );
                circle
            }
            None => {
                let circle = StoryCircle::fresh();
                store.save_story_circle(&circle)?;
                tracing::info!(circle_id = %circle.id, "Started new story circle");
                circle
            }
        };

        let consolidator = ConsolidationEngine::new(
            store.clone(),
            generation.clone(),
            config.consolidation_max_retries,
        );

        // Phase progress survives restarts: every interaction recorded an
        // event, so the resumed counter is the active phase's event count.
        let interactions_in_phase = circle
            .active_phase()
            .map(|p| p.events.len() as u32)
            .unwrap_or(0);

        Ok(Self {
            circle,
            interactions_in_phase,
            phase_activated_at: Utc::now(),
            advance_requested: false,
            policy,
            store,
            generation,
            consolidator,
            config,
            persona_name,
        })
    }

    /// Append an event to the active phase and bump the interaction counter.
    ///
    /// Fails with `Validation` on an empty description and `InvalidState`
    /// when no phase is active. Events never land in a closed phase.
    pub fn record_event(
        &mut self,
        description: &str,
        emotional_tag: Option<String>,
        source_refs: Vec<String>,
    ) -> CoreResult<()> {
        if description.trim().is_empty() {
            return Err(AgentError::Validation(
                "event description must not be empty".to_string(),
            ));
        }

        let phase = self
            .circle
            .active_phase_mut()
            .ok_or_else(|| AgentError::InvalidState("no active phase".to_string()))?;

        phase.events.push(Event {
            description: description.trim().to_string(),
            emotional_tag,
            source_interaction_refs: source_refs,
        });
        self.interactions_in_phase += 1;

        self.store.save_story_circle(&self.circle)?;
        Ok(())
    }

    /// Force the next `advance_if_due` call to fire regardless of policy.
    pub fn signal_advance(&mut self) {
        self.advance_requested = true;
    }

    /// Evaluate the advance policy and, when due, run the full
    /// close → consolidate → activate-next chain. Returns whether an
    /// advance occurred.
    ///
    /// Consolidation failure aborts the chain: the phase stays active, its
    /// events stay put, and a later call retries from the top.
    pub async fn advance_if_due(&mut self, window: &mut MemoryWindow) -> CoreResult<bool> {
        let progress = PhaseProgress {
            interactions: self.interactions_in_phase,
            activated_at: self.phase_activated_at,
            now: Utc::now(),
        };

        if !self.advance_requested && !self.policy.due(&progress) {
            return Ok(false);
        }

        let active_idx = self
            .circle
            .active_phase_index()
            .ok_or_else(|| AgentError::InvalidState("no active phase to advance".to_string()))?;

        // Fold the closing phase and the memory window into a durable batch.
        // This flips the phase to Closed only after the batch write and the
        // consolidation marks both succeeded.
        self.consolidator
            .consolidate(&mut self.circle, active_idx, window)
            .await?;

        // Stage the rest of the transition in memory, then persist it with a
        // single save: close + activate-next land together, or (on the last
        // phase) the fresh circle replaces the old current row atomically.
        let next_idx = active_idx + 1;
        let completed_circle = if next_idx < self.circle.phases.len() {
            self.circle.phases[next_idx].status = PhaseStatus::Active;
            None
        } else {
            Some(std::mem::replace(&mut self.circle, StoryCircle::fresh()))
        };

        if let Err(e) = self.store.save_story_circle(&self.circle) {
            // Roll back so the phase is observably still active and a later
            // call retries the whole transition (the batch upsert and the
            // consolidation marks are idempotent on the re-run).
            match completed_circle {
                Some(old) => {
                    self.circle = old;
                    self.circle.phases[active_idx].status = PhaseStatus::Active;
                }
                None => {
                    self.circle.phases[next_idx].status = PhaseStatus::Pending;
                    self.circle.phases[active_idx].status = PhaseStatus::Active;
                }
            }
            return Err(AgentError::Consolidation(format!(
                "failed to persist phase transition: {e}"
            )));
        }

        match completed_circle {
            Some(old) => {
                tracing::info!(
                    old_circle = %old.id,
                    new_circle = %self.circle.id,
                    "Story circle complete, starting a new one"
                );
            }
            None => {
                tracing::info!(
                    phase = %self.circle.phases[next_idx].name,
                    "Advanced to next narrative phase"
                );
            }
        }

        self.interactions_in_phase = 0;
        self.phase_activated_at = Utc::now();
        self.advance_requested = false;

        if self.config.seed_new_phases {
            self.seed_active_phase().await;
        }

        Ok(true)
    }

    /// Ask the generation service for fresh inner-dialogue lines for the
    /// newly active phase. Best-effort: the narrative is already in a valid
    /// state, so parse failures only cost flavor.
    async fn seed_active_phase(&mut self) {
        let Some(phase_name) = self.circle.active_phase().map(|p| p.name.clone()) else {
            return;
        };

        let recent_summaries: Vec<String> = match self.store.list_consolidated_batches() {
            Ok(batches) => batches.into_iter().rev().take(3).map(|b| b.summary).collect(),
            Err(e) => {
                tracing::warn!("Could not load batch summaries for seeding: {}", e);
                Vec::new()
            }
        };

        let request = prompts::phase_seed_prompt(
            &self.persona_name,
            &phase_name,
            &recent_summaries,
            self.config.seed_event_count,
        );

        let raw = match self.generation.generate(&request).await {
            Ok(raw) => raw,
            Err(e) => {
                tracing::warn!(phase = %phase_name, "Phase seeding generation failed: {}", e);
                return;
            }
        };

        match extract_json::<PhaseSeed>(&raw) {
            Ok(seed) if !seed.inner_dialogues.is_empty() => {
                let count = seed.inner_dialogues.len();
                if let Some(phase) = self.circle.active_phase_mut() {
                    phase.inner_dialogues = seed.inner_dialogues;
                }
                if let Err(e) = self.store.save_story_circle(&self.circle) {
                    tracing::warn!("Failed to persist seeded phase: {}", e);
                }
                tracing::debug!(phase = %phase_name, count, "Seeded inner dialogues");
            }
            Ok(_) => {
                tracing::debug!(phase = %phase_name, "Seed response held no dialogues, phase starts empty");
            }
            Err(e) => {
                tracing::warn!(phase = %phase_name, "Could not parse phase seed: {}", e);
            }
        }
    }

    /// Read-only context for prompt construction. Never mutates.
    pub fn current_context(&self) -> NarrativeContext {
        let Some(phase) = self.circle.active_phase() else {
            return NarrativeContext::default();
        };

        let recent_events = phase
            .events
            .iter()
            .rev()
            .take(3)
            .map(|e| e.description.clone())
            .collect::<Vec<_>>();

        let mood_hint = phase
            .inner_dialogues
            .last()
            .cloned()
            .or_else(|| phase.events.iter().rev().find_map(|e| e.emotional_tag.clone()))
            .unwrap_or_default();

        NarrativeContext {
            active_phase_name: phase.name.clone(),
            recent_events,
            mood_hint,
        }
    }

    pub fn circle(&self) -> &StoryCircle {
        &self.circle
    }

    pub fn interactions_in_phase(&self) -> u32 {
        self.interactions_in_phase
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MemoryConfig;
    use crate::llm_client::PromptRequest;
    use crate::store::SqliteStore;
    use async_trait::async_trait;

    struct CannedGen(&'static str);

    #[async_trait]
    impl GenerationService for CannedGen {
        async fn generate(&self, _request: &PromptRequest) -> Result<String> {
            Ok(self.0.to_string())
        }
    }

    fn engine_with(store: Arc<dyn NarrativeStore>, threshold: u32) -> NarrativeEngine {
        let config = NarrativeConfig {
            phase_advance_threshold: threshold,
            seed_new_phases: false,
            ..NarrativeConfig::default()
        };
        NarrativeEngine::load_or_create(
            store,
            Arc::new(CannedGen("a tidy chapter summary")),
            Box::new(InteractionCountPolicy { threshold }),
            config,
            "Loom".to_string(),
        )
        .unwrap()
    }

    #[test]
    fn fresh_circle_has_eight_phases_first_active() {
        let circle = StoryCircle::fresh();
        assert_eq!(circle.phases.len(), 8);
        assert_eq!(circle.phases[0].status, PhaseStatus::Active);
        assert!(circle.phases[1..]
            .iter()
            .all(|p| p.status == PhaseStatus::Pending));
        assert_eq!(circle.phases[0].name, "You");
        assert_eq!(circle.phases[7].name, "Change");
        assert!(circle.is_current);
    }

    #[test]
    fn phase_status_db_roundtrip() {
        for status in [PhaseStatus::Pending, PhaseStatus::Active, PhaseStatus::Closed] {
            assert_eq!(PhaseStatus::from_db(status.as_db_str()), status);
        }
        assert_eq!(PhaseStatus::from_db("garbage"), PhaseStatus::Pending);
    }

    #[test]
    fn interaction_count_policy_fires_at_threshold() {
        let policy = InteractionCountPolicy { threshold: 5 };
        let mut progress = PhaseProgress {
            interactions: 4,
            activated_at: Utc::now(),
            now: Utc::now(),
        };
        assert!(!policy.due(&progress));
        progress.interactions = 5;
        assert!(policy.due(&progress));
    }

    #[test]
    fn elapsed_time_policy_fires_after_age() {
        let policy = ElapsedTimePolicy {
            max_phase_age: ChronoDuration::hours(6),
        };
        let now = Utc::now();
        let young = PhaseProgress {
            interactions: 0,
            activated_at: now - ChronoDuration::hours(1),
            now,
        };
        let old = PhaseProgress {
            interactions: 0,
            activated_at: now - ChronoDuration::hours(7),
            now,
        };
        assert!(!policy.due(&young));
        assert!(policy.due(&old));
    }

    #[test]
    fn record_event_rejects_empty_description() {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let mut engine = engine_with(store, 10);
        let err = engine.record_event("   ", None, vec![]).unwrap_err();
        assert!(matches!(err, AgentError::Validation(_)));
        assert_eq!(engine.interactions_in_phase(), 0);
    }

    #[test]
    fn record_event_without_active_phase_is_invalid_state() {
        let store = Arc::new(SqliteStore::in_memory().unwrap());

        // Persist a doctored circle whose first phase never activated.
        let mut circle = StoryCircle::fresh();
        circle.phases[0].status = PhaseStatus::Pending;
        store.save_story_circle(&circle).unwrap();

        let mut engine = engine_with(store, 10);
        let err = engine
            .record_event("something happened", None, vec![])
            .unwrap_err();
        assert!(matches!(err, AgentError::InvalidState(_)));
    }

    #[test]
    fn load_or_create_resumes_persisted_circle() {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let first = engine_with(store.clone(), 10);
        let first_id = first.circle().id.clone();
        drop(first);

        let resumed = engine_with(store, 10);
        assert_eq!(resumed.circle().id, first_id);
    }

    #[tokio::test]
    async fn completing_the_last_phase_starts_a_fresh_circle() {
        let store: Arc<dyn NarrativeStore> = Arc::new(SqliteStore::in_memory().unwrap());
        let mut engine = engine_with(store.clone(), 1);
        let mut window = MemoryWindow::new(MemoryConfig::default());
        let original_id = engine.circle().id.clone();

        // Walk the circle end to end: one interaction per phase.
        for i in 0..8 {
            engine
                .record_event(&format!("chapter beat {i}"), None, vec![])
                .unwrap();
            assert!(engine.advance_if_due(&mut window).await.unwrap());
        }

        assert_ne!(engine.circle().id, original_id);
        assert_eq!(engine.circle().phases[0].status, PhaseStatus::Active);

        // The store agrees: the fresh circle is the single current one.
        let current = store.current_story_circle().unwrap().unwrap();
        assert_eq!(current.id, engine.circle().id);
        assert_eq!(store.list_consolidated_batches().unwrap().len(), 8);
    }

    /// Store wrapper whose circle saves can be made to fail on demand.
    struct FailingCircleSaveStore {
        inner: SqliteStore,
        fail_save: std::sync::atomic::AtomicBool,
    }

    impl FailingCircleSaveStore {
        fn new() -> Self {
            Self {
                inner: SqliteStore::in_memory().unwrap(),
                fail_save: std::sync::atomic::AtomicBool::new(false),
            }
        }
    }

    impl NarrativeStore for FailingCircleSaveStore {
        fn current_story_circle(&self) -> Result<Option<StoryCircle>> {
            self.inner.current_story_circle()
        }
        fn save_story_circle(&self, circle: &StoryCircle) -> Result<()> {
            if self.fail_save.load(std::sync::atomic::Ordering::SeqCst) {
                anyhow::bail!("simulated save timeout");
            }
            self.inner.save_story_circle(circle)
        }
        fn append_memory(&self, entry: &crate::memory::MemoryEntry) -> Result<()> {
            self.inner.append_memory(entry)
        }
        fn unconsolidated_memories(&self) -> Result<Vec<crate::memory::MemoryEntry>> {
            self.inner.unconsolidated_memories()
        }
        fn recent_memories(&self, limit: usize) -> Result<Vec<crate::memory::MemoryEntry>> {
            self.inner.recent_memories(limit)
        }
        fn mark_memories_consolidated(&self, ids: &[String]) -> Result<()> {
            self.inner.mark_memories_consolidated(ids)
        }
        fn save_consolidated_batch(
            &self,
            batch: &consolidation::ConsolidatedMemoryBatch,
        ) -> Result<()> {
            self.inner.save_consolidated_batch(batch)
        }
        fn list_consolidated_batches(&self) -> Result<Vec<consolidation::ConsolidatedMemoryBatch>> {
            self.inner.list_consolidated_batches()
        }
        fn is_duplicate_message(&self, platform_id: &str) -> Result<bool> {
            self.inner.is_duplicate_message(platform_id)
        }
        fn record_processed_message(&self, platform_id: &str) -> Result<()> {
            self.inner.record_processed_message(platform_id)
        }
    }

    #[tokio::test]
    async fn failed_transition_persist_keeps_phase_active_and_retries() {
        use std::sync::atomic::Ordering;

        let store = Arc::new(FailingCircleSaveStore::new());
        let mut engine = engine_with(store.clone(), 1);
        let mut window = MemoryWindow::new(MemoryConfig::default());

        engine.record_event("met a heron", None, vec![]).unwrap();

        store.fail_save.store(true, Ordering::SeqCst);
        let err = engine.advance_if_due(&mut window).await.unwrap_err();
        assert!(matches!(err, AgentError::Consolidation(_)));

        // The transition rolled back: the phase is observably still active
        // and recording keeps working.
        assert_eq!(engine.circle().phases[0].status, PhaseStatus::Active);
        assert!(engine.circle().active_phase().is_some());
        assert_eq!(engine.circle().phases[1].status, PhaseStatus::Pending);

        store.fail_save.store(false, Ordering::SeqCst);
        engine.record_event("found a shiny rock", None, vec![]).unwrap();
        assert!(engine.advance_if_due(&mut window).await.unwrap());

        assert_eq!(engine.circle().phases[0].status, PhaseStatus::Closed);
        assert_eq!(engine.circle().phases[1].status, PhaseStatus::Active);
        assert_eq!(store.list_consolidated_batches().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn failed_circle_rollover_persist_keeps_old_circle_active() {
        use std::sync::atomic::Ordering;

        let store = Arc::new(FailingCircleSaveStore::new());
        let mut engine = engine_with(store.clone(), 1);
        let mut window = MemoryWindow::new(MemoryConfig::default());
        let original_id = engine.circle().id.clone();

        // Close the first seven phases so "Change" is active.
        for i in 0..7 {
            engine
                .record_event(&format!("chapter beat {i}"), None, vec![])
                .unwrap();
            assert!(engine.advance_if_due(&mut window).await.unwrap());
        }
        assert_eq!(engine.circle().phases[7].status, PhaseStatus::Active);

        engine.record_event("the last beat", None, vec![]).unwrap();
        store.fail_save.store(true, Ordering::SeqCst);
        let err = engine.advance_if_due(&mut window).await.unwrap_err();
        assert!(matches!(err, AgentError::Consolidation(_)));

        // Still on the old circle, last phase still active.
        assert_eq!(engine.circle().id, original_id);
        assert_eq!(engine.circle().phases[7].status, PhaseStatus::Active);

        store.fail_save.store(false, Ordering::SeqCst);
        assert!(engine.advance_if_due(&mut window).await.unwrap());
        assert_ne!(engine.circle().id, original_id);
        assert_eq!(engine.circle().phases[0].status, PhaseStatus::Active);
    }

    #[tokio::test]
    async fn resume_restores_phase_progress() {
        let store: Arc<dyn NarrativeStore> = Arc::new(SqliteStore::in_memory().unwrap());
        let mut first = engine_with(store.clone(), 5);
        for i in 0..3 {
            first
                .record_event(&format!("before restart {i}"), None, vec![])
                .unwrap();
        }
        drop(first);

        let mut engine = engine_with(store.clone(), 5);
        assert_eq!(engine.interactions_in_phase(), 3);

        // Two more interactions cross the threshold on schedule.
        let mut window = MemoryWindow::new(MemoryConfig::default());
        for i in 3..5 {
            engine
                .record_event(&format!("after restart {i}"), None, vec![])
                .unwrap();
        }
        assert!(engine.advance_if_due(&mut window).await.unwrap());
        assert_eq!(engine.circle().phases[0].status, PhaseStatus::Closed);
    }

    #[tokio::test]
    async fn advance_not_due_leaves_phase_untouched() {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let mut engine = engine_with(store, 5);
        let mut window = MemoryWindow::new(MemoryConfig::default());

        engine.record_event("a small moment", None, vec![]).unwrap();
        assert!(!engine.advance_if_due(&mut window).await.unwrap());
        assert_eq!(engine.circle().phases[0].status, PhaseStatus::Active);
        assert_eq!(engine.interactions_in_phase(), 1);
    }
}
