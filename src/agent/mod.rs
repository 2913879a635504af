//! The orchestrator: ties dedup, memory, narrative, composition, and
//! generation into one message-handling entry point for platform adapters.

use flume::Sender;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::time::{sleep, Duration};

use crate::composer::ResponseComposer;
use crate::config::AgentConfig;
use crate::llm_client::GenerationService;
use crate::memory::{MemoryEntry, MemoryWindow};
use crate::narrative::{InteractionCountPolicy, NarrativeContext, NarrativeEngine};
use crate::store::NarrativeStore;
use crate::{AgentError, CoreResult};

/// Notifications emitted towards the embedding process (UI, metrics glue,
/// whatever is listening). Dropped silently when nobody is.
#[derive(Debug, Clone)]
pub enum AgentEvent {
    ReplySent {
        platform_message_id: String,
        reply: String,
    },
    PhaseAdvanced {
        phase_name: String,
    },
    ConsolidationDeferred {
        reason: String,
    },
    Error(String),
}

pub struct Agent {
    store: Arc<dyn NarrativeStore>,
    generation: Arc<dyn GenerationService>,
    composer: ResponseComposer,
    /// Single mutual-exclusion scope for narrative transitions. Context
    /// reads take the read half; event recording and the whole
    /// evaluate → consolidate → flip sequence take the write half.
    narrative: RwLock<NarrativeEngine>,
    window: RwLock<MemoryWindow>,
    config: AgentConfig,
    event_tx: Sender<AgentEvent>,
}

impl Agent {
    /// Build the agent from durable state: resume the current story circle
    /// and rebuild the memory window from the recent end of the log.
    pub fn bootstrap(
        config: AgentConfig,
        store: Arc<dyn NarrativeStore>,
        generation: Arc<dyn GenerationService>,
        event_tx: Sender<AgentEvent>,
    ) -> anyhow::Result<Self> {
        let recent = store.recent_memories(config.memory.max_entries)?;
        let window = MemoryWindow::from_entries(config.memory.clone(), recent);

        let policy = Box::new(InteractionCountPolicy {
            threshold: config.narrative.phase_advance_threshold,
        });
        let narrative = NarrativeEngine::load_or_create(
            store.clone(),
            generation.clone(),
            policy,
            config.narrative.clone(),
            config.persona_name.clone(),
        )?;

        let composer = ResponseComposer::new(
            config.persona_name.clone(),
            config.persona_description.clone(),
            config.composer.clone(),
        );

        Ok(Self {
            store,
            generation,
            composer,
            narrative: RwLock::new(narrative),
            window: RwLock::new(window),
            config,
            event_tx,
        })
    }

    /// Handle one inbound platform message end to end and return the reply
    /// text. Platform adapters must await this before proceeding.
    ///
    /// Non-benign failures are also surfaced as [`AgentEvent::Error`] for
    /// whatever is listening on the event channel.
    pub async fn handle_message(
        &self,
        platform_message_id: &str,
        user_text: &str,
        sender: &str,
    ) -> CoreResult<String> {
        match self.process_message(platform_message_id, user_text, sender).await {
            Ok(reply) => Ok(reply),
            Err(e) => {
                if !e.is_benign() {
                    let _ = self.event_tx.send(AgentEvent::Error(e.to_string()));
                }
                Err(e)
            }
        }
    }

    async fn process_message(
        &self,
        platform_message_id: &str,
        user_text: &str,
        sender: &str,
    ) -> CoreResult<String> {
        if self.store.is_duplicate_message(platform_message_id)? {
            return Err(AgentError::DuplicateMessage(platform_message_id.to_string()));
        }

        // Read-only context gathering; safe alongside concurrent recording.
        let narrative_ctx = self.narrative.read().await.current_context();
        let memories: Vec<String> = self
            .window
            .read()
            .await
            .current_window()
            .map(|e| e.content.clone())
            .collect();

        let request = self.composer.compose(user_text, &narrative_ctx, &memories)?;
        let reply = self.generate_reply(request, user_text).await?;

        self.store.record_processed_message(platform_message_id)?;

        let entry = MemoryEntry::new(format!(
            "{sender}: {user_text} / {}: {reply}",
            self.config.persona_name
        ));
        let memory_id = entry.id.clone();
        self.store.append_memory(&entry)?;
        self.window.write().await.append(entry)?;

        // Mutations and the advance evaluation run under the write half;
        // consolidation cannot interleave with event recording.
        {
            let mut narrative = self.narrative.write().await;
            narrative.record_event(
                &interaction_event_description(sender, user_text),
                None,
                vec![memory_id],
            )?;

            let mut window = self.window.write().await;
            match narrative.advance_if_due(&mut window).await {
                Ok(true) => {
                    let phase_name = narrative.current_context().active_phase_name;
                    tracing::info!(phase = %phase_name, "Narrative advanced");
                    let _ = self.event_tx.send(AgentEvent::PhaseAdvanced { phase_name });
                }
                Ok(false) => {}
                Err(e) => {
                    // The reply is already composed and the phase is intact;
                    // the next message re-evaluates the threshold and retries.
                    tracing::warn!("Consolidation deferred: {}", e);
                    let _ = self.event_tx.send(AgentEvent::ConsolidationDeferred {
                        reason: e.to_string(),
                    });
                }
            }
        }

        let _ = self.event_tx.send(AgentEvent::ReplySent {
            platform_message_id: platform_message_id.to_string(),
            reply: reply.clone(),
        });

        Ok(reply)
    }

    /// Call the generation service and validate the reply. One bounded
    /// retry per config, using the simplified prompt, before giving up
    /// with `EmptyResponse`.
    async fn generate_reply(
        &self,
        request: crate::llm_client::PromptRequest,
        user_text: &str,
    ) -> CoreResult<String> {
        match self.try_generate(&request).await {
            Ok(reply) => return Ok(reply),
            Err(e) => {
                tracing::warn!("Generation produced no usable reply: {}", e);
            }
        }

        let simplified = self.composer.compose_simplified(user_text);
        for attempt in 1..=self.config.composer.generation_retries {
            sleep(Duration::from_millis(self.config.composer.retry_backoff_ms)).await;
            tracing::debug!(attempt, "Retrying generation with simplified prompt");
            match self.try_generate(&simplified).await {
                Ok(reply) => return Ok(reply),
                Err(e) => {
                    tracing::warn!(attempt, "Simplified retry failed: {}", e);
                }
            }
        }

        Err(AgentError::EmptyResponse)
    }

    async fn try_generate(
        &self,
        request: &crate::llm_client::PromptRequest,
    ) -> CoreResult<String> {
        let raw = match self.generation.generate(request).await {
            Ok(raw) => raw,
            Err(e) => {
                tracing::warn!("Generation request failed: {}", e);
                return Err(AgentError::EmptyResponse);
            }
        };
        self.composer.parse_reply(&raw)
    }

    /// Force the next advance evaluation to fire (operator command path).
    pub async fn signal_advance(&self) {
        self.narrative.write().await.signal_advance();
    }

    /// Evaluate the advance policy outside the message path (timers,
    /// commands). Returns whether an advance occurred.
    pub async fn advance_if_due(&self) -> CoreResult<bool> {
        let mut narrative = self.narrative.write().await;
        let mut window = self.window.write().await;
        narrative.advance_if_due(&mut window).await
    }

    /// Read-only narrative snapshot for prompt construction or display.
    pub async fn current_context(&self) -> NarrativeContext {
        self.narrative.read().await.current_context()
    }

    pub fn fallback_reply(&self) -> &str {
        &self.config.composer.fallback_reply
    }
}

fn interaction_event_description(sender: &str, user_text: &str) -> String {
    let snippet: String = user_text.trim().chars().take(60).collect();
    format!("Talked with {sender} about \"{snippet}\"")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm_client::PromptRequest;
    use crate::narrative::PhaseStatus;
    use crate::store::SqliteStore;
    use anyhow::Result;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    /// Replies with the scripted lines in order, then repeats the last one.
    struct ScriptedGen {
        replies: Mutex<Vec<String>>,
        calls: AtomicU32,
    }

    impl ScriptedGen {
        fn new(replies: &[&str]) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(replies.iter().rev().map(|s| s.to_string()).collect()),
                calls: AtomicU32::new(0),
            })
        }
    }

    #[async_trait]
    impl GenerationService for ScriptedGen {
        async fn generate(&self, _request: &PromptRequest) -> Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut replies = self.replies.lock().unwrap();
            if replies.len() > 1 {
                Ok(replies.pop().unwrap())
            } else {
                Ok(replies.first().cloned().unwrap_or_default())
            }
        }
    }

    fn test_config(threshold: u32) -> AgentConfig {
        let mut config = AgentConfig::default();
        config.narrative.phase_advance_threshold = threshold;
        config.narrative.seed_new_phases = false;
        config.composer.retry_backoff_ms = 0;
        config
    }

    fn build_agent(config: AgentConfig, gen: Arc<dyn GenerationService>) -> (Agent, flume::Receiver<AgentEvent>) {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let (event_tx, event_rx) = flume::unbounded();
        let agent = Agent::bootstrap(config, store, gen, event_tx).unwrap();
        (agent, event_rx)
    }

    #[tokio::test]
    async fn replies_and_records_memory_and_event() {
        let gen = ScriptedGen::new(&["ooh, hello there!"]);
        let (agent, _rx) = build_agent(test_config(10), gen);

        let reply = agent.handle_message("m-1", "hi little one", "ada").await.unwrap();
        assert_eq!(reply, "ooh, hello there!");

        assert_eq!(agent.window.read().await.len(), 1);
        let ctx = agent.current_context().await;
        assert_eq!(ctx.active_phase_name, "You");
        assert_eq!(ctx.recent_events.len(), 1);
        assert!(ctx.recent_events[0].contains("ada"));
    }

    #[tokio::test]
    async fn events_appear_in_call_order_in_active_phase() {
        let gen = ScriptedGen::new(&["mhm"]);
        let (agent, _rx) = build_agent(test_config(10), gen);

        for i in 0..3 {
            agent
                .handle_message(&format!("m-{i}"), &format!("question {i}"), "sam")
                .await
                .unwrap();
        }

        let narrative = agent.narrative.read().await;
        let phase = narrative.circle().active_phase().unwrap();
        let descriptions: Vec<&str> = phase.events.iter().map(|e| e.description.as_str()).collect();
        assert!(descriptions[0].contains("question 0"));
        assert!(descriptions[1].contains("question 1"));
        assert!(descriptions[2].contains("question 2"));
    }

    #[tokio::test]
    async fn threshold_crossing_closes_phase_and_persists_one_batch() {
        let gen = ScriptedGen::new(&["a reply"]);
        let (agent, rx) = build_agent(test_config(5), gen);

        for i in 0..5 {
            agent
                .handle_message(&format!("m-{i}"), &format!("hello {i}"), "kit")
                .await
                .unwrap();
        }

        let narrative = agent.narrative.read().await;
        let circle = narrative.circle();
        assert_eq!(circle.phases[0].status, PhaseStatus::Closed);
        assert_eq!(circle.phases[1].status, PhaseStatus::Active);
        assert_eq!(narrative.interactions_in_phase(), 0);
        drop(narrative);

        let batches = agent.store.list_consolidated_batches().unwrap();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].phase_name, "You");
        // The batch references exactly the five interactions' memories.
        assert_eq!(batches[0].memory_ids().len(), 5);
        assert!(agent.store.unconsolidated_memories().unwrap().is_empty());

        let advanced = rx
            .drain()
            .filter(|e| matches!(e, AgentEvent::PhaseAdvanced { .. }))
            .count();
        assert_eq!(advanced, 1);
    }

    #[tokio::test]
    async fn empty_generation_retries_once_then_fails() {
        let gen = ScriptedGen::new(&[""]);
        let (agent, rx) = build_agent(test_config(10), gen.clone());

        let err = agent.handle_message("m-1", "hello?", "ada").await.unwrap_err();
        assert!(matches!(err, AgentError::EmptyResponse));
        // Initial attempt + one simplified retry.
        assert_eq!(gen.calls.load(Ordering::SeqCst), 2);

        // Nothing was mutated: the message can be resubmitted.
        assert_eq!(agent.window.read().await.len(), 0);
        assert!(!agent.store.is_duplicate_message("m-1").unwrap());

        // The failure is also announced on the event channel.
        let errors = rx
            .drain()
            .filter(|e| matches!(e, AgentEvent::Error(_)))
            .count();
        assert_eq!(errors, 1);
    }

    #[tokio::test]
    async fn empty_then_recovered_generation_uses_simplified_retry() {
        let gen = ScriptedGen::new(&["", "back on track"]);
        let (agent, _rx) = build_agent(test_config(10), gen);

        let reply = agent.handle_message("m-1", "you there?", "ada").await.unwrap();
        assert_eq!(reply, "back on track");
    }

    #[tokio::test]
    async fn duplicate_message_is_rejected_without_side_effects() {
        let gen = ScriptedGen::new(&["hi!"]);
        let (agent, rx) = build_agent(test_config(10), gen.clone());

        agent.handle_message("m-1", "first time", "ada").await.unwrap();
        let calls_after_first = gen.calls.load(Ordering::SeqCst);

        let err = agent.handle_message("m-1", "first time", "ada").await.unwrap_err();
        assert!(matches!(err, AgentError::DuplicateMessage(_)));
        assert!(err.is_benign());

        // No second memory entry, no second generation call, and the benign
        // rejection stays off the event channel.
        assert_eq!(agent.window.read().await.len(), 1);
        assert_eq!(gen.calls.load(Ordering::SeqCst), calls_after_first);
        assert!(!rx.drain().any(|e| matches!(e, AgentEvent::Error(_))));
    }

    #[tokio::test]
    async fn explicit_signal_forces_advance() {
        let gen = ScriptedGen::new(&["summary-ish text"]);
        let (agent, _rx) = build_agent(test_config(100), gen);

        agent.handle_message("m-1", "just one chat", "ada").await.unwrap();
        assert!(!agent.advance_if_due().await.unwrap());

        agent.signal_advance().await;
        assert!(agent.advance_if_due().await.unwrap());

        let narrative = agent.narrative.read().await;
        assert_eq!(narrative.circle().phases[0].status, PhaseStatus::Closed);
        assert_eq!(narrative.circle().phases[1].status, PhaseStatus::Active);
    }
}
