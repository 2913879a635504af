//! The interface contract between platform glue (Twitter/Discord/Telegram
//! polling loops, webhook handlers) and the core. Adapters live outside this
//! crate; the core only defines the shape and the driver loop that awaits it
//! per message — no fire-and-forget mutation.

use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::time::{sleep, Duration};

use crate::agent::Agent;
use crate::AgentError;

/// One inbound message as delivered by a platform adapter.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    /// Platform-unique ID used for deduplication.
    pub platform_message_id: String,
    pub user_text: String,
    /// Who sent it (handle, display name — whatever the platform has).
    pub sender: String,
}

/// A platform adapter delivers inbound messages and accepts plain-text
/// replies back. Rate limiting and auth are the adapter's problem; the core
/// guarantees the reply text is already sanitized and within budget.
#[async_trait]
pub trait PlatformAdapter: Send + Sync {
    /// Human-readable name (used in logs)
    fn name(&self) -> &str;

    /// Fetch messages that arrived since the last poll.
    async fn poll(&self) -> Result<Vec<InboundMessage>>;

    /// Deliver a reply for the given message.
    async fn deliver(&self, in_reply_to: &InboundMessage, reply_text: &str) -> Result<()>;
}

/// Drive one adapter against the core until the task is aborted.
///
/// Each message is fully handled (reply generated, memory and narrative
/// updated) before the next one is taken. Duplicates are dropped quietly;
/// exhausted generation falls back to the configured stock line.
pub async fn run_adapter_loop(
    adapter: Arc<dyn PlatformAdapter>,
    agent: Arc<Agent>,
    poll_interval: Duration,
) {
    loop {
        match adapter.poll().await {
            Ok(messages) => {
                for message in messages {
                    handle_one(adapter.as_ref(), &agent, &message).await;
                }
            }
            Err(e) => {
                tracing::warn!(platform = adapter.name(), "Poll failed: {}", e);
            }
        }
        sleep(poll_interval).await;
    }
}

async fn handle_one(adapter: &dyn PlatformAdapter, agent: &Agent, message: &InboundMessage) {
    let result = agent
        .handle_message(
            &message.platform_message_id,
            &message.user_text,
            &message.sender,
        )
        .await;

    let reply = match result {
        Ok(reply) => reply,
        Err(AgentError::DuplicateMessage(id)) => {
            tracing::debug!(platform = adapter.name(), %id, "Skipping duplicate message");
            return;
        }
        Err(AgentError::EmptyResponse) => {
            tracing::warn!(
                platform = adapter.name(),
                "Generation stayed empty, sending fallback"
            );
            agent.fallback_reply().to_string()
        }
        Err(e) => {
            tracing::error!(platform = adapter.name(), "Failed to handle message: {}", e);
            return;
        }
    };

    if let Err(e) = adapter.deliver(message, &reply).await {
        tracing::error!(platform = adapter.name(), "Failed to deliver reply: {}", e);
    }
}
