//! Storyloom — a persona-driven conversational agent core.
//!
//! The crate owns three things: a layered memory (a bounded window of raw
//! interaction summaries plus durable consolidated batches), a story-circle
//! narrative state machine that shapes the persona over time, and a response
//! composer that turns narrative + memory context into generation requests.
//!
//! Platform I/O (Twitter/Discord/Telegram polling, webhooks) lives outside
//! the crate; adapters implement [`platforms::PlatformAdapter`] and feed
//! messages into [`agent::Agent::handle_message`].

pub mod agent;
pub mod composer;
pub mod config;
pub mod llm_client;
pub mod memory;
pub mod narrative;
pub mod platforms;
pub mod prompts;
pub mod store;

/// Result type for core agent operations
pub type CoreResult<T> = std::result::Result<T, AgentError>;

/// Errors surfaced by the narrative/memory core.
///
/// Storage and HTTP internals use `anyhow` for context-rich propagation; this
/// enum is the boundary callers (platform adapters) are expected to match on.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    /// Bad input to an append or record operation. State is untouched.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Operation attempted in the wrong narrative state (e.g. recording an
    /// event with no active phase).
    #[error("invalid narrative state: {0}")]
    InvalidState(String),

    /// Durable-write or summary-generation failure during consolidation.
    /// The transition is aborted and prior state is intact.
    #[error("consolidation failed: {0}")]
    Consolidation(String),

    /// The generation service produced no usable text after the bounded
    /// simplified-prompt retry.
    #[error("generation service returned empty text")]
    EmptyResponse,

    /// The platform message was already processed. Not fatal; callers should
    /// drop the message quietly.
    #[error("duplicate platform message: {0}")]
    DuplicateMessage(String),

    /// Durable store failure outside consolidation.
    #[error("store error: {0}")]
    Store(#[from] anyhow::Error),
}

impl AgentError {
    /// True for errors an adapter loop should swallow rather than report.
    pub fn is_benign(&self) -> bool {
        matches!(self, AgentError::DuplicateMessage(_))
    }
}
