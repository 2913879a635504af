//! Builds generation requests from persona + narrative + memory context and
//! shapes the raw model reply into platform-safe plain text. Never touches
//! storage.

use regex_lite::Regex;

use crate::config::ComposerConfig;
use crate::llm_client::PromptRequest;
use crate::narrative::NarrativeContext;
use crate::{AgentError, CoreResult};

pub struct ResponseComposer {
    persona_name: String,
    persona_description: String,
    config: ComposerConfig,
    fence_re: Regex,
    marker_re: Regex,
    whitespace_re: Regex,
}

impl ResponseComposer {
    pub fn new(persona_name: String, persona_description: String, config: ComposerConfig) -> Self {
        Self {
            persona_name,
            persona_description,
            config,
            // Fence lines like ```json; the inner text survives.
            fence_re: Regex::new(r"```[a-zA-Z0-9]*").expect("static regex"),
            marker_re: Regex::new(r"[*_#>`~\[\]]").expect("static regex"),
            whitespace_re: Regex::new(r"\s+").expect("static regex"),
        }
    }

    /// Build the full generation request: persona description, the active
    /// phase's mood hint, the top-K memory snippets, then the user message.
    pub fn compose(
        &self,
        user_message: &str,
        narrative: &NarrativeContext,
        memories: &[String],
    ) -> CoreResult<PromptRequest> {
        if user_message.trim().is_empty() {
            return Err(AgentError::Validation(
                "user message must not be empty".to_string(),
            ));
        }

        let mut system = format!(
            "You are {}. {}\n\nReply in character, in plain text. Keep it under {} characters. \
             No markdown, no role prefixes, no quotation marks around the reply.",
            self.persona_name, self.persona_description, self.config.max_reply_chars
        );

        if !narrative.active_phase_name.is_empty() {
            system.push_str(&format!(
                "\n\nYour story is currently in its \"{}\" phase.",
                narrative.active_phase_name
            ));
        }
        if !narrative.mood_hint.is_empty() {
            system.push_str(&format!("\nCurrent inner thought: {}", narrative.mood_hint));
        }
        if !narrative.recent_events.is_empty() {
            system.push_str("\nRecent happenings:\n");
            for event in &narrative.recent_events {
                system.push_str(&format!("- {event}\n"));
            }
        }
        if !memories.is_empty() {
            system.push_str("\nThings you remember:\n");
            for memory in memories {
                system.push_str(&format!("- {memory}\n"));
            }
        }

        Ok(PromptRequest {
            system,
            user: user_message.trim().to_string(),
            temperature: self.config.temperature,
            max_tokens: self.config.reply_max_tokens,
        })
    }

    /// Stripped-down request used for the single retry after an empty
    /// generation: persona only, no contextual trimmings.
    pub fn compose_simplified(&self, user_message: &str) -> PromptRequest {
        PromptRequest {
            system: format!(
                "You are {}. {} Reply briefly, in character, in plain text.",
                self.persona_name, self.persona_description
            ),
            user: user_message.trim().to_string(),
            temperature: self.config.temperature,
            max_tokens: self.config.reply_max_tokens,
        }
    }

    /// Sanitize a raw generation: drop formatting markers, collapse
    /// whitespace, truncate to the character budget without cutting
    /// mid-word. Blank output is an error, not an empty reply.
    pub fn parse_reply(&self, raw: &str) -> CoreResult<String> {
        let without_fences = self.fence_re.replace_all(raw, "");
        let without_markers = self.marker_re.replace_all(&without_fences, "");
        let collapsed = self.whitespace_re.replace_all(&without_markers, " ");
        let trimmed = collapsed.trim().trim_matches('"').trim();

        if trimmed.is_empty() {
            return Err(AgentError::EmptyResponse);
        }

        Ok(truncate_at_word(trimmed, self.config.max_reply_chars))
    }

    pub fn config(&self) -> &ComposerConfig {
        &self.config
    }
}

/// Truncate to at most `max_chars` characters, backing up to the last word
/// boundary. A single oversized word gets a hard cut rather than an
/// over-budget reply.
fn truncate_at_word(input: &str, max_chars: usize) -> String {
    if input.chars().count() <= max_chars {
        return input.to_string();
    }

    let head: String = input.chars().take(max_chars).collect();
    match head.rfind(char::is_whitespace) {
        Some(cut) if cut > 0 => head[..cut].trim_end().to_string(),
        _ => head,
    }
}
