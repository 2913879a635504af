//! Prompt templates for the narrative pipeline. The composer owns the
//! user-facing reply prompt; this module covers the internal calls
//! (consolidation summaries and phase seeding).

use crate::llm_client::PromptRequest;
use crate::memory::MemoryEntry;
use crate::narrative::Phase;

const SUMMARY_SYSTEM: &str = "You are a narrative summarizer for an ongoing character story. \
Given a closing story phase and the raw interaction memories from that period, write a \
concise, engaging summary of the phase in a single paragraph. Capture key events and \
character development. Return plain text only: no markdown, no preamble, no quotes.";

const SEED_SYSTEM: &str = "You are a storyteller maintaining an ongoing narrative built on \
Dan Harmon's Story Circle (You, Need, Go, Search, Find, Take, Return, Change). You write \
short inner-dialogue lines for the character's current phase. Respond with ONLY a valid \
JSON object, no additional text, comments, or formatting.";

/// Summarize a closing phase together with the not-yet-consolidated memories.
pub fn consolidation_prompt(phase: &Phase, memories: &[MemoryEntry]) -> PromptRequest {
    let events = if phase.events.is_empty() {
        "None recorded.".to_string()
    } else {
        phase
            .events
            .iter()
            .map(|e| match &e.emotional_tag {
                Some(tag) => format!("- {} [{}]", e.description, tag),
                None => format!("- {}", e.description),
            })
            .collect::<Vec<_>>()
            .join("\n")
    };

    let raw_memories = if memories.is_empty() {
        "None.".to_string()
    } else {
        memories
            .iter()
            .map(|m| format!("- {}", m.content))
            .collect::<Vec<_>>()
            .join("\n")
    };

    PromptRequest {
        system: SUMMARY_SYSTEM.to_string(),
        user: format!(
            "Closing phase: {}\n\n## Phase events\n{}\n\n## Raw memories from this period\n{}\n\n\
             Write the single-paragraph summary now.",
            phase.name, events, raw_memories
        ),
        temperature: 0.0,
        max_tokens: 500,
    }
}

/// Ask for fresh inner-dialogue lines when a phase activates.
pub fn phase_seed_prompt(
    persona_name: &str,
    phase_name: &str,
    recent_summaries: &[String],
    count: usize,
) -> PromptRequest {
    let previous = if recent_summaries.is_empty() {
        "None yet — this is the start of the journey.".to_string()
    } else {
        recent_summaries
            .iter()
            .map(|s| format!("- {s}"))
            .collect::<Vec<_>>()
            .join("\n")
    };

    PromptRequest {
        system: SEED_SYSTEM.to_string(),
        user: format!(
            "Character: {persona_name}\n\
             Newly active phase: {phase_name}\n\n\
             ## Previous chapter summaries\n{previous}\n\n\
             Write {count} short inner-dialogue lines (first person, in character) that fit \
             the \"{phase_name}\" phase and stay coherent with the summaries above.\n\n\
             Respond with JSON:\n\
             {{\n  \"inner_dialogues\": [\"string\"]\n}}"
        ),
        temperature: 0.7,
        max_tokens: 400,
    }
}
