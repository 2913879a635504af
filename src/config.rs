use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::PathBuf;

/// Knobs for the bounded memory window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryConfig {
    /// Hard cap on entries held in the window; oldest evicted first.
    #[serde(default = "default_window_max_entries")]
    pub max_entries: usize,
    /// Entries older than this are pruned on append.
    #[serde(default = "default_retention_hours")]
    pub retention_hours: i64,
    /// How many newest entries feed prompt construction.
    #[serde(default = "default_prompt_window")]
    pub prompt_window: usize,
}

fn default_window_max_entries() -> usize {
    200
}

fn default_retention_hours() -> i64 {
    72
}

fn default_prompt_window() -> usize {
    8
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            max_entries: default_window_max_entries(),
            retention_hours: default_retention_hours(),
            prompt_window: default_prompt_window(),
        }
    }
}

/// Knobs for the narrative state machine and consolidation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NarrativeConfig {
    /// Interactions recorded into a phase before it closes.
    #[serde(default = "default_phase_threshold")]
    pub phase_advance_threshold: u32,
    /// Bounded retries for the consolidation summary + batch write.
    #[serde(default = "default_consolidation_retries")]
    pub consolidation_max_retries: u32,
    /// Ask the generation service to seed events when a phase activates.
    #[serde(default = "default_seed_phases")]
    pub seed_new_phases: bool,
    /// Events requested per seeded phase.
    #[serde(default = "default_seed_event_count")]
    pub seed_event_count: usize,
}

fn default_phase_threshold() -> u32 {
    4
}

fn default_consolidation_retries() -> u32 {
    3
}

fn default_seed_phases() -> bool {
    true
}

fn default_seed_event_count() -> usize {
    4
}

impl Default for NarrativeConfig {
    fn default() -> Self {
        Self {
            phase_advance_threshold: default_phase_threshold(),
            consolidation_max_retries: default_consolidation_retries(),
            seed_new_phases: default_seed_phases(),
            seed_event_count: default_seed_event_count(),
        }
    }
}

/// Knobs for prompt assembly and reply shaping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComposerConfig {
    /// Replies are truncated to this many characters on a word boundary.
    #[serde(default = "default_max_reply_chars")]
    pub max_reply_chars: usize,
    /// Retries after an empty/garbled generation (the retry uses a
    /// simplified prompt).
    #[serde(default = "default_generation_retries")]
    pub generation_retries: u32,
    /// Backoff between generation retries.
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    /// Sent to the platform when generation stays empty after retries.
    #[serde(default = "default_fallback_reply")]
    pub fallback_reply: String,
    /// Sampling temperature for reply generation.
    #[serde(default = "default_reply_temperature")]
    pub temperature: f32,
    /// Token budget for reply generation.
    #[serde(default = "default_reply_max_tokens")]
    pub reply_max_tokens: u32,
}

fn default_max_reply_chars() -> usize {
    280
}

fn default_generation_retries() -> u32 {
    1
}

fn default_retry_backoff_ms() -> u64 {
    500
}

fn default_fallback_reply() -> String {
    "...lost my train of thought. say that again?".to_string()
}

fn default_reply_temperature() -> f32 {
    0.7
}

fn default_reply_max_tokens() -> u32 {
    150
}

impl Default for ComposerConfig {
    fn default() -> Self {
        Self {
            max_reply_chars: default_max_reply_chars(),
            generation_retries: default_generation_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
            fallback_reply: default_fallback_reply(),
            temperature: default_reply_temperature(),
            reply_max_tokens: default_reply_max_tokens(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default = "default_llm_url")]
    pub llm_api_url: String,
    #[serde(default = "default_llm_model")]
    pub llm_model: String,
    #[serde(default)]
    pub llm_api_key: Option<String>,

    /// Display name of the persona.
    #[serde(default = "default_persona_name")]
    pub persona_name: String,
    /// Free-text persona description injected into every system prompt.
    #[serde(default = "default_persona_description")]
    pub persona_description: String,

    #[serde(default = "default_database_path")]
    pub database_path: String,

    /// Seconds between adapter poll iterations.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,

    #[serde(default)]
    pub memory: MemoryConfig,
    #[serde(default)]
    pub narrative: NarrativeConfig,
    #[serde(default)]
    pub composer: ComposerConfig,
}

fn default_llm_url() -> String {
    "http://localhost:11434/v1".to_string()
}

fn default_llm_model() -> String {
    "llama3.1".to_string()
}

fn default_persona_name() -> String {
    "Loom".to_string()
}

fn default_persona_description() -> String {
    "A small, curious creature in a big world. Playful, easily distracted, \
     approaches everything with wide-eyed wonder, and loves quirky, \
     imaginative expressions."
        .to_string()
}

fn default_database_path() -> String {
    "storyloom.db".to_string()
}

fn default_poll_interval() -> u64 {
    30
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            llm_api_url: default_llm_url(),
            llm_model: default_llm_model(),
            llm_api_key: None,
            persona_name: default_persona_name(),
            persona_description: default_persona_description(),
            database_path: default_database_path(),
            poll_interval_secs: default_poll_interval(),
            memory: MemoryConfig::default(),
            narrative: NarrativeConfig::default(),
            composer: ComposerConfig::default(),
        }
    }
}

impl AgentConfig {
    /// Get the directory containing the executable
    fn get_base_dir() -> PathBuf {
        match std::env::current_exe() {
            Ok(exe_path) => exe_path
                .parent()
                .map(|p| p.to_path_buf())
                .unwrap_or_else(|| PathBuf::from(".")),
            Err(_) => PathBuf::from("."),
        }
    }

    /// Path to the config file (next to the executable)
    pub fn config_path() -> PathBuf {
        Self::get_base_dir().join("storyloom.toml")
    }

    /// Load config from storyloom.toml, falling back to defaults + env vars
    pub fn load() -> Self {
        let path = Self::config_path();

        if let Ok(contents) = fs::read_to_string(&path) {
            match toml::from_str::<AgentConfig>(&contents) {
                Ok(config) => {
                    tracing::info!("Loaded config from {:?}", path);
                    return config;
                }
                Err(e) => {
                    tracing::error!("Failed to parse {:?}: {}", path, e);
                }
            }
        }

        tracing::warn!("No config file found, using defaults + env vars");
        Self::from_env()
    }

    /// Save config to file (next to executable)
    pub fn save(&self) -> Result<()> {
        let path = Self::config_path();

        let toml_string = toml::to_string_pretty(self).context("Failed to serialize config")?;

        fs::write(&path, toml_string)
            .with_context(|| format!("Failed to write config to {:?}", path))?;

        tracing::info!("Saved config to {:?}", path);
        Ok(())
    }

    /// Load from environment variables
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(url) = env::var("LLM_API_URL") {
            config.llm_api_url = url;
        }

        if let Ok(model) = env::var("LLM_MODEL") {
            config.llm_model = model;
        }

        if let Ok(key) = env::var("LLM_API_KEY") {
            config.llm_api_key = Some(key);
        }

        if let Ok(path) = env::var("STORYLOOM_DB_PATH") {
            config.database_path = path;
        }

        if let Ok(threshold) = env::var("STORYLOOM_PHASE_THRESHOLD") {
            if let Ok(n) = threshold.parse() {
                config.narrative.phase_advance_threshold = n;
            }
        }

        config
    }
}
