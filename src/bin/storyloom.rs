use anyhow::{Context, Result};
use flume::unbounded;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use storyloom::agent::{Agent, AgentEvent};
use storyloom::config::AgentConfig;
use storyloom::llm_client::LlmClient;
use storyloom::store::SqliteStore;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,storyloom=debug")),
        )
        .init();

    let config = AgentConfig::load();
    tracing::info!(persona = %config.persona_name, db = %config.database_path, "Storyloom starting");

    let store = Arc::new(
        SqliteStore::new(&config.database_path).context("failed to open narrative store")?,
    );
    let generation = Arc::new(LlmClient::new(
        config.llm_api_url.clone(),
        config.llm_api_key.clone().unwrap_or_default(),
        config.llm_model.clone(),
    ));

    let (event_tx, event_rx) = unbounded();
    let agent = Arc::new(
        Agent::bootstrap(config, store, generation, event_tx)
            .context("failed to bootstrap agent")?,
    );

    let rt = tokio::runtime::Runtime::new().context("failed to start runtime")?;
    rt.block_on(async move {
        // Platform adapters attach via storyloom::platforms::run_adapter_loop;
        // the stock binary just surfaces lifecycle events.
        let context = agent.current_context().await;
        tracing::info!(phase = %context.active_phase_name, "Narrative resumed");

        while let Ok(event) = event_rx.recv_async().await {
            match event {
                AgentEvent::ReplySent {
                    platform_message_id,
                    ..
                } => {
                    tracing::debug!(%platform_message_id, "Reply sent");
                }
                AgentEvent::PhaseAdvanced { phase_name } => {
                    tracing::info!(phase = %phase_name, "Story advanced");
                }
                AgentEvent::ConsolidationDeferred { reason } => {
                    tracing::warn!(%reason, "Consolidation deferred");
                }
                AgentEvent::Error(message) => {
                    tracing::error!(%message, "Agent error");
                }
            }
        }
        Ok(())
    })
}
