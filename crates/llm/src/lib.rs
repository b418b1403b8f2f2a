use std::sync::Arc;

use nbchat_core::AgentRunnable;

mod provider;
mod rig_agent;

pub use provider::{DEFAULT_OPENAI_MODEL, ProviderConfig, ProviderError, ProviderResult};
pub use rig_agent::{RIG_OPENAI_PROVIDER_ID, RigAgent};

pub fn create_agent(mut config: ProviderConfig) -> ProviderResult<Arc<dyn AgentRunnable>> {
    if config.provider_id.trim().is_empty() {
        config.provider_id = RIG_OPENAI_PROVIDER_ID.to_string();
    }

    match config.provider_id.as_str() {
        "openai" | "rig-openai" => {
            config.provider_id = RIG_OPENAI_PROVIDER_ID.to_string();
            Ok(Arc::new(RigAgent::new(config)?))
        }
        _ => Err(ProviderError::UnsupportedProvider {
            stage: "create-agent",
            provider_id: config.provider_id,
        }),
    }
}
