use std::sync::Arc;

mod model;
mod provider;
mod rig_adapter;

pub use model::{
    DEFAULT_LOCAL_MODEL, Model, ModelCache, ModelCatalog, ModelCatalogSource,
    default_local_models, get_model_cache,
};
pub use provider::{
    ChatModel, GenerateRequest, PLACEHOLDER_API_KEY, ProviderConfig, ProviderError,
    ProviderMessage, ProviderResult, ProviderRole,
};
pub use rig_adapter::{RIG_OPENAI_PROVIDER_ID, RigChatModel, clean_reply};

/// Provider ids served through the OpenAI-compatible adapter.
pub const OPENAI_COMPATIBLE_PROVIDERS: [&str; 5] =
    ["openai", "rig-openai", "ollama", "llama-cpp", "local"];

pub fn create_model(mut config: ProviderConfig) -> ProviderResult<Arc<dyn ChatModel>> {
    if config.provider_id.trim().is_empty() {
        config.provider_id = RIG_OPENAI_PROVIDER_ID.to_string();
    }
    config.provider_id = config.provider_id.to_ascii_lowercase();

    if OPENAI_COMPATIBLE_PROVIDERS.contains(&config.provider_id.as_str()) {
        tracing::debug!(
            provider_id = %config.provider_id,
            endpoint = %config.endpoint,
            "creating OpenAI-compatible chat model"
        );
        Ok(Arc::new(RigChatModel::new(config)))
    } else {
        Err(ProviderError::UnsupportedProvider {
            stage: "create-model",
            provider_id: config.provider_id,
        })
    }
}
