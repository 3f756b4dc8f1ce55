use std::sync::Arc;

mod deepseek;
mod model;
mod provider;

pub use deepseek::{DEEPSEEK_PROVIDER_ID, DeepSeekAdapter};
pub use model::{
    DEFAULT_DEEPSEEK_MODEL, Model, ModelCache, ModelCatalog, ModelCatalogSource,
    default_deepseek_models, get_model_cache,
};
pub use provider::{
    BoxFuture, InferenceBackend, ProviderConfig, ProviderError, ProviderEventStream,
    ProviderMessage, ProviderResult, ProviderStreamHandle, ProviderWorker, SendAttemptId,
    StreamEvent, StreamEventPayload, StreamRequest, StreamTarget, event_stream_channel,
};

/// Binds a validated provider configuration to a concrete backend.
///
/// Unknown provider ids fail here, before any persona is built on top of
/// them; there is no silent fallback to a default vendor.
pub fn create_backend(config: ProviderConfig) -> ProviderResult<Arc<dyn InferenceBackend>> {
    match config.provider_id.as_str() {
        DEEPSEEK_PROVIDER_ID => Ok(Arc::new(DeepSeekAdapter::new(config)?)),
        _ => Err(ProviderError::UnsupportedProvider {
            stage: "create-backend",
            provider_id: config.provider_id,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_backend_rejects_unknown_provider() {
        let error = create_backend(ProviderConfig::new("openai", "k", None, None)).unwrap_err();
        match error {
            ProviderError::UnsupportedProvider { provider_id, .. } => {
                assert_eq!(provider_id, "openai");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn create_backend_builds_deepseek() {
        let backend = create_backend(ProviderConfig::new("deepseek", "k", None, None)).unwrap();
        assert_eq!(backend.id(), "deepseek");
        assert_eq!(backend.default_model(), DEFAULT_DEEPSEEK_MODEL);
    }
}
