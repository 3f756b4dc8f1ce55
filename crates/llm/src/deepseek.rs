use std::sync::Arc;

use futures::StreamExt;
use rig::completion::{CompletionModel, Message as RigMessage};
use rig::http_client::{self, HttpClientExt, NoBody};
use rig::prelude::CompletionClient;
use rig::providers::deepseek;
use rig::streaming::StreamedAssistantContent;
use snafu::{ResultExt, ensure};
use tokio::sync::{mpsc, oneshot};
use vellum_storage::Role;

use super::model::{
    DEFAULT_DEEPSEEK_MODEL, Model, ModelCache, ModelCatalog, default_deepseek_models,
    get_model_cache,
};
use super::provider::{
    BoxFuture, EmptyMessageSetSnafu, HttpClientSnafu, InferenceBackend, MissingApiKeySnafu,
    ModelFetchStatusSnafu, ModelPayloadParseSnafu, ProviderConfig, ProviderError, ProviderResult,
    ProviderStreamHandle, ProviderWorker, StreamEvent, StreamEventPayload, StreamRequest,
    StreamTarget, event_stream_channel,
};

pub const DEEPSEEK_PROVIDER_ID: &str = "deepseek";

// DeepSeek models are text-only; anything else must arrive as a summary.
const INLINABLE_MEDIA_TYPES: &[&str] = &["application/json", "application/x-ndjson"];

pub struct DeepSeekAdapter {
    config: ProviderConfig,
    fallback_models: Vec<Model>,
    model_cache: Arc<ModelCache>,
}

impl DeepSeekAdapter {
    pub fn new(config: ProviderConfig) -> ProviderResult<Self> {
        ensure!(
            !config.api_key.is_empty(),
            MissingApiKeySnafu {
                stage: "deepseek-adapter-new",
                provider_id: config.provider_id.clone(),
            }
        );

        Ok(Self {
            config,
            fallback_models: default_deepseek_models(),
            model_cache: get_model_cache(),
        })
    }

    fn build_client(config: &ProviderConfig) -> ProviderResult<deepseek::Client> {
        let mut builder = deepseek::Client::builder().api_key(config.api_key.as_str());
        if let Some(base_url) = config.base_url.as_deref() {
            builder = builder.base_url(base_url);
        }
        builder.build().context(HttpClientSnafu {
            stage: "build-client",
        })
    }

    async fn fetch_models_from_provider(&self) -> ProviderResult<Vec<Model>> {
        let client = Self::build_client(&self.config)?;
        let request = client
            .get("/models")
            .context(HttpClientSnafu {
                stage: "build-model-request",
            })?
            .body(NoBody)
            .map_err(|source| ProviderError::BuildHttpRequestBody {
                stage: "build-model-request-body",
                message: source.to_string(),
            })?;

        let response = client.send(request).await.context(HttpClientSnafu {
            stage: "send-model-request",
        })?;
        let status = response.status();
        let payload = http_client::text(response).await.context(HttpClientSnafu {
            stage: "read-model-response",
        })?;

        if !status.is_success() {
            return ModelFetchStatusSnafu {
                stage: "model-http-status",
                status: status.as_u16(),
                body: payload,
            }
            .fail();
        }

        let model_ids = Self::extract_model_ids(&payload);
        if model_ids.is_empty() {
            return ModelPayloadParseSnafu {
                stage: "parse-model-response",
                details: "no model identifiers found in provider response".to_string(),
            }
            .fail();
        }

        Ok(model_ids.into_iter().map(Model::from_id).collect())
    }

    fn extract_model_ids(payload: &str) -> Vec<String> {
        let mut ids = Vec::new();
        let mut cursor = payload;
        let needle = "\"id\":\"";

        // The endpoint is OpenAI-shaped; extract every `id` field without a
        // full deserialization round.
        while let Some(start) = cursor.find(needle) {
            let tail = &cursor[start + needle.len()..];
            let Some(end) = tail.find('"') else {
                break;
            };

            let candidate = tail[..end].trim();
            if !candidate.is_empty() {
                ids.push(candidate.to_string());
            }
            cursor = &tail[end + 1..];
        }

        ids.sort();
        ids.dedup();
        ids
    }

    fn to_rig_message(message: &super::provider::ProviderMessage) -> RigMessage {
        match message.role {
            Role::User => RigMessage::user(message.content.clone()),
            Role::Assistant => RigMessage::assistant(message.content.clone()),
        }
    }

    fn sampling_params(request: &StreamRequest) -> Option<serde_json::Value> {
        let mut params = serde_json::Map::new();
        if let Some(top_p) = request.top_p {
            params.insert("top_p".to_string(), top_p.into());
        }
        if let Some(presence_penalty) = request.presence_penalty {
            params.insert("presence_penalty".to_string(), presence_penalty.into());
        }
        if let Some(frequency_penalty) = request.frequency_penalty {
            params.insert("frequency_penalty".to_string(), frequency_penalty.into());
        }

        if request.top_k.is_some() {
            // DeepSeek's chat endpoint has no top_k knob.
            tracing::debug!(
                model_id = %request.model_id,
                "top_k is not forwarded to this provider"
            );
        }

        if params.is_empty() {
            None
        } else {
            Some(serde_json::Value::Object(params))
        }
    }

    fn emit_error_event(
        event_tx: &mpsc::UnboundedSender<StreamEvent>,
        target: StreamTarget,
        error: ProviderError,
    ) {
        let _ = event_tx.send(StreamEvent {
            target,
            payload: StreamEventPayload::Error(error.to_string()),
        });
    }

    fn map_stream_item<R>(
        target: &StreamTarget,
        item: StreamedAssistantContent<R>,
    ) -> Option<StreamEvent>
    where
        R: Clone + Unpin,
    {
        let payload = match item {
            StreamedAssistantContent::Text(text) => StreamEventPayload::Delta(text.text),
            StreamedAssistantContent::Reasoning(reasoning) => {
                // Rig can split reasoning into multiple fragments; flatten before forwarding.
                let text = reasoning.reasoning.join("");
                if text.is_empty() {
                    return None;
                }
                StreamEventPayload::ReasoningDelta(text)
            }
            StreamedAssistantContent::ReasoningDelta { reasoning, .. } => {
                if reasoning.is_empty() {
                    return None;
                }
                StreamEventPayload::ReasoningDelta(reasoning)
            }
            StreamedAssistantContent::ToolCall { .. }
            | StreamedAssistantContent::ToolCallDelta { .. }
            | StreamedAssistantContent::Final(_) => return None,
        };

        Some(StreamEvent {
            target: target.clone(),
            payload,
        })
    }

    async fn run_stream_worker(
        config: ProviderConfig,
        request: StreamRequest,
        event_tx: mpsc::UnboundedSender<StreamEvent>,
        mut cancel_rx: oneshot::Receiver<()>,
    ) {
        let target = request.target.clone();

        let client = match Self::build_client(&config) {
            Ok(client) => client,
            Err(error) => {
                tracing::error!(
                    chat_id = %target.chat_id,
                    provider_id = %config.provider_id,
                    error = %error,
                    "failed to build provider client"
                );
                Self::emit_error_event(&event_tx, target, error);
                return;
            }
        };

        let mut messages = request
            .messages
            .iter()
            .map(Self::to_rig_message)
            .collect::<Vec<_>>();

        let Some(prompt) = messages.pop() else {
            Self::emit_error_event(
                &event_tx,
                target.clone(),
                ProviderError::EmptyMessageSet {
                    stage: "open-stream-pop-prompt",
                    target,
                },
            );
            return;
        };

        let model = client.completion_model(request.model_id.clone());
        let mut builder = model.completion_request(prompt).messages(messages);

        if let Some(preamble) = request.preamble.as_deref().filter(|text| !text.trim().is_empty()) {
            builder = builder.preamble(preamble.to_string());
        }
        if let Some(temperature) = request.temperature {
            builder = builder.temperature(temperature);
        }
        if let Some(max_tokens) = request.max_tokens {
            builder = builder.max_tokens(max_tokens);
        }
        if let Some(params) = Self::sampling_params(&request) {
            builder = builder.additional_params(params);
        }

        // The concrete streaming response type stays inferred here so the
        // worker does not depend on provider response internals.
        let mut stream = match builder.stream().await {
            Ok(stream) => stream,
            Err(source) => {
                let error = ProviderError::CompletionsFailed {
                    stage: "open-stream",
                    source,
                };
                tracing::error!(
                    chat_id = %target.chat_id,
                    provider_id = %config.provider_id,
                    model_id = %request.model_id,
                    error = %error,
                    "failed to open provider stream"
                );
                Self::emit_error_event(&event_tx, target, error);
                return;
            }
        };

        let mut cancelled = false;
        let mut stream_failed = false;

        loop {
            tokio::select! {
                _ = &mut cancel_rx => {
                    cancelled = true;
                    // Cancel the upstream stream so provider IO stops promptly.
                    tracing::debug!(chat_id = %target.chat_id, "provider stream cancelled");
                    stream.cancel();
                    break;
                }
                next_item = stream.next() => {
                    match next_item {
                        Some(Ok(item)) => {
                            if let Some(mapped) = Self::map_stream_item(&target, item)
                                && event_tx.send(mapped).is_err()
                            {
                                return;
                            }
                        }
                        Some(Err(source)) => {
                            stream_failed = true;
                            tracing::warn!(
                                chat_id = %target.chat_id,
                                error = %source,
                                "provider stream emitted an error chunk"
                            );
                            let error = ProviderError::CompletionsFailed {
                                stage: "stream-chunk",
                                source,
                            };
                            Self::emit_error_event(&event_tx, target.clone(), error);
                            break;
                        }
                        None => break,
                    }
                }
            }
        }

        if !cancelled && !stream_failed {
            let _ = event_tx.send(StreamEvent {
                target,
                payload: StreamEventPayload::Done,
            });
        }
    }
}

impl InferenceBackend for DeepSeekAdapter {
    fn id(&self) -> &str {
        &self.config.provider_id
    }

    fn name(&self) -> &str {
        "DeepSeek"
    }

    fn default_model(&self) -> &str {
        self.config
            .default_model
            .as_deref()
            .unwrap_or(DEFAULT_DEEPSEEK_MODEL)
    }

    fn fallback_models(&self) -> &[Model] {
        &self.fallback_models
    }

    fn supports_media_type(&self, media_type: &str) -> bool {
        let media_type = media_type
            .split(';')
            .next()
            .unwrap_or(media_type)
            .trim()
            .to_ascii_lowercase();
        media_type.starts_with("text/") || INLINABLE_MEDIA_TYPES.contains(&media_type.as_str())
    }

    fn fetch_models<'a>(&'a self) -> BoxFuture<'a, ProviderResult<ModelCatalog>> {
        Box::pin(async move {
            if let Some(models) = self.model_cache.get_fresh(self.id()).await {
                return Ok(ModelCatalog::from_cache_fresh(models));
            }

            // Fallback order prefers availability over strict freshness:
            // provider API first, then stale cache, then static defaults.
            match self.fetch_models_from_provider().await {
                Ok(models) => {
                    self.model_cache.set(self.id(), models.clone()).await;
                    Ok(ModelCatalog::from_provider_api(models))
                }
                Err(error) => {
                    let error_message = error.to_string();

                    if let Some(models) = self.model_cache.get_any(self.id()).await {
                        tracing::warn!(
                            provider_id = %self.id(),
                            cached_model_count = models.len(),
                            error = %error_message,
                            "model fetch failed; serving stale cached models"
                        );
                        return Ok(ModelCatalog::from_cache_stale(models, error_message));
                    }

                    tracing::warn!(
                        provider_id = %self.id(),
                        fallback_model_count = self.fallback_models.len(),
                        error = %error_message,
                        "model fetch failed without cache; serving static fallback models"
                    );

                    Ok(ModelCatalog::from_static_fallback(
                        self.fallback_models.clone(),
                        error_message,
                    ))
                }
            }
        })
    }

    fn stream_chat(&self, request: StreamRequest) -> ProviderResult<ProviderStreamHandle> {
        ensure!(
            !request.messages.is_empty(),
            EmptyMessageSetSnafu {
                stage: "stream-chat",
                target: request.target.clone(),
            }
        );

        let (event_tx, stream, cancel_rx) = event_stream_channel(request.target.clone());
        let worker: ProviderWorker = Box::pin(Self::run_stream_worker(
            self.config.clone(),
            request,
            event_tx,
            cancel_rx,
        ));

        Ok(ProviderStreamHandle { stream, worker })
    }
}
