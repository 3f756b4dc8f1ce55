use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use snafu::Snafu;
use vellum_llm::{
    InferenceBackend, ProviderConfig, ProviderError, ProviderMessage, StreamRequest, StreamTarget,
    create_backend,
};

/// Formatting conventions every persona is asked to follow, prepended to the
/// user-authored system prompt. The renderer on the other side of the webview
/// expects exactly these conventions.
pub const SYSTEM_PROMPT_PREFIX: &str = r#"输出应遵循 GitHub Flavored Markdown，部分输出渲染需要符合以下约定的：

1. **行内公式**：请使用两个美元符号 **$$...$$** 包裹，且公式前后不换行。
   示例：这是质能方程 $$E = mc^{2}$$ 的应用。

2. **单行公式**：请使用两个美元符号 **$$...$$** 包裹，并确保公式独立成行（前后换行）。
   示例：
   $$
   E = mc^{2}
   $$

3. **流程图**：使用 Mermaid 代码块（```mermaid ... ```）绘制。

4. **Github Alert**：支持 NOTE、TIP、IMPORTANT、WARNING、CAUTION 提示框，
   标题和正文需要隔一行，遵循 GitHub 规范，**仅支持顶层，不支持嵌套 Alert**。
   示例：
   > [!NOTE] title
   >
   > Content

请在所有回答中严格遵守此格式，以确保输出正确显示。

---

"#;

/// Raw persona record as it sits in the settings file, before validation.
///
/// Field names stay camelCase on disk for continuity with the original
/// persona files.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersonaConfig {
    pub id: String,
    pub provider: String,
    pub model: String,
    pub api_key: String,
    #[serde(default)]
    pub base_url: Option<String>,
    pub max_tokens: i64,

    #[serde(default)]
    pub max_output_tokens: Option<i64>,
    #[serde(default)]
    pub temperature: Option<f64>,
    #[serde(default)]
    pub top_p: Option<f64>,
    #[serde(default)]
    pub top_k: Option<i64>,
    #[serde(default)]
    pub presence_penalty: Option<f64>,
    #[serde(default)]
    pub frequency_penalty: Option<f64>,

    #[serde(default)]
    pub system_prompt: String,
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum PersonaError {
    #[snafu(display("Persona 字段 '{field}' 校验失败：{message}"))]
    InvalidField {
        field: &'static str,
        message: String,
    },
    #[snafu(display("此版本不支持 {provider} 提供商"))]
    UnsupportedProvider { provider: String },
    #[snafu(display("无法初始化模型提供商：{source}"))]
    BackendInit { source: ProviderError },
}

pub type PersonaResult<T> = Result<T, PersonaError>;

/// Validated, immutable persona bound to a concrete inference backend.
///
/// Construction fails fast: unsupported providers, missing credentials and
/// out-of-range sampling parameters all reject the whole record, never
/// silently drop a field.
#[derive(Clone)]
pub struct Persona {
    pub id: String,
    pub provider: String,
    pub model: String,
    /// Context window size in tokens.
    pub max_tokens: u64,
    pub max_output_tokens: Option<u64>,
    pub temperature: Option<f64>,
    pub top_p: Option<f64>,
    pub top_k: Option<u32>,
    pub presence_penalty: Option<f64>,
    pub frequency_penalty: Option<f64>,
    /// Effective system prompt: formatting preamble + user-authored prompt.
    pub system_prompt: String,
    backend: Arc<dyn InferenceBackend>,
}

impl fmt::Debug for Persona {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("Persona")
            .field("id", &self.id)
            .field("provider", &self.provider)
            .field("model", &self.model)
            .field("max_tokens", &self.max_tokens)
            .finish_non_exhaustive()
    }
}

fn require_non_blank(
    field: &'static str,
    value: &str,
    message: &'static str,
) -> PersonaResult<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return InvalidFieldSnafu {
            field,
            message: message.to_string(),
        }
        .fail();
    }
    Ok(trimmed.to_string())
}

fn require_positive(field: &'static str, value: i64, message: &'static str) -> PersonaResult<u64> {
    if value <= 0 {
        return InvalidFieldSnafu {
            field,
            message: message.to_string(),
        }
        .fail();
    }
    Ok(value as u64)
}

fn require_in_range(
    field: &'static str,
    value: f64,
    min: f64,
    max: f64,
    message: String,
) -> PersonaResult<f64> {
    if !value.is_finite() || value < min || value > max {
        return InvalidFieldSnafu { field, message }.fail();
    }
    Ok(value)
}

impl Persona {
    /// Validates a raw record and binds it to its provider backend.
    ///
    /// Optional numeric fields outside their range reject construction
    /// outright, matching the required-field policy.
    pub fn new(config: &PersonaConfig) -> PersonaResult<Self> {
        Self::build(config, None)
    }

    /// Same validation, but with the backend supplied by the caller instead
    /// of the provider factory. Embedders use this to wire fakes.
    pub fn with_backend(
        config: &PersonaConfig,
        backend: Arc<dyn InferenceBackend>,
    ) -> PersonaResult<Self> {
        Self::build(config, Some(backend))
    }

    fn build(
        config: &PersonaConfig,
        backend_override: Option<Arc<dyn InferenceBackend>>,
    ) -> PersonaResult<Self> {
        let id = require_non_blank("id", &config.id, "Persona 名称不能为空")?;
        let model = require_non_blank("model", &config.model, "模型不能为空")?;
        let api_key = require_non_blank("apiKey", &config.api_key, "Api Key 不能为空")?;

        let provider = config.provider.trim().to_string();
        if provider != "deepseek" {
            return UnsupportedProviderSnafu { provider }.fail();
        }

        let base_url = match config.base_url.as_deref().map(str::trim) {
            None | Some("") => None,
            Some(url) => {
                if !(url.starts_with("http://") || url.starts_with("https://"))
                    || url.contains(char::is_whitespace)
                {
                    return InvalidFieldSnafu {
                        field: "baseUrl",
                        message: format!("无效的 URL：{url}"),
                    }
                    .fail();
                }
                Some(url.to_string())
            }
        };

        let max_tokens = require_positive("maxTokens", config.max_tokens, "窗口上下文应为正整数")?;
        let max_output_tokens = config
            .max_output_tokens
            .map(|value| require_positive("maxOutputTokens", value, "最大输出应为正整数"))
            .transpose()?;
        let temperature = config
            .temperature
            .map(|value| {
                require_in_range("temperature", value, 0.0, 2.0, "温度应在 0 到 2 之间".to_string())
            })
            .transpose()?;
        let top_p = config
            .top_p
            .map(|value| require_in_range("topP", value, 0.0, 1.0, "核采样应在 0 到 1 之间".to_string()))
            .transpose()?;
        let top_k = config
            .top_k
            .map(|value| {
                if value <= 0 || value > 100 {
                    return InvalidFieldSnafu {
                        field: "topK",
                        message: "top-K 应 > 0 且 ≤ 100".to_string(),
                    }
                    .fail();
                }
                Ok(value as u32)
            })
            .transpose()?;
        let presence_penalty = config
            .presence_penalty
            .map(|value| {
                require_in_range(
                    "presencePenalty",
                    value,
                    -2.0,
                    2.0,
                    "话题新鲜度应在 -2 到 2 之间".to_string(),
                )
            })
            .transpose()?;
        let frequency_penalty = config
            .frequency_penalty
            .map(|value| {
                require_in_range(
                    "frequencyPenalty",
                    value,
                    -2.0,
                    2.0,
                    "频率惩罚度应在 -2 到 2 之间".to_string(),
                )
            })
            .transpose()?;

        let backend = match backend_override {
            Some(backend) => backend,
            None => create_backend(ProviderConfig::new(
                provider.clone(),
                api_key,
                base_url,
                Some(model.clone()),
            ))
            .map_err(|source| PersonaError::BackendInit { source })?,
        };

        Ok(Self {
            id,
            provider,
            model,
            max_tokens,
            max_output_tokens,
            temperature,
            top_p,
            top_k,
            presence_penalty,
            frequency_penalty,
            system_prompt: format!("{SYSTEM_PROMPT_PREFIX}\n{}", config.system_prompt),
            backend,
        })
    }

    pub fn backend(&self) -> &Arc<dyn InferenceBackend> {
        &self.backend
    }

    /// True when the backend accepts literal file content of this media type.
    pub fn supports_media_type(&self, media_type: &str) -> bool {
        self.backend.supports_media_type(media_type)
    }

    /// Builds a stream request carrying this persona's sampling parameters
    /// and effective system prompt.
    pub fn stream_request(
        &self,
        target: StreamTarget,
        messages: Vec<ProviderMessage>,
    ) -> StreamRequest {
        let mut request = StreamRequest::new(target, self.model.clone(), messages)
            .with_preamble(self.system_prompt.clone());

        if let Some(temperature) = self.temperature {
            request = request.with_temperature(temperature);
        }
        if let Some(top_p) = self.top_p {
            request = request.with_top_p(top_p);
        }
        if let Some(top_k) = self.top_k {
            request = request.with_top_k(top_k);
        }
        if let Some(max_output_tokens) = self.max_output_tokens {
            request = request.with_max_tokens(max_output_tokens);
        }
        if let Some(presence_penalty) = self.presence_penalty {
            request = request.with_presence_penalty(presence_penalty);
        }
        if let Some(frequency_penalty) = self.frequency_penalty {
            request = request.with_frequency_penalty(frequency_penalty);
        }

        request
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vellum_llm::SendAttemptId;
    use vellum_storage::{ChatId, Role};

    fn base_config() -> PersonaConfig {
        PersonaConfig {
            id: "p1".to_string(),
            provider: "deepseek".to_string(),
            model: "x".to_string(),
            api_key: "k".to_string(),
            base_url: None,
            max_tokens: 128_000,
            max_output_tokens: None,
            temperature: None,
            top_p: None,
            top_k: None,
            presence_penalty: None,
            frequency_penalty: None,
            system_prompt: String::new(),
        }
    }

    #[test]
    fn minimal_config_succeeds_with_optionals_unset() {
        let persona = Persona::new(&base_config()).unwrap();
        assert_eq!(persona.max_tokens, 128_000);
        assert!(persona.max_output_tokens.is_none());
        assert!(persona.temperature.is_none());
        assert!(persona.top_p.is_none());
        assert!(persona.top_k.is_none());
        assert!(persona.presence_penalty.is_none());
        assert!(persona.frequency_penalty.is_none());
    }

    #[test]
    fn negative_max_tokens_fails_citing_the_field() {
        let config = PersonaConfig {
            max_tokens: -5,
            ..base_config()
        };
        let error = Persona::new(&config).unwrap_err();
        match error {
            PersonaError::InvalidField { field, .. } => assert_eq!(field, "maxTokens"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn unsupported_provider_fails_immediately() {
        let config = PersonaConfig {
            provider: "openai".to_string(),
            ..base_config()
        };
        let error = Persona::new(&config).unwrap_err();
        assert_eq!(error.to_string(), "此版本不支持 openai 提供商");
    }

    #[test]
    fn out_of_range_optionals_reject_construction() {
        for (config, field) in [
            (
                PersonaConfig {
                    temperature: Some(2.5),
                    ..base_config()
                },
                "temperature",
            ),
            (
                PersonaConfig {
                    top_p: Some(1.2),
                    ..base_config()
                },
                "topP",
            ),
            (
                PersonaConfig {
                    top_k: Some(0),
                    ..base_config()
                },
                "topK",
            ),
            (
                PersonaConfig {
                    presence_penalty: Some(-3.0),
                    ..base_config()
                },
                "presencePenalty",
            ),
            (
                PersonaConfig {
                    frequency_penalty: Some(2.1),
                    ..base_config()
                },
                "frequencyPenalty",
            ),
        ] {
            match Persona::new(&config).unwrap_err() {
                PersonaError::InvalidField { field: actual, .. } => assert_eq!(actual, field),
                other => panic!("unexpected error for {field}: {other}"),
            }
        }
    }

    #[test]
    fn blank_required_fields_are_rejected() {
        let config = PersonaConfig {
            api_key: "   ".to_string(),
            ..base_config()
        };
        match Persona::new(&config).unwrap_err() {
            PersonaError::InvalidField { field, .. } => assert_eq!(field, "apiKey"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn base_url_must_be_http() {
        let config = PersonaConfig {
            base_url: Some("ftp://example.com".to_string()),
            ..base_config()
        };
        match Persona::new(&config).unwrap_err() {
            PersonaError::InvalidField { field, .. } => assert_eq!(field, "baseUrl"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn system_prompt_is_prefixed_with_format_conventions() {
        let config = PersonaConfig {
            system_prompt: "你是一个友好的助手。".to_string(),
            ..base_config()
        };
        let persona = Persona::new(&config).unwrap();
        assert!(persona.system_prompt.starts_with(SYSTEM_PROMPT_PREFIX));
        assert!(persona.system_prompt.ends_with("你是一个友好的助手。"));
    }

    #[test]
    fn stream_request_carries_sampling_parameters() {
        let config = PersonaConfig {
            temperature: Some(0.7),
            top_p: Some(0.9),
            max_output_tokens: Some(4_096),
            ..base_config()
        };
        let persona = Persona::new(&config).unwrap();

        let target = StreamTarget::new(ChatId::generate(), SendAttemptId::new(1));
        let request = persona.stream_request(
            target,
            vec![ProviderMessage::new(Role::User, "hello")],
        );

        assert_eq!(request.model_id, "x");
        assert_eq!(request.temperature, Some(0.7));
        assert_eq!(request.top_p, Some(0.9));
        assert_eq!(request.max_tokens, Some(4_096));
        assert!(request.preamble.as_deref().unwrap().starts_with(SYSTEM_PROMPT_PREFIX));
    }
}
