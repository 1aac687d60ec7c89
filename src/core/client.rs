//! Provider clients: one request in, one raw reply (or typed failure) out

use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

use crate::core::config::{ProviderKind, TranslatorConfig};
use crate::core::errors::{ProviderError, Result, TranslationError};
use crate::core::models::{ProviderReply, TranslationRequest};
use crate::core::prompt::PromptBuilder;

/// Sampling temperature for translation requests
const TEMPERATURE: f64 = 0.2;

/// Characters of an error body kept in error messages
const ERROR_BODY_LIMIT: usize = 300;

/// A translation provider.
///
/// Implementations perform exactly one remote call per `translate` and never
/// retry internally; retry policy belongs to the scheduler.
pub trait TranslationClient: Send + Sync {
    /// Provider name for logs
    fn name(&self) -> &str;

    /// Translate one batch request
    fn translate(
        &self,
        request: &TranslationRequest,
    ) -> impl Future<Output = std::result::Result<ProviderReply, ProviderError>> + Send;

    /// Cheap reachability check run before a session starts mutating state
    fn preflight(&self) -> impl Future<Output = Result<()>> + Send {
        async { Ok(()) }
    }
}

/// Build the shared HTTP client the way every provider needs it
fn http_client(config: &TranslatorConfig) -> Result<reqwest::Client> {
    let client = reqwest::Client::builder()
        .timeout(config.request_timeout())
        .pool_idle_timeout(Some(Duration::from_secs(30)))
        .pool_max_idle_per_host(10)
        .build()?;
    Ok(client)
}

/// `Retry-After` in seconds, read before the body is consumed
fn retry_after(response: &reqwest::Response) -> Option<Duration> {
    response
        .headers()
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

fn truncate_body(body: &str) -> String {
    body.chars().take(ERROR_BODY_LIMIT).collect()
}

/// Map a non-success HTTP status onto the provider error taxonomy
pub(crate) fn classify_status(
    status: u16,
    body: &str,
    retry_after: Option<Duration>,
) -> ProviderError {
    match status {
        429 => ProviderError::RateLimited { retry_after },
        401 | 403 => ProviderError::Auth {
            message: format!("HTTP {}: {}", status, truncate_body(body)),
        },
        408 | 504 => ProviderError::Timeout,
        _ => ProviderError::Unknown {
            message: format!("HTTP {}: {}", status, truncate_body(body)),
        },
    }
}

/// Turn a response into JSON or a typed failure
async fn read_json(response: reqwest::Response) -> std::result::Result<serde_json::Value, ProviderError> {
    let status = response.status();

    if status.is_success() {
        return response.json().await.map_err(|e| ProviderError::Malformed {
            message: e.to_string(),
        });
    }

    let wait = retry_after(&response);
    let body = response.text().await.unwrap_or_default();
    Err(classify_status(status.as_u16(), &body, wait))
}

/// Preflight transport failure: the provider cannot be reached at all
fn unreachable_provider(err: reqwest::Error, endpoint: &str) -> TranslationError {
    TranslationError::config(format!("Provider unreachable at {}: {}", endpoint, err))
}

/// Client for `/chat/completions` style APIs (DeepSeek, Ark, Ollama, ...)
#[derive(Debug, Clone)]
pub struct OpenAiCompatibleClient {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl OpenAiCompatibleClient {
    pub fn new(config: &TranslatorConfig) -> Result<Self> {
        Ok(Self {
            client: http_client(config)?,
            base_url: config.endpoint().trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            model: config.model.clone(),
        })
    }

    fn chat_url(&self) -> String {
        if self.base_url.ends_with("/chat/completions") {
            self.base_url.clone()
        } else {
            format!("{}/chat/completions", self.base_url)
        }
    }

    fn models_url(&self) -> String {
        let base = self
            .base_url
            .strip_suffix("/chat/completions")
            .unwrap_or(&self.base_url);
        format!("{}/models", base)
    }

    fn authorize(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        if self.api_key.is_empty() {
            builder
        } else {
            builder.header("Authorization", format!("Bearer {}", self.api_key))
        }
    }
}

impl TranslationClient for OpenAiCompatibleClient {
    fn name(&self) -> &str {
        "openai-compatible"
    }

    async fn translate(
        &self,
        request: &TranslationRequest,
    ) -> std::result::Result<ProviderReply, ProviderError> {
        let body = serde_json::json!({
            "model": self.model,
            "messages": [
                { "role": "system", "content": PromptBuilder::system_instruction(request) },
                { "role": "user", "content": PromptBuilder::user_message(request) }
            ],
            "temperature": TEMPERATURE,
            "stream": false
        });

        debug!(
            "Batch {} -> {} ({} items)",
            request.batch_id,
            self.model,
            request.items.len()
        );

        let response = self
            .authorize(self.client.post(self.chat_url()))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await?;

        let json = read_json(response).await?;

        let raw_text = json["choices"]
            .get(0)
            .and_then(|c| c["message"]["content"].as_str())
            .ok_or_else(|| ProviderError::Malformed {
                message: "No message content in response".to_string(),
            })?
            .to_string();

        let tokens_used = json["usage"]["total_tokens"].as_u64().unwrap_or(0) as usize;
        let model_used = json["model"]
            .as_str()
            .unwrap_or(&self.model)
            .to_string();
        let request_id = json["id"].as_str().map(|s| s.to_string());

        Ok(ProviderReply {
            raw_text,
            tokens_used,
            model_used,
            request_id,
        })
    }

    async fn preflight(&self) -> Result<()> {
        let response = self
            .authorize(self.client.get(self.models_url()))
            .send()
            .await
            .map_err(|e| unreachable_provider(e, &self.base_url))?;

        match response.status().as_u16() {
            status @ (401 | 403) => Err(classify_status(status, "", None).into()),
            status if !response.status().is_success() => {
                // Many compatible servers do not expose /models
                warn!("Preflight GET /models answered HTTP {}, continuing", status);
                Ok(())
            }
            _ => Ok(()),
        }
    }
}

/// Client for Google Gemini `generateContent`
#[derive(Debug, Clone)]
pub struct GeminiClient {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl GeminiClient {
    pub fn new(config: &TranslatorConfig) -> Result<Self> {
        Ok(Self {
            client: http_client(config)?,
            base_url: config.endpoint().trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            model: config.model.clone(),
        })
    }

    fn generate_url(&self) -> String {
        format!("{}/models/{}:generateContent", self.base_url, self.model)
    }
}

impl TranslationClient for GeminiClient {
    fn name(&self) -> &str {
        "gemini"
    }

    async fn translate(
        &self,
        request: &TranslationRequest,
    ) -> std::result::Result<ProviderReply, ProviderError> {
        let body = serde_json::json!({
            "systemInstruction": {
                "parts": [{ "text": PromptBuilder::system_instruction(request) }]
            },
            "contents": [{
                "role": "user",
                "parts": [{ "text": PromptBuilder::user_message(request) }]
            }],
            "generationConfig": {
                "temperature": TEMPERATURE,
                "responseMimeType": "application/json"
            }
        });

        debug!(
            "Batch {} -> {} ({} items)",
            request.batch_id,
            self.model,
            request.items.len()
        );

        let response = self
            .client
            .post(self.generate_url())
            .header("x-goog-api-key", &self.api_key)
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await?;

        let json = read_json(response).await?;

        let candidate = json["candidates"].get(0).ok_or_else(|| ProviderError::Malformed {
            message: "No candidates in response".to_string(),
        })?;

        // Safety blocks come back as a candidate without parts
        let raw_text = candidate["content"]["parts"]
            .as_array()
            .map(|parts| {
                parts
                    .iter()
                    .filter_map(|p| p["text"].as_str())
                    .collect::<String>()
            })
            .filter(|text| !text.is_empty())
            .ok_or_else(|| ProviderError::Malformed {
                message: format!(
                    "Empty candidate (finishReason: {})",
                    candidate["finishReason"].as_str().unwrap_or("unknown")
                ),
            })?;

        let tokens_used = json["usageMetadata"]["totalTokenCount"]
            .as_u64()
            .unwrap_or(0) as usize;
        let request_id = json["responseId"].as_str().map(|s| s.to_string());

        Ok(ProviderReply {
            raw_text,
            tokens_used,
            model_used: self.model.clone(),
            request_id,
        })
    }

    async fn preflight(&self) -> Result<()> {
        let url = format!("{}/models/{}", self.base_url, self.model);
        let response = self
            .client
            .get(url)
            .header("x-goog-api-key", &self.api_key)
            .send()
            .await
            .map_err(|e| unreachable_provider(e, &self.base_url))?;

        match response.status().as_u16() {
            status @ (401 | 403) => Err(classify_status(status, "", None).into()),
            404 => Err(TranslationError::config(format!(
                "Model {} not found",
                self.model
            ))),
            _ => Ok(()),
        }
    }
}

/// Provider selected from configuration
#[derive(Debug, Clone)]
pub enum AnyClient {
    OpenAiCompatible(OpenAiCompatibleClient),
    Gemini(GeminiClient),
}

impl AnyClient {
    /// Build the configured provider client
    pub fn from_config(config: &TranslatorConfig) -> Result<Self> {
        let client = match config.provider {
            ProviderKind::OpenaiCompatible => {
                AnyClient::OpenAiCompatible(OpenAiCompatibleClient::new(config)?)
            }
            ProviderKind::Gemini => AnyClient::Gemini(GeminiClient::new(config)?),
        };
        debug!("Using {} provider at {}", client.name(), config.endpoint());
        Ok(client)
    }
}

impl TranslationClient for AnyClient {
    fn name(&self) -> &str {
        match self {
            AnyClient::OpenAiCompatible(client) => client.name(),
            AnyClient::Gemini(client) => client.name(),
        }
    }

    async fn translate(
        &self,
        request: &TranslationRequest,
    ) -> std::result::Result<ProviderReply, ProviderError> {
        match self {
            AnyClient::OpenAiCompatible(client) => client.translate(request).await,
            AnyClient::Gemini(client) => client.translate(request).await,
        }
    }

    async fn preflight(&self) -> Result<()> {
        match self {
            AnyClient::OpenAiCompatible(client) => client.preflight().await,
            AnyClient::Gemini(client) => client.preflight().await,
        }
    }
}
