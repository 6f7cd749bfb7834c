//! HTTP client for an OpenAI-compatible inference endpoint (e.g. a LiteLLM proxy).

use std::time::Duration;

use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};
use url::Url;

use marketbrief_shared::InferenceConfig;

use crate::error::InferenceError;
use crate::retry::RetryPolicy;

/// User-Agent string for inference requests.
const USER_AGENT: &str = concat!("MarketBrief/", env!("CARGO_PKG_VERSION"));

/// Sampling temperature for chat completions.
const CHAT_TEMPERATURE: f32 = 0.2;

/// Longest error body kept in an error message.
const MAX_ERROR_BODY: usize = 200;

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

/// One chat message.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChatMessage {
    pub role: &'static str,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system",
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user",
            content: content.into(),
        }
    }
}

#[derive(Debug, Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Debug, Deserialize)]
pub(crate) struct EmbeddingResponse {
    #[serde(default)]
    data: Vec<EmbeddingData>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    #[serde(default)]
    index: Option<usize>,
    embedding: Vec<f32>,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    temperature: f32,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    #[serde(default)]
    message: Option<ChatReply>,
}

#[derive(Debug, Deserialize)]
struct ChatReply {
    #[serde(default)]
    content: Option<String>,
}

// ---------------------------------------------------------------------------
// InferenceClient
// ---------------------------------------------------------------------------

/// Embedding + chat client with per-call timeout and retry.
#[derive(Debug, Clone)]
pub struct InferenceClient {
    client: Client,
    embeddings_url: Url,
    chat_url: Url,
    api_key: Option<String>,
    embed_model: String,
    chat_model: String,
    max_tokens: Option<u32>,
    embed_timeout: Duration,
    chat_timeout: Duration,
    retry: RetryPolicy,
}

impl InferenceClient {
    /// Build a client from config. The API key is read from `api_key_env`.
    pub fn new(config: &InferenceConfig) -> Result<Self, InferenceError> {
        let mut base = config.base_url.trim().to_string();
        if !base.ends_with('/') {
            base.push('/');
        }
        let base = Url::parse(&base)
            .map_err(|e| InferenceError::Setup(format!("invalid base_url '{base}': {e}")))?;
        let embeddings_url = base
            .join("v1/embeddings")
            .map_err(|e| InferenceError::Setup(e.to_string()))?;
        let chat_url = base
            .join("v1/chat/completions")
            .map_err(|e| InferenceError::Setup(e.to_string()))?;

        let client = Client::builder()
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| InferenceError::Setup(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            embeddings_url,
            chat_url,
            api_key: config.api_key(),
            embed_model: config.embed_model.clone(),
            chat_model: config.chat_model.clone(),
            max_tokens: config.max_tokens,
            embed_timeout: Duration::from_secs(config.embed_timeout_secs),
            chat_timeout: Duration::from_secs(config.chat_timeout_secs),
            retry: RetryPolicy::from(&config.retry),
        })
    }

    /// Override the retry policy.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Embed `texts`, returning one vector per input in input order.
    #[instrument(skip_all, fields(texts = texts.len()))]
    pub async fn embed_texts(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, InferenceError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        self.retry.run("embed", || self.embed_once(texts)).await
    }

    /// Send a chat completion and return the first choice's text.
    #[instrument(skip_all, fields(messages = messages.len()))]
    pub async fn chat(&self, messages: &[ChatMessage]) -> Result<String, InferenceError> {
        self.retry.run("chat", || self.chat_once(messages)).await
    }

    async fn embed_once(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, InferenceError> {
        let endpoint = self.embeddings_url.as_str();
        let body = EmbeddingRequest {
            model: &self.embed_model,
            input: texts,
        };

        let response = self
            .authorized(self.client.post(self.embeddings_url.clone()))
            .timeout(self.embed_timeout)
            .json(&body)
            .send()
            .await
            .map_err(|source| InferenceError::Transport {
                endpoint: endpoint.to_string(),
                source,
            })?;

        let response = check_status(endpoint, response).await?;
        let parsed: EmbeddingResponse = response
            .json()
            .await
            .map_err(|e| InferenceError::shape(endpoint, format!("invalid JSON: {e}")))?;

        let vectors = validate_embeddings(endpoint, parsed, texts.len())?;
        debug!(count = vectors.len(), dims = vectors[0].len(), "embeddings received");
        Ok(vectors)
    }

    async fn chat_once(&self, messages: &[ChatMessage]) -> Result<String, InferenceError> {
        let endpoint = self.chat_url.as_str();
        let body = ChatRequest {
            model: &self.chat_model,
            messages,
            temperature: CHAT_TEMPERATURE,
            stream: false,
            max_tokens: self.max_tokens,
        };

        let response = self
            .authorized(self.client.post(self.chat_url.clone()))
            .timeout(self.chat_timeout)
            .json(&body)
            .send()
            .await
            .map_err(|source| InferenceError::Transport {
                endpoint: endpoint.to_string(),
                source,
            })?;

        let response = check_status(endpoint, response).await?;
        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| InferenceError::shape(endpoint, format!("invalid JSON: {e}")))?;

        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message)
            .and_then(|message| message.content)
            .map(|content| content.trim().to_string())
            .filter(|content| !content.is_empty())
            .ok_or_else(|| InferenceError::shape(endpoint, "no message content in first choice"))
    }

    fn authorized(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => request.bearer_auth(key),
            None => request,
        }
    }
}

/// Turn a non-success response into a [`InferenceError::Status`].
async fn check_status(
    endpoint: &str,
    response: reqwest::Response,
) -> Result<reqwest::Response, InferenceError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response
        .text()
        .await
        .unwrap_or_else(|_| "<body unavailable>".to_string());
    let body: String = body.chars().take(MAX_ERROR_BODY).collect();
    Err(InferenceError::Status {
        endpoint: endpoint.to_string(),
        status: status.as_u16(),
        body,
    })
}

/// Enforce the embedding contract: one finite, non-empty vector per input,
/// all of the same dimension, re-ordered by `index` when present.
pub(crate) fn validate_embeddings(
    endpoint: &str,
    mut response: EmbeddingResponse,
    expected: usize,
) -> Result<Vec<Vec<f32>>, InferenceError> {
    if response.data.len() != expected {
        return Err(InferenceError::shape(
            endpoint,
            format!("{} embeddings for {expected} inputs", response.data.len()),
        ));
    }

    if response.data.iter().all(|d| d.index.is_some()) {
        response.data.sort_by_key(|d| d.index);
        let in_range = response
            .data
            .iter()
            .enumerate()
            .all(|(position, d)| d.index == Some(position));
        if !in_range {
            return Err(InferenceError::shape(endpoint, "embedding indexes are not 0..n"));
        }
    }

    let dims = response.data[0].embedding.len();
    if dims == 0 {
        return Err(InferenceError::shape(endpoint, "empty embedding vector"));
    }

    let mut vectors = Vec::with_capacity(expected);
    for data in response.data {
        if data.embedding.len() != dims {
            return Err(InferenceError::shape(
                endpoint,
                format!("ragged embeddings: {} vs {dims} dimensions", data.embedding.len()),
            ));
        }
        if data.embedding.iter().any(|x| !x.is_finite()) {
            return Err(InferenceError::shape(endpoint, "non-finite value in embedding"));
        }
        vectors.push(data.embedding);
    }

    Ok(vectors)
}
