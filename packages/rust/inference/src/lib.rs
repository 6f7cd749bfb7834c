//! Embedding and labeling clients for MarketBrief.
//!
//! The clustering engine depends only on the [`EmbeddingClient`] and
//! [`LabelingClient`] traits, so tests can swap in deterministic fakes.
//! [`InferenceClient`] implements both against an OpenAI-compatible API.

pub mod client;
pub mod error;
pub mod retry;

use std::future::Future;

pub use client::{ChatMessage, InferenceClient};
pub use error::InferenceError;
pub use retry::RetryPolicy;

/// System prompt for topic labeling.
const LABEL_PROMPT: &str = "You name clusters of related news headlines. \
Reply with one short headline-style title (at most 8 words) that covers all of them. \
Reply with the title only, no quotes or punctuation at the end.";

/// Turns texts into fixed-dimension vectors, one per input, in input order.
pub trait EmbeddingClient: Send + Sync + 'static {
    fn embed(
        &self,
        texts: &[String],
    ) -> impl Future<Output = Result<Vec<Vec<f32>>, InferenceError>> + Send;
}

/// Produces a short title for a group of related items.
pub trait LabelingClient: Send + Sync + 'static {
    fn label(&self, context: &str) -> impl Future<Output = Result<String, InferenceError>> + Send;
}

impl EmbeddingClient for InferenceClient {
    fn embed(
        &self,
        texts: &[String],
    ) -> impl Future<Output = Result<Vec<Vec<f32>>, InferenceError>> + Send {
        self.embed_texts(texts)
    }
}

impl LabelingClient for InferenceClient {
    async fn label(&self, context: &str) -> Result<String, InferenceError> {
        let messages = [ChatMessage::system(LABEL_PROMPT), ChatMessage::user(context)];
        self.chat(&messages).await
    }
}
