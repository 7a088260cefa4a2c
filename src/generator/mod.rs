//! Local text generation.
//!
//! [`Generator`] is the seam between the answer pipeline and the inference
//! runtime. The llama.cpp backend lives in [`llama`] behind the `llama-cpp`
//! feature; tests drive the pipeline with scripted implementations.
//!
//! Streaming is a pull iterator of [`ChatChunk`]s shaped like the runtime's
//! own output (`{choices:[{delta:{content}}]}` or `{choices:[{text}]}`).
//! Context-overflow recovery lives in [`recovery`], chat templates in
//! [`format`].

pub mod format;
#[cfg(feature = "llama-cpp")]
pub mod llama;
pub mod recovery;

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

use crate::events::EventBus;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: Role, content: String) -> Self {
        Self { role, content }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GenParams {
    pub temperature: f32,
    pub max_tokens: usize,
}

#[derive(Debug, Error)]
pub enum GenerateError {
    #[error("context overflow: {0}")]
    ContextOverflow(String),
    #[error("model not loaded: {0}")]
    NotLoaded(String),
    #[error("generation failed: {0}")]
    Runtime(String),
}

impl GenerateError {
    /// Overflow either reported as such or worded that way by the runtime.
    pub fn is_overflow(&self) -> bool {
        match self {
            GenerateError::ContextOverflow(_) => true,
            GenerateError::Runtime(msg) => msg.to_lowercase().contains("context window"),
            GenerateError::NotLoaded(_) => false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Delta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChunkChoice {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delta: Option<Delta>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChatChunk {
    #[serde(default)]
    pub choices: Vec<ChunkChoice>,
}

impl ChatChunk {
    pub fn delta(content: impl Into<String>) -> Self {
        Self {
            choices: vec![ChunkChoice {
                delta: Some(Delta {
                    content: Some(content.into()),
                }),
                text: None,
            }],
        }
    }

    /// Text carried by the first choice, from either shape.
    pub fn content(&self) -> &str {
        self.choices
            .first()
            .and_then(|c| {
                c.delta
                    .as_ref()
                    .and_then(|d| d.content.as_deref())
                    .or(c.text.as_deref())
            })
            .unwrap_or("")
    }
}

pub type ChatStream = Box<dyn Iterator<Item = Result<ChatChunk, GenerateError>> + Send>;

pub trait Generator: Send + Sync {
    fn model_id(&self) -> &str;

    /// Context window in tokens.
    fn context_size(&self) -> usize;

    /// Deterministic token count; backends override with their tokenizer.
    fn count_tokens(&self, text: &str) -> usize {
        estimate_tokens(text)
    }

    fn chat(&self, messages: &[ChatMessage], params: &GenParams) -> Result<String, GenerateError>;

    fn chat_stream(
        &self,
        messages: &[ChatMessage],
        params: &GenParams,
    ) -> Result<ChatStream, GenerateError>;
}

/// `⌈chars / 3⌉`, used when no tokenizer is available.
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(3)
}

/// Inference threads: `max(2, cpus − 2)`.
pub fn inference_threads() -> usize {
    num_cpus::get().saturating_sub(2).max(2)
}

/// Run a minimal chat on a background thread so the first real turn does
/// not pay for graph compilation and KV allocation.
pub fn spawn_warmup(
    generator: Arc<dyn Generator>,
    events: EventBus,
) -> std::io::Result<std::thread::JoinHandle<()>> {
    std::thread::Builder::new()
        .name("generator-warmup".to_string())
        .spawn(move || {
            let started = std::time::Instant::now();
            let messages = [ChatMessage::new(Role::User, "ok".to_string())];
            let params = GenParams {
                temperature: 0.0,
                max_tokens: 1,
            };
            match generator.chat(&messages, &params) {
                Ok(_) => events.success(
                    "generator",
                    format!(
                        "model {} warmed up in {} ms",
                        generator.model_id(),
                        started.elapsed().as_millis()
                    ),
                ),
                Err(e) => events.warn("generator", format!("warmup failed: {}", e)),
            }
        })
}
