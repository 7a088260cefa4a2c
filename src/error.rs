//! Typed error kinds for the retrieval and answer pipeline.
//!
//! Command boundaries use `anyhow`; these variants exist for the places
//! where a caller must branch on *what* failed (a dimension mismatch is
//! surfaced to the user, a locked store is absorbed, and so on).

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AssistantError {
    /// Nothing usable left after normalization and stopword removal.
    #[error("query is empty after normalization")]
    EmptyQuery,

    /// Backing store locked, missing, or otherwise unreadable.
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    /// Query-time encoder and stored vectors disagree; the index must be rebuilt.
    #[error("embedding dimension mismatch: index has {stored}, encoder produces {runtime}")]
    EmbeddingDimMismatch { stored: usize, runtime: usize },

    #[error("model not loaded: {0}")]
    ModelNotLoaded(String),

    #[error("context overflow: {0}")]
    ContextOverflow(String),

    #[error("cancelled")]
    Cancelled,

    #[error("persistence failure: {0}")]
    Persistence(String),
}

impl AssistantError {
    /// Message shown to the user instead of the raw error.
    pub fn user_message(&self) -> &'static str {
        match self {
            AssistantError::EmptyQuery => {
                "Please be more specific: add a keyword, a programme name or a document type."
            }
            AssistantError::StoreUnavailable(_) => {
                "The index is not available right now; try again in a moment."
            }
            AssistantError::EmbeddingDimMismatch { .. } => {
                "The fragment index needs a rebuild: it was built with a different encoder."
            }
            AssistantError::ModelNotLoaded(_) => {
                "The language model is not loaded; answering from the index only."
            }
            AssistantError::ContextOverflow(_) => {
                "The question and its context do not fit in the model window."
            }
            AssistantError::Cancelled => "Stopped.",
            AssistantError::Persistence(_) => "The answer could not be saved to the history.",
        }
    }
}
