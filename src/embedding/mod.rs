//! Query-time encoders and vector utilities.
//!
//! The index records which encoder produced its vectors as an
//! [`EmbeddingSignature`] (`<backend>:<dim>[:<model>]`, stored under the
//! `embedding_sig` key of `rag_meta`). [`resolve_provider`] turns that
//! signature back into an encoder:
//!
//! - **[`HashProvider`]** — deterministic feature hashing, for `hash:<dim>` indexes.
//! - **[`LocalProvider`]** — sentence-embedding model run locally via fastembed,
//!   for `st:<dim>:<model>` indexes.
//!
//! A signature naming a sentence model never falls back to hashing: the two
//! vector spaces are unrelated and the hits would be noise.
//!
//! Also provides the BLOB codec and similarity used by the RAG retriever:
//! - [`cosine_similarity`] — similarity between two vectors
//! - [`vec_to_blob`] — encode a `Vec<f32>` as little-endian bytes
//! - [`blob_to_vec`] — decode a BLOB back into a `Vec<f32>`

use anyhow::{bail, Result};
use sha2::{Digest, Sha256};
use std::fmt;
use std::path::Path;

use crate::error::AssistantError;
use crate::text;

/// Key under which the index stores its signature.
pub const SIGNATURE_KEY: &str = "embedding_sig";

/// Trait for query-time encoders.
///
/// Encoding is CPU-bound and synchronous; async callers wrap it in
/// `spawn_blocking`.
pub trait EmbeddingProvider: Send + Sync {
    /// Returns the model identifier (e.g. `"all-minilm-l6-v2"`, `"hash"`).
    fn model_name(&self) -> &str;
    /// Returns the embedding vector dimensionality.
    fn dims(&self) -> usize;
    /// Embed a batch of texts, one unit-norm vector per input, in order.
    fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
}

/// Embed a single query text.
pub fn embed_query(provider: &dyn EmbeddingProvider, text: &str) -> Result<Vec<f32>> {
    let results = provider.embed(&[text.to_string()])?;
    results
        .into_iter()
        .next()
        .ok_or_else(|| anyhow::anyhow!("Empty embedding response"))
}

// ============ Signature ============

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    Hash,
    SentenceModel,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmbeddingSignature {
    pub backend: Backend,
    pub dims: usize,
    pub model: Option<String>,
}

impl EmbeddingSignature {
    pub fn hash(dims: usize) -> Self {
        Self {
            backend: Backend::Hash,
            dims,
            model: None,
        }
    }

    /// Parse `hash:256` or `st:384:<model-id>`.
    pub fn parse(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        let mut parts = raw.splitn(3, ':');
        let backend = match parts.next().map(str::to_ascii_lowercase).as_deref() {
            Some("hash") => Backend::Hash,
            Some("st") | Some("sentence") => Backend::SentenceModel,
            _ => bail!("Unknown embedding signature: '{}'", raw),
        };
        let dims: usize = match parts.next().map(str::parse) {
            Some(Ok(d)) if d > 0 => d,
            _ => bail!("Embedding signature '{}' lacks a valid dimension", raw),
        };
        let model = parts
            .next()
            .map(str::trim)
            .filter(|m| !m.is_empty())
            .map(str::to_string);
        if backend == Backend::SentenceModel && model.is_none() {
            bail!("Embedding signature '{}' names no model", raw);
        }
        Ok(Self {
            backend,
            dims,
            model,
        })
    }
}

impl fmt::Display for EmbeddingSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.backend, &self.model) {
            (Backend::Hash, _) => write!(f, "hash:{}", self.dims),
            (Backend::SentenceModel, Some(model)) => write!(f, "st:{}:{}", self.dims, model),
            (Backend::SentenceModel, None) => write!(f, "st:{}", self.dims),
        }
    }
}

/// Build the encoder an index was built with.
///
/// Fails with [`AssistantError::EmbeddingDimMismatch`] when the runtime
/// encoder does not produce the dimension the signature declares.
pub fn resolve_provider(
    sig: &EmbeddingSignature,
    embedding_dir: Option<&Path>,
) -> Result<Box<dyn EmbeddingProvider>> {
    let provider: Box<dyn EmbeddingProvider> = match sig.backend {
        Backend::Hash => Box::new(HashProvider::new(sig.dims)),
        Backend::SentenceModel => {
            let model = sig.model.as_deref().unwrap_or_default();
            load_sentence_model(model, embedding_dir)?
        }
    };
    if provider.dims() != sig.dims {
        return Err(AssistantError::EmbeddingDimMismatch {
            stored: sig.dims,
            runtime: provider.dims(),
        }
        .into());
    }
    Ok(provider)
}

#[cfg(feature = "local-embeddings-fastembed")]
fn load_sentence_model(
    model: &str,
    embedding_dir: Option<&Path>,
) -> Result<Box<dyn EmbeddingProvider>> {
    Ok(Box::new(LocalProvider::new(model, embedding_dir)?))
}

#[cfg(not(feature = "local-embeddings-fastembed"))]
fn load_sentence_model(
    model: &str,
    _embedding_dir: Option<&Path>,
) -> Result<Box<dyn EmbeddingProvider>> {
    bail!(
        "Index was built with sentence model '{}'; rebuild with --features local-embeddings-fastembed",
        model
    )
}

// ============ Hash Provider ============

/// Deterministic feature-hashing encoder.
///
/// Each folded token and each adjacent token pair is hashed with SHA-256;
/// the digest picks a bucket and a sign. The result is L2-normalized.
pub struct HashProvider {
    dims: usize,
}

impl HashProvider {
    pub fn new(dims: usize) -> Self {
        Self { dims: dims.max(1) }
    }

    fn embed_one(&self, input: &str) -> Vec<f32> {
        let folded = text::fold(input);
        let tokens = text::raw_tokens(&folded);
        let mut v = vec![0.0f32; self.dims];

        let mut add = |feature: &str, weight: f32| {
            let digest = Sha256::digest(feature.as_bytes());
            let mut idx_bytes = [0u8; 8];
            idx_bytes.copy_from_slice(&digest[..8]);
            let idx = (u64::from_le_bytes(idx_bytes) % self.dims as u64) as usize;
            let sign = if digest[8] & 1 == 0 { 1.0 } else { -1.0 };
            v[idx] += sign * weight;
        };

        for token in &tokens {
            add(token, 1.0);
        }
        for pair in tokens.windows(2) {
            add(&format!("{} {}", pair[0], pair[1]), 0.5);
        }

        normalize(&mut v);
        v
    }
}

impl EmbeddingProvider for HashProvider {
    fn model_name(&self) -> &str {
        "hash"
    }
    fn dims(&self) -> usize {
        self.dims
    }
    fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| self.embed_one(t)).collect())
    }
}

// ============ Local Provider (fastembed) ============

/// Sentence-embedding model run locally via fastembed.
///
/// Models are fetched into the embedding directory on first use and read
/// from there afterwards; no network calls once cached.
#[cfg(feature = "local-embeddings-fastembed")]
pub struct LocalProvider {
    model_name: String,
    dims: usize,
    model: std::sync::Mutex<fastembed::TextEmbedding>,
}

#[cfg(feature = "local-embeddings-fastembed")]
impl LocalProvider {
    pub fn new(model_name: &str, cache_dir: Option<&Path>) -> Result<Self> {
        let model_name = canonical_model_name(model_name);
        let (fastembed_model, dims) = config_to_fastembed_model(&model_name)?;

        let mut options =
            fastembed::InitOptions::new(fastembed_model).with_show_download_progress(false);
        if let Some(dir) = cache_dir {
            options = options.with_cache_dir(dir.to_path_buf());
        }
        let model = fastembed::TextEmbedding::try_new(options)
            .map_err(|e| anyhow::anyhow!("Failed to initialize local embedding model: {}", e))?;

        tracing::info!(model = %model_name, dims, "sentence encoder loaded");
        Ok(Self {
            model_name,
            dims,
            model: std::sync::Mutex::new(model),
        })
    }
}

#[cfg(feature = "local-embeddings-fastembed")]
impl EmbeddingProvider for LocalProvider {
    fn model_name(&self) -> &str {
        &self.model_name
    }
    fn dims(&self) -> usize {
        self.dims
    }
    fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut model = self
            .model
            .lock()
            .map_err(|_| anyhow::anyhow!("embedding model lock poisoned"))?;
        let mut out = model
            .embed(texts.to_vec(), None)
            .map_err(|e| anyhow::anyhow!("Local embedding failed: {}", e))?;
        for v in &mut out {
            normalize(v);
        }
        Ok(out)
    }
}

/// `sentence-transformers/All-MiniLM-L6-v2` → `all-minilm-l6-v2`.
#[cfg_attr(not(feature = "local-embeddings-fastembed"), allow(dead_code))]
fn canonical_model_name(raw: &str) -> String {
    let raw = raw.trim();
    let short = raw.rsplit('/').next().unwrap_or(raw);
    short.to_ascii_lowercase()
}

#[cfg(feature = "local-embeddings-fastembed")]
fn config_to_fastembed_model(name: &str) -> Result<(fastembed::EmbeddingModel, usize)> {
    use fastembed::EmbeddingModel as M;
    match name {
        "all-minilm-l6-v2" => Ok((M::AllMiniLML6V2, 384)),
        "paraphrase-multilingual-minilm-l12-v2" => Ok((M::ParaphraseMLMiniLML12V2, 384)),
        "bge-small-en-v1.5" => Ok((M::BGESmallENV15, 384)),
        "bge-base-en-v1.5" => Ok((M::BGEBaseENV15, 768)),
        "multilingual-e5-small" => Ok((M::MultilingualE5Small, 384)),
        "multilingual-e5-base" => Ok((M::MultilingualE5Base, 768)),
        "multilingual-e5-large" => Ok((M::MultilingualE5Large, 1024)),
        other => bail!(
            "Unknown local embedding model: '{}'. Supported models: \
             all-minilm-l6-v2, paraphrase-multilingual-minilm-l12-v2, bge-small-en-v1.5, \
             bge-base-en-v1.5, multilingual-e5-small, multilingual-e5-base, multilingual-e5-large",
            other
        ),
    }
}

// ============ Vector utilities ============

fn normalize(v: &mut [f32]) {
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > f32::EPSILON {
        for x in v.iter_mut() {
            *x /= norm;
        }
    }
}

/// Encode a float vector as a BLOB (little-endian f32 bytes).
///
/// ```rust
/// use corpus_assistant::embedding::{vec_to_blob, blob_to_vec};
///
/// let v = vec![1.0f32, -2.5, 3.125];
/// let blob = vec_to_blob(&v);
/// assert_eq!(blob.len(), 12);
/// assert_eq!(blob_to_vec(&blob), v);
/// ```
pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vec.len() * 4);
    for &v in vec {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

/// Decode a BLOB back into a float vector. Trailing partial words are ignored.
pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

/// Cosine similarity in `[-1.0, 1.0]`; `0.0` for empty or mismatched vectors.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;

    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f32::EPSILON {
        return 0.0;
    }

    dot / denom
}
