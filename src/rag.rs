//! Dense retrieval over pre-embedded chunks.
//!
//! The encoder is resolved from the index's stored signature and cached
//! for as long as the signature does not change. Similarity is cosine over
//! unit vectors; an over-fetched pool is re-ranked with the same extension
//! policy as the lexical retriever plus a small filename-overlap bonus.

use anyhow::Result;
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use crate::embedding::{
    self, cosine_similarity, EmbeddingProvider, EmbeddingSignature, SIGNATURE_KEY,
};
use crate::error::AssistantError;
use crate::events::EventBus;
use crate::lexicon;
use crate::models::{basename, extension, normalize_ext, truncate_chars, Fragment};
use crate::store::Store;
use crate::text;

const EXT_WEIGHT: f32 = 0.03;
const OVERLAP_WEIGHT: f32 = 0.05;
const MIN_POOL: usize = 8;
const SOURCE: &str = "rag";

/// Extensions recognized in "only pdf" style phrases.
const FILTERABLE_EXTS: &[&str] = &["pdf", "docx", "doc", "pptx", "xlsx", "xls", "txt", "odt"];

type CachedProvider = (EmbeddingSignature, Arc<dyn EmbeddingProvider>);

pub struct RagRetriever {
    embedding_dir: Option<PathBuf>,
    cache: Mutex<Option<CachedProvider>>,
    events: Option<EventBus>,
}

impl RagRetriever {
    pub fn new(embedding_dir: Option<PathBuf>) -> Self {
        Self {
            embedding_dir,
            cache: Mutex::new(None),
            events: None,
        }
    }

    /// Report index problems on `events` as well as in the log.
    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    fn provider_for(&self, sig: &EmbeddingSignature) -> Result<Arc<dyn EmbeddingProvider>> {
        let mut cache = self
            .cache
            .lock()
            .map_err(|_| anyhow::anyhow!("encoder cache lock poisoned"))?;
        if let Some((cached_sig, provider)) = cache.as_ref() {
            if cached_sig == sig {
                return Ok(provider.clone());
            }
        }
        let provider: Arc<dyn EmbeddingProvider> =
            Arc::from(embedding::resolve_provider(sig, self.embedding_dir.as_deref())?);
        *cache = Some((sig.clone(), provider.clone()));
        Ok(provider)
    }

    /// Top-`k` fragments for `query`.
    ///
    /// An empty `ext_filter` is replaced by one inferred from the query
    /// (`"only pdf"`, `"solo docx"`). Returns an empty list when the index
    /// has no embeddings. Fails with [`AssistantError::EmbeddingDimMismatch`]
    /// when the runtime encoder disagrees with the stored vectors.
    pub async fn fragments(
        &self,
        store: &Store,
        query: &str,
        ext_filter: &BTreeSet<String>,
        k: usize,
    ) -> Result<Vec<Fragment>> {
        if k == 0 || query.trim().is_empty() {
            return Ok(Vec::new());
        }
        let chunks = store.chunks_and_vectors().await?;
        let Some(first) = chunks.first() else {
            return Ok(Vec::new());
        };

        let raw_sig = store.rag_meta(SIGNATURE_KEY, "").await?;
        let sig = if raw_sig.trim().is_empty() {
            let message = format!(
                "index has embeddings but no {} entry; assuming hash:{}",
                SIGNATURE_KEY,
                first.vector.len()
            );
            match &self.events {
                Some(events) => events.warn(SOURCE, message),
                None => tracing::warn!("{}", message),
            }
            EmbeddingSignature::hash(first.vector.len())
        } else {
            EmbeddingSignature::parse(&raw_sig)?
        };

        if let Some(bad) = chunks.iter().find(|c| c.vector.len() != sig.dims) {
            return Err(AssistantError::EmbeddingDimMismatch {
                stored: bad.vector.len(),
                runtime: sig.dims,
            }
            .into());
        }

        let provider = self.provider_for(&sig)?;
        let q = query.to_string();
        let encoder = provider.clone();
        let query_vec =
            tokio::task::spawn_blocking(move || embedding::embed_query(encoder.as_ref(), &q))
                .await??;
        if query_vec.len() != sig.dims {
            return Err(AssistantError::EmbeddingDimMismatch {
                stored: sig.dims,
                runtime: query_vec.len(),
            }
            .into());
        }

        let filter = if ext_filter.is_empty() {
            infer_ext_filter(query)
        } else {
            ext_filter.clone()
        };
        let query_tokens = text::tokenize(query, &[]);

        let mut pool: Vec<(f32, &crate::models::ChunkVector)> = chunks
            .iter()
            .filter(|c| filter.is_empty() || filter.contains(&extension(&c.path)))
            .map(|c| (cosine_similarity(&query_vec, &c.vector), c))
            .collect();
        pool.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
        pool.truncate((3 * k).max(MIN_POOL));

        let mut ranked: Vec<Fragment> = pool
            .into_iter()
            .map(|(sim, c)| Fragment {
                chunk_id: c.chunk_id,
                path: c.path.clone(),
                text: c.text.clone(),
                score: rerank(sim, &c.path, &query_tokens),
            })
            .collect();
        ranked.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.chunk_id.cmp(&b.chunk_id))
        });
        ranked.truncate(k);
        Ok(ranked)
    }
}

fn rerank(sim: f32, path: &str, query_tokens: &[String]) -> f32 {
    let ext_adj = lexicon::ext_adjustment(&extension(path)) as f32;
    let name = text::fold(basename(path));
    let overlap = query_tokens
        .iter()
        .filter(|t| name.contains(t.as_str()))
        .count() as f32;
    sim + EXT_WEIGHT * ext_adj + OVERLAP_WEIGHT * overlap
}

/// Extensions named after "solo"/"only": `"solo pdf y docx"` → `{.pdf, .docx}`.
pub fn infer_ext_filter(query: &str) -> BTreeSet<String> {
    let folded = text::fold(query);
    let words = text::words(&folded);
    let mut out = BTreeSet::new();
    let mut in_scope = false;
    for w in words {
        if matches!(w, "solo" | "only" | "unicamente" | "just") {
            in_scope = true;
            continue;
        }
        if in_scope {
            if FILTERABLE_EXTS.contains(&w) {
                out.insert(normalize_ext(w));
            } else if !matches!(w, "y" | "o" | "and" | "or" | "en" | "in" | "los" | "las" | "the") {
                in_scope = false;
            }
        }
    }
    out
}

/// Render fragments as numbered citations within a character budget of
/// `k · max_chars` (each snippet at most `max_chars`).
pub fn pack_fragments(fragments: &[Fragment], k: usize, max_chars: usize) -> String {
    let budget = k.saturating_mul(max_chars);
    let mut out = String::new();
    let mut used = 0usize;
    for (i, frag) in fragments.iter().take(k).enumerate() {
        let collapsed = frag.text.split_whitespace().collect::<Vec<_>>().join(" ");
        let block = format!(
            "[{}] {}\nFuente: {}",
            i + 1,
            truncate_chars(&collapsed, max_chars),
            frag.path
        );
        let len = block.chars().count();
        if used + len > budget && used > 0 {
            break;
        }
        if !out.is_empty() {
            out.push_str("\n\n");
        }
        out.push_str(&block);
        used += len;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frag(id: i64, path: &str, text: &str) -> Fragment {
        Fragment {
            chunk_id: id,
            path: path.to_string(),
            text: text.to_string(),
            score: 0.5,
        }
    }

    #[test]
    fn test_infer_ext_filter() {
        let f = infer_ext_filter("busca pagos, solo PDF");
        assert_eq!(f.into_iter().collect::<Vec<_>>(), vec![".pdf"]);
        let f = infer_ext_filter("only pdf and docx please");
        assert_eq!(f.len(), 2);
        assert!(infer_ext_filter("pagos pdf").is_empty());
    }

    #[test]
    fn test_rerank_prefers_pdf_and_name_overlap() {
        let tokens = vec!["feaga".to_string()];
        let png = rerank(0.5, "/d/feaga.png", &tokens);
        let pdf = rerank(0.5, "/d/informe.pdf", &tokens);
        let pdf_named = rerank(0.5, "/d/feaga.pdf", &tokens);
        assert!(pdf_named > pdf);
        assert!(pdf > png);
    }

    #[test]
    fn test_pack_fragments_format_and_truncation() {
        let long = "x".repeat(1000);
        let frags = vec![frag(1, "/a.pdf", "hola   mundo\n\ncruel"), frag(2, "/b.pdf", &long)];
        let packed = pack_fragments(&frags, 2, 600);
        assert!(packed.starts_with("[1] hola mundo cruel\nFuente: /a.pdf"));
        assert!(packed.contains("[2] "));
        let second = packed.split("\n\n").nth(1).unwrap();
        let snippet = second.lines().next().unwrap();
        assert_eq!(snippet.chars().count(), 4 + 600);
    }

    #[test]
    fn test_pack_fragments_total_budget() {
        let frags: Vec<Fragment> = (0..4)
            .map(|i| frag(i, "/a.pdf", &"y".repeat(300)))
            .collect();
        let packed = pack_fragments(&frags, 2, 100);
        assert!(packed.chars().count() <= 2 * 100 + 2 * 40);
        assert_eq!(packed.matches("Fuente:").count(), 1);
    }
}
