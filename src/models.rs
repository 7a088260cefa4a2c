//! Plain data types shared by the store, retrievers and the orchestrator.
//!
//! Every value here is owned data; components exchange snapshots by value,
//! never handles into the store.

use serde::{Deserialize, Serialize};

/// Normalize a document path for persistence and lookup: separators become
/// `/`, repeated separators collapse, and the whole path is case-folded.
pub fn normalize_path(path: &str) -> String {
    let unified = path.trim().replace('\\', "/");
    let mut out = String::with_capacity(unified.len());
    let mut prev_slash = false;
    for (i, ch) in unified.chars().enumerate() {
        if ch == '/' {
            // keep a leading `//` for UNC shares
            if prev_slash && i > 1 {
                continue;
            }
            prev_slash = true;
        } else {
            prev_slash = false;
        }
        out.extend(ch.to_lowercase());
    }
    if out.len() > 1 && out.ends_with('/') {
        out.pop();
    }
    out
}

/// Final path component of a (normalized or raw) path.
pub fn basename(path: &str) -> &str {
    path.rsplit(['/', '\\']).next().unwrap_or(path)
}

/// Parent directory of a path, empty for bare names.
pub fn parent_dir(path: &str) -> &str {
    match path.rfind(['/', '\\']) {
        Some(idx) => &path[..idx],
        None => "",
    }
}

/// Lowercase extension with a leading dot (`".pdf"`), or empty.
pub fn extension(path: &str) -> String {
    let name = basename(path);
    match name.rfind('.') {
        Some(idx) if idx > 0 && idx + 1 < name.len() => name[idx..].to_lowercase(),
        _ => String::new(),
    }
}

/// Normalize a user-supplied extension (`"PDF"`, `"pdf"`, `".pdf"`) to `".pdf"`.
pub fn normalize_ext(ext: &str) -> String {
    let trimmed = ext.trim().trim_start_matches('.').to_lowercase();
    if trimmed.is_empty() {
        String::new()
    } else {
        format!(".{}", trimmed)
    }
}

/// A chunk of extracted text with its vector, as read for dense retrieval.
#[derive(Debug, Clone)]
pub struct ChunkVector {
    pub chunk_id: i64,
    pub text: String,
    pub path: String,
    pub vector: Vec<f32>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PinnedSource {
    pub path: String,
    pub weight: f64,
    pub note: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConceptSource {
    pub path: String,
    pub weight: f64,
    pub note: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConceptSummary {
    pub slug: String,
    pub title: String,
    pub body: String,
    pub tags: Vec<String>,
    pub aliases: Vec<String>,
    pub sources: Vec<ConceptSource>,
}

/// A lookup row: the normalized path, the path as the scanner stored it and
/// the matched value.
#[derive(Debug, Clone, PartialEq)]
pub struct PathMatch {
    pub path: String,
    pub fullpath: String,
    pub value: String,
}

/// Keywords and note of one document.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Evidence {
    pub keywords: Vec<String>,
    pub note: String,
}

/// A ranked lexical hit.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Hit {
    pub path: String,
    pub name: String,
    pub ext: String,
    pub score: f64,
    /// Keywords joined with `", "`.
    pub keywords: String,
    /// Note, truncated to the configured length.
    pub note: String,
    pub kw_count: u32,
    pub note_count: u32,
    pub fname_count: u32,
}

/// A dense-retrieval fragment.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Fragment {
    pub chunk_id: i64,
    pub path: String,
    pub text: String,
    pub score: f32,
}

/// A source reference persisted alongside a Q&A record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceRef {
    pub name: String,
    pub path: String,
    pub note: String,
    pub score: f64,
}

impl From<&Hit> for SourceRef {
    fn from(hit: &Hit) -> Self {
        SourceRef {
            name: hit.name.clone(),
            path: hit.path.clone(),
            note: truncate_chars(&hit.note, 160),
            score: hit.score,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct QaRecord {
    pub id: i64,
    pub ts: String,
    pub query: String,
    pub answer: String,
    pub model: String,
    pub rating: Option<i64>,
    pub feedback: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TestCase {
    pub id: i64,
    pub query: String,
    pub expected_paths: Vec<String>,
    pub top_k: usize,
}

/// A stored case that cannot be run.
#[derive(Debug, Clone, PartialEq)]
pub struct MalformedCase {
    pub id: i64,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct TestResult {
    pub case_id: i64,
    pub precision_at_k: f64,
    pub recall_at_k: f64,
    pub mrr: f64,
    pub first_rank: Option<usize>,
    pub elapsed_ms: u64,
}

/// Truncate to at most `max` characters, appending `…` when cut.
pub fn truncate_chars(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    let mut out: String = text.chars().take(max.saturating_sub(1)).collect();
    out.push('…');
    out
}
