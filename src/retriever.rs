//! Lexical search over keywords, notes and file names.
//!
//! # Pipeline
//!
//! 1. Fold and tokenize the query; read must/must-not constraints.
//! 2. Expand every token with its plural variants and synonym group.
//! 3. Gather candidates per token from three channels (keyword, note,
//!    name/dir). A path is counted at most once per token per channel.
//! 4. Drop candidates outside the extension filter, keep the best
//!    `MAX_CANDIDATES` by preliminary score, load their keywords and notes
//!    in one batch and drop those failing the constraints against the
//!    evidence blob (keywords + note + basename).
//! 5. Score, sort with deterministic tie-breaks, apply the format
//!    preference, cut at `k`.
//!
//! ```text
//! score = 12·kw + 8·notes + 2·fname + 8·ext_adj − 10·(filename-only ∧ 3 tokens)
//! ```
//!
//! Filename-only candidates are dropped entirely when the query has two
//! tokens or fewer.

use anyhow::Result;
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};

use crate::events::EventBus;
use crate::lexicon::{self, Constraints};
use crate::models::{basename, extension, truncate_chars, Hit};
use crate::store::Store;
use crate::text;

/// Rows fetched per expanded term and channel.
const PER_TERM_LIMIT: usize = 200;
/// Candidates whose evidence is loaded, best preliminary score first.
const MAX_CANDIDATES: usize = 400;

const W_KEYWORD: f64 = 12.0;
const W_NOTE: f64 = 8.0;
const W_FNAME: f64 = 2.0;
const W_EXT: f64 = 8.0;
const FNAME_ONLY_PENALTY: f64 = 10.0;

#[derive(Debug, Clone)]
pub struct RetrieverOptions {
    pub note_chars: usize,
    /// Runtime stopwords such as the assistant's name.
    pub extra_stopwords: Vec<String>,
}

impl Default for RetrieverOptions {
    fn default() -> Self {
        Self {
            note_chars: 240,
            extra_stopwords: Vec::new(),
        }
    }
}

/// A parsed query: search tokens and hard constraints.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedQuery {
    pub tokens: Vec<String>,
    pub constraints: Constraints,
}

pub fn parse_query(query: &str, extra_stopwords: &[String]) -> ParsedQuery {
    let extra: Vec<String> = extra_stopwords.iter().map(|s| text::fold(s)).collect();
    let folded = text::fold(query);
    let constraints = lexicon::extract_constraints(&folded, &extra);
    let tokens = text::tokenize(query, &extra)
        .into_iter()
        .filter(|t| !constraints.must_not.contains(t))
        .collect();
    ParsedQuery {
        tokens,
        constraints,
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Counts {
    kw: u32,
    notes: u32,
    fname: u32,
}

/// Per-path counters and the stored spellings the path was found under.
#[derive(Debug, Clone, Default)]
struct Candidate {
    counts: Counts,
    spellings: BTreeSet<String>,
}

impl Counts {
    fn filename_only(&self) -> bool {
        self.kw == 0 && self.notes == 0 && self.fname > 0
    }
}

/// Score a candidate, or `None` when the filename-only rule drops it.
fn score(counts: Counts, ext: &str, n_tokens: usize) -> Option<f64> {
    let only_fname = counts.filename_only();
    if only_fname && n_tokens <= 2 {
        return None;
    }
    let penalty = if only_fname && n_tokens == 3 {
        FNAME_ONLY_PENALTY
    } else {
        0.0
    };
    Some(
        W_KEYWORD * counts.kw as f64
            + W_NOTE * counts.notes as f64
            + W_FNAME * counts.fname as f64
            + W_EXT * lexicon::ext_adjustment(ext) as f64
            - penalty,
    )
}

fn compare_hits(a: &Hit, b: &Hit) -> Ordering {
    b.score
        .partial_cmp(&a.score)
        .unwrap_or(Ordering::Equal)
        .then(b.kw_count.cmp(&a.kw_count))
        .then(b.note_count.cmp(&a.note_count))
        .then(b.fname_count.cmp(&a.fname_count))
        .then(a.path.len().cmp(&b.path.len()))
        .then(a.path.cmp(&b.path))
}

/// Restrict to preferred formats when the top `k` contain any, then cut.
fn apply_format_preference(mut hits: Vec<Hit>, k: usize) -> Vec<Hit> {
    let top_has_preferred = hits
        .iter()
        .take(k)
        .any(|h| lexicon::is_preferred_ext(&h.ext));
    if top_has_preferred {
        hits.retain(|h| lexicon::is_preferred_ext(&h.ext));
    }
    hits.truncate(k);
    hits
}

pub struct Retriever<'a> {
    store: &'a Store,
    events: &'a EventBus,
    options: RetrieverOptions,
}

impl<'a> Retriever<'a> {
    pub fn new(store: &'a Store, events: &'a EventBus, options: RetrieverOptions) -> Self {
        Self {
            store,
            events,
            options,
        }
    }

    /// Top-`k` hits for `query`. `ext_filter` holds normalized extensions
    /// (`".pdf"`); empty means no filter.
    ///
    /// Never fails: backing errors yield an empty list and a WARN event.
    pub async fn search(&self, query: &str, ext_filter: &BTreeSet<String>, k: usize) -> Vec<Hit> {
        match self.try_search(query, ext_filter, k).await {
            Ok(hits) => hits,
            Err(e) => {
                self.events
                    .warn("retriever", format!("index search failed: {:#}", e));
                Vec::new()
            }
        }
    }

    pub async fn try_search(
        &self,
        query: &str,
        ext_filter: &BTreeSet<String>,
        k: usize,
    ) -> Result<Vec<Hit>> {
        let parsed = parse_query(query, &self.options.extra_stopwords);
        if parsed.tokens.is_empty() || k == 0 {
            return Ok(Vec::new());
        }
        let n_tokens = parsed.tokens.len();

        let candidates = self.gather(&parsed.tokens).await?;

        let mut scored: Vec<(String, Candidate, String, f64)> = Vec::new();
        for (path, candidate) in candidates {
            let ext = extension(&path);
            if !ext_filter.is_empty() && !ext_filter.contains(&ext) {
                continue;
            }
            if let Some(score) = score(candidate.counts, &ext, n_tokens) {
                scored.push((path, candidate, ext, score));
            }
        }
        scored.sort_by(|a, b| {
            b.3.partial_cmp(&a.3)
                .unwrap_or(Ordering::Equal)
                .then(a.0.len().cmp(&b.0.len()))
                .then(a.0.cmp(&b.0))
        });
        scored.truncate(MAX_CANDIDATES);

        let spellings: BTreeMap<String, BTreeSet<String>> = scored
            .iter()
            .map(|(path, c, _, _)| (path.clone(), c.spellings.clone()))
            .collect();
        let mut evidence = self.store.evidence_for(&spellings).await?;

        let mut hits = Vec::new();
        for (path, candidate, ext, score) in scored {
            let found = evidence.remove(&path).unwrap_or_default();
            let name = basename(&path).to_string();

            if !parsed.constraints.is_empty() {
                let blob = text::fold(&format!("{} {} {}", found.keywords.join(" "), found.note, name));
                if !parsed.constraints.admits(&blob) {
                    continue;
                }
            }

            let counts = candidate.counts;
            hits.push(Hit {
                name,
                ext,
                score,
                keywords: found.keywords.join(", "),
                note: truncate_chars(&found.note, self.options.note_chars),
                kw_count: counts.kw,
                note_count: counts.notes,
                fname_count: counts.fname,
                path,
            });
        }

        hits.sort_by(compare_hits);
        let hits = apply_format_preference(hits, k);
        tracing::debug!(query, n_tokens, hits = hits.len(), "lexical search");
        Ok(hits)
    }

    async fn gather(&self, tokens: &[String]) -> Result<BTreeMap<String, Candidate>> {
        let mut candidates: BTreeMap<String, Candidate> = BTreeMap::new();

        for token in tokens {
            let expanded = lexicon::expand(token);
            let mut kw_paths = BTreeSet::new();
            let mut note_paths = BTreeSet::new();
            let mut fname_paths = BTreeSet::new();

            for term in &expanded.terms {
                for m in self.store.keyword_matches(term, PER_TERM_LIMIT).await? {
                    candidates.entry(m.path.clone()).or_default().spellings.insert(m.fullpath);
                    kw_paths.insert(m.path);
                }
                for m in self.store.note_matches(term, PER_TERM_LIMIT).await? {
                    candidates.entry(m.path.clone()).or_default().spellings.insert(m.fullpath);
                    note_paths.insert(m.path);
                }
                for m in self.store.name_or_dir_matches(term, PER_TERM_LIMIT).await? {
                    candidates.entry(m.path.clone()).or_default().spellings.insert(m.fullpath);
                    fname_paths.insert(m.path);
                }
            }

            for path in kw_paths {
                candidates.entry(path).or_default().counts.kw += 1;
            }
            for path in note_paths {
                candidates.entry(path).or_default().counts.notes += 1;
            }
            for path in fname_paths {
                candidates.entry(path).or_default().counts.fname += 1;
            }
        }

        Ok(candidates)
    }
}
