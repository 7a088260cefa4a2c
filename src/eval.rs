//! Retrieval evaluation over the stored test cases.
//!
//! Each case runs through the [`Retriever`] with its own `top_k` and no
//! extension filter. Results are appended to `test_results`; the cancel
//! flag is checked between cases.

use anyhow::Result;
use std::collections::BTreeSet;
use std::time::Instant;

use crate::config::Settings;
use crate::events::{CancelFlag, EventBus};
use crate::models::{normalize_path, TestResult};
use crate::progress::{EvalProgressEvent, EvalProgressReporter, NoProgress};
use crate::retriever::{Retriever, RetrieverOptions};
use crate::store::Store;

const SOURCE: &str = "eval";

/// Precision@k, recall@k, reciprocal rank and 1-based rank of the first
/// relevant path.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CaseMetrics {
    pub precision_at_k: f64,
    pub recall_at_k: f64,
    pub mrr: f64,
    pub first_rank: Option<usize>,
}

pub fn score_case(retrieved: &[String], expected: &[String], k: usize) -> CaseMetrics {
    let expected: BTreeSet<String> = expected.iter().map(|p| normalize_path(p)).collect();
    let top: Vec<String> = retrieved
        .iter()
        .take(k)
        .map(|p| normalize_path(p))
        .collect();
    let relevant = top.iter().filter(|p| expected.contains(*p)).count();
    let first_rank = top.iter().position(|p| expected.contains(p)).map(|i| i + 1);

    CaseMetrics {
        precision_at_k: if k == 0 {
            0.0
        } else {
            relevant as f64 / k as f64
        },
        recall_at_k: if expected.is_empty() {
            0.0
        } else {
            relevant as f64 / expected.len() as f64
        },
        mrr: first_rank.map_or(0.0, |r| 1.0 / r as f64),
        first_rank,
    }
}

pub async fn run(
    store: &Store,
    settings: &Settings,
    cancel: &CancelFlag,
    events: &EventBus,
) -> Result<Vec<TestResult>> {
    run_with_progress(store, settings, cancel, events, &NoProgress, None).await
}

/// Run every test case. `top_k_override` replaces each case's own `top_k`.
pub async fn run_with_progress(
    store: &Store,
    settings: &Settings,
    cancel: &CancelFlag,
    events: &EventBus,
    progress: &dyn EvalProgressReporter,
    top_k_override: Option<usize>,
) -> Result<Vec<TestResult>> {
    let (cases, malformed) = store.list_test_cases().await?;
    for bad in &malformed {
        events.warn(SOURCE, format!("skipping case {}: {}", bad.id, bad.reason));
    }
    let total = cases.len() as u64;
    events.info(SOURCE, format!("evaluation started: {} cases", total));

    let retriever = Retriever::new(
        store,
        events,
        RetrieverOptions {
            note_chars: settings.note_chars,
            extra_stopwords: vec![settings.assistant_name.clone()],
        },
    );
    let no_filter = BTreeSet::new();
    let mut results = Vec::with_capacity(cases.len());

    for (i, case) in cases.iter().enumerate() {
        if cancel.is_cancelled() {
            events.info(
                SOURCE,
                format!("evaluation cancelled after {} of {} cases", i, total),
            );
            progress.report(EvalProgressEvent::Cancelled {
                done: i as u64,
                total,
            });
            return Ok(results);
        }

        let k = top_k_override.unwrap_or(case.top_k).max(1);
        let started = Instant::now();
        let hits = retriever.search(&case.query, &no_filter, k).await;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        let paths: Vec<String> = hits.into_iter().map(|h| h.path).collect();
        let m = score_case(&paths, &case.expected_paths, k);
        let result = TestResult {
            case_id: case.id,
            precision_at_k: m.precision_at_k,
            recall_at_k: m.recall_at_k,
            mrr: m.mrr,
            first_rank: m.first_rank,
            elapsed_ms,
        };
        if let Err(e) = store.append_test_result(&result).await {
            events.warn(SOURCE, format!("could not save result for case {}: {:#}", case.id, e));
        }
        events.debug(
            SOURCE,
            format!("case {} ({}/{}): mrr {:.2}", case.id, i + 1, total, m.mrr),
        );
        progress.report(EvalProgressEvent::Case {
            n: i as u64 + 1,
            total,
            case_id: case.id,
            mrr: m.mrr,
        });
        results.push(result);
    }

    let mean_mrr = if results.is_empty() {
        0.0
    } else {
        results.iter().map(|r| r.mrr).sum::<f64>() / results.len() as f64
    };
    events.success(
        SOURCE,
        format!("evaluation finished: {} cases, mean MRR {:.3}", results.len(), mean_mrr),
    );
    Ok(results)
}
