//! Why a document was chosen, and which one to choose.

use crate::lexicon;
use crate::models::{truncate_chars, Hit, PinnedSource};
use crate::text;

const PINNED_WEIGHT: f64 = 10.0;
const PHRASE_IN_TITLE: f64 = 6.0;
const PHRASE_IN_PATH: f64 = 3.0;

/// Extension label for display: `".pdf"` → `"PDF"`.
pub fn ext_label(ext: &str) -> String {
    ext.trim_start_matches('.').to_uppercase()
}

/// Re-score hits for a single-best pick: pinned weight and exact phrases.
pub fn choice_score(hit: &Hit, folded_query: &str, pinned: &[PinnedSource]) -> f64 {
    let mut score = hit.score;
    if let Some(p) = pinned.iter().find(|p| p.path == hit.path) {
        score += PINNED_WEIGHT * p.weight;
    }
    let title = text::fold(&hit.name);
    let path = text::fold(&hit.path);
    for phrase in lexicon::multiword_terms().filter(|t| folded_query.contains(t)) {
        if title.contains(phrase) {
            score += PHRASE_IN_TITLE;
        } else if path.contains(phrase) {
            score += PHRASE_IN_PATH;
        }
    }
    score
}

/// Highest choice score; earlier hits win ties.
pub fn choose_best(hits: &[Hit], query: &str, pinned: &[PinnedSource]) -> Option<Hit> {
    let folded = text::fold(query);
    let mut best: Option<(f64, &Hit)> = None;
    for hit in hits {
        let s = choice_score(hit, &folded, pinned);
        if best.map_or(true, |(b, _)| s > b) {
            best = Some((s, hit));
        }
    }
    best.map(|(_, h)| h.clone())
}

/// Reasons a hit answers `query`, most decisive first.
pub fn reasons(hit: &Hit, query: &str, extra_stopwords: &[String]) -> Vec<String> {
    let mut out = Vec::new();
    if lexicon::is_preferred_ext(&hit.ext) {
        out.push(format!("it is a {}, one of the preferred formats", ext_label(&hit.ext)));
    } else if !hit.ext.is_empty() {
        out.push(format!("it is a {} file", ext_label(&hit.ext)));
    }

    let evidence = text::fold(&format!("{} {}", hit.keywords, hit.note));
    let name = text::fold(&hit.name);
    let path = text::fold(&hit.path);
    let mut terms: Vec<String> = Vec::new();
    let mut name_matches: Vec<String> = Vec::new();
    for token in text::tokenize(query, extra_stopwords) {
        let expanded = lexicon::expand(&token);
        if expanded.terms.iter().any(|t| evidence.contains(t.as_str())) {
            let label = lexicon::canonical_of(&token)
                .map(str::to_string)
                .unwrap_or_else(|| token.clone())
                .to_uppercase();
            if !terms.contains(&label) {
                terms.push(label);
            }
        }
        if name.contains(&token) || path.contains(&token) {
            name_matches.push(token);
        }
    }
    if !terms.is_empty() {
        out.push(format!("its keywords and note mention {}", terms.join(", ")));
    }
    if !hit.note.is_empty() {
        out.push(format!(
            "it has a reviewer note: \"{}\"",
            truncate_chars(&hit.note, 120)
        ));
    }
    if !name_matches.is_empty() {
        out.push(format!(
            "its name or route contains \"{}\"",
            name_matches.join("\", \"")
        ));
    }

    let folded_query = text::fold(query);
    for phrase in lexicon::multiword_terms().filter(|t| folded_query.contains(t)) {
        if name.contains(phrase) {
            out.push(format!("the title contains the exact phrase \"{}\"", phrase));
        } else if path.contains(phrase) {
            out.push(format!("the route contains the exact phrase \"{}\"", phrase));
        }
    }

    if out.is_empty() {
        out.push(format!("it had the highest index score ({:.0})", hit.score));
    }
    out
}

/// Full explanation for the "why this one" follow-up.
pub fn explain(hit: &Hit, query: &str, extra_stopwords: &[String]) -> String {
    let mut s = format!("I chose {} ({}) because:", hit.name, hit.path);
    for r in reasons(hit, query, extra_stopwords) {
        s.push_str("\n- ");
        s.push_str(&r);
    }
    s
}

/// One-line motive attached to a recommendation.
pub fn short_motive(hit: &Hit, query: &str, extra_stopwords: &[String]) -> String {
    reasons(hit, query, extra_stopwords)
        .into_iter()
        .take(2)
        .collect::<Vec<_>>()
        .join("; ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hit(path: &str, score: f64, note: &str, keywords: &str) -> Hit {
        Hit {
            path: path.to_string(),
            name: crate::models::basename(path).to_string(),
            ext: crate::models::extension(path),
            score,
            keywords: keywords.to_string(),
            note: note.to_string(),
            kw_count: 1,
            note_count: 1,
            fname_count: 0,
        }
    }

    #[test]
    fn test_reasons_cite_format_terms_and_note() {
        let h = hit(
            "/docs/feaga/informe pagos 2023.pdf",
            40.0,
            "Resumen de pagos FEAGA del ejercicio",
            "feaga",
        );
        let text = explain(&h, "pagos FEAGA", &[]);
        assert!(text.contains("PDF"));
        assert!(text.contains("FEAGA"));
        assert!(text.contains("reviewer note"));
        assert!(text.contains("\"pagos\""));
    }

    #[test]
    fn test_choose_best_prefers_pinned() {
        let hits = vec![
            hit("/a/uno.pdf", 40.0, "", ""),
            hit("/a/dos.pdf", 35.0, "", ""),
        ];
        let pinned = vec![PinnedSource {
            path: "/a/dos.pdf".to_string(),
            weight: 1.0,
            note: String::new(),
        }];
        assert_eq!(choose_best(&hits, "manual", &pinned).unwrap().path, "/a/dos.pdf");
        assert_eq!(choose_best(&hits, "manual", &[]).unwrap().path, "/a/uno.pdf");
        assert!(choose_best(&[], "manual", &[]).is_none());
    }

    #[test]
    fn test_exact_phrase_bonus_title_over_path() {
        let hits = vec![
            hit("/desarrollo rural/guia.pdf", 30.0, "", ""),
            hit("/docs/programa desarrollo rural.pdf", 30.0, "", ""),
        ];
        let best = choose_best(&hits, "el mejor documento de desarrollo rural", &[]).unwrap();
        assert_eq!(best.path, "/docs/programa desarrollo rural.pdf");
    }
}
