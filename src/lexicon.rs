//! Static domain tables: synonym groups, plural variants, extension
//! preferences and the must/must-not constraint rules.
//!
//! All entries are stored folded (see [`crate::text::fold`]).

use crate::text;

struct SynonymGroup {
    /// Canonical form; also the label used when citing the term.
    canonical: &'static str,
    members: &'static [&'static str],
    /// Mentioning any member requires every hit to carry one of them.
    constraining: bool,
}

const GROUPS: &[SynonymGroup] = &[
    SynonymGroup {
        canonical: "feader",
        members: &["feader", "eafrd", "pdr", "desarrollo rural"],
        constraining: true,
    },
    SynonymGroup {
        canonical: "feaga",
        members: &["feaga", "fega"],
        constraining: true,
    },
    SynonymGroup {
        canonical: "feder",
        members: &["feder", "erdf"],
        constraining: true,
    },
    SynonymGroup {
        canonical: "pago",
        members: &["pago", "pagos", "abono", "anticipo", "liquidacion"],
        constraining: false,
    },
    SynonymGroup {
        canonical: "ayuda",
        members: &["ayuda", "subvencion", "prima"],
        constraining: false,
    },
    SynonymGroup {
        canonical: "control",
        members: &["control", "inspeccion", "verificacion", "auditoria"],
        constraining: false,
    },
    SynonymGroup {
        canonical: "normativa",
        members: &["normativa", "reglamento", "decreto", "orden ministerial"],
        constraining: false,
    },
    SynonymGroup {
        canonical: "manual",
        members: &["manual", "guia", "procedimiento", "instrucciones"],
        constraining: false,
    },
    SynonymGroup {
        canonical: "sigc",
        members: &["sigc", "sistema integrado"],
        constraining: false,
    },
];

/// Words that negate the following word: `"sin sigc"`, `"no anticipos"`.
const NEGATIONS: &[&str] = &["no", "sin", "without", "except", "excepto", "salvo"];

/// Extensions promoted by the format-preference rule.
pub const PREFERRED_EXTS: &[&str] = &[".pdf", ".docx", ".doc"];

const IMAGE_EXTS: &[&str] = &[
    ".png", ".jpg", ".jpeg", ".gif", ".bmp", ".tif", ".tiff", ".webp", ".svg", ".ico",
];

const SOURCE_EXTS: &[&str] = &[
    ".py", ".js", ".ts", ".rs", ".java", ".c", ".cpp", ".h", ".hpp", ".cs", ".go", ".rb",
    ".php", ".sh", ".bat", ".ps1", ".sql", ".json", ".xml", ".html", ".css", ".yml", ".yaml",
];

/// Additive extension adjustment used by both retrievers.
pub fn ext_adjustment(ext: &str) -> i32 {
    match ext {
        ".pdf" | ".docx" => 3,
        ".doc" => 2,
        ".pptx" => 1,
        e if IMAGE_EXTS.contains(&e) || SOURCE_EXTS.contains(&e) => -2,
        _ => 0,
    }
}

pub fn is_preferred_ext(ext: &str) -> bool {
    PREFERRED_EXTS.contains(&ext)
}

/// Simple Spanish/English singular–plural variants of a folded token.
pub fn plural_variants(token: &str) -> Vec<String> {
    let mut out = Vec::new();
    let len = token.chars().count();
    if len < 3 || token.chars().all(|c| c.is_ascii_digit()) {
        return out;
    }
    if let Some(stem) = token.strip_suffix("es") {
        if stem.chars().count() >= 3 && stem.ends_with(['l', 'n', 'r', 'd', 'j', 'z']) {
            out.push(stem.to_string());
        }
    }
    if let Some(stem) = token.strip_suffix('s') {
        if stem.chars().count() >= 3 && !out.iter().any(|v| v == stem) {
            out.push(stem.to_string());
        }
    } else if token.ends_with(['a', 'e', 'i', 'o', 'u']) {
        out.push(format!("{}s", token));
    } else {
        out.push(format!("{}es", token));
    }
    out
}

fn group_for(term: &str) -> Option<&'static SynonymGroup> {
    GROUPS.iter().find(|g| g.members.contains(&term))
}

fn group_for_token(token: &str) -> Option<&'static SynonymGroup> {
    group_for(token).or_else(|| {
        plural_variants(token)
            .iter()
            .find_map(|v| group_for(v.as_str()))
    })
}

/// A query token together with every term that counts as evidence for it.
#[derive(Debug, Clone, PartialEq)]
pub struct ExpandedToken {
    pub token: String,
    pub terms: Vec<String>,
}

/// Union a token with its plural variants and its synonym group.
pub fn expand(token: &str) -> ExpandedToken {
    let mut terms = vec![token.to_string()];
    let push = |t: String, terms: &mut Vec<String>| {
        if !terms.contains(&t) {
            terms.push(t);
        }
    };
    for v in plural_variants(token) {
        push(v, &mut terms);
    }
    if let Some(group) = group_for_token(token) {
        for m in group.members {
            push((*m).to_string(), &mut terms);
        }
    }
    ExpandedToken {
        token: token.to_string(),
        terms,
    }
}

/// Canonical label for a token when it belongs to a synonym group.
pub fn canonical_of(token: &str) -> Option<&'static str> {
    group_for_token(token).map(|g| g.canonical)
}

/// Multiword synonym members, used as exact-phrase bonuses in choice scoring.
pub fn multiword_terms() -> impl Iterator<Item = &'static str> {
    GROUPS
        .iter()
        .flat_map(|g| g.members.iter().copied())
        .filter(|m| m.contains(' '))
}

/// Hard constraints read from the folded query.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Constraints {
    /// Each group needs at least one member present in the evidence blob.
    pub must_any: Vec<Vec<String>>,
    /// Any of these present in the evidence blob drops the candidate.
    pub must_not: Vec<String>,
}

impl Constraints {
    pub fn is_empty(&self) -> bool {
        self.must_any.is_empty() && self.must_not.is_empty()
    }

    /// Check a folded evidence blob.
    pub fn admits(&self, blob: &str) -> bool {
        if self.must_not.iter().any(|n| blob.contains(n.as_str())) {
            return false;
        }
        self.must_any
            .iter()
            .all(|group| group.iter().any(|t| blob.contains(t.as_str())))
    }
}

/// Build constraints from a folded query string.
pub fn extract_constraints(folded: &str, extra_stopwords: &[String]) -> Constraints {
    let words = text::words(folded);
    let mut constraints = Constraints::default();

    for pair in words.windows(2) {
        let (marker, target) = (pair[0], pair[1]);
        if !NEGATIONS.contains(&marker) {
            continue;
        }
        if target.chars().count() < text::MIN_TOKEN_LEN || text::is_stopword(target, extra_stopwords)
        {
            continue;
        }
        if !constraints.must_not.iter().any(|n| n == target) {
            constraints.must_not.push(target.to_string());
        }
    }

    let mut seen: Vec<&'static str> = Vec::new();
    for word in &words {
        if constraints.must_not.iter().any(|n| n == word) {
            continue;
        }
        if let Some(group) = group_for_token(word) {
            if group.constraining && !seen.contains(&group.canonical) {
                seen.push(group.canonical);
                constraints
                    .must_any
                    .push(group.members.iter().map(|m| m.to_string()).collect());
            }
        }
    }

    constraints
}
