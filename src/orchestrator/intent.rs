//! Intent detection on the folded query.
//!
//! Patterns are tried in order: greeting, filter command, explanation,
//! recommendation, listing. Anything else is a generative question.

use regex::Regex;
use std::collections::BTreeSet;
use std::sync::LazyLock;

use crate::models::normalize_ext;
use crate::text;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilterCommand {
    Only(BTreeSet<String>),
    Clear,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Intent {
    Greeting,
    Filter(FilterCommand),
    Explain,
    Recommend,
    Listing,
    Generative,
}

static GREETING: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^(?:(?:hola|buenas|buenos|dias|tardes|noches|hello|hi|hey|gracias|muchas|thanks|thank|you|que|tal|como|estas|how|are|good|morning|afternoon|evening)\s*)+$",
    )
    .expect("greeting regex")
});

static FILTER_ONLY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^(?:(?:solo|only|unicamente|just|quiero|muestra|mostrar|show)\s+)+(?:(?:pdf|docx|doc|pptx|xlsx|txt)(?:\s+|$)|(?:y|o|and|or)\s+)+$",
    )
    .expect("filter regex")
});

static FILTER_EXT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b(pdf|docx|doc|pptx|xlsx|txt)\b").expect("filter ext regex"));

static FILTER_CLEAR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^(?:quita|quitar|borra|borrar|limpia|limpiar|elimina|clear|reset|remove)\s+(?:(?:los|el|las|todos|the|all)\s+)*(?:filtros?|filters?)$",
    )
    .expect("clear regex")
});

/// Questions about the previous choice, not any "why" question.
static EXPLAIN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?x)
        \b(?:por\s+que|porque)(?:\s+(?:lo|la|los|las|me|nos))?\s+(?:has\s+|habeis\s+|han\s+)?
            (?:elegido|escogido|recomendado|sugerido|seleccionado|elegiste|escogiste|recomendaste|sugeriste|eliges|escoges|recomiendas|sugieres)\b
        | \b(?:por\s+que|porque)\s+(?:este|esta|ese|esa|eso|esto)
            (?:\s+(?:documento|archivo|fichero|informe|manual|resultado|otro|uno))?$
        | \bwhy\b(?:\s+(?:did|do|would|have|has)\s+you)?\s+
            (?:choose|chose|chosen|pick|picked|recommend|recommended|suggest|suggested|select|selected)\b
        | ^why\s+(?:this|that|it)(?:\s+(?:one|document|file|result))?$
        | \bexplain\s+(?:your|the|that|this)\s+(?:choice|pick|recommendation)\b
        ",
    )
    .expect("explain regex")
});

/// Requests for a single pick. A bare "best" inside a question is not one.
static RECOMMEND: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?x)
        ^(?:por\s+favor\s+)?(?:elige|eligeme|escoge|escogeme|recomienda|recomiendame|sugiere|sugiereme)\b
        | \b(?:que|cual)\s+(?:me\s+)?(?:recomiendas|sugieres|eliges)\b
        | \b(?:puedes|podrias)\s+(?:recomendarme|recomendar|elegir|escoger|sugerirme|sugerir)\b
        | \b(?:el|la)\s+mejor\s+(?:documento|archivo|fichero|informe|manual|guia|fuente|opcion)\b
        | ^(?:please\s+)?(?:pick|choose|recommend|suggest|select)\b
        | \b(?:can|could|would)\s+you\s+(?:pick|choose|recommend|suggest)\b
        | \bwhat\s+do\s+you\s+recommend\b
        | \b(?:which|what)\s+(?:one\s+)?is\s+(?:the\s+)?best(?:\s+(?:one|document|file|source|manual|guide|report))?$
        | \bthe\s+best\s+(?:one|document|file|source|manual|guide|report)\b
        ",
    )
    .expect("recommend regex")
});

static LISTING: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^(?:hay|tienes|teneis|existe|existen|is\s+there|are\s+there|do\s+you\s+have|have\s+you\s+got|any)\b|\b(?:lista|listar|listame|muestrame|list|show\s+me)\b",
    )
    .expect("listing regex")
});

/// Folded words joined by single spaces, with the assistant's name removed.
fn normalized(query: &str, assistant_name: &str) -> String {
    let folded = text::fold(query);
    let name = text::fold(assistant_name);
    text::words(&folded)
        .into_iter()
        .filter(|w| name.is_empty() || *w != name)
        .collect::<Vec<_>>()
        .join(" ")
}

pub fn classify(query: &str, assistant_name: &str) -> Intent {
    let q = normalized(query, assistant_name);
    if q.is_empty() {
        return Intent::Generative;
    }
    if GREETING.is_match(&q) {
        return Intent::Greeting;
    }
    if FILTER_CLEAR.is_match(&q) {
        return Intent::Filter(FilterCommand::Clear);
    }
    if FILTER_ONLY.is_match(&q) {
        let exts = FILTER_EXT
            .captures_iter(&q)
            .map(|c| normalize_ext(&c[1]))
            .collect();
        return Intent::Filter(FilterCommand::Only(exts));
    }
    if EXPLAIN.is_match(&q) {
        return Intent::Explain;
    }
    if RECOMMEND.is_match(&q) {
        return Intent::Recommend;
    }
    if LISTING.is_match(&q) {
        return Intent::Listing;
    }
    Intent::Generative
}
