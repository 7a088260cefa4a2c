//! Query and evidence normalization.
//!
//! Both sides of every lexical comparison go through [`fold`]: canonical
//! decomposition, combining marks dropped, lowercase. `"Liquidación"` and
//! `"LIQUIDACION"` therefore compare equal.

use unicode_normalization::char::is_combining_mark;
use unicode_normalization::UnicodeNormalization;

/// Minimum token length kept by [`tokenize`].
pub const MIN_TOKEN_LEN: usize = 3;

/// Greetings, articles, prepositions and filler in Spanish and English.
/// `"sin"`/`"no"` are here because they only matter as negation markers,
/// which [`crate::lexicon::extract_constraints`] reads from the raw text.
const STOPWORDS: &[&str] = &[
    // greetings / courtesy
    "hola", "buenas", "buenos", "dias", "tardes", "noches", "gracias", "por", "favor",
    "hello", "hey", "thanks", "please",
    // articles, pronouns, prepositions
    "el", "la", "los", "las", "un", "una", "unos", "unas", "del", "al", "de", "en",
    "con", "sin", "para", "que", "cual", "cuales", "como", "donde", "sobre", "este",
    "esta", "estos", "estas", "ese", "esa", "eso", "esto", "algo", "algun", "alguna",
    "algunos", "algunas", "hay", "tienes", "tiene", "tengo", "quiero", "busco",
    "necesito", "dame", "dime", "puedes", "sabes", "mas", "muy", "todo", "todos",
    "the", "and", "for", "with", "without", "about", "this", "that", "these", "those",
    "any", "some", "what", "which", "where", "how", "are", "there", "have", "you",
    "does", "can", "find", "show", "give",
    // document words that match everything
    "documento", "documentos", "archivo", "archivos", "fichero", "ficheros",
    "document", "documents", "file", "files",
    // the assistant itself
    "asistente", "assistant",
];

/// Fold a string: NFD, drop combining marks, lowercase.
pub fn fold(text: &str) -> String {
    text.nfd()
        .filter(|c| !is_combining_mark(*c))
        .flat_map(char::to_lowercase)
        .collect()
}

/// Split folded text on non-alphanumerics, keeping tokens of at least
/// [`MIN_TOKEN_LEN`] characters. Stopwords are *not* removed.
pub fn raw_tokens(folded: &str) -> Vec<String> {
    folded
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.chars().count() >= MIN_TOKEN_LEN)
        .map(str::to_string)
        .collect()
}

pub fn is_stopword(token: &str, extra: &[String]) -> bool {
    STOPWORDS.contains(&token) || extra.iter().any(|e| e == token)
}

/// Folded, deduplicated, stopword-free tokens in query order.
///
/// `extra_stopwords` carries runtime additions such as the assistant's
/// configured name.
pub fn tokenize(text: &str, extra_stopwords: &[String]) -> Vec<String> {
    let folded = fold(text);
    let extra: Vec<String> = extra_stopwords.iter().map(|s| fold(s)).collect();
    let mut out: Vec<String> = Vec::new();
    for token in raw_tokens(&folded) {
        if is_stopword(&token, &extra) {
            continue;
        }
        if !out.contains(&token) {
            out.push(token);
        }
    }
    out
}

/// Folded words of any length, for phrase matching (`"no x"`, `"solo pdf"`).
pub fn words(folded: &str) -> Vec<&str> {
    folded
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fold_strips_diacritics() {
        assert_eq!(fold("Liquidación"), "liquidacion");
        assert_eq!(fold("AÑO Pequeño"), "ano pequeno");
        assert_eq!(fold("Über"), "uber");
    }

    #[test]
    fn test_tokenize_drops_short_and_stopwords() {
        let tokens = tokenize("Hola, ¿hay documentos de pagos FEAGA en 2023?", &[]);
        assert_eq!(tokens, vec!["pagos", "feaga", "2023"]);
    }

    #[test]
    fn test_tokenize_extra_stopwords() {
        let tokens = tokenize("Lucía, busca informes", &["Lucía".to_string()]);
        assert_eq!(tokens, vec!["busca", "informes"]);
    }

    #[test]
    fn test_tokenize_no_alnum() {
        assert!(tokenize("¿¡ -- !?", &[]).is_empty());
        assert!(tokenize("a b c de", &[]).is_empty());
    }

    #[test]
    fn test_tokenize_dedup() {
        assert_eq!(tokenize("pago PAGO pagó", &[]), vec!["pago"]);
    }
}
