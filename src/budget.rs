//! Token-budgeted prompt assembly.
//!
//! The system message is built from labeled sections in a fixed order:
//!
//! ```text
//! persona, policy, [CONCEPTS], [OBSERVATIONS], [ROUTES], [INDEX CONTEXT], [REPO CONTEXT]
//! ```
//!
//! Every message costs `ceil(tokens × 1.35) + 16`. The plan fits when
//! `prompt + response_budget ≤ ctx − 64`. Until it does, the knobs are
//! turned in order: fragment size, fragment count, index top-k and note
//! length, response budget; a hard trim of the messages is the last resort.
//! A plan that still does not fit after the trim is a context overflow.

use crate::generator::{ChatMessage, GenerateError, Generator, Role};
use crate::models::{truncate_chars, ConceptSummary, Fragment, Hit, PinnedSource};
use crate::rag::pack_fragments;

pub const TEMPLATE_OVERHEAD: f64 = 1.35;
pub const PER_MESSAGE_TOKENS: usize = 16;
pub const SAFETY_MARGIN: usize = 64;

const MIN_RESPONSE: usize = 64;
const RESPONSE_CLAMP: (usize, usize) = (128, 256);
const RAG_CHARS_FLOOR: usize = 150;
const NOTE_FLOOR: usize = 60;
const MAX_ROUTES: usize = 5;
const MAX_CONCEPTS: usize = 3;
/// The user turn is never trimmed below this many characters.
pub const MIN_USER_CHARS: usize = 80;

/// Labels whose sections are dropped first by [`shrink_messages`].
const FRAGMENT_LABELS: &[&str] = &["[REPO CONTEXT]", "[FRAGMENTS]"];

#[derive(Debug, Clone, Copy)]
pub struct BudgetParams {
    pub ctx: usize,
    pub requested_response: usize,
    pub top_k: usize,
    pub note_chars: usize,
    pub rag_k: usize,
    pub rag_max_chars: usize,
}

pub struct PromptInputs<'a> {
    pub persona: &'a str,
    pub policy: &'a str,
    pub concepts: &'a [ConceptSummary],
    pub hits: &'a [Hit],
    pub pinned: &'a [PinnedSource],
    pub fragments: &'a [Fragment],
    pub user_text: &'a str,
}

#[derive(Debug, Clone)]
pub struct PromptPlan {
    pub messages: Vec<ChatMessage>,
    pub hits_used: Vec<Hit>,
    pub fragments_used: usize,
    pub response_budget: usize,
    pub estimated_tokens: usize,
}

impl PromptPlan {
    pub fn fits(&self, ctx: usize) -> bool {
        self.estimated_tokens + self.response_budget <= ctx.saturating_sub(SAFETY_MARGIN)
    }
}

/// Smaller of the clamped request and 12% of the window.
pub fn initial_response_budget(requested: usize, ctx: usize) -> usize {
    requested
        .clamp(RESPONSE_CLAMP.0, RESPONSE_CLAMP.1)
        .min(ctx * 12 / 100)
}

pub fn estimate_message(generator: &dyn Generator, content: &str) -> usize {
    let raw = generator.count_tokens(content) as f64;
    (raw * TEMPLATE_OVERHEAD).ceil() as usize + PER_MESSAGE_TOKENS
}

pub fn estimate_messages(generator: &dyn Generator, messages: &[ChatMessage]) -> usize {
    messages
        .iter()
        .map(|m| estimate_message(generator, &m.content))
        .sum()
}

struct Knobs {
    rag_k: usize,
    rag_chars: usize,
    top_k: usize,
    note_chars: usize,
    response: usize,
}

pub fn plan(
    generator: &dyn Generator,
    inputs: &PromptInputs<'_>,
    params: &BudgetParams,
) -> Result<PromptPlan, GenerateError> {
    let ctx = params.ctx;
    let limit = ctx.saturating_sub(SAFETY_MARGIN);
    let mut knobs = Knobs {
        rag_k: params.rag_k.min(inputs.fragments.len()),
        rag_chars: params.rag_max_chars,
        top_k: params.top_k.min(inputs.hits.len()),
        note_chars: params.note_chars,
        response: initial_response_budget(params.requested_response, ctx),
    };

    loop {
        let (messages, packed) = assemble(inputs, &knobs);
        let estimated = estimate_messages(generator, &messages);
        if estimated + knobs.response <= limit {
            return Ok(finish(inputs, &knobs, messages, packed, estimated));
        }

        if knobs.rag_k > 0 && knobs.rag_chars > RAG_CHARS_FLOOR {
            knobs.rag_chars = (knobs.rag_chars * 7 / 10).max(RAG_CHARS_FLOOR);
        } else if knobs.rag_k > 0 {
            knobs.rag_k -= 1;
        } else if knobs.top_k > 1 || knobs.note_chars > NOTE_FLOOR {
            if knobs.top_k > 1 {
                knobs.top_k -= 1;
            }
            knobs.note_chars = (knobs.note_chars * 7 / 10).max(NOTE_FLOOR);
        } else if knobs.response > MIN_RESPONSE {
            knobs.response = (knobs.response * 7 / 10).max(MIN_RESPONSE);
        } else {
            let target = limit.saturating_sub(knobs.response);
            let messages = shrink_messages(generator, &messages, target);
            let estimated = estimate_messages(generator, &messages);
            tracing::debug!(estimated, target, "prompt hard-trimmed");
            if estimated + knobs.response > limit {
                return Err(GenerateError::ContextOverflow(format!(
                    "prompt needs {} tokens plus {} for the answer, context window allows {}",
                    estimated, knobs.response, limit
                )));
            }
            let packed = if messages.iter().any(|m| has_fragment_section(&m.content)) {
                packed
            } else {
                0
            };
            return Ok(finish(inputs, &knobs, messages, packed, estimated));
        }
    }
}

fn finish(
    inputs: &PromptInputs<'_>,
    knobs: &Knobs,
    messages: Vec<ChatMessage>,
    fragments_used: usize,
    estimated: usize,
) -> PromptPlan {
    PromptPlan {
        messages,
        hits_used: inputs.hits.iter().take(knobs.top_k).cloned().collect(),
        fragments_used,
        response_budget: knobs.response,
        estimated_tokens: estimated,
    }
}

/// Build the two messages; also returns how many fragments were packed.
fn assemble(inputs: &PromptInputs<'_>, knobs: &Knobs) -> (Vec<ChatMessage>, usize) {
    let mut sections: Vec<String> = vec![inputs.persona.to_string(), inputs.policy.to_string()];

    if !inputs.concepts.is_empty() {
        let mut s = String::from("[CONCEPTS]");
        for c in inputs.concepts.iter().take(MAX_CONCEPTS) {
            s.push_str(&format!("\n- {}: {}", c.title, truncate_chars(&c.body, knobs.note_chars)));
            for src in c.sources.iter().take(2) {
                s.push_str(&format!("\n  source: {}", src.path));
            }
        }
        sections.push(s);
    }

    let hits = &inputs.hits[..knobs.top_k.min(inputs.hits.len())];
    let observed: Vec<&Hit> = hits.iter().filter(|h| !h.note.is_empty()).collect();
    if !observed.is_empty() {
        let mut s = String::from("[OBSERVATIONS]");
        for h in observed {
            s.push_str(&format!("\n- {}: {}", h.name, truncate_chars(&h.note, knobs.note_chars)));
        }
        sections.push(s);
    }

    if !inputs.pinned.is_empty() {
        let mut s = String::from("[ROUTES]");
        for p in inputs.pinned.iter().take(MAX_ROUTES) {
            if p.note.is_empty() {
                s.push_str(&format!("\n- {}", p.path));
            } else {
                s.push_str(&format!("\n- {} ({})", p.path, truncate_chars(&p.note, knobs.note_chars)));
            }
        }
        sections.push(s);
    }

    if !hits.is_empty() {
        let mut s = String::from("[INDEX CONTEXT]");
        for (i, h) in hits.iter().enumerate() {
            s.push_str(&format!("\n{}. {} | {}", i + 1, h.name, h.path));
            if !h.keywords.is_empty() {
                s.push_str(&format!(" | keywords: {}", h.keywords));
            }
        }
        sections.push(s);
    }

    let mut packed_count = 0;
    if knobs.rag_k > 0 {
        let packed = pack_fragments(inputs.fragments, knobs.rag_k, knobs.rag_chars);
        if !packed.is_empty() {
            packed_count = packed.matches("\nFuente: ").count();
            sections.push(format!("[REPO CONTEXT]\n{}", packed));
        }
    }

    let messages = vec![
        ChatMessage::new(Role::System, sections.join("\n\n")),
        ChatMessage::new(Role::User, inputs.user_text.to_string()),
    ];
    (messages, packed_count)
}

fn is_section_header(line: &str) -> bool {
    let line = line.trim();
    line.len() > 2
        && line.starts_with('[')
        && line.ends_with(']')
        && line[1..line.len() - 1]
            .chars()
            .all(|c| c.is_ascii_uppercase() || c == ' ')
}

fn has_fragment_section(content: &str) -> bool {
    content.lines().any(|l| FRAGMENT_LABELS.contains(&l.trim()))
}

fn strip_fragment_sections(content: &str) -> String {
    let mut kept: Vec<&str> = Vec::new();
    let mut skipping = false;
    for line in content.lines() {
        if is_section_header(line) {
            skipping = FRAGMENT_LABELS.contains(&line.trim());
        }
        if !skipping {
            kept.push(line);
        }
    }
    kept.join("\n").trim_end().to_string()
}

/// Longest prefix of `content` whose message estimate fits `max_tokens`,
/// never shorter than `min_chars`.
fn fit_content(generator: &dyn Generator, content: &str, max_tokens: usize, min_chars: usize) -> String {
    if estimate_message(generator, content) <= max_tokens {
        return content.to_string();
    }
    let chars: Vec<char> = content.chars().collect();
    let (mut lo, mut hi) = (min_chars.min(chars.len()), chars.len());
    while lo < hi {
        let mid = (lo + hi + 1) / 2;
        let prefix: String = chars[..mid].iter().collect();
        if estimate_message(generator, &prefix) <= max_tokens {
            lo = mid;
        } else {
            hi = mid - 1;
        }
    }
    chars[..lo].iter().collect()
}

/// Trim messages until their estimate is at most `target` tokens: fragment
/// sections go first, then the user turn down to [`MIN_USER_CHARS`], then
/// the system text. The result can still exceed `target`.
pub fn shrink_messages(
    generator: &dyn Generator,
    messages: &[ChatMessage],
    target: usize,
) -> Vec<ChatMessage> {
    let mut out: Vec<ChatMessage> = messages
        .iter()
        .map(|m| ChatMessage::new(m.role, strip_fragment_sections(&m.content)))
        .collect();

    for role in [Role::User, Role::System] {
        let total = estimate_messages(generator, &out);
        if total <= target {
            break;
        }
        let overflow = total - target;
        if let Some(msg) = out.iter_mut().rev().find(|m| m.role == role) {
            let own = estimate_message(generator, &msg.content);
            let allowed = own.saturating_sub(overflow).max(PER_MESSAGE_TOKENS);
            let floor = if role == Role::User { MIN_USER_CHARS } else { 0 };
            msg.content = fit_content(generator, &msg.content, allowed, floor);
        }
    }
    out
}
