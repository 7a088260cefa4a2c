//! Chat templates, chosen from the model file name.
//!
//! | File name contains          | Format  |
//! |-----------------------------|---------|
//! | `llama-3`, `llama3`         | Llama3  |
//! | `llama-2`, `llama2`         | Llama2  |
//! | `mistral`, `mixtral`        | Mistral |
//! | `phi-3`, `phi3`             | Phi3    |
//! | `gemma`                     | Gemma   |
//! | `qwen`, anything else       | ChatML  |
//!
//! Rendered prompts omit the BOS token; the tokenizer adds it.

use std::path::Path;

use super::{ChatMessage, Role};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatFormat {
    Llama3,
    Llama2,
    Mistral,
    ChatMl,
    Phi3,
    Gemma,
}

impl ChatFormat {
    pub fn detect(model_path: &Path) -> Self {
        let name = model_path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default()
            .to_lowercase()
            .replace('_', "-");
        if name.contains("llama-3") || name.contains("llama3") {
            ChatFormat::Llama3
        } else if name.contains("llama-2") || name.contains("llama2") {
            ChatFormat::Llama2
        } else if name.contains("mistral") || name.contains("mixtral") {
            ChatFormat::Mistral
        } else if name.contains("phi-3") || name.contains("phi3") {
            ChatFormat::Phi3
        } else if name.contains("gemma") {
            ChatFormat::Gemma
        } else {
            ChatFormat::ChatMl
        }
    }

    /// Markers that end a turn if the runtime emits them as text.
    pub fn stop_markers(&self) -> &'static [&'static str] {
        match self {
            ChatFormat::Llama3 => &["<|eot_id|>", "<|start_header_id|>"],
            ChatFormat::Llama2 | ChatFormat::Mistral => &["</s>", "[INST]"],
            ChatFormat::ChatMl => &["<|im_end|>", "<|im_start|>"],
            ChatFormat::Phi3 => &["<|end|>", "<|user|>"],
            ChatFormat::Gemma => &["<end_of_turn>", "<start_of_turn>"],
        }
    }

    /// Render messages and open the assistant turn.
    pub fn render(&self, messages: &[ChatMessage]) -> String {
        match self {
            ChatFormat::Llama3 => {
                let mut out = String::new();
                for m in messages {
                    out.push_str(&format!(
                        "<|start_header_id|>{}<|end_header_id|>\n\n{}<|eot_id|>",
                        role_name(m.role),
                        m.content
                    ));
                }
                out.push_str("<|start_header_id|>assistant<|end_header_id|>\n\n");
                out
            }
            ChatFormat::ChatMl => {
                let mut out = String::new();
                for m in messages {
                    out.push_str(&format!(
                        "<|im_start|>{}\n{}<|im_end|>\n",
                        role_name(m.role),
                        m.content
                    ));
                }
                out.push_str("<|im_start|>assistant\n");
                out
            }
            ChatFormat::Phi3 => {
                let mut out = String::new();
                for m in messages {
                    out.push_str(&format!("<|{}|>\n{}<|end|>\n", role_name(m.role), m.content));
                }
                out.push_str("<|assistant|>\n");
                out
            }
            ChatFormat::Llama2 => render_inst(messages, true),
            ChatFormat::Mistral => render_inst(messages, false),
            ChatFormat::Gemma => {
                let mut out = String::new();
                for (role, content) in fold_system(messages) {
                    let turn = if role == Role::Assistant { "model" } else { "user" };
                    out.push_str(&format!("<start_of_turn>{}\n{}<end_of_turn>\n", turn, content));
                }
                out.push_str("<start_of_turn>model\n");
                out
            }
        }
    }
}

fn role_name(role: Role) -> &'static str {
    match role {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
    }
}

/// Merge system text into the first user turn for formats without a
/// system role.
fn fold_system(messages: &[ChatMessage]) -> Vec<(Role, String)> {
    let system: Vec<&str> = messages
        .iter()
        .filter(|m| m.role == Role::System)
        .map(|m| m.content.as_str())
        .collect();
    let mut pending = system.join("\n\n");
    let mut out = Vec::new();
    for m in messages.iter().filter(|m| m.role != Role::System) {
        if m.role == Role::User && !pending.is_empty() {
            out.push((m.role, format!("{}\n\n{}", pending, m.content)));
            pending.clear();
        } else {
            out.push((m.role, m.content.clone()));
        }
    }
    if !pending.is_empty() {
        out.insert(0, (Role::User, pending));
    }
    out
}

fn render_inst(messages: &[ChatMessage], sys_block: bool) -> String {
    let mut out = String::new();
    let system: Vec<&str> = messages
        .iter()
        .filter(|m| m.role == Role::System)
        .map(|m| m.content.as_str())
        .collect();
    let mut pending_sys = system.join("\n\n");

    for m in messages.iter().filter(|m| m.role != Role::System) {
        match m.role {
            Role::User => {
                let content = if pending_sys.is_empty() {
                    m.content.clone()
                } else if sys_block {
                    format!("<<SYS>>\n{}\n<</SYS>>\n\n{}", pending_sys, m.content)
                } else {
                    format!("{}\n\n{}", pending_sys, m.content)
                };
                pending_sys.clear();
                out.push_str(&format!("[INST] {} [/INST]", content));
            }
            _ => out.push_str(&format!(" {}</s>", m.content)),
        }
    }
    out
}
