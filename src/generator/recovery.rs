//! Context-overflow recovery.
//!
//! When the runtime refuses a prompt as too long, either up front or as
//! the first streamed item, the messages are shrunk with
//! [`budget::shrink_messages`](crate::budget::shrink_messages) and retried
//! once without streaming. A second failure yields [`APOLOGY`] as the
//! assistant text; recovery never returns the overflow to the caller.

use super::{ChatChunk, ChatMessage, ChatStream, GenParams, GenerateError, Generator};
use crate::budget::{self, SAFETY_MARGIN};

pub const APOLOGY: &str = "Sorry, the question and its context are too long for the model. \
Try a shorter question or narrow it with a filter such as \"only pdf\".";

/// A stream that has produced its first item, or a recovered full answer.
pub enum Opened {
    Streaming {
        first: Option<ChatChunk>,
        rest: ChatStream,
    },
    Recovered(String),
}

/// Start a streaming chat, recovering from an overflow on open or on the
/// first chunk.
pub fn open_stream(
    generator: &dyn Generator,
    messages: &[ChatMessage],
    params: &GenParams,
) -> Result<Opened, GenerateError> {
    match generator.chat_stream(messages, params) {
        Ok(mut stream) => match stream.next() {
            Some(Ok(first)) => Ok(Opened::Streaming {
                first: Some(first),
                rest: stream,
            }),
            None => Ok(Opened::Streaming {
                first: None,
                rest: stream,
            }),
            Some(Err(e)) if e.is_overflow() => {
                tracing::warn!(error = %e, "overflow on first chunk, retrying shrunk");
                Ok(Opened::Recovered(retry_shrunk(generator, messages, params)))
            }
            Some(Err(e)) => Err(e),
        },
        Err(e) if e.is_overflow() => {
            tracing::warn!(error = %e, "overflow on stream open, retrying shrunk");
            Ok(Opened::Recovered(retry_shrunk(generator, messages, params)))
        }
        Err(e) => Err(e),
    }
}

/// Non-streaming chat with the same single shrink-and-retry.
pub fn chat_with_recovery(
    generator: &dyn Generator,
    messages: &[ChatMessage],
    params: &GenParams,
) -> Result<String, GenerateError> {
    match generator.chat(messages, params) {
        Err(e) if e.is_overflow() => {
            tracing::warn!(error = %e, "overflow, retrying shrunk");
            Ok(retry_shrunk(generator, messages, params))
        }
        other => other,
    }
}

fn retry_shrunk(generator: &dyn Generator, messages: &[ChatMessage], params: &GenParams) -> String {
    // half the free room, or half the current prompt, whichever is smaller
    let room = generator
        .context_size()
        .saturating_sub(SAFETY_MARGIN + params.max_tokens);
    let current = budget::estimate_messages(generator, messages);
    let target = (room / 2).min(current / 2);
    let shrunk = budget::shrink_messages(generator, messages, target);

    match generator.chat(&shrunk, params) {
        Ok(text) if !text.trim().is_empty() => text,
        Ok(_) => APOLOGY.to_string(),
        Err(e) => {
            tracing::warn!(error = %e, "retry after shrink failed");
            APOLOGY.to_string()
        }
    }
}
