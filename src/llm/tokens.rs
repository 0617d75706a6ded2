//! Local token estimate used when a provider does not report usage.

use super::types::{Message, Usage};

const CHARS_PER_TOKEN: usize = 4;
const MESSAGE_OVERHEAD: u32 = 4;

pub fn estimate_tokens(text: &str) -> u32 {
    let chars = text.chars().count();
    chars.div_ceil(CHARS_PER_TOKEN) as u32
}

pub fn estimate_usage(messages: &[Message], output: &str) -> Usage {
    let input = messages
        .iter()
        .map(|m| estimate_tokens(&m.content) + MESSAGE_OVERHEAD)
        .sum();
    Usage {
        input_tokens: input,
        output_tokens: estimate_tokens(output),
    }
}
