//! Prompt rendering: last-user-message selection, control-metadata
//! stripping, the announce short-circuit, and size validation.

use regex::Regex;
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

/// Synthetic reply for internal announce prompts; no UI interaction happens.
pub const ANNOUNCE_SKIP_TEXT: &str = "ANNOUNCE_SKIP";

/// Bracket-delimited control blocks orchestrators embed in user messages.
const CONTROL_BLOCK_TAGS: &[(&str, &str)] = &[
    ("[SUBAGENT_PREAMBLE]", "[/SUBAGENT_PREAMBLE]"),
    ("[TASK_HEADER]", "[/TASK_HEADER]"),
];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PromptError {
    #[error("messages must contain at least one user message")]
    NoUserMessage,
    #[error("message {index} exceeds max_message_chars ({chars} > {limit})")]
    MessageTooLarge {
        index: usize,
        chars: usize,
        limit: usize,
    },
    #[error("rendered prompt exceeds max_prompt_chars ({chars} > {limit})")]
    PromptTooLarge { chars: usize, limit: usize },
}

#[derive(Clone, Debug, Deserialize)]
pub struct IncomingMessage {
    pub role: String,
    #[serde(default)]
    pub content: Value,
}

impl IncomingMessage {
    /// Message text: a plain string, or the concatenated text parts of an
    /// OpenAI content array.
    #[must_use]
    pub fn text(&self) -> String {
        match &self.content {
            Value::String(text) => text.clone(),
            Value::Array(parts) => parts
                .iter()
                .filter_map(|part| {
                    if part.get("type").and_then(Value::as_str) == Some("text") {
                        part.get("text").and_then(Value::as_str)
                    } else {
                        part.as_str()
                    }
                })
                .collect::<Vec<_>>()
                .join(""),
            _ => String::new(),
        }
    }
}

pub struct PromptRenderer {
    timestamp_header_re: Regex,
    heading_preamble_re: Regex,
}

impl Default for PromptRenderer {
    fn default() -> Self {
        Self::new()
    }
}

impl PromptRenderer {
    #[must_use]
    pub fn new() -> Self {
        Self {
            timestamp_header_re: Regex::new(
                r"^\[?\d{4}-\d{2}-\d{2}[ T]\d{2}:\d{2}(:\d{2})?(Z|[+-]\d{2}:?\d{2})?\]?$",
            )
            .expect("valid literal regex"),
            heading_preamble_re: Regex::new(r"(?i)^#{1,4}\s*(subagent|task)\b")
                .expect("valid literal regex"),
        }
    }

    /// Renders the prompt body from the incoming messages: only the last
    /// user message survives, with embedded control metadata stripped.
    /// System and assistant messages are dropped; the chat app keeps its own
    /// history.
    pub fn render(&self, messages: &[IncomingMessage]) -> Result<String, PromptError> {
        let last_user = messages
            .iter()
            .rev()
            .find(|m| m.role.eq_ignore_ascii_case("user"))
            .ok_or(PromptError::NoUserMessage)?;
        Ok(self.strip_control_metadata(&last_user.text()))
    }

    fn strip_control_metadata(&self, text: &str) -> String {
        let mut text = text.to_string();
        for (open, close) in CONTROL_BLOCK_TAGS {
            text = strip_bracket_blocks(&text, open, close);
        }

        let mut lines: Vec<&str> = text.lines().collect();

        // Heading-delimited subagent preamble: a leading `## Subagent` /
        // `### Task` heading and everything up to the first blank line.
        if let Some(first) = lines.iter().position(|l| !l.trim().is_empty()) {
            if self.heading_preamble_re.is_match(lines[first].trim()) {
                let end = lines[first..]
                    .iter()
                    .position(|l| l.trim().is_empty())
                    .map_or(lines.len(), |offset| first + offset + 1);
                lines.drain(..end);
            }
        }

        // Leading dated timestamp headers.
        while let Some(first) = lines.iter().position(|l| !l.trim().is_empty()) {
            if first > 0 {
                lines.drain(..first);
                continue;
            }
            if self.timestamp_header_re.is_match(lines[0].trim()) {
                lines.remove(0);
            } else {
                break;
            }
        }

        // Leaked marker fragments anywhere in the body.
        lines.retain(|l| !l.contains("[[OC="));

        lines.join("\n").trim().to_string()
    }
}

fn strip_bracket_blocks(text: &str, open: &str, close: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    loop {
        let Some(start) = rest.find(open) else {
            out.push_str(rest);
            break;
        };
        let Some(end) = rest[start..].find(close) else {
            out.push_str(rest);
            break;
        };
        out.push_str(&rest[..start]);
        rest = &rest[start + end + close.len()..];
    }
    out
}

/// Control-prompt short circuit: internal announces never reach the UI.
#[must_use]
pub fn is_announce(prompt: &str) -> bool {
    let collapsed = prompt
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase();
    collapsed == "ping"
        || collapsed.starts_with("[announce]")
        || collapsed.starts_with("announce:")
}

/// Per-message size check against `max_message_chars`.
pub fn validate_message_sizes(
    messages: &[IncomingMessage],
    max_message_chars: usize,
) -> Result<(), PromptError> {
    for (index, message) in messages.iter().enumerate() {
        let chars = message.text().chars().count();
        if chars > max_message_chars {
            return Err(PromptError::MessageTooLarge {
                index,
                chars,
                limit: max_message_chars,
            });
        }
    }
    Ok(())
}

/// Pre-send size check against `max_prompt_chars`.
pub fn validate_prompt_size(prompt: &str, max_prompt_chars: usize) -> Result<(), PromptError> {
    let chars = prompt.chars().count();
    if chars > max_prompt_chars {
        return Err(PromptError::PromptTooLarge {
            chars,
            limit: max_prompt_chars,
        });
    }
    Ok(())
}
