//! Pure extraction of the assistant's reply from an accessibility scrape.
//!
//! The extractor never touches the UI; the poll loop calls it on every
//! iteration. All failures are typed results, never panics or control-flow
//! exceptions.

use std::collections::HashSet;

use regex::Regex;

use crate::marker::{after_last_occurrence, anchor_marker, contains_marker_fragment};

/// Glyph the chat app renders at the insertion point while streaming.
pub const TYPING_CURSOR: char = '\u{258D}';

const SNAPSHOT_WINDOW_CHARS: usize = 1024;
const TAIL_WALK_MIN_FIRST_LINE: usize = 12;
const PROMPT_SUBSTRING_REJECT_CHARS: usize = 120;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExtractionMode {
    Marker,
    SnapshotDelta,
}

impl ExtractionMode {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Marker => "marker",
            Self::SnapshotDelta => "snapshot_delta",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Extraction {
    pub text: String,
    pub mode: ExtractionMode,
}

/// Typed extraction failure. Converted to a `ui_error` only at the driver
/// boundary; inside the poll loop it just means "not done yet".
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExtractReject {
    MarkerNotFound,
    ResponseNotReady,
}

impl ExtractReject {
    #[must_use]
    pub fn reason(&self) -> &'static str {
        match self {
            Self::MarkerNotFound => "marker_not_found",
            Self::ResponseNotReady => "response_not_ready",
        }
    }
}

/// UI label strings the bridge must recognize; overridable per locale or
/// app version through configuration.
#[derive(Clone, Debug)]
pub struct UiLabels {
    pub new_chat: String,
    pub regenerate: String,
    pub continue_generating: String,
}

impl Default for UiLabels {
    fn default() -> Self {
        Self {
            new_chat: "New chat".to_string(),
            regenerate: "Regenerate".to_string(),
            continue_generating: "Continue generating".to_string(),
        }
    }
}

/// Accessibility-tree artifacts and toolbar captions that show up as their
/// own static-text elements around the reply.
const BUILTIN_NOISE_LABELS: &[&str] = &[
    "copy",
    "copy code",
    "copy link",
    "share",
    "like",
    "dislike",
    "good response",
    "bad response",
    "read aloud",
    "edit message",
    "search",
    "voice",
    "stop generating",
    "send message",
    "attach",
    "button",
    "text",
    "static text",
    "image",
    "group",
    "toolbar",
    "scroll area",
    "scrollbar",
    "window",
];

pub struct Extractor {
    noise_labels: HashSet<String>,
    completion_labels: Vec<String>,
    version_re: Regex,
    thinking_re: Regex,
}

impl Extractor {
    #[must_use]
    pub fn new(labels: &UiLabels) -> Self {
        let mut noise_labels: HashSet<String> = BUILTIN_NOISE_LABELS
            .iter()
            .map(|s| (*s).to_string())
            .collect();
        noise_labels.insert(labels.new_chat.to_lowercase());
        noise_labels.insert(labels.regenerate.to_lowercase());
        noise_labels.insert(labels.continue_generating.to_lowercase());
        let completion_labels = vec![
            labels.regenerate.to_lowercase(),
            labels.continue_generating.to_lowercase(),
        ];
        Self {
            noise_labels,
            completion_labels,
            version_re: Regex::new(r"^chatgpt \d+(\.\d+)*$").expect("valid literal regex"),
            thinking_re: Regex::new(
                r"^(thinking\b.*|thought for .*|réflexion\b.*|reflexion\b.*|raisonnement\b.*|pensé[e]? .*)$",
            )
            .expect("valid literal regex"),
        }
    }

    /// Whether any completion indicator label is visible in the scrape.
    #[must_use]
    pub fn completion_indicators_present(&self, full_text: &str) -> bool {
        let haystack = full_text.to_lowercase();
        self.completion_labels
            .iter()
            .any(|label| haystack.contains(label))
    }

    /// Extracts the reply segment from one scrape.
    ///
    /// `anchor` is the pre-send prompt; when it ends with a bridge marker the
    /// strict marker path is used and snapshot-delta is never attempted.
    /// `snapshot` is the pre-send scrape used by the legacy delta fallback.
    pub fn extract(
        &self,
        full_text: &str,
        anchor: &str,
        snapshot: Option<&str>,
    ) -> Result<Extraction, ExtractReject> {
        if full_text.trim().is_empty() {
            return Err(ExtractReject::ResponseNotReady);
        }
        match anchor_marker(anchor) {
            Some(marker) => self.extract_after_marker(full_text, anchor, marker),
            None => self.extract_legacy(full_text, anchor, snapshot),
        }
    }

    fn extract_after_marker(
        &self,
        full_text: &str,
        anchor: &str,
        marker: &str,
    ) -> Result<Extraction, ExtractReject> {
        let Some(cut) = after_last_occurrence(full_text, marker) else {
            return Err(ExtractReject::MarkerNotFound);
        };
        let prompt_body = anchor
            .trim_end()
            .strip_suffix(marker)
            .unwrap_or(anchor)
            .trim_end();
        let cleaned = self.clean_segment(&full_text[cut..], prompt_body);
        self.validate(&cleaned, prompt_body).map(|text| Extraction {
            text,
            mode: ExtractionMode::Marker,
        })
    }

    fn extract_legacy(
        &self,
        full_text: &str,
        anchor: &str,
        snapshot: Option<&str>,
    ) -> Result<Extraction, ExtractReject> {
        let prompt = anchor.trim();
        if !prompt.is_empty() {
            for pos in [full_text.rfind(prompt), full_text.find(prompt)]
                .into_iter()
                .flatten()
            {
                let cleaned = self.clean_segment(&full_text[pos + prompt.len()..], prompt);
                if let Ok(text) = self.validate(&cleaned, prompt) {
                    return Ok(Extraction {
                        text,
                        mode: ExtractionMode::Marker,
                    });
                }
            }
            if let Some(candidate) = self.tail_walk(full_text, prompt) {
                let cleaned = self.clean_segment(&candidate, prompt);
                if let Ok(text) = self.validate(&cleaned, prompt) {
                    return Ok(Extraction {
                        text,
                        mode: ExtractionMode::Marker,
                    });
                }
            }
        }
        if let Some(snap) = snapshot {
            let tail = suffix_after_overlap(snap, full_text);
            let cleaned = self.clean_segment(tail, prompt);
            if let Ok(text) = self.validate(&cleaned, prompt) {
                return Ok(Extraction {
                    text,
                    mode: ExtractionMode::SnapshotDelta,
                });
            }
        }
        Err(ExtractReject::ResponseNotReady)
    }

    /// Walks lines from the end of the scrape, skipping noise, until a line
    /// matching the prompt's first line bounds the reply from above.
    fn tail_walk(&self, full_text: &str, prompt: &str) -> Option<String> {
        let first_line = normalize_line(prompt.lines().find(|l| !l.trim().is_empty())?);
        if first_line.chars().count() < TAIL_WALK_MIN_FIRST_LINE {
            return None;
        }
        let mut collected: Vec<&str> = Vec::new();
        let mut bounded = false;
        for line in full_text.lines().rev() {
            if normalize_line(line) == first_line {
                bounded = true;
                break;
            }
            if !self.is_noise_line(line) {
                collected.push(line);
            }
        }
        if !bounded || collected.is_empty() {
            return None;
        }
        collected.reverse();
        Some(collected.join("\n"))
    }

    /// Noise strip + leading prompt-echo strip + AX duplication collapse.
    fn clean_segment(&self, segment: &str, prompt: &str) -> String {
        let mut lines: Vec<&str> = segment
            .lines()
            .filter(|line| !self.is_noise_line(line))
            .collect();

        let prompt_lines: HashSet<String> = prompt
            .lines()
            .map(normalize_line)
            .filter(|l| !l.is_empty())
            .collect();
        let mut start = 0;
        while start < lines.len() {
            let line = lines[start].trim();
            let normalized = normalize_line(line);
            let is_echo = normalized.is_empty()
                || prompt_lines.contains(&normalized)
                || line == "[FILE_CONTEXT]"
                || line == "[/FILE_CONTEXT]"
                || line.starts_with("--- BEGIN FILE")
                || line.starts_with("--- END FILE")
                || line.starts_with("path:");
            if !is_echo {
                break;
            }
            start += 1;
        }
        lines.drain(..start);

        collapse_duplicate_halves(lines.join("\n").trim())
    }

    fn validate(&self, text: &str, prompt: &str) -> Result<String, ExtractReject> {
        let trimmed = text.trim();
        if trimmed.is_empty() || only_invisible(trimmed) {
            return Err(ExtractReject::ResponseNotReady);
        }
        if contains_marker_fragment(trimmed) {
            return Err(ExtractReject::ResponseNotReady);
        }
        let normalized = normalize_block(trimmed);
        let prompt_normalized = normalize_block(prompt);
        if normalized == prompt_normalized {
            return Err(ExtractReject::ResponseNotReady);
        }
        if prompt_normalized.contains(&normalized)
            && (normalized.chars().count() >= PROMPT_SUBSTRING_REJECT_CHARS
                || normalized.contains('\n'))
        {
            return Err(ExtractReject::ResponseNotReady);
        }
        if trimmed.lines().all(|line| {
            let t = line.trim();
            t.is_empty() || only_invisible(t) || self.is_noise_line(t)
        }) {
            return Err(ExtractReject::ResponseNotReady);
        }
        Ok(trimmed.to_string())
    }

    fn is_noise_line(&self, line: &str) -> bool {
        let stripped: String = line
            .chars()
            .filter(|c| !is_invisible(*c) && *c != TYPING_CURSOR)
            .collect();
        let trimmed = stripped.trim();
        if trimmed.is_empty() {
            // A line that was only cursor/zero-width glyphs is noise; a line
            // that was genuinely blank is structure and kept.
            return !line.trim().is_empty();
        }
        let lower = trimmed.to_lowercase();
        self.noise_labels.contains(&lower)
            || self.version_re.is_match(&lower)
            || self.thinking_re.is_match(&lower)
    }
}

/// Whether the scrape still shows the streaming insertion cursor.
#[must_use]
pub fn has_typing_cursor(text: &str) -> bool {
    text.contains(TYPING_CURSOR)
}

/// Whitespace-collapsed, zero-width-free normalization used for stability
/// comparison and prompt-equality checks.
#[must_use]
pub fn normalize_block(text: &str) -> String {
    text.lines()
        .map(normalize_line)
        .filter(|l| !l.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

fn normalize_line(line: &str) -> String {
    line.split_whitespace()
        .map(|word| {
            word.chars()
                .filter(|c| !is_invisible(*c) && *c != TYPING_CURSOR)
                .collect::<String>()
        })
        .filter(|w| !w.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

fn is_invisible(c: char) -> bool {
    matches!(
        c,
        '\u{200B}' | '\u{200C}' | '\u{200D}' | '\u{2060}' | '\u{FEFF}' | '\u{FFFC}'
    )
}

fn only_invisible(text: &str) -> bool {
    text.chars().all(|c| c.is_whitespace() || is_invisible(c) || c == TYPING_CURSOR)
}

/// Accessibility trees frequently report the same element twice; when the
/// result is two identical halves (by chars or by lines), keep one.
fn collapse_duplicate_halves(text: &str) -> String {
    let trimmed = text.trim();
    let chars: Vec<char> = trimmed.chars().collect();
    if chars.len() >= 2 && chars.len() % 2 == 0 {
        let (a, b) = chars.split_at(chars.len() / 2);
        if a == b {
            return a.iter().collect::<String>().trim().to_string();
        }
    }
    let lines: Vec<&str> = trimmed.lines().collect();
    if lines.len() >= 2 && lines.len() % 2 == 0 {
        let (a, b) = lines.split_at(lines.len() / 2);
        if a == b {
            return a.join("\n").trim().to_string();
        }
    }
    trimmed.to_string()
}

/// Suffix of `full` after its longest overlap with the pre-send `snapshot`:
/// either the snapshot's trailing window located in `full`, or the longest
/// common prefix of the two.
fn suffix_after_overlap<'a>(snapshot: &str, full: &'a str) -> &'a str {
    let window_start = snapshot
        .char_indices()
        .rev()
        .nth(SNAPSHOT_WINDOW_CHARS - 1)
        .map_or(0, |(i, _)| i);
    let window = &snapshot[window_start..];
    if !window.trim().is_empty() {
        if let Some(pos) = full.rfind(window) {
            return &full[pos + window.len()..];
        }
    }
    let mut boundary = 0;
    for ((i, a), b) in full.char_indices().zip(snapshot.chars()) {
        if a != b {
            break;
        }
        boundary = i + a.len_utf8();
    }
    &full[boundary..]
}
