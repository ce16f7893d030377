//! Per-request response markers.
//!
//! A marker is a single line of the form `[[OC=<rid>.<tag>]]` appended to
//! every prompt the bridge sends. The tag is a truncated keyed MAC over the
//! request id, so the extractor can cut the accessibility dump at the last
//! occurrence of a string no user or model plausibly produces.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

pub const MARKER_PREFIX: &str = "[[OC=";
pub const MARKER_SUFFIX: &str = "]]";

const TAG_CHARS: usize = 16;

/// Builds the marker line for a request id. Deterministic in
/// `(request_id, secret)`; distinct request ids produce distinct tags.
#[must_use]
pub fn make_marker(request_id: &str, secret: &str) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .expect("HMAC can take key of any size");
    mac.update(request_id.as_bytes());
    let digest = mac.finalize().into_bytes();
    let mut tag = URL_SAFE_NO_PAD.encode(digest);
    tag.truncate(TAG_CHARS);
    format!("{MARKER_PREFIX}{request_id}.{tag}{MARKER_SUFFIX}")
}

/// True when `text` contains anything that looks like a bridge marker,
/// complete or leaked as a fragment.
#[must_use]
pub fn contains_marker_fragment(text: &str) -> bool {
    text.contains(MARKER_PREFIX)
}

/// Returns the marker line an anchor (pre-send prompt) ends with, if any.
/// The marker must be the last non-empty line and a well-formed
/// `[[OC=...]]` token on its own.
#[must_use]
pub fn anchor_marker(anchor: &str) -> Option<&str> {
    let line = anchor.trim_end().lines().next_back()?.trim();
    if line.starts_with(MARKER_PREFIX)
        && line.ends_with(MARKER_SUFFIX)
        && line.len() > MARKER_PREFIX.len() + MARKER_SUFFIX.len()
        && !line[MARKER_PREFIX.len()..line.len() - MARKER_SUFFIX.len()]
            .contains(['[', ']', '\n'])
    {
        Some(line)
    } else {
        None
    }
}

/// Byte offset just past the last occurrence of `marker` in `text`.
#[must_use]
pub fn after_last_occurrence(text: &str, marker: &str) -> Option<usize> {
    text.rfind(marker).map(|pos| pos + marker.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "marker-test-secret";

    #[test]
    fn marker_is_deterministic_per_request_id() {
        let a = make_marker("req-1", SECRET);
        let b = make_marker("req-1", SECRET);
        assert_eq!(a, b);
    }

    #[test]
    fn distinct_request_ids_yield_distinct_markers() {
        assert_ne!(make_marker("req-1", SECRET), make_marker("req-2", SECRET));
    }

    #[test]
    fn distinct_secrets_yield_distinct_markers() {
        assert_ne!(
            make_marker("req-1", SECRET),
            make_marker("req-1", "other-secret")
        );
    }

    #[test]
    fn marker_is_a_single_clean_line() {
        let marker = make_marker("req-42", SECRET);
        assert!(marker.starts_with("[[OC=req-42."));
        assert!(marker.ends_with("]]"));
        assert!(!marker.contains('\n'));
        let tag = &marker["[[OC=req-42.".len()..marker.len() - 2];
        assert_eq!(tag.len(), 16);
        assert!(
            tag.chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        );
    }

    #[test]
    fn anchor_marker_finds_trailing_marker_line() {
        let marker = make_marker("req-7", SECRET);
        let anchor = format!("tell me a joke\n\n{marker}");
        assert_eq!(anchor_marker(&anchor), Some(marker.as_str()));
        assert_eq!(anchor_marker("tell me a joke"), None);
        assert_eq!(anchor_marker(&format!("{marker}\nmore text")), None);
    }

    #[test]
    fn after_last_occurrence_prefers_the_last_echo() {
        let marker = make_marker("req-9", SECRET);
        let text = format!("{marker} echoed early\nsome ui\n{marker}\nanswer");
        let cut = after_last_occurrence(&text, &marker).unwrap();
        assert_eq!(&text[cut..], "\nanswer");
    }
}
