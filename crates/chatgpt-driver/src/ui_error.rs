//! Detection of error banners in scraped UI text.
//!
//! The chat app surfaces its own failures (usage caps, rate limits, captcha
//! walls, network errors) as on-screen text. The detector matches a
//! configurable pattern table against the full scrape; the mapping from
//! pattern code to error kind is fixed.

use serde::Deserialize;

use crate::error::{BridgeError, BridgeErrorKind};

const DEFAULT_RETRY_AFTER_SEC: u64 = 60;

#[derive(Clone, Debug, Deserialize)]
pub struct UiErrorPattern {
    pub code: String,
    pub includes: Vec<String>,
}

#[derive(Clone, Debug)]
pub struct UiErrorDetector {
    patterns: Vec<UiErrorPattern>,
}

#[must_use]
pub fn default_patterns() -> Vec<UiErrorPattern> {
    let table: &[(&str, &[&str])] = &[
        (
            "usage_cap",
            &[
                "you've reached our limit",
                "you have reached your usage cap",
                "usage cap",
            ],
        ),
        (
            "rate_limited",
            &["too many requests", "you're sending messages too quickly"],
        ),
        (
            "network_error",
            &[
                "network error",
                "unable to load conversation",
                "something went wrong while connecting",
            ],
        ),
        ("captcha", &["verify you are human", "complete the captcha"]),
        (
            "auth_required",
            &["your session has expired", "please log in again"],
        ),
    ];
    table
        .iter()
        .map(|(code, includes)| UiErrorPattern {
            code: (*code).to_string(),
            includes: includes.iter().map(|s| (*s).to_string()).collect(),
        })
        .collect()
}

fn kind_for_code(code: &str) -> Option<BridgeErrorKind> {
    match code {
        "usage_cap" => Some(BridgeErrorKind::UsageCap),
        "rate_limited" => Some(BridgeErrorKind::RateLimitedByChatGpt),
        "network_error" => Some(BridgeErrorKind::NetworkError),
        "captcha" => Some(BridgeErrorKind::Captcha),
        "auth_required" => Some(BridgeErrorKind::AuthRequired),
        _ => None,
    }
}

impl UiErrorDetector {
    #[must_use]
    pub fn new(patterns: Vec<UiErrorPattern>) -> Self {
        for pattern in &patterns {
            if kind_for_code(&pattern.code).is_none() {
                tracing::warn!(code = %pattern.code, "ignoring ui error pattern with unknown code");
            }
        }
        Self { patterns }
    }

    #[must_use]
    pub fn with_defaults() -> Self {
        Self::new(default_patterns())
    }

    /// Parses a `UI_ERROR_PATTERNS_JSON` override:
    /// `[{"code": "...", "includes": ["...", ...]}, ...]`.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        let patterns: Vec<UiErrorPattern> = serde_json::from_str(json)?;
        Ok(Self::new(patterns))
    }

    /// Scans one scrape for a known error banner. Case-insensitive substring
    /// match; the first matching pattern wins.
    #[must_use]
    pub fn detect(&self, scrape: &str) -> Option<BridgeError> {
        let haystack = scrape.to_lowercase();
        for pattern in &self.patterns {
            let Some(kind) = kind_for_code(&pattern.code) else {
                continue;
            };
            for needle in &pattern.includes {
                if haystack.contains(&needle.to_lowercase()) {
                    let mut err = BridgeError::new(
                        kind,
                        format!("chat app reported an error: {needle}"),
                    )
                    .with_detail("matched", needle.as_str());
                    if matches!(
                        kind,
                        BridgeErrorKind::UsageCap | BridgeErrorKind::RateLimitedByChatGpt
                    ) {
                        err = err.with_retry_after(DEFAULT_RETRY_AFTER_SEC);
                    }
                    return Some(err);
                }
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_rate_limit_with_retry_hint() {
        let detector = UiErrorDetector::with_defaults();
        let err = detector
            .detect("header\nToo many requests right now\nfooter")
            .unwrap();
        assert_eq!(err.kind, BridgeErrorKind::RateLimitedByChatGpt);
        assert_eq!(err.retry_after_sec, Some(60));
    }

    #[test]
    fn detects_usage_cap_case_insensitively() {
        let detector = UiErrorDetector::with_defaults();
        let err = detector
            .detect("YOU'VE REACHED OUR LIMIT of messages")
            .unwrap();
        assert_eq!(err.kind, BridgeErrorKind::UsageCap);
        assert_eq!(err.retry_after_sec, Some(60));
    }

    #[test]
    fn captcha_and_auth_have_no_retry_hint() {
        let detector = UiErrorDetector::with_defaults();
        let captcha = detector.detect("please Verify you are human").unwrap();
        assert_eq!(captcha.kind, BridgeErrorKind::Captcha);
        assert_eq!(captcha.retry_after_sec, None);

        let auth = detector.detect("Your session has expired.").unwrap();
        assert_eq!(auth.kind, BridgeErrorKind::AuthRequired);
        assert_eq!(auth.retry_after_sec, None);
    }

    #[test]
    fn clean_scrape_matches_nothing() {
        let detector = UiErrorDetector::with_defaults();
        assert!(detector.detect("a perfectly ordinary answer").is_none());
    }

    #[test]
    fn json_override_replaces_the_table() {
        let detector = UiErrorDetector::from_json(
            r#"[{"code": "network_error", "includes": ["offline mode"]}]"#,
        )
        .unwrap();
        assert!(detector.detect("Too many requests").is_none());
        let err = detector.detect("app is in Offline Mode").unwrap();
        assert_eq!(err.kind, BridgeErrorKind::NetworkError);
    }

    #[test]
    fn unknown_codes_are_ignored() {
        let detector = UiErrorDetector::from_json(
            r#"[{"code": "made_up", "includes": ["whatever"]}]"#,
        )
        .unwrap();
        assert!(detector.detect("whatever happened").is_none());
    }
}
