//! Closed failure taxonomy shared by the driver and the HTTP surface.
//!
//! Every failure the bridge can surface is one of these kinds. Mapping to
//! HTTP statuses happens at the server boundary only; nothing in this crate
//! knows about status codes.

use serde_json::{Map, Value};
use thiserror::Error;

/// The closed set of bridge failure kinds. `Unknown` is the only escape
/// hatch and indicates a mapping bug upstream.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BridgeErrorKind {
    AppNotRunning,
    AccessibilityDenied,
    UiElementNotFound,
    UiResetFailed,
    UiError,
    UsageCap,
    RateLimitedByChatGpt,
    Captcha,
    AuthRequired,
    NetworkError,
    ConversationNotFound,
    FileContextInvalid,
    FileContextUnsupported,
    FileContextAccessDenied,
    FileContextNotFound,
    PromptTooLarge,
    QueueFull,
    PreviousResponsePending,
    Timeout,
    Unknown,
}

impl BridgeErrorKind {
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::AppNotRunning => "app_not_running",
            Self::AccessibilityDenied => "accessibility_denied",
            Self::UiElementNotFound => "ui_element_not_found",
            Self::UiResetFailed => "ui_reset_failed",
            Self::UiError => "ui_error",
            Self::UsageCap => "usage_cap",
            Self::RateLimitedByChatGpt => "rate_limited_by_chatgpt",
            Self::Captcha => "captcha",
            Self::AuthRequired => "auth_required",
            Self::NetworkError => "network_error",
            Self::ConversationNotFound => "conversation_not_found",
            Self::FileContextInvalid => "file_context_invalid",
            Self::FileContextUnsupported => "file_context_unsupported",
            Self::FileContextAccessDenied => "file_context_access_denied",
            Self::FileContextNotFound => "file_context_not_found",
            Self::PromptTooLarge => "prompt_too_large",
            Self::QueueFull => "queue_full",
            Self::PreviousResponsePending => "previous_response_pending",
            Self::Timeout => "timeout",
            Self::Unknown => "unknown",
        }
    }

    /// Parses a wire/helper code back into a kind. Unrecognized codes fold
    /// into `Unknown` rather than widening the set.
    #[must_use]
    pub fn from_code(code: &str) -> Self {
        match code {
            "app_not_running" => Self::AppNotRunning,
            "accessibility_denied" => Self::AccessibilityDenied,
            "ui_element_not_found" => Self::UiElementNotFound,
            "ui_reset_failed" => Self::UiResetFailed,
            "ui_error" => Self::UiError,
            "usage_cap" => Self::UsageCap,
            "rate_limited_by_chatgpt" => Self::RateLimitedByChatGpt,
            "captcha" => Self::Captcha,
            "auth_required" => Self::AuthRequired,
            "network_error" => Self::NetworkError,
            "conversation_not_found" => Self::ConversationNotFound,
            "file_context_invalid" => Self::FileContextInvalid,
            "file_context_unsupported" => Self::FileContextUnsupported,
            "file_context_access_denied" => Self::FileContextAccessDenied,
            "file_context_not_found" => Self::FileContextNotFound,
            "prompt_too_large" => Self::PromptTooLarge,
            "queue_full" => Self::QueueFull,
            "previous_response_pending" => Self::PreviousResponsePending,
            "timeout" => Self::Timeout,
            _ => Self::Unknown,
        }
    }
}

/// A typed bridge failure. Constructed at the failure site and carried
/// unchanged to the wire mapper.
#[derive(Clone, Debug, Error)]
#[error("{}: {message}", .kind.code())]
pub struct BridgeError {
    pub kind: BridgeErrorKind,
    pub message: String,
    pub details: Map<String, Value>,
    pub retry_after_sec: Option<u64>,
    pub context_reset: Option<bool>,
}

impl BridgeError {
    #[must_use]
    pub fn new(kind: BridgeErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            details: Map::new(),
            retry_after_sec: None,
            context_reset: None,
        }
    }

    #[must_use]
    pub fn with_detail(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.details.insert(key.to_string(), value.into());
        self
    }

    #[must_use]
    pub fn with_retry_after(mut self, seconds: u64) -> Self {
        self.retry_after_sec = Some(seconds);
        self
    }

    #[must_use]
    pub fn with_context_reset(mut self, reset: bool) -> Self {
        self.context_reset = Some(reset);
        self
    }

    #[must_use]
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(BridgeErrorKind::Timeout, message)
    }

    #[must_use]
    pub fn ui_error(message: impl Into<String>, reason: &str) -> Self {
        Self::new(BridgeErrorKind::UiError, message).with_detail("reason", reason)
    }

    /// Kinds the poll loop treats as a recoverable UI outage rather than a
    /// fatal failure.
    #[must_use]
    pub fn is_ui_unavailable(&self) -> bool {
        matches!(
            self.kind,
            BridgeErrorKind::AppNotRunning | BridgeErrorKind::UiElementNotFound
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_round_trip_through_from_code() {
        let kinds = [
            BridgeErrorKind::AppNotRunning,
            BridgeErrorKind::AccessibilityDenied,
            BridgeErrorKind::UiElementNotFound,
            BridgeErrorKind::UiResetFailed,
            BridgeErrorKind::UiError,
            BridgeErrorKind::UsageCap,
            BridgeErrorKind::RateLimitedByChatGpt,
            BridgeErrorKind::Captcha,
            BridgeErrorKind::AuthRequired,
            BridgeErrorKind::NetworkError,
            BridgeErrorKind::ConversationNotFound,
            BridgeErrorKind::FileContextInvalid,
            BridgeErrorKind::FileContextUnsupported,
            BridgeErrorKind::FileContextAccessDenied,
            BridgeErrorKind::FileContextNotFound,
            BridgeErrorKind::PromptTooLarge,
            BridgeErrorKind::QueueFull,
            BridgeErrorKind::PreviousResponsePending,
            BridgeErrorKind::Timeout,
        ];
        for kind in kinds {
            assert_eq!(BridgeErrorKind::from_code(kind.code()), kind);
        }
        assert_eq!(
            BridgeErrorKind::from_code("no_such_code"),
            BridgeErrorKind::Unknown
        );
    }

    #[test]
    fn display_leads_with_the_code() {
        let err = BridgeError::new(BridgeErrorKind::QueueFull, "queue is full")
            .with_retry_after(10);
        assert_eq!(err.to_string(), "queue_full: queue is full");
        assert_eq!(err.retry_after_sec, Some(10));
    }

    #[test]
    fn details_accumulate() {
        let err = BridgeError::ui_error("extraction rejected", "response_not_ready")
            .with_detail("attempts", 3);
        assert_eq!(err.details["reason"], "response_not_ready");
        assert_eq!(err.details["attempts"], 3);
    }
}
