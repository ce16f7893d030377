use axum::body::{Body, Bytes};
use axum::http::{HeaderMap, HeaderName, HeaderValue, header};
use axum::response::Response;
use http_body_util::{BodyExt, Limited};

use super::{AppState, BRIDGE_VERSION};

const MAX_CLIENT_REQUEST_ID_LEN: usize = 128;

/// Header values echoed on every response.
pub(super) struct ResponseMeta {
    pub request_id: String,
    pub context_reset: bool,
    pub session_slot: String,
    pub conversation_id: String,
}

impl ResponseMeta {
    pub(super) fn bare(request_id: String) -> Self {
        Self {
            request_id,
            context_reset: false,
            session_slot: String::new(),
            conversation_id: String::new(),
        }
    }
}

/// The client's `x-request-id` when well-formed, else a fresh id.
pub(super) fn client_request_id(headers: &HeaderMap) -> String {
    headers
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| {
            !v.is_empty()
                && v.len() <= MAX_CLIENT_REQUEST_ID_LEN
                && v.chars()
                    .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
        })
        .map(str::to_string)
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string())
}

/// Bearer auth: scheme compared case-insensitively, token byte-for-byte.
/// With no configured token, everything is accepted.
pub(super) fn authorized(state: &AppState, headers: &HeaderMap) -> bool {
    let Some(expected) = &state.config.auth_token else {
        return true;
    };
    let Some(value) = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
    else {
        return false;
    };
    let mut parts = value.trim().splitn(2, ' ');
    let scheme = parts.next().unwrap_or_default();
    let token = parts.next().unwrap_or_default().trim();
    scheme.eq_ignore_ascii_case("bearer") && token.as_bytes() == expected.as_bytes()
}

pub(super) enum BodyReadError {
    TooLarge,
    Failed,
}

/// Reads the raw body through the configured byte cap.
pub(super) async fn read_body_limited(
    body: Body,
    limit: usize,
) -> Result<Bytes, BodyReadError> {
    match Limited::new(body, limit).collect().await {
        Ok(collected) => Ok(collected.to_bytes()),
        Err(err) if err.downcast_ref::<http_body_util::LengthLimitError>().is_some() => {
            Err(BodyReadError::TooLarge)
        }
        Err(_) => Err(BodyReadError::Failed),
    }
}

/// Canonical admission fingerprint. The marker never participates: client
/// retries carry fresh request ids and must still coalesce.
pub(super) fn admission_fingerprint(
    prompt_body: &str,
    routing_mode: &str,
    session_slot: &str,
    conversation_id: &str,
    strict_open: bool,
) -> String {
    serde_json::json!({
        "prompt": prompt_body,
        "routing_mode": routing_mode,
        "session_slot": session_slot,
        "conversation_id": conversation_id,
        "strict_open": strict_open,
    })
    .to_string()
}

pub(super) fn apply_bridge_headers(response: &mut Response, state: &AppState, meta: &ResponseMeta) {
    let pairs = [
        ("x-bridge-version", BRIDGE_VERSION.to_string()),
        ("x-bridge-request-id", meta.request_id.clone()),
        ("x-bridge-queue-depth", state.queue.depth().to_string()),
        (
            "x-bridge-context-reset",
            if meta.context_reset { "1" } else { "0" }.to_string(),
        ),
        (
            "x-bridge-reset-strict",
            if state.config.reset_strict { "1" } else { "0" }.to_string(),
        ),
        ("x-bridge-session-slot", meta.session_slot.clone()),
        ("x-bridge-conversation-id", meta.conversation_id.clone()),
    ];
    let headers = response.headers_mut();
    for (name, value) in pairs {
        headers.insert(
            HeaderName::from_static(name),
            HeaderValue::from_str(&value).unwrap_or(HeaderValue::from_static("")),
        );
    }
}

/// Request headers as a JSON object for audit records.
pub(super) fn headers_to_json(headers: &HeaderMap) -> serde_json::Map<String, serde_json::Value> {
    let mut map = serde_json::Map::new();
    for (name, value) in headers {
        map.insert(
            name.as_str().to_string(),
            serde_json::Value::String(value.to_str().unwrap_or("<binary>").to_string()),
        );
    }
    map
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn well_formed_client_request_ids_are_echoed() {
        let mut headers = HeaderMap::new();
        headers.insert("x-request-id", HeaderValue::from_static("req_A-1.2"));
        assert_eq!(client_request_id(&headers), "req_A-1.2");
    }

    #[test]
    fn malformed_client_request_ids_are_replaced() {
        let mut headers = HeaderMap::new();
        headers.insert("x-request-id", HeaderValue::from_static("has spaces"));
        let generated = client_request_id(&headers);
        assert_ne!(generated, "has spaces");
        assert!(!generated.is_empty());

        let empty = HeaderMap::new();
        assert!(!client_request_id(&empty).is_empty());
    }

    #[test]
    fn fingerprint_ignores_nothing_but_is_deterministic() {
        let a = admission_fingerprint("prompt", "sticky", "slot", "conv", false);
        let b = admission_fingerprint("prompt", "sticky", "slot", "conv", false);
        let c = admission_fingerprint("prompt 2", "sticky", "slot", "conv", false);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
