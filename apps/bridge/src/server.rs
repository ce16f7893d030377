//! HTTP surface: authentication, schema validation, the completion pipeline,
//! and the mapping from the closed error taxonomy onto the wire.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::Json;
use axum::body::{Body, Bytes};
use axum::extract::{Path, Request, State};
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use chatgpt_driver::marker::make_marker;
use chatgpt_driver::{AskRequest, BridgeError, BridgeErrorKind, HealthReport, UiDriver};
use futures::stream;
use serde::Deserialize;
use serde_json::{Map, Value, json};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use crate::admission::{Admission, QueueRefusal, SingleFlight, UiWorkQueue, await_job};
use crate::audit::AuditLog;
use crate::config::Config;
use crate::file_context::{
    FileContextDiagnostics, FileRef, expand, parse_block, split_trailing_block,
};
use crate::limiter::{RateDecision, RateLimiter};
use crate::prompt::{
    ANNOUNCE_SKIP_TEXT, IncomingMessage, PromptError, PromptRenderer, is_announce,
    validate_message_sizes, validate_prompt_size,
};
use crate::session::{RoutingError, SessionRouter};

use helpers::{
    BodyReadError, ResponseMeta, admission_fingerprint, apply_bridge_headers, authorized,
    client_request_id, headers_to_json, read_body_limited,
};

mod helpers;
mod route_domains;

pub const MODEL_ID: &str = "chatgpt-macos";
pub(crate) const BRIDGE_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Margin between the job timeout and the HTTP request timeout, so the
/// server never cuts a request the admission layer would still settle.
const REQUEST_TIMEOUT_MARGIN: Duration = Duration::from_secs(5);

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub driver: Arc<dyn UiDriver>,
    pub single_flight: SingleFlight,
    pub queue: UiWorkQueue,
    pub limiter: Option<Arc<RateLimiter>>,
    pub sessions: Arc<SessionRouter>,
    pub audit: Arc<AuditLog>,
    pub renderer: Arc<PromptRenderer>,
}

pub fn build_router(state: AppState) -> axum::Router {
    let request_timeout = state.config.job_timeout + REQUEST_TIMEOUT_MARGIN;
    route_domains::build_internal_router()
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(TimeoutLayer::new(request_timeout))
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum BridgeFileEntry {
    Path(String),
    Labeled {
        path: String,
        #[serde(default)]
        label: Option<String>,
    },
}

impl BridgeFileEntry {
    fn into_file_ref(self) -> FileRef {
        match self {
            Self::Path(path) => FileRef { path, label: None },
            Self::Labeled { path, label } => FileRef { path, label },
        }
    }
}

#[derive(Debug, Deserialize)]
struct ChatCompletionRequest {
    #[serde(default)]
    model: Option<String>,
    messages: Vec<IncomingMessage>,
    #[serde(default)]
    stream: bool,
    #[serde(default)]
    session_key: Option<String>,
    #[serde(default)]
    conversation_id: Option<String>,
    #[serde(default)]
    strict_open: Option<bool>,
    #[serde(default)]
    bridge_files: Vec<BridgeFileEntry>,
}

enum ApiError {
    Bridge(BridgeError),
    /// `prompt_too_large`, but from the raw body byte cap: wire status 413.
    BodyTooLarge(BridgeError),
    InvalidRequest(String),
    Unauthorized,
}

fn status_for_kind(kind: BridgeErrorKind) -> StatusCode {
    match kind {
        BridgeErrorKind::AppNotRunning | BridgeErrorKind::AccessibilityDenied => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        BridgeErrorKind::UiElementNotFound => StatusCode::PRECONDITION_REQUIRED,
        BridgeErrorKind::UiResetFailed
        | BridgeErrorKind::UiError
        | BridgeErrorKind::NetworkError => StatusCode::BAD_GATEWAY,
        BridgeErrorKind::UsageCap
        | BridgeErrorKind::RateLimitedByChatGpt
        | BridgeErrorKind::QueueFull => StatusCode::TOO_MANY_REQUESTS,
        BridgeErrorKind::Captcha
        | BridgeErrorKind::AuthRequired
        | BridgeErrorKind::FileContextAccessDenied => StatusCode::FORBIDDEN,
        BridgeErrorKind::ConversationNotFound | BridgeErrorKind::FileContextNotFound => {
            StatusCode::NOT_FOUND
        }
        BridgeErrorKind::FileContextInvalid
        | BridgeErrorKind::FileContextUnsupported
        | BridgeErrorKind::PromptTooLarge => StatusCode::BAD_REQUEST,
        BridgeErrorKind::PreviousResponsePending => StatusCode::CONFLICT,
        BridgeErrorKind::Timeout => StatusCode::GATEWAY_TIMEOUT,
        BridgeErrorKind::Unknown => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_type_for_status(status: StatusCode) -> &'static str {
    if status == StatusCode::TOO_MANY_REQUESTS {
        "rate_limit_exceeded"
    } else if status.is_client_error() {
        "invalid_request_error"
    } else {
        "api_error"
    }
}

fn error_response(state: &AppState, meta: &ResponseMeta, error: ApiError) -> Response {
    let (status, code, message, retry_after, details) = match error {
        ApiError::Bridge(err) => (
            status_for_kind(err.kind),
            err.kind.code(),
            err.message,
            err.retry_after_sec,
            err.details,
        ),
        ApiError::BodyTooLarge(err) => (
            StatusCode::PAYLOAD_TOO_LARGE,
            err.kind.code(),
            err.message,
            None,
            err.details,
        ),
        ApiError::InvalidRequest(message) => (
            StatusCode::BAD_REQUEST,
            "invalid_request",
            message,
            None,
            Map::new(),
        ),
        ApiError::Unauthorized => (
            StatusCode::UNAUTHORIZED,
            "unauthorized",
            "missing or invalid bearer token".to_string(),
            None,
            Map::new(),
        ),
    };

    let mut error_body = json!({
        "message": message,
        "type": error_type_for_status(status),
        "param": null,
        "code": code,
    });
    if !details.is_empty() {
        error_body["details"] = Value::Object(details);
    }

    let mut response = (status, Json(json!({ "error": error_body }))).into_response();
    apply_bridge_headers(&mut response, state, meta);
    let headers = response.headers_mut();
    headers.insert(
        HeaderName::from_static("x-should-retry"),
        HeaderValue::from_static("false"),
    );
    if let Some(seconds) = retry_after {
        headers.insert(
            header::RETRY_AFTER,
            HeaderValue::from_str(&seconds.to_string())
                .unwrap_or(HeaderValue::from_static("60")),
        );
    }
    response
}

fn json_response(
    state: &AppState,
    meta: &ResponseMeta,
    status: StatusCode,
    body: Value,
) -> Response {
    let mut response = (status, Json(body)).into_response();
    apply_bridge_headers(&mut response, state, meta);
    response
}

pub(crate) async fn health(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let meta = ResponseMeta::bare(client_request_id(&headers));
    let report = state.driver.health().await;
    let body = json!({
        "ok": true,
        "ready": report.ok,
        "mode": "http",
        "queueDepth": state.queue.depth(),
        "version": BRIDGE_VERSION,
        "uiAutomation": report,
    });
    json_response(&state, &meta, StatusCode::OK, body)
}

pub(crate) async fn list_models(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let meta = ResponseMeta::bare(client_request_id(&headers));
    if !authorized(&state, &headers) {
        return error_response(&state, &meta, ApiError::Unauthorized);
    }
    let body = json!({
        "object": "list",
        "data": [{
            "id": MODEL_ID,
            "object": "model",
            "created": chrono::Utc::now().timestamp(),
            "owned_by": "chatgpt-bridge",
        }],
    });
    json_response(&state, &meta, StatusCode::OK, body)
}

pub(crate) async fn list_conversations(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Response {
    let meta = ResponseMeta::bare(client_request_id(&headers));
    if !authorized(&state, &headers) {
        return error_response(&state, &meta, ApiError::Unauthorized);
    }

    let driver = state.driver.clone();
    let request_id = meta.request_id.clone();
    let submitted = state
        .queue
        .submit("list_conversations", async move {
            driver.get_conversations(&request_id).await
        })
        .await;

    let result = match submitted {
        Ok(rx) => await_job(rx, state.queue.default_timeout())
            .await
            .and_then(|inner| inner),
        Err(refusal) => {
            let retry_after_sec = match refusal {
                QueueRefusal::Full { retry_after_sec } => retry_after_sec,
                QueueRefusal::Busy => crate::admission::QUEUE_FULL_RETRY_AFTER_SEC,
            };
            Err(
                BridgeError::new(BridgeErrorKind::QueueFull, "ui work queue is full")
                    .with_retry_after(retry_after_sec),
            )
        }
    };

    match result {
        Ok(titles) => json_response(
            &state,
            &meta,
            StatusCode::OK,
            json!({ "object": "list", "data": titles }),
        ),
        Err(err) => error_response(&state, &meta, ApiError::Bridge(err)),
    }
}

pub(crate) async fn delete_session_binding(
    State(state): State<AppState>,
    Path(slot): Path<String>,
    headers: HeaderMap,
) -> Response {
    let meta = ResponseMeta::bare(client_request_id(&headers));
    if !authorized(&state, &headers) {
        return error_response(&state, &meta, ApiError::Unauthorized);
    }
    let slot = state.sessions.normalize_slot(Some(&slot));
    match state.sessions.store().delete(&slot).await {
        Ok(deleted) => json_response(
            &state,
            &meta,
            StatusCode::OK,
            json!({ "deleted": deleted, "slot": slot }),
        ),
        Err(err) => error_response(
            &state,
            &meta,
            ApiError::Bridge(BridgeError::new(
                BridgeErrorKind::Unknown,
                format!("failed to persist session bindings: {err}"),
            )),
        ),
    }
}

pub(crate) async fn chat_completions(
    State(state): State<AppState>,
    request: Request,
) -> Response {
    let (parts, body) = request.into_parts();
    let headers = parts.headers;
    let mut meta = ResponseMeta::bare(client_request_id(&headers));
    let request_id = meta.request_id.clone();

    // The context-reset header is already pinned to 0 here, including on the
    // auth failure below; preserved for compatibility.
    if !authorized(&state, &headers) {
        return error_response(&state, &meta, ApiError::Unauthorized);
    }

    if let Some(limiter) = &state.limiter {
        if let RateDecision::Denied { retry_after_sec } = limiter.try_acquire().await {
            let err = BridgeError::new(
                BridgeErrorKind::QueueFull,
                "per-process request budget exhausted",
            )
            .with_retry_after(retry_after_sec);
            return error_response(&state, &meta, ApiError::Bridge(err));
        }
    }

    let bytes = match read_body_limited(body, state.config.http_body_limit_bytes).await {
        Ok(bytes) => bytes,
        Err(BodyReadError::TooLarge) => {
            let mut fields = Map::new();
            fields.insert(
                "limit_bytes".to_string(),
                json!(state.config.http_body_limit_bytes),
            );
            state.audit.record("body_rejected", &request_id, fields).await;
            let err = BridgeError::new(
                BridgeErrorKind::PromptTooLarge,
                "request body exceeds the configured byte limit",
            );
            return error_response(&state, &meta, ApiError::BodyTooLarge(err));
        }
        Err(BodyReadError::Failed) => {
            return error_response(
                &state,
                &meta,
                ApiError::InvalidRequest("could not read request body".to_string()),
            );
        }
    };

    let payload: ChatCompletionRequest = match serde_json::from_slice(&bytes) {
        Ok(payload) => payload,
        Err(err) => {
            return error_response(
                &state,
                &meta,
                ApiError::InvalidRequest(format!("invalid JSON body: {err}")),
            );
        }
    };

    {
        let mut fields = Map::new();
        fields.insert("headers".to_string(), Value::Object(headers_to_json(&headers)));
        if let Ok(raw) = serde_json::from_slice::<Value>(&bytes) {
            fields.insert("body".to_string(), raw);
        }
        if let Some(model) = &payload.model {
            fields.insert("model".to_string(), json!(model));
        }
        state
            .audit
            .record("request_received", &request_id, fields)
            .await;
    }

    if payload.messages.is_empty() {
        return error_response(
            &state,
            &meta,
            ApiError::InvalidRequest("messages must not be empty".to_string()),
        );
    }

    let routing = match state
        .sessions
        .resolve(payload.session_key.as_deref(), payload.conversation_id.as_deref())
        .await
    {
        Ok(routing) => routing,
        Err(RoutingError::MissingConversationId) => {
            return error_response(
                &state,
                &meta,
                ApiError::InvalidRequest(
                    "conversation_id is required in explicit session binding mode".to_string(),
                ),
            );
        }
    };
    meta.session_slot = routing.slot.clone();
    meta.conversation_id = routing.conversation_id.clone().unwrap_or_default();

    if let Err(err) = validate_message_sizes(&payload.messages, state.config.max_message_chars) {
        return error_response(
            &state,
            &meta,
            ApiError::Bridge(BridgeError::new(
                BridgeErrorKind::PromptTooLarge,
                err.to_string(),
            )),
        );
    }

    let rendered = match state.renderer.render(&payload.messages) {
        Ok(rendered) => rendered,
        Err(PromptError::NoUserMessage) => {
            return error_response(
                &state,
                &meta,
                ApiError::InvalidRequest("messages must contain a user message".to_string()),
            );
        }
        Err(err) => {
            return error_response(&state, &meta, ApiError::InvalidRequest(err.to_string()));
        }
    };

    if is_announce(&rendered) {
        let mut fields = Map::new();
        fields.insert("announce_skip".to_string(), json!(true));
        state.audit.record("response_done", &request_id, fields).await;
        return success_response(&state, &meta, payload.stream, ANNOUNCE_SKIP_TEXT);
    }

    let mut diagnostics = FileContextDiagnostics::default();
    let mut prompt_body = rendered;
    if state.config.file_context.enabled {
        let mut refs: Vec<FileRef> = payload
            .bridge_files
            .into_iter()
            .map(BridgeFileEntry::into_file_ref)
            .collect();
        let (remaining, block) = split_trailing_block(&prompt_body, &mut diagnostics);
        prompt_body = remaining;
        if let Some(block) = block {
            match parse_block(&block, &mut diagnostics) {
                Ok(mut parsed) => refs.append(&mut parsed),
                Err(err) => {
                    return error_response(
                        &state,
                        &meta,
                        ApiError::Bridge(err.into_bridge_error()),
                    );
                }
            }
        }
        match expand(&state.config.file_context, &refs, &mut diagnostics) {
            Ok(Some(section)) => {
                prompt_body = format!("{prompt_body}\n\n{section}");
            }
            Ok(None) => {}
            Err(err) => {
                let bridge_err = err.into_bridge_error();
                let mut fields = Map::new();
                fields.insert("code".to_string(), json!(bridge_err.kind.code()));
                state.audit.record("request_failed", &request_id, fields).await;
                return error_response(&state, &meta, ApiError::Bridge(bridge_err));
            }
        }
    } else if !payload.bridge_files.is_empty() {
        tracing::warn!(request_id = %request_id, "bridge_files ignored: file context is disabled");
    }

    if let Err(err) = validate_prompt_size(&prompt_body, state.config.max_prompt_chars) {
        return error_response(
            &state,
            &meta,
            ApiError::Bridge(BridgeError::new(
                BridgeErrorKind::PromptTooLarge,
                err.to_string(),
            )),
        );
    }

    let preflight = state.driver.health().await;
    if !preflight.ok {
        return error_response(&state, &meta, ApiError::Bridge(preflight_error(&preflight)));
    }

    let marker = make_marker(&request_id, &state.config.marker_secret);
    let full_prompt = format!("{prompt_body}\n\n{marker}");
    let strict_open = payload
        .strict_open
        .unwrap_or(state.config.session_binding_strict_open);
    let fingerprint = admission_fingerprint(
        &prompt_body,
        state.config.session_binding_mode.as_str(),
        &routing.slot,
        routing.conversation_id.as_deref().unwrap_or_default(),
        strict_open,
    );

    let ask_request = AskRequest {
        prompt: full_prompt,
        marker,
        request_id: request_id.clone(),
        conversation_id: routing.conversation_id.clone(),
        strict_open,
        reset_each_request: state.config.reset_chat_each_request,
        reset_strict: state.config.reset_strict,
    };

    let driver = state.driver.clone();
    let queue = state.queue.clone();
    let audit = state.audit.clone();
    let diagnostics_value = serde_json::to_value(&diagnostics).unwrap_or(Value::Null);
    let job_request_id = request_id.clone();
    let task = async move {
        let job = {
            let audit = audit.clone();
            async move {
                let mut fields = Map::new();
                fields.insert("prompt".to_string(), json!(ask_request.prompt));
                fields.insert("file_context".to_string(), diagnostics_value);
                audit.record("prompt_send", &job_request_id, fields).await;
                driver.ask(ask_request).await
            }
        };
        match queue.submit_if_idle("chat_completion", job).await {
            Ok(rx) => match rx.await {
                Ok(result) => result,
                Err(_recv) => Err(BridgeError::new(
                    BridgeErrorKind::Unknown,
                    "ui job dropped before completion",
                )),
            },
            Err(QueueRefusal::Busy) => Err(BridgeError::new(
                BridgeErrorKind::PreviousResponsePending,
                "another ui job is already running",
            )),
            Err(QueueRefusal::Full { retry_after_sec }) => Err(BridgeError::new(
                BridgeErrorKind::QueueFull,
                "ui work queue is full",
            )
            .with_retry_after(retry_after_sec)),
        }
    };

    let result = match state.single_flight.try_admit(&fingerprint, task).await {
        Admission::Busy => Err(BridgeError::new(
            BridgeErrorKind::PreviousResponsePending,
            "a different completion is already in flight",
        )),
        Admission::Admitted(handle) | Admission::Joined(handle) => {
            handle.wait(state.config.job_timeout).await
        }
    };

    match result {
        Ok(outcome) => {
            meta.context_reset = outcome.context_reset;
            if let Some(opened) = &outcome.opened_conversation_id {
                meta.conversation_id = opened.clone();
            }
            if let Err(err) = state
                .sessions
                .persist_binding(&routing, outcome.opened_conversation_id.as_deref())
                .await
            {
                tracing::warn!(
                    request_id = %request_id,
                    error = %err,
                    "failed to persist session binding"
                );
            }
            let mut fields = Map::new();
            fields.insert("chars".to_string(), json!(outcome.text.chars().count()));
            fields.insert(
                "extraction_mode".to_string(),
                json!(outcome.extraction_mode.as_str()),
            );
            fields.insert("context_reset".to_string(), json!(outcome.context_reset));
            state.audit.record("response_done", &request_id, fields).await;
            success_response(&state, &meta, payload.stream, &outcome.text)
        }
        Err(err) => {
            if let Some(reset) = err.context_reset {
                meta.context_reset = reset;
            }
            let mut fields = Map::new();
            fields.insert("code".to_string(), json!(err.kind.code()));
            state.audit.record("request_failed", &request_id, fields).await;
            error_response(&state, &meta, ApiError::Bridge(err))
        }
    }
}

fn preflight_error(report: &HealthReport) -> BridgeError {
    if report.accessibility == chatgpt_driver::AccessibilityStatus::Denied {
        return BridgeError::new(
            BridgeErrorKind::AccessibilityDenied,
            "accessibility permission is denied",
        );
    }
    if report.app_running == Some(false) {
        return BridgeError::new(BridgeErrorKind::AppNotRunning, "chat app is not running");
    }
    let kind = report
        .code
        .as_deref()
        .map(BridgeErrorKind::from_code)
        .unwrap_or(BridgeErrorKind::UiError);
    BridgeError::new(
        kind,
        report
            .message
            .clone()
            .unwrap_or_else(|| "ui automation is not ready".to_string()),
    )
}

fn success_response(state: &AppState, meta: &ResponseMeta, stream: bool, text: &str) -> Response {
    if stream {
        stream_response(state, meta, text)
    } else {
        let body = json!({
            "id": completion_id(),
            "object": "chat.completion",
            "created": chrono::Utc::now().timestamp(),
            "model": MODEL_ID,
            "choices": [{
                "index": 0,
                "message": { "role": "assistant", "content": text },
                "finish_reason": "stop",
            }],
            "usage": {
                "prompt_tokens": 0,
                "completion_tokens": 0,
                "total_tokens": 0,
            },
        });
        json_response(state, meta, StatusCode::OK, body)
    }
}

/// Three frames, in order: role delta, one full-content delta, `[DONE]`.
fn stream_response(state: &AppState, meta: &ResponseMeta, text: &str) -> Response {
    let id = completion_id();
    let created = chrono::Utc::now().timestamp();
    let role_chunk = json!({
        "id": id,
        "object": "chat.completion.chunk",
        "created": created,
        "model": MODEL_ID,
        "choices": [{
            "index": 0,
            "delta": { "role": "assistant" },
            "finish_reason": null,
        }],
    });
    let content_chunk = json!({
        "id": id,
        "object": "chat.completion.chunk",
        "created": created,
        "model": MODEL_ID,
        "choices": [{
            "index": 0,
            "delta": { "content": text },
            "finish_reason": "stop",
        }],
    });

    let frames = vec![
        Ok::<Bytes, Infallible>(Bytes::from(format!("data: {role_chunk}\n\n"))),
        Ok(Bytes::from(format!("data: {content_chunk}\n\n"))),
        Ok(Bytes::from("data: [DONE]\n\n")),
    ];

    let mut response = Response::new(Body::from_stream(stream::iter(frames)));
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/event-stream"),
    );
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
    headers.insert(
        HeaderName::from_static("x-accel-buffering"),
        HeaderValue::from_static("no"),
    );
    apply_bridge_headers(&mut response, state, meta);
    response
}

fn completion_id() -> String {
    format!("chatcmpl-{}", uuid::Uuid::new_v4().simple())
}
