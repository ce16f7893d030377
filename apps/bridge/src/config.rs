//! Environment-driven service configuration.

use std::env;
use std::net::{AddrParseError, IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use chatgpt_driver::UiLabels;
use thiserror::Error;

const DEFAULT_HTTP_HOST: &str = "127.0.0.1";
const DEFAULT_HTTP_PORT: u16 = 3789;
const DEFAULT_MAX_QUEUE_SIZE: usize = 20;
const DEFAULT_MAX_WAIT_SEC: u64 = 120;
const DEFAULT_POLL_INTERVAL_SEC: f64 = 1.0;
const DEFAULT_STABLE_CHECKS: u32 = 3;
const DEFAULT_EXTRACT_NO_INDICATOR_STABLE_MS: u64 = 8_000;
const DEFAULT_SCRAPE_CALL_TIMEOUT_MS: u64 = 10_000;
const DEFAULT_MAX_PROMPT_CHARS: usize = 512_000;
const DEFAULT_MAX_MESSAGE_CHARS: usize = 512_000;
const DEFAULT_HTTP_BODY_LIMIT_BYTES: usize = 2 * 1024 * 1024;
const DEFAULT_FILE_CONTEXT_MAX_FILES: usize = 8;
const DEFAULT_FILE_CONTEXT_MAX_FILE_CHARS: usize = 200_000;
const DEFAULT_FILE_CONTEXT_MAX_TOTAL_CHARS: usize = 400_000;
const DEFAULT_SESSION_SLOT: &str = "default";
const DEFAULT_AX_HELPER_CMD: &str = "chatgpt-ax-helper";
const DEFAULT_AUDIT_MAX_BYTES: u64 = 16 * 1024 * 1024;
const DEFAULT_AUDIT_MAX_FILES: u32 = 5;
const DEFAULT_AUDIT_MAX_AGE_DAYS: u32 = 14;

/// Enqueue timeouts must outlive the poll deadline by a margin, or callers
/// would time out while the UI worker is still legitimately polling.
const JOB_TIMEOUT_MARGIN: Duration = Duration::from_secs(15);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionBindingMode {
    Off,
    Sticky,
    Explicit,
}

impl SessionBindingMode {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Off => "off",
            Self::Sticky => "sticky",
            Self::Explicit => "explicit",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AuditMode {
    Full,
    Headers,
    Metadata,
}

#[derive(Clone, Debug)]
pub struct FileContextConfig {
    pub enabled: bool,
    /// Empty means any absolute path is eligible.
    pub allowed_roots: Vec<PathBuf>,
    pub max_files: usize,
    pub max_file_chars: usize,
    pub max_total_chars: usize,
}

#[derive(Clone, Debug)]
pub struct AuditConfig {
    pub enabled: bool,
    pub path: PathBuf,
    pub max_bytes: u64,
    pub max_files: u32,
    pub max_age_days: u32,
    pub mode: AuditMode,
}

#[derive(Clone, Debug)]
pub struct Config {
    pub bind_addr: SocketAddr,
    pub auth_token: Option<String>,
    pub marker_secret: String,
    pub marker_secret_ephemeral: bool,
    pub ax_helper_cmd: String,
    pub max_queue_size: usize,
    pub job_timeout: Duration,
    pub max_wait: Duration,
    pub poll_interval: Duration,
    pub stable_checks: u32,
    pub extract_no_indicator_stable: Duration,
    pub scrape_call_timeout: Duration,
    pub max_prompt_chars: usize,
    pub max_message_chars: usize,
    pub http_body_limit_bytes: usize,
    pub file_context: FileContextConfig,
    pub rate_limit_rpm: u32,
    pub rate_limit_burst: u32,
    pub ui_labels: UiLabels,
    pub require_completion_indicators: bool,
    pub ui_error_patterns_json: Option<String>,
    pub reset_chat_each_request: bool,
    pub reset_strict: bool,
    pub session_binding_mode: SessionBindingMode,
    pub session_default_slot: String,
    pub session_bindings_path: PathBuf,
    pub session_binding_strict_open: bool,
    pub audit: AuditConfig,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid HTTP_HOST: {0}")]
    HostParse(#[from] AddrParseError),
    #[error("invalid HTTP_PORT: {0}")]
    PortParse(String),
    #[error("unsupported BRIDGE_MODE {0:?}: this binary serves the http transport only")]
    UnsupportedBridgeMode(String),
    #[error("invalid SESSION_BINDING_MODE: {0}")]
    InvalidSessionBindingMode(String),
    #[error("invalid AUDIT_LOG_MODE: {0}")]
    InvalidAuditMode(String),
    #[error("invalid UI_ERROR_PATTERNS_JSON: {0}")]
    InvalidUiErrorPatterns(#[from] serde_json::Error),
    #[error("invalid {name}: {value}")]
    InvalidInteger { name: &'static str, value: String },
    #[error("invalid {name}: {value}")]
    InvalidNumber { name: &'static str, value: String },
    #[error("invalid {name}: {value}")]
    InvalidBoolean { name: &'static str, value: String },
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        if let Ok(mode) = env::var("BRIDGE_MODE") {
            if !mode.trim().is_empty() && !mode.trim().eq_ignore_ascii_case("http") {
                return Err(ConfigError::UnsupportedBridgeMode(mode));
            }
        }

        let host: IpAddr = env_or("HTTP_HOST", DEFAULT_HTTP_HOST).parse()?;
        let port = parse_u16("HTTP_PORT", DEFAULT_HTTP_PORT)?;
        let bind_addr = SocketAddr::new(host, port);

        let auth_token = non_empty(env::var("CHATGPT_BRIDGE_TOKEN").ok());
        if auth_token.is_none() {
            tracing::warn!(
                "CHATGPT_BRIDGE_TOKEN is not set; requests are accepted without authentication"
            );
        }

        let (marker_secret, marker_secret_ephemeral) =
            match non_empty(env::var("MARKER_SECRET").ok()) {
                Some(secret) => (secret, false),
                None => {
                    tracing::warn!(
                        "MARKER_SECRET is not set; using an ephemeral secret, markers will not \
                         be stable across restarts"
                    );
                    (
                        format!(
                            "{}{}",
                            uuid::Uuid::new_v4().simple(),
                            uuid::Uuid::new_v4().simple()
                        ),
                        true,
                    )
                }
            };

        let max_wait = Duration::from_secs(parse_u64("MAX_WAIT_SEC", DEFAULT_MAX_WAIT_SEC)?);
        let job_timeout_floor = max_wait + JOB_TIMEOUT_MARGIN;
        let job_timeout = Duration::from_millis(parse_u64(
            "JOB_TIMEOUT_MS",
            job_timeout_floor.as_millis() as u64,
        )?)
        .max(job_timeout_floor);

        let poll_interval_sec = parse_f64("POLL_INTERVAL_SEC", DEFAULT_POLL_INTERVAL_SEC)?;
        if !poll_interval_sec.is_finite() || poll_interval_sec <= 0.0 {
            return Err(ConfigError::InvalidNumber {
                name: "POLL_INTERVAL_SEC",
                value: poll_interval_sec.to_string(),
            });
        }
        let poll_interval = Duration::from_secs_f64(poll_interval_sec);

        let session_binding_mode = match env_or("SESSION_BINDING_MODE", "off").to_lowercase().as_str()
        {
            "off" => SessionBindingMode::Off,
            "sticky" => SessionBindingMode::Sticky,
            "explicit" => SessionBindingMode::Explicit,
            other => return Err(ConfigError::InvalidSessionBindingMode(other.to_string())),
        };

        let audit_mode = match env_or("AUDIT_LOG_MODE", "full").to_lowercase().as_str() {
            "full" => AuditMode::Full,
            "headers" => AuditMode::Headers,
            "metadata" => AuditMode::Metadata,
            other => return Err(ConfigError::InvalidAuditMode(other.to_string())),
        };

        let ui_error_patterns_json = non_empty(env::var("UI_ERROR_PATTERNS_JSON").ok());
        if let Some(json) = &ui_error_patterns_json {
            // Validate eagerly so a typo fails startup, not the first request.
            let _: Vec<chatgpt_driver::UiErrorPattern> = serde_json::from_str(json)?;
        }

        let ui_labels = UiLabels {
            new_chat: env_or("UI_LABEL_NEW_CHAT", "New chat"),
            regenerate: env_or("UI_LABEL_REGENERATE", "Regenerate"),
            continue_generating: env_or("UI_LABEL_CONTINUE", "Continue generating"),
        };

        Ok(Self {
            bind_addr,
            auth_token,
            marker_secret,
            marker_secret_ephemeral,
            ax_helper_cmd: env_or("AX_HELPER_CMD", DEFAULT_AX_HELPER_CMD),
            max_queue_size: parse_usize("MAX_QUEUE_SIZE", DEFAULT_MAX_QUEUE_SIZE)?,
            job_timeout,
            max_wait,
            poll_interval,
            stable_checks: parse_u32("STABLE_CHECKS", DEFAULT_STABLE_CHECKS)?,
            extract_no_indicator_stable: Duration::from_millis(parse_u64(
                "EXTRACT_NO_INDICATOR_STABLE_MS",
                DEFAULT_EXTRACT_NO_INDICATOR_STABLE_MS,
            )?),
            scrape_call_timeout: Duration::from_millis(parse_u64(
                "SCRAPE_CALL_TIMEOUT_MS",
                DEFAULT_SCRAPE_CALL_TIMEOUT_MS,
            )?),
            max_prompt_chars: parse_usize("MAX_PROMPT_CHARS", DEFAULT_MAX_PROMPT_CHARS)?,
            max_message_chars: parse_usize("MAX_MESSAGE_CHARS", DEFAULT_MAX_MESSAGE_CHARS)?,
            http_body_limit_bytes: parse_usize(
                "HTTP_BODY_LIMIT_BYTES",
                DEFAULT_HTTP_BODY_LIMIT_BYTES,
            )?,
            file_context: FileContextConfig {
                enabled: parse_bool("FILE_CONTEXT_ENABLED", true)?,
                allowed_roots: env::var("FILE_CONTEXT_ALLOWED_ROOTS")
                    .ok()
                    .map(|raw| {
                        raw.split(':')
                            .filter(|p| !p.trim().is_empty())
                            .map(PathBuf::from)
                            .collect()
                    })
                    .unwrap_or_default(),
                max_files: parse_usize("FILE_CONTEXT_MAX_FILES", DEFAULT_FILE_CONTEXT_MAX_FILES)?,
                max_file_chars: parse_usize(
                    "FILE_CONTEXT_MAX_FILE_CHARS",
                    DEFAULT_FILE_CONTEXT_MAX_FILE_CHARS,
                )?,
                max_total_chars: parse_usize(
                    "FILE_CONTEXT_MAX_TOTAL_CHARS",
                    DEFAULT_FILE_CONTEXT_MAX_TOTAL_CHARS,
                )?,
            },
            rate_limit_rpm: parse_u32("RATE_LIMIT_RPM", 0)?,
            rate_limit_burst: parse_u32("RATE_LIMIT_BURST", 10)?,
            ui_labels,
            require_completion_indicators: parse_bool("REQUIRE_COMPLETION_INDICATORS", false)?,
            ui_error_patterns_json,
            reset_chat_each_request: parse_bool("RESET_CHAT_EACH_REQUEST", false)?,
            reset_strict: parse_bool("RESET_STRICT", false)?,
            session_binding_mode,
            session_default_slot: {
                let slot = env_or("SESSION_DEFAULT_SLOT", DEFAULT_SESSION_SLOT);
                let slot = slot.trim().to_lowercase();
                if slot.is_empty() {
                    DEFAULT_SESSION_SLOT.to_string()
                } else {
                    slot
                }
            },
            session_bindings_path: PathBuf::from(env_or(
                "SESSION_BINDINGS_PATH",
                "session-bindings.json",
            )),
            session_binding_strict_open: parse_bool("SESSION_BINDING_STRICT_OPEN", false)?,
            audit: AuditConfig {
                enabled: parse_bool("AUDIT_LOG_ENABLED", false)?,
                path: PathBuf::from(env_or("AUDIT_LOG_PATH", "raw.jsonl")),
                max_bytes: parse_u64("AUDIT_LOG_MAX_BYTES", DEFAULT_AUDIT_MAX_BYTES)?,
                max_files: parse_u32("AUDIT_LOG_MAX_FILES", DEFAULT_AUDIT_MAX_FILES)?,
                max_age_days: parse_u32("AUDIT_LOG_MAX_AGE_DAYS", DEFAULT_AUDIT_MAX_AGE_DAYS)?,
                mode: audit_mode,
            },
        })
    }
}

fn env_or(name: &str, default: &str) -> String {
    env::var(name)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

fn parse_u16(name: &'static str, default: u16) -> Result<u16, ConfigError> {
    match env::var(name) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::PortParse(raw)),
        _ => Ok(default),
    }
}

fn parse_u32(name: &'static str, default: u32) -> Result<u32, ConfigError> {
    match env::var(name) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidInteger { name, value: raw }),
        _ => Ok(default),
    }
}

fn parse_u64(name: &'static str, default: u64) -> Result<u64, ConfigError> {
    match env::var(name) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidInteger { name, value: raw }),
        _ => Ok(default),
    }
}

fn parse_usize(name: &'static str, default: usize) -> Result<usize, ConfigError> {
    match env::var(name) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidInteger { name, value: raw }),
        _ => Ok(default),
    }
}

fn parse_f64(name: &'static str, default: f64) -> Result<f64, ConfigError> {
    match env::var(name) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidNumber { name, value: raw }),
        _ => Ok(default),
    }
}

fn parse_bool(name: &'static str, default: bool) -> Result<bool, ConfigError> {
    match env::var(name) {
        Ok(raw) if !raw.trim().is_empty() => match raw.trim().to_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(ConfigError::InvalidBoolean { name, value: raw }),
        },
        _ => Ok(default),
    }
}
