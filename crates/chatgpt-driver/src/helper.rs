//! Automation-helper process client.
//!
//! The OS-level accessibility primitives live in a companion helper binary;
//! this client speaks newline-delimited JSON to it over stdio:
//!
//! ```text
//! -> {"id":1,"op":"scrapeText","params":{}}
//! <- {"id":1,"ok":true,"value":"..."}
//! <- {"id":2,"ok":false,"code":"ui_element_not_found","message":"..."}
//! ```
//!
//! The helper is respawned on demand when it exits or its pipe breaks.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{Mutex, oneshot};

use crate::automation::{AccessibilityStatus, UiAutomation};
use crate::error::{BridgeError, BridgeErrorKind};

/// Upper bound on any single helper call. Poll-level timeouts are tighter
/// for scrapes; this only guards against a wedged helper.
const HELPER_CALL_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Clone, Debug)]
pub struct HelperCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl HelperCommand {
    /// Splits a command line on whitespace: `"my-helper --flag"`.
    #[must_use]
    pub fn parse(cmdline: &str) -> Option<Self> {
        let mut parts = cmdline.split_whitespace().map(str::to_string);
        let program = parts.next()?;
        Some(Self {
            program,
            args: parts.collect(),
        })
    }
}

type PendingReplies = Arc<Mutex<HashMap<i64, oneshot::Sender<Result<Value, BridgeError>>>>>;

struct HelperLink {
    child: Child,
    stdin: ChildStdin,
    pending: PendingReplies,
}

pub struct HelperAutomation {
    command: HelperCommand,
    counter: AtomicI64,
    link: Mutex<Option<HelperLink>>,
}

impl HelperAutomation {
    #[must_use]
    pub fn new(command: HelperCommand) -> Self {
        Self {
            command,
            counter: AtomicI64::new(1),
            link: Mutex::new(None),
        }
    }

    fn helper_unavailable(message: impl Into<String>) -> BridgeError {
        BridgeError::ui_error(message, "automation_helper_unavailable")
    }

    fn spawn_link(&self) -> Result<HelperLink, BridgeError> {
        let mut child = Command::new(&self.command.program)
            .args(&self.command.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| {
                Self::helper_unavailable(format!(
                    "failed to spawn automation helper {}: {err}",
                    self.command.program
                ))
            })?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Self::helper_unavailable("automation helper has no stdin"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Self::helper_unavailable("automation helper has no stdout"))?;

        let pending: PendingReplies = Arc::new(Mutex::new(HashMap::new()));
        let pending_reader = pending.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                let value: Value = match serde_json::from_str(trimmed) {
                    Ok(value) => value,
                    Err(err) => {
                        tracing::warn!(error = %err, "automation helper sent unparseable line");
                        continue;
                    }
                };
                let Some(id) = value.get("id").and_then(Value::as_i64) else {
                    tracing::warn!("automation helper reply without id");
                    continue;
                };
                let reply = decode_reply(&value);
                let mut pending = pending_reader.lock().await;
                if let Some(sender) = pending.remove(&id) {
                    let _ = sender.send(reply);
                } else {
                    tracing::warn!(id, "automation helper reply without pending call");
                }
            }
            let mut pending = pending_reader.lock().await;
            for (_, sender) in pending.drain() {
                let _ = sender.send(Err(Self::helper_unavailable("automation helper exited")));
            }
        });

        tracing::info!(program = %self.command.program, "automation helper started");
        Ok(HelperLink {
            child,
            stdin,
            pending,
        })
    }

    async fn request(&self, op: &str, params: Value) -> Result<Value, BridgeError> {
        let mut last_err = None;
        for attempt in 0..2 {
            let rx = {
                let mut link_slot = self.link.lock().await;
                if let Some(link) = link_slot.as_mut() {
                    if link.child.try_wait().ok().flatten().is_some() {
                        *link_slot = None;
                    }
                }
                if link_slot.is_none() {
                    *link_slot = Some(self.spawn_link()?);
                }
                let link = link_slot
                    .as_mut()
                    .ok_or_else(|| Self::helper_unavailable("automation helper unavailable"))?;

                let id = self.counter.fetch_add(1, Ordering::SeqCst);
                let (tx, rx) = oneshot::channel();
                link.pending.lock().await.insert(id, tx);

                let mut line = json!({ "id": id, "op": op, "params": params.clone() })
                    .to_string();
                line.push('\n');
                if let Err(err) = link.stdin.write_all(line.as_bytes()).await {
                    link.pending.lock().await.remove(&id);
                    *link_slot = None;
                    last_err = Some(Self::helper_unavailable(format!(
                        "automation helper pipe broke: {err}"
                    )));
                    tracing::warn!(op, attempt, "automation helper write failed; respawning");
                    continue;
                }
                rx
            };

            return match tokio::time::timeout(HELPER_CALL_TIMEOUT, rx).await {
                Ok(Ok(reply)) => reply,
                Ok(Err(_closed)) => Err(Self::helper_unavailable("automation helper exited")),
                Err(_elapsed) => Err(BridgeError::ui_error(
                    format!("automation helper call timed out: {op}"),
                    "automation_helper_timeout",
                )),
            };
        }
        Err(last_err
            .unwrap_or_else(|| Self::helper_unavailable("automation helper unavailable")))
    }

    async fn request_bool(&self, op: &str, params: Value) -> Result<bool, BridgeError> {
        self.request(op, params).await?.as_bool().ok_or_else(|| {
            BridgeError::ui_error(
                format!("automation helper returned a non-boolean for {op}"),
                "automation_helper_protocol",
            )
        })
    }

    async fn request_unit(&self, op: &str, params: Value) -> Result<(), BridgeError> {
        self.request(op, params).await.map(|_| ())
    }
}

fn decode_reply(value: &Value) -> Result<Value, BridgeError> {
    if value.get("ok").and_then(Value::as_bool) == Some(true) {
        return Ok(value.get("value").cloned().unwrap_or(Value::Null));
    }
    let code = value.get("code").and_then(Value::as_str).unwrap_or("ui_error");
    let message = value
        .get("message")
        .and_then(Value::as_str)
        .unwrap_or("automation helper reported an error");
    Err(BridgeError::new(
        BridgeErrorKind::from_code(code),
        message.to_string(),
    ))
}

#[async_trait]
impl UiAutomation for HelperAutomation {
    async fn accessibility_status(&self) -> AccessibilityStatus {
        match self.request("accessibilityStatus", json!({})).await {
            Ok(Value::String(s)) => match s.as_str() {
                "granted" => AccessibilityStatus::Granted,
                "denied" => AccessibilityStatus::Denied,
                _ => AccessibilityStatus::Unknown,
            },
            _ => AccessibilityStatus::Unknown,
        }
    }

    async fn app_running(&self) -> Result<bool, BridgeError> {
        self.request_bool("appRunning", json!({})).await
    }

    async fn activate_app(&self) -> Result<(), BridgeError> {
        self.request_unit("activateApp", json!({})).await
    }

    async fn front_window_exists(&self) -> Result<bool, BridgeError> {
        self.request_bool("frontWindowExists", json!({})).await
    }

    async fn reopen_app(&self) -> Result<(), BridgeError> {
        self.request_unit("reopenApp", json!({})).await
    }

    async fn new_window_shortcut(&self) -> Result<(), BridgeError> {
        self.request_unit("newWindowShortcut", json!({})).await
    }

    async fn scrape_text(&self) -> Result<String, BridgeError> {
        match self.request("scrapeText", json!({})).await? {
            Value::String(text) => Ok(text),
            _ => Err(BridgeError::ui_error(
                "automation helper returned a non-string scrape",
                "automation_helper_protocol",
            )),
        }
    }

    async fn sidebar_conversations(&self) -> Result<Vec<String>, BridgeError> {
        match self.request("sidebarConversations", json!({})).await? {
            Value::Array(items) => Ok(items
                .into_iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect()),
            _ => Err(BridgeError::ui_error(
                "automation helper returned a non-array conversation list",
                "automation_helper_protocol",
            )),
        }
    }

    async fn open_conversation(&self, title: &str) -> Result<bool, BridgeError> {
        self.request_bool("openConversation", json!({ "title": title }))
            .await
    }

    async fn new_chat(&self) -> Result<bool, BridgeError> {
        self.request_bool("newChat", json!({})).await
    }

    async fn focus_input_element(&self) -> Result<bool, BridgeError> {
        self.request_bool("focusInputElement", json!({})).await
    }

    async fn click_input_region(&self) -> Result<(), BridgeError> {
        self.request_unit("clickInputRegion", json!({})).await
    }

    async fn cycle_keyboard_focus(&self) -> Result<(), BridgeError> {
        self.request_unit("cycleKeyboardFocus", json!({})).await
    }

    async fn input_focused(&self) -> Result<bool, BridgeError> {
        self.request_bool("inputFocused", json!({})).await
    }

    async fn read_clipboard(&self) -> Result<Option<String>, BridgeError> {
        match self.request("readClipboard", json!({})).await? {
            Value::Null => Ok(None),
            Value::String(text) => Ok(Some(text)),
            _ => Ok(None),
        }
    }

    async fn write_clipboard(&self, text: &str) -> Result<(), BridgeError> {
        self.request_unit("writeClipboard", json!({ "text": text }))
            .await
    }

    async fn paste_and_submit(&self) -> Result<(), BridgeError> {
        self.request_unit("pasteAndSubmit", json!({})).await
    }
}
