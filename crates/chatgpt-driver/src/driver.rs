//! The UI driver: one ask() transaction end to end.

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::automation::{AccessibilityStatus, HealthReport, UiAutomation};
use crate::error::{BridgeError, BridgeErrorKind};
use crate::extract::{ExtractionMode, Extractor, UiLabels};
use crate::poll::{PollSettings, run_poll_loop};
use crate::ui_error::UiErrorDetector;

/// The clipboard is a machine-wide resource; one lock for the whole process
/// covers every driver instance.
static CLIPBOARD_LOCK: Mutex<()> = Mutex::const_new(());

#[derive(Clone, Debug)]
pub struct AskRequest {
    /// Fully rendered prompt, ending with the marker line.
    pub prompt: String,
    pub marker: String,
    pub request_id: String,
    pub conversation_id: Option<String>,
    pub strict_open: bool,
    pub reset_each_request: bool,
    pub reset_strict: bool,
}

#[derive(Clone, Debug)]
pub struct AskOutcome {
    pub text: String,
    pub context_reset: bool,
    pub opened_conversation_id: Option<String>,
    pub extraction_mode: ExtractionMode,
}

/// The operations the HTTP surface consumes. Implemented by
/// [`ChatGptDriver`] in production and by stubs in tests.
#[async_trait]
pub trait UiDriver: Send + Sync {
    async fn health(&self) -> HealthReport;

    async fn ask(&self, request: AskRequest) -> Result<AskOutcome, BridgeError>;

    async fn get_conversations(&self, request_id: &str) -> Result<Vec<String>, BridgeError>;
}

#[derive(Clone, Debug)]
pub struct DriverSettings {
    pub poll: PollSettings,
    pub ui_labels: UiLabels,
}

impl Default for DriverSettings {
    fn default() -> Self {
        Self {
            poll: PollSettings::default(),
            ui_labels: UiLabels::default(),
        }
    }
}

pub struct ChatGptDriver<A> {
    automation: A,
    detector: UiErrorDetector,
    extractor: Extractor,
    settings: DriverSettings,
}

impl<A: UiAutomation> ChatGptDriver<A> {
    #[must_use]
    pub fn new(automation: A, detector: UiErrorDetector, settings: DriverSettings) -> Self {
        let extractor = Extractor::new(&settings.ui_labels);
        Self {
            automation,
            detector,
            extractor,
            settings,
        }
    }

    /// The underlying automation layer; handy for scripted tests.
    #[must_use]
    pub fn automation(&self) -> &A {
        &self.automation
    }

    async fn ask_inner(
        &self,
        request: &AskRequest,
        context_reset: &mut bool,
    ) -> Result<AskOutcome, BridgeError> {
        ensure_running(&self.automation).await?;
        ensure_window_available(&self.automation).await?;

        if request.reset_each_request {
            match self.automation.new_chat().await {
                Ok(true) => *context_reset = true,
                Ok(false) => {
                    if request.reset_strict {
                        return Err(BridgeError::new(
                            BridgeErrorKind::UiResetFailed,
                            "chat app refused the new-chat reset",
                        ));
                    }
                    tracing::warn!(
                        request_id = %request.request_id,
                        "new-chat reset refused; continuing on the active conversation"
                    );
                }
                Err(err) => {
                    if request.reset_strict {
                        return Err(err);
                    }
                    tracing::warn!(
                        request_id = %request.request_id,
                        error = %err,
                        "new-chat reset failed; continuing on the active conversation"
                    );
                }
            }
        }

        let mut opened_conversation_id = None;
        if let Some(title) = request
            .conversation_id
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
        {
            if self.automation.open_conversation(title).await? {
                opened_conversation_id = Some(title.to_string());
            } else if request.strict_open {
                return Err(BridgeError::new(
                    BridgeErrorKind::ConversationNotFound,
                    format!("conversation not found in sidebar: {title}"),
                )
                .with_detail("conversation_id", title));
            } else {
                tracing::warn!(
                    request_id = %request.request_id,
                    conversation = title,
                    "conversation not found; continuing on the active conversation"
                );
            }
        }

        self.focus_input(request).await?;

        // Pre-send snapshot: the legacy extraction baseline, and the text the
        // echo stripper treats as already on screen.
        let snapshot = match self.automation.scrape_text().await {
            Ok(text) => Some(text),
            Err(err) => {
                tracing::warn!(
                    request_id = %request.request_id,
                    error = %err,
                    "pre-send snapshot failed; legacy extraction disabled for this ask"
                );
                None
            }
        };

        self.paste_and_submit(request).await?;

        let extraction = run_poll_loop(
            &self.automation,
            &self.detector,
            &self.extractor,
            &request.prompt,
            snapshot.as_deref(),
            &self.settings.poll,
            &request.request_id,
        )
        .await?;

        Ok(AskOutcome {
            text: extraction.text,
            context_reset: false,
            opened_conversation_id,
            extraction_mode: extraction.mode,
        })
    }

    /// Focus cascade: accessibility element, then a geometric click near the
    /// window bottom, then cycling keyboard focus.
    async fn focus_input(&self, request: &AskRequest) -> Result<(), BridgeError> {
        if self.automation.focus_input_element().await? {
            return Ok(());
        }
        self.automation.click_input_region().await?;
        if self.automation.input_focused().await? {
            return Ok(());
        }
        tracing::debug!(
            request_id = %request.request_id,
            "geometric click did not focus the composer; cycling keyboard focus"
        );
        self.automation.cycle_keyboard_focus().await?;
        if self.automation.input_focused().await? {
            return Ok(());
        }
        Err(BridgeError::new(
            BridgeErrorKind::UiElementNotFound,
            "could not focus the message composer",
        ))
    }

    /// Holds the process-wide clipboard lock across save → paste → submit,
    /// restoring the previous contents on every exit path. Non-text
    /// clipboard content does not round-trip.
    async fn paste_and_submit(&self, request: &AskRequest) -> Result<(), BridgeError> {
        let _clipboard = CLIPBOARD_LOCK.lock().await;
        let saved = match self.automation.read_clipboard().await {
            Ok(contents) => contents,
            Err(err) => {
                tracing::warn!(
                    request_id = %request.request_id,
                    error = %err,
                    "could not read clipboard; previous contents will not be restored"
                );
                None
            }
        };

        let send_result = async {
            self.automation.write_clipboard(&request.prompt).await?;
            self.automation.paste_and_submit().await
        }
        .await;

        if let Some(previous) = saved {
            if let Err(err) = self.automation.write_clipboard(&previous).await {
                tracing::warn!(
                    request_id = %request.request_id,
                    error = %err,
                    "failed to restore clipboard contents"
                );
            }
        }

        send_result
    }
}

#[async_trait]
impl<A: UiAutomation> UiDriver for ChatGptDriver<A> {
    async fn health(&self) -> HealthReport {
        let accessibility = self.automation.accessibility_status().await;
        let (app_running, code, message) = match self.automation.app_running().await {
            Ok(running) => (Some(running), None, None),
            Err(err) => (
                None,
                Some(err.kind.code().to_string()),
                Some(err.message.clone()),
            ),
        };
        let ok = accessibility == AccessibilityStatus::Granted && app_running == Some(true);
        HealthReport {
            ok,
            accessibility,
            app_running,
            code,
            message,
        }
    }

    async fn ask(&self, request: AskRequest) -> Result<AskOutcome, BridgeError> {
        let mut context_reset = false;
        match self.ask_inner(&request, &mut context_reset).await {
            Ok(mut outcome) => {
                outcome.context_reset = context_reset;
                Ok(outcome)
            }
            Err(err) => Err(err.with_context_reset(context_reset)),
        }
    }

    async fn get_conversations(&self, request_id: &str) -> Result<Vec<String>, BridgeError> {
        ensure_running(&self.automation).await?;
        ensure_window_available(&self.automation).await?;
        let raw = self.automation.sidebar_conversations().await?;
        let mut seen = std::collections::HashSet::new();
        let titles: Vec<String> = raw
            .into_iter()
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty() && seen.insert(t.clone()))
            .collect();
        tracing::debug!(request_id, count = titles.len(), "listed sidebar conversations");
        Ok(titles)
    }
}

/// Probes the app process; activates it once if absent; fails with
/// `app_not_running` when it still is not there.
pub(crate) async fn ensure_running<A>(automation: &A) -> Result<(), BridgeError>
where
    A: UiAutomation + ?Sized,
{
    if automation.app_running().await? {
        return Ok(());
    }
    automation.activate_app().await?;
    if automation.app_running().await? {
        return Ok(());
    }
    Err(BridgeError::new(
        BridgeErrorKind::AppNotRunning,
        "chat app is not running after activation",
    ))
}

/// Front-window recovery cascade: reopen the app, then the new-window
/// shortcut, then give up with `ui_element_not_found`.
pub(crate) async fn ensure_window_available<A>(automation: &A) -> Result<(), BridgeError>
where
    A: UiAutomation + ?Sized,
{
    if automation.front_window_exists().await? {
        return Ok(());
    }
    automation.reopen_app().await?;
    if automation.front_window_exists().await? {
        return Ok(());
    }
    automation.new_window_shortcut().await?;
    if automation.front_window_exists().await? {
        return Ok(());
    }
    Err(BridgeError::new(
        BridgeErrorKind::UiElementNotFound,
        "no chat window available after recovery attempts",
    ))
}
