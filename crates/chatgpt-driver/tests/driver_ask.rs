//! End-to-end ask() tests against a scripted automation layer.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chatgpt_driver::{
    AccessibilityStatus, AskRequest, BridgeError, BridgeErrorKind, ChatGptDriver, DriverSettings,
    ExtractionMode, UiAutomation, UiDriver, UiErrorDetector,
};

const BASE_SCRAPE: &str = "ChatGPT\nNew chat\nolder conversation text";

fn marker_for(request_id: &str) -> String {
    chatgpt_driver::marker::make_marker(request_id, "test-secret")
}

struct ScriptedAutomation {
    running: AtomicBool,
    accessibility: AccessibilityStatus,
    conversations: Vec<String>,
    reset_accepts: bool,
    focus_via_element: bool,
    submitted: AtomicBool,
    response_frames: Mutex<VecDeque<String>>,
    last_frame: Mutex<Option<String>>,
    clipboard: Mutex<Option<String>>,
    submitted_prompts: Mutex<Vec<String>>,
}

impl ScriptedAutomation {
    fn new(response_frames: Vec<String>) -> Self {
        Self {
            running: AtomicBool::new(true),
            accessibility: AccessibilityStatus::Granted,
            conversations: vec!["Project Alpha".to_string(), "Scratch".to_string()],
            reset_accepts: true,
            focus_via_element: true,
            submitted: AtomicBool::new(false),
            response_frames: Mutex::new(response_frames.into()),
            last_frame: Mutex::new(None),
            clipboard: Mutex::new(Some("previous clipboard".to_string())),
            submitted_prompts: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl UiAutomation for ScriptedAutomation {
    async fn accessibility_status(&self) -> AccessibilityStatus {
        self.accessibility
    }

    async fn app_running(&self) -> Result<bool, BridgeError> {
        Ok(self.running.load(Ordering::SeqCst))
    }

    async fn activate_app(&self) -> Result<(), BridgeError> {
        Ok(())
    }

    async fn front_window_exists(&self) -> Result<bool, BridgeError> {
        Ok(true)
    }

    async fn reopen_app(&self) -> Result<(), BridgeError> {
        Ok(())
    }

    async fn new_window_shortcut(&self) -> Result<(), BridgeError> {
        Ok(())
    }

    async fn scrape_text(&self) -> Result<String, BridgeError> {
        if !self.submitted.load(Ordering::SeqCst) {
            return Ok(BASE_SCRAPE.to_string());
        }
        let mut frames = self.response_frames.lock().unwrap();
        match frames.pop_front() {
            Some(frame) => {
                *self.last_frame.lock().unwrap() = Some(frame.clone());
                Ok(frame)
            }
            None => Ok(self
                .last_frame
                .lock()
                .unwrap()
                .clone()
                .unwrap_or_else(|| BASE_SCRAPE.to_string())),
        }
    }

    async fn sidebar_conversations(&self) -> Result<Vec<String>, BridgeError> {
        let mut titles = self.conversations.clone();
        titles.push("Project Alpha".to_string());
        titles.push("  ".to_string());
        Ok(titles)
    }

    async fn open_conversation(&self, title: &str) -> Result<bool, BridgeError> {
        Ok(self.conversations.iter().any(|t| t == title))
    }

    async fn new_chat(&self) -> Result<bool, BridgeError> {
        Ok(self.reset_accepts)
    }

    async fn focus_input_element(&self) -> Result<bool, BridgeError> {
        Ok(self.focus_via_element)
    }

    async fn click_input_region(&self) -> Result<(), BridgeError> {
        Ok(())
    }

    async fn cycle_keyboard_focus(&self) -> Result<(), BridgeError> {
        Ok(())
    }

    async fn input_focused(&self) -> Result<bool, BridgeError> {
        Ok(true)
    }

    async fn read_clipboard(&self) -> Result<Option<String>, BridgeError> {
        Ok(self.clipboard.lock().unwrap().clone())
    }

    async fn write_clipboard(&self, text: &str) -> Result<(), BridgeError> {
        *self.clipboard.lock().unwrap() = Some(text.to_string());
        Ok(())
    }

    async fn paste_and_submit(&self) -> Result<(), BridgeError> {
        let pasted = self
            .clipboard
            .lock()
            .unwrap()
            .clone()
            .unwrap_or_default();
        self.submitted_prompts.lock().unwrap().push(pasted);
        self.submitted.store(true, Ordering::SeqCst);
        Ok(())
    }
}

fn driver_with(automation: ScriptedAutomation) -> ChatGptDriver<ScriptedAutomation> {
    ChatGptDriver::new(
        automation,
        UiErrorDetector::with_defaults(),
        DriverSettings::default(),
    )
}

fn ask_request(prompt_body: &str, request_id: &str) -> AskRequest {
    let marker = marker_for(request_id);
    AskRequest {
        prompt: format!("{prompt_body}\n\n{marker}"),
        marker,
        request_id: request_id.to_string(),
        conversation_id: None,
        strict_open: false,
        reset_each_request: false,
        reset_strict: false,
    }
}

fn response_frame(request: &AskRequest, body: &str) -> String {
    format!(
        "{BASE_SCRAPE}\n{prompt}\n{body}\nRegenerate",
        prompt = request.prompt
    )
}

#[tokio::test(start_paused = true)]
async fn ask_extracts_a_stable_marker_cut_reply() {
    let request = ask_request("What is Rust?", "req-happy");
    let partial = format!(
        "{BASE_SCRAPE}\n{prompt}\nRust is\u{258D}",
        prompt = request.prompt
    );
    let automation = ScriptedAutomation::new(vec![
        partial,
        response_frame(&request, "Rust is a systems programming language."),
    ]);
    let driver = driver_with(automation);

    let outcome = driver.ask(request.clone()).await.unwrap();
    assert_eq!(outcome.text, "Rust is a systems programming language.");
    assert_eq!(outcome.extraction_mode, ExtractionMode::Marker);
    assert!(!outcome.context_reset);

    // The prompt went out through the clipboard and the previous contents
    // were restored afterwards.
    let submitted = driver_submitted(&driver);
    assert_eq!(submitted, vec![request.prompt.clone()]);
    assert_eq!(
        driver_clipboard(&driver),
        Some("previous clipboard".to_string())
    );
}

#[tokio::test(start_paused = true)]
async fn ask_resets_context_when_asked_to() {
    let mut request = ask_request("fresh context please", "req-reset");
    request.reset_each_request = true;
    let automation =
        ScriptedAutomation::new(vec![response_frame(&request, "starting over.")]);
    let driver = driver_with(automation);

    let outcome = driver.ask(request).await.unwrap();
    assert!(outcome.context_reset);
}

#[tokio::test(start_paused = true)]
async fn strict_reset_refusal_fails_with_ui_reset_failed() {
    let mut request = ask_request("fresh context please", "req-reset-strict");
    request.reset_each_request = true;
    request.reset_strict = true;
    let mut automation =
        ScriptedAutomation::new(vec![response_frame(&request, "never sent")]);
    automation.reset_accepts = false;
    let driver = driver_with(automation);

    let err = driver.ask(request).await.unwrap_err();
    assert_eq!(err.kind, BridgeErrorKind::UiResetFailed);
    assert_eq!(err.context_reset, Some(false));
    assert!(driver_submitted(&driver).is_empty());
}

#[tokio::test(start_paused = true)]
async fn strict_open_miss_fails_with_conversation_not_found() {
    let mut request = ask_request("hello", "req-strict-open");
    request.conversation_id = Some("No Such Conversation".to_string());
    request.strict_open = true;
    let automation = ScriptedAutomation::new(vec![response_frame(&request, "never sent")]);
    let driver = driver_with(automation);

    let err = driver.ask(request).await.unwrap_err();
    assert_eq!(err.kind, BridgeErrorKind::ConversationNotFound);
    assert!(driver_submitted(&driver).is_empty());
}

#[tokio::test(start_paused = true)]
async fn known_conversation_is_reported_as_opened() {
    let mut request = ask_request("hello alpha", "req-open");
    request.conversation_id = Some("Project Alpha".to_string());
    let automation = ScriptedAutomation::new(vec![response_frame(&request, "hi.")]);
    let driver = driver_with(automation);

    let outcome = driver.ask(request).await.unwrap();
    assert_eq!(
        outcome.opened_conversation_id,
        Some("Project Alpha".to_string())
    );
}

#[tokio::test(start_paused = true)]
async fn ui_error_banner_maps_to_rate_limited() {
    let request = ask_request("hello", "req-rate");
    let automation = ScriptedAutomation::new(vec![format!(
        "{BASE_SCRAPE}\nToo many requests right now"
    )]);
    let driver = driver_with(automation);

    let err = driver.ask(request).await.unwrap_err();
    assert_eq!(err.kind, BridgeErrorKind::RateLimitedByChatGpt);
    assert_eq!(err.retry_after_sec, Some(60));
    assert_eq!(err.context_reset, Some(false));
}

#[tokio::test(start_paused = true)]
async fn unextractable_ui_times_out_at_the_deadline() {
    let request = ask_request("hello", "req-timeout");
    let automation = ScriptedAutomation::new(vec![BASE_SCRAPE.to_string()]);
    let mut settings = DriverSettings::default();
    settings.poll.max_wait = std::time::Duration::from_secs(5);
    let driver = ChatGptDriver::new(automation, UiErrorDetector::with_defaults(), settings);

    let err = driver.ask(request).await.unwrap_err();
    assert_eq!(err.kind, BridgeErrorKind::Timeout);
}

#[tokio::test(start_paused = true)]
async fn app_gone_preflight_fails_with_app_not_running() {
    let request = ask_request("hello", "req-gone");
    let automation = ScriptedAutomation::new(vec![]);
    automation.running.store(false, Ordering::SeqCst);
    let driver = driver_with(automation);

    let err = driver.ask(request).await.unwrap_err();
    assert_eq!(err.kind, BridgeErrorKind::AppNotRunning);
}

#[tokio::test(start_paused = true)]
async fn conversations_are_ordered_and_deduplicated() {
    let automation = ScriptedAutomation::new(vec![]);
    let driver = driver_with(automation);

    let titles = driver.get_conversations("req-list").await.unwrap();
    assert_eq!(titles, vec!["Project Alpha", "Scratch"]);
}

#[tokio::test(start_paused = true)]
async fn health_reflects_accessibility_and_process_state() {
    let automation = ScriptedAutomation::new(vec![]);
    let driver = driver_with(automation);
    let health = driver.health().await;
    assert!(health.ok);
    assert_eq!(health.app_running, Some(true));

    let automation = ScriptedAutomation::new(vec![]);
    automation.running.store(false, Ordering::SeqCst);
    let driver = driver_with(automation);
    let health = driver.health().await;
    assert!(!health.ok);
    assert_eq!(health.app_running, Some(false));
}

fn driver_submitted(driver: &ChatGptDriver<ScriptedAutomation>) -> Vec<String> {
    driver.automation().submitted_prompts.lock().unwrap().clone()
}

fn driver_clipboard(driver: &ChatGptDriver<ScriptedAutomation>) -> Option<String> {
    driver.automation().clipboard.lock().unwrap().clone()
}
