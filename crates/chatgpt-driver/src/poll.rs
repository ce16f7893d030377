//! Response-stabilization poll loop.
//!
//! A single cooperative loop scrapes the accessibility tree, detects error
//! banners, runs the extractor, and decides done / wait / recover / fail.
//! All loop state lives in an explicit [`PollState`] record with one
//! transition per scrape outcome.

use std::time::Duration;

use tokio::time::Instant;

use crate::automation::UiAutomation;
use crate::driver::{ensure_running, ensure_window_available};
use crate::error::{BridgeError, BridgeErrorKind};
use crate::extract::{Extraction, ExtractionMode, Extractor, has_typing_cursor, normalize_block};
use crate::marker::anchor_marker;
use crate::ui_error::UiErrorDetector;

const UI_UNAVAILABLE_GRACE: Duration = Duration::from_secs(120);
const SCRAPE_TIMEOUT_BACKOFF_STEP: Duration = Duration::from_secs(5);
const SCRAPE_TIMEOUT_BACKOFF_CAP: Duration = Duration::from_secs(60);
const PROGRESS_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Clone, Debug)]
pub struct PollSettings {
    pub max_wait: Duration,
    pub poll_interval: Duration,
    pub stable_checks: u32,
    pub no_indicator_stable: Duration,
    pub scrape_timeout: Duration,
    pub require_completion_indicators: bool,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            max_wait: Duration::from_secs(120),
            poll_interval: Duration::from_secs(1),
            stable_checks: 3,
            no_indicator_stable: Duration::from_millis(8_000),
            scrape_timeout: Duration::from_millis(10_000),
            require_completion_indicators: false,
        }
    }
}

#[derive(Debug)]
pub struct PollState {
    pub previous_full: Option<String>,
    pub previous_extracted_normalized: Option<String>,
    pub stable_count: u32,
    pub stable_since: Option<Instant>,
    pub scrape_timeout_since: Option<Instant>,
    pub ui_unavailable_since: Option<Instant>,
    pub scrape_timeout_current: Duration,
    recovery_attempts: u32,
    scrape_timeout_cap: Duration,
    initial_scrape_timeout: Duration,
}

impl PollState {
    #[must_use]
    pub fn new(scrape_timeout: Duration) -> Self {
        Self {
            previous_full: None,
            previous_extracted_normalized: None,
            stable_count: 0,
            stable_since: None,
            scrape_timeout_since: None,
            ui_unavailable_since: None,
            scrape_timeout_current: scrape_timeout,
            recovery_attempts: 0,
            scrape_timeout_cap: scrape_timeout.max(SCRAPE_TIMEOUT_BACKOFF_CAP),
            initial_scrape_timeout: scrape_timeout,
        }
    }

    fn reset_stability(&mut self) {
        self.previous_full = None;
        self.previous_extracted_normalized = None;
        self.stable_count = 0;
        self.stable_since = None;
    }

    /// Successful scrape after an outage: clear outage tracking, restore the
    /// inner scrape timeout, and start stability from scratch.
    fn note_recovered(&mut self) {
        if self.ui_unavailable_since.is_none() && self.scrape_timeout_since.is_none() {
            return;
        }
        self.ui_unavailable_since = None;
        self.scrape_timeout_since = None;
        self.scrape_timeout_current = self.initial_scrape_timeout;
        self.reset_stability();
    }

    /// Returns how long the UI has been unavailable.
    fn note_ui_unavailable(&mut self, now: Instant) -> Duration {
        let since = *self.ui_unavailable_since.get_or_insert(now);
        self.recovery_attempts += 1;
        self.reset_stability();
        now.duration_since(since)
    }

    /// Returns how long scrapes have been timing out; applies additive
    /// backoff to the inner scrape timeout.
    fn note_scrape_timeout(&mut self, now: Instant) -> Duration {
        let since = *self.scrape_timeout_since.get_or_insert(now);
        self.scrape_timeout_current = self
            .scrape_timeout_cap
            .min(self.scrape_timeout_current + SCRAPE_TIMEOUT_BACKOFF_STEP);
        self.reset_stability();
        now.duration_since(since)
    }

    fn observe_extracted(&mut self, normalized: Option<&str>, now: Instant) {
        match normalized {
            Some(text) => {
                if self.previous_extracted_normalized.as_deref() == Some(text) {
                    self.stable_count += 1;
                } else {
                    self.previous_extracted_normalized = Some(text.to_string());
                    self.stable_count = 0;
                    self.stable_since = Some(now);
                }
            }
            None => {
                self.previous_extracted_normalized = None;
                self.stable_count = 0;
                self.stable_since = None;
            }
        }
    }

    fn is_done(
        &self,
        full_text: &str,
        extraction: &Extraction,
        extractor: &Extractor,
        marker: Option<&str>,
        settings: &PollSettings,
        now: Instant,
    ) -> bool {
        if self.stable_count < settings.stable_checks {
            return false;
        }
        if has_typing_cursor(full_text) {
            return false;
        }
        let indicators = extractor.completion_indicators_present(full_text);
        let quiet_long_enough = self
            .stable_since
            .is_some_and(|since| now.duration_since(since) >= settings.no_indicator_stable);
        let completion_gate = if settings.require_completion_indicators {
            indicators
        } else {
            indicators || quiet_long_enough
        };
        if !completion_gate {
            return false;
        }
        match marker {
            Some(m) => full_text.contains(m) && extraction.mode == ExtractionMode::Marker,
            None => true,
        }
    }
}

/// Polls the UI until the reply is extractable and stable, a known UI error
/// appears, recovery grace runs out, or the deadline passes.
pub async fn run_poll_loop<A>(
    automation: &A,
    detector: &UiErrorDetector,
    extractor: &Extractor,
    anchor: &str,
    snapshot: Option<&str>,
    settings: &PollSettings,
    request_id: &str,
) -> Result<Extraction, BridgeError>
where
    A: UiAutomation + ?Sized,
{
    let started = Instant::now();
    let deadline = started + settings.max_wait;
    let scrape_grace = settings.max_wait.max(UI_UNAVAILABLE_GRACE);
    let marker = anchor_marker(anchor);
    let mut state = PollState::new(settings.scrape_timeout);
    let mut last_progress = started;
    let mut last_reject: Option<crate::extract::ExtractReject> = None;

    loop {
        let now = Instant::now();
        if now >= deadline {
            let mut err = BridgeError::timeout("response did not stabilize before the deadline")
                .with_detail("max_wait_sec", settings.max_wait.as_secs())
                .with_detail("stable_count", state.stable_count);
            if let Some(reject) = last_reject {
                err = err.with_detail("last_extract_reject", reject.reason());
            }
            return Err(err);
        }

        match tokio::time::timeout(state.scrape_timeout_current, automation.scrape_text()).await {
            Err(_elapsed) => {
                let since = state.note_scrape_timeout(Instant::now());
                if since > scrape_grace {
                    return Err(BridgeError::ui_error(
                        "accessibility scrape timed out repeatedly",
                        "scrape_timeout",
                    )
                    .with_detail("grace_sec", scrape_grace.as_secs())
                    .with_detail(
                        "scrape_timeout_ms",
                        state.scrape_timeout_current.as_millis() as u64,
                    ));
                }
                tracing::warn!(
                    request_id,
                    next_timeout_ms = state.scrape_timeout_current.as_millis() as u64,
                    "scrape timed out; backing off"
                );
            }
            Ok(Err(err)) if err.is_ui_unavailable() => {
                let since = state.note_ui_unavailable(Instant::now());
                if since > UI_UNAVAILABLE_GRACE {
                    return Err(BridgeError::new(
                        BridgeErrorKind::UiElementNotFound,
                        "chat window unavailable past the recovery grace",
                    )
                    .with_detail("grace_sec", UI_UNAVAILABLE_GRACE.as_secs())
                    .with_detail("recovery_attempts", state.recovery_attempts)
                    .with_detail("last_error", err.kind.code()));
                }
                if let Err(recover_err) = recover_window(automation).await {
                    tracing::warn!(
                        request_id,
                        error = %recover_err,
                        "window recovery attempt failed"
                    );
                }
            }
            Ok(Err(err)) => return Err(err),
            Ok(Ok(full_text)) => {
                if let Some(err) = detector.detect(&full_text) {
                    return Err(err);
                }
                state.note_recovered();

                let extraction = match extractor.extract(&full_text, anchor, snapshot) {
                    Ok(extraction) => {
                        last_reject = None;
                        Some(extraction)
                    }
                    Err(reject) => {
                        last_reject = Some(reject);
                        None
                    }
                };
                let normalized = extraction.as_ref().map(|e| normalize_block(&e.text));
                state.observe_extracted(normalized.as_deref(), Instant::now());
                if let Some(extraction) = extraction {
                    if state.is_done(
                        &full_text,
                        &extraction,
                        extractor,
                        marker,
                        settings,
                        Instant::now(),
                    ) {
                        return Ok(extraction);
                    }
                }
                state.previous_full = Some(full_text);
            }
        }

        if now.duration_since(last_progress) >= PROGRESS_INTERVAL {
            last_progress = now;
            tracing::info!(
                request_id,
                elapsed_sec = now.duration_since(started).as_secs(),
                stable_count = state.stable_count,
                scrape_timeout_ms = state.scrape_timeout_current.as_millis() as u64,
                "awaiting response stabilization"
            );
        }
        tokio::time::sleep(settings.poll_interval).await;
    }
}

async fn recover_window<A>(automation: &A) -> Result<(), BridgeError>
where
    A: UiAutomation + ?Sized,
{
    ensure_running(automation).await?;
    ensure_window_available(automation).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::automation::AccessibilityStatus;
    use crate::extract::UiLabels;
    use crate::marker::make_marker;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    fn settings() -> PollSettings {
        PollSettings::default()
    }

    /// Scripted scrape outcomes; `None` entries hang until the inner scrape
    /// timeout fires. The last entry repeats once the script runs out.
    struct ScriptedScrapes {
        script: Mutex<VecDeque<Option<Result<String, BridgeError>>>>,
        last: Mutex<Option<Option<Result<String, BridgeError>>>>,
    }

    impl ScriptedScrapes {
        fn new(script: Vec<Option<Result<String, BridgeError>>>) -> Self {
            Self {
                script: Mutex::new(script.into()),
                last: Mutex::new(None),
            }
        }
    }

    #[async_trait]
    impl UiAutomation for ScriptedScrapes {
        async fn accessibility_status(&self) -> AccessibilityStatus {
            AccessibilityStatus::Granted
        }

        async fn app_running(&self) -> Result<bool, BridgeError> {
            Ok(true)
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
            let next = {
                let mut script = self.script.lock().unwrap();
                match script.pop_front() {
                    Some(entry) => {
                        *self.last.lock().unwrap() = Some(entry.clone());
                        entry
                    }
                    None => self.last.lock().unwrap().clone().unwrap_or(None),
                }
            };
            match next {
                Some(outcome) => outcome,
                None => {
                    tokio::time::sleep(Duration::from_secs(86_400)).await;
                    Ok(String::new())
                }
            }
        }

        async fn sidebar_conversations(&self) -> Result<Vec<String>, BridgeError> {
            Ok(Vec::new())
        }

        async fn open_conversation(&self, _title: &str) -> Result<bool, BridgeError> {
            Ok(true)
        }

        async fn new_chat(&self) -> Result<bool, BridgeError> {
            Ok(true)
        }

        async fn focus_input_element(&self) -> Result<bool, BridgeError> {
            Ok(true)
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
            Ok(None)
        }

        async fn write_clipboard(&self, _text: &str) -> Result<(), BridgeError> {
            Ok(())
        }

        async fn paste_and_submit(&self) -> Result<(), BridgeError> {
            Ok(())
        }
    }

    fn anchor_and_frame(body: &str) -> (String, String) {
        let marker = make_marker("poll-test", "poll-secret");
        let anchor = format!("the poll test prompt\n\n{marker}");
        let frame = format!("chrome\n{anchor}\n{body}\nRegenerate");
        (anchor, frame)
    }

    #[tokio::test(start_paused = true)]
    async fn loop_recovers_from_a_ui_outage_and_completes() {
        let (anchor, frame) = anchor_and_frame("the answer");
        let outage = BridgeError::new(BridgeErrorKind::AppNotRunning, "gone");
        let automation = ScriptedScrapes::new(vec![
            Some(Err(outage.clone())),
            Some(Err(outage)),
            Some(Ok(frame.clone())),
            Some(Ok(frame)),
        ]);
        let extractor = Extractor::new(&UiLabels::default());
        let detector = UiErrorDetector::with_defaults();

        let got = run_poll_loop(
            &automation,
            &detector,
            &extractor,
            &anchor,
            None,
            &settings(),
            "poll-test",
        )
        .await
        .unwrap();
        assert_eq!(got.text, "the answer");
        assert_eq!(got.mode, ExtractionMode::Marker);
    }

    #[tokio::test(start_paused = true)]
    async fn loop_surfaces_detected_ui_errors_immediately() {
        let anchor = format!("prompt\n\n{}", make_marker("poll-err", "poll-secret"));
        let automation =
            ScriptedScrapes::new(vec![Some(Ok("Too many requests right now".to_string()))]);
        let extractor = Extractor::new(&UiLabels::default());
        let detector = UiErrorDetector::with_defaults();

        let err = run_poll_loop(
            &automation,
            &detector,
            &extractor,
            &anchor,
            None,
            &settings(),
            "poll-err",
        )
        .await
        .unwrap_err();
        assert_eq!(err.kind, BridgeErrorKind::RateLimitedByChatGpt);
        assert_eq!(err.retry_after_sec, Some(60));
    }

    #[tokio::test(start_paused = true)]
    async fn hanging_scrapes_back_off_until_the_deadline() {
        let anchor = format!("prompt\n\n{}", make_marker("poll-hang", "poll-secret"));
        let automation = ScriptedScrapes::new(vec![None]);
        let extractor = Extractor::new(&UiLabels::default());
        let detector = UiErrorDetector::with_defaults();
        let mut settings = settings();
        settings.max_wait = Duration::from_secs(5);
        settings.scrape_timeout = Duration::from_secs(2);

        let err = run_poll_loop(
            &automation,
            &detector,
            &extractor,
            &anchor,
            None,
            &settings,
            "poll-hang",
        )
        .await
        .unwrap_err();
        assert_eq!(err.kind, BridgeErrorKind::Timeout);
    }

    #[tokio::test(start_paused = true)]
    async fn stability_counter_increments_on_equal_text() {
        let mut state = PollState::new(Duration::from_secs(10));
        let now = Instant::now();
        state.observe_extracted(Some("answer"), now);
        assert_eq!(state.stable_count, 0);
        state.observe_extracted(Some("answer"), now);
        state.observe_extracted(Some("answer"), now);
        assert_eq!(state.stable_count, 2);
        state.observe_extracted(Some("answer grew"), now);
        assert_eq!(state.stable_count, 0);
        state.observe_extracted(None, now);
        assert_eq!(state.stable_count, 0);
        assert!(state.stable_since.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn scrape_timeout_backoff_is_additive_and_capped() {
        let mut state = PollState::new(Duration::from_secs(10));
        let now = Instant::now();
        state.note_scrape_timeout(now);
        assert_eq!(state.scrape_timeout_current, Duration::from_secs(15));
        for _ in 0..20 {
            state.note_scrape_timeout(now);
        }
        assert_eq!(state.scrape_timeout_current, Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn recovery_restores_timeout_and_resets_stability() {
        let mut state = PollState::new(Duration::from_secs(10));
        let now = Instant::now();
        state.observe_extracted(Some("answer"), now);
        state.observe_extracted(Some("answer"), now);
        state.note_scrape_timeout(now);
        assert_eq!(state.stable_count, 0);
        state.note_recovered();
        assert_eq!(state.scrape_timeout_current, Duration::from_secs(10));
        assert!(state.scrape_timeout_since.is_none());
        assert!(state.previous_extracted_normalized.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn done_requires_stability_and_a_completion_signal() {
        let extractor = Extractor::new(&crate::extract::UiLabels::default());
        let settings = settings();
        let mut state = PollState::new(settings.scrape_timeout);
        let now = Instant::now();
        let extraction = Extraction {
            text: "done".to_string(),
            mode: ExtractionMode::Marker,
        };

        for _ in 0..=settings.stable_checks {
            state.observe_extracted(Some("done"), now);
        }
        // Stable but no indicator and no quiet window yet.
        assert!(!state.is_done(
            "scrape without indicators",
            &extraction,
            &extractor,
            None,
            &settings,
            now
        ));
        // Indicator label present.
        assert!(state.is_done(
            "scrape\nRegenerate",
            &extraction,
            &extractor,
            None,
            &settings,
            now
        ));
        // Quiet window elapsed without indicators.
        assert!(state.is_done(
            "scrape without indicators",
            &extraction,
            &extractor,
            None,
            &settings,
            now + settings.no_indicator_stable
        ));
        // Typing cursor vetoes completion.
        assert!(!state.is_done(
            "scrape\nRegenerate\u{258D}",
            &extraction,
            &extractor,
            None,
            &settings,
            now
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn marker_gate_requires_visible_marker_and_marker_mode() {
        let extractor = Extractor::new(&crate::extract::UiLabels::default());
        let settings = settings();
        let mut state = PollState::new(settings.scrape_timeout);
        let now = Instant::now();
        for _ in 0..=settings.stable_checks {
            state.observe_extracted(Some("done"), now);
        }
        let marker = Some("[[OC=r.abc]]");
        let by_marker = Extraction {
            text: "done".to_string(),
            mode: ExtractionMode::Marker,
        };
        let by_delta = Extraction {
            text: "done".to_string(),
            mode: ExtractionMode::SnapshotDelta,
        };
        assert!(state.is_done(
            "[[OC=r.abc]]\ndone\nRegenerate",
            &by_marker,
            &extractor,
            marker,
            &settings,
            now
        ));
        assert!(!state.is_done(
            "done\nRegenerate",
            &by_marker,
            &extractor,
            marker,
            &settings,
            now
        ));
        assert!(!state.is_done(
            "[[OC=r.abc]]\ndone\nRegenerate",
            &by_delta,
            &extractor,
            marker,
            &settings,
            now
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn require_completion_indicators_disables_the_quiet_window() {
        let extractor = Extractor::new(&crate::extract::UiLabels::default());
        let mut settings = settings();
        settings.require_completion_indicators = true;
        let mut state = PollState::new(settings.scrape_timeout);
        let now = Instant::now();
        for _ in 0..=settings.stable_checks {
            state.observe_extracted(Some("done"), now);
        }
        let extraction = Extraction {
            text: "done".to_string(),
            mode: ExtractionMode::Marker,
        };
        assert!(!state.is_done(
            "no indicators here",
            &extraction,
            &extractor,
            None,
            &settings,
            now + Duration::from_secs(3600)
        ));
    }
}
