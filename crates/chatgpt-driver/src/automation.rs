//! The narrow OS-automation contract the driver is built on.
//!
//! Everything platform-specific (accessibility-tree traversal, keystrokes,
//! clipboard, window management) lives behind [`UiAutomation`]. The bridge
//! ships a helper-process client implementation ([`crate::helper`]); tests
//! use scripted in-memory implementations.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::BridgeError;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessibilityStatus {
    Granted,
    Denied,
    Unknown,
}

/// Driver health probe result, surfaced through `/health`.
#[derive(Clone, Debug, Serialize)]
pub struct HealthReport {
    pub ok: bool,
    pub accessibility: AccessibilityStatus,
    pub app_running: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// OS-level automation primitives. Each method is a single, small UI action;
/// sequencing and recovery policy live in the driver and the poll loop.
#[async_trait]
pub trait UiAutomation: Send + Sync {
    async fn accessibility_status(&self) -> AccessibilityStatus;

    async fn app_running(&self) -> Result<bool, BridgeError>;

    async fn activate_app(&self) -> Result<(), BridgeError>;

    async fn front_window_exists(&self) -> Result<bool, BridgeError>;

    async fn reopen_app(&self) -> Result<(), BridgeError>;

    async fn new_window_shortcut(&self) -> Result<(), BridgeError>;

    /// One accessibility-tree read: the concatenated descriptions of
    /// static-text elements, as a single blob.
    async fn scrape_text(&self) -> Result<String, BridgeError>;

    /// Sidebar conversation titles, top to bottom, possibly with duplicates.
    async fn sidebar_conversations(&self) -> Result<Vec<String>, BridgeError>;

    /// Opens a named conversation from the sidebar. `Ok(false)` means the
    /// title was not found.
    async fn open_conversation(&self, title: &str) -> Result<bool, BridgeError>;

    /// Starts a new chat. `Ok(false)` means the app refused the reset.
    async fn new_chat(&self) -> Result<bool, BridgeError>;

    /// Focuses the composer via its accessibility element. `Ok(false)` means
    /// the element was not found.
    async fn focus_input_element(&self) -> Result<bool, BridgeError>;

    /// Geometric fallback: click near the bottom of the front window.
    async fn click_input_region(&self) -> Result<(), BridgeError>;

    /// Last-resort fallback: cycle keyboard focus toward the composer.
    async fn cycle_keyboard_focus(&self) -> Result<(), BridgeError>;

    /// Whether the composer currently has keyboard focus.
    async fn input_focused(&self) -> Result<bool, BridgeError>;

    /// Current clipboard text, `None` when empty or non-text.
    async fn read_clipboard(&self) -> Result<Option<String>, BridgeError>;

    async fn write_clipboard(&self, text: &str) -> Result<(), BridgeError>;

    /// Pastes the clipboard into the focused composer and submits.
    async fn paste_and_submit(&self) -> Result<(), BridgeError>;
}
