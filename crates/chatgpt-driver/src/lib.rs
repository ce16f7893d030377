#![forbid(unsafe_code)]

//! Accessibility-automation driver for the ChatGPT desktop app.
//!
//! The crate owns everything between "a rendered prompt" and "the
//! assistant's reply text": the OS-automation contract, the ask()
//! transaction, the response poll loop, the marker scheme, the noise-tolerant
//! extractor, and the closed failure taxonomy the HTTP surface maps to the
//! wire.

pub mod automation;
pub mod driver;
pub mod error;
pub mod extract;
pub mod helper;
pub mod marker;
pub mod poll;
pub mod ui_error;

pub use automation::{AccessibilityStatus, HealthReport, UiAutomation};
pub use driver::{AskOutcome, AskRequest, ChatGptDriver, DriverSettings, UiDriver};
pub use error::{BridgeError, BridgeErrorKind};
pub use extract::{Extraction, ExtractionMode, Extractor, UiLabels};
pub use helper::{HelperAutomation, HelperCommand};
pub use poll::PollSettings;
pub use ui_error::{UiErrorDetector, UiErrorPattern, default_patterns};
