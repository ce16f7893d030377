#![forbid(unsafe_code)]

use std::sync::Arc;

use anyhow::Result;
use chatgpt_driver::{
    ChatGptDriver, DriverSettings, HelperAutomation, HelperCommand, PollSettings, UiDriver,
    UiErrorDetector,
};
use tokio::net::TcpListener;
use tracing::info;

pub mod admission;
pub mod audit;
pub mod config;
pub mod file_context;
pub mod limiter;
pub mod prompt;
pub mod server;
pub mod session;

use crate::admission::{SingleFlight, UiWorkQueue};
use crate::audit::AuditLog;
use crate::config::Config;
use crate::limiter::RateLimiter;
use crate::prompt::PromptRenderer;
use crate::server::AppState;
use crate::session::{SessionRouter, SessionStore};

pub fn build_state(config: Config, driver: Arc<dyn UiDriver>) -> Result<AppState> {
    let store = SessionStore::load(&config.session_bindings_path)?;
    let sessions = Arc::new(SessionRouter::new(
        config.session_binding_mode,
        config.session_default_slot.clone(),
        store,
    ));
    let limiter = (config.rate_limit_rpm > 0).then(|| {
        Arc::new(RateLimiter::new(
            config.rate_limit_rpm,
            config.rate_limit_burst,
        ))
    });
    let queue = UiWorkQueue::new(config.max_queue_size, config.job_timeout);
    let audit = Arc::new(AuditLog::new(config.audit.clone()));
    Ok(AppState {
        config: Arc::new(config),
        driver,
        single_flight: SingleFlight::new(),
        queue,
        limiter,
        sessions,
        audit,
        renderer: Arc::new(PromptRenderer::new()),
    })
}

/// The production driver: the accessibility helper process behind the
/// ChatGPT driver, tuned from configuration.
pub fn build_driver(config: &Config) -> Result<Arc<dyn UiDriver>> {
    let command = HelperCommand::parse(&config.ax_helper_cmd)
        .ok_or_else(|| anyhow::anyhow!("AX_HELPER_CMD must name a helper binary"))?;
    let detector = match &config.ui_error_patterns_json {
        Some(json) => UiErrorDetector::from_json(json)?,
        None => UiErrorDetector::with_defaults(),
    };
    let settings = DriverSettings {
        poll: PollSettings {
            max_wait: config.max_wait,
            poll_interval: config.poll_interval,
            stable_checks: config.stable_checks,
            no_indicator_stable: config.extract_no_indicator_stable,
            scrape_timeout: config.scrape_call_timeout,
            require_completion_indicators: config.require_completion_indicators,
        },
        ui_labels: config.ui_labels.clone(),
    };
    Ok(Arc::new(ChatGptDriver::new(
        HelperAutomation::new(command),
        detector,
        settings,
    )))
}

pub fn build_app(config: Config, driver: Arc<dyn UiDriver>) -> Result<axum::Router> {
    Ok(server::build_router(build_state(config, driver)?))
}

pub async fn serve(config: Config) -> Result<()> {
    let driver = build_driver(&config)?;
    let bind_addr = config.bind_addr;
    let listener = TcpListener::bind(bind_addr).await?;
    info!(bind_addr = %bind_addr, "chatgpt bridge listening");
    axum::serve(listener, build_app(config, driver)?).await?;
    Ok(())
}
