use std::sync::Arc;
use std::time::Duration;

use crate::config::{AppConfig, ApprovalPolicy};
use crate::services::{
    dispatcher::Dispatcher, rate_limit::RateLimiter, retry::RetryController,
};

/// Per-run knobs that every worker needs.
#[derive(Debug, Clone)]
pub struct RunSettings {
    /// Caption prompt template sent with every batch.
    pub prompt: String,
    pub system_prompt: Option<String>,
    pub concurrency: usize,
    pub max_batch_size_bytes: u64,
    pub approval_policy: ApprovalPolicy,
}

impl RunSettings {
    pub fn from_config(config: &AppConfig, prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            system_prompt: Some(config.system_prompt.clone()).filter(|s| !s.trim().is_empty()),
            concurrency: config.concurrency.max(1),
            max_batch_size_bytes: config.max_batch_size_bytes,
            approval_policy: config.approval_policy,
        }
    }
}

/// Shared state cloned into every batch worker.
#[derive(Clone)]
pub struct AppState {
    pub dispatcher: Arc<dyn Dispatcher>,
    pub retry: Arc<RetryController>,
    pub limiter: Arc<RateLimiter>,
    pub settings: Arc<RunSettings>,
}

impl AppState {
    pub fn new(
        dispatcher: Arc<dyn Dispatcher>,
        retry: RetryController,
        limiter: RateLimiter,
        settings: RunSettings,
    ) -> Self {
        Self {
            dispatcher,
            retry: Arc::new(retry),
            limiter: Arc::new(limiter),
            settings: Arc::new(settings),
        }
    }

    pub fn from_config(
        config: &AppConfig,
        dispatcher: Arc<dyn Dispatcher>,
        prompt: impl Into<String>,
    ) -> Self {
        Self::new(
            dispatcher,
            RetryController::new(config.retry_policy()),
            RateLimiter::new(Duration::from_millis(config.request_interval_ms)),
            RunSettings::from_config(config, prompt),
        )
    }
}
