use std::time::Duration;

use garde::Validate;
use serde::Deserialize;
use strum::Display;

use crate::services::retry::RetryPolicy;

const OPENROUTER_URL: &str = "https://openrouter.ai/api/v1/chat/completions";

/// Whether generated captions need a human decision before export.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ApprovalPolicy {
    /// Captions stay `pending` until a reviewer approves or rejects them.
    #[default]
    Review,
    /// Captions are approved and exported as soon as they arrive.
    AutoApprove,
}

#[derive(Debug, Deserialize, Validate)]
pub struct AppConfig {
    /// OpenRouter API key. When set, OpenRouter is used instead of MiniMax.
    #[garde(skip)]
    pub openrouter_api_key: Option<String>,

    #[serde(default = "default_openrouter_model")]
    #[garde(length(min = 1))]
    pub openrouter_model_name: String,

    /// MiniMax API key for direct access.
    #[garde(skip)]
    pub minimax_api_key: Option<String>,

    /// MiniMax group ID (enterprise accounts).
    #[garde(skip)]
    pub minimax_group_id: Option<String>,

    #[serde(default = "default_minimax_url")]
    #[garde(length(min = 1))]
    pub minimax_api_base_url: String,

    #[serde(default = "default_minimax_model")]
    #[garde(length(min = 1))]
    pub minimax_model_name: String,

    /// Number of batches in flight at once.
    #[serde(default = "default_concurrency")]
    #[garde(range(min = 1, max = 64))]
    pub concurrency: usize,

    /// Attempts per batch, including the first.
    #[serde(default = "default_retry_max")]
    #[garde(range(min = 1, max = 20))]
    pub retry_max: u32,

    /// Base backoff delay in seconds.
    #[serde(default = "default_retry_delay")]
    #[garde(range(min = 0.0))]
    pub retry_delay: f64,

    /// Backoff ceiling in seconds.
    #[serde(default = "default_retry_max_delay")]
    #[garde(range(min = 0.0))]
    pub retry_max_delay: f64,

    /// Upper bound on a request's encoded image payload.
    #[serde(default = "default_max_batch_size_bytes")]
    #[garde(range(min = 1))]
    pub max_batch_size_bytes: u64,

    #[serde(default = "default_request_timeout_secs")]
    #[garde(range(min = 1))]
    pub request_timeout_secs: u64,

    /// Minimum spacing between outbound requests; 0 disables the limiter.
    #[serde(default)]
    #[garde(skip)]
    pub request_interval_ms: u64,

    #[serde(default = "default_system_prompt")]
    #[garde(skip)]
    pub system_prompt: String,

    #[serde(default)]
    #[garde(skip)]
    pub approval_policy: ApprovalPolicy,
}

fn default_openrouter_model() -> String {
    "minimax/minimax-01".to_string()
}

fn default_minimax_url() -> String {
    "https://api.minimax.chat/v1/chat/completions".to_string()
}

fn default_minimax_model() -> String {
    "MiniMax-VL-01".to_string()
}

fn default_concurrency() -> usize {
    1
}

fn default_retry_max() -> u32 {
    3
}

fn default_retry_delay() -> f64 {
    1.0
}

fn default_retry_max_delay() -> f64 {
    60.0
}

fn default_max_batch_size_bytes() -> u64 {
    15 * 1024 * 1024
}

fn default_request_timeout_secs() -> u64 {
    60
}

fn default_system_prompt() -> String {
    "You are a professional image analyst. Look at each image carefully and write an accurate English description.".to_string()
}

/// Which vision API the client talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum Provider {
    #[strum(serialize = "OpenRouter")]
    OpenRouter,
    #[strum(serialize = "MiniMax")]
    MiniMax,
}

/// Fully resolved connection settings for the vision API.
#[derive(Debug, Clone)]
pub struct ApiEndpoint {
    pub provider: Provider,
    pub url: String,
    pub model: String,
    pub api_key: String,
    pub group_id: Option<String>,
    pub timeout: Duration,
}

impl ApiEndpoint {
    /// API key with everything but the edges hidden, for logs.
    pub fn masked_key(&self) -> String {
        let chars: Vec<char> = self.api_key.chars().collect();
        if chars.len() <= 14 {
            return "***".to_string();
        }
        let head: String = chars[..10].iter().collect();
        let tail: String = chars[chars.len() - 4..].iter().collect();
        format!("{head}...{tail}")
    }
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        let config: Self = envy::from_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Build from explicit key/value pairs instead of the process environment.
    pub fn from_vars<I>(vars: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let config: Self = envy::from_iter(vars)?;
        config.validate()?;
        Ok(config)
    }

    /// Resolve the provider: OpenRouter when its key is set, MiniMax otherwise.
    pub fn endpoint(&self) -> Result<ApiEndpoint, ConfigError> {
        let timeout = Duration::from_secs(self.request_timeout_secs);

        if let Some(key) = non_blank(&self.openrouter_api_key) {
            return Ok(ApiEndpoint {
                provider: Provider::OpenRouter,
                url: OPENROUTER_URL.to_string(),
                model: self.openrouter_model_name.clone(),
                api_key: key.to_string(),
                group_id: None,
                timeout,
            });
        }

        let key = non_blank(&self.minimax_api_key).ok_or(ConfigError::MissingApiKey)?;
        Ok(ApiEndpoint {
            provider: Provider::MiniMax,
            url: self.minimax_api_base_url.clone(),
            model: self.minimax_model_name.clone(),
            api_key: key.to_string(),
            group_id: non_blank(&self.minimax_group_id).map(str::to_string),
            timeout,
        })
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry_max,
            base_delay: Duration::try_from_secs_f64(self.retry_delay)
                .unwrap_or(Duration::from_secs(1)),
            max_delay: Duration::try_from_secs_f64(self.retry_max_delay)
                .unwrap_or(Duration::from_secs(60)),
        }
    }

    /// Apply command-line overrides and re-check the bounds.
    pub fn with_overrides(
        mut self,
        concurrency: Option<usize>,
        retry_max: Option<u32>,
    ) -> Result<Self, ConfigError> {
        if let Some(c) = concurrency {
            self.concurrency = c;
        }
        if let Some(r) = retry_max {
            self.retry_max = r;
        }
        self.validate()?;
        Ok(self)
    }
}

fn non_blank(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read configuration from environment: {0}")]
    Env(#[from] envy::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(#[from] garde::Report),

    #[error("No API key configured (set OPENROUTER_API_KEY or MINIMAX_API_KEY)")]
    MissingApiKey,
}
