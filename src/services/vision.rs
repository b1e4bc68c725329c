use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::config::{ApiEndpoint, Provider};
use crate::models::attempt::{DispatchFailure, FailureKind};
use crate::services::dispatcher::{demultiplex, CaptionRequest, Dispatcher};
use crate::services::encoder::EncodedImage;

/// 1x1 PNG used to verify credentials and connectivity.
const PIXEL_IMAGE: &str = "data:image/png;base64,iVBORw0KGgoAAAANSUhEUgAAAAEAAAABCAYAAAAfFcSJAAAADUlEQVR42mNkYPhfDwAChAGA7VT9mwAAAABJRU5ErkJggg==";

const OPENROUTER_MAX_TOKENS: u32 = 500;

/// Client for OpenAI-compatible vision chat endpoints (MiniMax, OpenRouter).
pub struct VisionClient {
    http: Client,
    endpoint: ApiEndpoint,
}

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
    base_resp: Option<BaseResp>,
    error: Option<Value>,
    reply: Option<String>,
}

#[derive(Deserialize)]
struct Choice {
    message: Option<ChoiceMessage>,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
}

/// MiniMax status envelope, present on both success and failure.
#[derive(Deserialize)]
struct BaseResp {
    status_code: i64,
    #[serde(default)]
    status_msg: String,
}

impl VisionClient {
    pub fn new(endpoint: ApiEndpoint) -> Result<Self, reqwest::Error> {
        let http = Client::builder().timeout(endpoint.timeout).build()?;
        Ok(Self { http, endpoint })
    }

    pub fn endpoint(&self) -> &ApiEndpoint {
        &self.endpoint
    }

    /// Send a tiny image to check that the key, URL and model work.
    pub async fn check_connection(&self) -> Result<String, DispatchFailure> {
        let request = CaptionRequest::for_batch(
            "Describe this image in one short sentence.",
            Some("Describe the image briefly."),
            vec![EncodedImage {
                mime_type: "image/png",
                data_url: PIXEL_IMAGE.to_string(),
            }],
        );
        let mut captions = self.dispatch(&request).await?;
        Ok(captions.pop().unwrap_or_default())
    }

    fn request_body(&self, request: &CaptionRequest) -> Value {
        let mut messages = Vec::with_capacity(2);

        if let Some(system) = &request.system_prompt {
            messages.push(match self.endpoint.provider {
                Provider::OpenRouter => json!({ "role": "system", "content": system }),
                Provider::MiniMax => json!({
                    "role": "system",
                    "content": [{ "type": "text", "text": system }]
                }),
            });
        }

        let mut content = vec![json!({ "type": "text", "text": request.prompt })];
        content.extend(request.images.iter().map(|image| {
            json!({ "type": "image_url", "image_url": { "url": image.data_url } })
        }));
        messages.push(json!({ "role": "user", "content": content }));

        let mut body = json!({
            "model": self.endpoint.model,
            "temperature": 0.2,
            "messages": messages,
        });
        if self.endpoint.provider == Provider::OpenRouter {
            body["max_tokens"] = json!(OPENROUTER_MAX_TOKENS);
        }
        body
    }
}

#[async_trait]
impl Dispatcher for VisionClient {
    async fn dispatch(&self, request: &CaptionRequest) -> Result<Vec<String>, DispatchFailure> {
        let mut builder = self
            .http
            .post(&self.endpoint.url)
            .bearer_auth(&self.endpoint.api_key)
            .json(&self.request_body(request));

        builder = match self.endpoint.provider {
            Provider::OpenRouter => builder
                .header("HTTP-Referer", "https://github.com/vision-tagger/vision-tagger")
                .header("X-Title", "Vision Tagger"),
            Provider::MiniMax => match &self.endpoint.group_id {
                Some(group_id) => builder.header("X-Group-ID", group_id),
                None => builder,
            },
        };

        tracing::debug!(
            provider = %self.endpoint.provider,
            images = request.image_count(),
            "Sending vision request"
        );

        let response = builder.send().await.map_err(classify_transport)?;
        let status = response.status();
        let retry_after = retry_after(response.headers());
        let body = response.text().await.map_err(classify_transport)?;

        if let Some(failure) = classify_status(status, retry_after, &body) {
            return Err(failure);
        }

        let content = extract_content(&body)?;
        let captions = demultiplex(&content, request.image_count())?;
        tracing::debug!(
            provider = %self.endpoint.provider,
            captions = captions.len(),
            "Vision request succeeded"
        );
        Ok(captions)
    }
}

fn classify_transport(err: reqwest::Error) -> DispatchFailure {
    let kind = if err.is_timeout() {
        FailureKind::Timeout
    } else {
        FailureKind::Network
    };
    DispatchFailure::new(kind, err.to_string())
}

fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

/// Map a non-success HTTP status to a failure; `None` for 2xx.
pub fn classify_status(
    status: StatusCode,
    retry_after: Option<Duration>,
    body: &str,
) -> Option<DispatchFailure> {
    if status.is_success() {
        return None;
    }

    let kind = match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => FailureKind::Auth,
        StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => FailureKind::Timeout,
        StatusCode::PAYLOAD_TOO_LARGE => FailureKind::PayloadTooLarge,
        StatusCode::TOO_MANY_REQUESTS => FailureKind::RateLimited,
        s if s.is_server_error() => FailureKind::ServerError,
        _ => FailureKind::InvalidRequest,
    };

    let snippet: String = body.chars().take(200).collect();
    Some(DispatchFailure::new(kind, format!("HTTP {status}: {snippet}")).with_retry_after(retry_after))
}

/// Classify a MiniMax `base_resp.status_code`.
pub fn classify_minimax_code(code: i64) -> FailureKind {
    match code {
        1001 => FailureKind::Timeout,
        1002 | 1039 => FailureKind::RateLimited,
        1004 | 2049 => FailureKind::Auth,
        1000 | 1013 => FailureKind::ServerError,
        _ => FailureKind::InvalidRequest,
    }
}

/// Pull the reply text out of a 2xx response body.
fn extract_content(body: &str) -> Result<String, DispatchFailure> {
    let parsed: ChatResponse = serde_json::from_str(body).map_err(|e| {
        DispatchFailure::new(
            FailureKind::MalformedResponse,
            format!("undecodable response body: {e}"),
        )
    })?;

    if let Some(base) = &parsed.base_resp {
        if base.status_code != 0 {
            return Err(DispatchFailure::new(
                classify_minimax_code(base.status_code),
                format!("API error {}: {}", base.status_code, base.status_msg),
            ));
        }
    }

    if let Some(error) = &parsed.error {
        let kind = error
            .get("code")
            .and_then(|code| {
                code.as_u64()
                    .or_else(|| code.as_str().and_then(|s| s.parse().ok()))
            })
            .and_then(|code| u16::try_from(code).ok())
            .and_then(|code| StatusCode::from_u16(code).ok())
            .and_then(|status| classify_status(status, None, ""))
            .map_or(FailureKind::MalformedResponse, |f| f.kind);
        let message = error
            .get("message")
            .and_then(Value::as_str)
            .map_or_else(|| error.to_string(), str::to_string);
        return Err(DispatchFailure::new(kind, format!("API error: {message}")));
    }

    parsed
        .choices
        .into_iter()
        .next()
        .and_then(|choice| choice.message)
        .and_then(|message| message.content)
        .or(parsed.reply)
        .ok_or_else(|| {
            DispatchFailure::new(
                FailureKind::MalformedResponse,
                "response has no message content",
            )
        })
}
