use async_trait::async_trait;

use crate::models::attempt::{DispatchFailure, FailureKind};
use crate::services::encoder::EncodedImage;

/// Everything needed for one remote captioning call.
#[derive(Debug, Clone)]
pub struct CaptionRequest {
    pub prompt: String,
    pub system_prompt: Option<String>,
    pub images: Vec<EncodedImage>,
}

impl CaptionRequest {
    /// Build a request for a batch. With several images the prompt asks for a
    /// JSON array so the answer can be split back per image.
    pub fn for_batch(
        template: &str,
        system_prompt: Option<&str>,
        images: Vec<EncodedImage>,
    ) -> Self {
        let prompt = if images.len() > 1 {
            format!(
                "{template}\n\nYou are given {n} images. Reply with a JSON array of exactly {n} strings, \
                 one caption per image in the order the images were given, and nothing else.",
                template = template.trim(),
                n = images.len()
            )
        } else {
            template.trim().to_string()
        };

        Self {
            prompt,
            system_prompt: system_prompt
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string),
            images,
        }
    }

    pub fn image_count(&self) -> usize {
        self.images.len()
    }
}

/// One outbound call per invocation, no internal retries.
#[async_trait]
pub trait Dispatcher: Send + Sync {
    /// Returns one caption per image, in request order.
    async fn dispatch(&self, request: &CaptionRequest) -> Result<Vec<String>, DispatchFailure>;
}

/// Split a model reply into `expected` captions.
pub fn demultiplex(content: &str, expected: usize) -> Result<Vec<String>, DispatchFailure> {
    let content = content.trim();
    if content.is_empty() {
        return Err(DispatchFailure::new(
            FailureKind::MalformedResponse,
            "empty caption in response",
        ));
    }
    if expected == 1 {
        return Ok(vec![content.to_string()]);
    }

    let captions: Vec<String> = serde_json::from_str(strip_code_fence(content)).map_err(|e| {
        DispatchFailure::new(
            FailureKind::MalformedResponse,
            format!("expected a JSON array of {expected} captions: {e}"),
        )
    })?;

    if captions.len() != expected {
        return Err(DispatchFailure::new(
            FailureKind::MalformedResponse,
            format!("expected {expected} captions, got {}", captions.len()),
        ));
    }
    if captions.iter().any(|c| c.trim().is_empty()) {
        return Err(DispatchFailure::new(
            FailureKind::MalformedResponse,
            "response contains an empty caption",
        ));
    }
    Ok(captions.into_iter().map(|c| c.trim().to_string()).collect())
}

fn strip_code_fence(content: &str) -> &str {
    let Some(rest) = content.strip_prefix("```") else {
        return content;
    };
    // Drop an info string such as ```json, with or without a newline after it
    let info_len = rest
        .find(|c: char| !c.is_ascii_alphanumeric())
        .unwrap_or(rest.len());
    let body = rest[info_len..].trim();
    body.strip_suffix("```").unwrap_or(body).trim()
}
