use std::time::Duration;

use strum::{Display, IntoStaticStr};

/// Classification of a failed dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
pub enum FailureKind {
    // Transient
    RateLimited,
    Timeout,
    Network,
    ServerError,
    MalformedResponse,

    // Permanent, per request
    InvalidRequest,
    PayloadTooLarge,
    UnsupportedFormat,

    // Permanent, fatal for the run
    Auth,
}

impl FailureKind {
    pub fn is_transient(self) -> bool {
        matches!(
            self,
            FailureKind::RateLimited
                | FailureKind::Timeout
                | FailureKind::Network
                | FailureKind::ServerError
                | FailureKind::MalformedResponse
        )
    }

    /// Failures that indicate misconfiguration rather than a bad image.
    pub fn is_fatal(self) -> bool {
        matches!(self, FailureKind::Auth)
    }
}

/// A classified dispatch failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct DispatchFailure {
    pub kind: FailureKind,
    pub message: String,
    /// Server-provided hint for when to retry (e.g. `Retry-After`).
    pub retry_after: Option<Duration>,
}

impl DispatchFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            retry_after: None,
        }
    }

    pub fn with_retry_after(mut self, retry_after: Option<Duration>) -> Self {
        self.retry_after = retry_after;
        self
    }
}

/// How a retry cycle for one batch ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptOutcome {
    /// One caption per image, in batch order.
    Captioned(Vec<String>),
    /// Last failure seen; either permanent or the attempt budget ran out.
    Failed(DispatchFailure),
    /// Stopped before another attempt was started.
    Cancelled,
}

/// Final result of dispatching one batch, folded into the manifest by the recorder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptResult {
    pub attempts: u32,
    pub outcome: AttemptOutcome,
}

impl AttemptResult {
    pub fn captioned(attempts: u32, captions: Vec<String>) -> Self {
        Self {
            attempts,
            outcome: AttemptOutcome::Captioned(captions),
        }
    }

    pub fn failed(attempts: u32, failure: DispatchFailure) -> Self {
        Self {
            attempts,
            outcome: AttemptOutcome::Failed(failure),
        }
    }

    pub fn cancelled(attempts: u32) -> Self {
        Self {
            attempts,
            outcome: AttemptOutcome::Cancelled,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self.outcome, AttemptOutcome::Captioned(_))
    }

    pub fn failure(&self) -> Option<&DispatchFailure> {
        match &self.outcome {
            AttemptOutcome::Failed(f) => Some(f),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_taxonomy() {
        assert!(FailureKind::RateLimited.is_transient());
        assert!(FailureKind::MalformedResponse.is_transient());
        assert!(!FailureKind::PayloadTooLarge.is_transient());
        assert!(!FailureKind::Auth.is_transient());
        assert!(FailureKind::Auth.is_fatal());
        assert!(!FailureKind::InvalidRequest.is_fatal());
    }

    #[test]
    fn test_kind_display_is_snake_case() {
        assert_eq!(FailureKind::ServerError.to_string(), "server_error");
        let name: &'static str = FailureKind::PayloadTooLarge.into();
        assert_eq!(name, "payload_too_large");
    }
}
