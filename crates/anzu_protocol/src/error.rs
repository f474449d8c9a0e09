//! Error taxonomy shared by every crate.
//!
//! Errors are classified by *kind*, not by type: the retry manager, the
//! circuit breaker and the operator surface all branch on `ErrorKind`
//! while each crate keeps its own concrete error enum.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Classification of a failure, driving retry and surfacing policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Network timeout, 5xx, queue-busy, stuck-job. Retried by the adapter
    /// layer.
    Transient,
    /// Insufficient VRAM/disk, rate-limited, circuit open. One mitigation
    /// attempt allowed, then surfaced.
    ResourceExhausted,
    /// Bad input. Never retried.
    Validation,
    /// Missing expected output, checksum mismatch. Recorded and skipped.
    Integrity,
    /// Lost DB, poisoned worker. Logged with full context; the tick loop
    /// keeps running.
    Catastrophic,
}

impl ErrorKind {
    /// Whether the retry manager may re-attempt a call that failed this way.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorKind::Transient | ErrorKind::ResourceExhausted)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Transient => "transient",
            ErrorKind::ResourceExhausted => "resource_exhausted",
            ErrorKind::Validation => "validation",
            ErrorKind::Integrity => "integrity",
            ErrorKind::Catastrophic => "catastrophic",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Structured error object returned over the operator surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorEnvelope {
    pub error_kind: ErrorKind,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
}

impl ErrorEnvelope {
    pub fn new(error_kind: ErrorKind, message: impl Into<String>) -> Self {
        ErrorEnvelope {
            error_kind,
            message: message.into(),
            correlation_id: None,
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, message)
    }

    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }
}

impl fmt::Display for ErrorEnvelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.error_kind, self.message)
    }
}

impl std::error::Error for ErrorEnvelope {}

/// Truncate an error string for persistence into `blocked_reason`.
pub fn truncate_reason(reason: &str, max_len: usize) -> String {
    if reason.len() <= max_len {
        return reason.to_string();
    }
    let mut end = max_len;
    while !reason.is_char_boundary(end) {
        end -= 1;
    }
    reason[..end].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_kinds() {
        assert!(ErrorKind::Transient.is_retryable());
        assert!(ErrorKind::ResourceExhausted.is_retryable());
        assert!(!ErrorKind::Validation.is_retryable());
        assert!(!ErrorKind::Integrity.is_retryable());
        assert!(!ErrorKind::Catastrophic.is_retryable());
    }

    #[test]
    fn test_envelope_serialization() {
        let env = ErrorEnvelope::validation("unknown character slug: bowser");
        let json = serde_json::to_value(&env).unwrap();
        assert_eq!(json["error_kind"], "validation");
        assert!(json.get("correlation_id").is_none());

        let env = env.with_correlation_id("abc-123");
        let json = serde_json::to_value(&env).unwrap();
        assert_eq!(json["correlation_id"], "abc-123");
    }

    #[test]
    fn test_truncate_reason_respects_char_boundaries() {
        assert_eq!(truncate_reason("short", 500), "short");
        let truncated = truncate_reason("日本語テキスト", 7);
        assert!(truncated.len() <= 7);
        assert!("日本語テキスト".starts_with(&truncated));
    }
}
