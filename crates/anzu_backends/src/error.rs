//! Adapter error type, classified into the shared taxonomy.

use thiserror::Error;

use anzu_protocol::ErrorKind;

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("{service} circuit breaker is open")]
    CircuitOpen { service: String },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("{service} returned status {code}: {body}")]
    Status {
        service: String,
        code: u16,
        body: String,
    },

    #[error("request deadline of {seconds}s exceeded")]
    DeadlineExceeded { seconds: u64 },

    #[error("job {job_id} made no progress for {stalled_secs}s, declared stuck")]
    StuckJob { job_id: String, stalled_secs: u64 },

    #[error("job {job_id} completed but produced no output files")]
    MissingOutput { job_id: String },

    #[error("backend busy: {0}")]
    Busy(String),

    #[error("insufficient VRAM: {free_mb}MB free, need {needed_mb}MB")]
    InsufficientVram { free_mb: i64, needed_mb: i64 },

    #[error("invalid request: {0}")]
    Validation(String),

    #[error("unparseable response: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Io(#[from] std::io::Error),
}

impl BackendError {
    /// Classification used by the retry manager and the operator surface.
    pub fn kind(&self) -> ErrorKind {
        match self {
            BackendError::CircuitOpen { .. } => ErrorKind::ResourceExhausted,
            BackendError::Busy(_) | BackendError::InsufficientVram { .. } => {
                ErrorKind::ResourceExhausted
            }
            BackendError::Http(e) => {
                if e.is_timeout() || e.is_connect() || e.is_request() {
                    ErrorKind::Transient
                } else {
                    ErrorKind::Catastrophic
                }
            }
            BackendError::Status { code, .. } => match code {
                429 => ErrorKind::ResourceExhausted,
                500..=599 => ErrorKind::Transient,
                _ => ErrorKind::Validation,
            },
            BackendError::DeadlineExceeded { .. } => ErrorKind::Transient,
            BackendError::StuckJob { .. } | BackendError::MissingOutput { .. } => {
                ErrorKind::Integrity
            }
            BackendError::Validation(_) => ErrorKind::Validation,
            BackendError::Json(_) => ErrorKind::Validation,
            BackendError::Io(_) => ErrorKind::Integrity,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind().is_retryable()
    }
}

pub type BackendResult<T> = Result<T, BackendError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        let err = BackendError::Status {
            service: "image".into(),
            code: 503,
            body: String::new(),
        };
        assert_eq!(err.kind(), ErrorKind::Transient);

        let err = BackendError::Status {
            service: "image".into(),
            code: 429,
            body: String::new(),
        };
        assert_eq!(err.kind(), ErrorKind::ResourceExhausted);

        let err = BackendError::Status {
            service: "image".into(),
            code: 400,
            body: String::new(),
        };
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_integrity_errors_not_retryable() {
        let err = BackendError::StuckJob {
            job_id: "abc".into(),
            stalled_secs: 300,
        };
        assert_eq!(err.kind(), ErrorKind::Integrity);
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_circuit_open_is_resource_exhaustion() {
        let err = BackendError::CircuitOpen {
            service: "image".into(),
        };
        assert_eq!(err.kind(), ErrorKind::ResourceExhausted);
    }
}
