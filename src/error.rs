//! Error taxonomy shared across components
//!
//! Component boundaries convert failures into these kinds; the tool surface
//! serializes them as `{success: false, error, error_kind}` and never throws
//! across the protocol.

use thiserror::Error;

/// Structured error kinds for the whole system
#[derive(Debug, Error)]
pub enum EaselError {
    /// Missing or malformed required configuration. Never retried.
    #[error("configuration error: {0}")]
    Config(String),

    /// Network/HTTP failure reaching an external service.
    #[error("{component}: transport error: {message}")]
    Transport {
        component: &'static str,
        message: String,
    },

    /// The external service returned a structured failure.
    #[error("{component}: upstream error: {message}")]
    Upstream {
        component: &'static str,
        message: String,
    },

    /// Operation exceeded its per-call budget. Terminal for jobs.
    #[error("{component}: timed out after {seconds}s")]
    Timeout {
        component: &'static str,
        seconds: u64,
    },

    /// Bad inputs to a tool. Surfaced without side effects.
    #[error("invalid input: {0}")]
    Validation(String),

    /// A LoRA combination violates a rule.
    #[error("conflict: {0}")]
    Conflict(String),

    /// User is suspended, timed out, or rate limited.
    #[error("{0}")]
    Policy(String),

    /// Job id, personality name, or category path not present.
    #[error("not found: {0}")]
    NotFound(String),

    /// Anything else. Logged with context, surfaced generically.
    #[error("internal error: {0}")]
    Internal(String),
}

impl EaselError {
    /// Machine-readable kind for tool results
    pub fn kind(&self) -> &'static str {
        match self {
            EaselError::Config(_) => "configuration",
            EaselError::Transport { .. } => "transport",
            EaselError::Upstream { .. } => "upstream",
            EaselError::Timeout { .. } => "timeout",
            EaselError::Validation(_) => "validation",
            EaselError::Conflict(_) => "conflict",
            EaselError::Policy(_) => "policy",
            EaselError::NotFound(_) => "not_found",
            EaselError::Internal(_) => "internal",
        }
    }
}

impl From<rusqlite::Error> for EaselError {
    fn from(e: rusqlite::Error) -> Self {
        EaselError::Internal(format!("sqlite: {}", e))
    }
}

impl From<serde_json::Error> for EaselError {
    fn from(e: serde_json::Error) -> Self {
        EaselError::Internal(format!("json: {}", e))
    }
}

impl From<std::io::Error> for EaselError {
    fn from(e: std::io::Error) -> Self {
        EaselError::Internal(format!("io: {}", e))
    }
}

pub type Result<T, E = EaselError> = std::result::Result<T, E>;

/// Map a reqwest failure to transport/timeout for a named component
pub fn transport_error(component: &'static str, e: reqwest::Error) -> EaselError {
    if e.is_timeout() {
        EaselError::Timeout {
            component,
            seconds: 0,
        }
    } else {
        EaselError::Transport {
            component,
            message: e.to_string(),
        }
    }
}
