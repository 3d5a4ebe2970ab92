//! Typed error kinds for the execution core, plus the conversion into the
//! outcome-JSON contract that host callers actually see.

use serde::Serialize;
use thiserror::Error;

/// Error kinds surfaced by the execution core.
///
/// These are kinds, not a hierarchy of engine internals: callers match on
/// `ExecError` to decide retry/backoff policy without parsing message text.
#[derive(Debug, Error)]
pub enum ExecError {
    #[error("engine pool exhausted")]
    PoolExhausted,

    #[error("compile error: {message}")]
    Compile { message: String },

    #[error("evaluation error: {message}")]
    Eval { message: String, stack: String },

    #[error("promise rejected: {message}")]
    PromiseRejection { message: String, stack: String },

    #[error("execution interrupted or timed out")]
    Interrupted,

    #[error("host call rejected: {message}")]
    HostCallRejected { message: String },

    #[error("failed to parse JSON: {0}")]
    JsonParse(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ExecError {
    fn code(&self) -> &'static str {
        match self {
            ExecError::PoolExhausted => "ENGINE_POOL_EXHAUSTED",
            _ => "EXECUTION_ERROR",
        }
    }

    fn message(&self) -> String {
        match self {
            ExecError::PoolExhausted => String::new(),
            ExecError::Compile { message } => message.clone(),
            ExecError::Eval { message, .. } => message.clone(),
            ExecError::PromiseRejection { message, .. } => message.clone(),
            ExecError::Interrupted => "execution was interrupted or timed out".to_string(),
            ExecError::HostCallRejected { message } => message.clone(),
            ExecError::JsonParse(message) => message.clone(),
            ExecError::Internal(message) => message.clone(),
        }
    }

    fn stack(&self) -> String {
        match self {
            ExecError::Eval { stack, .. } | ExecError::PromiseRejection { stack, .. } => {
                stack.clone()
            }
            _ => String::new(),
        }
    }
}

/// The outcome-JSON contract: success carries a result value, failure
/// carries a stable error code plus human-readable detail.
#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum Outcome {
    Success {
        success: bool,
        result: serde_json::Value,
    },
    PoolExhausted {
        success: bool,
        error: &'static str,
    },
    Failure {
        success: bool,
        error: &'static str,
        message: String,
        stack: String,
    },
}

impl Outcome {
    pub fn success(result: serde_json::Value) -> Self {
        Outcome::Success {
            success: true,
            result,
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            r#"{"success":false,"error":"INTERNAL_ERROR","message":"failed to serialize outcome"}"#
                .to_string()
        })
    }
}

impl From<ExecError> for Outcome {
    fn from(err: ExecError) -> Self {
        if matches!(err, ExecError::PoolExhausted) {
            return Outcome::PoolExhausted {
                success: false,
                error: err.code(),
            };
        }
        Outcome::Failure {
            success: false,
            error: err.code(),
            message: err.message(),
            stack: err.stack(),
        }
    }
}
