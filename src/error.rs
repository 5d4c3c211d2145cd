use std::time::Duration;

use thiserror::Error;

use crate::action::TargetRef;

/// Failures raised by a model backend or by the routing layer in front of it.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ProviderError {
    #[error("no API key configured for {provider}")]
    AuthMissing { provider: String },
    #[error("authentication rejected: {0}")]
    Unauthorized(String),
    #[error("rate limited by provider")]
    RateLimited { retry_after: Option<Duration> },
    #[error("network error: {0}")]
    Network(String),
    #[error("malformed provider response: {0}")]
    InvalidResponse(String),
    #[error("provider API error {status}: {message}")]
    Api { status: u16, message: String },
    #[error("unsupported model: {0}")]
    Unsupported(String),
}

impl ProviderError {
    /// Map a non-success HTTP status and body into the taxonomy.
    /// `retry_after` is only kept for 429 responses.
    pub fn from_status(status: u16, message: impl Into<String>, retry_after: Option<Duration>) -> Self {
        let message = message.into();
        match status {
            401 | 403 => ProviderError::Unauthorized(message),
            429 => ProviderError::RateLimited { retry_after },
            _ => ProviderError::Api { status, message },
        }
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            ProviderError::InvalidResponse(err.to_string())
        } else {
            ProviderError::Network(err.to_string())
        }
    }
}

/// Why a model reply could not be turned into a [`crate::action::ModelTurn`].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("response is not valid JSON")]
    InvalidJson,
    #[error("response JSON is not an object")]
    NotAnObject,
    #[error("thought not found in the model response")]
    MissingThought,
    #[error("action not found in the model response")]
    MissingAction,
    #[error("invalid action: \"{0}\" is not a valid action")]
    InvalidAction(String),
    #[error("malformed action call: {0}")]
    MalformedCall(String),
    #[error("{action} expects {expected} argument(s), got {found}")]
    ArityMismatch {
        action: String,
        expected: usize,
        found: usize,
    },
    #[error("{action} is missing argument `{arg}`")]
    MissingArgument { action: String, arg: String },
    #[error("{action} does not accept argument `{arg}`")]
    UnexpectedArgument { action: String, arg: String },
    #[error("{action}: argument `{arg}` {reason}")]
    InvalidArgument {
        action: String,
        arg: String,
        reason: String,
    },
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("{method} timed out after {}ms", .after.as_millis())]
    Timeout { method: String, after: Duration },
    #[error("payload injection failed: {0}")]
    Injection(String),
    #[error("execution context never confirmed the handshake")]
    Handshake,
    #[error("execution context error: {0}")]
    Context(String),
    #[error("{method} failed after {attempts} attempt(s): {last}")]
    Exhausted {
        method: String,
        attempts: usize,
        last: Box<TransportError>,
    },
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ResolutionError {
    #[error("no live element matches target {0}")]
    NotFound(TargetRef),
}

/// Failure of a single executed action. Never fatal to the surrounding task.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ActionError {
    #[error(transparent)]
    Resolution(#[from] ResolutionError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("page driver error: {0}")]
    Driver(String),
    #[error("element for {0} has no layout box")]
    NoLayout(TargetRef),
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum AgentError {
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error("{message}")]
    AttemptsExhausted { attempts: usize, message: String },
    #[error("cancelled")]
    Cancelled,
    #[error("page snapshot failed: {0}")]
    Snapshot(String),
}
