//! Error types shared by every stage of the crawl.
//!
//! `SpiderError` follows the crawl's failure taxonomy: transport and protocol
//! failures are retryable, `PermanentRejection` ends a request's life without
//! stopping the crawl, `ConfigurationError` is fatal before the engine starts.

use std::fmt;
use thiserror::Error;

/// How a transport-level failure happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportErrorKind {
    /// The per-request download timeout elapsed.
    Timeout,
    /// Connection refused, reset or DNS resolution failure.
    Connect,
    /// Any other failure while sending the request.
    Other,
}

impl fmt::Display for TransportErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TransportErrorKind::Timeout => "timeout",
            TransportErrorKind::Connect => "connect",
            TransportErrorKind::Other => "transport",
        };
        f.write_str(s)
    }
}

/// Errors raised by item pipelines.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("pipeline I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("item serialization failed: {0}")]
    Serialization(String),
    #[error("invalid item: {0}")]
    Item(String),
}

impl From<serde_json::Error> for PipelineError {
    fn from(err: serde_json::Error) -> Self {
        PipelineError::Serialization(err.to_string())
    }
}

/// The main error type of the crawler.
#[derive(Debug, Error)]
pub enum SpiderError {
    #[error("{kind} error for {url}: {message}")]
    Transport {
        url: String,
        kind: TransportErrorKind,
        message: String,
    },

    #[error("protocol error for {url}: {message}")]
    Protocol { url: String, message: String },

    #[error("permanently rejected {url}: {reason}")]
    PermanentRejection { url: String, reason: String },

    #[error("configuration error: {0}")]
    ConfigurationError(String),

    #[error("middleware '{middleware}' failed: {message}")]
    Middleware { middleware: String, message: String },

    #[error("corrupted crawl state: {0}")]
    CorruptedState(String),

    #[error("{0}")]
    GeneralError(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid URL: {0}")]
    UrlParse(#[from] url::ParseError),

    #[error(transparent)]
    Pipeline(#[from] PipelineError),
}

impl SpiderError {
    /// Builds a timeout failure for `url`.
    pub fn timeout(url: impl Into<String>, message: impl Into<String>) -> Self {
        SpiderError::Transport {
            url: url.into(),
            kind: TransportErrorKind::Timeout,
            message: message.into(),
        }
    }

    /// Transport and protocol failures may succeed when attempted again.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SpiderError::Transport { .. } | SpiderError::Protocol { .. }
        )
    }

    pub fn is_permanent_rejection(&self) -> bool {
        matches!(self, SpiderError::PermanentRejection { .. })
    }

    /// Errors that mean shared crawl state can no longer be trusted.
    pub fn is_fatal(&self) -> bool {
        matches!(self, SpiderError::CorruptedState(_))
    }

    /// Short machine-friendly label, used as a stats key.
    pub fn label(&self) -> &'static str {
        match self {
            SpiderError::Transport { kind, .. } => match kind {
                TransportErrorKind::Timeout => "transport/timeout",
                TransportErrorKind::Connect => "transport/connect",
                TransportErrorKind::Other => "transport/other",
            },
            SpiderError::Protocol { .. } => "protocol",
            SpiderError::PermanentRejection { .. } => "permanent_rejection",
            SpiderError::ConfigurationError(_) => "configuration",
            SpiderError::Middleware { .. } => "middleware",
            SpiderError::CorruptedState(_) => "corrupted_state",
            SpiderError::GeneralError(_) => "general",
            SpiderError::Io(_) => "io",
            SpiderError::Json(_) => "json",
            SpiderError::UrlParse(_) => "url",
            SpiderError::Pipeline(_) => "pipeline",
        }
    }
}
