//! Error taxonomy.
//!
//! Each error kind has a fixed blast radius:
//! - `StreamError`: one camera; triggers backoff, never leaves the supervisor.
//! - `ModelError`: one frame; the frame yields no candidates.
//! - `PersistenceError`: one event; logged, the pipeline keeps going.
//! - `ConfigurationError`: fatal at startup, rejected at runtime.

use std::time::Duration;

use thiserror::Error;

/// Failures on a camera's network session.
#[derive(Debug, Error)]
pub enum StreamError {
    #[error("connection error: {0}")]
    Connection(String),
    #[error("stream stalled: no frame within {0:?}")]
    StallTimeout(Duration),
    #[error("stream ended")]
    EndOfStream,
}

impl StreamError {
    pub fn connection(err: impl std::fmt::Display) -> Self {
        Self::Connection(err.to_string())
    }

    /// Short label used in transition logs and status.
    pub fn reason(&self) -> &'static str {
        match self {
            Self::Connection(_) => "connection error",
            Self::StallTimeout(_) => "stall",
            Self::EndOfStream => "end of stream",
        }
    }
}

impl From<anyhow::Error> for StreamError {
    fn from(err: anyhow::Error) -> Self {
        Self::Connection(format!("{:#}", err))
    }
}

/// An opaque model (detector, embedder, liveness) failed on a frame or crop.
#[derive(Debug, Error)]
#[error("{stage} model failed: {message}")]
pub struct ModelError {
    pub stage: &'static str,
    pub message: String,
}

impl ModelError {
    pub fn new(stage: &'static str, message: impl std::fmt::Display) -> Self {
        Self {
            stage,
            message: message.to_string(),
        }
    }
}

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("event store write failed: {0:#}")]
    Store(anyhow::Error),
    #[error("snapshot write failed: {0:#}")]
    Snapshot(anyhow::Error),
}

#[derive(Debug, Error)]
#[error("invalid configuration: {0}")]
pub struct ConfigurationError(pub String);

impl ConfigurationError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

#[derive(Debug, Error)]
pub enum GatewatchError {
    #[error(transparent)]
    Stream(#[from] StreamError),
    #[error(transparent)]
    Model(#[from] ModelError),
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
