//! Error types for the proxy.

use std::time::Duration;

use ferry_core::{ConfigError, LifecycleError, TargetError};
use thiserror::Error;

/// Proxy error type.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// Invalid configuration.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Lifecycle misuse.
    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),

    /// The inbound request did not name a usable target.
    #[error("{0}")]
    Target(#[from] TargetError),

    /// Upstream could not be reached or its body could not be read.
    #[error("Upstream error: {0}")]
    Upstream(String),

    /// Upstream used a `Content-Encoding` we cannot decode.
    #[error("Unsupported content encoding: {0}")]
    UnknownEncoding(String),

    /// Upstream body did not arrive in time.
    #[error("Timed out after {0:?} waiting for the upstream body")]
    BodyTimeout(Duration),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Proxy engine error.
    #[error("Proxy error: {0}")]
    Engine(String),

    /// Certificate authority could not be created.
    #[error("CA error: {0}")]
    Ca(String),
}

/// Result type for proxy operations.
pub type Result<T> = std::result::Result<T, ProxyError>;
