//! Error types shared by the core components.

use thiserror::Error;

use crate::state::Phase;

/// Configuration errors. Fatal at construction time.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Reverse mode was requested without an upstream target.
    #[error("reverse mode requires a target")]
    MissingTarget,

    /// Port is not a number in `[0, 65535]`.
    #[error("invalid port: {0}")]
    InvalidPort(String),

    /// Direction is neither `forward` nor `reverse`.
    #[error("invalid direction: {0} (expected forward or reverse)")]
    InvalidDirection(String),

    /// Target is not an absolute URL with a hostname.
    #[error("invalid target: {0}")]
    InvalidTarget(String),

    /// A boolean setting could not be parsed.
    #[error("invalid value for {name}: {value}")]
    InvalidFlag {
        /// Setting name.
        name: &'static str,
        /// Offending value.
        value: String,
    },

    /// An allow/deny pattern failed to compile.
    #[error("invalid pattern {pattern:?}: {source}")]
    InvalidPattern {
        /// The pattern as configured.
        pattern: String,
        /// Underlying regex error.
        #[source]
        source: regex::Error,
    },

    /// Allow/deny list file could not be read.
    #[error("failed to read lists file: {0}")]
    Io(#[from] std::io::Error),

    /// Allow/deny list file is not valid JSON.
    #[error("failed to parse lists file: {0}")]
    Json(#[from] serde_json::Error),
}

/// Target resolution failures. These become client-facing 400 responses.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TargetError {
    /// The request path carried no target at all.
    #[error("target is required")]
    Required,

    /// A target was given but no hostname could be determined from it.
    #[error("invalid target (no hostname): {0}")]
    NoHostname(String),

    /// The target names a scheme the proxy cannot fetch.
    #[error("unsupported target scheme: {0}")]
    UnsupportedScheme(String),

    /// The resolved target cannot be used as a request URI.
    #[error("invalid target: {0}")]
    Invalid(String),
}

/// Lifecycle misuse, e.g. starting a server that is already started.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("cannot {operation} server while it is {phase}")]
pub struct LifecycleError {
    /// The attempted operation (`start` or `stop`).
    pub operation: &'static str,
    /// Phase the server was in when the operation was attempted.
    pub phase: Phase,
}

/// Loader URL formatting and parsing errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LoaderUrlError {
    /// No site id was supplied.
    #[error("site id is required")]
    MissingSiteId,

    /// The URL does not have the loader shape.
    #[error("not a loader URL: {0}")]
    Unrecognized(String),
}
