//! Runtime server state.
//!
//! [`ServerState`] layers the lifecycle [`Phase`] and the effective port on top
//! of an immutable [`ServerConfig`]. All URL-shaped values (`origin`, `base`,
//! `url`, ...) are computed from the current hostname and port on every call,
//! so they can never drift out of sync.
//!
//! ## Phases
//!
//! ```text
//! STOPPED ──► STARTING ──► STARTED ──► STOPPING ──► STOPPED
//!                 │                        ▲
//!                 └────────────────────────┘   (stop after a failed start)
//! ```

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::config::ServerConfig;
use crate::error::{ConfigError, LifecycleError};

/// Lifecycle phase. Exactly one is active at any time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum Phase {
    #[default]
    Stopped,
    Starting,
    Started,
    Stopping,
}

impl Phase {
    /// Returns the phase as a string.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stopped => "STOPPED",
            Self::Starting => "STARTING",
            Self::Started => "STARTED",
            Self::Stopping => "STOPPING",
        }
    }

    /// Returns true if `self → to` is a legal transition.
    pub fn can_transition(&self, to: Phase) -> bool {
        matches!(
            (self, to),
            (Self::Stopped, Self::Starting)
                | (Self::Starting, Self::Started)
                | (Self::Starting, Self::Stopping)
                | (Self::Started, Self::Stopping)
                | (Self::Stopping, Self::Stopped)
        )
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Config plus mutable runtime fields.
///
/// There are no setters: the phase moves only through [`ServerState::transition`]
/// and the port only through [`ServerState::record_port`], both driven by the
/// lifecycle controller.
#[derive(Debug, Clone)]
pub struct ServerState {
    config: Arc<ServerConfig>,
    phase: Phase,
    port: u16,
}

impl ServerState {
    /// Creates a stopped state for a validated config.
    pub fn new(config: ServerConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let port = config.port;
        Ok(Self {
            config: Arc::new(config),
            phase: Phase::Stopped,
            port,
        })
    }

    /// Returns the config.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Returns the current phase.
    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Returns the effective port (the OS-assigned one once started on port 0).
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Moves to `to`, returning the previous phase.
    ///
    /// Illegal transitions fail with the operation implied by `to` and leave
    /// the phase untouched.
    pub fn transition(&mut self, to: Phase) -> Result<Phase, LifecycleError> {
        if !self.phase.can_transition(to) {
            let operation = match to {
                Phase::Starting | Phase::Started => "start",
                Phase::Stopping | Phase::Stopped => "stop",
            };
            return Err(LifecycleError {
                operation,
                phase: self.phase,
            });
        }
        let from = self.phase;
        self.phase = to;
        Ok(from)
    }

    /// Records the port actually bound. Only an automatic (`0`) port is replaced.
    pub fn record_port(&mut self, bound: u16) {
        if self.config.port == 0 {
            self.port = bound;
        }
    }

    /// URL scheme the proxy is served on.
    pub fn scheme(&self) -> &'static str {
        "http"
    }

    /// `hostname[:port]`, omitting the scheme's default port.
    pub fn host(&self) -> String {
        let hostname = &self.config.hostname;
        let hostname = if hostname.contains(':') && !hostname.starts_with('[') {
            format!("[{hostname}]")
        } else {
            hostname.clone()
        };
        if self.port == 80 {
            hostname
        } else {
            format!("{}:{}", hostname, self.port)
        }
    }

    /// `scheme://host`.
    pub fn origin(&self) -> String {
        format!("{}://{}", self.scheme(), self.host())
    }

    /// Origin plus context path.
    pub fn base(&self) -> String {
        format!("{}{}", self.origin(), self.config.context_path)
    }

    /// Path prefix under which targets are embedded, e.g. `/page/`.
    pub fn path(&self) -> String {
        let page = self.config.route.page.trim_matches('/');
        if page.is_empty() {
            self.config.context_path.clone()
        } else {
            format!("{}{}/", self.config.context_path, page)
        }
    }

    /// Absolute prefix under which targets are embedded.
    pub fn url(&self) -> String {
        format!("{}{}", self.origin(), self.path())
    }

    /// Path of the status endpoint.
    pub fn status_path(&self) -> String {
        format!(
            "{}{}",
            self.config.context_path,
            self.config.route.status.trim_matches('/')
        )
    }

    /// Returns true if `path` (query ignored) addresses the status endpoint.
    pub fn is_status_path(&self, path: &str) -> bool {
        let path = path.split('?').next().unwrap_or(path);
        let status = self.status_path();
        path == status || path.strip_suffix('/') == Some(status.as_str())
    }

    /// Root-relative proxied form of `target`.
    pub fn proxied_path(&self, target: &Url) -> String {
        format!("{}{}", self.path(), target.as_str())
    }

    /// Absolute proxied form of `target`.
    pub fn proxied_url(&self, target: &Url) -> String {
        format!("{}{}", self.url(), target.as_str())
    }

    /// Returns the raw target embedded in a proxy path, or `None` when the
    /// path lies outside the context path.
    ///
    /// The context path is stripped first, then an optional page segment.
    pub fn embedded_target<'a>(&self, path: &'a str) -> Option<&'a str> {
        let context = self.config.context_path.as_str();
        let rest = match path.strip_prefix(context) {
            Some(rest) => rest,
            None if path == context.trim_end_matches('/') => "",
            None => return None,
        };

        let page = self.config.route.page.trim_matches('/');
        if !page.is_empty() {
            if let Some(after) = rest.strip_prefix(page) {
                if after.is_empty() || after.starts_with('?') {
                    return Some("");
                }
                if let Some(target) = after.strip_prefix('/') {
                    return Some(target);
                }
            }
        }
        Some(rest)
    }
}
