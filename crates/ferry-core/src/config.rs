//! Server configuration.
//!
//! A [`ServerConfig`] is built once, before the server listens, by merging
//! [`ConfigOverrides`] layers with precedence *explicit override > per-call
//! default > static default*. After construction it is only ever shared
//! behind an `Arc` and never mutated.

use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::eligibility::AllowDenyEntry;
use crate::error::ConfigError;
use crate::loader::LoaderScript;
use crate::target::assume_http;

/// Default hostname the proxy listens on.
pub const DEFAULT_HOSTNAME: &str = "localhost";

/// Default port the proxy listens on.
pub const DEFAULT_PORT: u16 = 8000;

/// Default mount prefix for proxy routes.
pub const DEFAULT_CONTEXT_PATH: &str = "/";

/// Upper bound on buffering a response body for inspection.
pub const DEFAULT_BODY_TIMEOUT: Duration = Duration::from_secs(30);

/// Origins the CSP patcher grants to the vendor by default.
pub const DEFAULT_VENDOR_ORIGINS: &[&str] = &[
    "https://js.sitecues.com",
    "https://up.sitecues.com",
    "https://ws.sitecues.com",
];

/// Proxy direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Blanket relay for client-chosen targets.
    #[default]
    Forward,

    /// Impersonates a single origin; targets are encoded in request paths.
    Reverse,
}

impl Direction {
    /// Returns the direction as a string.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Forward => "forward",
            Self::Reverse => "reverse",
        }
    }

    /// Returns true for reverse mode.
    pub fn is_reverse(&self) -> bool {
        matches!(self, Self::Reverse)
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Direction {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "forward" => Ok(Self::Forward),
            "reverse" => Ok(Self::Reverse),
            _ => Err(ConfigError::InvalidDirection(s.to_string())),
        }
    }
}

/// Sub-paths mounted under the context path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Route {
    /// Status endpoint segment.
    pub status: String,
    /// Page segment that may precede an embedded target.
    pub page: String,
}

impl Default for Route {
    fn default() -> Self {
        Self {
            status: "status".to_string(),
            page: "page".to_string(),
        }
    }
}

/// One layer of optional, unvalidated settings.
///
/// Values are kept as strings so that every layer, whether it came from the
/// command line or the environment, is validated by the same code.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigOverrides {
    pub direction: Option<String>,
    pub hostname: Option<String>,
    pub port: Option<String>,
    pub target: Option<String>,
    pub context_path: Option<String>,
    pub proxy_links: Option<String>,
}

/// Environment variable names per setting, most specific first.
const ENV_NAMES: [(&str, [&str; 3]); 6] = [
    ("direction", ["FERRY_DIRECTION", "PROXY_DIRECTION", "DIRECTION"]),
    ("hostname", ["FERRY_HOSTNAME", "PROXY_HOSTNAME", "HOST"]),
    ("port", ["FERRY_PORT", "PROXY_PORT", "PORT"]),
    ("target", ["FERRY_TARGET", "PROXY_TARGET", "TARGET"]),
    (
        "context_path",
        ["FERRY_CONTEXT_PATH", "PROXY_CONTEXT_PATH", "CONTEXT_PATH"],
    ),
    (
        "proxy_links",
        ["FERRY_PROXY_LINKS", "PROXY_PROXY_LINKS", "PROXY_LINKS"],
    ),
];

impl ConfigOverrides {
    /// Reads settings from the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Reads settings through `lookup`, trying each setting's variable names
    /// in order and taking the first non-empty value.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let find = |setting: &str| -> Option<String> {
            let (_, names) = ENV_NAMES.iter().find(|(key, _)| *key == setting)?;
            names
                .iter()
                .filter_map(|name| lookup(name))
                .find(|value| !value.trim().is_empty())
        };

        Self {
            direction: find("direction"),
            hostname: find("hostname"),
            port: find("port"),
            target: find("target"),
            context_path: find("context_path"),
            proxy_links: find("proxy_links"),
        }
    }

    /// Fills every unset field from `fallback`.
    pub fn or(self, fallback: &ConfigOverrides) -> Self {
        Self {
            direction: self.direction.or_else(|| fallback.direction.clone()),
            hostname: self.hostname.or_else(|| fallback.hostname.clone()),
            port: self.port.or_else(|| fallback.port.clone()),
            target: self.target.or_else(|| fallback.target.clone()),
            context_path: self.context_path.or_else(|| fallback.context_path.clone()),
            proxy_links: self.proxy_links.or_else(|| fallback.proxy_links.clone()),
        }
    }
}

/// Whitelist and blacklist as stored in a lists file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AccessLists {
    #[serde(default)]
    pub whitelist: Vec<AllowDenyEntry>,
    #[serde(default)]
    pub blacklist: Vec<AllowDenyEntry>,
}

impl AccessLists {
    /// Loads lists from a JSON file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }
}

/// Validated, immutable server settings.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Forward or reverse.
    pub direction: Direction,
    /// Hostname to listen on and to advertise in rewritten URLs.
    pub hostname: String,
    /// Configured port; `0` lets the OS choose.
    pub port: u16,
    /// Upstream origin. Always set in reverse mode.
    pub target: Option<Url>,
    /// Mount prefix; begins and ends with `/`.
    pub context_path: String,
    /// Status and page sub-paths.
    pub route: Route,
    /// Rewrite page links so that navigation stays inside the proxy.
    pub proxy_links: bool,
    /// Entries that are logged when matched.
    pub whitelist: Vec<AllowDenyEntry>,
    /// Entries that make a target ineligible for rewriting.
    pub blacklist: Vec<AllowDenyEntry>,
    /// Loader script injected into HTML pages.
    pub loader: Option<LoaderScript>,
    /// Origins appended to CSP source lists alongside the proxy origin.
    pub vendor_origins: Vec<String>,
    /// Time allowed for buffering a response body.
    pub body_timeout: Duration,
}

impl ServerConfig {
    /// Builds a config from `explicit` settings, falling back to `defaults`
    /// and then to the static defaults of this module.
    pub fn resolve(
        explicit: &ConfigOverrides,
        defaults: &ConfigOverrides,
    ) -> Result<Self, ConfigError> {
        let merged = explicit.clone().or(defaults);

        let direction = match merged.direction.as_deref() {
            Some(raw) => raw.parse()?,
            None => Direction::default(),
        };

        let hostname = merged
            .hostname
            .map(|h| h.trim().to_string())
            .filter(|h| !h.is_empty())
            .unwrap_or_else(|| DEFAULT_HOSTNAME.to_string());

        let port = match merged.port.as_deref() {
            Some(raw) => parse_port(raw)?,
            None => DEFAULT_PORT,
        };

        let target = match merged.target.as_deref().map(str::trim) {
            Some(raw) if !raw.is_empty() => Some(parse_target(raw)?),
            _ => None,
        };

        let context_path =
            normalize_context_path(merged.context_path.as_deref().unwrap_or(DEFAULT_CONTEXT_PATH));

        let proxy_links = match merged.proxy_links.as_deref() {
            Some(raw) => parse_flag("proxy_links", raw)?,
            None => false,
        };

        let config = Self {
            direction,
            hostname,
            port,
            target,
            context_path,
            route: Route::default(),
            proxy_links,
            whitelist: Vec::new(),
            blacklist: Vec::new(),
            loader: None,
            vendor_origins: DEFAULT_VENDOR_ORIGINS.iter().map(|o| o.to_string()).collect(),
            body_timeout: DEFAULT_BODY_TIMEOUT,
        };
        config.validate()?;
        Ok(config)
    }

    /// A forward proxy with static defaults.
    pub fn forward() -> Self {
        Self {
            direction: Direction::Forward,
            hostname: DEFAULT_HOSTNAME.to_string(),
            port: DEFAULT_PORT,
            target: None,
            context_path: DEFAULT_CONTEXT_PATH.to_string(),
            route: Route::default(),
            proxy_links: false,
            whitelist: Vec::new(),
            blacklist: Vec::new(),
            loader: None,
            vendor_origins: DEFAULT_VENDOR_ORIGINS.iter().map(|o| o.to_string()).collect(),
            body_timeout: DEFAULT_BODY_TIMEOUT,
        }
    }

    /// A reverse proxy for `target` with static defaults.
    pub fn reverse(target: &str) -> Result<Self, ConfigError> {
        let explicit = ConfigOverrides {
            direction: Some("reverse".to_string()),
            target: Some(target.to_string()),
            ..Default::default()
        };
        Self::resolve(&explicit, &ConfigOverrides::default())
    }

    /// Checks cross-field invariants.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.direction.is_reverse() && self.target.is_none() {
            return Err(ConfigError::MissingTarget);
        }
        Ok(())
    }

    /// Sets the listen port.
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Sets the listen hostname.
    pub fn with_hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = hostname.into();
        self
    }

    /// Sets the context path, normalizing its slashes.
    pub fn with_context_path(mut self, context_path: &str) -> Self {
        self.context_path = normalize_context_path(context_path);
        self
    }

    /// Sets the status and page routes.
    pub fn with_route(mut self, route: Route) -> Self {
        self.route = route;
        self
    }

    /// Enables or disables link proxying.
    pub fn with_proxy_links(mut self, proxy_links: bool) -> Self {
        self.proxy_links = proxy_links;
        self
    }

    /// Sets the allow/deny lists.
    pub fn with_lists(mut self, lists: AccessLists) -> Self {
        self.whitelist = lists.whitelist;
        self.blacklist = lists.blacklist;
        self
    }

    /// Sets the loader script.
    pub fn with_loader(mut self, loader: LoaderScript) -> Self {
        self.loader = Some(loader);
        self
    }

    /// Replaces the vendor origins granted by the CSP patcher.
    pub fn with_vendor_origins(mut self, origins: Vec<String>) -> Self {
        self.vendor_origins = origins;
        self
    }

    /// Sets the body buffering timeout.
    pub fn with_body_timeout(mut self, timeout: Duration) -> Self {
        self.body_timeout = timeout;
        self
    }
}

/// Parses a port, accepting `auto` for an OS-assigned one.
pub fn parse_port(raw: &str) -> Result<u16, ConfigError> {
    let raw = raw.trim();
    if raw.eq_ignore_ascii_case("auto") {
        return Ok(0);
    }
    raw.parse::<i64>()
        .ok()
        .and_then(|n| u16::try_from(n).ok())
        .ok_or_else(|| ConfigError::InvalidPort(raw.to_string()))
}

/// Parses a boolean setting.
pub fn parse_flag(name: &'static str, raw: &str) -> Result<bool, ConfigError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "true" | "yes" | "on" | "1" => Ok(true),
        "false" | "no" | "off" | "0" => Ok(false),
        _ => Err(ConfigError::InvalidFlag {
            name,
            value: raw.to_string(),
        }),
    }
}

fn parse_target(raw: &str) -> Result<Url, ConfigError> {
    let url = Url::parse(&assume_http(raw))
        .map_err(|e| ConfigError::InvalidTarget(format!("{raw}: {e}")))?;
    if url.host_str().map_or(true, str::is_empty) {
        return Err(ConfigError::InvalidTarget(raw.to_string()));
    }
    Ok(url)
}

/// Makes sure a context path begins and ends with a single `/`.
pub fn normalize_context_path(raw: &str) -> String {
    let trimmed = raw.trim().trim_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else {
        format!("/{trimmed}/")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn overrides(pairs: &[(&str, &str)]) -> ConfigOverrides {
        let env: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        ConfigOverrides::from_lookup(|name| env.get(name).cloned())
    }

    #[test]
    fn static_defaults() {
        let config =
            ServerConfig::resolve(&ConfigOverrides::default(), &ConfigOverrides::default())
                .unwrap();
        assert_eq!(config.direction, Direction::Forward);
        assert_eq!(config.hostname, "localhost");
        assert_eq!(config.port, 8000);
        assert_eq!(config.context_path, "/");
        assert!(!config.proxy_links);
        assert_eq!(config.body_timeout, Duration::from_secs(30));
    }

    #[test]
    fn reverse_without_target_is_rejected() {
        let explicit = ConfigOverrides {
            direction: Some("reverse".into()),
            ..Default::default()
        };
        let err = ServerConfig::resolve(&explicit, &ConfigOverrides::default()).unwrap_err();
        assert!(matches!(err, ConfigError::MissingTarget));
    }

    #[test]
    fn reverse_with_blank_target_is_rejected() {
        let explicit = ConfigOverrides {
            direction: Some("reverse".into()),
            target: Some("   ".into()),
            ..Default::default()
        };
        assert!(matches!(
            ServerConfig::resolve(&explicit, &ConfigOverrides::default()),
            Err(ConfigError::MissingTarget)
        ));
    }

    #[test]
    fn explicit_beats_defaults() {
        let explicit = ConfigOverrides {
            port: Some("9000".into()),
            ..Default::default()
        };
        let defaults = overrides(&[("PORT", "7000"), ("HOST", "0.0.0.0")]);
        let config = ServerConfig::resolve(&explicit, &defaults).unwrap();
        assert_eq!(config.port, 9000);
        assert_eq!(config.hostname, "0.0.0.0");
    }

    #[test]
    fn env_lookup_prefers_most_specific_name() {
        let env = overrides(&[
            ("FERRY_PORT", "1111"),
            ("PROXY_PORT", "2222"),
            ("PORT", "3333"),
            ("PROXY_TARGET", "http://example.com"),
            ("TARGET", "http://other.com"),
            ("DIRECTION", "reverse"),
        ]);
        assert_eq!(env.port.as_deref(), Some("1111"));
        assert_eq!(env.target.as_deref(), Some("http://example.com"));
        assert_eq!(env.direction.as_deref(), Some("reverse"));
    }

    #[test]
    fn env_lookup_skips_empty_values() {
        let env = overrides(&[("FERRY_HOSTNAME", ""), ("HOST", "example.local")]);
        assert_eq!(env.hostname.as_deref(), Some("example.local"));
    }

    #[test]
    fn port_bounds() {
        assert_eq!(parse_port("0").unwrap(), 0);
        assert_eq!(parse_port("auto").unwrap(), 0);
        assert_eq!(parse_port("65535").unwrap(), 65535);
        assert!(matches!(parse_port("65536"), Err(ConfigError::InvalidPort(_))));
        assert!(matches!(parse_port("-1"), Err(ConfigError::InvalidPort(_))));
        assert!(matches!(parse_port("eighty"), Err(ConfigError::InvalidPort(_))));
    }

    #[test]
    fn invalid_direction() {
        let explicit = ConfigOverrides {
            direction: Some("sideways".into()),
            ..Default::default()
        };
        assert!(matches!(
            ServerConfig::resolve(&explicit, &ConfigOverrides::default()),
            Err(ConfigError::InvalidDirection(_))
        ));
    }

    #[test]
    fn target_without_scheme_assumes_http() {
        let config = ServerConfig::reverse("example.com/app").unwrap();
        assert_eq!(config.target.unwrap().as_str(), "http://example.com/app");
    }

    #[test]
    fn invalid_target() {
        assert!(matches!(
            ServerConfig::reverse("not a url"),
            Err(ConfigError::InvalidTarget(_))
        ));
    }

    #[test]
    fn context_path_normalization() {
        assert_eq!(normalize_context_path(""), "/");
        assert_eq!(normalize_context_path("/"), "/");
        assert_eq!(normalize_context_path("proxy"), "/proxy/");
        assert_eq!(normalize_context_path("/proxy"), "/proxy/");
        assert_eq!(normalize_context_path("/proxy/"), "/proxy/");
    }

    #[test]
    fn proxy_links_flag() {
        let explicit = ConfigOverrides {
            proxy_links: Some("yes".into()),
            ..Default::default()
        };
        let config = ServerConfig::resolve(&explicit, &ConfigOverrides::default()).unwrap();
        assert!(config.proxy_links);

        let explicit = ConfigOverrides {
            proxy_links: Some("maybe".into()),
            ..Default::default()
        };
        assert!(matches!(
            ServerConfig::resolve(&explicit, &ConfigOverrides::default()),
            Err(ConfigError::InvalidFlag { .. })
        ));
    }

    #[test]
    fn lists_from_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("lists.json");
        std::fs::write(
            &path,
            r#"{"blacklist": [{"url": "bank", "regex": "no"}], "whitelist": []}"#,
        )
        .unwrap();

        let lists = AccessLists::from_file(&path).unwrap();
        assert_eq!(lists.blacklist.len(), 1);
        assert!(lists.whitelist.is_empty());
    }

    #[test]
    fn lists_from_missing_file() {
        let err = AccessLists::from_file("/definitely/not/here.json").unwrap_err();
        assert!(matches!(err, ConfigError::Io(_)));
    }
}
