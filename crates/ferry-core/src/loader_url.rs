//! Canonical client library URLs.
//!
//! Builds and parses URLs of the shape
//!
//! ```text
//! {scheme}://{hostname}[:port]/{route}/{siteIdPrefix}={siteId}[/{directory}/{branch}/{version}]/{mediaDir}/{file}
//! ```
//!
//! The `prod`, `dev` and `local` environments map to fixed hosts. Only `dev`
//! carries the directory/branch/version segments; any other environment
//! string is taken as a hostname.
//!
//! ```
//! use ferry_core::loader_url::{Environment, LoaderUrlOptions};
//!
//! let url = LoaderUrlOptions::new("s-00000005").format().unwrap();
//! assert_eq!(url, "https://js.sitecues.com/l/s;id=s-00000005/js/sitecues.js");
//!
//! let parsed = LoaderUrlOptions::parse(&url).unwrap();
//! assert_eq!(parsed.environment, Environment::Prod);
//! ```

use std::fmt;
use std::str::FromStr;

use url::Url;

use crate::error::LoaderUrlError;

const ROUTE: &str = "l";
const SITE_ID_PREFIX: &str = "s;id";
const DEV_DIRECTORY: &str = "dev";
const MEDIA_DIR: &str = "js";
const FILE: &str = "sitecues.js";

/// Default dev branch.
pub const DEFAULT_BRANCH: &str = "master";

/// Default dev version.
pub const DEFAULT_VERSION: &str = "latest";

/// Where the client library is served from.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Environment {
    #[default]
    Prod,
    Dev,
    Local,
    /// Any other host, optionally with a port.
    Custom(String),
}

impl Environment {
    fn scheme(&self) -> &'static str {
        match self {
            Self::Local => "http",
            _ => "https",
        }
    }

    fn authority(&self) -> &str {
        match self {
            Self::Prod => "js.sitecues.com",
            Self::Dev => "js.dev.sitecues.com",
            Self::Local => "localhost:8000",
            Self::Custom(host) => host,
        }
    }

    fn from_authority(host: &str, port: Option<u16>) -> Self {
        match (host, port) {
            ("js.sitecues.com", None) => Self::Prod,
            ("js.dev.sitecues.com", None) => Self::Dev,
            ("localhost", Some(8000)) => Self::Local,
            (host, Some(port)) => Self::Custom(format!("{host}:{port}")),
            (host, None) => Self::Custom(host.to_string()),
        }
    }
}

impl FromStr for Environment {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.trim().to_ascii_lowercase().as_str() {
            "prod" | "production" => Self::Prod,
            "dev" | "development" => Self::Dev,
            "local" => Self::Local,
            _ => Self::Custom(s.trim().to_string()),
        })
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Prod => write!(f, "prod"),
            Self::Dev => write!(f, "dev"),
            Self::Local => write!(f, "local"),
            Self::Custom(host) => write!(f, "{host}"),
        }
    }
}

/// Structured form of a loader URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoaderUrlOptions {
    pub environment: Environment,
    pub site_id: String,
    /// Dev only; defaults to [`DEFAULT_BRANCH`].
    pub branch: Option<String>,
    /// Dev only; defaults to [`DEFAULT_VERSION`].
    pub version: Option<String>,
}

impl LoaderUrlOptions {
    /// Production options for `site_id`.
    pub fn new(site_id: impl Into<String>) -> Self {
        Self {
            environment: Environment::Prod,
            site_id: site_id.into(),
            branch: None,
            version: None,
        }
    }

    /// Sets the environment.
    pub fn with_environment(mut self, environment: Environment) -> Self {
        self.environment = environment;
        self
    }

    /// Sets the dev branch.
    pub fn with_branch(mut self, branch: impl Into<String>) -> Self {
        self.branch = Some(branch.into());
        self
    }

    /// Sets the dev version.
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    /// Builds the canonical URL.
    pub fn format(&self) -> Result<String, LoaderUrlError> {
        let site_id = self.site_id.trim();
        if site_id.is_empty() {
            return Err(LoaderUrlError::MissingSiteId);
        }

        let mut url = format!(
            "{}://{}/{}/{}={}",
            self.environment.scheme(),
            self.environment.authority(),
            ROUTE,
            SITE_ID_PREFIX,
            site_id
        );

        if self.environment == Environment::Dev {
            let branch = self.branch.as_deref().unwrap_or(DEFAULT_BRANCH);
            let version = self.version.as_deref().unwrap_or(DEFAULT_VERSION);
            url.push_str(&format!("/{DEV_DIRECTORY}/{branch}/{version}"));
        }

        url.push_str(&format!("/{MEDIA_DIR}/{FILE}"));
        Ok(url)
    }

    /// Parses a canonical URL back into options.
    pub fn parse(raw: &str) -> Result<Self, LoaderUrlError> {
        let unrecognized = || LoaderUrlError::Unrecognized(raw.to_string());

        let url = Url::parse(raw).map_err(|_| unrecognized())?;
        let host = url.host_str().ok_or_else(unrecognized)?;
        let segments: Vec<&str> = url.path_segments().ok_or_else(unrecognized)?.collect();

        let (route, site, rest) = match segments.as_slice() {
            [route, site, rest @ ..] => (*route, *site, rest),
            _ => return Err(unrecognized()),
        };
        if route != ROUTE {
            return Err(unrecognized());
        }

        let site_id = site
            .strip_prefix(SITE_ID_PREFIX)
            .and_then(|s| s.strip_prefix('='))
            .filter(|s| !s.is_empty())
            .ok_or_else(unrecognized)?;

        let (dev_segments, media) = match rest {
            [media_dir, file] => (None, (*media_dir, *file)),
            [directory, branch, version, media_dir, file] if *directory == DEV_DIRECTORY => {
                (Some((*branch, *version)), (*media_dir, *file))
            }
            _ => return Err(unrecognized()),
        };
        if media != (MEDIA_DIR, FILE) {
            return Err(unrecognized());
        }

        let environment = Environment::from_authority(host, url.port());
        let (branch, version) = match dev_segments {
            Some((branch, version)) => (Some(branch.to_string()), Some(version.to_string())),
            None => (None, None),
        };

        Ok(Self {
            environment,
            site_id: site_id.to_string(),
            branch,
            version,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prod_url() {
        let url = LoaderUrlOptions::new("s-00000005").format().unwrap();
        assert_eq!(url, "https://js.sitecues.com/l/s;id=s-00000005/js/sitecues.js");
    }

    #[test]
    fn dev_url_has_branch_and_version() {
        let url = LoaderUrlOptions::new("s-00000005")
            .with_environment(Environment::Dev)
            .with_branch("feature-x")
            .with_version("1.2.3")
            .format()
            .unwrap();
        assert_eq!(
            url,
            "https://js.dev.sitecues.com/l/s;id=s-00000005/dev/feature-x/1.2.3/js/sitecues.js"
        );
    }

    #[test]
    fn dev_url_defaults() {
        let url = LoaderUrlOptions::new("s-1")
            .with_environment(Environment::Dev)
            .format()
            .unwrap();
        assert!(url.ends_with("/dev/master/latest/js/sitecues.js"));
    }

    #[test]
    fn branch_ignored_outside_dev() {
        let url = LoaderUrlOptions::new("s-1")
            .with_environment(Environment::Local)
            .with_branch("feature-x")
            .format()
            .unwrap();
        assert_eq!(url, "http://localhost:8000/l/s;id=s-1/js/sitecues.js");
    }

    #[test]
    fn custom_host() {
        let env: Environment = "cdn.example.com".parse().unwrap();
        let url = LoaderUrlOptions::new("s-1").with_environment(env).format().unwrap();
        assert_eq!(url, "https://cdn.example.com/l/s;id=s-1/js/sitecues.js");
    }

    #[test]
    fn missing_site_id() {
        assert_eq!(
            LoaderUrlOptions::new("  ").format(),
            Err(LoaderUrlError::MissingSiteId)
        );
    }

    #[test]
    fn environment_aliases() {
        assert_eq!("PROD".parse::<Environment>().unwrap(), Environment::Prod);
        assert_eq!("development".parse::<Environment>().unwrap(), Environment::Dev);
        assert_eq!("local".parse::<Environment>().unwrap(), Environment::Local);
    }

    #[test]
    fn parse_dev_url() {
        let parsed = LoaderUrlOptions::parse(
            "https://js.dev.sitecues.com/l/s;id=s-00000005/dev/feature-x/1.2.3/js/sitecues.js",
        )
        .unwrap();
        assert_eq!(parsed.environment, Environment::Dev);
        assert_eq!(parsed.site_id, "s-00000005");
        assert_eq!(parsed.branch.as_deref(), Some("feature-x"));
        assert_eq!(parsed.version.as_deref(), Some("1.2.3"));
    }

    #[test]
    fn parse_local_and_custom_port() {
        let local = LoaderUrlOptions::parse("http://localhost:8000/l/s;id=s-9/js/sitecues.js").unwrap();
        assert_eq!(local.environment, Environment::Local);

        let custom = LoaderUrlOptions::parse("http://localhost:9000/l/s;id=s-9/js/sitecues.js").unwrap();
        assert_eq!(custom.environment, Environment::Custom("localhost:9000".into()));
        assert_eq!(
            custom.format().unwrap(),
            "https://localhost:9000/l/s;id=s-9/js/sitecues.js"
        );
    }

    #[test]
    fn parse_rejects_other_shapes() {
        for raw in [
            "not a url",
            "https://js.sitecues.com/",
            "https://js.sitecues.com/x/s;id=s-1/js/sitecues.js",
            "https://js.sitecues.com/l/site=s-1/js/sitecues.js",
            "https://js.sitecues.com/l/s;id=/js/sitecues.js",
            "https://js.sitecues.com/l/s;id=s-1/js/other.js",
            "https://js.sitecues.com/l/s;id=s-1/v/a/b/js/sitecues.js",
        ] {
            assert!(
                matches!(LoaderUrlOptions::parse(raw), Err(LoaderUrlError::Unrecognized(_))),
                "{raw}"
            );
        }
    }
}
