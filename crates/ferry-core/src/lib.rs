//! Ferry Core - configuration, state and rewriting rules for the Ferry proxy.
//!
//! Everything in this crate is synchronous and free of I/O apart from
//! reading the allow/deny lists file. The proxy engine lives in
//! `ferry-proxy`.
//!
//! ## Components
//!
//! - [`eligibility`]: allow/deny lists deciding whether a target may be rewritten
//! - [`loader_url`]: canonical client library URLs, both directions
//! - [`target`]: inbound path (plus `Referer`) to upstream target
//! - [`html`] and [`loader`]: page rewriting and the injected loader block
//! - [`redirect`]: `Location` rewriting for upstream redirects
//! - [`csp`]: `Content-Security-Policy` patching
//! - [`state`]: lifecycle phases and derived proxy URLs
//!
//! ## Proxy paths
//!
//! ```text
//! http://localhost:8000/page/http://example.com/a/
//! └──── origin ───────┘└ctx┘└page┘└──── target ─────┘
//! ```

pub mod config;
pub mod csp;
pub mod eligibility;
pub mod error;
pub mod html;
pub mod loader;
pub mod loader_url;
pub mod redirect;
pub mod state;
pub mod target;

pub use config::{AccessLists, ConfigOverrides, Direction, Route, ServerConfig};
pub use csp::{patch_header, CspDirectiveSet};
pub use eligibility::{AllowDenyEntry, EligibilityFilter, RegexSetting};
pub use error::{ConfigError, LifecycleError, LoaderUrlError, TargetError};
pub use html::rewrite_document;
pub use loader::LoaderScript;
pub use loader_url::{Environment, LoaderUrlOptions};
pub use redirect::rewrite_location;
pub use state::{Phase, ServerState};
pub use target::Resolution;

/// Application name reported by the status endpoint.
pub const APP_NAME: &str = "ferry";

/// Crate version reported by the status endpoint.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
