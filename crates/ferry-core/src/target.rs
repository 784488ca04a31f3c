//! Target resolution for reverse mode.
//!
//! Turns an inbound proxy path (plus an optional `Referer`) into either a
//! redirect to the canonical proxied path or an absolute upstream URL to
//! fetch.
//!
//! ```text
//! /page/foo.com                       → redirect /page/http://foo.com/
//! /page/http://foo.com/a/             → fetch    http://foo.com/a/
//! /img.png  (Referer …/page/http://foo.com/a/)
//!                                     → redirect /page/http://foo.com/a/img.png
//! ```

use once_cell::sync::Lazy;
use regex::Regex;
use url::Url;

use crate::error::TargetError;
use crate::state::ServerState;

static SCHEME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-zA-Z][a-zA-Z0-9+.\-]*://").expect("valid scheme regex"));

/// What to do with an inbound reverse-mode request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// Answer with a redirect to this proxied path.
    Redirect(String),
    /// Fetch this absolute URL from upstream.
    Fetch(Url),
}

/// Returns true if `raw` starts with `scheme://`.
pub fn has_scheme(raw: &str) -> bool {
    SCHEME_RE.is_match(raw)
}

/// Prefixes `http://` to anything that does not already name a scheme.
/// Protocol-relative input (`//host`) gets `http:`.
pub fn assume_http(raw: &str) -> String {
    if has_scheme(raw) {
        raw.to_string()
    } else if raw.starts_with("//") {
        format!("http:{raw}")
    } else {
        format!("http://{raw}")
    }
}

/// Resolves the target for `path` (path and query of the inbound request).
///
/// Paths outside the context path are forwarded to the configured upstream
/// target unchanged.
pub fn resolve(
    state: &ServerState,
    path: &str,
    referer: Option<&str>,
) -> Result<Resolution, TargetError> {
    let Some(raw) = state.embedded_target(path) else {
        return passthrough(state, path);
    };

    let relative = !raw.is_empty() && !has_scheme(raw) && !raw.starts_with("//");
    let referrer_base = if relative {
        referer.and_then(|r| referrer_target(state, r))
    } else {
        None
    };

    let resolved = match referrer_base {
        Some(base) => base.join(raw),
        None => Url::parse(&assume_http(raw)),
    };

    let resolved = match resolved {
        Ok(url) if url.host_str().is_some_and(|h| !h.is_empty()) => url,
        _ if raw.is_empty() => return Err(TargetError::Required),
        _ => return Err(TargetError::NoHostname(raw.to_string())),
    };

    if !matches!(resolved.scheme(), "http" | "https") {
        return Err(TargetError::UnsupportedScheme(resolved.scheme().to_string()));
    }

    if resolved.as_str() == raw {
        Ok(Resolution::Fetch(resolved))
    } else {
        tracing::debug!("Redirecting {} to canonical target {}", path, resolved);
        Ok(Resolution::Redirect(state.proxied_path(&resolved)))
    }
}

/// Returns the target embedded in a referrer's proxy path, if any.
pub fn referrer_target(state: &ServerState, referer: &str) -> Option<Url> {
    let url = Url::parse(referer).ok()?;
    let path = match url.query() {
        Some(query) => format!("{}?{}", url.path(), query),
        None => url.path().to_string(),
    };

    let raw = state.embedded_target(&path)?;
    if raw.is_empty() {
        return None;
    }

    Url::parse(&assume_http(raw))
        .ok()
        .filter(|u| u.host_str().is_some_and(|h| !h.is_empty()))
}

fn passthrough(state: &ServerState, path: &str) -> Result<Resolution, TargetError> {
    let upstream = state.config().target.as_ref().ok_or(TargetError::Required)?;
    upstream
        .join(path)
        .map(Resolution::Fetch)
        .map_err(|_| TargetError::NoHostname(path.to_string()))
}
