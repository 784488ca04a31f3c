//! Upstream redirect rewriting.
//!
//! Keeps reverse-mode clients inside the proxy when the upstream answers
//! with a redirect: the `Location` header is resolved against the fetched
//! target and replaced with its proxied path.

use url::Url;

use crate::state::ServerState;

/// Redirect statuses whose `Location` is rewritten. `304` is deliberately absent.
pub const REWRITTEN_STATUSES: [u16; 5] = [301, 302, 303, 307, 308];

/// Returns true if a response with `status` carries a rewritable `Location`.
pub fn is_rewritable(status: u16) -> bool {
    REWRITTEN_STATUSES.contains(&status)
}

/// Returns the proxied `Location` for a redirect, or `None` if the response
/// should be left alone.
pub fn rewrite_location(
    state: &ServerState,
    status: u16,
    location: &str,
    target: &Url,
) -> Option<String> {
    if !is_rewritable(status) {
        return None;
    }

    let resolved = match target.join(location.trim()) {
        Ok(url) => url,
        Err(e) => {
            tracing::warn!("Leaving unparsable Location {:?} as is: {}", location, e);
            return None;
        }
    };

    if !matches!(resolved.scheme(), "http" | "https") {
        return None;
    }

    Some(state.proxied_path(&resolved))
}
