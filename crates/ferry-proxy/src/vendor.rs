//! Vendor host detection.
//!
//! Requests to the client library's own hosts are tagged so the vendor can
//! tell proxied test sessions apart from real traffic.

/// Marker that identifies vendor hostnames.
pub const VENDOR_HOST_MARKER: &str = "sitecues";

/// Header added to requests for vendor hosts.
pub const TEST_HEADER_NAME: &str = "sitecues-test";

/// Value of [`TEST_HEADER_NAME`].
pub const TEST_HEADER_VALUE: &str = "true; proxy";

/// Checks if `host` belongs to the vendor.
///
/// # Examples
///
/// ```
/// use ferry_proxy::is_vendor_host;
///
/// assert!(is_vendor_host("js.sitecues.com"));
/// assert!(is_vendor_host("WWW.SITECUES.COM"));
/// assert!(!is_vendor_host("example.com"));
/// ```
pub fn is_vendor_host(host: &str) -> bool {
    host.to_ascii_lowercase().contains(VENDOR_HOST_MARKER)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vendor_hosts() {
        assert!(is_vendor_host("sitecues.com"));
        assert!(is_vendor_host("js.dev.sitecues.com"));
        assert!(is_vendor_host("mysitecues.example"));
    }

    #[test]
    fn other_hosts() {
        assert!(!is_vendor_host("example.com"));
        assert!(!is_vendor_host(""));
    }
}
