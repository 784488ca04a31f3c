//! Ferry Proxy - forward and reverse HTTP proxy that injects a loader script
//! into the pages it relays.
//!
//! ## Features
//!
//! - Reverse mode: targets are embedded in request paths
//!   (`/page/http://example.com/`) and redirects stay inside the proxy
//! - Forward mode: ordinary absolute-form proxy requests, `CONNECT` tunnelled
//! - HTML pages of eligible targets are rewritten (see `ferry_core::html`)
//! - `Content-Security-Policy` headers admit the proxy and vendor origins
//! - Status endpoint reporting process health as JSON
//!
//! ## Architecture
//!
//! ```text
//! Client Request → Engine → status? ──yes──→ JSON report
//!                              │ no
//!                              ▼
//!                       resolve target ──invalid──→ 400 / 302
//!                              │
//!                              ▼
//!                          Upstream
//!                              │
//!                              ▼
//!             redirect → csp → content (HTML only) → Client
//! ```

mod ca;
mod decode;
mod error;
mod handler;
pub mod interceptors;
mod lifecycle;
pub mod pipeline;
mod status;
mod vendor;

pub use decode::{decode_body, ContentEncoding, SUPPORTED_ENCODINGS};
pub use error::{ProxyError, Result};
pub use handler::{describe_upstream_error, FerryHandler};
pub use interceptors::build_pipeline;
pub use lifecycle::LifecycleController;
pub use pipeline::{Filter, Flow, Pipeline, RequestCycle, Stage};
pub use status::{mark_process_start, process_uptime, StatusReport};
pub use vendor::{is_vendor_host, TEST_HEADER_NAME, TEST_HEADER_VALUE};
