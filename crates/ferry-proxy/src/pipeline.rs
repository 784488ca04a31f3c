//! Interception pipeline.
//!
//! Interceptors are registered per [`Stage`] together with a [`Filter`].
//! For every message the engine hands over, the interceptors whose filter
//! matches run in registration order. A request interceptor may answer the
//! request itself, which ends the request stage. Response bodies are only
//! buffered (and decoded) when a matching interceptor asks for them.

use std::sync::Arc;
use std::time::Duration;

use http_body_util::{BodyExt, Full};
use hudsucker::{
    hyper::{header, Method, Request, Response, StatusCode},
    Body,
};
use hyper::body::Bytes;
use hyper::header::{HeaderMap, HeaderValue};
use hyper::http::response::Parts;
use regex::Regex;
use url::Url;

use ferry_core::ServerState;

use crate::decode::decode_body;
use crate::error::{ProxyError, Result};

/// Helper to convert bytes to Body
fn bytes_to_body(bytes: impl Into<Bytes>) -> Body {
    Body::from(Full::new(bytes.into()))
}

/// Point of the exchange at which an interceptor runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Request,
    Response,
}

/// Per-request data shared by both stages.
#[derive(Debug, Clone)]
pub struct RequestCycle {
    pub method: Method,
    /// Inbound path and query.
    pub path: String,
    pub referer: Option<String>,
    /// Absolute upstream URL, once resolved.
    pub target: Option<Url>,
    /// Whether the target's content may be rewritten.
    pub eligible: bool,
    /// Scheme of the target (or of the inbound request before resolution).
    pub protocol: String,
}

impl RequestCycle {
    /// Starts a cycle for an inbound request.
    pub fn from_request(req: &Request<Body>) -> Self {
        let path = req
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| "/".to_string());
        let referer = req
            .headers()
            .get(header::REFERER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let protocol = req.uri().scheme_str().unwrap_or("http").to_string();

        Self {
            method: req.method().clone(),
            path,
            referer,
            target: None,
            eligible: false,
            protocol,
        }
    }
}

/// Predicates gating an interceptor. Every declared predicate must hold.
#[derive(Debug, Clone, Default)]
pub struct Filter {
    path: Option<Regex>,
    url: Option<Regex>,
    protocol: Option<Regex>,
    mime_type: Option<Regex>,
}

impl Filter {
    /// A filter that matches everything.
    pub fn any() -> Self {
        Self::default()
    }

    /// Requires the inbound path and query to match.
    pub fn path(mut self, pattern: Regex) -> Self {
        self.path = Some(pattern);
        self
    }

    /// Requires a resolved target whose URL matches.
    pub fn url(mut self, pattern: Regex) -> Self {
        self.url = Some(pattern);
        self
    }

    /// Requires the cycle's protocol to match.
    pub fn protocol(mut self, pattern: Regex) -> Self {
        self.protocol = Some(pattern);
        self
    }

    /// Requires a response whose mime type matches. Never holds for requests.
    pub fn mime_type(mut self, pattern: Regex) -> Self {
        self.mime_type = Some(pattern);
        self
    }

    /// Evaluates the filter.
    pub fn matches(&self, cycle: &RequestCycle, mime_type: Option<&str>) -> bool {
        let path = self.path.as_ref().map_or(true, |re| re.is_match(&cycle.path));
        let url = self.url.as_ref().map_or(true, |re| {
            cycle.target.as_ref().is_some_and(|t| re.is_match(t.as_str()))
        });
        let protocol = self
            .protocol
            .as_ref()
            .map_or(true, |re| re.is_match(&cycle.protocol));
        let mime = self
            .mime_type
            .as_ref()
            .map_or(true, |re| mime_type.is_some_and(|m| re.is_match(m)));
        path && url && protocol && mime
    }
}

/// Outcome of a request interceptor.
pub enum Flow {
    /// Hand the (possibly modified) request to the next interceptor.
    Continue(Request<Body>),
    /// Answer directly. Later request interceptors and the whole response
    /// stage are skipped.
    Respond(Response<Body>),
}

/// Runs at [`Stage::Request`].
pub trait RequestInterceptor: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &'static str;

    fn on_request(&self, cycle: &mut RequestCycle, req: Request<Body>) -> Flow;
}

/// Runs at [`Stage::Response`].
pub trait ResponseInterceptor: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &'static str;

    /// Returns true if this interceptor needs the decoded body for `cycle`.
    fn reads_body(&self, _cycle: &RequestCycle) -> bool {
        false
    }

    fn on_response(&self, cycle: &RequestCycle, res: &mut ResponseMessage);
}

enum Payload {
    Streaming(Body),
    Text(String),
    Binary(Bytes),
}

/// A response as seen by response interceptors.
pub struct ResponseMessage {
    parts: Parts,
    payload: Payload,
}

impl ResponseMessage {
    pub fn status(&self) -> StatusCode {
        self.parts.status
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.parts.headers
    }

    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.parts.headers
    }

    /// The decoded body, if it was buffered and is valid UTF-8.
    pub fn text_mut(&mut self) -> Option<&mut String> {
        match &mut self.payload {
            Payload::Text(text) => Some(text),
            _ => None,
        }
    }

    fn into_response(self) -> Response<Body> {
        let mut parts = self.parts;
        let body = match self.payload {
            Payload::Streaming(body) => return Response::from_parts(parts, body),
            Payload::Text(text) => Bytes::from(text),
            Payload::Binary(bytes) => bytes,
        };
        parts.headers.remove(header::CONTENT_ENCODING);
        parts
            .headers
            .insert(header::CONTENT_LENGTH, HeaderValue::from(body.len()));
        Response::from_parts(parts, bytes_to_body(body))
    }
}

struct Registration<H: ?Sized> {
    filter: Filter,
    handler: Box<H>,
}

/// Ordered interceptor registrations plus the state snapshot they share.
pub struct Pipeline {
    state: Arc<ServerState>,
    request: Vec<Registration<dyn RequestInterceptor>>,
    response: Vec<Registration<dyn ResponseInterceptor>>,
}

impl Pipeline {
    /// Creates an empty pipeline.
    pub fn new(state: Arc<ServerState>) -> Self {
        Self {
            state,
            request: Vec::new(),
            response: Vec::new(),
        }
    }

    /// The state snapshot taken when the server started.
    pub fn state(&self) -> &ServerState {
        &self.state
    }

    /// Registers a request interceptor.
    pub fn on_request(
        &mut self,
        filter: Filter,
        handler: impl RequestInterceptor + 'static,
    ) -> &mut Self {
        self.request.push(Registration {
            filter,
            handler: Box::new(handler),
        });
        self
    }

    /// Registers a response interceptor.
    pub fn on_response(
        &mut self,
        filter: Filter,
        handler: impl ResponseInterceptor + 'static,
    ) -> &mut Self {
        self.response.push(Registration {
            filter,
            handler: Box::new(handler),
        });
        self
    }

    /// Registered interceptor names in execution order.
    pub fn registrations(&self) -> Vec<(Stage, &'static str)> {
        self.request
            .iter()
            .map(|r| (Stage::Request, r.handler.name()))
            .chain(
                self.response
                    .iter()
                    .map(|r| (Stage::Response, r.handler.name())),
            )
            .collect()
    }

    /// Runs the request stage.
    pub fn handle_request(&self, cycle: &mut RequestCycle, mut req: Request<Body>) -> Flow {
        for registration in &self.request {
            if !registration.filter.matches(cycle, None) {
                continue;
            }
            match registration.handler.on_request(cycle, req) {
                Flow::Continue(next) => req = next,
                Flow::Respond(res) => {
                    tracing::debug!(
                        "{} answered {} {} with {}",
                        registration.handler.name(),
                        cycle.method,
                        cycle.path,
                        res.status()
                    );
                    return Flow::Respond(res);
                }
            }
        }
        Flow::Continue(req)
    }

    /// Runs the response stage.
    pub async fn handle_response(&self, cycle: &RequestCycle, res: Response<Body>) -> Response<Body> {
        let mime = mime_type(res.headers());
        let matching: Vec<&dyn ResponseInterceptor> = self
            .response
            .iter()
            .filter(|r| r.filter.matches(cycle, mime.as_deref()))
            .map(|r| r.handler.as_ref())
            .collect();
        if matching.is_empty() {
            return res;
        }

        let (parts, body) = res.into_parts();
        let payload = if matching.iter().any(|h| h.reads_body(cycle)) {
            match self.read_body(&parts, body).await {
                Ok(payload) => payload,
                Err(e) => {
                    tracing::warn!("Failed to read response for {}: {}", cycle.path, e);
                    return error_response(&e);
                }
            }
        } else {
            Payload::Streaming(body)
        };

        let mut message = ResponseMessage { parts, payload };
        for handler in matching {
            tracing::trace!("Running {} for {}", handler.name(), cycle.path);
            handler.on_response(cycle, &mut message);
        }
        message.into_response()
    }

    async fn read_body(&self, parts: &Parts, body: Body) -> Result<Payload> {
        let raw = collect_within(body, self.state.config().body_timeout).await?;
        let encoding = parts
            .headers
            .get(header::CONTENT_ENCODING)
            .and_then(|v| v.to_str().ok());
        let bytes = decode_body(encoding, raw)?;

        match String::from_utf8(bytes.to_vec()) {
            Ok(text) => Ok(Payload::Text(text)),
            Err(_) => {
                tracing::debug!("Response body is not UTF-8, leaving it unmodified");
                Ok(Payload::Binary(bytes))
            }
        }
    }
}

/// Buffers `body`, giving up after `timeout`.
pub async fn collect_within<B>(body: B, timeout: Duration) -> Result<Bytes>
where
    B: hyper::body::Body,
    B::Error: std::fmt::Display,
{
    let collected = tokio::time::timeout(timeout, body.collect())
        .await
        .map_err(|_| ProxyError::BodyTimeout(timeout))?
        .map_err(|e| ProxyError::Upstream(e.to_string()))?;
    Ok(collected.to_bytes())
}

/// Lowercased `Content-Type` without parameters.
pub fn mime_type(headers: &HeaderMap) -> Option<String> {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(';').next())
        .map(|v| v.trim().to_ascii_lowercase())
        .filter(|v| !v.is_empty())
}

/// Plain-text response for a request that could not be served.
pub fn error_response(err: &ProxyError) -> Response<Body> {
    let status = match err {
        ProxyError::Target(_) => StatusCode::BAD_REQUEST,
        ProxyError::BodyTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
        ProxyError::Upstream(_) | ProxyError::UnknownEncoding(_) => StatusCode::BAD_GATEWAY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    text_response(status, err.to_string())
}

/// Response with a `text/plain` body.
pub fn text_response(status: StatusCode, text: String) -> Response<Body> {
    let mut res = Response::new(bytes_to_body(text));
    *res.status_mut() = status;
    res.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    res
}

/// `application/json` response.
pub fn json_response(status: StatusCode, json: Vec<u8>) -> Response<Body> {
    let mut res = Response::new(bytes_to_body(json));
    *res.status_mut() = status;
    res.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );
    res
}
