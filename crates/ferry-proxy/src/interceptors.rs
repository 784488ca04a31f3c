//! The interceptors that make up the standard pipeline.
//!
//! | stage    | interceptor | gate                         |
//! |----------|-------------|------------------------------|
//! | request  | status      | path is the status route     |
//! | request  | target      | all                          |
//! | response | redirect    | reverse mode                 |
//! | response | csp         | all                          |
//! | response | content     | reverse mode, HTML or XHTML  |

use std::sync::Arc;

use hudsucker::{
    hyper::{header, Method, Request, Response, StatusCode, Uri},
    Body,
};
use hyper::header::{HeaderName, HeaderValue};
use once_cell::sync::Lazy;
use regex::Regex;
use url::Url;

use ferry_core::target::{resolve, Resolution};
use ferry_core::{
    csp, rewrite_document, rewrite_location, EligibilityFilter, ServerState, TargetError,
};

use crate::decode::SUPPORTED_ENCODINGS;
use crate::error::{ProxyError, Result};
use crate::pipeline::{
    error_response, json_response, text_response, Filter, Flow, Pipeline, RequestCycle,
    RequestInterceptor, ResponseInterceptor, ResponseMessage,
};
use crate::status::StatusReport;
use crate::vendor::{is_vendor_host, TEST_HEADER_NAME, TEST_HEADER_VALUE};

static HTML_MIME: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?:text/html|application/xhtml\+xml)$").expect("valid html mime regex")
});

static WEB_PROTOCOL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^https?$").expect("valid protocol regex"));

/// Builds the standard pipeline for a started server.
pub fn build_pipeline(state: Arc<ServerState>) -> Result<Pipeline> {
    let reverse = state.config().direction.is_reverse();
    let status_route = Regex::new(&format!(
        r"^{}/?(?:\?.*)?$",
        regex::escape(&state.status_path())
    ))
    .map_err(|e| ProxyError::Engine(e.to_string()))?;

    let mut pipeline = Pipeline::new(state.clone());
    pipeline
        .on_request(
            Filter::any().path(status_route),
            StatusInterceptor::new(state.clone()),
        )
        .on_request(Filter::any(), TargetInterceptor::new(state.clone())?);

    if reverse {
        pipeline.on_response(Filter::any(), RedirectInterceptor::new(state.clone()));
    }
    pipeline.on_response(Filter::any(), CspInterceptor::new(&state));
    if reverse {
        pipeline.on_response(
            Filter::any()
                .protocol(WEB_PROTOCOL.clone())
                .mime_type(HTML_MIME.clone()),
            ContentInterceptor::new(state),
        );
    }

    Ok(pipeline)
}

/// Answers the status route with a JSON health report.
pub struct StatusInterceptor {
    state: Arc<ServerState>,
}

impl StatusInterceptor {
    pub fn new(state: Arc<ServerState>) -> Self {
        Self { state }
    }
}

impl RequestInterceptor for StatusInterceptor {
    fn name(&self) -> &'static str {
        "status"
    }

    fn on_request(&self, _cycle: &mut RequestCycle, req: Request<Body>) -> Flow {
        // Absolute-form requests for other hosts are ordinary forward traffic.
        if let Some(authority) = req.uri().authority() {
            if !authority.as_str().eq_ignore_ascii_case(&self.state.host()) {
                return Flow::Continue(req);
            }
        }
        if req.method() != Method::GET && req.method() != Method::HEAD {
            return Flow::Continue(req);
        }

        match serde_json::to_vec(&StatusReport::collect()) {
            Ok(json) => Flow::Respond(json_response(StatusCode::OK, json)),
            Err(e) => {
                tracing::error!("Failed to serialize status report: {}", e);
                Flow::Continue(req)
            }
        }
    }
}

/// Resolves the upstream target, decides eligibility and tags vendor requests.
pub struct TargetInterceptor {
    state: Arc<ServerState>,
    eligibility: EligibilityFilter,
}

impl TargetInterceptor {
    /// Compiles the allow/deny lists carried by the state's config.
    pub fn new(state: Arc<ServerState>) -> Result<Self> {
        let eligibility = EligibilityFilter::from_config(state.config())?;
        Ok(Self { state, eligibility })
    }

    fn reverse_target(&self, cycle: &RequestCycle) -> std::result::Result<Url, Response<Body>> {
        match resolve(&self.state, &cycle.path, cycle.referer.as_deref()) {
            Ok(Resolution::Fetch(url)) => Ok(url),
            Ok(Resolution::Redirect(location)) => Err(redirect_response(&location)),
            Err(e) => {
                tracing::debug!("Rejecting {}: {}", cycle.path, e);
                Err(error_response(&ProxyError::Target(e)))
            }
        }
    }
}

impl RequestInterceptor for TargetInterceptor {
    fn name(&self) -> &'static str {
        "target"
    }

    fn on_request(&self, cycle: &mut RequestCycle, mut req: Request<Body>) -> Flow {
        let reverse = self.state.config().direction.is_reverse();
        if req.method() == Method::CONNECT {
            if !reverse {
                return Flow::Continue(req);
            }
            // A reverse proxy only ever talks to its own target.
            tracing::warn!("Refusing tunnel to {}", req.uri());
            let mut res = text_response(
                StatusCode::METHOD_NOT_ALLOWED,
                "CONNECT is not supported in reverse mode".to_string(),
            );
            res.headers_mut().insert(
                header::ALLOW,
                HeaderValue::from_static("GET, HEAD, POST, PUT, DELETE, PATCH, OPTIONS"),
            );
            return Flow::Respond(res);
        }

        let target = if reverse {
            match self.reverse_target(cycle) {
                Ok(url) => url,
                Err(res) => return Flow::Respond(res),
            }
        } else {
            match forward_target(req.uri()) {
                Ok(url) => url,
                Err(e) => return Flow::Respond(error_response(&ProxyError::Target(e))),
            }
        };

        if reverse {
            if let Err(e) = retarget(&mut req, &target) {
                return Flow::Respond(error_response(&ProxyError::Target(e)));
            }
        }

        cycle.eligible = self.eligibility.is_eligible(target.as_str());
        cycle.protocol = target.scheme().to_string();

        if target.host_str().is_some_and(is_vendor_host) {
            req.headers_mut().insert(
                HeaderName::from_static(TEST_HEADER_NAME),
                HeaderValue::from_static(TEST_HEADER_VALUE),
            );
        }
        if reverse && cycle.eligible {
            req.headers_mut().insert(
                header::ACCEPT_ENCODING,
                HeaderValue::from_static(SUPPORTED_ENCODINGS),
            );
        }

        tracing::debug!(
            "{} {} -> {} (eligible: {})",
            cycle.method,
            cycle.path,
            target,
            cycle.eligible
        );
        cycle.target = Some(target);
        Flow::Continue(req)
    }
}

/// Keeps upstream redirects inside the proxy.
pub struct RedirectInterceptor {
    state: Arc<ServerState>,
}

impl RedirectInterceptor {
    pub fn new(state: Arc<ServerState>) -> Self {
        Self { state }
    }
}

impl ResponseInterceptor for RedirectInterceptor {
    fn name(&self) -> &'static str {
        "redirect"
    }

    fn on_response(&self, cycle: &RequestCycle, res: &mut ResponseMessage) {
        let Some(target) = &cycle.target else {
            return;
        };
        let Some(location) = res
            .headers()
            .get(header::LOCATION)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
        else {
            return;
        };

        let Some(rewritten) =
            rewrite_location(&self.state, res.status().as_u16(), &location, target)
        else {
            return;
        };
        match HeaderValue::from_str(&rewritten) {
            Ok(value) => {
                tracing::debug!("Rewrote Location {} -> {}", location, rewritten);
                res.headers_mut().insert(header::LOCATION, value);
            }
            Err(e) => tracing::warn!("Cannot use {:?} as Location: {}", rewritten, e),
        }
    }
}

/// Lets pages with a restrictive policy load from the proxy and vendor hosts.
pub struct CspInterceptor {
    origins: Vec<String>,
}

impl CspInterceptor {
    pub fn new(state: &ServerState) -> Self {
        let mut origins = vec![state.origin()];
        origins.extend(state.config().vendor_origins.iter().cloned());
        Self { origins }
    }
}

impl ResponseInterceptor for CspInterceptor {
    fn name(&self) -> &'static str {
        "csp"
    }

    fn on_response(&self, _cycle: &RequestCycle, res: &mut ResponseMessage) {
        let policies: Vec<HeaderValue> = res
            .headers()
            .get_all(header::CONTENT_SECURITY_POLICY)
            .iter()
            .map(|value| {
                value
                    .to_str()
                    .ok()
                    .map(|policy| csp::patch_header(policy, &self.origins))
                    .and_then(|patched| HeaderValue::from_str(&patched).ok())
                    .unwrap_or_else(|| value.clone())
            })
            .collect();
        if policies.is_empty() {
            return;
        }

        let headers = res.headers_mut();
        headers.remove(header::CONTENT_SECURITY_POLICY);
        for policy in policies {
            headers.append(header::CONTENT_SECURITY_POLICY, policy);
        }
    }
}

/// Rewrites eligible HTML pages.
pub struct ContentInterceptor {
    state: Arc<ServerState>,
}

impl ContentInterceptor {
    pub fn new(state: Arc<ServerState>) -> Self {
        Self { state }
    }
}

impl ResponseInterceptor for ContentInterceptor {
    fn name(&self) -> &'static str {
        "content"
    }

    fn reads_body(&self, cycle: &RequestCycle) -> bool {
        cycle.eligible && cycle.target.is_some()
    }

    fn on_response(&self, cycle: &RequestCycle, res: &mut ResponseMessage) {
        if !cycle.eligible {
            return;
        }
        let Some(target) = &cycle.target else {
            return;
        };
        if let Some(text) = res.text_mut() {
            *text = rewrite_document(&self.state, text, target);
        }
    }
}

/// Target of an absolute-form forward proxy request.
fn forward_target(uri: &Uri) -> std::result::Result<Url, TargetError> {
    if uri.scheme().is_none() || uri.authority().is_none() {
        return Err(TargetError::Required);
    }
    let url = Url::parse(&uri.to_string()).map_err(|_| TargetError::Invalid(uri.to_string()))?;
    if url.host_str().is_none() {
        return Err(TargetError::NoHostname(uri.to_string()));
    }
    Ok(url)
}

/// Points a reverse-mode request at `target`.
fn retarget(req: &mut Request<Body>, target: &Url) -> std::result::Result<(), TargetError> {
    let invalid = || TargetError::Invalid(target.to_string());

    let uri: Uri = target.as_str().parse().map_err(|_| invalid())?;
    let host = target.host_str().ok_or_else(invalid)?;
    let authority = match target.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    };
    let host_header = HeaderValue::from_str(&authority).map_err(|_| invalid())?;

    *req.uri_mut() = uri;
    req.headers_mut().insert(header::HOST, host_header);
    Ok(())
}

fn redirect_response(location: &str) -> Response<Body> {
    match HeaderValue::from_str(location) {
        Ok(value) => {
            let mut res = Response::new(Body::empty());
            *res.status_mut() = StatusCode::FOUND;
            res.headers_mut().insert(header::LOCATION, value);
            res
        }
        Err(_) => error_response(&ProxyError::Target(TargetError::Invalid(
            location.to_string(),
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::Stage;
    use ferry_core::{AccessLists, AllowDenyEntry, LoaderScript, ServerConfig};
    use http_body_util::{BodyExt, Full};
    use hyper::body::Bytes;

    fn state_for(config: ServerConfig) -> Arc<ServerState> {
        Arc::new(ServerState::new(config).unwrap())
    }

    fn reverse() -> Arc<ServerState> {
        state_for(ServerConfig::reverse("http://example.com").unwrap())
    }

    fn pipeline(state: Arc<ServerState>) -> Pipeline {
        build_pipeline(state).unwrap()
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    fn run_request(pipeline: &Pipeline, req: Request<Body>) -> (RequestCycle, Flow) {
        let mut cycle = RequestCycle::from_request(&req);
        let flow = pipeline.handle_request(&mut cycle, req);
        (cycle, flow)
    }

    fn answered(flow: Flow) -> Response<Body> {
        match flow {
            Flow::Respond(res) => res,
            Flow::Continue(req) => panic!("expected an answer, request continued to {}", req.uri()),
        }
    }

    fn forwarded(flow: Flow) -> Request<Body> {
        match flow {
            Flow::Continue(req) => req,
            Flow::Respond(res) => panic!("expected the request to continue, got {}", res.status()),
        }
    }

    async fn body_text(res: Response<Body>) -> String {
        let bytes = res.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    fn response(status: u16, headers: &[(&str, &str)], body: &'static str) -> Response<Body> {
        let mut builder = Response::builder().status(status);
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        builder.body(Body::from(Full::new(Bytes::from(body)))).unwrap()
    }

    #[test]
    fn registration_order() {
        let names: Vec<_> = pipeline(reverse()).registrations();
        assert_eq!(
            names,
            vec![
                (Stage::Request, "status"),
                (Stage::Request, "target"),
                (Stage::Response, "redirect"),
                (Stage::Response, "csp"),
                (Stage::Response, "content"),
            ]
        );

        let names = pipeline(state_for(ServerConfig::forward())).registrations();
        assert_eq!(
            names,
            vec![
                (Stage::Request, "status"),
                (Stage::Request, "target"),
                (Stage::Response, "csp"),
            ]
        );
    }

    #[tokio::test]
    async fn status_route_answers_json() {
        let pipeline = pipeline(reverse());
        let (_, flow) = run_request(&pipeline, get("/status"));
        let res = answered(flow);
        assert_eq!(res.status(), StatusCode::OK);
        assert_eq!(res.headers()[header::CONTENT_TYPE], "application/json");

        let json: serde_json::Value = serde_json::from_str(&body_text(res).await).unwrap();
        assert_eq!(json["statusCode"], 200);
        assert_eq!(json["process"]["pid"], std::process::id());
    }

    #[test]
    fn status_route_ignores_other_hosts() {
        let pipeline = pipeline(state_for(ServerConfig::forward()));
        let (cycle, flow) = run_request(&pipeline, get("http://example.com/status"));
        forwarded(flow);
        assert_eq!(cycle.target.unwrap().as_str(), "http://example.com/status");
    }

    #[test]
    fn domain_root_redirects_to_canonical_path() {
        let (_, flow) = run_request(&pipeline(reverse()), get("/page/foo.com"));
        let res = answered(flow);
        assert_eq!(res.status(), StatusCode::FOUND);
        assert_eq!(res.headers()[header::LOCATION], "/page/http://foo.com/");
    }

    #[test]
    fn referrer_relative_request_redirects() {
        let req = Request::builder()
            .uri("/foo")
            .header(header::REFERER, "http://localhost:8000/page/http://example.com/bar/")
            .body(Body::empty())
            .unwrap();
        let res = answered(run_request(&pipeline(reverse()), req).1);
        assert_eq!(res.headers()[header::LOCATION], "/page/http://example.com/bar/foo");
    }

    #[tokio::test]
    async fn missing_target_is_bad_request() {
        let res = answered(run_request(&pipeline(reverse()), get("/page/")).1);
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_text(res).await, "target is required");

        let res = answered(run_request(&pipeline(reverse()), get("/page/http://")).1);
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);
        assert!(body_text(res).await.starts_with("invalid target (no hostname)"));
    }

    #[test]
    fn canonical_target_is_fetched() {
        let (cycle, flow) = run_request(&pipeline(reverse()), get("/page/http://example.com:8080/a?b=1"));
        let req = forwarded(flow);
        assert_eq!(req.uri(), "http://example.com:8080/a?b=1");
        assert_eq!(req.headers()[header::HOST], "example.com:8080");
        assert_eq!(req.headers()[header::ACCEPT_ENCODING], "gzip, deflate");
        assert!(cycle.eligible);
        assert_eq!(cycle.protocol, "http");
    }

    #[test]
    fn vendor_targets_are_tagged() {
        let req = forwarded(
            run_request(&pipeline(reverse()), get("/page/https://js.sitecues.com/x.js")).1,
        );
        assert_eq!(req.headers()["sitecues-test"], "true; proxy");

        let req = forwarded(run_request(&pipeline(reverse()), get("/page/http://example.com/")).1);
        assert!(req.headers().get("sitecues-test").is_none());
    }

    #[test]
    fn blacklisted_target_is_proxied_but_ineligible() {
        let config = ServerConfig::reverse("http://example.com")
            .unwrap()
            .with_lists(AccessLists {
                whitelist: vec![],
                blacklist: vec![AllowDenyEntry::substring("bank.com")],
            });
        let (cycle, flow) = run_request(
            &pipeline(state_for(config)),
            get("/page/http://bank.com/"),
        );
        let req = forwarded(flow);
        assert!(!cycle.eligible);
        assert!(req.headers().get(header::ACCEPT_ENCODING).is_none());
    }

    #[test]
    fn connect_passes_through() {
        let req = Request::builder()
            .method(Method::CONNECT)
            .uri("example.com:443")
            .body(Body::empty())
            .unwrap();
        let (cycle, flow) = run_request(&pipeline(state_for(ServerConfig::forward())), req);
        forwarded(flow);
        assert!(cycle.target.is_none());
    }

    #[tokio::test]
    async fn reverse_mode_refuses_tunnels() {
        let req = Request::builder()
            .method(Method::CONNECT)
            .uri("internal.corp:22")
            .body(Body::empty())
            .unwrap();
        let (cycle, flow) = run_request(&pipeline(reverse()), req);
        let res = answered(flow);
        assert_eq!(res.status(), StatusCode::METHOD_NOT_ALLOWED);
        assert!(res.headers().contains_key(header::ALLOW));
        assert!(cycle.target.is_none());
        assert!(body_text(res).await.contains("CONNECT"));
    }

    #[test]
    fn forward_mode_requires_absolute_uri() {
        let pipeline = pipeline(state_for(ServerConfig::forward()));
        let res = answered(run_request(&pipeline, get("/not-status")).1);
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    }

    fn fetched_cycle(pipeline: &Pipeline, uri: &str) -> RequestCycle {
        let (cycle, flow) = run_request(pipeline, get(uri));
        forwarded(flow);
        cycle
    }

    #[tokio::test]
    async fn redirects_are_rewritten() {
        let pipeline = pipeline(reverse());
        let cycle = fetched_cycle(&pipeline, "/page/http://example.com/bar/");

        for status in [301, 302, 303, 307, 308] {
            let res = pipeline
                .handle_response(&cycle, response(status, &[("location", "/login")], ""))
                .await;
            assert_eq!(
                res.headers()[header::LOCATION],
                "/page/http://example.com/login",
                "status {status}"
            );
        }

        let res = pipeline
            .handle_response(&cycle, response(304, &[("location", "/login")], ""))
            .await;
        assert_eq!(res.headers()[header::LOCATION], "/login");
    }

    #[tokio::test]
    async fn csp_is_patched_only_when_present() {
        let pipeline = pipeline(reverse());
        let cycle = fetched_cycle(&pipeline, "/page/http://example.com/");

        let res = pipeline
            .handle_response(
                &cycle,
                response(
                    200,
                    &[
                        ("content-security-policy", "script-src 'self'"),
                        ("content-security-policy", "img-src 'self'; report-to x"),
                    ],
                    "",
                ),
            )
            .await;
        let policies: Vec<_> = res
            .headers()
            .get_all(header::CONTENT_SECURITY_POLICY)
            .iter()
            .map(|v| v.to_str().unwrap().to_string())
            .collect();
        assert_eq!(policies.len(), 2);
        assert!(policies[0].starts_with("script-src 'self' http://localhost:8000 https://js.sitecues.com"));
        assert!(policies[1].starts_with("img-src 'self' http://localhost:8000"));
        assert!(policies[1].ends_with("; report-to x"));
        assert!(!policies[0].contains("default-src"));

        let res = pipeline.handle_response(&cycle, response(200, &[], "")).await;
        assert!(res.headers().get(header::CONTENT_SECURITY_POLICY).is_none());
    }

    #[tokio::test]
    async fn html_is_rewritten_for_eligible_targets() {
        let config = ServerConfig::reverse("http://example.com")
            .unwrap()
            .with_loader(LoaderScript::new("s-1", "https://js.sitecues.com/x.js"));
        let pipeline = pipeline(state_for(config));
        let cycle = fetched_cycle(&pipeline, "/page/http://example.com/");

        let res = pipeline
            .handle_response(
                &cycle,
                response(
                    200,
                    &[("content-type", "text/html; charset=utf-8")],
                    "<html><head></head><body></body></html>",
                ),
            )
            .await;
        let body = body_text(res).await;
        assert!(body.contains("<base href=\"http://example.com/\">"));
        assert!(body.contains("data-provider=\"sitecues\""));
    }

    #[tokio::test]
    async fn ineligible_and_non_html_bodies_are_untouched() {
        let config = ServerConfig::reverse("http://example.com")
            .unwrap()
            .with_lists(AccessLists {
                whitelist: vec![],
                blacklist: vec![AllowDenyEntry::substring("example.com/private")],
            });
        let pipeline = pipeline(state_for(config));
        let html = "<html><head></head></html>";

        let cycle = fetched_cycle(&pipeline, "/page/http://example.com/private/");
        let res = pipeline
            .handle_response(&cycle, response(200, &[("content-type", "text/html")], html))
            .await;
        assert_eq!(body_text(res).await, html);

        let cycle = fetched_cycle(&pipeline, "/page/http://example.com/app.js");
        let res = pipeline
            .handle_response(
                &cycle,
                response(200, &[("content-type", "application/javascript")], "<head></head>"),
            )
            .await;
        assert_eq!(body_text(res).await, "<head></head>");
    }
}
