//! Bridge between the proxy engine and the interception pipeline.

use std::error::Error as StdError;
use std::io;
use std::sync::Arc;

use hudsucker::{
    hyper::{Request, Response, StatusCode},
    Body, HttpContext, HttpHandler, RequestOrResponse,
};

use crate::pipeline::{text_response, Flow, Pipeline, RequestCycle};

/// Engine handler running every exchange through a [`Pipeline`].
///
/// The engine clones the handler for each request, so the cycle started in
/// `handle_request` is still there when the matching response arrives.
#[derive(Clone)]
pub struct FerryHandler {
    pipeline: Arc<Pipeline>,
    cycle: Option<RequestCycle>,
}

impl FerryHandler {
    pub fn new(pipeline: Arc<Pipeline>) -> Self {
        Self {
            pipeline,
            cycle: None,
        }
    }
}

impl HttpHandler for FerryHandler {
    async fn handle_request(&mut self, _ctx: &HttpContext, req: Request<Body>) -> RequestOrResponse {
        let mut cycle = RequestCycle::from_request(&req);
        match self.pipeline.handle_request(&mut cycle, req) {
            Flow::Continue(req) => {
                self.cycle = Some(cycle);
                RequestOrResponse::Request(req)
            }
            Flow::Respond(res) => RequestOrResponse::Response(res),
        }
    }

    async fn handle_response(&mut self, _ctx: &HttpContext, res: Response<Body>) -> Response<Body> {
        match self.cycle.take() {
            Some(cycle) => self.pipeline.handle_response(&cycle, res).await,
            None => res,
        }
    }

    async fn handle_error(
        &mut self,
        _ctx: &HttpContext,
        err: hyper_util::client::legacy::Error,
    ) -> Response<Body> {
        let reason = describe_upstream_error(&err);
        let target = self
            .cycle
            .take()
            .and_then(|c| c.target)
            .map(|t| t.to_string())
            .unwrap_or_else(|| "upstream".to_string());

        tracing::warn!("Request to {} failed: {} ({})", target, reason, err);
        text_response(
            StatusCode::BAD_GATEWAY,
            format!("{reason} while fetching {target}"),
        )
    }

    async fn should_intercept(&mut self, _ctx: &HttpContext, _req: &Request<Body>) -> bool {
        // Tunnels are relayed as is.
        false
    }
}

/// Short description of why an upstream request failed.
pub fn describe_upstream_error(err: &(dyn StdError + 'static)) -> &'static str {
    let mut current = Some(err);
    while let Some(e) = current {
        if let Some(io_err) = e.downcast_ref::<io::Error>() {
            match io_err.kind() {
                io::ErrorKind::ConnectionRefused => return "connection refused",
                io::ErrorKind::TimedOut => return "connection timed out",
                io::ErrorKind::ConnectionReset => return "connection reset",
                _ => {}
            }
        }

        let message = e.to_string();
        if message.contains("dns error") || message.contains("failed to lookup address") {
            return "could not resolve host";
        }
        current = e.source();
    }
    "upstream request failed"
}
