// HTTP plumbing used by every listener: the accept loop, canned error
// responses, and the response-header policies the dispatcher applies to
// HTML, redirect, and proxied responses.

use http::header::{
    CACHE_CONTROL, CONTENT_LENGTH, CONTENT_SECURITY_POLICY, HeaderMap, HeaderName, HeaderValue,
    STRICT_TRANSPORT_SECURITY,
};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full};
use hyper::StatusCode;
use hyper::body::Body;
use hyper::body::{Bytes, Incoming};
use hyper::service::Service;
use hyper::{Request, Response};
use hyper_util::rt::TokioExecutor;
use hyper_util::rt::TokioIo;
use hyper_util::server::conn::auto::Builder;
use std::convert::Infallible;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::net::TcpListener;

/// Body type used by all dispatcher responses. Everything we serve is
/// buffered (HTML is rewritten in place), so bodies never fail.
pub type SvcBody = BoxBody<Bytes, Infallible>;

pub fn full_body(bytes: impl Into<Bytes>) -> SvcBody {
    Full::new(bytes.into()).map_err(|e| match e {}).boxed()
}

/// Binds a listener and serves it until `accept` fails. Every accepted
/// socket runs on its own task, with the HTTP version negotiated per
/// connection, so one misbehaving client never stalls the loop.
pub async fn run_http_service<S, B, E>(host: &str, port: u16, service: S) -> Result<(), E>
where
    S: Service<Request<Incoming>, Response = Response<B>, Error = E> + Send + Sync + 'static,
    S::Future: Send + 'static,
    B: Body<Data = Bytes> + Send + 'static,
    B::Error: std::error::Error + Send + Sync,
    E: From<std::io::Error> + std::error::Error + Send + Sync + 'static,
{
    let listener = TcpListener::bind(format!("{host}:{port}")).await?;
    let service = Arc::new(service);

    loop {
        let (stream, _) = listener.accept().await?;
        stream.set_nodelay(true).ok();
        let conn_service = Arc::clone(&service);

        tokio::spawn(async move {
            // Connection-level failures (resets, protocol errors) only
            // concern this socket.
            Builder::new(TokioExecutor::new())
                .serve_connection(TokioIo::new(stream), conn_service)
                .await
                .ok();
        });
    }
}

/// Plain-text response whose body is the status's reason phrase.
pub fn make_error_response(status: StatusCode) -> Response<Bytes> {
    let reason = status.canonical_reason().unwrap_or("request failed");
    let mut response = Response::new(Bytes::from(reason));
    *response.status_mut() = status;
    response
}

/// Boxed version for the dispatch services.
pub fn make_boxed_error_response(status_code: StatusCode) -> Response<SvcBody> {
    make_error_response(status_code).map(full_body)
}

/// Client hints requested on every HTML response so follow-up requests
/// carry full device signals.
pub const ACCEPT_CH_VALUE: &str = "sec-ch-ua, sec-ch-ua-mobile, sec-ch-ua-platform, \
     sec-ch-ua-platform-version, sec-ch-ua-full-version-list, sec-ch-ua-model, sec-ch-ua-arch";

pub fn apply_accept_ch(headers: &mut HeaderMap) {
    headers.insert(
        HeaderName::from_static("accept-ch"),
        HeaderValue::from_static(ACCEPT_CH_VALUE),
    );
}

/// Redirects must never be cached: a cached 302 would replay a stale
/// destination and skip event emission entirely.
pub fn apply_no_store(headers: &mut HeaderMap) {
    headers.insert(
        CACHE_CONTROL,
        HeaderValue::from_static("no-cache, no-store, must-revalidate"),
    );
}

// Headers removed from upstream responses before they reach the client.
// content-length is invalidated by rewriting; the security policies would
// block the rewritten asset URLs and the injected script.
static STRIPPED_UPSTREAM_NAMES: &[HeaderName] = &[
    CONTENT_LENGTH,
    CONTENT_SECURITY_POLICY,
    STRICT_TRANSPORT_SECURITY,
];

pub fn strip_proxied_headers(headers: &mut HeaderMap) -> &mut HeaderMap {
    for name in STRIPPED_UPSTREAM_NAMES {
        headers.remove(name);
    }
    headers
}

/// Admin endpoints served on a separate listener.
pub struct AdminService<F> {
    is_ready: F,
}

impl<F> AdminService<F>
where
    F: Fn() -> bool,
{
    pub fn new(is_ready: F) -> Self {
        Self { is_ready }
    }
}

impl<F> Service<Request<Incoming>> for AdminService<F>
where
    F: Fn() -> bool + Clone + Send + 'static,
{
    type Response = Response<SvcBody>;
    type Error = std::io::Error;
    type Future =
        Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send + 'static>>;

    fn call(&self, req: Request<Incoming>) -> Self::Future {
        let is_ready = (self.is_ready)();

        Box::pin(async move {
            let ok_body = || full_body("ok\n");

            let res = match req.uri().path() {
                "/health" => Response::new(ok_body()),
                "/ready" => match is_ready {
                    true => Response::new(ok_body()),
                    false => make_boxed_error_response(StatusCode::SERVICE_UNAVAILABLE),
                },
                _ => make_boxed_error_response(StatusCode::NOT_FOUND),
            };
            Ok(res)
        })
    }
}
