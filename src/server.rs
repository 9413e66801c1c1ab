//! Server accept loop, routing, and graceful shutdown.
//!
//! Sits between the TCP listener and the proxy pipeline. Kept apart from
//! `main()` so the server can be started from tests without process-level
//! concerns like signal handling.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use hyper::body::Incoming;
use hyper::header::{
    ACCESS_CONTROL_ALLOW_HEADERS, ACCESS_CONTROL_ALLOW_METHODS, ACCESS_CONTROL_ALLOW_ORIGIN,
    ACCESS_CONTROL_MAX_AGE, ACCESS_CONTROL_REQUEST_HEADERS, AUTHORIZATION, CONTENT_TYPE,
    HeaderMap, HeaderValue,
};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use subtle::ConstantTimeEq;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use crate::config::BasicAuthConfig;
use crate::proxy::{BoxBody, Gateway, full, handle_request};
use crate::{ProxyError, Result};

/// Prefix under which every route is also mounted.
pub const API_V1_PREFIX: &str = "/api/v1";

/// Methods advertised in CORS preflight responses.
const ALLOWED_METHODS: &str = "GET, POST, OPTIONS";

/// Accepts connections on `listener` and serves them with `gateway`.
///
/// Runs until `shutdown` resolves, then stops accepting new connections
/// and returns. In-flight requests on already-spawned tasks continue
/// to completion independently.
pub async fn serve(
    listener: TcpListener,
    gateway: Arc<Gateway>,
    shutdown: impl Future<Output = ()>,
) {
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            result = listener.accept() => {
                let (stream, client_addr) = match result {
                    Ok(conn) => conn,
                    Err(e) => {
                        warn!(%e, "failed to accept connection");
                        continue;
                    }
                };

                let gateway = Arc::clone(&gateway);

                tokio::spawn(async move {
                    let svc = service_fn(move |req: Request<Incoming>| {
                        let gateway = Arc::clone(&gateway);
                        async move {
                            let resp = route(req, &gateway, client_addr)
                                .await
                                .unwrap_or_else(ProxyError::into_response);
                            Ok::<Response<BoxBody>, Infallible>(resp)
                        }
                    });

                    if let Err(e) = http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), svc)
                        .await
                    {
                        warn!(%e, "connection error");
                    }
                });
            }
            () = &mut shutdown => {
                info!("shutting down, no longer accepting connections");
                break;
            }
        }
    }
}

/// Dispatches a request to the matching route.
///
/// `/ping` and CORS preflights are always answered. Every other route sits
/// behind the gateway's basic authentication when it is configured.
pub async fn route<B>(
    req: Request<B>,
    gateway: &Gateway,
    client_addr: SocketAddr,
) -> Result<Response<BoxBody>>
where
    B: hyper::body::Body<Data = bytes::Bytes> + Send + 'static,
    B::Error: Into<crate::proxy::StdError>,
{
    let config = gateway.config();
    let full_path = req.uri().path().to_owned();
    let path = strip_prefix(&full_path, API_V1_PREFIX)
        .filter(|rest| !rest.is_empty())
        .unwrap_or(&full_path);

    if req.method() == Method::OPTIONS {
        return Ok(preflight(req.headers()));
    }

    if path == "/ping" {
        return Ok(text(StatusCode::OK, "OK"));
    }

    if let Some(credentials) = &config.basic_authentication {
        if !basic_auth_matches(req.headers(), credentials) {
            warn!(client = %client_addr, path, "gateway authentication failed");
            return Err(ProxyError::Unauthorized);
        }
    }

    if let Some(rest) = strip_prefix(path, &config.proxy_prefix) {
        return handle_request(req, gateway, rest, client_addr).await;
    }

    let body = match path {
        "/proxyabledomains" => serde_json::json!({
            "proxyableDomains": config.allow_proxy_for,
            "proxyAllDomains": config.proxy_all_domains,
        }),
        "/serverconfig" => serde_json::json!({
            "allowProxyFor": config.allow_proxy_for,
            "proxyAllDomains": config.proxy_all_domains,
            "version": env!("CARGO_PKG_VERSION"),
        }),
        _ => {
            debug!(path, "no route");
            return Err(ProxyError::NotFound(path.to_owned()));
        }
    };

    if req.method() != Method::GET {
        return Err(ProxyError::MethodNotAllowed(req.method().to_string()));
    }
    Ok(json(StatusCode::OK, &body))
}

/// Returns the remainder of `path` after `prefix`, if `prefix` is a whole
/// leading segment sequence. The remainder is empty or starts with `/`.
fn strip_prefix<'a>(path: &'a str, prefix: &str) -> Option<&'a str> {
    path.strip_prefix(prefix)
        .filter(|rest| rest.is_empty() || rest.starts_with('/'))
}

/// Checks an `Authorization: Basic` header against the configured credentials
/// in constant time.
fn basic_auth_matches(headers: &HeaderMap, credentials: &BasicAuthConfig) -> bool {
    headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| {
            let (scheme, encoded) = v.trim().split_once(' ')?;
            scheme.eq_ignore_ascii_case("basic").then_some(encoded.trim())
        })
        .and_then(|encoded| STANDARD.decode(encoded).ok())
        .and_then(|decoded| String::from_utf8(decoded).ok())
        .and_then(|decoded| {
            decoded
                .split_once(':')
                .map(|(user, pass)| {
                    let user = user.as_bytes().ct_eq(credentials.username.as_bytes());
                    let pass = pass.as_bytes().ct_eq(credentials.password.as_bytes());
                    bool::from(user & pass)
                })
        })
        .unwrap_or(false)
}

/// Answers a CORS preflight, reflecting the requested headers.
fn preflight(headers: &HeaderMap) -> Response<BoxBody> {
    let mut response = Response::new(full(bytes::Bytes::new()));
    *response.status_mut() = StatusCode::NO_CONTENT;

    let out = response.headers_mut();
    out.insert(ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("*"));
    out.insert(
        ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static(ALLOWED_METHODS),
    );
    out.insert(ACCESS_CONTROL_MAX_AGE, HeaderValue::from_static("86400"));
    if let Some(requested) = headers.get(ACCESS_CONTROL_REQUEST_HEADERS) {
        out.insert(ACCESS_CONTROL_ALLOW_HEADERS, requested.clone());
    }
    response
}

fn text(status: StatusCode, body: &'static str) -> Response<BoxBody> {
    let mut response = Response::new(full(body));
    *response.status_mut() = status;
    let headers = response.headers_mut();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/plain; charset=utf-8"));
    headers.insert(ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("*"));
    response
}

fn json(status: StatusCode, body: &serde_json::Value) -> Response<BoxBody> {
    let mut response = Response::new(full(body.to_string()));
    *response.status_mut() = status;
    let headers = response.headers_mut();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    headers.insert(ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("*"));
    response
}

/// Awaits a shutdown signal (SIGINT or SIGTERM on Unix, Ctrl+C on all
/// platforms). Returns once the first signal is received.
pub async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm =
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(signal) => signal,
                Err(e) => {
                    warn!(%e, "failed to register SIGTERM handler, listening for SIGINT only");
                    if ctrl_c.await.is_ok() {
                        info!("received SIGINT, initiating graceful shutdown");
                    }
                    return;
                }
            };

        tokio::select! {
            _ = ctrl_c => info!("received SIGINT, initiating graceful shutdown"),
            _ = sigterm.recv() => info!("received SIGTERM, initiating graceful shutdown"),
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(e) = ctrl_c.await {
            warn!(%e, "failed to listen for Ctrl+C");
            return;
        }
        info!("received Ctrl+C, initiating graceful shutdown");
    }
}
