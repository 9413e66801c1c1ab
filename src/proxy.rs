//! Gateway orchestration: one proxied call from inbound request to streamed
//! upstream response.
//!
//! The pipeline reads and bounds the request body, resolves the target URL,
//! builds the credential strategies, dispatches through the guarded client
//! with retry, and rewrites caching and CORS headers on the way back.
//!
//! Every call is assigned a monotonically increasing request ID and wrapped
//! in a [`tracing::Span`] carrying structured fields for observability.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use bytes::Bytes;
use http_body_util::{BodyExt, Full, LengthLimitError, Limited};
use hyper::body::Incoming;
use hyper::header::{AUTHORIZATION, CONTENT_LENGTH, CONTENT_TYPE, HeaderMap, HeaderValue};
use hyper::{Method, Request, Response};
use tracing::{Instrument, debug, info, warn};

use crate::auth::{build_auth_strategies, execute_with_retry};
use crate::dispatch::{Dispatcher, OutboundRequest};
use crate::duration::{DEFAULT_MAX_AGE_SECONDS, parse_duration};
use crate::target::{build_remote_url, host_key, process_target_url};
use crate::{ProxyError, Result, RuntimeConfig, headers};

/// An alias to simplify the calls to `Box<dyn std::error::Error + Send + Sync>`.
pub type StdError = Box<dyn std::error::Error + Send + Sync>;

/// Type-erased body used for every response the gateway produces.
///
/// Streams proxied upstream bodies and locally built bodies (errors, info
/// routes) behind one type.
pub type BoxBody = http_body_util::combinators::BoxBody<Bytes, StdError>;

/// Global monotonic counter for assigning unique request IDs.
static REQUEST_ID: AtomicU64 = AtomicU64::new(1);

/// Wraps in-memory data as a [`BoxBody`].
pub(crate) fn full(data: impl Into<Bytes>) -> BoxBody {
    Full::new(data.into())
        .map_err(|never| -> StdError { match never {} })
        .boxed()
}

/// The shared state behind every proxied call: the configuration snapshot
/// and the pooled dispatcher built from it.
#[derive(Clone)]
pub struct Gateway {
    config: Arc<RuntimeConfig>,
    dispatcher: Dispatcher,
}

impl Gateway {
    /// Builds the dispatcher for `config`.
    pub fn new(config: Arc<RuntimeConfig>) -> Result<Self> {
        let dispatcher = Dispatcher::new(&config)?;
        Ok(Self { config, dispatcher })
    }

    /// The configuration snapshot this gateway was built from.
    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }
}

/// The part of a proxy route after the prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyRoute<'a> {
    /// Cache duration token from a leading `_<duration>` segment.
    pub duration: Option<&'a str>,
    /// The raw target, possibly without a scheme.
    pub target: &'a str,
}

/// Splits `/_<duration>/<target>` or `/<target>` into its parts.
pub fn parse_route(path: &str) -> ProxyRoute<'_> {
    let path = path.strip_prefix('/').unwrap_or(path);
    if let Some(rest) = path.strip_prefix('_') {
        let (token, target) = rest.split_once('/').unwrap_or((rest, ""));
        if !token.is_empty() {
            return ProxyRoute {
                duration: Some(token),
                target,
            };
        }
    }
    ProxyRoute {
        duration: None,
        target: path,
    }
}

/// Processes a single proxied call.
///
/// `route` is the request path with the proxy prefix removed. The pipeline:
///
/// 1. **Method check**: only `GET` and `POST` are proxied.
/// 2. **Route parsing**: the optional `_<duration>` token sets the
///    `max-age` written into `Cache-Control` (default two weeks).
/// 3. **Target resolution**: the target is normalized and combined with the
///    caller's query and any configured query injection rules.
/// 4. **Body bounding**: `POST` bodies over the configured limit are rejected
///    with 413 before anything is sent upstream.
/// 5. **Header filtering**: hop-by-hop and sensitive headers are removed and
///    `X-Forwarded-For` is extended. The caller's `Authorization` header is
///    dropped when it was meant for the gateway itself.
/// 6. **Dispatch**: the request is sent once per credential strategy until
///    one is accepted, with admission checks on every hop.
/// 7. **Response**: error statuses are passed through with a minimal body;
///    successful bodies are streamed back under the response size limit with
///    caching and CORS headers rewritten.
pub async fn handle_request<B>(
    req: Request<B>,
    gateway: &Gateway,
    route: &str,
    client_addr: SocketAddr,
) -> Result<Response<BoxBody>>
where
    B: hyper::body::Body<Data = Bytes> + Send + 'static,
    B::Error: Into<StdError>,
{
    let request_id = REQUEST_ID.fetch_add(1, Ordering::Relaxed);
    let method = req.method().clone();
    let uri = req.uri().clone();

    let span = tracing::info_span!(
        "request",
        id = request_id,
        method = %method,
        uri = %uri,
        client = %client_addr,
    );

    async move {
        let config = gateway.config();

        if method != Method::GET && method != Method::POST {
            return Err(ProxyError::MethodNotAllowed(method.to_string()));
        }

        let route = parse_route(route);
        let max_age = route
            .duration
            .map(parse_duration)
            .transpose()?
            .unwrap_or(DEFAULT_MAX_AGE_SECONDS);

        let target = process_target_url(route.target)?;
        let remote = build_remote_url(&target, uri.query(), &config.query_param_rules)?;
        info!(remote = %remote, max_age, "proxying request");

        let (parts, body) = req.into_parts();
        let body = if method == Method::POST {
            read_body(&parts.headers, body, config.post_size_limit).await?
        } else {
            Bytes::new()
        };

        let mut outbound_headers =
            headers::with_forwarded_for(&headers::filter_headers(&parts.headers), client_addr);
        outbound_headers.remove(CONTENT_LENGTH);
        if config.clear_auth_headers {
            outbound_headers.remove(AUTHORIZATION);
        }

        let user_auth = outbound_headers.get(AUTHORIZATION).cloned();
        let strategies =
            build_auth_strategies(user_auth.as_ref(), config.proxy_auth.get(&host_key(&remote)));
        debug!(
            strategies = ?strategies.iter().map(|s| s.label()).collect::<Vec<_>>(),
            "auth strategies"
        );

        let start = Instant::now();
        let upstream = execute_with_retry(&strategies, &outbound_headers, |headers| {
            gateway.dispatcher.send(OutboundRequest {
                method: method.clone(),
                url: remote.clone(),
                headers,
                body: body.clone(),
            })
        })
        .await?;

        info!(
            status = upstream.status().as_u16(),
            latency_ms = start.elapsed().as_millis() as u64,
            "upstream responded"
        );

        if upstream.status().is_client_error() || upstream.status().is_server_error() {
            return error_passthrough(upstream, config.response_size_limit).await;
        }
        stream_success(upstream, max_age, config.response_size_limit)
    }
    .instrument(span)
    .await
}

/// Collects a request body, enforcing `limit` both on the declared
/// `Content-Length` and on the bytes actually received.
async fn read_body<B>(headers: &HeaderMap, body: B, limit: u64) -> Result<Bytes>
where
    B: hyper::body::Body<Data = Bytes>,
    B::Error: Into<StdError>,
{
    if headers::content_length_exceeds(headers, limit) {
        warn!(
            content_length = headers::content_length(headers),
            limit, "request body exceeds size limit"
        );
        return Err(ProxyError::BodyTooLarge { limit });
    }

    let limited = Limited::new(body, usize::try_from(limit).unwrap_or(usize::MAX));
    match limited.collect().await {
        Ok(collected) => Ok(collected.to_bytes()),
        Err(e) if e.downcast_ref::<LengthLimitError>().is_some() => {
            warn!(limit, "request body exceeded size limit while reading");
            Err(ProxyError::BodyTooLarge { limit })
        }
        Err(e) => Err(ProxyError::Stream(format!("failed to read request body: {e}"))),
    }
}

/// Re-emits an upstream error response.
///
/// The status is kept. A JSON body is passed through; anything else is
/// replaced by the literal `Error`. Upstream headers are not forwarded.
async fn error_passthrough(upstream: Response<Incoming>, limit: u64) -> Result<Response<BoxBody>> {
    let status = upstream.status();
    let limited = Limited::new(upstream.into_body(), usize::try_from(limit).unwrap_or(usize::MAX));
    let json = match limited.collect().await {
        Ok(collected) => serde_json::from_slice::<serde_json::Value>(&collected.to_bytes()).ok(),
        Err(e) => {
            debug!(error = %e, "discarding unreadable upstream error body");
            None
        }
    };

    let (content_type, body) = match json {
        Some(value) => ("application/json", Bytes::from(value.to_string())),
        None => ("text/plain; charset=utf-8", Bytes::from_static(b"Error")),
    };

    let mut response = Response::new(full(body));
    *response.status_mut() = status;
    *response.headers_mut() = headers::process_response_headers(&HeaderMap::new(), None);
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    Ok(response)
}

/// Streams a successful upstream response back to the caller.
fn stream_success(
    upstream: Response<Incoming>,
    max_age: u64,
    limit: u64,
) -> Result<Response<BoxBody>> {
    if headers::content_length_exceeds(upstream.headers(), limit) {
        warn!(
            content_length = headers::content_length(upstream.headers()),
            limit, "upstream response exceeds size limit"
        );
        return Err(ProxyError::ResponseTooLarge { limit });
    }

    let (parts, body) = upstream.into_parts();
    let body = Limited::new(body, usize::try_from(limit).unwrap_or(usize::MAX)).boxed();

    let mut response = Response::new(body);
    *response.status_mut() = parts.status;
    *response.headers_mut() = headers::process_response_headers(&parts.headers, Some(max_age));
    Ok(response)
}
