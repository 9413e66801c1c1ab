//! Secure outbound dispatch.
//!
//! [`Dispatcher`] owns the pooled upstream client. Every request it sends is
//! admitted by the [`HostGuard`] first, and so is every redirect target before
//! it is followed. Connection-level failures raised by the
//! [`GuardedConnector`] are recovered from the client error's source chain and
//! reported as typed [`ProxyError`]s.

use std::error::Error as StdError;
use std::time::{Duration, Instant};

use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::header::{
    AUTHORIZATION, CONTENT_LENGTH, CONTENT_TYPE, COOKIE, HeaderMap, LOCATION, PROXY_AUTHORIZATION,
};
use hyper::{Method, Request, Response, StatusCode, Uri};
use hyper_rustls::HttpsConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioTimer};
use tokio::time::sleep;
use tracing::{debug, info, warn};
use url::Url;

use crate::admission::HostGuard;
use crate::connector::{ConnectError, ConnectPhase, GuardedConnector};
use crate::target::bare_host;
use crate::{ProxyError, Result, RuntimeConfig, tls};

/// The pooled client used for all upstream traffic.
pub type HttpsClient = Client<HttpsConnector<GuardedConnector>, Full<Bytes>>;

/// A fully resolved outbound request.
///
/// The body is held in memory so the request can be replayed for another
/// auth strategy or a redirect hop.
#[derive(Debug, Clone)]
pub struct OutboundRequest {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// Sends outbound requests through the guarded, pooled client.
#[derive(Clone)]
pub struct Dispatcher {
    client: HttpsClient,
    connector: GuardedConnector,
    guard: HostGuard,
    headers_timeout: Duration,
    max_redirects: usize,
}

impl Dispatcher {
    /// Builds the connector stack and the connection pool from `config`.
    pub fn new(config: &RuntimeConfig) -> Result<Self> {
        let connector = GuardedConnector::new(
            config.host_guard.blacklist().clone(),
            config.connect_timeout,
            config.upstream_proxy.clone(),
            config.bypass_upstream_proxy_hosts.clone(),
        );
        let https = tls::build_https_connector(connector.clone(), config.reject_unauthorized)?;

        let client = Client::builder(TokioExecutor::new())
            .pool_idle_timeout(config.pool_idle_timeout)
            .pool_max_idle_per_host(config.pool_max_idle_per_host)
            .pool_timer(TokioTimer::new())
            .build(https);

        Ok(Self {
            client,
            connector,
            guard: config.host_guard.clone(),
            headers_timeout: config.headers_timeout,
            max_redirects: config.max_redirects,
        })
    }

    /// Sends `request`, following redirects.
    ///
    /// Each hop is admitted before it is sent and must produce response
    /// headers within the headers timeout, counted from the moment its
    /// connection is ready. `303` responses, and `301`/`302`
    /// responses to anything but `GET`/`HEAD`, continue as a bodiless `GET`.
    /// Hops to another origin drop `Authorization` and `Cookie`.
    pub async fn send(&self, request: OutboundRequest) -> Result<Response<Incoming>> {
        let OutboundRequest {
            mut method,
            mut url,
            mut headers,
            mut body,
        } = request;
        let mut redirects = 0;

        loop {
            self.admit(&url)?;
            let response = self.send_once(&method, &url, &headers, &body).await?;

            let Some(location) = redirect_location(&response) else {
                return Ok(response);
            };
            if redirects >= self.max_redirects {
                warn!(max = self.max_redirects, url = %url, "redirect limit exceeded");
                return Err(ProxyError::TooManyRedirects(self.max_redirects));
            }
            redirects += 1;

            let next = url.join(&location).map_err(|e| {
                ProxyError::Upstream(format!("invalid redirect location \"{location}\": {e}"))
            })?;
            if next.scheme() != "http" && next.scheme() != "https" {
                warn!(url = %url, location = %next, "redirect to unsupported scheme");
                return Err(ProxyError::Upstream(format!(
                    "redirect to unsupported scheme \"{}\"",
                    next.scheme()
                )));
            }

            if rewrites_to_get(response.status(), &method) {
                method = Method::GET;
                body = Bytes::new();
                headers.remove(CONTENT_TYPE);
                headers.remove(CONTENT_LENGTH);
            }
            if next.origin() != url.origin() {
                headers.remove(AUTHORIZATION);
                headers.remove(COOKIE);
            }

            info!(
                status = response.status().as_u16(),
                from = %url,
                to = %next,
                hop = redirects,
                "following redirect"
            );
            url = next;
        }
    }

    fn admit(&self, url: &Url) -> Result<()> {
        let host = bare_host(url)
            .ok_or_else(|| ProxyError::InvalidUrl(format!("{url}: missing host")))?;
        self.guard.check(&host, url.port_or_known_default())
    }

    async fn send_once(
        &self,
        method: &Method,
        url: &Url,
        headers: &HeaderMap,
        body: &Bytes,
    ) -> Result<Response<Incoming>> {
        let uri: Uri = url
            .as_str()
            .parse()
            .map_err(|e| ProxyError::InvalidUrl(format!("{url}: {e}")))?;

        let mut req = Request::builder()
            .method(method.clone())
            .uri(uri)
            .body(Full::new(body.clone()))?;
        *req.headers_mut() = headers.clone();
        if let Some(value) = self.connector.proxy_authorization_for(url) {
            req.headers_mut().insert(PROXY_AUTHORIZATION, value);
        }

        debug!(method = %method, url = %url, "dispatching upstream request");
        let start = Instant::now();

        // The connector enforces the connect timeout; the headers timer only
        // starts once no connection attempt for this request is in flight.
        let phase = ConnectPhase::default();
        let request = phase.scope(self.client.request(req));
        let headers_deadline = async {
            phase.settled().await;
            sleep(self.headers_timeout).await;
        };
        tokio::pin!(request, headers_deadline);

        let outcome = tokio::select! {
            biased;
            result = &mut request => Ok(result),
            () = &mut headers_deadline => Err(()),
        };

        match outcome {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(e)) => {
                let err = classify(&e);
                warn!(
                    error = %err,
                    latency_ms = start.elapsed().as_millis() as u64,
                    url = %url,
                    "upstream request failed"
                );
                Err(err)
            }
            Err(()) => {
                warn!(
                    timeout_ms = self.headers_timeout.as_millis() as u64,
                    url = %url,
                    "upstream headers timed out"
                );
                Err(ProxyError::HeadersTimeout(self.headers_timeout))
            }
        }
    }
}

/// Returns the `Location` of a redirect response.
fn redirect_location<B>(response: &Response<B>) -> Option<String> {
    match response.status() {
        StatusCode::MOVED_PERMANENTLY
        | StatusCode::FOUND
        | StatusCode::SEE_OTHER
        | StatusCode::TEMPORARY_REDIRECT
        | StatusCode::PERMANENT_REDIRECT => response
            .headers()
            .get(LOCATION)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned),
        _ => None,
    }
}

/// Returns `true` if following a redirect with `status` must switch to `GET`.
fn rewrites_to_get(status: StatusCode, method: &Method) -> bool {
    match status {
        StatusCode::SEE_OTHER => true,
        StatusCode::MOVED_PERMANENTLY | StatusCode::FOUND => {
            *method != Method::GET && *method != Method::HEAD
        }
        _ => false,
    }
}

/// Maps a client error to a [`ProxyError`], preferring a [`ConnectError`]
/// found anywhere in its source chain.
fn classify(err: &(dyn StdError + 'static)) -> ProxyError {
    let mut source = err.source();
    while let Some(cause) = source {
        if let Some(connect) = cause.downcast_ref::<ConnectError>() {
            return ProxyError::from(connect);
        }
        source = cause.source();
    }
    ProxyError::Upstream(error_chain(err))
}

/// Renders an error and its causes as `outer: inner: root`.
fn error_chain(err: &(dyn StdError + 'static)) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}
