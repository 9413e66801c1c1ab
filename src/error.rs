//! Error types and HTTP status code mapping.

use std::fmt;
use std::time::Duration;

use bytes::Bytes;
use hyper::header::{ACCESS_CONTROL_ALLOW_ORIGIN, CONTENT_TYPE, WWW_AUTHENTICATE};
use hyper::{Response, StatusCode};

use crate::connector::ConnectError;
use crate::proxy::{BoxBody, full};

/// Realm advertised when the gateway's own basic authentication fails.
pub const BASIC_AUTH_REALM: &str = "Basic realm=\"cors-gateway\"";

/// Every failure the gateway can produce, each mapping to a specific HTTP status.
///
/// Inner components return these as values; only the orchestrator and the
/// server turn them into responses.
#[derive(Debug)]
pub enum ProxyError {
    /// The configuration file could not be loaded, parsed or validated.
    Config(String),
    /// The request did not name a target URL.
    NoUrlSpecified,
    /// The target URL uses a scheme other than `http` or `https`.
    InvalidProtocol(String),
    /// The cache duration token is malformed.
    InvalidDuration(String),
    /// The target could not be parsed as an absolute URL.
    InvalidUrl(String),
    /// The host, or an address it resolved to, is blacklisted.
    BlacklistedAddress(String),
    /// The host is not covered by the allow-list.
    HostNotAllowed(String),
    /// The request body exceeds the configured limit.
    BodyTooLarge { limit: u64 },
    /// The upstream response body exceeds the configured limit.
    ResponseTooLarge { limit: u64 },
    /// No connection could be established within the connect timeout.
    ConnectTimeout(Duration),
    /// The upstream did not send response headers within the headers timeout.
    HeadersTimeout(Duration),
    /// The redirect chain exceeded the configured maximum.
    TooManyRedirects(usize),
    /// The upstream was unreachable or the exchange failed.
    Upstream(String),
    /// Piping the response body failed.
    Stream(String),
    /// The gateway's own basic authentication rejected the request.
    Unauthorized,
    /// No route matches the request path.
    NotFound(String),
    /// The route exists but does not accept this method.
    MethodNotAllowed(String),
    /// TLS configuration could not be built.
    Tls(String),
    /// An internal error that does not fit other categories.
    Internal(String),
}

impl fmt::Display for ProxyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "configuration error: {msg}"),
            Self::NoUrlSpecified => write!(f, "No url specified."),
            Self::InvalidProtocol(scheme) => write!(f, "Invalid protocol: {scheme}"),
            Self::InvalidDuration(token) => write!(f, "Invalid duration: {token}"),
            Self::InvalidUrl(msg) => write!(f, "Invalid url: {msg}"),
            Self::BlacklistedAddress(addr) => write!(f, "IP address is not allowed: {addr}"),
            Self::HostNotAllowed(host) => {
                write!(f, "Host is not in list of allowed hosts: {host}")
            }
            Self::BodyTooLarge { limit } => {
                write!(f, "Proxy POST body too large (limit {limit} bytes).")
            }
            Self::ResponseTooLarge { limit } => {
                write!(f, "Upstream response too large (limit {limit} bytes).")
            }
            Self::ConnectTimeout(d) => write!(
                f,
                "Gateway timeout: Could not connect to upstream server within {}ms",
                d.as_millis()
            ),
            Self::HeadersTimeout(d) => write!(
                f,
                "Gateway timeout: Headers not received within {}ms",
                d.as_millis()
            ),
            Self::TooManyRedirects(max) => write!(f, "too many redirects (maximum {max})"),
            Self::Upstream(msg) => write!(f, "upstream error: {msg}"),
            Self::Stream(msg) => write!(f, "stream error: {msg}"),
            Self::Unauthorized => write!(f, "Unauthorized"),
            Self::NotFound(path) => write!(f, "not found: {path}"),
            Self::MethodNotAllowed(method) => write!(f, "method not allowed: {method}"),
            Self::Tls(msg) => write!(f, "TLS error: {msg}"),
            Self::Internal(msg) => write!(f, "internal error: {msg}"),
        }
    }
}

impl std::error::Error for ProxyError {}

impl ProxyError {
    /// Returns the HTTP status code corresponding to this error variant.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::NoUrlSpecified
            | Self::InvalidProtocol(_)
            | Self::InvalidDuration(_)
            | Self::InvalidUrl(_) => StatusCode::BAD_REQUEST,
            Self::BlacklistedAddress(_) | Self::HostNotAllowed(_) => StatusCode::FORBIDDEN,
            Self::BodyTooLarge { .. } | Self::ResponseTooLarge { .. } => {
                StatusCode::PAYLOAD_TOO_LARGE
            }
            Self::ConnectTimeout(_) | Self::HeadersTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            Self::TooManyRedirects(_) | Self::Upstream(_) | Self::Stream(_) => {
                StatusCode::BAD_GATEWAY
            }
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::MethodNotAllowed(_) => StatusCode::METHOD_NOT_ALLOWED,
            Self::Config(_) | Self::Tls(_) | Self::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Short machine-readable code included in the JSON error body.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Config(_) => "config_error",
            Self::NoUrlSpecified => "no_url_specified",
            Self::InvalidProtocol(_) => "invalid_protocol",
            Self::InvalidDuration(_) => "invalid_duration",
            Self::InvalidUrl(_) => "invalid_url",
            Self::BlacklistedAddress(_) => "blacklisted_ip",
            Self::HostNotAllowed(_) => "blocked_host",
            Self::BodyTooLarge { .. } => "body_too_large",
            Self::ResponseTooLarge { .. } => "response_too_large",
            Self::ConnectTimeout(_) => "connect_timeout",
            Self::HeadersTimeout(_) => "headers_timeout",
            Self::TooManyRedirects(_) => "too_many_redirects",
            Self::Upstream(_) => "upstream_error",
            Self::Stream(_) => "stream_error",
            Self::Unauthorized => "unauthorized",
            Self::NotFound(_) => "not_found",
            Self::MethodNotAllowed(_) => "method_not_allowed",
            Self::Tls(_) => "tls_error",
            Self::Internal(_) => "internal_error",
        }
    }

    /// Converts this error into an HTTP response with a JSON body.
    pub fn into_response(self) -> Response<BoxBody> {
        let status = self.status_code();
        let body = serde_json::json!({
            "error": self.code(),
            "message": self.to_string(),
        });

        let mut builder = Response::builder()
            .status(status)
            .header(CONTENT_TYPE, "application/json")
            .header(ACCESS_CONTROL_ALLOW_ORIGIN, "*");
        if matches!(self, Self::Unauthorized) {
            builder = builder.header(WWW_AUTHENTICATE, BASIC_AUTH_REALM);
        }

        builder
            .body(full(body.to_string()))
            .unwrap_or_else(|_| {
                Response::builder()
                    .status(StatusCode::INTERNAL_SERVER_ERROR)
                    .body(full(Bytes::new()))
                    .expect("building fallback response must not fail")
            })
    }
}

impl From<&ConnectError> for ProxyError {
    fn from(err: &ConnectError) -> Self {
        match err {
            ConnectError::BlockedAddress { address, .. } => {
                Self::BlacklistedAddress(address.to_string())
            }
            ConnectError::Timeout(d) => Self::ConnectTimeout(*d),
            other => Self::Upstream(other.to_string()),
        }
    }
}

impl From<hyper::Error> for ProxyError {
    fn from(err: hyper::Error) -> Self {
        Self::Upstream(err.to_string())
    }
}

impl From<hyper::http::Error> for ProxyError {
    fn from(err: hyper::http::Error) -> Self {
        Self::Internal(err.to_string())
    }
}

impl From<hyper::header::InvalidHeaderValue> for ProxyError {
    fn from(err: hyper::header::InvalidHeaderValue) -> Self {
        Self::Internal(err.to_string())
    }
}

impl From<hyper::header::InvalidHeaderName> for ProxyError {
    fn from(err: hyper::header::InvalidHeaderName) -> Self {
        Self::Internal(err.to_string())
    }
}
