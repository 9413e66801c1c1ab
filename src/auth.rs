//! Credential negotiation against upstream hosts.
//!
//! A proxied call may carry credentials from up to two places: the caller's
//! own `Authorization` header and a per-host entry from the gateway's
//! configuration. Each source becomes an [`AuthStrategy`]; the strategies are
//! tried strictly in order, moving on only when the upstream answers with an
//! authentication failure status.

use http_body_util::{BodyExt, Limited};
use hyper::header::{AUTHORIZATION, HeaderMap, HeaderName, HeaderValue};
use hyper::{Response, StatusCode};
use tracing::debug;

use crate::{ProxyError, Result};

/// Upstream statuses that make the negotiator try the next strategy.
pub const AUTH_STATUS_CODES: [u16; 4] = [401, 403, 407, 511];

/// Most bytes read from a rejected response before it is dropped.
pub const MAX_DRAINED_BODY: usize = 128 * 1024;

/// Credentials configured for one upstream host.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HostAuth {
    /// Sent as the `Authorization` header.
    pub authorization: Option<HeaderValue>,
    /// Extra headers sent alongside, e.g. API keys.
    pub headers: Vec<(HeaderName, HeaderValue)>,
}

impl HostAuth {
    /// Returns `true` if the entry would add nothing to a request.
    pub fn is_empty(&self) -> bool {
        self.authorization.is_none() && self.headers.is_empty()
    }
}

/// One way of authenticating an outbound request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthStrategy {
    /// The caller's own `Authorization` header, forwarded as-is.
    User { authorization: HeaderValue },
    /// Credentials from the gateway's per-host configuration.
    Configured {
        authorization: Option<HeaderValue>,
        headers: Vec<(HeaderName, HeaderValue)>,
    },
    /// No credentials at all.
    None,
}

impl AuthStrategy {
    /// Short name used in log fields.
    pub fn label(&self) -> &'static str {
        match self {
            Self::User { .. } => "user",
            Self::Configured { .. } => "configured",
            Self::None => "none",
        }
    }
}

/// Builds the ordered strategy list for one call.
///
/// The caller's credentials come first, then the configured ones, and the
/// list always ends with [`AuthStrategy::None`].
pub fn build_auth_strategies(
    user_authorization: Option<&HeaderValue>,
    host_auth: Option<&HostAuth>,
) -> Vec<AuthStrategy> {
    let user = user_authorization.map(|authorization| AuthStrategy::User {
        authorization: authorization.clone(),
    });
    let configured = host_auth
        .filter(|auth| !auth.is_empty())
        .map(|auth| AuthStrategy::Configured {
            authorization: auth.authorization.clone(),
            headers: auth.headers.clone(),
        });

    user.into_iter()
        .chain(configured)
        .chain(std::iter::once(AuthStrategy::None))
        .collect()
}

/// Returns a copy of `base` with the credentials of `strategy` applied.
pub fn build_request_headers(base: &HeaderMap, strategy: &AuthStrategy) -> HeaderMap {
    let mut headers = base.clone();
    match strategy {
        AuthStrategy::User { authorization } => {
            headers.insert(AUTHORIZATION, authorization.clone());
        }
        AuthStrategy::Configured {
            authorization,
            headers: extra,
        } => {
            match authorization {
                Some(value) => headers.insert(AUTHORIZATION, value.clone()),
                None => headers.remove(AUTHORIZATION),
            };
            for (name, value) in extra {
                headers.insert(name.clone(), value.clone());
            }
        }
        AuthStrategy::None => {
            headers.remove(AUTHORIZATION);
        }
    }
    headers
}

/// Returns `true` if `status` signals rejected credentials.
pub fn is_auth_failure(status: StatusCode) -> bool {
    AUTH_STATUS_CODES.contains(&status.as_u16())
}

/// Runs `fetch` once per strategy until one is accepted.
///
/// Each attempt gets the headers from [`build_request_headers`]. An
/// authentication failure from any strategy but the last has up to
/// [`MAX_DRAINED_BODY`] bytes of its body drained, the rest is dropped with
/// the response, and the next strategy is tried. Every other outcome, including
/// errors, is returned immediately; so is the last strategy's response.
pub async fn execute_with_retry<F, Fut, B>(
    strategies: &[AuthStrategy],
    base: &HeaderMap,
    mut fetch: F,
) -> Result<Response<B>>
where
    F: FnMut(HeaderMap) -> Fut,
    Fut: Future<Output = Result<Response<B>>>,
    B: hyper::body::Body,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let Some((last, rest)) = strategies.split_last() else {
        return Err(ProxyError::Internal("no auth strategies to attempt".into()));
    };

    for (attempt, strategy) in rest.iter().enumerate() {
        let response = fetch(build_request_headers(base, strategy)).await?;
        if !is_auth_failure(response.status()) {
            return Ok(response);
        }
        debug!(
            attempt = attempt + 1,
            strategy = strategy.label(),
            status = response.status().as_u16(),
            "upstream rejected credentials, trying next strategy"
        );
        if Limited::new(response.into_body(), MAX_DRAINED_BODY)
            .collect()
            .await
            .is_err()
        {
            debug!(strategy = strategy.label(), "rejected response body abandoned");
        }
    }

    fetch(build_request_headers(base, last)).await
}
