//! Target resolution: turning the caller-supplied path segment into the
//! absolute upstream URL, including per-host query parameter injection.

use std::collections::HashMap;
use std::sync::LazyLock;

use regex::Regex;
use url::Url;

use crate::{ProxyError, Result};

static SCHEME_PREFIX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\w+:/").expect("scheme pattern is valid"));

/// A pre-compiled query injection rule.
///
/// When `pattern` matches the target URL, every pair in `params` is appended
/// to the outbound query string.
#[derive(Debug, Clone)]
pub struct QueryParamRule {
    /// Compiled from the configured `regexPattern`.
    pub pattern: Regex,
    /// Key/value pairs appended in configuration order.
    pub params: Vec<(String, String)>,
}

/// Query injection rules keyed by lowercased `host[:port]`.
pub type QueryParamRules = HashMap<String, Vec<QueryParamRule>>;

/// Normalizes a raw target into an absolute `http`/`https` URL string.
///
/// - An empty target yields [`ProxyError::NoUrlSpecified`].
/// - A target without a `scheme:/` prefix gets `http://` prepended.
/// - Any scheme other than `http` or `https` yields
///   [`ProxyError::InvalidProtocol`].
/// - `http:/host` (one slash, as left behind by intermediaries that merge
///   slashes) is repaired to `http://host`.
pub fn process_target_url(target: &str) -> Result<String> {
    if target.is_empty() {
        return Err(ProxyError::NoUrlSpecified);
    }

    let Some(prefix) = SCHEME_PREFIX.find(target) else {
        return Ok(format!("http://{target}"));
    };

    let scheme = &target[..prefix.end() - 2];
    if !scheme.eq_ignore_ascii_case("http") && !scheme.eq_ignore_ascii_case("https") {
        return Err(ProxyError::InvalidProtocol(scheme.to_owned()));
    }

    let rest = &target[prefix.end()..];
    if rest.starts_with('/') {
        Ok(target.to_owned())
    } else {
        Ok(format!("{}/{rest}", prefix.as_str()))
    }
}

/// Builds the outbound URL from a normalized target and the caller's query.
///
/// The caller's query string replaces whatever query the target carried.
/// Every rule registered for the target's host whose pattern matches the
/// target URL then appends its parameters; matching rules accumulate.
pub fn build_remote_url(
    target: &str,
    caller_query: Option<&str>,
    rules: &QueryParamRules,
) -> Result<Url> {
    let mut remote =
        Url::parse(target).map_err(|e| ProxyError::InvalidUrl(format!("{target}: {e}")))?;
    if remote.host_str().is_none() {
        return Err(ProxyError::InvalidUrl(format!("{target}: missing host")));
    }

    let mut pairs: Vec<(String, String)> = caller_query
        .map(|q| {
            url::form_urlencoded::parse(q.as_bytes())
                .into_owned()
                .collect()
        })
        .unwrap_or_default();

    if let Some(host_rules) = rules.get(&host_key(&remote)) {
        let href = remote.as_str();
        host_rules
            .iter()
            .filter(|rule| rule.pattern.is_match(href))
            .for_each(|rule| pairs.extend(rule.params.iter().cloned()));
    }

    if pairs.is_empty() {
        remote.set_query(None);
    } else {
        remote.query_pairs_mut().clear().extend_pairs(pairs);
    }

    Ok(remote)
}

/// Returns the lowercased `host` or `host:port` of a URL, omitting the port
/// when it is the scheme default. This is the key for per-host credentials,
/// query injection rules and upstream-proxy bypass entries.
pub fn host_key(url: &Url) -> String {
    let host = url.host_str().unwrap_or_default().to_ascii_lowercase();
    match url.port() {
        Some(port) => format!("{host}:{port}"),
        None => host,
    }
}

/// Returns the host of a URL with IPv6 brackets removed.
pub fn bare_host(url: &Url) -> Option<String> {
    url.host_str().map(|h| {
        h.strip_prefix('[')
            .and_then(|h| h.strip_suffix(']'))
            .unwrap_or(h)
            .to_ascii_lowercase()
    })
}
