//! Configuration loading, validation, and pre-compiled runtime state.
//!
//! The gateway reads its YAML configuration exactly once at startup. Query
//! injection patterns are compiled, address lists parsed and credentials
//! turned into header values at load time, so the request path never touches
//! the filesystem or re-validates anything.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::LazyLock;
use std::time::Duration;

use hyper::header::{HeaderName, HeaderValue};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::admission::{AddressList, AllowList, HostGuard};
use crate::auth::HostAuth;
use crate::connector::UpstreamProxy;
use crate::target::{QueryParamRule, QueryParamRules};
use crate::{ProxyError, Result};

/// Default socket address the gateway binds to.
pub const DEFAULT_LISTEN_ADDR: &str = "127.0.0.1:3001";

/// Default path prefix of the proxy route.
pub const DEFAULT_PROXY_PREFIX: &str = "/proxy";

/// Default maximum proxied POST body: 100 KiB.
pub const DEFAULT_POST_SIZE_LIMIT: u64 = 100 * 1024;

/// Default maximum upstream response body: 100 MiB.
pub const DEFAULT_RESPONSE_SIZE_LIMIT: u64 = 100 * 1024 * 1024;

/// Default time allowed for the upstream to send response headers.
pub const DEFAULT_HEADERS_TIMEOUT: Duration = Duration::from_secs(30);

/// Default time allowed for establishing an upstream connection.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default number of redirects followed per proxied call.
pub const DEFAULT_MAX_REDIRECTS: usize = 5;

/// Default idle timeout for pooled connections before they are closed.
pub const DEFAULT_POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Default maximum number of idle connections kept per upstream host.
pub const DEFAULT_POOL_MAX_IDLE_PER_HOST: usize = 32;

static SIZE_LIMIT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^(\d+(?:\.\d+)?)\s*(b|kb|mb|gb|tb)?$").expect("size pattern is valid")
});

/// Raw configuration as deserialized from the YAML file.
///
/// Maps directly to the on-disk schema. After loading, it is transformed
/// into a [`RuntimeConfig`].
#[derive(Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    /// Socket address the gateway listens on (default `"127.0.0.1:3001"`).
    pub listen: Option<String>,
    /// Path prefix of the proxy route (default `"/proxy"`).
    pub proxy_prefix: Option<String>,
    /// Domains and CIDR ranges the gateway proxies for.
    pub allow_proxy_for: Option<Vec<String>>,
    /// Proxy for any host not blacklisted. Defaults to `true` only when
    /// `allowProxyFor` is absent.
    pub proxy_all_domains: Option<bool>,
    /// Addresses, ranges and hosts that may never be contacted. Replaces the
    /// built-in list of reserved ranges when present.
    pub blacklisted_addresses: Option<Vec<String>>,
    /// Forward proxy for all outbound traffic, e.g. `http://proxy:3128`.
    pub upstream_proxy: Option<String>,
    /// `host` or `host:port` entries reached directly, skipping the proxy.
    pub bypass_upstream_proxy_hosts: Vec<String>,
    /// Credentials keyed by upstream `host[:port]`.
    pub proxy_auth: HashMap<String, HostAuthConfig>,
    /// Maximum proxied POST body, in bytes or as `"100kb"` (default 100 KiB).
    pub proxy_post_size_limit: Option<SizeLimit>,
    /// Maximum upstream response body (default 100 MiB).
    pub response_size_limit: Option<SizeLimit>,
    /// Milliseconds allowed for response headers (default 30000).
    pub headers_timeout: Option<u64>,
    /// Milliseconds allowed for connection setup (default 10000).
    pub connect_timeout: Option<u64>,
    /// Redirects followed per call (default 5).
    pub max_redirects: Option<usize>,
    /// Query injection rules keyed by upstream `host[:port]`.
    pub append_param_to_query_string: HashMap<String, Vec<QueryParamRuleConfig>>,
    /// Verify upstream TLS certificates (default `true`).
    pub reject_unauthorized: Option<bool>,
    /// Credentials protecting the gateway itself.
    pub basic_authentication: Option<BasicAuthConfig>,
    /// Strip the caller's `Authorization` header before proxying. Defaults to
    /// `true` when `basicAuthentication` is set.
    pub clear_auth_headers: Option<bool>,
    /// Idle timeout in milliseconds for pooled connections (default 60000).
    pub pool_idle_timeout: Option<u64>,
    /// Maximum idle connections kept per upstream host (default 32).
    pub pool_max_idle_per_host: Option<usize>,
}

/// A byte count given either as a number or as a string like `"100kb"`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum SizeLimit {
    Bytes(u64),
    Text(String),
}

impl SizeLimit {
    /// Resolves the limit to bytes. Units are powers of 1024.
    pub fn to_bytes(&self) -> Result<u64> {
        let text = match self {
            Self::Bytes(n) => return Ok(*n),
            Self::Text(text) => text.trim(),
        };
        let invalid = || ProxyError::Config(format!("invalid size limit \"{text}\""));

        let caps = SIZE_LIMIT.captures(text).ok_or_else(invalid)?;
        let value: f64 = caps[1].parse().map_err(|_| invalid())?;
        let exponent = match caps.get(2).map(|m| m.as_str().to_ascii_lowercase()).as_deref() {
            None | Some("b") => 0,
            Some("kb") => 1,
            Some("mb") => 2,
            Some("gb") => 3,
            Some("tb") => 4,
            Some(_) => return Err(invalid()),
        };
        Ok((value * 1024f64.powi(exponent)).floor() as u64)
    }
}

/// Configured credentials for one upstream host.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct HostAuthConfig {
    /// Value of the `Authorization` header.
    pub authorization: Option<String>,
    /// Additional headers sent with the credentials.
    pub headers: Vec<HeaderConfig>,
}

/// A single configured header.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HeaderConfig {
    pub name: String,
    pub value: String,
}

/// A query injection rule as written in the configuration file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct QueryParamRuleConfig {
    /// Regex matched against the normalized target URL.
    pub regex_pattern: String,
    /// Parameters appended when the pattern matches.
    #[serde(default)]
    pub params: BTreeMap<String, String>,
}

/// Username and password protecting the gateway.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BasicAuthConfig {
    pub username: String,
    pub password: String,
}

/// Fully validated, ready-to-use configuration.
///
/// Created once at startup and shared across all request handlers via `Arc`.
/// Never mutated afterwards.
#[derive(Debug)]
pub struct RuntimeConfig {
    /// Socket address the gateway binds to.
    pub listen: SocketAddr,
    /// Path prefix of the proxy route, with a leading and no trailing slash.
    pub proxy_prefix: String,
    /// The allow-list as configured, reported by the info routes.
    pub allow_proxy_for: Vec<String>,
    /// Whether every non-blacklisted host is admitted.
    pub proxy_all_domains: bool,
    /// Admission decision built from the blacklist and the allow-list.
    pub host_guard: HostGuard,
    /// Forward proxy for outbound traffic.
    pub upstream_proxy: Option<UpstreamProxy>,
    /// Lowercased `host` / `host:port` entries that skip the forward proxy.
    pub bypass_upstream_proxy_hosts: HashSet<String>,
    /// Credentials keyed by lowercased upstream `host[:port]`.
    pub proxy_auth: HashMap<String, HostAuth>,
    /// Maximum proxied POST body in bytes.
    pub post_size_limit: u64,
    /// Maximum upstream response body in bytes.
    pub response_size_limit: u64,
    /// Time allowed for response headers, per attempt.
    pub headers_timeout: Duration,
    /// Time allowed for connection setup, per connection.
    pub connect_timeout: Duration,
    /// Redirects followed per call.
    pub max_redirects: usize,
    /// Compiled query injection rules keyed by lowercased `host[:port]`.
    pub query_param_rules: QueryParamRules,
    /// Whether upstream TLS certificates are verified.
    pub reject_unauthorized: bool,
    /// Credentials protecting the gateway itself.
    pub basic_authentication: Option<BasicAuthConfig>,
    /// Whether the caller's `Authorization` header is removed before proxying.
    pub clear_auth_headers: bool,
    /// Idle timeout for pooled upstream connections.
    pub pool_idle_timeout: Duration,
    /// Maximum idle connections per upstream host.
    pub pool_max_idle_per_host: usize,
}

impl Config {
    /// Loads configuration from a YAML file at the given path.
    ///
    /// Returns a [`ProxyError::Config`] if the file cannot be opened or
    /// its contents fail YAML deserialization.
    pub fn load_from_file(file_path: &(impl AsRef<Path> + ?Sized)) -> Result<Self> {
        let file = std::fs::File::open(file_path).map_err(|e| {
            ProxyError::Config(format!(
                "failed to open {}: {e}",
                file_path.as_ref().display()
            ))
        })?;

        serde_yaml::from_reader(file)
            .map_err(|e| ProxyError::Config(format!("failed to parse config: {e}")))
    }

    /// Loads a standalone credentials file mapping `host[:port]` to
    /// credentials. JSON files are accepted as well.
    pub fn load_proxy_auth(
        file_path: &(impl AsRef<Path> + ?Sized),
    ) -> Result<HashMap<String, HostAuthConfig>> {
        let file = std::fs::File::open(file_path).map_err(|e| {
            ProxyError::Config(format!(
                "failed to open {}: {e}",
                file_path.as_ref().display()
            ))
        })?;

        serde_yaml::from_reader(file)
            .map_err(|e| ProxyError::Config(format!("failed to parse proxy auth file: {e}")))
    }

    /// Validates all fields, producing a [`RuntimeConfig`] suitable for the
    /// request path.
    pub fn into_runtime(self) -> Result<RuntimeConfig> {
        let listen_str = self.listen.as_deref().unwrap_or(DEFAULT_LISTEN_ADDR);
        let listen = listen_str.parse::<SocketAddr>().map_err(|e| {
            ProxyError::Config(format!("invalid listen address \"{listen_str}\": {e}"))
        })?;

        let proxy_prefix = normalize_prefix(self.proxy_prefix.as_deref())?;

        let proxy_all_domains = match (self.proxy_all_domains, &self.allow_proxy_for) {
            (Some(flag), _) => flag,
            (None, Some(_)) => false,
            (None, None) => {
                warn!("allowProxyFor is not set, proxying for all non-blacklisted domains");
                true
            }
        };
        let allow_proxy_for = self.allow_proxy_for.unwrap_or_default();

        let blacklist = match &self.blacklisted_addresses {
            Some(entries) => AddressList::new(entries),
            None => AddressList::default_blacklist(),
        };
        let host_guard = HostGuard::new(
            blacklist,
            AllowList::new(&allow_proxy_for),
            proxy_all_domains,
        );

        let upstream_proxy = self
            .upstream_proxy
            .as_deref()
            .filter(|raw| !raw.trim().is_empty())
            .map(UpstreamProxy::parse)
            .transpose()?;

        let bypass_upstream_proxy_hosts = self
            .bypass_upstream_proxy_hosts
            .iter()
            .map(|h| h.trim().to_ascii_lowercase())
            .filter(|h| !h.is_empty())
            .collect();

        let proxy_auth = self
            .proxy_auth
            .into_iter()
            .map(|(host, auth)| {
                let auth = compile_host_auth(&host, auth)?;
                Ok((host.to_ascii_lowercase(), auth))
            })
            .collect::<Result<HashMap<_, _>>>()?;

        let post_size_limit = self
            .proxy_post_size_limit
            .as_ref()
            .map_or(Ok(DEFAULT_POST_SIZE_LIMIT), SizeLimit::to_bytes)?;

        let response_size_limit = self
            .response_size_limit
            .as_ref()
            .map_or(Ok(DEFAULT_RESPONSE_SIZE_LIMIT), SizeLimit::to_bytes)?;

        let headers_timeout =
            millis_or("headersTimeout", self.headers_timeout, DEFAULT_HEADERS_TIMEOUT)?;
        let connect_timeout =
            millis_or("connectTimeout", self.connect_timeout, DEFAULT_CONNECT_TIMEOUT)?;

        let query_param_rules = self
            .append_param_to_query_string
            .into_iter()
            .map(|(host, rules)| {
                let compiled = rules
                    .into_iter()
                    .map(|rule| compile_query_rule(&host, rule))
                    .collect::<Result<Vec<_>>>()?;
                Ok((host.to_ascii_lowercase(), compiled))
            })
            .collect::<Result<QueryParamRules>>()?;

        let clear_auth_headers = self
            .clear_auth_headers
            .unwrap_or(self.basic_authentication.is_some());

        let pool_idle_timeout = self
            .pool_idle_timeout
            .map_or(DEFAULT_POOL_IDLE_TIMEOUT, Duration::from_millis);

        let pool_max_idle_per_host = self
            .pool_max_idle_per_host
            .unwrap_or(DEFAULT_POOL_MAX_IDLE_PER_HOST);

        Ok(RuntimeConfig {
            listen,
            proxy_prefix,
            allow_proxy_for,
            proxy_all_domains,
            host_guard,
            upstream_proxy,
            bypass_upstream_proxy_hosts,
            proxy_auth,
            post_size_limit,
            response_size_limit,
            headers_timeout,
            connect_timeout,
            max_redirects: self.max_redirects.unwrap_or(DEFAULT_MAX_REDIRECTS),
            query_param_rules,
            reject_unauthorized: self.reject_unauthorized.unwrap_or(true),
            basic_authentication: self.basic_authentication,
            clear_auth_headers,
            pool_idle_timeout,
            pool_max_idle_per_host,
        })
    }
}

/// Ensures a leading slash and strips trailing ones.
fn normalize_prefix(raw: Option<&str>) -> Result<String> {
    let raw = raw.unwrap_or(DEFAULT_PROXY_PREFIX).trim();
    let trimmed = raw.trim_matches('/');
    if trimmed.is_empty() {
        return Err(ProxyError::Config(format!(
            "proxyPrefix \"{raw}\" must name a path segment"
        )));
    }
    Ok(format!("/{trimmed}"))
}

fn millis_or(field: &str, value: Option<u64>, default: Duration) -> Result<Duration> {
    match value {
        Some(0) => Err(ProxyError::Config(format!("{field} must be positive"))),
        Some(ms) => Ok(Duration::from_millis(ms)),
        None => Ok(default),
    }
}

fn compile_host_auth(host: &str, auth: HostAuthConfig) -> Result<HostAuth> {
    let invalid = |e: &dyn std::fmt::Display| {
        ProxyError::Config(format!("invalid proxyAuth entry for {host}: {e}"))
    };

    let authorization = auth
        .authorization
        .as_deref()
        .map(HeaderValue::from_str)
        .transpose()
        .map_err(|e| invalid(&e))?;

    let headers = auth
        .headers
        .iter()
        .map(|h| {
            let name = HeaderName::from_bytes(h.name.as_bytes()).map_err(|e| invalid(&e))?;
            let value = HeaderValue::from_str(&h.value).map_err(|e| invalid(&e))?;
            Ok((name, value))
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(HostAuth {
        authorization,
        headers,
    })
}

fn compile_query_rule(host: &str, rule: QueryParamRuleConfig) -> Result<QueryParamRule> {
    let pattern = Regex::new(&rule.regex_pattern).map_err(|e| {
        ProxyError::Config(format!(
            "invalid regexPattern for {host} \"{}\": {e}",
            rule.regex_pattern
        ))
    })?;

    Ok(QueryParamRule {
        pattern,
        params: rule.params.into_iter().collect(),
    })
}
