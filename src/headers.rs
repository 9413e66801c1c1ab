//! HTTP header policy: hop-by-hop and security-sensitive header removal,
//! forwarding header injection, and the cache/CORS rewrite applied to
//! proxied responses.
//!
//! Every function here takes a header map by reference and returns a new
//! one; callers never observe their input being modified.

use std::net::SocketAddr;

use hyper::header::{
    ACCESS_CONTROL_ALLOW_ORIGIN, CACHE_CONTROL, CONNECTION, CONTENT_LENGTH, HeaderMap,
    HeaderName, HeaderValue,
};

/// Headers that are never forwarded across the gateway in either direction.
///
/// Covers the RFC 7230 Section 6.1 hop-by-hop set plus headers that would
/// leak the gateway's own host, cookies, or transport security policy to the
/// other side.
const DO_NOT_PROXY: [&str; 15] = [
    "host",
    "x-forwarded-host",
    "proxy-connection",
    "connection",
    "keep-alive",
    "transfer-encoding",
    "te",
    "trailer",
    "proxy-authorization",
    "proxy-authenticate",
    "upgrade",
    "expires",
    "pragma",
    "strict-transport-security",
    "cookie",
];

/// Returns `true` if `name` must not be forwarded.
pub fn is_do_not_proxy(name: &HeaderName) -> bool {
    DO_NOT_PROXY.contains(&name.as_str())
}

/// Returns a copy of `headers` without any [`DO_NOT_PROXY`] header and
/// without any header declared in the `Connection` header's token list.
pub fn filter_headers(headers: &HeaderMap) -> HeaderMap {
    let declared: Vec<HeaderName> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|val| val.to_str().ok())
        .flat_map(|val| val.split(','))
        .filter_map(|s| HeaderName::from_bytes(s.trim().as_bytes()).ok())
        .collect();

    headers
        .iter()
        .filter(|(name, _)| !is_do_not_proxy(name) && !declared.contains(name))
        .fold(HeaderMap::new(), |mut out, (name, value)| {
            out.append(name.clone(), value.clone());
            out
        })
}

/// Returns a copy of `headers` with the client's IP appended to
/// `X-Forwarded-For`, preserving any existing proxy chain.
pub fn with_forwarded_for(headers: &HeaderMap, client_addr: SocketAddr) -> HeaderMap {
    let client_ip = client_addr.ip().to_string();
    let mut out = headers.clone();

    let xff_value = headers
        .get("x-forwarded-for")
        .and_then(|existing| existing.to_str().ok())
        .map(|existing| format!("{existing}, {client_ip}"))
        .unwrap_or(client_ip);

    if let Ok(val) = HeaderValue::from_str(&xff_value) {
        out.insert("x-forwarded-for", val);
    }
    out
}

/// Builds the headers returned to the caller for a proxied response.
///
/// The upstream headers are filtered, `Cache-Control` is overridden with
/// `public,max-age=<seconds>` when `max_age` is given, and
/// `Access-Control-Allow-Origin: *` is always set.
pub fn process_response_headers(headers: &HeaderMap, max_age: Option<u64>) -> HeaderMap {
    let mut out = filter_headers(headers);

    if let Some(seconds) = max_age {
        if let Ok(val) = HeaderValue::from_str(&format!("public,max-age={seconds}")) {
            out.insert(CACHE_CONTROL, val);
        }
    }

    out.insert(ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("*"));
    out
}

/// Returns the declared `Content-Length`, if present and parseable.
pub fn content_length(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(CONTENT_LENGTH)
        .and_then(|val| val.to_str().ok())
        .and_then(|s| s.parse::<u64>().ok())
}

/// Returns `true` if the `Content-Length` header value exceeds the given
/// maximum body size in bytes.
///
/// Returns `false` if no `Content-Length` is present or the value is
/// unparseable (hyper handles malformed content-length at the protocol level).
pub fn content_length_exceeds(headers: &HeaderMap, max_bytes: u64) -> bool {
    content_length(headers).is_some_and(|len| len > max_bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header_map(pairs: &[(&str, &str)]) -> HeaderMap {
        pairs
            .iter()
            .fold(HeaderMap::new(), |mut map, (name, value)| {
                map.append(
                    HeaderName::from_bytes(name.as_bytes()).unwrap(),
                    HeaderValue::from_str(value).unwrap(),
                );
                map
            })
    }

    #[test]
    fn strips_every_do_not_proxy_header() {
        let headers = header_map(&[
            ("Host", "gateway.local"),
            ("X-Forwarded-Host", "gateway.local"),
            ("Proxy-Connection", "keep-alive"),
            ("Connection", "keep-alive"),
            ("Keep-Alive", "timeout=5"),
            ("Transfer-Encoding", "chunked"),
            ("TE", "trailers"),
            ("Trailer", "Expires"),
            ("Proxy-Authorization", "Basic abc"),
            ("Proxy-Authenticate", "Basic"),
            ("Upgrade", "websocket"),
            ("Expires", "0"),
            ("Pragma", "no-cache"),
            ("Strict-Transport-Security", "max-age=1"),
            ("Cookie", "session=1"),
            ("X-Custom", "preserved"),
            ("Authorization", "Bearer token"),
        ]);

        let filtered = filter_headers(&headers);

        assert_eq!(filtered.len(), 2);
        assert!(filtered.contains_key("x-custom"));
        assert!(filtered.contains_key("authorization"));
    }

    #[test]
    fn strips_connection_declared_headers() {
        let headers = header_map(&[
            ("connection", "x-secret-internal, x-debug-token"),
            ("x-secret-internal", "leaked"),
            ("x-debug-token", "abc"),
            ("x-safe", "keep"),
        ]);

        let filtered = filter_headers(&headers);

        assert!(!filtered.contains_key("x-secret-internal"));
        assert!(!filtered.contains_key("x-debug-token"));
        assert!(!filtered.contains_key("connection"));
        assert!(filtered.contains_key("x-safe"));
    }

    #[test]
    fn filtering_does_not_mutate_input_and_is_idempotent() {
        let headers = header_map(&[
            ("cookie", "a=b"),
            ("accept", "application/json"),
            ("x-multi", "one"),
            ("x-multi", "two"),
        ]);
        let snapshot = headers.clone();

        let once = filter_headers(&headers);
        let twice = filter_headers(&once);

        assert_eq!(headers, snapshot);
        assert_eq!(once, twice);
        assert_eq!(once.get_all("x-multi").iter().count(), 2);
    }

    #[test]
    fn injects_xff_with_no_prior_value() {
        let headers = HeaderMap::new();
        let addr = "192.168.1.10:5000".parse::<SocketAddr>().unwrap();

        let out = with_forwarded_for(&headers, addr);

        assert_eq!(out.get("x-forwarded-for").unwrap(), "192.168.1.10");
        assert!(headers.is_empty());
    }

    #[test]
    fn appends_to_existing_xff() {
        let headers = header_map(&[("x-forwarded-for", "10.0.0.1")]);
        let addr = "192.168.1.10:5000".parse::<SocketAddr>().unwrap();

        let out = with_forwarded_for(&headers, addr);

        assert_eq!(out.get("x-forwarded-for").unwrap(), "10.0.0.1, 192.168.1.10");
    }

    #[test]
    fn response_headers_get_cache_and_cors_overrides() {
        let headers = header_map(&[
            ("cache-control", "no-cache"),
            ("connection", "close"),
            ("content-type", "application/json"),
            ("access-control-allow-origin", "https://only.example"),
        ]);

        let out = process_response_headers(&headers, Some(1_209_600));

        assert_eq!(out.get(CACHE_CONTROL).unwrap(), "public,max-age=1209600");
        assert_eq!(out.get(ACCESS_CONTROL_ALLOW_ORIGIN).unwrap(), "*");
        assert_eq!(out.get_all(ACCESS_CONTROL_ALLOW_ORIGIN).iter().count(), 1);
        assert_eq!(out.get("content-type").unwrap(), "application/json");
        assert!(!out.contains_key("connection"));
    }

    #[test]
    fn response_headers_without_max_age_keep_upstream_cache_control() {
        let headers = header_map(&[("cache-control", "no-store")]);

        let out = process_response_headers(&headers, None);

        assert_eq!(out.get(CACHE_CONTROL).unwrap(), "no-store");
        assert_eq!(out.get(ACCESS_CONTROL_ALLOW_ORIGIN).unwrap(), "*");
    }

    #[test]
    fn content_length_within_limit() {
        let headers = header_map(&[("content-length", "1024")]);
        assert!(!content_length_exceeds(&headers, 102_400));
    }

    #[test]
    fn content_length_exceeds_limit() {
        let headers = header_map(&[("content-length", "20000000")]);
        assert!(content_length_exceeds(&headers, 102_400));
    }

    #[test]
    fn missing_or_unparseable_content_length_does_not_exceed() {
        assert!(!content_length_exceeds(&HeaderMap::new(), 1));
        let headers = header_map(&[("content-length", "not-a-number")]);
        assert!(!content_length_exceeds(&headers, 1));
    }
}
