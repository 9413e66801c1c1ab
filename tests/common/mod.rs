//! Shared test infrastructure for integration tests.
//!
//! Provides throwaway HTTP and TLS backend servers, gateway configuration
//! builders, and helpers for driving requests through the gateway's router.

#![allow(dead_code)]

use std::convert::Infallible;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use cors_gateway::{BoxBody, Config, Gateway, ProxyError, RuntimeConfig};
use http_body_util::{BodyExt, Empty, Full};
use hyper::body::{Frame, Incoming};
use hyper::header::{AUTHORIZATION, CONTENT_TYPE, LOCATION, PROXY_AUTHORIZATION};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tokio::sync::oneshot;

/// A synthetic client address used in all test invocations.
const TEST_CLIENT_ADDR: &str = "192.168.1.100:54321";

/// Blacklist used by tests so that loopback backends are reachable while the
/// blacklist logic itself stays active.
const TEST_BLACKLIST: &str = "blacklistedAddresses: ['202.168.1.1']\n";

/// Initializes a tracing subscriber for test output.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter("debug")
        .try_init();
}

pub fn test_addr() -> SocketAddr {
    TEST_CLIENT_ADDR.parse().unwrap()
}

/// Collects a [`BoxBody`] into [`Bytes`], mapping any body error to a
/// descriptive panic so test assertions remain concise.
pub async fn collect_body(body: BoxBody) -> Bytes {
    body.collect()
        .await
        .expect("failed to collect response body")
        .to_bytes()
}

/// Collects a response body and parses it as JSON.
pub async fn json_body(body: BoxBody) -> serde_json::Value {
    let bytes = collect_body(body).await;
    serde_json::from_slice(&bytes).expect("response body must be JSON")
}

/// Builds a `RuntimeConfig` from YAML, on top of a blacklist that leaves
/// loopback reachable. `extra` must not set `blacklistedAddresses`.
pub fn test_config(extra: &str) -> Arc<RuntimeConfig> {
    let yaml = format!("{TEST_BLACKLIST}{extra}");
    raw_config(&yaml)
}

/// Builds a `RuntimeConfig` from YAML exactly as given.
pub fn raw_config(yaml: &str) -> Arc<RuntimeConfig> {
    let config: Config = serde_yaml::from_str(yaml).expect("test config must parse");
    Arc::new(config.into_runtime().expect("test config must be valid"))
}

pub fn test_gateway(extra: &str) -> Gateway {
    Gateway::new(test_config(extra)).expect("gateway must build")
}

/// Routes `req` through the gateway, rendering errors the way the server does.
pub async fn call<B>(gateway: &Gateway, req: Request<B>) -> Response<BoxBody>
where
    B: hyper::body::Body<Data = Bytes> + Send + 'static,
    B::Error: Into<cors_gateway::proxy::StdError>,
{
    cors_gateway::server::route(req, gateway, test_addr())
        .await
        .unwrap_or_else(ProxyError::into_response)
}

/// Sends a bodiless request with `method` to `path`.
pub async fn send(gateway: &Gateway, method: Method, path: &str) -> Response<BoxBody> {
    let req = Request::builder()
        .method(method)
        .uri(path)
        .body(Empty::<Bytes>::new())
        .unwrap();
    call(gateway, req).await
}

pub async fn get(gateway: &Gateway, path: &str) -> Response<BoxBody> {
    send(gateway, Method::GET, path).await
}

/// Starts a local HTTP server answering every request with `handler`.
/// Returns the server address and a handle to shut it down.
pub async fn start_service<F, Fut, B>(handler: F) -> (SocketAddr, oneshot::Sender<()>)
where
    F: Fn(Request<Incoming>) -> Fut + Clone + Send + Sync + 'static,
    Fut: Future<Output = Response<B>> + Send + 'static,
    B: hyper::body::Body + Send + 'static,
    B::Data: Send,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let (tx, rx) = oneshot::channel::<()>();

    let listener = TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], 0)))
        .await
        .expect("failed to bind test backend");
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        let mut shutdown = std::pin::pin!(async {
            let _ = rx.await;
        });

        loop {
            tokio::select! {
                result = listener.accept() => {
                    let (stream, _) = result.expect("accept failed");
                    let handler = handler.clone();
                    let service = service_fn(move |req: Request<Incoming>| {
                        let handler = handler.clone();
                        async move { Ok::<_, Infallible>(handler(req).await) }
                    });
                    tokio::spawn(async move {
                        let _ = http1::Builder::new()
                            .serve_connection(TokioIo::new(stream), service)
                            .await;
                    });
                }
                () = &mut shutdown => break,
            }
        }
    });

    (addr, tx)
}

fn respond(
    status: StatusCode,
    content_type: &str,
    body: impl Into<Bytes>,
) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header(CONTENT_TYPE, content_type)
        .body(Full::new(body.into()))
        .expect("test response must build")
}

/// Starts a backend that responds to every request with the given status,
/// content-type, and body.
pub async fn start_backend(
    status: StatusCode,
    content_type: &'static str,
    body: &'static str,
) -> (SocketAddr, oneshot::Sender<()>) {
    start_service(move |_req| async move { respond(status, content_type, body) }).await
}

/// Starts a backend that echoes the request headers as sorted
/// `name: value` lines.
pub async fn start_echo_headers_backend() -> (SocketAddr, oneshot::Sender<()>) {
    start_service(|req: Request<Incoming>| async move {
        let mut lines: Vec<String> = req
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| format!("{}: {}", name.as_str(), v))
            })
            .collect();
        lines.sort();
        respond(StatusCode::OK, "text/plain", lines.join("\n"))
    })
    .await
}

/// Starts a backend that echoes the method, request target and body as
/// `METHOD target\n\nbody`.
pub async fn start_echo_request_backend() -> (SocketAddr, oneshot::Sender<()>) {
    start_service(|req: Request<Incoming>| async move {
        let head = format!("{} {}", req.method(), req.uri());
        let body = req
            .into_body()
            .collect()
            .await
            .map(|c| c.to_bytes())
            .unwrap_or_default();
        let mut out = format!("{head}\n\n").into_bytes();
        out.extend_from_slice(&body);
        respond(StatusCode::OK, "text/plain", out)
    })
    .await
}

/// Starts a backend that answers every request with a `302` to `location`.
pub async fn start_redirect_backend(location: String) -> (SocketAddr, oneshot::Sender<()>) {
    start_service(move |_req| {
        let location = location.clone();
        async move {
            Response::builder()
                .status(StatusCode::FOUND)
                .header(LOCATION, location)
                .body(Full::new(Bytes::new()))
                .expect("test response must build")
        }
    })
    .await
}

/// Starts a backend that only accepts `expected` as `Authorization` and
/// records every `Authorization` value it sees (`-` for none).
pub async fn start_auth_backend(
    expected: &'static str,
) -> (SocketAddr, Arc<Mutex<Vec<String>>>, oneshot::Sender<()>) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let recorder = Arc::clone(&seen);

    let (addr, tx) = start_service(move |req: Request<Incoming>| {
        let recorder = Arc::clone(&recorder);
        async move {
            let auth = req
                .headers()
                .get(AUTHORIZATION)
                .and_then(|v| v.to_str().ok())
                .unwrap_or("-")
                .to_owned();
            let accepted = auth == expected;
            recorder.lock().unwrap().push(auth);

            if accepted {
                respond(StatusCode::OK, "application/json", r#"{"secret":true}"#)
            } else {
                respond(StatusCode::UNAUTHORIZED, "application/json", r#"{"error":"denied"}"#)
            }
        }
    })
    .await;

    (addr, seen, tx)
}

/// Starts a backend that rejects every request carrying `Authorization` with
/// `403` and serves anonymous ones. Records every `Authorization` value it
/// sees (`-` for none).
pub async fn start_anonymous_only_backend()
-> (SocketAddr, Arc<Mutex<Vec<String>>>, oneshot::Sender<()>) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let recorder = Arc::clone(&seen);

    let (addr, tx) = start_service(move |req: Request<Incoming>| {
        let recorder = Arc::clone(&recorder);
        async move {
            let auth = req
                .headers()
                .get(AUTHORIZATION)
                .and_then(|v| v.to_str().ok())
                .unwrap_or("-")
                .to_owned();
            let anonymous = auth == "-";
            recorder.lock().unwrap().push(auth);

            if anonymous {
                respond(StatusCode::OK, "text/plain", "public")
            } else {
                respond(StatusCode::FORBIDDEN, "text/plain", "forbidden")
            }
        }
    })
    .await;

    (addr, seen, tx)
}

static CHUNK: [u8; 64 * 1024] = [b'x'; 64 * 1024];

/// A response body that never ends.
pub struct EndlessBody;

impl hyper::body::Body for EndlessBody {
    type Data = Bytes;
    type Error = Infallible;

    fn poll_frame(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Bytes>, Infallible>>> {
        Poll::Ready(Some(Ok(Frame::data(Bytes::from_static(&CHUNK)))))
    }
}

/// Starts a backend that answers requests carrying `Authorization` with a
/// `401` whose body never ends, and anonymous ones with `200 open`.
pub async fn start_endless_rejection_backend() -> (SocketAddr, oneshot::Sender<()>) {
    start_service(|req: Request<Incoming>| async move {
        let (status, body) = if req.headers().contains_key(AUTHORIZATION) {
            (StatusCode::UNAUTHORIZED, EndlessBody.boxed())
        } else {
            (StatusCode::OK, Full::new(Bytes::from_static(b"open")).boxed())
        };
        Response::builder()
            .status(status)
            .body(body)
            .expect("test response must build")
    })
    .await
}

/// Starts a stand-in forward proxy. It answers every request with
/// `via-proxy` followed by the request target and any `Proxy-Authorization`,
/// as `via-proxy METHOD target\nproxy-authorization: value`.
pub async fn start_forward_proxy() -> (SocketAddr, oneshot::Sender<()>) {
    start_service(|req: Request<Incoming>| async move {
        let auth = req
            .headers()
            .get(PROXY_AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("-");
        let body = format!(
            "via-proxy {} {}\nproxy-authorization: {auth}",
            req.method(),
            req.uri()
        );
        respond(StatusCode::OK, "text/plain", body)
    })
    .await
}

/// Starts a listener that accepts connections and never writes to them.
pub async fn start_silent_listener() -> (SocketAddr, oneshot::Sender<()>) {
    let (tx, rx) = oneshot::channel::<()>();
    let listener = TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], 0)))
        .await
        .expect("failed to bind silent listener");
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        let mut held = Vec::new();
        let mut shutdown = std::pin::pin!(async {
            let _ = rx.await;
        });
        loop {
            tokio::select! {
                result = listener.accept() => {
                    if let Ok((stream, _)) = result {
                        held.push(stream);
                    }
                }
                () = &mut shutdown => break,
            }
        }
    });

    (addr, tx)
}

/// Starts a backend that sleeps for the given duration before responding.
pub async fn start_slow_backend(delay: Duration) -> (SocketAddr, oneshot::Sender<()>) {
    start_service(move |_req| async move {
        tokio::time::sleep(delay).await;
        respond(StatusCode::OK, "text/plain", "slow")
    })
    .await
}

/// Starts the gateway on an OS-assigned port. Returns its address and a
/// handle that triggers graceful shutdown.
pub async fn start_gateway(config: Arc<RuntimeConfig>) -> (SocketAddr, oneshot::Sender<()>) {
    let (tx, rx) = oneshot::channel::<()>();
    let listener = TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], 0)))
        .await
        .expect("failed to bind gateway");
    let addr = listener.local_addr().unwrap();
    let gateway = Arc::new(Gateway::new(config).expect("gateway must build"));

    tokio::spawn(cors_gateway::serve(listener, gateway, async {
        let _ = rx.await;
    }));

    (addr, tx)
}

/// Generates a self-signed certificate for `localhost` and `127.0.0.1`.
pub fn generate_test_cert() -> (
    rustls::pki_types::CertificateDer<'static>,
    rustls::pki_types::PrivateKeyDer<'static>,
) {
    let subject_alt_names = vec!["localhost".into(), "127.0.0.1".into()];
    let certified = rcgen::generate_simple_self_signed(subject_alt_names).unwrap();
    let cert = certified.cert.der().clone();
    let key = rustls::pki_types::PrivateKeyDer::Pkcs8(certified.key_pair.serialize_der().into());
    (cert, key)
}

/// Starts a TLS-enabled backend with a freshly generated self-signed
/// certificate, responding to every request with `body`.
pub async fn start_tls_backend(body: &'static str) -> (SocketAddr, oneshot::Sender<()>) {
    let (tx, rx) = oneshot::channel::<()>();
    let (cert, key) = generate_test_cert();

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let server_config = rustls::ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .unwrap()
        .with_no_client_auth()
        .with_single_cert(vec![cert], key)
        .unwrap();
    let tls_acceptor = tokio_rustls::TlsAcceptor::from(Arc::new(server_config));

    let listener = TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], 0)))
        .await
        .expect("failed to bind TLS test backend");
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        let mut shutdown = std::pin::pin!(async {
            let _ = rx.await;
        });

        loop {
            tokio::select! {
                result = listener.accept() => {
                    let (stream, _) = result.expect("accept failed");
                    let tls_acceptor = tls_acceptor.clone();
                    tokio::spawn(async move {
                        let Ok(tls_stream) = tls_acceptor.accept(stream).await else {
                            return;
                        };
                        let service = service_fn(move |_req: Request<Incoming>| async move {
                            Ok::<_, Infallible>(respond(StatusCode::OK, "text/plain", body))
                        });
                        let _ = http1::Builder::new()
                            .serve_connection(TokioIo::new(tls_stream), service)
                            .await;
                    });
                }
                () = &mut shutdown => break,
            }
        }
    });

    (addr, tx)
}
