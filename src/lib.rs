//!
//! A CORS-bypassing HTTP gateway with SSRF protection, built on [Hyper].
//!
//! Browsers call `/proxy/[_<duration>/]<target>` and the gateway fetches the
//! target on their behalf, adding permissive CORS and caching headers to the
//! response. Every hop (including redirects and the addresses a hostname
//! resolves to) is checked against a blacklist of private and reserved ranges
//! and an optional domain allow-list before a connection is opened.
//!
//! [Hyper]: https://hyper.rs/

pub mod admission;
pub mod auth;
pub mod config;
pub mod connector;
pub mod dispatch;
pub mod duration;
pub mod error;
pub mod headers;
pub mod proxy;
pub mod server;
pub mod target;
pub mod tls;

pub use config::{Config, RuntimeConfig};
pub use error::ProxyError;
pub use proxy::{BoxBody, Gateway, handle_request};
pub use server::{serve, shutdown_signal};

/// Result type used throughout the gateway.
pub type Result<T> = std::result::Result<T, ProxyError>;
