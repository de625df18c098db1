//! Forward HTTP proxy over a pool of sticky SOCKS circuits.
//!
//! `circuit-proxy` accepts plain HTTP proxy requests and CONNECT tunnels and
//! sends each one out through one of a fixed set of local SOCKS5 ports, each
//! fronting an anonymizing backend circuit:
//!
//! 1. **Plain HTTP** (`forward`) - absolute-form `http://` requests are
//!    sanitized and relayed through a circuit; the response streams back.
//!
//! 2. **CONNECT tunnel** (`connect`) - the proxy dials `host:port` through a
//!    circuit, answers `200 Connection established`, and splices the two
//!    sockets. TLS is never terminated.
//!
//! Clients pin themselves to a circuit by sending a session token in the
//! `X-Session` header (configurable). Requests without a token take the
//! least-recently-used free circuit. The token header and all hop-by-hop
//! headers are stripped before anything leaves the proxy.

pub mod audit;
pub mod auth;
pub mod config;
mod connect;
pub mod control;
pub mod error;
mod forward;
pub mod headers;
pub mod http;
pub mod pool;
pub mod server;
pub mod socks;

pub use auth::{AuthGate, Authenticator, BasicAuthenticator};
pub use config::ProxyConfig;
pub use error::{AuthError, ProxyError, Result};
pub use headers::HeaderProcessor;
pub use pool::{CircuitLease, CircuitPool};
pub use server::{start, start_with_authenticator, ProxyHandle};
