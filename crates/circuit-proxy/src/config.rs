//! Proxy configuration types.
//!
//! Defines the listener settings, the circuit pool layout (how pool slots map
//! to local SOCKS and control ports), sticky-session behaviour, and the
//! optional basic-auth policy.

use crate::error::{ProxyError, Result};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::time::Duration;

/// Upper bound for the dial and acquire timeouts (one day).
pub const MAX_TIMEOUT_SECS: u64 = 24 * 60 * 60;

/// Name of the sticky-session request header.
pub const DEFAULT_SESSION_HEADER: &str = "X-Session";

/// Configuration for the proxy server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// Bind address (default: 0.0.0.0)
    #[serde(default = "default_bind_addr")]
    pub bind_addr: IpAddr,

    /// Bind port (0 = OS-assigned ephemeral port)
    #[serde(default = "default_bind_port")]
    pub bind_port: u16,

    /// Number of backend circuits in the pool.
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,

    /// Host the per-circuit SOCKS listeners are reachable on.
    #[serde(default = "default_socks_host")]
    pub socks_host: String,

    /// SOCKS port of circuit 0. Circuit `i` listens on `socks_base_port + i`.
    #[serde(default = "default_socks_base_port")]
    pub socks_base_port: u16,

    /// Control port of circuit 0. Circuit `i` listens on `control_base_port + i`.
    #[serde(default = "default_control_base_port")]
    pub control_base_port: u16,

    /// Password for the backend control ports.
    #[serde(default)]
    pub control_password: Option<String>,

    /// Request a fresh exit identity when a circuit's sticky token is
    /// replaced by a different one.
    #[serde(default)]
    pub renew_on_rebind: bool,

    /// SOCKS dial timeout in seconds.
    #[serde(default = "default_dial_timeout_secs")]
    pub dial_timeout_secs: u64,

    /// How long an exchange waits for a free circuit (0 = fail immediately).
    #[serde(default = "default_acquire_timeout_secs")]
    pub acquire_timeout_secs: u64,

    /// Idle time after which a circuit forgets its sticky token.
    /// `None` keeps affinities until another token overwrites them.
    #[serde(default)]
    pub sticky_ttl_secs: Option<u64>,

    /// Request header carrying the sticky-session token.
    #[serde(default = "default_session_header")]
    pub session_header: String,

    /// Basic proxy authentication. `None` = allow everything.
    #[serde(default)]
    pub auth: Option<BasicAuthConfig>,

    /// Maximum concurrent client connections (0 = unlimited).
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            bind_port: default_bind_port(),
            pool_size: default_pool_size(),
            socks_host: default_socks_host(),
            socks_base_port: default_socks_base_port(),
            control_base_port: default_control_base_port(),
            control_password: None,
            renew_on_rebind: false,
            dial_timeout_secs: default_dial_timeout_secs(),
            acquire_timeout_secs: default_acquire_timeout_secs(),
            sticky_ttl_secs: None,
            session_header: default_session_header(),
            auth: None,
            max_connections: default_max_connections(),
        }
    }
}

impl ProxyConfig {
    /// Check the pool layout and limits for values that cannot work.
    pub fn validate(&self) -> Result<()> {
        if self.pool_size == 0 {
            return Err(ProxyError::Config("pool_size must be at least 1".to_string()));
        }
        let last_offset = u16::try_from(self.pool_size - 1).map_err(|_| {
            ProxyError::Config(format!("pool_size {} is too large", self.pool_size))
        })?;
        for (name, base) in [
            ("socks_base_port", self.socks_base_port),
            ("control_base_port", self.control_base_port),
        ] {
            if base == 0 || base.checked_add(last_offset).is_none() {
                return Err(ProxyError::Config(format!(
                    "{} {} cannot address {} circuits",
                    name, base, self.pool_size
                )));
            }
        }
        if self.dial_timeout_secs == 0 {
            return Err(ProxyError::Config(
                "dial_timeout_secs must be positive".to_string(),
            ));
        }
        for (name, secs) in [
            ("dial_timeout_secs", self.dial_timeout_secs),
            ("acquire_timeout_secs", self.acquire_timeout_secs),
        ] {
            if secs > MAX_TIMEOUT_SECS {
                return Err(ProxyError::Config(format!(
                    "{} {} exceeds the {} second limit",
                    name, secs, MAX_TIMEOUT_SECS
                )));
            }
        }
        if self.session_header.trim().is_empty() {
            return Err(ProxyError::Config("session_header is empty".to_string()));
        }
        if let Some(ref auth) = self.auth {
            if auth.username.contains(':') {
                return Err(ProxyError::Config(
                    "auth username must not contain ':'".to_string(),
                ));
            }
        }
        Ok(())
    }

    #[must_use]
    pub fn dial_timeout(&self) -> Duration {
        Duration::from_secs(self.dial_timeout_secs)
    }

    #[must_use]
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_secs(self.acquire_timeout_secs)
    }

    #[must_use]
    pub fn sticky_ttl(&self) -> Option<Duration> {
        self.sticky_ttl_secs.map(Duration::from_secs)
    }
}

fn default_bind_addr() -> IpAddr {
    IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED)
}

fn default_bind_port() -> u16 {
    8080
}

fn default_pool_size() -> usize {
    100
}

fn default_socks_host() -> String {
    "127.0.0.1".to_string()
}

fn default_socks_base_port() -> u16 {
    17500
}

fn default_control_base_port() -> u16 {
    30320
}

fn default_dial_timeout_secs() -> u64 {
    60
}

fn default_acquire_timeout_secs() -> u64 {
    10
}

fn default_session_header() -> String {
    DEFAULT_SESSION_HEADER.to_string()
}

fn default_max_connections() -> usize {
    256
}

/// Credentials for the built-in basic proxy authentication.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BasicAuthConfig {
    pub username: String,
    pub password: String,

    /// Realm advertised in the `Proxy-Authenticate` challenge.
    #[serde(default = "default_realm")]
    pub realm: String,
}

pub(crate) fn default_realm() -> String {
    "proxy".to_string()
}
