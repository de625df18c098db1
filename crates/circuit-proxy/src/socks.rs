//! Outbound connections through a circuit's local SOCKS5 port.
//!
//! Name resolution happens on the far side of the circuit, so a target that
//! does not resolve comes back as a SOCKS "host unreachable" reply. That
//! reply is reported as [`ProxyError::NameNotFound`].

use crate::error::{ProxyError, Result};
use crate::pool::Circuit;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_socks::tcp::Socks5Stream;
use tracing::debug;

/// Stream to a target host, tunnelled through one circuit.
pub type CircuitStream = Socks5Stream<TcpStream>;

/// Opens SOCKS5 connections through pool circuits.
#[derive(Debug, Clone)]
pub struct CircuitDialer {
    socks_host: String,
    timeout: Duration,
}

impl CircuitDialer {
    #[must_use]
    pub fn new(socks_host: &str, timeout: Duration) -> Self {
        Self {
            socks_host: socks_host.to_string(),
            timeout,
        }
    }

    /// Connect to `host:port` through `circuit`, bounded by the dial timeout.
    pub async fn connect(&self, circuit: Circuit, host: &str, port: u16) -> Result<CircuitStream> {
        debug!(
            "Dialing {}:{} via circuit {} ({}:{})",
            host, port, circuit.id, self.socks_host, circuit.socks_port
        );
        let dial = Socks5Stream::connect(
            (self.socks_host.as_str(), circuit.socks_port),
            (host, port),
        );
        match tokio::time::timeout(self.timeout, dial).await {
            Ok(Ok(stream)) => Ok(stream),
            Ok(Err(e)) => Err(classify_socks_error(host, e)),
            Err(_) => Err(ProxyError::UpstreamConnect {
                host: host.to_string(),
                reason: format!("SOCKS dial timed out after {:?}", self.timeout),
            }),
        }
    }
}

/// Map a SOCKS failure onto the proxy's error taxonomy.
fn classify_socks_error(host: &str, error: tokio_socks::Error) -> ProxyError {
    match error {
        tokio_socks::Error::HostUnreachable => ProxyError::NameNotFound {
            host: host.to_string(),
        },
        other => ProxyError::UpstreamConnect {
            host: host.to_string(),
            reason: other.to_string(),
        },
    }
}
