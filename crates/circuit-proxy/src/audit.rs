//! Audit logging for proxy exchanges.
//!
//! Logs every exchange outcome with structured fields via `tracing`.
//! Credentials, session tokens and bodies are never included.

use tracing::info;

/// Traffic path of an exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyMode {
    /// Plain HTTP request relayed through a circuit
    Forward,
    /// CONNECT tunnel spliced through a circuit
    Connect,
}

impl std::fmt::Display for ProxyMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProxyMode::Forward => write!(f, "forward"),
            ProxyMode::Connect => write!(f, "connect"),
        }
    }
}

/// Log an exchange refused before a circuit was acquired.
pub fn log_denied(method: &str, target: &str, reason: &str) {
    info!(
        target: "circuit_proxy::audit",
        method = method,
        target_uri = target,
        decision = "deny",
        reason = reason,
        "proxy request denied"
    );
}

/// Log an exchange that reached its upstream through a circuit.
pub fn log_allowed(mode: ProxyMode, host: &str, port: u16, circuit: usize, status: u16) {
    info!(
        target: "circuit_proxy::audit",
        mode = %mode,
        host = host,
        port = port,
        circuit = circuit,
        status = status,
        decision = "allow",
        "proxy request relayed"
    );
}

/// Log an exchange whose upstream leg failed.
pub fn log_failed(mode: ProxyMode, host: &str, port: u16, circuit: usize, reason: &str) {
    info!(
        target: "circuit_proxy::audit",
        mode = %mode,
        host = host,
        port = port,
        circuit = circuit,
        decision = "error",
        reason = reason,
        "proxy request failed"
    );
}
