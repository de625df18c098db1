//! HTTP CONNECT tunnel handler.
//!
//! Handles `CONNECT host:port HTTP/1.1` requests by:
//! 1. Running the authentication gate
//! 2. Acquiring a circuit for the request's sticky-session token
//! 3. Dialing `host:port` through the circuit's SOCKS port
//! 4. Returning `200 Connection established`
//! 5. Relaying bytes in both directions until either side closes
//!
//! The proxy never terminates TLS; it just passes encrypted bytes through.
//! A client that disconnects while the circuit is acquired or dialed
//! cancels the tunnel, and the circuit is released at once.

use crate::audit::{self, ProxyMode};
use crate::error::Result;
use crate::http::{self, send_status, RequestHead};
use crate::pool::CircuitLease;
use crate::server::ProxyState;
use crate::socks::CircuitStream;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tracing::debug;

const ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection established\r\n\r\n";

/// Client bytes held back while the tunnel is being opened.
const MAX_EARLY_DATA: usize = 64 * 1024;

/// Handle an HTTP CONNECT request.
///
/// `reader` may already hold bytes the client sent after the request head;
/// they are delivered into the tunnel before anything else.
pub(crate) async fn handle_connect(
    head: RequestHead,
    mut reader: BufReader<OwnedReadHalf>,
    mut writer: OwnedWriteHalf,
    state: &ProxyState,
) -> Result<()> {
    if !state.auth.admit(&head, &mut writer).await? {
        return Ok(());
    }

    let (host, port) = match http::parse_connect_target(&head.target) {
        Ok(target) => target,
        Err(e) => {
            audit::log_denied(&head.method, &head.target, &e.to_string());
            send_status(&mut writer, 400, &[], &format!("{}\n", e)).await?;
            return Err(e);
        }
    };
    debug!("CONNECT request to {}:{}", host, port);

    let inbound = state.headers.extract_inbound(head.header_pairs());
    let token = inbound.session_token.as_deref();

    let mut pending = Vec::new();
    let opened = tokio::select! {
        result = open_tunnel(state, token, &host, port, &mut writer) => result?,
        () = http::hold_until_closed(&mut reader, &mut pending, MAX_EARLY_DATA) => {
            debug!("Client closed before tunnel to {}:{} opened", host, port);
            return Ok(());
        }
    };
    let Some((lease, upstream)) = opened else {
        return Ok(());
    };
    let circuit = lease.circuit();

    writer.write_all(ESTABLISHED).await?;
    writer.flush().await?;
    audit::log_allowed(ProxyMode::Connect, &host, port, circuit.id, 200);

    let (mut up_read, mut up_write) = tokio::io::split(upstream);
    if !pending.is_empty() {
        up_write.write_all(&pending).await?;
    }

    // The first direction to finish ends the tunnel.
    let (side, result) = tokio::select! {
        r = tokio::io::copy_buf(&mut reader, &mut up_write) => ("client", r),
        r = tokio::io::copy(&mut up_read, &mut writer) => ("upstream", r),
    };
    debug!(
        "CONNECT tunnel to {}:{} on circuit {} closed by {} side: {:?}",
        host, port, circuit.id, side, result
    );

    let _ = writer.shutdown().await;
    drop(up_read);
    drop(up_write);
    drop(lease);
    Ok(())
}

/// Acquire a circuit and dial `host:port` through it.
///
/// Writes the failure status to the client itself; `None` means the pool
/// was exhausted and the 503 has been sent.
async fn open_tunnel(
    state: &ProxyState,
    token: Option<&str>,
    host: &str,
    port: u16,
    writer: &mut OwnedWriteHalf,
) -> Result<Option<(CircuitLease, CircuitStream)>> {
    let Some(lease) = state.acquire_circuit(token, writer).await? else {
        return Ok(None);
    };
    let circuit = lease.circuit();

    match state.dialer.connect(circuit, host, port).await {
        Ok(stream) => Ok(Some((lease, stream))),
        Err(e) => {
            audit::log_failed(ProxyMode::Connect, host, port, circuit.id, &e.to_string());
            let (status, _) = e.status();
            send_status(writer, status, &[], &format!("{}\n", e)).await?;
            Err(e)
        }
    }
}
