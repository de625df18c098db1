//! Plain HTTP forward-proxy handler.
//!
//! Handles absolute-form requests (`GET http://host/path HTTP/1.1`):
//! the request is sanitized, sent over a fresh HTTP/1.1 connection through
//! an acquired circuit, and the upstream response is streamed back.
//!
//! Once the upstream response head has been written to the client no
//! further status can be sent; later failures just drop the connection.
//! If the client goes away first, the upstream exchange is cancelled.

use crate::audit::{self, ProxyMode};
use crate::error::{ProxyError, Result};
use crate::headers::HeaderSet;
use crate::http::{self, send_status, RequestHead};
use crate::pool::Circuit;
use crate::server::ProxyState;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::client::conn::http1;
use hyper::{Method, Request, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::task::JoinHandle;
use tracing::debug;
use url::Url;

const UNSUPPORTED_SCHEME_BODY: &str = "Only \"http:\" protocol prefix is supported\n";

/// Upstream target of a plain request.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Target {
    host: String,
    port: u16,
}

/// Handle a non-CONNECT request.
pub(crate) async fn handle_forward(
    head: RequestHead,
    mut reader: BufReader<OwnedReadHalf>,
    mut writer: OwnedWriteHalf,
    state: &ProxyState,
) -> Result<()> {
    if !state.auth.admit(&head, &mut writer).await? {
        return Ok(());
    }

    let (target, url) = match parse_target(&head.target) {
        Ok(parsed) => parsed,
        Err(e) => {
            audit::log_denied(&head.method, &head.target, &e.to_string());
            let body = if matches!(e, ProxyError::UnsupportedScheme { .. }) {
                UNSUPPORTED_SCHEME_BODY.to_string()
            } else {
                format!("{}\n", e)
            };
            send_status(&mut writer, 400, &[], &body).await?;
            return Err(e);
        }
    };

    let inbound = state.headers.extract_inbound(head.header_pairs());
    let request = match http::read_body(&mut reader, &head)
        .await
        .and_then(|body| build_upstream_request(&head, &url, inbound.headers, body))
    {
        Ok(request) => request,
        Err(e) => {
            audit::log_denied(&head.method, &head.target, &e.to_string());
            let (status, _) = e.status();
            send_status(&mut writer, status, &[], &format!("{}\n", e)).await?;
            return Err(e);
        }
    };

    let token = inbound.session_token.as_deref();
    let acquired = tokio::select! {
        result = state.acquire_circuit(token, &mut writer) => result?,
        () = http::client_closed(&mut reader) => {
            debug!("Client closed while waiting for a circuit to {}", target.host);
            return Ok(());
        }
    };
    let Some(lease) = acquired else {
        return Ok(());
    };
    let circuit = lease.circuit();

    let mut got_response = false;
    let outcome = tokio::select! {
        result = relay(state, circuit, &target, request, &mut writer, &mut got_response) => {
            Some(result)
        }
        () = http::client_closed(&mut reader) => None,
    };

    let result = match outcome {
        Some(Ok(status)) => {
            audit::log_allowed(ProxyMode::Forward, &target.host, target.port, circuit.id, status);
            Ok(())
        }
        Some(Err(e)) => {
            let reason = e.to_string();
            audit::log_failed(ProxyMode::Forward, &target.host, target.port, circuit.id, &reason);
            if !got_response {
                let (status, _) = e.status();
                send_status(&mut writer, status, &[], &format!("{}\n", e)).await?;
            }
            Err(e)
        }
        None => {
            debug!(
                "Client closed before {}:{} finished; upstream cancelled",
                target.host, target.port
            );
            audit::log_failed(
                ProxyMode::Forward,
                &target.host,
                target.port,
                circuit.id,
                "client aborted",
            );
            Ok(())
        }
    };

    drop(lease);
    result
}

/// Parse an absolute `http://` request target.
fn parse_target(raw: &str) -> Result<(Target, Url)> {
    let url = Url::parse(raw)
        .map_err(|e| ProxyError::HttpParse(format!("invalid request target {}: {}", raw, e)))?;
    if url.scheme() != "http" {
        return Err(ProxyError::UnsupportedScheme {
            scheme: url.scheme().to_string(),
        });
    }
    let host = match url.host() {
        Some(url::Host::Domain(domain)) => domain.to_string(),
        Some(url::Host::Ipv4(addr)) => addr.to_string(),
        Some(url::Host::Ipv6(addr)) => addr.to_string(),
        None => {
            return Err(ProxyError::HttpParse(format!(
                "missing host in request target: {}",
                raw
            )))
        }
    };
    let port = url.port_or_known_default().unwrap_or(80);
    Ok((Target { host, port }, url))
}

/// Build the origin-form request sent through the circuit.
///
/// The body has already been read and de-chunked, so it always goes out
/// with a `Content-Length`.
fn build_upstream_request(
    head: &RequestHead,
    url: &Url,
    mut headers: HeaderSet,
    body: Vec<u8>,
) -> Result<Request<Full<Bytes>>> {
    let method = Method::from_bytes(head.method.as_bytes())
        .map_err(|_| ProxyError::HttpParse(format!("invalid method: {}", head.method)))?;

    let had_length = headers.contains("content-length");
    headers.remove("content-length");
    if !body.is_empty() || had_length {
        headers.append("Content-Length", &body.len().to_string());
    }
    if !headers.contains("host") {
        let authority = match (url.host_str(), url.port()) {
            (Some(host), Some(port)) => format!("{}:{}", host, port),
            (Some(host), None) => host.to_string(),
            (None, _) => String::new(),
        };
        headers.append("Host", &authority);
    }
    headers.append("Connection", "close");

    let path_and_query = &url[url::Position::BeforePath..url::Position::AfterQuery];
    let mut builder = Request::builder().method(method).uri(path_and_query);
    for (name, value) in headers.iter() {
        builder = builder.header(name, value);
    }
    builder
        .body(Full::new(Bytes::from(body)))
        .map_err(|e| ProxyError::HttpParse(format!("invalid request: {}", e)))
}

/// Aborts the HTTP connection driver when the exchange is dropped.
struct ConnectionTask(JoinHandle<()>);

impl Drop for ConnectionTask {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Send `request` through `circuit` and stream the response to `writer`.
///
/// Sets `got_response` as soon as the response head has been written.
/// Returns the upstream status code.
async fn relay<W>(
    state: &ProxyState,
    circuit: Circuit,
    target: &Target,
    request: Request<Full<Bytes>>,
    writer: &mut W,
    got_response: &mut bool,
) -> Result<u16>
where
    W: AsyncWrite + Unpin,
{
    let upstream_err = |e: hyper::Error| ProxyError::UpstreamConnect {
        host: target.host.clone(),
        reason: e.to_string(),
    };

    let stream = state.dialer.connect(circuit, &target.host, target.port).await?;
    let (mut sender, conn) = http1::Builder::new()
        .title_case_headers(true)
        .handshake(TokioIo::new(stream))
        .await
        .map_err(upstream_err)?;
    let _conn = ConnectionTask(tokio::spawn(async move {
        if let Err(e) = conn.await {
            debug!("Upstream connection error: {}", e);
        }
    }));

    let method = request.method().clone();
    let response = sender.send_request(request).await.map_err(upstream_err)?;
    let status = response.status();
    let reason = response
        .extensions()
        .get::<hyper::ext::ReasonPhrase>()
        .and_then(|r| std::str::from_utf8(r.as_bytes()).ok())
        .map(str::to_string)
        .unwrap_or_else(|| http::reason_phrase(status.as_u16()).to_string());

    let mut headers = state.headers.filter_header_map(response.headers());
    let bodyless = response_has_no_body(&method, status);
    let chunked = !bodyless && !headers.contains("content-length");
    if chunked {
        headers.append("Transfer-Encoding", "chunked");
    }
    headers.append("Connection", "close");

    http::write_response_head(writer, status.as_u16(), &reason, &headers).await?;
    *got_response = true;

    if !bodyless {
        let mut body = response.into_body();
        while let Some(frame) = body.frame().await {
            let frame = frame.map_err(upstream_err)?;
            let Ok(data) = frame.into_data() else {
                // Trailers are not relayed.
                continue;
            };
            if chunked {
                http::write_chunk(writer, &data).await?;
            } else {
                writer.write_all(&data).await?;
            }
        }
        if chunked {
            http::finish_chunks(writer).await?;
        }
    }
    writer.flush().await?;
    Ok(status.as_u16())
}

/// Responses that never carry a body, whatever their headers say.
fn response_has_no_body(method: &Method, status: StatusCode) -> bool {
    method == Method::HEAD
        || status.is_informational()
        || status == StatusCode::NO_CONTENT
        || status == StatusCode::NOT_MODIFIED
}
