//! Proxy server: TCP listener, connection dispatch, and lifecycle.
//!
//! The server accepts TCP connections, reads the request head, and
//! dispatches on the method:
//!
//! CONNECT method -> [`connect`] handler (tunnel through a circuit)
//! Other methods  -> [`forward`] handler (plain HTTP relay through a circuit)
//!
//! Every connection carries exactly one exchange and is closed afterwards.

use crate::auth::{AuthGate, Authenticator, BasicAuthenticator};
use crate::config::ProxyConfig;
use crate::connect;
use crate::control::ControlClient;
use crate::error::{ProxyError, Result};
use crate::forward;
use crate::headers::HeaderProcessor;
use crate::http::{self, send_status};
use crate::pool::{CircuitLease, CircuitPool};
use crate::socks::CircuitDialer;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::io::BufReader;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Handle returned when the proxy server starts.
///
/// Drop the handle or call [`shutdown`](Self::shutdown) to stop accepting.
pub struct ProxyHandle {
    /// The actual port the proxy is listening on
    pub port: u16,
    pool: Arc<CircuitPool>,
    shutdown_tx: watch::Sender<bool>,
}

impl ProxyHandle {
    /// Signal the proxy to shut down gracefully.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// The circuit pool shared by all exchanges.
    #[must_use]
    pub fn pool(&self) -> Arc<CircuitPool> {
        Arc::clone(&self.pool)
    }
}

/// Shared state for the proxy server.
pub(crate) struct ProxyState {
    pub(crate) pool: Arc<CircuitPool>,
    pub(crate) headers: HeaderProcessor,
    pub(crate) auth: AuthGate,
    pub(crate) dialer: CircuitDialer,
    /// Set when identity renewal on sticky rebind is enabled.
    pub(crate) control: Option<ControlClient>,
    max_connections: usize,
    /// Active connection count for connection limiting.
    active_connections: AtomicUsize,
}

impl ProxyState {
    fn new(config: &ProxyConfig, authenticator: Option<Arc<dyn Authenticator>>) -> Self {
        let auth = match (authenticator, &config.auth) {
            (Some(custom), auth_config) => {
                let realm = auth_config
                    .as_ref()
                    .map_or_else(crate::config::default_realm, |a| a.realm.clone());
                AuthGate::new(custom, &realm)
            }
            (None, Some(basic)) => AuthGate::new(
                Arc::new(BasicAuthenticator::new(&basic.username, &basic.password)),
                &basic.realm,
            ),
            (None, None) => AuthGate::disabled(),
        };

        let control = config
            .renew_on_rebind
            .then(|| ControlClient::new(&config.socks_host, config.control_password.clone()));

        Self {
            pool: Arc::new(CircuitPool::from_config(config)),
            headers: HeaderProcessor::new(&config.session_header),
            auth,
            dialer: CircuitDialer::new(&config.socks_host, config.dial_timeout()),
            control,
            max_connections: config.max_connections,
            active_connections: AtomicUsize::new(0),
        }
    }

    /// Acquire a circuit for `session_token`, renewing its identity first if
    /// it was just taken over from another session.
    ///
    /// On pool exhaustion the `503` is written here and `None` returned.
    pub(crate) async fn acquire_circuit<W>(
        &self,
        session_token: Option<&str>,
        writer: &mut W,
    ) -> Result<Option<CircuitLease>>
    where
        W: tokio::io::AsyncWrite + Unpin,
    {
        let lease = match self.pool.acquire(session_token).await {
            Ok(lease) => lease,
            Err(e @ ProxyError::PoolExhausted { .. }) => {
                warn!("{}", e);
                let (status, _) = e.status();
                send_status(writer, status, &[("Retry-After", "1")], "No free circuit\n").await?;
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        if lease.rebound() {
            if let Some(ref control) = self.control {
                let port = lease.circuit().control_port;
                if let Err(e) = control.new_identity(port).await {
                    warn!("Identity renewal for circuit {} failed: {}", lease.id(), e);
                }
            }
        }
        Ok(Some(lease))
    }
}

/// Start the proxy server with the authentication policy from `config`.
pub async fn start(config: ProxyConfig) -> Result<ProxyHandle> {
    start_with_authenticator(config, None).await
}

/// Start the proxy server with a custom authentication policy.
///
/// A supplied `authenticator` takes precedence over `config.auth`; the realm
/// still comes from `config.auth` when present.
///
/// Binds to `config.bind_addr:config.bind_port` (port 0 = OS-assigned) and
/// begins accepting connections. The server runs until the handle is
/// dropped or `shutdown()` is called.
pub async fn start_with_authenticator(
    config: ProxyConfig,
    authenticator: Option<Arc<dyn Authenticator>>,
) -> Result<ProxyHandle> {
    config.validate()?;

    let bind_addr = SocketAddr::new(config.bind_addr, config.bind_port);
    let listener = TcpListener::bind(bind_addr)
        .await
        .map_err(|e| ProxyError::Bind {
            addr: bind_addr.to_string(),
            source: e,
        })?;

    let local_addr = listener.local_addr().map_err(|e| ProxyError::Bind {
        addr: bind_addr.to_string(),
        source: e,
    })?;
    let port = local_addr.port();

    let state = Arc::new(ProxyState::new(&config, authenticator));
    info!(
        "Proxy server listening on {} ({} circuits from {}:{}, auth {})",
        local_addr,
        config.pool_size,
        config.socks_host,
        config.socks_base_port,
        if state.auth.is_enabled() { "on" } else { "off" }
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let pool = Arc::clone(&state.pool);

    tokio::spawn(accept_loop(listener, state, shutdown_rx));

    Ok(ProxyHandle {
        port,
        pool,
        shutdown_tx,
    })
}

/// One counted client connection. The count drops with the guard, even if
/// the handler panics.
struct ActiveConnection(Arc<ProxyState>);

impl ActiveConnection {
    fn open(state: &Arc<ProxyState>) -> Self {
        state.active_connections.fetch_add(1, Ordering::Relaxed);
        Self(Arc::clone(state))
    }
}

impl Drop for ActiveConnection {
    fn drop(&mut self) {
        self.0.active_connections.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Accept loop: listen for connections until shutdown.
async fn accept_loop(
    listener: TcpListener,
    state: Arc<ProxyState>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, addr)) => {
                        // Connection limit enforcement
                        let max = state.max_connections;
                        if max > 0 {
                            let current = state.active_connections.load(Ordering::Relaxed);
                            if current >= max {
                                warn!(
                                    "Connection limit reached ({}/{}), rejecting {}",
                                    current, max, addr
                                );
                                drop(stream);
                                continue;
                            }
                        }
                        let slot = ActiveConnection::open(&state);

                        debug!("Accepted connection from {}", addr);
                        let state = Arc::clone(&state);
                        tokio::spawn(async move {
                            let _slot = slot;
                            if let Err(e) = handle_connection(stream, &state).await {
                                debug!("Connection handler error: {}", e);
                            }
                        });
                    }
                    Err(e) => {
                        warn!("Accept error: {}", e);
                    }
                }
            }
            changed = shutdown_rx.changed() => {
                // A dropped handle counts as shutdown.
                if changed.is_err() || *shutdown_rx.borrow() {
                    info!("Proxy server shutting down");
                    return;
                }
            }
        }
    }
}

/// Handle a single client connection.
///
/// Reads the request head through a `BufReader` kept alive until the
/// handler is done with the read side, so bytes read ahead past the head
/// are never lost.
async fn handle_connection(stream: TcpStream, state: &ProxyState) -> Result<()> {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    let head = match http::read_request_head(&mut reader).await {
        Ok(Some(head)) => head,
        Ok(None) => return Ok(()), // Client disconnected
        Err(e) => {
            let (status, _) = e.status();
            send_status(&mut write_half, status, &[], "").await?;
            return Err(e);
        }
    };
    debug!("{} {} {}", head.method, head.target, head.version);

    if head.is_connect() {
        connect::handle_connect(head, reader, write_half, state).await
    } else {
        forward::handle_forward(head, reader, write_half, state).await
    }
}
