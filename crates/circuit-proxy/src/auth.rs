//! Proxy authentication gate.
//!
//! The gate runs before any circuit is touched, identically for plain
//! requests and CONNECT. Without an [`Authenticator`] every request passes.
//! A refused request gets a `407` challenge; a failing policy gets a `500`
//! carrying the failure detail.

use crate::audit;
use crate::error::{AuthError, Result};
use crate::http::{send_status, RequestHead};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use std::sync::Arc;
use subtle::ConstantTimeEq;
use tokio::io::AsyncWrite;
use tracing::{debug, warn};
use zeroize::Zeroizing;

/// Authorization policy consulted once per exchange.
#[async_trait]
pub trait Authenticator: Send + Sync {
    /// Decide whether the request may use the proxy.
    ///
    /// `Ok(false)` refuses the request; `Err` means the check itself failed.
    async fn authenticate(&self, request: &RequestHead) -> std::result::Result<bool, AuthError>;
}

/// Basic proxy authentication against a single configured account.
pub struct BasicAuthenticator {
    username: String,
    password: Zeroizing<String>,
}

impl BasicAuthenticator {
    #[must_use]
    pub fn new(username: &str, password: &str) -> Self {
        Self {
            username: username.to_string(),
            password: Zeroizing::new(password.to_string()),
        }
    }
}

impl std::fmt::Debug for BasicAuthenticator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BasicAuthenticator")
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Authenticator for BasicAuthenticator {
    async fn authenticate(&self, request: &RequestHead) -> std::result::Result<bool, AuthError> {
        let Some(value) = request.header("proxy-authorization") else {
            debug!("Missing Proxy-Authorization header");
            return Ok(false);
        };
        let Some((user, pass)) = decode_basic_credentials(value) else {
            warn!("Malformed Basic proxy credentials");
            return Ok(false);
        };
        // Evaluate both comparisons so timing does not reveal which failed.
        let user_ok = constant_time_eq(user.as_bytes(), self.username.as_bytes());
        let pass_ok = constant_time_eq(pass.as_bytes(), self.password.as_bytes());
        if user_ok & pass_ok {
            Ok(true)
        } else {
            warn!("Invalid proxy credentials for user {:?}", user);
            Ok(false)
        }
    }
}

/// Decode a `Basic base64(user:pass)` header value.
///
/// The scheme name is matched case-insensitively (RFC 7617).
fn decode_basic_credentials(value: &str) -> Option<(String, Zeroizing<String>)> {
    let (scheme, encoded) = value.trim().split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("basic") {
        return None;
    }
    let decoded = Zeroizing::new(STANDARD.decode(encoded.trim()).ok()?);
    let decoded_str = std::str::from_utf8(&decoded).ok()?;
    let (user, pass) = decoded_str.split_once(':')?;
    Some((user.to_string(), Zeroizing::new(pass.to_string())))
}

/// Constant-time comparison of two byte strings.
#[must_use]
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.ct_eq(b).into()
}

/// Optional authentication step shared by both traffic paths.
#[derive(Clone)]
pub struct AuthGate {
    authenticator: Option<Arc<dyn Authenticator>>,
    realm: String,
}

impl std::fmt::Debug for AuthGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthGate")
            .field("enabled", &self.authenticator.is_some())
            .field("realm", &self.realm)
            .finish()
    }
}

impl AuthGate {
    /// Gate that admits everything.
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            authenticator: None,
            realm: crate::config::default_realm(),
        }
    }

    /// Gate that consults `authenticator` and challenges with `realm`.
    #[must_use]
    pub fn new(authenticator: Arc<dyn Authenticator>, realm: &str) -> Self {
        Self {
            authenticator: Some(authenticator),
            realm: realm.to_string(),
        }
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.authenticator.is_some()
    }

    /// Run the policy for `request`.
    ///
    /// Returns `true` when the exchange may continue. Otherwise the `407`
    /// or `500` response has already been written and the exchange ends.
    /// The caller must not read from the client while this runs.
    pub async fn admit<W>(&self, request: &RequestHead, writer: &mut W) -> Result<bool>
    where
        W: AsyncWrite + Unpin,
    {
        let Some(ref authenticator) = self.authenticator else {
            return Ok(true);
        };

        debug!(
            "authenticating request \"{} {}\"",
            request.method, request.target
        );
        match authenticator.authenticate(request).await {
            Ok(true) => Ok(true),
            Ok(false) => {
                let reason = "proxy authentication required";
                audit::log_denied(&request.method, &request.target, reason);
                let challenge = format!("Basic realm=\"{}\"", self.realm);
                send_status(writer, 407, &[("Proxy-Authenticate", challenge.as_str())], "").await?;
                Ok(false)
            }
            Err(e) => {
                warn!("Authentication check failed: {}", e);
                send_status(writer, 500, &[], &format!("{}\n", e)).await?;
                Ok(false)
            }
        }
    }
}
