//! Backend control-port client.
//!
//! Each circuit's anonymizing backend exposes a text control protocol on its
//! control port. The proxy only uses it to request a fresh exit identity
//! (`SIGNAL NEWNYM`) when a circuit is handed to a different sticky session.

use crate::error::{ProxyError, Result};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tracing::{debug, info};

/// Upper bound for one control conversation.
const CONTROL_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct ControlClient {
    host: String,
    password: Option<String>,
}

impl ControlClient {
    #[must_use]
    pub fn new(host: &str, password: Option<String>) -> Self {
        Self {
            host: host.to_string(),
            password,
        }
    }

    /// Ask the backend on `port` to switch to new circuits for new streams.
    pub async fn new_identity(&self, port: u16) -> Result<()> {
        tokio::time::timeout(CONTROL_TIMEOUT, self.signal_newnym(port))
            .await
            .map_err(|_| ProxyError::Control {
                port,
                reason: "control port timed out".to_string(),
            })?
    }

    async fn signal_newnym(&self, port: u16) -> Result<()> {
        let stream = TcpStream::connect((self.host.as_str(), port))
            .await
            .map_err(|e| ProxyError::Control {
                port,
                reason: e.to_string(),
            })?;
        let mut stream = BufReader::new(stream);

        let auth_cmd = self.password.as_ref().map_or_else(
            || "AUTHENTICATE\r\n".to_string(),
            |pw| format!("AUTHENTICATE \"{}\"\r\n", escape_quoted(pw)),
        );
        command(&mut stream, port, &auth_cmd).await?;
        debug!("Control port {}: authenticated", port);

        command(&mut stream, port, "SIGNAL NEWNYM\r\n").await?;
        // Best effort; the backend closes the connection either way.
        let _ = stream.get_mut().write_all(b"QUIT\r\n").await;

        info!(control_port = port, "Requested new backend identity");
        Ok(())
    }
}

/// Send one command and require a `250` reply.
async fn command(stream: &mut BufReader<TcpStream>, port: u16, cmd: &str) -> Result<()> {
    let io_err = |e: std::io::Error| ProxyError::Control {
        port,
        reason: e.to_string(),
    };
    stream.get_mut().write_all(cmd.as_bytes()).await.map_err(io_err)?;
    stream.get_mut().flush().await.map_err(io_err)?;

    let mut response = String::new();
    stream.read_line(&mut response).await.map_err(io_err)?;
    if response.starts_with("250") {
        Ok(())
    } else {
        let verb = cmd.split_whitespace().next().unwrap_or("command");
        Err(ProxyError::Control {
            port,
            reason: format!("{} rejected: {}", verb, response.trim()),
        })
    }
}

fn escape_quoted(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;
    use tokio::sync::mpsc;

    /// Fake control port that records every command line it receives.
    async fn fake_control(auth_reply: &'static str) -> (u16, mpsc::UnboundedReceiver<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut stream = BufReader::new(stream);
            let mut first = true;
            loop {
                let mut line = String::new();
                if stream.read_line(&mut line).await.unwrap_or(0) == 0 {
                    return;
                }
                let _ = tx.send(line.trim_end().to_string());
                let reply = if first { auth_reply } else { "250 OK\r\n" };
                first = false;
                if stream.get_mut().write_all(reply.as_bytes()).await.is_err() {
                    return;
                }
            }
        });
        (port, rx)
    }

    #[tokio::test]
    async fn test_new_identity_sends_authenticate_and_newnym() {
        let (port, mut rx) = fake_control("250 OK\r\n").await;
        let client = ControlClient::new("127.0.0.1", Some("pa\"ss".to_string()));
        client.new_identity(port).await.unwrap();

        assert_eq!(rx.recv().await.unwrap(), "AUTHENTICATE \"pa\\\"ss\"");
        assert_eq!(rx.recv().await.unwrap(), "SIGNAL NEWNYM");
    }

    #[tokio::test]
    async fn test_new_identity_without_password() {
        let (port, mut rx) = fake_control("250 OK\r\n").await;
        let client = ControlClient::new("127.0.0.1", None);
        client.new_identity(port).await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), "AUTHENTICATE");
    }

    #[tokio::test]
    async fn test_rejected_authentication() {
        let (port, _rx) = fake_control("515 Authentication failed\r\n").await;
        let client = ControlClient::new("127.0.0.1", Some("wrong".to_string()));
        let err = client.new_identity(port).await.unwrap_err();
        match err {
            ProxyError::Control { reason, .. } => assert!(reason.contains("515")),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_control_port_down() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        let client = ControlClient::new("127.0.0.1", None);
        assert!(client.new_identity(port).await.is_err());
    }
}
