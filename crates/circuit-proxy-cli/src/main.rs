//! circuit-proxy - forward HTTP proxy over a pool of sticky SOCKS circuits.

mod cli;

use circuit_proxy::config::BasicAuthConfig;
use circuit_proxy::{ProxyConfig, ProxyError};
use clap::Parser;
use cli::Cli;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Error, Debug)]
enum CliError {
    #[error("Failed to read config file {path}: {source}")]
    ReadConfig {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid config file {path}: {source}")]
    ParseConfig {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Invalid value {value:?} in environment variable `port`")]
    PortEnv { value: String },

    #[error("Failed to start runtime: {0}")]
    Runtime(#[source] std::io::Error),

    #[error(transparent)]
    Proxy(#[from] ProxyError),
}

type Result<T> = std::result::Result<T, CliError>;

fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    if let Err(e) = run(cli) {
        error!("{}", e);
        eprintln!("circuit-proxy: {}", e);
        std::process::exit(1);
    }
}

fn init_logging(verbose: u8) {
    let filter = match verbose {
        0 => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        1 => EnvFilter::new("debug"),
        _ => EnvFilter::new("trace"),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

fn run(cli: Cli) -> Result<()> {
    let config = build_config(cli)?;
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(CliError::Runtime)?;
    runtime.block_on(serve(config))
}

async fn serve(config: ProxyConfig) -> Result<()> {
    let handle = circuit_proxy::start(config).await?;
    info!("circuit-proxy ready on port {}", handle.port);

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
    }
    handle.shutdown();
    Ok(())
}

/// Layer flags and environment over the config file (or defaults).
fn build_config(cli: Cli) -> Result<ProxyConfig> {
    let mut config = match cli.config {
        Some(ref path) => load_config(path)?,
        None => ProxyConfig::default(),
    };

    if let Some(bind) = cli.bind {
        config.bind_addr = bind;
    }
    match cli.port {
        Some(port) => config.bind_port = port,
        None => {
            if let Ok(value) = std::env::var("port") {
                config.bind_port = value
                    .trim()
                    .parse()
                    .map_err(|_| CliError::PortEnv { value })?;
            }
        }
    }
    if let Some(size) = cli.pool_size {
        config.pool_size = size;
    }
    if let Some(host) = cli.socks_host {
        config.socks_host = host;
    }
    if let Some(port) = cli.socks_base_port {
        config.socks_base_port = port;
    }
    if let Some(port) = cli.control_base_port {
        config.control_base_port = port;
    }
    if cli.control_password.is_some() {
        config.control_password = cli.control_password;
    }
    if cli.renew_on_rebind {
        config.renew_on_rebind = true;
    }
    if let Some(secs) = cli.dial_timeout {
        config.dial_timeout_secs = secs;
    }
    if let Some(secs) = cli.acquire_timeout {
        config.acquire_timeout_secs = secs;
    }
    if cli.sticky_ttl.is_some() {
        config.sticky_ttl_secs = cli.sticky_ttl;
    }
    if let Some(header) = cli.session_header {
        config.session_header = header;
    }
    if let (Some(username), Some(password)) = (cli.auth_user, cli.auth_password) {
        let realm = config
            .auth
            .as_ref()
            .map_or_else(|| "proxy".to_string(), |a| a.realm.clone());
        config.auth = Some(BasicAuthConfig {
            username,
            password,
            realm,
        });
    }
    if let (Some(realm), Some(auth)) = (cli.realm, config.auth.as_mut()) {
        auth.realm = realm;
    }
    if let Some(max) = cli.max_connections {
        config.max_connections = max;
    }

    Ok(config)
}

fn load_config(path: &Path) -> Result<ProxyConfig> {
    let raw = std::fs::read_to_string(path).map_err(|source| CliError::ReadConfig {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&raw).map_err(|source| CliError::ParseConfig {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        let mut full = vec!["circuit-proxy"];
        full.extend_from_slice(args);
        Cli::try_parse_from(full).unwrap()
    }

    #[test]
    fn test_flags_override_defaults() {
        let config = build_config(parse(&[
            "--port",
            "9000",
            "--pool-size",
            "8",
            "--sticky-ttl",
            "600",
            "--auth-user",
            "alice",
            "--auth-password",
            "pw",
            "--realm",
            "circuits",
        ]))
        .unwrap();
        assert_eq!(config.bind_port, 9000);
        assert_eq!(config.pool_size, 8);
        assert_eq!(config.sticky_ttl_secs, Some(600));
        let auth = config.auth.unwrap();
        assert_eq!(auth.username, "alice");
        assert_eq!(auth.realm, "circuits");
        assert_eq!(config.socks_base_port, ProxyConfig::default().socks_base_port);
    }

    #[test]
    fn test_config_file_then_flags() {
        let dir = std::env::temp_dir().join(format!("circuit-proxy-cli-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("config.json");
        std::fs::write(
            &path,
            r#"{"pool_size": 3, "socks_base_port": 9050, "session_header": "X-Circuit"}"#,
        )
        .unwrap();

        let path_str = path.to_str().unwrap();
        let config = build_config(parse(&["--config", path_str, "--pool-size", "5"])).unwrap();
        assert_eq!(config.pool_size, 5);
        assert_eq!(config.socks_base_port, 9050);
        assert_eq!(config.session_header, "X-Circuit");

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_invalid_config_file() {
        let dir = std::env::temp_dir().join(format!("circuit-proxy-bad-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("config.json");
        std::fs::write(&path, "{ not json").unwrap();

        let err = build_config(parse(&["--config", path.to_str().unwrap()])).unwrap_err();
        assert!(matches!(err, CliError::ParseConfig { .. }));

        std::fs::remove_dir_all(&dir).unwrap();
    }
}
