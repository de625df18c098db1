//! CLI argument definitions.

use clap::Parser;
use std::net::IpAddr;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "circuit-proxy")]
#[command(author, version, about, long_about = None)]
#[command(after_help = "EXAMPLES:
    # 100 circuits on SOCKS ports 17500-17599, proxy on :8080
    circuit-proxy

    # Small pool, require proxy credentials
    circuit-proxy --pool-size 10 --auth-user alice --auth-password s3cret

    # Pin requests to a circuit from the client side
    curl -x http://127.0.0.1:8080 -H 'X-Session: job-42' http://example.com/
")]
pub struct Cli {
    /// JSON configuration file. Flags override values from the file.
    #[arg(long, short = 'c', value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Address to listen on
    #[arg(long, value_name = "ADDR", env = "BIND_ADDR")]
    pub bind: Option<IpAddr>,

    /// Port to listen on (also read from lowercase `port`)
    #[arg(long, short = 'p', value_name = "N", env = "PORT")]
    pub port: Option<u16>,

    /// Number of backend circuits
    #[arg(long, value_name = "N", env = "POOL_SIZE")]
    pub pool_size: Option<usize>,

    /// Host the circuit SOCKS and control ports listen on
    #[arg(long, value_name = "HOST", env = "SOCKS_HOST")]
    pub socks_host: Option<String>,

    /// SOCKS port of circuit 0; circuit i uses this port + i
    #[arg(long, value_name = "N", env = "SOCKS_BASE_PORT")]
    pub socks_base_port: Option<u16>,

    /// Control port of circuit 0; circuit i uses this port + i
    #[arg(long, value_name = "N", env = "CONTROL_BASE_PORT")]
    pub control_base_port: Option<u16>,

    /// Password for the backend control ports
    #[arg(long, value_name = "PW", env = "CONTROL_PASSWORD", hide_env_values = true)]
    pub control_password: Option<String>,

    /// Request a fresh exit identity when a circuit changes sticky session
    #[arg(long)]
    pub renew_on_rebind: bool,

    /// SOCKS dial timeout
    #[arg(long, value_name = "SECS")]
    pub dial_timeout: Option<u64>,

    /// How long a request waits for a free circuit (0 = fail immediately)
    #[arg(long, value_name = "SECS")]
    pub acquire_timeout: Option<u64>,

    /// Forget a circuit's sticky session after this much idle time
    #[arg(long, value_name = "SECS")]
    pub sticky_ttl: Option<u64>,

    /// Header carrying the sticky-session token
    #[arg(long, value_name = "NAME")]
    pub session_header: Option<String>,

    /// Require Basic proxy authentication with this user name
    #[arg(long, value_name = "USER", env = "PROXY_USER", requires = "auth_password")]
    pub auth_user: Option<String>,

    /// Password for --auth-user
    #[arg(
        long,
        value_name = "PASSWORD",
        env = "PROXY_PASSWORD",
        hide_env_values = true,
        requires = "auth_user"
    )]
    pub auth_password: Option<String>,

    /// Realm announced in authentication challenges
    #[arg(long, value_name = "REALM")]
    pub realm: Option<String>,

    /// Maximum concurrent client connections (0 = unlimited)
    #[arg(long, value_name = "N")]
    pub max_connections: Option<usize>,

    /// Enable verbose output (-v debug, -vv trace)
    #[arg(long, short = 'v', action = clap::ArgAction::Count)]
    pub verbose: u8,
}
