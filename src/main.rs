mod command;
mod ratelimiter;
mod reply;
mod server;
mod session;
mod stream;
mod tls;
mod utils;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use structopt::StructOpt;

use crate::server::SmtpServer;
use crate::session::SessionContext;
use crate::tls::{PemFiles, TlsUpgrader};
use crate::utils::Logger;

const DEFAULT_HOST: &str = "0.0.0.0";
const DEFAULT_PORT: u16 = 587;

#[derive(Debug, StructOpt, Clone)]
#[structopt(
    name = "starttls-smtpd",
    about = "A minimal SMTP responder with STARTTLS support"
)]
pub struct Opt {
    /// Listening address
    #[structopt(short = "a", long = "address", env = "SMTP_HOST", default_value = "0.0.0.0", parse(from_str = parse_host))]
    pub address: String,

    /// Listening port; unparsable values fall back to 587
    #[structopt(short = "p", long = "port", env = "SMTP_PORT", default_value = "587", parse(from_str = parse_port))]
    pub port: u16,

    /// Service name announced in the greeting
    #[structopt(long = "hostname", env = "SMTP_HOSTNAME", default_value = "rudrprasad.com")]
    pub hostname: String,

    /// TLS certificate chain (PEM)
    #[structopt(
        long = "tls-cert",
        env = "SMTP_TLS_CERT",
        default_value = "/etc/letsencrypt/live/rudrprasad.com/cert.pem",
        parse(from_os_str)
    )]
    pub tls_cert: PathBuf,

    /// TLS private key (PEM: PKCS#8, PKCS#1 or SEC1)
    #[structopt(
        long = "tls-key",
        env = "SMTP_TLS_KEY",
        default_value = "/etc/letsencrypt/live/rudrprasad.com/key.pem",
        parse(from_os_str)
    )]
    pub tls_key: PathBuf,

    /// Also append log events to this file
    #[structopt(long = "logs", env = "SMTP_LOG_FILE", parse(from_os_str))]
    pub log_file: Option<PathBuf>,

    /// Verbose mode - log every command and reply
    #[structopt(short = "v", long = "verbose")]
    pub verbose: bool,

    /// Seconds a client may stay silent before being disconnected (0 = never)
    #[structopt(long = "idle-timeout", env = "SMTP_IDLE_TIMEOUT", default_value = "300")]
    pub idle_timeout: u64,

    /// Maximum concurrent sessions (0 = unlimited)
    #[structopt(long = "max-sessions", env = "SMTP_MAX_SESSIONS", default_value = "0")]
    pub max_sessions: usize,

    /// Maximum connections per minute from the same IP (0 = unlimited)
    #[structopt(long = "max-connections-per-minute", env = "SMTP_RATE_LIMIT", default_value = "0")]
    pub max_connections_per_minute: usize,
}

impl Opt {
    pub fn listen_address(&self) -> String {
        if self.address.contains(':') {
            format!("[{}]:{}", self.address, self.port)
        } else {
            format!("{}:{}", self.address, self.port)
        }
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        (self.idle_timeout > 0).then(|| Duration::from_secs(self.idle_timeout))
    }
}

fn parse_host(value: &str) -> String {
    let value = value.trim();
    if value.is_empty() {
        DEFAULT_HOST.to_string()
    } else {
        value.to_string()
    }
}

fn parse_port(value: &str) -> u16 {
    value.trim().parse().unwrap_or(DEFAULT_PORT)
}

#[tokio::main]
async fn main() -> Result<()> {
    let opt = Opt::from_args();

    utils::setup_tracing(opt.verbose)?;
    let logger = Logger::new(opt.log_file.clone(), opt.verbose)?;

    let upgrader = TlsUpgrader::from_provider(&PemFiles::new(&opt.tls_cert, &opt.tls_key))?;
    logger
        .server(&format!("TLS certificate loaded from {:?}", opt.tls_cert))
        .await;

    let context = Arc::new(SessionContext {
        hostname: opt.hostname.clone(),
        idle_timeout: opt.idle_timeout(),
        upgrader,
        logger,
    });

    let server = SmtpServer::new(
        opt.listen_address(),
        context,
        opt.max_sessions,
        opt.max_connections_per_minute,
    );
    server.run().await
}
