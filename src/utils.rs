use chrono::Local;
use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Context};
use tokio::sync::Mutex;
use tracing::Level;
use tracing_subscriber::EnvFilter;

/// Installs the console subscriber. `RUST_LOG` overrides the default level.
pub fn setup_tracing(verbose: bool) -> anyhow::Result<()> {
    let default = if verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default)),
        )
        .try_init()
        .map_err(|e| anyhow!("Failed to install tracing subscriber: {}", e))
}

/// Escapes control characters so peer input cannot forge log lines.
pub fn safe_log_string(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    for c in input.chars() {
        match c {
            '\0' => result.push_str("\\0"),
            '\r' => result.push_str("\\r"),
            '\n' => result.push_str("\\n"),
            '\t' => result.push_str("\\t"),
            c if c.is_control() => {
                result.push_str(&format!("\\x{:02x}", c as u32));
            }
            c => result.push(c),
        }
    }
    result
}

/// Per-process logging capability, handed to the server and each session.
///
/// Every event goes to `tracing`; when a log file is configured it is also
/// appended there with a local timestamp.
#[derive(Clone)]
pub struct Logger {
    writer: Option<Arc<Mutex<BufWriter<File>>>>,
    verbose: bool,
}

impl Logger {
    pub fn new(log_file: Option<PathBuf>, verbose: bool) -> anyhow::Result<Self> {
        let writer = if let Some(path) = log_file {
            if let Some(parent) = path.parent() {
                if !parent.as_os_str().is_empty() && !parent.exists() {
                    std::fs::create_dir_all(parent)
                        .with_context(|| format!("Failed to create log directory: {:?}", parent))?;
                }
            }

            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .with_context(|| format!("Failed to open log file: {:?}", path))?;

            Some(Arc::new(Mutex::new(BufWriter::new(file))))
        } else {
            None
        };

        Ok(Self { writer, verbose })
    }

    pub async fn log(&self, client_addr: &SocketAddr, message: &str) {
        self.emit(Level::INFO, Some(client_addr), message).await;
    }

    pub async fn warn(&self, client_addr: &SocketAddr, message: &str) {
        self.emit(Level::WARN, Some(client_addr), message).await;
    }

    pub async fn debug(&self, client_addr: &SocketAddr, message: &str) {
        self.emit(Level::DEBUG, Some(client_addr), message).await;
    }

    /// Protocol traffic: shown at `info` in verbose mode, `debug` otherwise.
    pub async fn log_verbose(&self, client_addr: &SocketAddr, title: &str, details: &str) {
        let message = format!("{} {}", title, safe_log_string(details));
        let level = if self.verbose { Level::INFO } else { Level::DEBUG };
        self.emit(level, Some(client_addr), &message).await;
    }

    pub async fn server(&self, message: &str) {
        self.emit(Level::INFO, None, message).await;
    }

    pub async fn server_warn(&self, message: &str) {
        self.emit(Level::WARN, None, message).await;
    }

    async fn emit(&self, level: Level, client_addr: Option<&SocketAddr>, message: &str) {
        let client = client_addr.map(ToString::to_string);
        let client = client.as_deref().unwrap_or("-");
        if level == Level::WARN {
            tracing::warn!(client, "{}", message);
        } else if level == Level::DEBUG {
            tracing::debug!(client, "{}", message);
        } else {
            tracing::info!(client, "{}", message);
        }

        if level == Level::DEBUG || self.writer.is_none() {
            return;
        }
        let timestamp = Local::now().format("%Y-%m-%d %H:%M:%S%.3f");
        let line = format!("{} {} {} {}\n", timestamp, level, client, message);
        if let Err(e) = self.append(&line).await {
            tracing::warn!("Failed to write log file: {}", e);
        }
    }

    async fn append(&self, line: &str) -> io::Result<()> {
        if let Some(writer) = &self.writer {
            let mut writer = writer.lock().await;
            writer.write_all(line.as_bytes())?;
            writer.flush()?;
        }
        Ok(())
    }
}
