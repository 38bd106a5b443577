use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore, TryAcquireError};

use crate::ratelimiter::RateLimiter;
use crate::reply::Reply;
use crate::session::{SessionContext, SmtpSession};

/// Accepts connections and runs one independent session task per client.
#[derive(Clone)]
pub struct SmtpServer {
    address: String,
    context: Arc<SessionContext>,
    sessions: Option<Arc<Semaphore>>,
    rate_limiter: Option<Arc<Mutex<RateLimiter>>>,
}

impl SmtpServer {
    /// `max_sessions` and `max_connections_per_minute` disable their limit
    /// when zero.
    pub fn new(
        address: impl Into<String>,
        context: Arc<SessionContext>,
        max_sessions: usize,
        max_connections_per_minute: usize,
    ) -> Self {
        Self {
            address: address.into(),
            context,
            sessions: (max_sessions > 0).then(|| Arc::new(Semaphore::new(max_sessions))),
            rate_limiter: (max_connections_per_minute > 0)
                .then(|| Arc::new(Mutex::new(RateLimiter::new(max_connections_per_minute)))),
        }
    }

    pub async fn bind(&self) -> Result<TcpListener> {
        let listener = TcpListener::bind(&self.address)
            .await
            .with_context(|| format!("Failed to bind to {}", self.address))?;
        let local = listener.local_addr().context("Failed to read listening address")?;
        self.context
            .logger
            .server(&format!("SMTP server listening on {}", local))
            .await;
        Ok(listener)
    }

    /// Accept loop. Accept errors are logged and never end the loop.
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        loop {
            match listener.accept().await {
                Ok((stream, client_addr)) => {
                    let permit = self.sessions.clone().map(Semaphore::try_acquire_owned);
                    let this = self.clone();
                    tokio::spawn(async move {
                        if let Err(e) = this.handle_client(stream, client_addr, permit).await {
                            this.context.logger.warn(&client_addr, &format!("Error: {:#}", e)).await;
                        }
                    });
                }
                Err(e) => {
                    self.context
                        .logger
                        .server_warn(&format!("Error accepting connection: {}", e))
                        .await;
                }
            }
        }
    }

    pub async fn run(&self) -> Result<()> {
        let listener = self.bind().await?;
        self.serve(listener).await
    }

    async fn handle_client(
        &self,
        mut stream: TcpStream,
        client_addr: SocketAddr,
        permit: Option<Result<OwnedSemaphorePermit, TryAcquireError>>,
    ) -> Result<()> {
        let logger = &self.context.logger;

        if let Some(limiter) = &self.rate_limiter {
            if !limiter.lock().await.check_and_add(client_addr.ip()) {
                logger.log(&client_addr, "Rate limit exceeded").await;
                return refuse(&mut stream, &Reply::RATE_LIMITED).await;
            }
        }

        let _permit = match permit {
            Some(Err(_)) => {
                logger.log(&client_addr, "Session limit reached").await;
                return refuse(&mut stream, &Reply::too_many_sessions(&self.context.hostname)).await;
            }
            Some(Ok(permit)) => Some(permit),
            None => None,
        };

        logger.log(&client_addr, "New connection").await;
        SmtpSession::new(client_addr, Arc::clone(&self.context))
            .run(stream)
            .await
    }
}

async fn refuse(stream: &mut TcpStream, reply: &Reply) -> Result<()> {
    reply.send(stream).await.context("Failed to send refusal")?;
    stream.shutdown().await.context("Failed to close refused connection")
}
