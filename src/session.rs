use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use tokio::io::{
    AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufStream,
};
use tokio::time;

use crate::command::Command;
use crate::reply::Reply;
use crate::stream::SessionStream;
use crate::tls::TlsUpgrader;
use crate::utils::Logger;

/// Read-only state shared by every session of a server.
pub struct SessionContext {
    pub hostname: String,
    pub idle_timeout: Option<Duration>,
    pub upgrader: TlsUpgrader,
    pub logger: Logger,
}

/// Longest command line kept in memory, terminator included.
const MAX_LINE_LEN: usize = 4096;

type Stream<S> = BufStream<SessionStream<S>>;

#[derive(Debug, PartialEq, Eq)]
enum Incoming {
    Line,
    TooLong,
    Closed,
    TimedOut,
}

/// One client connection, from greeting to close.
pub struct SmtpSession {
    pub client_addr: SocketAddr,
    pub tls_established: bool,
    context: Arc<SessionContext>,
}

impl SmtpSession {
    pub fn new(client_addr: SocketAddr, context: Arc<SessionContext>) -> Self {
        Self {
            client_addr,
            tls_established: false,
            context,
        }
    }

    /// Drives the session until QUIT, EOF, a read error, an idle timeout or a
    /// failed handshake. Only write failures are returned as errors.
    pub async fn run<S>(mut self, io: S) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let context = Arc::clone(&self.context);
        let logger = &context.logger;
        let mut stream = BufStream::new(SessionStream::Plain(io));

        self.send(&mut stream, &Reply::greeting(&context.hostname)).await?;

        let mut buf = Vec::new();
        loop {
            buf.clear();
            match self.next_line(&mut stream, &mut buf).await {
                Ok(Incoming::Line) => {}
                Ok(Incoming::TooLong) => {
                    logger.debug(&self.client_addr, "Discarded overlong line").await;
                    self.send(&mut stream, &Reply::LINE_TOO_LONG).await?;
                    continue;
                }
                Ok(Incoming::Closed) => {
                    logger.debug(&self.client_addr, "Connection closed by peer").await;
                    break;
                }
                Ok(Incoming::TimedOut) => {
                    logger.log(&self.client_addr, "Idle timeout").await;
                    self.send(&mut stream, &Reply::timeout(&context.hostname)).await?;
                    self.close(&mut stream).await;
                    break;
                }
                Err(e) => {
                    logger.debug(&self.client_addr, &format!("Read error: {}", e)).await;
                    break;
                }
            }

            let text = String::from_utf8_lossy(&buf);
            let command = Command::parse(text.trim());
            logger
                .log_verbose(&self.client_addr, &format!(">> [{}]", command.name()), text.trim())
                .await;

            let reply = match command {
                Command::Helo(argument) => Reply::hello(argument),
                Command::MailFrom(_) => Reply::SENDER_OK,
                Command::RcptTo(_) => Reply::RECIPIENT_OK,
                Command::Data => Reply::START_MAIL_INPUT,
                Command::DataTerminator => Reply::MESSAGE_ACCEPTED,
                Command::StartTls if !self.tls_established => {
                    stream = match self.start_tls(stream).await? {
                        Some(upgraded) => upgraded,
                        None => break,
                    };
                    continue;
                }
                Command::Quit => {
                    self.send(&mut stream, &Reply::BYE).await?;
                    self.close(&mut stream).await;
                    break;
                }
                Command::StartTls | Command::Unknown(_) => Reply::NOT_RECOGNIZED,
            };
            self.send(&mut stream, &reply).await?;
        }

        logger.log(&self.client_addr, "Connection closed").await;
        Ok(())
    }

    async fn next_line<S>(&self, stream: &mut Stream<S>, buf: &mut Vec<u8>) -> io::Result<Incoming>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let read = read_bounded_line(stream, buf);
        match self.context.idle_timeout {
            Some(limit) => match time::timeout(limit, read).await {
                Ok(result) => result,
                Err(_) => Ok(Incoming::TimedOut),
            },
            None => read.await,
        }
    }

    /// Flushes and closes the write side; over TLS this sends close_notify.
    async fn close<S>(&self, stream: &mut Stream<S>)
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        if let Err(e) = stream.shutdown().await {
            self.context
                .logger
                .debug(&self.client_addr, &format!("Shutdown error: {}", e))
                .await;
        }
    }

    /// Returns the encrypted stream, or `None` when the session must end.
    async fn start_tls<S>(&mut self, mut stream: Stream<S>) -> Result<Option<Stream<S>>>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let context = Arc::clone(&self.context);
        let logger = &context.logger;

        self.send(&mut stream, &Reply::READY_TO_START_TLS).await?;

        // Plaintext pipelined behind STARTTLS is dropped with the buffer.
        let io = match stream.into_inner() {
            SessionStream::Plain(io) => io,
            SessionStream::Tls(_) => return Err(anyhow!("STARTTLS on an encrypted stream")),
        };

        match context.upgrader.upgrade(io, context.idle_timeout).await {
            Ok(tls) => {
                self.tls_established = true;
                logger.log(&self.client_addr, "TLS session established").await;
                let mut stream = BufStream::new(SessionStream::Tls(Box::new(tls)));
                self.send(&mut stream, &Reply::TLS_ESTABLISHED).await?;
                Ok(Some(stream))
            }
            Err(failure) => {
                let reply = if failure.timed_out() {
                    logger.warn(&self.client_addr, "TLS handshake timed out").await;
                    Reply::timeout(&context.hostname)
                } else {
                    logger.warn(&self.client_addr, &failure.to_string()).await;
                    Reply::TLS_HANDSHAKE_FAILED
                };
                let mut raw = failure.stream;
                if let Err(e) = reply.send(&mut raw).await {
                    logger
                        .debug(&self.client_addr, &format!("Could not report handshake failure: {}", e))
                        .await;
                }
                Ok(None)
            }
        }
    }

    async fn send<S>(&self, stream: &mut Stream<S>, reply: &Reply) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        self.context
            .logger
            .log_verbose(&self.client_addr, "<<", reply.to_string().trim_end())
            .await;
        reply
            .send(stream)
            .await
            .with_context(|| format!("Failed to send {} reply to {}", reply.code(), self.client_addr))
    }
}

/// Reads one `\n`-terminated line into `buf`, keeping at most
/// `MAX_LINE_LEN` bytes. The rest of an overlong line is skipped up to and
/// including its `\n`. A trailing fragment without `\n` only shows up at EOF
/// and counts as `Closed`.
async fn read_bounded_line<R>(reader: &mut R, buf: &mut Vec<u8>) -> io::Result<Incoming>
where
    R: AsyncBufRead + Unpin,
{
    let n = (&mut *reader)
        .take(MAX_LINE_LEN as u64)
        .read_until(b'\n', buf)
        .await?;
    if buf.last() == Some(&b'\n') {
        return Ok(Incoming::Line);
    }
    if n < MAX_LINE_LEN {
        return Ok(Incoming::Closed);
    }

    loop {
        let (found, used) = {
            let available = reader.fill_buf().await?;
            if available.is_empty() {
                return Ok(Incoming::Closed);
            }
            match available.iter().position(|&b| b == b'\n') {
                Some(i) => (true, i + 1),
                None => (false, available.len()),
            }
        };
        reader.consume(used);
        if found {
            return Ok(Incoming::TooLong);
        }
    }
}
