use std::borrow::Cow;
use std::fmt;
use std::io;

use tokio::io::{AsyncWrite, AsyncWriteExt};

/// A single-line SMTP reply: three digit code and text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    code: u16,
    text: Cow<'static, str>,
}

impl Reply {
    pub const SENDER_OK: Reply = Reply::fixed(250, "Sender OK");
    pub const RECIPIENT_OK: Reply = Reply::fixed(250, "Recipient OK");
    pub const START_MAIL_INPUT: Reply = Reply::fixed(354, "Start mail input; end with <CRLF>.<CRLF>");
    pub const MESSAGE_ACCEPTED: Reply = Reply::fixed(250, "Message accepted for delivery");
    pub const READY_TO_START_TLS: Reply = Reply::fixed(220, "Ready to start TLS");
    pub const TLS_ESTABLISHED: Reply = Reply::fixed(250, "OK, TLS established");
    pub const TLS_HANDSHAKE_FAILED: Reply = Reply::fixed(454, "TLS handshake failed");
    pub const BYE: Reply = Reply::fixed(221, "Bye");
    pub const NOT_RECOGNIZED: Reply = Reply::fixed(500, "Command not recognized");
    pub const LINE_TOO_LONG: Reply = Reply::fixed(500, "Line too long");
    pub const RATE_LIMITED: Reply = Reply::fixed(421, "Too many connections from your IP");

    const fn fixed(code: u16, text: &'static str) -> Self {
        Reply {
            code,
            text: Cow::Borrowed(text),
        }
    }

    pub fn new(code: u16, text: impl Into<Cow<'static, str>>) -> Self {
        Reply {
            code,
            text: text.into(),
        }
    }

    pub fn greeting(service: &str) -> Self {
        Reply::new(220, format!("{} ESMTP Service Ready", service))
    }

    pub fn hello(argument: &str) -> Self {
        Reply::new(250, format!("Hello {}", argument))
    }

    pub fn timeout(service: &str) -> Self {
        Reply::new(421, format!("{} Timeout, closing connection", service))
    }

    pub fn too_many_sessions(service: &str) -> Self {
        Reply::new(421, format!("{} Too many sessions, try again later", service))
    }

    pub fn code(&self) -> u16 {
        self.code
    }

    /// Writes the reply line and flushes the sink.
    pub async fn send<W>(&self, writer: &mut W) -> io::Result<()>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        writer.write_all(self.to_string().as_bytes()).await?;
        writer.flush().await
    }
}

impl fmt::Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:03} {}\r\n", self.code, self.text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_code_text_and_crlf() {
        assert_eq!(Reply::BYE.to_string(), "221 Bye\r\n");
        assert_eq!(
            Reply::greeting("mx.example").to_string(),
            "220 mx.example ESMTP Service Ready\r\n"
        );
        assert_eq!(Reply::hello("").to_string(), "250 Hello \r\n");
    }

    #[tokio::test]
    async fn send_writes_and_flushes() {
        let (mut server, mut client) = tokio::io::duplex(256);
        let mut sink = tokio::io::BufWriter::new(&mut server);
        Reply::START_MAIL_INPUT.send(&mut sink).await.unwrap();
        drop(sink);
        drop(server);

        let mut received = String::new();
        tokio::io::AsyncReadExt::read_to_string(&mut client, &mut received)
            .await
            .unwrap();
        assert_eq!(received, "354 Start mail input; end with <CRLF>.<CRLF>\r\n");
    }

    #[tokio::test]
    async fn send_reports_closed_sink() {
        let (mut server, client) = tokio::io::duplex(256);
        drop(client);
        assert!(Reply::BYE.send(&mut server).await.is_err());
    }
}
