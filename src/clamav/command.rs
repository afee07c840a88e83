use async_trait::async_trait;
use std::fmt;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::debug;

use super::connection::Session;
use crate::error::Result;

/// The daemon commands this client speaks. Paths are passed through verbatim.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command<'a> {
    Version,
    Ping,
    Scan(&'a str),
    MultiScan(&'a str),
    ContScan(&'a str),
    AllMatchScan(&'a str),
    InStream,
    Stats,
    Reload,
}

impl Command<'_> {
    /// Wire form: `z<command>\0`.
    pub fn frame(&self) -> Vec<u8> {
        format!("z{}\0", self).into_bytes()
    }
}

impl fmt::Display for Command<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Version => write!(f, "VERSION"),
            Command::Ping => write!(f, "PING"),
            Command::Scan(path) => write!(f, "SCAN {}", path),
            Command::MultiScan(path) => write!(f, "MULTISCAN {}", path),
            Command::ContScan(path) => write!(f, "CONTSCAN {}", path),
            Command::AllMatchScan(path) => write!(f, "ALLMATCHSCAN {}", path),
            Command::InStream => write!(f, "INSTREAM"),
            Command::Stats => write!(f, "STATS"),
            Command::Reload => write!(f, "RELOAD"),
        }
    }
}

/// Data written after the command line and before the response is read.
#[async_trait]
pub trait Payload<S: Send>: Send {
    async fn send(&mut self, session: &mut Session<S>) -> Result<()>;
}

/// Performs one request/response exchange on an open session.
///
/// Sends the command frame, runs the payload if there is one, flushes, then
/// collects the response until the daemon closes the connection. A trailing
/// NUL is stripped and invalid UTF-8 is replaced rather than rejected.
pub async fn execute<S>(
    session: &mut Session<S>,
    command: Command<'_>,
    payload: Option<&mut (dyn Payload<S> + Send)>,
) -> Result<String>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    debug!("Sending command to clamd: {}", command);

    session.write_all(&command.frame()).await?;
    if let Some(payload) = payload {
        payload.send(session).await?;
    }
    session.flush().await?;

    let mut response = session.read_to_end().await?;
    if response.last() == Some(&0) {
        response.pop();
    }

    debug!("Received {} byte response to {}", response.len(), command);
    Ok(String::from_utf8_lossy(&response).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use std::time::Duration;
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt, DuplexStream};
    use tokio_util::sync::CancellationToken;

    struct FixedPayload(&'static [u8]);

    #[async_trait]
    impl Payload<DuplexStream> for FixedPayload {
        async fn send(&mut self, session: &mut Session<DuplexStream>) -> Result<()> {
            session.write_all(self.0).await
        }
    }

    fn session(stream: DuplexStream) -> Session<DuplexStream> {
        Session::from_stream(stream, Duration::from_secs(5), CancellationToken::new())
    }

    // Reads `expected_len` request bytes, replies, then closes.
    fn fake_daemon(
        mut server: DuplexStream,
        expected_len: usize,
        reply: &'static [u8],
    ) -> tokio::task::JoinHandle<Vec<u8>> {
        tokio::spawn(async move {
            let mut request = vec![0u8; expected_len];
            server.read_exact(&mut request).await.unwrap();
            server.write_all(reply).await.unwrap();
            request
        })
    }

    #[test]
    fn test_command_text() {
        assert_eq!(Command::Version.to_string(), "VERSION");
        assert_eq!(Command::Ping.to_string(), "PING");
        assert_eq!(Command::Scan("/tmp/a b").to_string(), "SCAN /tmp/a b");
        assert_eq!(Command::MultiScan("/srv").to_string(), "MULTISCAN /srv");
        assert_eq!(Command::ContScan("/srv").to_string(), "CONTSCAN /srv");
        assert_eq!(
            Command::AllMatchScan("/srv").to_string(),
            "ALLMATCHSCAN /srv"
        );
        assert_eq!(Command::InStream.to_string(), "INSTREAM");
        assert_eq!(Command::Stats.to_string(), "STATS");
        assert_eq!(Command::Reload.to_string(), "RELOAD");
    }

    #[test]
    fn test_command_frame() {
        assert_eq!(Command::Ping.frame(), b"zPING\0");
        assert_eq!(Command::Scan("/tmp/x").frame(), b"zSCAN /tmp/x\0");
    }

    #[tokio::test]
    async fn test_execute_strips_trailing_nul() {
        let (client, server) = duplex(1024);
        let daemon = fake_daemon(server, 6, b"PONG\0");

        let mut session = session(client);
        let response = execute(&mut session, Command::Ping, None).await.unwrap();

        assert_eq!(response, "PONG");
        assert_eq!(daemon.await.unwrap(), b"zPING\0");
    }

    #[tokio::test]
    async fn test_execute_keeps_response_without_nul() {
        let (client, server) = duplex(1024);
        let daemon = fake_daemon(server, 8, b"RELOADING\n");

        let mut session = session(client);
        let response = execute(&mut session, Command::Reload, None).await.unwrap();

        assert_eq!(response, "RELOADING\n");
        daemon.await.unwrap();
    }

    #[tokio::test]
    async fn test_execute_empty_response() {
        let (client, server) = duplex(1024);
        let daemon = fake_daemon(server, 7, b"");

        let mut session = session(client);
        let response = execute(&mut session, Command::Stats, None).await.unwrap();

        assert_eq!(response, "");
        daemon.await.unwrap();
    }

    #[tokio::test]
    async fn test_execute_sends_payload_after_command() {
        let (client, server) = duplex(1024);
        let daemon = fake_daemon(server, 10 + 4, b"stream: OK\0");

        let mut session = session(client);
        let mut payload = FixedPayload(b"\0\0\0\0");
        let response = execute(&mut session, Command::InStream, Some(&mut payload))
            .await
            .unwrap();

        assert_eq!(response, "stream: OK");
        assert_eq!(daemon.await.unwrap(), b"zINSTREAM\0\0\0\0\0");
    }

    #[tokio::test]
    async fn test_execute_lossy_utf8() {
        let (client, server) = duplex(1024);
        let daemon = fake_daemon(server, 13, b"/tmp/\xff: OK\0");

        let mut session = session(client);
        let response = execute(&mut session, Command::Scan("/tmp/x"), None)
            .await
            .unwrap();

        assert_eq!(response, "/tmp/\u{fffd}: OK");
        daemon.await.unwrap();
    }

    #[tokio::test]
    async fn test_execute_cancelled() {
        let (client, _server) = duplex(1024);
        let cancel = CancellationToken::new();
        let mut session = Session::from_stream(client, Duration::from_secs(5), cancel.clone());
        cancel.cancel();

        let result = execute(&mut session, Command::Ping, None).await;
        assert!(matches!(result, Err(Error::Cancelled)));
    }
}
