use std::future::Future;
use std::io;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{Error, Result};

const READ_BUFFER_SIZE: usize = 8192;

/// One connection to the daemon, held for exactly one operation.
///
/// The stream is owned by the session and closed when the session is
/// dropped, whichever way the operation ends. Every read and write is
/// bounded by the session's I/O timeout and aborts as soon as the
/// cancellation token fires.
pub struct Session<S = TcpStream> {
    stream: S,
    io_timeout: Duration,
    cancel: CancellationToken,
}

impl Session<TcpStream> {
    pub async fn connect(
        host: &str,
        port: u16,
        connect_timeout: Duration,
        io_timeout: Duration,
        cancel: CancellationToken,
    ) -> Result<Self> {
        debug!("Connecting to clamd at {}:{}", host, port);

        let stream = establish(
            host,
            port,
            connect_timeout,
            &cancel,
            TcpStream::connect((host, port)),
        )
        .await?;

        Ok(Self::from_stream(stream, io_timeout, cancel))
    }
}

impl<S> Session<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn from_stream(stream: S, io_timeout: Duration, cancel: CancellationToken) -> Self {
        Self {
            stream,
            io_timeout,
            cancel,
        }
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub async fn write_all(&mut self, buf: &[u8]) -> Result<()> {
        let Self {
            stream,
            io_timeout,
            cancel,
        } = self;
        guarded(*io_timeout, cancel, "Write", stream.write_all(buf)).await
    }

    pub async fn flush(&mut self) -> Result<()> {
        let Self {
            stream,
            io_timeout,
            cancel,
        } = self;
        guarded(*io_timeout, cancel, "Flush", stream.flush()).await
    }

    /// Reads until the peer closes its side of the connection.
    pub async fn read_to_end(&mut self) -> Result<Vec<u8>> {
        let Self {
            stream,
            io_timeout,
            cancel,
        } = self;

        let mut response = Vec::new();
        let mut buf = [0u8; READ_BUFFER_SIZE];
        loop {
            let n = guarded(*io_timeout, cancel, "Read response", stream.read(&mut buf)).await?;
            if n == 0 {
                break;
            }
            response.extend_from_slice(&buf[..n]);
        }

        Ok(response)
    }
}

/// Drives a pending connect under `connect_timeout`, unless cancellation
/// wins first. Losing the race drops the pending connect.
async fn establish<S, F>(
    host: &str,
    port: u16,
    connect_timeout: Duration,
    cancel: &CancellationToken,
    connecting: F,
) -> Result<S>
where
    F: Future<Output = io::Result<S>>,
{
    let connected = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Err(Error::Cancelled),
        res = timeout(connect_timeout, connecting) => res,
    };

    connected
        .map_err(|_| {
            Error::Timeout(format!(
                "Connection to {}:{} timed out after {:?}",
                host, port, connect_timeout
            ))
        })?
        .map_err(|e| match e.kind() {
            io::ErrorKind::TimedOut => {
                Error::Timeout(format!("Connection to {}:{} timed out: {}", host, port, e))
            }
            _ => Error::Connection {
                server: host.to_string(),
                port,
                source: e,
            },
        })
}

/// Runs one I/O step under the timeout, unless cancellation wins first.
pub(crate) async fn guarded<T, F>(
    io_timeout: Duration,
    cancel: &CancellationToken,
    what: &str,
    op: F,
) -> Result<T>
where
    F: Future<Output = io::Result<T>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(Error::Cancelled),
        res = timeout(io_timeout, op) => match res {
            Err(_) => Err(Error::Timeout(format!("{} timed out after {:?}", what, io_timeout))),
            Ok(Err(e)) if e.kind() == io::ErrorKind::TimedOut => {
                Err(Error::Timeout(format!("{} timed out: {}", what, e)))
            }
            Ok(Err(e)) => Err(Error::Io(e)),
            Ok(Ok(value)) => Ok(value),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, DuplexStream};
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_connect_refused_is_connection_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let result = Session::connect(
            "127.0.0.1",
            port,
            Duration::from_secs(5),
            Duration::from_secs(5),
            CancellationToken::new(),
        )
        .await;

        match result {
            Err(Error::Connection { server, port: p, .. }) => {
                assert_eq!(server, "127.0.0.1");
                assert_eq!(p, port);
            }
            Err(other) => panic!("Expected connection error, got {:?}", other),
            Ok(_) => panic!("Expected connection error"),
        }
    }

    #[tokio::test]
    async fn test_connect_unroutable_times_out_or_fails() {
        // RFC5737 test address
        let result = Session::connect(
            "192.0.2.1",
            12345,
            Duration::from_millis(100),
            Duration::from_secs(1),
            CancellationToken::new(),
        )
        .await;

        match result {
            Err(Error::Timeout(_)) | Err(Error::Connection { .. }) => {}
            Err(other) => panic!("Unexpected error type: {:?}", other),
            Ok(_) => panic!("Expected failure"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_that_never_completes_times_out() {
        let result: Result<DuplexStream> = establish(
            "clamd.local",
            3310,
            Duration::from_millis(100),
            &CancellationToken::new(),
            std::future::pending(),
        )
        .await;

        match result {
            Err(Error::Timeout(msg)) => assert!(msg.contains("clamd.local:3310")),
            Err(other) => panic!("Expected timeout, got {:?}", other),
            Ok(_) => panic!("Expected timeout"),
        }
    }

    #[tokio::test]
    async fn test_connect_os_timeout_is_timeout() {
        let result: Result<DuplexStream> = establish(
            "clamd.local",
            3310,
            Duration::from_secs(5),
            &CancellationToken::new(),
            async { Err(io::Error::from(io::ErrorKind::TimedOut)) },
        )
        .await;

        assert!(matches!(result, Err(Error::Timeout(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_cancelled_while_pending() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            trigger.cancel();
        });

        let result: Result<DuplexStream> = establish(
            "clamd.local",
            3310,
            Duration::from_secs(5),
            &cancel,
            std::future::pending(),
        )
        .await;

        assert!(matches!(result, Err(Error::Cancelled)));
    }

    #[tokio::test]
    async fn test_connect_cancelled_before_start() {
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = Session::connect(
            "127.0.0.1",
            3310,
            Duration::from_secs(5),
            Duration::from_secs(5),
            cancel,
        )
        .await;
        assert!(matches!(result, Err(Error::Cancelled)));
    }

    #[tokio::test]
    async fn test_read_to_end_collects_until_close() {
        let (client, mut server) = duplex(64);
        let mut session =
            Session::from_stream(client, Duration::from_secs(5), CancellationToken::new());

        tokio::spawn(async move {
            server.write_all(b"ClamAV 1.0.0").await.unwrap();
            server.write_all(b"/27000/Mon Mar 13\0").await.unwrap();
        });

        let response = session.read_to_end().await.unwrap();
        assert_eq!(response, b"ClamAV 1.0.0/27000/Mon Mar 13\0");
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_times_out_when_peer_stays_silent() {
        let (client, _server) = duplex(64);
        let mut session =
            Session::from_stream(client, Duration::from_millis(50), CancellationToken::new());

        match session.read_to_end().await {
            Err(Error::Timeout(msg)) => assert!(msg.contains("Read response")),
            other => panic!("Expected timeout, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_write_observes_cancellation() {
        let (client, _server) = duplex(64);
        let cancel = CancellationToken::new();
        let mut session = Session::from_stream(client, Duration::from_secs(5), cancel.clone());

        cancel.cancel();
        assert!(matches!(
            session.write_all(b"zPING\0").await,
            Err(Error::Cancelled)
        ));
        assert!(session.cancellation().is_cancelled());
    }

    #[tokio::test]
    async fn test_write_to_closed_peer_is_io_error() {
        let (client, server) = duplex(64);
        drop(server);
        let mut session =
            Session::from_stream(client, Duration::from_secs(5), CancellationToken::new());

        assert!(matches!(
            session.write_all(b"zPING\0").await,
            Err(Error::Io(_))
        ));
    }
}
