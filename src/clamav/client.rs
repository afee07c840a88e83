use async_trait::async_trait;
use std::path::Path;
use tokio::fs::File;
use tokio::io::AsyncRead;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::command::{self, Command};
use super::connection::Session;
use super::stream::ChunkStreamer;
use super::types::{ScanResult, ServerStats};
use crate::config::ClientConfig;
use crate::error::{Error, Result};

/// Operations offered by a clamd daemon.
///
/// Every call opens its own connection, so calls may run concurrently on one
/// client. Passing `None` for `cancel` means the call is never cancelled.
#[async_trait]
pub trait ClamAVClient: Send + Sync {
    async fn version(&self, cancel: Option<CancellationToken>) -> Result<String>;
    async fn ping(&self, cancel: Option<CancellationToken>) -> Result<bool>;
    async fn scan(&self, path: &str, cancel: Option<CancellationToken>) -> Result<ScanResult>;
    async fn multiscan(
        &self,
        path: &str,
        cancel: Option<CancellationToken>,
    ) -> Result<ScanResult>;
    async fn contscan(
        &self,
        path: &str,
        cancel: Option<CancellationToken>,
    ) -> Result<ScanResult>;
    async fn allmatchscan(
        &self,
        path: &str,
        cancel: Option<CancellationToken>,
    ) -> Result<ScanResult>;
    async fn send_and_scan_bytes(
        &self,
        data: &[u8],
        cancel: Option<CancellationToken>,
    ) -> Result<ScanResult>;
    async fn send_and_scan_file(
        &self,
        path: &Path,
        cancel: Option<CancellationToken>,
    ) -> Result<ScanResult>;
    async fn stats(&self, cancel: Option<CancellationToken>) -> Result<ServerStats>;
    async fn reload(&self, cancel: Option<CancellationToken>) -> Result<bool>;
}

pub struct ClamAVClientImpl {
    config: ClientConfig,
}

impl ClamAVClientImpl {
    pub fn new(config: ClientConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Mutable access between calls; the next call re-validates.
    pub fn config_mut(&mut self) -> &mut ClientConfig {
        &mut self.config
    }

    /// Uploads `reader` with INSTREAM and parses the verdict.
    pub async fn send_and_scan_stream<R>(
        &self,
        reader: R,
        cancel: Option<CancellationToken>,
    ) -> Result<ScanResult>
    where
        R: AsyncRead + Unpin + Send,
    {
        self.config.validate()?;
        let mut streamer = ChunkStreamer::new(
            reader,
            self.config.max_chunk_size,
            self.config.max_stream_size,
        );

        let response = self
            .exchange(Command::InStream, Some(&mut streamer), cancel)
            .await?;
        Ok(ScanResult::parse(&response))
    }

    async fn send_command(
        &self,
        command: Command<'_>,
        cancel: Option<CancellationToken>,
    ) -> Result<String> {
        self.config.validate()?;
        self.exchange(command, None, cancel).await
    }

    async fn exchange(
        &self,
        command: Command<'_>,
        payload: Option<&mut (dyn command::Payload<tokio::net::TcpStream> + Send)>,
        cancel: Option<CancellationToken>,
    ) -> Result<String> {
        let mut session = Session::connect(
            &self.config.host,
            self.config.port,
            self.config.connect_timeout(),
            self.config.io_timeout(),
            cancel.unwrap_or_default(),
        )
        .await?;

        // `session` drops here on every path, closing the socket.
        command::execute(&mut session, command, payload).await
    }

    async fn scan_with(
        &self,
        command: Command<'_>,
        cancel: Option<CancellationToken>,
    ) -> Result<ScanResult> {
        let start = std::time::Instant::now();
        let response = self.send_command(command, cancel).await?;
        let result = ScanResult::parse(&response);

        debug!(
            "{} finished in {}ms: {:?}",
            command,
            start.elapsed().as_millis(),
            result.verdict()
        );
        Ok(result)
    }
}

fn require_path(path: &str) -> Result<&str> {
    if path.is_empty() {
        return Err(Error::InvalidArgument("Path must not be empty".to_string()));
    }
    Ok(path)
}

#[async_trait]
impl ClamAVClient for ClamAVClientImpl {
    async fn version(&self, cancel: Option<CancellationToken>) -> Result<String> {
        self.send_command(Command::Version, cancel).await
    }

    async fn ping(&self, cancel: Option<CancellationToken>) -> Result<bool> {
        let response = self.send_command(Command::Ping, cancel).await?;
        Ok(response.eq_ignore_ascii_case("pong"))
    }

    async fn scan(&self, path: &str, cancel: Option<CancellationToken>) -> Result<ScanResult> {
        self.scan_with(Command::Scan(require_path(path)?), cancel).await
    }

    async fn multiscan(
        &self,
        path: &str,
        cancel: Option<CancellationToken>,
    ) -> Result<ScanResult> {
        self.scan_with(Command::MultiScan(require_path(path)?), cancel).await
    }

    async fn contscan(
        &self,
        path: &str,
        cancel: Option<CancellationToken>,
    ) -> Result<ScanResult> {
        self.scan_with(Command::ContScan(require_path(path)?), cancel).await
    }

    async fn allmatchscan(
        &self,
        path: &str,
        cancel: Option<CancellationToken>,
    ) -> Result<ScanResult> {
        self.scan_with(Command::AllMatchScan(require_path(path)?), cancel).await
    }

    async fn send_and_scan_bytes(
        &self,
        data: &[u8],
        cancel: Option<CancellationToken>,
    ) -> Result<ScanResult> {
        self.send_and_scan_stream(data, cancel).await
    }

    async fn send_and_scan_file(
        &self,
        path: &Path,
        cancel: Option<CancellationToken>,
    ) -> Result<ScanResult> {
        self.config.validate()?;
        if path.as_os_str().is_empty() {
            return Err(Error::InvalidArgument("Path must not be empty".to_string()));
        }
        if !tokio::fs::try_exists(path).await.unwrap_or(false) {
            return Err(Error::NotFound(path.to_path_buf()));
        }

        let file = File::open(path).await?;
        debug!("Streaming {:?} to clamd", path);
        self.send_and_scan_stream(file, cancel).await
    }

    async fn stats(&self, cancel: Option<CancellationToken>) -> Result<ServerStats> {
        let response = self.send_command(Command::Stats, cancel).await?;
        Ok(ServerStats::parse(&response))
    }

    async fn reload(&self, cancel: Option<CancellationToken>) -> Result<bool> {
        let response = self.send_command(Command::Reload, cancel).await?;
        let response = response.to_ascii_lowercase();
        let reloaded = response.contains("reload") || response == "ok";
        if reloaded {
            info!("clamd database reload requested");
        }
        Ok(reloaded)
    }
}
