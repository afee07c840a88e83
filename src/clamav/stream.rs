//! INSTREAM upload.
//!
//! Wire format, all lengths big-endian:
//!
//! ```text
//! len:u32 | payload[len]   repeated, len <= chunk size
//! 0:u32                    terminator
//! ```

use async_trait::async_trait;
use bytes::{BufMut, BytesMut};
use std::ops::{Deref, DerefMut};
use std::sync::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tracing::{debug, warn};

use super::command::Payload;
use super::connection::Session;
use crate::error::{Error, Result};

const LENGTH_PREFIX: usize = 4;
const TERMINATOR: [u8; LENGTH_PREFIX] = 0u32.to_be_bytes();

/// Staging buffers for a single upload.
///
/// A pool is never shared between transfers. Buffers go back to the pool
/// when their [`PooledBuffer`] is dropped, so each is released exactly once
/// even when the upload fails part way.
pub struct BufferPool {
    buffer_size: usize,
    free: Mutex<Vec<BytesMut>>,
}

impl BufferPool {
    pub fn new(buffer_size: usize) -> Self {
        Self {
            buffer_size,
            free: Mutex::new(Vec::new()),
        }
    }

    pub fn acquire(&self) -> PooledBuffer<'_> {
        let buf = self
            .free
            .lock()
            .ok()
            .and_then(|mut free| free.pop())
            .unwrap_or_else(|| BytesMut::with_capacity(self.buffer_size));

        PooledBuffer { buf, pool: self }
    }

    /// Number of buffers currently sitting in the pool.
    pub fn available(&self) -> usize {
        self.free.lock().map(|free| free.len()).unwrap_or(0)
    }
}

pub struct PooledBuffer<'a> {
    buf: BytesMut,
    pool: &'a BufferPool,
}

impl Deref for PooledBuffer<'_> {
    type Target = BytesMut;

    fn deref(&self) -> &BytesMut {
        &self.buf
    }
}

impl DerefMut for PooledBuffer<'_> {
    fn deref_mut(&mut self) -> &mut BytesMut {
        &mut self.buf
    }
}

impl Drop for PooledBuffer<'_> {
    fn drop(&mut self) {
        let mut buf = std::mem::take(&mut self.buf);
        buf.clear();
        if let Ok(mut free) = self.pool.free.lock() {
            free.push(buf);
        }
    }
}

/// Writes a byte source onto a session as INSTREAM chunks.
pub struct ChunkStreamer<R> {
    source: R,
    chunk_size: usize,
    max_stream_size: u64,
    pool: BufferPool,
}

impl<R> ChunkStreamer<R>
where
    R: AsyncRead + Unpin + Send,
{
    pub fn new(source: R, chunk_size: usize, max_stream_size: u64) -> Self {
        Self {
            source,
            chunk_size,
            max_stream_size,
            pool: BufferPool::new(LENGTH_PREFIX + chunk_size),
        }
    }

    /// Streams the whole source followed by the terminator and returns the
    /// number of payload bytes sent.
    ///
    /// Fails with [`Error::MaxStreamSizeExceeded`] as soon as more than the
    /// configured maximum has been read from the source; the offending chunk
    /// and the terminator are not sent.
    pub async fn stream_to<S>(&mut self, session: &mut Session<S>) -> Result<u64>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let Self {
            source,
            chunk_size,
            max_stream_size,
            pool,
        } = self;

        let mut buf = pool.acquire();
        let mut total: u64 = 0;
        let mut chunks = 0usize;

        loop {
            buf.clear();
            buf.put_u32(0);
            buf.resize(LENGTH_PREFIX + *chunk_size, 0);

            let cancel = session.cancellation().clone();
            let n = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    warn!("INSTREAM upload cancelled after {} bytes", total);
                    return Err(Error::Cancelled);
                }
                res = source.read(&mut buf[LENGTH_PREFIX..]) => res?,
            };
            if n == 0 {
                break;
            }

            total += n as u64;
            if total > *max_stream_size {
                warn!(
                    "INSTREAM upload aborted: {} bytes read exceeds limit of {}",
                    total, max_stream_size
                );
                return Err(Error::MaxStreamSizeExceeded {
                    limit: *max_stream_size,
                });
            }

            // n <= chunk_size, which config validation keeps within u32
            buf[..LENGTH_PREFIX].copy_from_slice(&(n as u32).to_be_bytes());
            session.write_all(&buf[..LENGTH_PREFIX + n]).await?;
            chunks += 1;
        }

        session.write_all(&TERMINATOR).await?;
        debug!("INSTREAM sent {} bytes in {} chunks", total, chunks);

        Ok(total)
    }

    pub fn pool(&self) -> &BufferPool {
        &self.pool
    }
}

#[async_trait]
impl<R, S> Payload<S> for ChunkStreamer<R>
where
    R: AsyncRead + Unpin + Send,
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn send(&mut self, session: &mut Session<S>) -> Result<()> {
        self.stream_to(session).await.map(|_| ())
    }
}
