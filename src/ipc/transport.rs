//! Line-delimited transport over a pair of byte streams.
//!
//! The API peer reads one JSON object from its input without any framing
//! and answers with exactly one `\n`-terminated line. [`Transport`] is the
//! narrow seam the pool and dispatcher depend on, so they can be exercised
//! against in-memory streams instead of a real subprocess.
//!
//! # Wire Format
//!
//! ```text
//! -> {"method":"list","params":{"options":{}}}
//! <- {"result":{"conversations":[...]}}\n
//! ```

use async_trait::async_trait;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{BotError, Result};

/// Maximum response line size (100MB) to prevent OOM from a misbehaving peer.
pub const MAX_LINE_SIZE: usize = 100 * 1024 * 1024;

/// One request/response channel to the API peer.
#[async_trait]
pub trait Transport: Send {
    /// Write a full request payload and flush it.
    async fn send(&mut self, payload: &[u8]) -> Result<()>;

    /// Read exactly one newline-terminated line, without the terminator.
    ///
    /// Returns [`BotError::Disconnected`] when the stream closes first.
    async fn read_line(&mut self) -> Result<String>;

    /// Release the input side and reap whatever backs the transport.
    async fn close(&mut self) -> Result<()>;
}

/// [`Transport`] over any buffered reader and writer pair.
pub struct LineTransport<R, W> {
    reader: R,
    writer: Option<W>,
}

impl<R, W> LineTransport<R, W>
where
    R: AsyncBufRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    pub fn new(reader: R, writer: W) -> Self {
        Self {
            reader,
            writer: Some(writer),
        }
    }
}

#[async_trait]
impl<R, W> Transport for LineTransport<R, W>
where
    R: AsyncBufRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    async fn send(&mut self, payload: &[u8]) -> Result<()> {
        let writer = self.writer.as_mut().ok_or(BotError::Disconnected)?;
        writer.write_all(payload).await?;
        writer.flush().await?;
        Ok(())
    }

    async fn read_line(&mut self) -> Result<String> {
        read_bounded_line(&mut self.reader).await
    }

    async fn close(&mut self) -> Result<()> {
        if let Some(mut writer) = self.writer.take() {
            // The peer may already be gone; a failed shutdown is not an error here.
            let _ = writer.shutdown().await;
        }
        Ok(())
    }
}

/// Read one `\n`-terminated line of at most [`MAX_LINE_SIZE`] bytes.
///
/// A stream that ends before the terminator is treated as disconnected. An
/// oversized line is skipped up to its terminator before the error is
/// returned, so the next read starts on a fresh line.
pub async fn read_bounded_line<R>(reader: &mut R) -> Result<String>
where
    R: AsyncBufRead + Unpin + Send,
{
    read_line_limited(reader, MAX_LINE_SIZE).await
}

async fn read_line_limited<R>(reader: &mut R, max: usize) -> Result<String>
where
    R: AsyncBufRead + Unpin + Send,
{
    let mut buf = Vec::new();
    let read = (&mut *reader)
        .take(max as u64 + 1)
        .read_until(b'\n', &mut buf)
        .await?;

    if read == 0 {
        return Err(BotError::Disconnected);
    }
    if buf.last() != Some(&b'\n') {
        if buf.len() > max {
            skip_line(reader).await?;
            return Err(BotError::Decode(format!("line exceeds maximum {} bytes", max)));
        }
        return Err(BotError::Disconnected);
    }

    buf.pop();
    if buf.last() == Some(&b'\r') {
        buf.pop();
    }
    String::from_utf8(buf).map_err(|e| BotError::Decode(format!("line is not valid UTF-8: {}", e)))
}

/// Discard input through the next `\n` without buffering it.
async fn skip_line<R>(reader: &mut R) -> Result<()>
where
    R: AsyncBufRead + Unpin + Send,
{
    loop {
        let available = reader.fill_buf().await?;
        if available.is_empty() {
            return Ok(());
        }
        match available.iter().position(|b| *b == b'\n') {
            Some(end) => {
                reader.consume(end + 1);
                return Ok(());
            }
            None => {
                let len = available.len();
                reader.consume(len);
            }
        }
    }
}
