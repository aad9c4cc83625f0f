//! Byte-stream link with line framing.
//!
//! Covers every transport that presents as a raw byte pipe: the TCP port
//! of a Wi-Fi adapter, a serial port handed in as an async stream, or an
//! in-memory duplex in tests. Frames are delimited by CR, LF or the
//! adapter's `>` prompt; outgoing commands are sent verbatim (the caller
//! appends its configured terminator).

use crate::error::{Error, Result};
use crate::frame::Codec;
use crate::transport::{Adapter, Link};
use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, trace, warn};

/// Unframed noise cap. Telemetry lines are ~40 bytes.
const MAX_BUF: usize = 8192;

pub struct StreamLink<S> {
    io: Option<S>,
    buf: Vec<u8>,
}

impl<S> StreamLink<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(io: S) -> Self {
        Self {
            io: Some(io),
            buf: Vec::new(),
        }
    }

    /// Pop the next non-empty line out of the accumulation buffer.
    fn take_line(&mut self) -> Option<Vec<u8>> {
        loop {
            let end = self
                .buf
                .iter()
                .position(|&b| b == b'\r' || b == b'\n' || b == b'>')?;
            let line: Vec<u8> = self.buf.drain(..=end).take(end).collect();
            if line.iter().any(|b| !b.is_ascii_whitespace()) {
                return Some(line);
            }
        }
    }
}

#[async_trait]
impl<S> Link for StreamLink<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn send(&mut self, bytes: &[u8]) -> Result<()> {
        let io = self.io.as_mut().ok_or(Error::NotConnected)?;
        trace!(tx = %String::from_utf8_lossy(bytes).trim(), "stream send");
        io.write_all(bytes).await?;
        io.flush().await?;
        Ok(())
    }

    async fn recv(&mut self) -> Option<Result<Vec<u8>>> {
        loop {
            if let Some(line) = self.take_line() {
                return Some(Ok(line));
            }
            let io = self.io.as_mut()?;

            let mut chunk = [0u8; 256];
            match io.read(&mut chunk).await {
                Ok(0) => {
                    debug!("stream closed by peer");
                    self.io = None;
                    return None;
                }
                Ok(n) => {
                    self.buf.extend_from_slice(&chunk[..n]);
                    if self.buf.len() > MAX_BUF {
                        warn!(len = self.buf.len(), "unframed input overflow, resetting buffer");
                        self.buf.clear();
                    }
                }
                Err(e) => {
                    self.io = None;
                    return Some(Err(Error::Io(e)));
                }
            }
        }
    }

    fn codec(&self) -> Codec {
        Codec::AsciiHex
    }

    async fn close(&mut self) {
        if let Some(mut io) = self.io.take() {
            let _ = io.shutdown().await;
        }
    }
}

/// Connects to the TCP listener exposed by Wi-Fi ELM-style adapters
/// (conventionally port 35000).
pub struct TcpAdapter;

#[async_trait]
impl Adapter for TcpAdapter {
    async fn is_available(&self) -> bool {
        true
    }

    async fn connect(&self, target: &str) -> Result<Box<dyn Link>> {
        let stream = TcpStream::connect(target)
            .await
            .map_err(|e| Error::Transport(format!("{target}: {e}")))?;
        if let Err(e) = stream.set_nodelay(true) {
            warn!(error = %e, "could not disable Nagle on adapter socket");
        }
        debug!(target, "tcp adapter connected");
        Ok(Box::new(StreamLink::new(stream)))
    }
}
