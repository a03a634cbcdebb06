//! Stream plumbing shared by every protocol.
//!
//! Wrapped connections are trait objects so the supervisor can treat a
//! raw TCP stream, a TLS stream and a framed tunnel uniformly. Framers
//! that reshape the byte stream (Shadowsocks chunks, VLESS chunks) are
//! bridged into a plain `AsyncRead + AsyncWrite` via an in-memory
//! duplex and two translator tasks, one per direction, so each framer
//! direction stays exclusively owned by a single task.

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

use crate::buffer;
use crate::error::{Error, Result};

/// Any stream the proxy can relay.
pub trait ProxyStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> ProxyStream for T {}

pub type BoxedStream = Box<dyn ProxyStream>;

/// Fill `buf` completely, or report a clean end of stream if EOF hits
/// before the first byte. EOF mid-buffer is a protocol violation.
pub(crate) async fn read_full_or_eof<R>(r: &mut R, buf: &mut [u8]) -> Result<bool>
where
    R: AsyncRead + Unpin,
{
    let mut filled = 0;
    while filled < buf.len() {
        let n = r.read(&mut buf[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(false);
            }
            return Err(Error::protocol("truncated record"));
        }
        filled += n;
    }
    Ok(true)
}

/// Read side of a record framer. `read_frame` fills `buf` with
/// decoded payload bytes; `Ok(0)` means clean end of stream.
#[async_trait]
pub trait FrameRead: Send {
    async fn read_frame(&mut self, buf: &mut [u8]) -> Result<usize>;
}

/// Write side of a record framer. `write_frame` encodes and writes the
/// whole input; `finish` flushes and shuts the underlay down.
#[async_trait]
pub trait FrameWrite: Send {
    async fn write_frame(&mut self, buf: &[u8]) -> Result<()>;
    async fn finish(&mut self) -> Result<()>;
}

/// Bridge a framer pair into a plain bidirectional stream.
///
/// The returned stream is what the relay pumps see; the translator
/// tasks end when either side closes, shutting their peer down so the
/// other pump unblocks.
pub fn bridge<R, W>(mut reader: R, mut writer: W) -> BoxedStream
where
    R: FrameRead + 'static,
    W: FrameWrite + 'static,
{
    let (outer, inner) = tokio::io::duplex(buffer::TCP_BUF_SIZE);
    let (mut app_r, mut app_w) = tokio::io::split(inner);

    // plaintext from the app -> framed underlay
    tokio::spawn(async move {
        let mut buf = buffer::pool().get();
        loop {
            match app_r.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if let Err(e) = writer.write_frame(&buf[..n]).await {
                        debug!("frame write ended: {}", e);
                        break;
                    }
                }
            }
        }
        let _ = writer.finish().await;
    });

    // framed underlay -> plaintext to the app
    tokio::spawn(async move {
        let mut buf = buffer::pool().get();
        loop {
            match reader.read_frame(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    if app_w.write_all(&buf[..n]).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    debug!("frame read ended: {}", e);
                    break;
                }
            }
        }
        let _ = app_w.shutdown().await;
    });

    Box::new(outer)
}

const KIB: u64 = 1024;
const MIB: u64 = KIB * 1024;
const GIB: u64 = MIB * 1024;

/// Render a byte count in human-friendly units for close-time logs.
pub fn human_bytes(bytes: u64) -> String {
    if bytes <= KIB {
        format!("{} B", bytes)
    } else if bytes <= MIB {
        format!("{:.2} KiB", bytes as f64 / KIB as f64)
    } else if bytes <= GIB {
        format!("{:.2} MiB", bytes as f64 / MIB as f64)
    } else {
        format!("{:.2} GiB", bytes as f64 / GIB as f64)
    }
}
