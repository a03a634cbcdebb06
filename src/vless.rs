//! VLESS egress client.
//!
//! Request header (client → server):
//!
//! ```text
//! Ver(1)=0 | UUID(16) | AddonLen(1)=0 | Cmd(1)=1 | Port(2 BE) | ATYP(1) | Addr
//! ```
//!
//! Response header (server → client) is `Ver(1)=0 | AddonLen(1) |
//! Addon`, consumed on the first read; addon content is discarded.
//! After the headers both directions carry length-prefixed chunks:
//! `Len(2 BE) | Data(Len)` with `Len <= 16384`.

use async_trait::async_trait;
use rand::Rng;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use url::Url;
use uuid::Uuid;

use crate::addr::TargetAddr;
use crate::error::{Error, Result};
use crate::registry::{url_host_port, Client};
use crate::stream::{bridge, read_full_or_eof, BoxedStream, FrameRead, FrameWrite};

pub const NAME: &str = "vless";

const VERSION: u8 = 0x00;
const CMD_TCP: u8 = 0x01;

/// Maximum chunk payload in the data phase.
pub const MAX_CHUNK: usize = 16 * 1024;

/// A VLESS user identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct User {
    uuid: [u8; 16],
}

impl User {
    /// Parse a canonical hyphenated (or plain hex) UUID string.
    pub fn parse(s: &str) -> Result<User> {
        let uuid = Uuid::parse_str(s).map_err(|_| Error::config(format!("invalid UUID: {}", s)))?;
        Ok(User {
            uuid: *uuid.as_bytes(),
        })
    }

    pub fn uuid(&self) -> &[u8; 16] {
        &self.uuid
    }
}

pub struct VlessClient {
    addr: String,
    users: Vec<User>,
}

impl VlessClient {
    pub fn new(url: &Url) -> Result<VlessClient> {
        let addr = url_host_port(url)?;
        let user = User::parse(url.username())?;

        let encryption = url
            .query_pairs()
            .find(|(k, _)| k == "encryption")
            .map(|(_, v)| v.to_string())
            .unwrap_or_default();
        if !encryption.is_empty() && encryption != "none" {
            return Err(Error::unsupported(format!(
                "unsupported vless encryption '{}'",
                encryption
            )));
        }

        Ok(VlessClient {
            addr,
            users: vec![user],
        })
    }

    fn request_header(user: &User, target: &TargetAddr) -> Vec<u8> {
        let mut buf = Vec::with_capacity(21 + 1 + 255 + 2);
        buf.push(VERSION);
        buf.extend_from_slice(user.uuid());
        buf.push(0x00); // addon data length
        buf.push(CMD_TCP);
        buf.extend_from_slice(&target.port().to_be_bytes());
        buf.push(target.atyp());
        target.write_host(&mut buf);
        buf
    }
}

#[async_trait]
impl Client for VlessClient {
    fn name(&self) -> &'static str {
        NAME
    }

    fn addr(&self) -> &str {
        &self.addr
    }

    async fn handshake(&self, mut underlay: BoxedStream, target: &TargetAddr) -> Result<BoxedStream> {
        let user = &self.users[rand::thread_rng().gen_range(0..self.users.len())];
        underlay
            .write_all(&Self::request_header(user, target))
            .await?;

        let (r, w) = tokio::io::split(underlay);
        Ok(bridge(ChunkedReader::new(r), ChunkedWriter::new(w)))
    }
}

/// Reads the response header on first use, then `Len | Data` chunks.
/// A zero-length chunk closes the stream.
pub struct ChunkedReader<R> {
    inner: R,
    header_done: bool,
    leftover: Vec<u8>,
    pos: usize,
}

impl<R> ChunkedReader<R>
where
    R: AsyncRead + Unpin + Send,
{
    pub fn new(inner: R) -> Self {
        ChunkedReader {
            inner,
            header_done: false,
            leftover: Vec::new(),
            pos: 0,
        }
    }

    async fn read_response_header(&mut self) -> Result<()> {
        let mut head = [0u8; 2];
        self.inner.read_exact(&mut head).await?;
        if head[0] != VERSION {
            return Err(Error::protocol("unexpected response version"));
        }
        let addon_len = head[1] as usize;
        if addon_len > 0 {
            let mut addons = vec![0u8; addon_len];
            self.inner.read_exact(&mut addons).await?;
            // Addon content is discarded.
        }
        Ok(())
    }

    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if self.pos < self.leftover.len() {
            let n = (self.leftover.len() - self.pos).min(buf.len());
            buf[..n].copy_from_slice(&self.leftover[self.pos..self.pos + n]);
            self.pos += n;
            return Ok(n);
        }

        if !self.header_done {
            self.read_response_header().await?;
            self.header_done = true;
        }

        let mut len_buf = [0u8; 2];
        if !read_full_or_eof(&mut self.inner, &mut len_buf).await? {
            return Ok(0);
        }
        let len = u16::from_be_bytes(len_buf) as usize;
        if len == 0 {
            return Ok(0);
        }
        if len > MAX_CHUNK {
            return Err(Error::protocol(format!("chunk too large: {}", len)));
        }

        let mut data = vec![0u8; len];
        if !read_full_or_eof(&mut self.inner, &mut data).await? {
            return Err(Error::protocol("truncated chunk"));
        }

        let n = data.len().min(buf.len());
        buf[..n].copy_from_slice(&data[..n]);
        if n < data.len() {
            self.leftover = data;
            self.pos = n;
        }
        Ok(n)
    }
}

/// Splits writes into `Len | Data` chunks of at most `MAX_CHUNK` bytes.
pub struct ChunkedWriter<W> {
    inner: W,
}

impl<W> ChunkedWriter<W>
where
    W: AsyncWrite + Unpin + Send,
{
    pub fn new(inner: W) -> Self {
        ChunkedWriter { inner }
    }

    pub async fn write(&mut self, buf: &[u8]) -> Result<()> {
        for chunk in buf.chunks(MAX_CHUNK) {
            let mut out = Vec::with_capacity(2 + chunk.len());
            out.extend_from_slice(&(chunk.len() as u16).to_be_bytes());
            out.extend_from_slice(chunk);
            self.inner.write_all(&out).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl<R: AsyncRead + Unpin + Send> FrameRead for ChunkedReader<R> {
    async fn read_frame(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.read(buf).await
    }
}

#[async_trait]
impl<W: AsyncWrite + Unpin + Send> FrameWrite for ChunkedWriter<W> {
    async fn write_frame(&mut self, buf: &[u8]) -> Result<()> {
        self.write(buf).await
    }

    async fn finish(&mut self) -> Result<()> {
        self.inner.shutdown().await?;
        Ok(())
    }
}
