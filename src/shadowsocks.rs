//! Shadowsocks AEAD record layer over TCP, and the `ss://` client and
//! server.
//!
//! Wire format, repeated per chunk (ciphertext):
//!
//! ```text
//! +--------------+---------------+--------------+------------+
//! |  *DataLen*   |  DataLen_TAG  |    *Data*    |  Data_TAG  |
//! +--------------+---------------+--------------+------------+
//! |      2       |      16       |   Variable   |     16     |
//! +--------------+---------------+--------------+------------+
//! ```
//!
//! A random salt of key-size bytes precedes the first chunk in each
//! direction; both Seals inside a chunk consume one nonce increment.

use std::time::Duration;

use async_trait::async_trait;
use rand::rngs::OsRng;
use rand::RngCore;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;
use url::Url;

use crate::addr::{encode_addr, read_addr, TargetAddr};
use crate::cipher::{AeadState, Cipher, Method, TAG_SIZE};
use crate::error::{Error, Result};
use crate::registry::{url_host_port, Client, Server};
use crate::stream::{bridge, read_full_or_eof, BoxedStream, FrameRead, FrameWrite};

pub const NAME: &str = "ss";

/// Deadline for the leading target address on the server side,
/// overridable with a `timeout` query key (seconds).
const DEFAULT_REQUEST_TIMEOUT: u64 = 300;

/// Maximum plaintext bytes per chunk; the length field is masked to
/// 14 bits on the wire.
pub const MAX_PAYLOAD: usize = 0x3FFF;

/// Decrypting side of one connection direction.
///
/// The first read consumes the salt and binds the cipher; afterwards
/// each chunk is opened whole and any bytes beyond the caller's buffer
/// are stashed as leftover for the next call.
pub struct AeadReader<R> {
    inner: R,
    cipher: Cipher,
    state: Option<AeadState>,
    leftover: Vec<u8>,
    pos: usize,
}

impl<R> AeadReader<R>
where
    R: AsyncRead + Unpin + Send,
{
    pub fn new(inner: R, cipher: Cipher) -> Self {
        AeadReader {
            inner,
            cipher,
            state: None,
            leftover: Vec::new(),
            pos: 0,
        }
    }

    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if self.pos < self.leftover.len() {
            let n = (self.leftover.len() - self.pos).min(buf.len());
            buf[..n].copy_from_slice(&self.leftover[self.pos..self.pos + n]);
            self.pos += n;
            return Ok(n);
        }

        if self.state.is_none() {
            let mut salt = vec![0u8; self.cipher.salt_size()];
            if !read_full_or_eof(&mut self.inner, &mut salt).await? {
                return Ok(0);
            }
            self.state = Some(self.cipher.state(&salt)?);
        }
        let state = self.state.as_mut().expect("decrypt state initialized");

        let mut sealed_len = [0u8; 2 + TAG_SIZE];
        if !read_full_or_eof(&mut self.inner, &mut sealed_len).await? {
            return Ok(0);
        }
        let len_bytes = state.open(&sealed_len)?;
        let size = ((len_bytes[0] as usize) << 8 | len_bytes[1] as usize) & MAX_PAYLOAD;

        let mut sealed = vec![0u8; size + TAG_SIZE];
        if !read_full_or_eof(&mut self.inner, &mut sealed).await? {
            return Err(Error::protocol("truncated aead chunk"));
        }
        let payload = state.open(&sealed)?;

        let n = payload.len().min(buf.len());
        buf[..n].copy_from_slice(&payload[..n]);
        if n < payload.len() {
            self.leftover = payload;
            self.pos = n;
        }
        Ok(n)
    }

    #[cfg(test)]
    fn nonce_value(&self) -> u128 {
        self.state.as_ref().map(|s| s.nonce_value()).unwrap_or(0)
    }
}

/// Encrypting side of one connection direction.
///
/// The first write generates the salt, sends it, and binds the cipher.
/// Oversized inputs are split across chunks within a single call; the
/// call returns only once everything is on the socket.
pub struct AeadWriter<W> {
    inner: W,
    cipher: Cipher,
    state: Option<AeadState>,
}

impl<W> AeadWriter<W>
where
    W: AsyncWrite + Unpin + Send,
{
    pub fn new(inner: W, cipher: Cipher) -> Self {
        AeadWriter {
            inner,
            cipher,
            state: None,
        }
    }

    pub async fn write(&mut self, buf: &[u8]) -> Result<()> {
        if self.state.is_none() {
            let mut salt = vec![0u8; self.cipher.salt_size()];
            OsRng.fill_bytes(&mut salt);
            self.state = Some(self.cipher.state(&salt)?);
            self.inner.write_all(&salt).await?;
        }
        let state = self.state.as_mut().expect("encrypt state initialized");

        for chunk in buf.chunks(MAX_PAYLOAD) {
            let len_bytes = (chunk.len() as u16).to_be_bytes();
            let mut out = state.seal(&len_bytes)?;
            out.extend_from_slice(&state.seal(chunk)?);
            self.inner.write_all(&out).await?;
        }
        Ok(())
    }

    pub async fn shutdown(&mut self) -> Result<()> {
        self.inner.shutdown().await?;
        Ok(())
    }

    #[cfg(test)]
    fn nonce_value(&self) -> u128 {
        self.state.as_ref().map(|s| s.nonce_value()).unwrap_or(0)
    }
}

#[async_trait]
impl<R: AsyncRead + Unpin + Send> FrameRead for AeadReader<R> {
    async fn read_frame(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.read(buf).await
    }
}

#[async_trait]
impl<W: AsyncWrite + Unpin + Send> FrameWrite for AeadWriter<W> {
    async fn write_frame(&mut self, buf: &[u8]) -> Result<()> {
        self.write(buf).await
    }

    async fn finish(&mut self) -> Result<()> {
        self.shutdown().await
    }
}

/// `ss://method:password@host:port` → address + cipher. With no
/// password part the username is the password and the method comes
/// from a `method` query key; the method defaults to aes-128-gcm.
fn parse_url(url: &Url) -> Result<(String, Cipher)> {
    let addr = url_host_port(url)?;

    let (mut method_name, password) = match url.password() {
        Some(p) => (url.username().to_string(), p.to_string()),
        None => (String::new(), url.username().to_string()),
    };
    if method_name.is_empty() {
        method_name = url
            .query_pairs()
            .find(|(k, _)| k == "method")
            .map(|(_, v)| v.to_string())
            .unwrap_or_default();
    }

    let method = Method::from_name(&method_name)?;
    let cipher = Cipher::new(method, &password)?;
    Ok((addr, cipher))
}

/// Shadowsocks AEAD egress client.
pub struct ShadowsocksClient {
    addr: String,
    cipher: Cipher,
}

impl ShadowsocksClient {
    pub fn new(url: &Url) -> Result<ShadowsocksClient> {
        let (addr, cipher) = parse_url(url)?;
        Ok(ShadowsocksClient { addr, cipher })
    }
}

#[async_trait]
impl Client for ShadowsocksClient {
    fn name(&self) -> &'static str {
        NAME
    }

    fn addr(&self) -> &str {
        &self.addr
    }

    async fn handshake(&self, underlay: BoxedStream, target: &TargetAddr) -> Result<BoxedStream> {
        let (r, w) = tokio::io::split(underlay);
        let reader = AeadReader::new(r, self.cipher.clone());
        let mut writer = AeadWriter::new(w, self.cipher.clone());

        // Target address is the first encrypted payload.
        let mut head = Vec::with_capacity(1 + 1 + 255 + 2);
        encode_addr(target, &mut head);
        writer.write(&head).await?;

        Ok(bridge(reader, writer))
    }
}

/// Shadowsocks AEAD ingress server: decrypts the stream and reads the
/// leading target address, then hands the plaintext stream over.
pub struct ShadowsocksServer {
    addr: String,
    cipher: Cipher,
    request_timeout: Duration,
}

impl ShadowsocksServer {
    pub fn new(url: &Url) -> Result<ShadowsocksServer> {
        let (addr, cipher) = parse_url(url)?;
        let secs = url
            .query_pairs()
            .find(|(k, _)| k == "timeout")
            .and_then(|(_, v)| v.parse().ok())
            .unwrap_or(DEFAULT_REQUEST_TIMEOUT);
        Ok(ShadowsocksServer {
            addr,
            cipher,
            request_timeout: Duration::from_secs(secs),
        })
    }
}

#[async_trait]
impl Server for ShadowsocksServer {
    fn name(&self) -> &'static str {
        NAME
    }

    fn addr(&self) -> &str {
        &self.addr
    }

    async fn handshake(&self, underlay: BoxedStream) -> Result<(BoxedStream, TargetAddr)> {
        let (r, w) = tokio::io::split(underlay);
        let mut stream = bridge(
            AeadReader::new(r, self.cipher.clone()),
            AeadWriter::new(w, self.cipher.clone()),
        );

        let (target, _) = timeout(self.request_timeout, read_addr(&mut stream))
            .await
            .map_err(|_| {
                Error::from(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    "timed out reading target address",
                ))
            })??;
        Ok((stream, target))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    const TEXT: &[u8] =
        b"Don't tell me the moon is shining; show me the glint of light on broken glass.";

    fn cipher(method: Method) -> Cipher {
        Cipher::new(method, "foobar").unwrap()
    }

    async fn write_then_read(method: Method, payload: &[u8], read_buf_len: usize) -> Vec<u8> {
        let (near, far) = tokio::io::duplex(256 * 1024);
        let (_, w) = tokio::io::split(near);
        let (r, _) = tokio::io::split(far);

        let mut writer = AeadWriter::new(w, cipher(method));
        writer.write(payload).await.unwrap();
        writer.shutdown().await.unwrap();

        let mut reader = AeadReader::new(r, cipher(method));
        let mut out = Vec::new();
        let mut buf = vec![0u8; read_buf_len];
        loop {
            let n = reader.read(&mut buf).await.unwrap();
            if n == 0 {
                break;
            }
            out.extend_from_slice(&buf[..n]);
        }
        out
    }

    #[tokio::test]
    async fn test_stream_roundtrip_all_methods() {
        for method in [
            Method::Aes128Gcm,
            Method::Aes192Gcm,
            Method::Aes256Gcm,
            Method::ChaCha20Poly1305,
        ] {
            let out = write_then_read(method, TEXT, 4096).await;
            assert_eq!(out, TEXT, "{}", method.name());
        }
    }

    #[tokio::test]
    async fn test_single_chunk_for_small_payload() {
        // 78 bytes fit in one chunk: salt + (2+16) + (78+16) on the wire.
        let (near, far) = tokio::io::duplex(256 * 1024);
        let (_, w) = tokio::io::split(near);
        let (mut r, _) = tokio::io::split(far);

        let c = cipher(Method::Aes128Gcm);
        let mut writer = AeadWriter::new(w, c.clone());
        writer.write(TEXT).await.unwrap();
        writer.shutdown().await.unwrap();

        let mut wire = Vec::new();
        r.read_to_end(&mut wire).await.unwrap();
        assert_eq!(
            wire.len(),
            c.salt_size() + 2 + TAG_SIZE + TEXT.len() + TAG_SIZE
        );
        assert_eq!(writer.nonce_value(), 2);
    }

    #[tokio::test]
    async fn test_large_write_splits_chunks() {
        let payload = vec![0x5Au8; MAX_PAYLOAD + 1000];
        let out = write_then_read(Method::Aes128Gcm, &payload, 64 * 1024).await;
        assert_eq!(out, payload);

        // Two chunks on the wire, each length-capped at MAX_PAYLOAD.
        let (near, far) = tokio::io::duplex(256 * 1024);
        let (_, w) = tokio::io::split(near);
        let (mut r, _) = tokio::io::split(far);
        let c = cipher(Method::Aes128Gcm);
        let mut writer = AeadWriter::new(w, c.clone());
        writer.write(&payload).await.unwrap();
        writer.shutdown().await.unwrap();

        let mut wire = Vec::new();
        r.read_to_end(&mut wire).await.unwrap();
        let mut state = c.state(&wire[..c.salt_size()]).unwrap();
        let mut off = c.salt_size();
        let mut sizes = Vec::new();
        while off < wire.len() {
            let len_plain = state.open(&wire[off..off + 2 + TAG_SIZE]).unwrap();
            let size = ((len_plain[0] as usize) << 8 | len_plain[1] as usize) & MAX_PAYLOAD;
            assert!(size <= MAX_PAYLOAD);
            off += 2 + TAG_SIZE;
            state.open(&wire[off..off + size + TAG_SIZE]).unwrap();
            off += size + TAG_SIZE;
            sizes.push(size);
        }
        assert_eq!(sizes, vec![MAX_PAYLOAD, 1000]);
        // Four increments for two chunks, per direction.
        assert_eq!(writer.nonce_value(), 4);
    }

    #[tokio::test]
    async fn test_leftover_served_across_small_reads() {
        let out = write_then_read(Method::Aes256Gcm, TEXT, 1).await;
        assert_eq!(out, TEXT);
    }

    #[tokio::test]
    async fn test_reader_nonce_after_chunks() {
        let (near, far) = tokio::io::duplex(256 * 1024);
        let (_, w) = tokio::io::split(near);
        let (r, _) = tokio::io::split(far);

        let mut writer = AeadWriter::new(w, cipher(Method::Aes128Gcm));
        for _ in 0..3 {
            writer.write(b"chunk").await.unwrap();
        }
        writer.shutdown().await.unwrap();

        let mut reader = AeadReader::new(r, cipher(Method::Aes128Gcm));
        let mut buf = [0u8; 64];
        for _ in 0..3 {
            assert_eq!(reader.read(&mut buf).await.unwrap(), 5);
        }
        assert_eq!(reader.read(&mut buf).await.unwrap(), 0);
        // N chunks leave the nonce at 2N.
        assert_eq!(reader.nonce_value(), 6);
    }

    #[tokio::test]
    async fn test_eof_at_salt_boundary() {
        let (near, far) = tokio::io::duplex(4096);
        drop(near);
        let (r, _) = tokio::io::split(far);
        let mut reader = AeadReader::new(r, cipher(Method::Aes128Gcm));
        let mut buf = [0u8; 16];
        assert_eq!(reader.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_truncated_salt_rejected() {
        let (near, mut far) = tokio::io::duplex(4096);
        far.write_all(&[0u8; 7]).await.unwrap();
        drop(far);
        let (r, _) = tokio::io::split(near);
        let mut reader = AeadReader::new(r, cipher(Method::Aes128Gcm));
        let mut buf = [0u8; 16];
        assert!(reader.read(&mut buf).await.is_err());
    }

    #[tokio::test]
    async fn test_tampered_wire_is_fatal() {
        let (near, far) = tokio::io::duplex(256 * 1024);
        let (_, w) = tokio::io::split(near);
        let (mut r, _) = tokio::io::split(far);

        let c = cipher(Method::Aes128Gcm);
        let mut writer = AeadWriter::new(w, c.clone());
        writer.write(TEXT).await.unwrap();
        writer.shutdown().await.unwrap();

        let mut wire = Vec::new();
        r.read_to_end(&mut wire).await.unwrap();
        let idx = c.salt_size() + 1;
        wire[idx] ^= 0xFF;

        let (near2, mut far2) = tokio::io::duplex(256 * 1024);
        far2.write_all(&wire).await.unwrap();
        drop(far2);
        let (r2, _) = tokio::io::split(near2);
        let mut reader = AeadReader::new(r2, c);
        let mut buf = [0u8; 4096];
        let err = reader.read(&mut buf).await.unwrap_err();
        assert!(matches!(err, Error::Crypto(_)));
    }

    #[tokio::test]
    async fn test_client_server_handshake_pair() {
        let (near, far) = tokio::io::duplex(64 * 1024);
        let url = Url::parse("ss://aes-256-gcm:foobar@127.0.0.1:8388").unwrap();
        let client = ShadowsocksClient::new(&url).unwrap();
        let server = ShadowsocksServer::new(&url).unwrap();

        let target = TargetAddr::new("example.com", 443).unwrap();
        let client_task = tokio::spawn(async move {
            client.handshake(Box::new(near), &target).await.unwrap()
        });

        let (mut server_stream, seen) = server.handshake(Box::new(far)).await.unwrap();
        assert_eq!(seen.to_string(), "example.com:443");

        let mut client_stream = client_task.await.unwrap();
        client_stream.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        server_stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        server_stream.write_all(b"pong").await.unwrap();
        client_stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");
    }

    #[tokio::test(start_paused = true)]
    async fn test_server_request_deadline() {
        let (near, far) = tokio::io::duplex(4096);
        let url = Url::parse("ss://aes-128-gcm:pw@127.0.0.1:8388?timeout=1").unwrap();
        let server = ShadowsocksServer::new(&url).unwrap();

        // Never send the address; the deadline must fire.
        let err = match server.handshake(Box::new(far)).await {
            Err(e) => e,
            Ok(_) => panic!("expected error"),
        };
        assert!(matches!(err, Error::Io(ref e) if e.kind() == std::io::ErrorKind::TimedOut));
        drop(near);
    }

    #[test]
    fn test_client_from_url() {
        let url = Url::parse("ss://aes-256-gcm:secret@10.0.0.1:8388").unwrap();
        let client = ShadowsocksClient::new(&url).unwrap();
        assert_eq!(client.addr(), "10.0.0.1:8388");
        assert_eq!(client.cipher.method(), Method::Aes256Gcm);

        // Password-only userinfo, method via query.
        let url = Url::parse("ss://secret@10.0.0.1:8388?method=chacha20-ietf-poly1305").unwrap();
        let client = ShadowsocksClient::new(&url).unwrap();
        assert_eq!(client.cipher.method(), Method::ChaCha20Poly1305);

        // Default method.
        let url = Url::parse("ss://secret@10.0.0.1:8388").unwrap();
        let client = ShadowsocksClient::new(&url).unwrap();
        assert_eq!(client.cipher.method(), Method::Aes128Gcm);

        let url = Url::parse("ss://rc4-md5:secret@10.0.0.1:8388").unwrap();
        assert!(ShadowsocksClient::new(&url).is_err());
    }
}
