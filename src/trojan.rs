//! Trojan egress client.
//!
//! Request, sent once before the raw stream begins:
//!
//! ```text
//! hex(SHA-224(password)) (56) | CRLF | CMD(1)=1 | ATYP | Addr | Port(2 BE) | CRLF
//! ```
//!
//! There is no response header; the server starts forwarding
//! immediately. The wrapped connection counts bytes both ways and
//! logs them when it is dropped.

use std::collections::HashMap;
use std::io;
use std::pin::Pin;
use std::sync::{Arc, RwLock};
use std::task::{Context, Poll};

use async_trait::async_trait;
use sha2::{Digest, Sha224};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tracing::info;
use url::Url;

use crate::addr::TargetAddr;
use crate::error::{Error, Result};
use crate::registry::{url_host_port, Client};
use crate::stream::{human_bytes, BoxedStream};

pub const NAME: &str = "trojan";

const CRLF: [u8; 2] = [0x0D, 0x0A];
const CMD_CONNECT: u8 = 0x01;

/// Lowercase hex of SHA-224(password), exactly 56 ASCII bytes.
pub fn hex_sha224(password: &str) -> String {
    hex::encode(Sha224::digest(password.as_bytes()))
}

/// A trojan credential.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct User {
    hex: String,
}

impl User {
    pub fn new(password: &str) -> User {
        User {
            hex: hex_sha224(password),
        }
    }

    pub fn hex(&self) -> &str {
        &self.hex
    }
}

/// Credential store keyed both by password and by hex fingerprint.
///
/// Two locks guard the two maps; writers always take the password map
/// first, then the hex map, so lock order is fixed.
pub struct UserManager {
    users: RwLock<HashMap<String, Arc<User>>>,
    hexs: RwLock<HashMap<String, Arc<User>>>,
}

impl UserManager {
    pub fn new<I, S>(passwords: I) -> UserManager
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let m = UserManager {
            users: RwLock::new(HashMap::new()),
            hexs: RwLock::new(HashMap::new()),
        };
        for password in passwords {
            // Duplicates in the seed list are fine to ignore.
            let _ = m.add_user(password.as_ref());
        }
        m
    }

    pub fn add_user(&self, password: &str) -> Result<Arc<User>> {
        let mut users = self.users.write().expect("user map lock poisoned");
        if users.contains_key(password) {
            return Err(Error::auth("user already exists"));
        }
        let user = Arc::new(User::new(password));
        users.insert(password.to_string(), user.clone());

        let mut hexs = self.hexs.write().expect("hex map lock poisoned");
        hexs.insert(user.hex.clone(), user.clone());
        Ok(user)
    }

    /// Look a user up by hex fingerprint.
    pub fn check_hex(&self, hex: &str) -> Result<Arc<User>> {
        let hexs = self.hexs.read().expect("hex map lock poisoned");
        hexs.get(hex)
            .cloned()
            .ok_or_else(|| Error::auth(format!("hex {} not found", hex)))
    }

    pub fn get(&self, password: &str) -> Option<Arc<User>> {
        let users = self.users.read().expect("user map lock poisoned");
        users.get(password).cloned()
    }
}

pub struct TrojanClient {
    addr: String,
    user: Arc<User>,
    // Single credential today; the manager keeps the lookup surface
    // for configurations that add more.
    #[allow(dead_code)]
    users: Arc<UserManager>,
}

impl TrojanClient {
    pub fn new(url: &Url) -> Result<TrojanClient> {
        let addr = url_host_port(url)?;
        let password = url.username();
        if password.is_empty() {
            return Err(Error::config("missing trojan password"));
        }
        let users = Arc::new(UserManager::new([password]));
        let user = users
            .get(password)
            .ok_or_else(|| Error::auth("credential not registered"))?;
        Ok(TrojanClient { addr, user, users })
    }

    fn request(user: &User, target: &TargetAddr) -> Vec<u8> {
        let mut buf = Vec::with_capacity(56 + 2 + 2 + 1 + 255 + 2 + 2);
        buf.extend_from_slice(user.hex().as_bytes());
        buf.extend_from_slice(&CRLF);
        buf.push(CMD_CONNECT);
        buf.push(target.atyp());
        target.write_host(&mut buf);
        buf.extend_from_slice(&target.port().to_be_bytes());
        buf.extend_from_slice(&CRLF);
        buf
    }
}

#[async_trait]
impl Client for TrojanClient {
    fn name(&self) -> &'static str {
        NAME
    }

    fn addr(&self) -> &str {
        &self.addr
    }

    async fn handshake(&self, mut underlay: BoxedStream, target: &TargetAddr) -> Result<BoxedStream> {
        let request = Self::request(&self.user, target);
        underlay.write_all(&request).await?;
        Ok(Box::new(CountedStream {
            inner: underlay,
            target: target.to_string(),
            sent: request.len() as u64,
            recv: 0,
        }))
    }
}

/// Transparent wrapper tracking per-connection traffic.
struct CountedStream {
    inner: BoxedStream,
    target: String,
    sent: u64,
    recv: u64,
}

impl AsyncRead for CountedStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let me = self.get_mut();
        let before = buf.filled().len();
        match Pin::new(&mut me.inner).poll_read(cx, buf) {
            Poll::Ready(Ok(())) => {
                me.recv += (buf.filled().len() - before) as u64;
                Poll::Ready(Ok(()))
            }
            other => other,
        }
    }
}

impl AsyncWrite for CountedStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let me = self.get_mut();
        match Pin::new(&mut me.inner).poll_write(cx, buf) {
            Poll::Ready(Ok(n)) => {
                me.sent += n as u64;
                Poll::Ready(Ok(n))
            }
            other => other,
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

impl Drop for CountedStream {
    fn drop(&mut self) {
        info!(
            "connection to {} closed, sent: {}, recv: {}",
            self.target,
            human_bytes(self.sent),
            human_bytes(self.recv)
        );
    }
}
