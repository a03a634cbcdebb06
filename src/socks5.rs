//! SOCKS5 ingress server (RFC 1928), CONNECT only.
//!
//! ```text
//! greeting : VER NMETHODS METHODS...   ->  VER METHOD(no-auth)
//! request  : VER CMD RSV ATYP ADDR PORT -> VER REP RSV ATYP BND.ADDR BND.PORT
//! ```
//!
//! The bind reply is fixed zeros; clients ignore it by convention. The
//! whole handshake runs under a four second deadline which is cleared
//! on success.

use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::timeout;
use url::Url;

use crate::addr::{read_addr, TargetAddr};
use crate::error::{Error, Result};
use crate::registry::{url_host_port, Server};
use crate::stream::BoxedStream;

pub const NAME: &str = "socks5";

pub const VERSION5: u8 = 0x05;
pub const AUTH_NONE: u8 = 0x00;
pub const CMD_CONNECT: u8 = 0x01;

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(4);

pub struct Socks5Server {
    addr: String,
    // Reserved for password auth; accepted from the URL and ignored.
    #[allow(dead_code)]
    user: String,
    #[allow(dead_code)]
    password: String,
}

impl Socks5Server {
    pub fn new(url: &Url) -> Result<Socks5Server> {
        Ok(Socks5Server {
            addr: url_host_port(url)?,
            user: url.username().to_string(),
            password: url.password().unwrap_or_default().to_string(),
        })
    }

    async fn handshake_inner(&self, conn: &mut BoxedStream) -> Result<TargetAddr> {
        let mut one = [0u8; 1];
        conn.read_exact(&mut one)
            .await
            .map_err(|e| Error::protocol(format!("failed to read socks version: {}", e)))?;
        if one[0] != VERSION5 {
            return Err(Error::protocol(format!("invalid socks version: {}", one[0])));
        }

        conn.read_exact(&mut one)
            .await
            .map_err(|e| Error::protocol(format!("failed to read NMETHODS: {}", e)))?;
        let mut methods = vec![0u8; one[0] as usize];
        conn.read_exact(&mut methods)
            .await
            .map_err(|e| Error::protocol(format!("failed to read methods: {}", e)))?;

        conn.write_all(&[VERSION5, AUTH_NONE])
            .await
            .map_err(|e| Error::protocol(format!("failed to write auth: {}", e)))?;

        // VER CMD RSV
        let mut req = [0u8; 3];
        conn.read_exact(&mut req)
            .await
            .map_err(|e| Error::protocol(format!("failed to read command: {}", e)))?;
        if req[0] != VERSION5 {
            return Err(Error::protocol(format!(
                "invalid socks version in request: {}",
                req[0]
            )));
        }
        let cmd = req[1];

        let (addr, _) = read_addr(conn).await?;

        if cmd != CMD_CONNECT {
            return Err(Error::unsupported(format!("unsupported command {}", cmd)));
        }

        // VER REP RSV ATYP BND.ADDR(0.0.0.0) BND.PORT(0)
        conn.write_all(&[VERSION5, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
            .await
            .map_err(|e| Error::protocol(format!("failed to write command response: {}", e)))?;

        Ok(addr)
    }
}

#[async_trait]
impl Server for Socks5Server {
    fn name(&self) -> &'static str {
        NAME
    }

    fn addr(&self) -> &str {
        &self.addr
    }

    async fn handshake(&self, mut underlay: BoxedStream) -> Result<(BoxedStream, TargetAddr)> {
        let addr = timeout(HANDSHAKE_TIMEOUT, self.handshake_inner(&mut underlay))
            .await
            .map_err(|_| {
                Error::from(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    "socks5 handshake deadline exceeded",
                ))
            })??;
        // Deadline cleared: the data phase is not time-limited.
        Ok((underlay, addr))
    }
}
