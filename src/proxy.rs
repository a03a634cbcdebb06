//! Proxy supervisor: accept loop, per-connection orchestration and the
//! bidirectional relay pumps.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info};

use crate::buffer;
use crate::config::Config;
use crate::direct;
use crate::error::{Error, Result};
use crate::registry::{Client, Registry, Server};
use crate::router::{HostMatcher, RouteDecision, RouteMode, Router};
use crate::stream::BoxedStream;

pub struct Proxy {
    local: Box<dyn Server>,
    remote: Box<dyn Client>,
    direct: Box<dyn Client>,
    router: Router,
}

impl Proxy {
    pub fn new(config: &Config, registry: &Registry) -> Result<Proxy> {
        let local = registry
            .server(&config.local)
            .map_err(|e| Error::config(format!("can not create local server: {}", e)))?;
        let remote = registry
            .client(&config.remote)
            .map_err(|e| Error::config(format!("can not create remote client: {}", e)))?;
        let direct = registry.client("direct://")?;
        let router = Router::new(
            RouteMode::from_name(&config.route),
            HostMatcher::new(&config.rules),
        );
        Ok(Proxy {
            local,
            remote,
            direct,
            router,
        })
    }

    /// Bind the local listener and serve until the listener dies.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let listener = TcpListener::bind(self.local.addr())
            .await
            .map_err(|e| Error::config(format!("can not listen tcp on {}: {}", self.local.addr(), e)))?;
        info!("listening tcp on {}", self.local.addr());
        self.serve(listener).await;
        Ok(())
    }

    /// Accept loop over an already-bound listener.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) {
        loop {
            match listener.accept().await {
                Ok((conn, peer)) => {
                    let proxy = self.clone();
                    tokio::spawn(async move {
                        if let Err(e) = proxy.handle(conn).await {
                            info!("connection from {} ended: {}", peer, e);
                        }
                    });
                }
                Err(e) => {
                    let msg = e.to_string();
                    if msg.contains("closed") {
                        break;
                    }
                    error!("failed to accept connection: {}", e);
                    if msg.contains("too many") {
                        // fd exhaustion: give the runtime room to drain
                        tokio::time::sleep(Duration::from_millis(500)).await;
                    }
                }
            }
        }
    }

    async fn handle(&self, conn: TcpStream) -> Result<()> {
        let (local, target) = self.local.handshake(Box::new(conn)).await?;

        let client = match self.router.pick(&target) {
            RouteDecision::Direct => &self.direct,
            RouteDecision::Proxied => &self.remote,
        };
        // Direct clients have no relay; they are dialed against the
        // target itself.
        let dial_addr = if client.name() == direct::NAME {
            target.to_string()
        } else {
            client.addr().to_string()
        };
        info!("{} to {}", client.name(), target);

        let raw = TcpStream::connect(&dial_addr).await.map_err(|e| {
            Error::from(std::io::Error::new(
                e.kind(),
                format!("failed to dial {}: {}", dial_addr, e),
            ))
        })?;
        let remote = client.handshake(Box::new(raw), &target).await?;

        let (tx, rx) = relay(local, remote).await;
        info!(
            "connection to {} closed, sent {} bytes, received {} bytes",
            target, tx, rx
        );
        Ok(())
    }
}

/// Run both directions until each side is done; the pump that finishes
/// first shuts down its write half so the peer unblocks. Returns
/// (bytes local→remote, bytes remote→local).
pub(crate) async fn relay(local: BoxedStream, remote: BoxedStream) -> (u64, u64) {
    let (mut lr, mut lw) = tokio::io::split(local);
    let (mut rr, mut rw) = tokio::io::split(remote);

    let up = async {
        let copied = copy_pooled(&mut lr, &mut rw).await;
        let _ = rw.shutdown().await;
        copied
    };
    let down = async {
        let copied = copy_pooled(&mut rr, &mut lw).await;
        let _ = lw.shutdown().await;
        copied
    };

    let (up_res, down_res) = tokio::join!(up, down);
    let tx = up_res.unwrap_or_else(|e| {
        debug!("upstream copy ended: {}", e);
        0
    });
    let rx = down_res.unwrap_or_else(|e| {
        debug!("downstream copy ended: {}", e);
        0
    });
    (tx, rx)
}

/// Copy with a pool buffer until EOF; counts bytes moved.
async fn copy_pooled<R, W>(r: &mut R, w: &mut W) -> std::io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = buffer::pool().get();
    let mut total = 0u64;
    loop {
        let n = r.read(&mut buf).await?;
        if n == 0 {
            return Ok(total);
        }
        w.write_all(&buf[..n]).await?;
        total += n as u64;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::MockTcpServer;
    use tokio::io::duplex;
    use tokio::time::{sleep, Duration};

    #[tokio::test]
    async fn test_relay_bidirectional() {
        let (a_near, a_far) = duplex(4096);
        let (b_near, b_far) = duplex(4096);

        let relay_task =
            tokio::spawn(async move { relay(Box::new(a_far), Box::new(b_far)).await });

        let (mut ar, mut aw) = tokio::io::split(a_near);
        let (mut br, mut bw) = tokio::io::split(b_near);

        aw.write_all(b"to-remote").await.unwrap();
        let mut buf = [0u8; 9];
        br.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"to-remote");

        bw.write_all(b"to-local!").await.unwrap();
        ar.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"to-local!");

        aw.shutdown().await.unwrap();
        bw.shutdown().await.unwrap();
        let (tx, rx) = relay_task.await.unwrap();
        assert_eq!(tx, 9);
        assert_eq!(rx, 9);
    }

    #[tokio::test]
    async fn test_proxy_end_to_end_socks5_direct() {
        tracing_subscriber::fmt::try_init().ok();

        let mock = MockTcpServer::new().await.unwrap();
        let target_addr = mock.addr();
        tokio::spawn(mock.echo_server());

        // Bind our own listener so the test learns the port, then use
        // the same per-connection path the supervisor uses.
        let config = Config {
            local: "socks5://127.0.0.1:0".to_string(),
            remote: "direct://".to_string(),
            route: "whitelist".to_string(),
            rules: vec!["127.0.0.1".to_string()],
        };
        let registry = Registry::new();
        let proxy = Arc::new(Proxy::new(&config, &registry).unwrap());

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let proxy_addr = listener.local_addr().unwrap();
        tokio::spawn(proxy.serve(listener));

        sleep(Duration::from_millis(50)).await;

        let mut client = TcpStream::connect(proxy_addr).await.unwrap();
        client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        let mut buf = [0u8; 2];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf, [0x05, 0x00]);

        let mut req = vec![0x05, 0x01, 0x00, 0x01, 127, 0, 0, 1];
        req.extend_from_slice(&target_addr.port().to_be_bytes());
        client.write_all(&req).await.unwrap();
        let mut reply = [0u8; 10];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply[1], 0x00);

        client.write_all(b"echo me").await.unwrap();
        let mut echoed = [0u8; 7];
        client.read_exact(&mut echoed).await.unwrap();
        assert_eq!(&echoed, b"echo me");
    }
}
