use std::net::SocketAddr;
use tokio::net::TcpListener;
use tracing::debug;

/// Ephemeral-port echo server for exercising the relay path.
pub struct MockTcpServer {
    listener: TcpListener,
    addr: SocketAddr,
}

impl MockTcpServer {
    pub async fn new() -> std::io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        Ok(Self { listener, addr })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub async fn echo_server(self) {
        while let Ok((mut socket, peer)) = self.listener.accept().await {
            debug!("echo server accepted connection from {}", peer);
            tokio::spawn(async move {
                let (mut r, mut w) = socket.split();
                let _ = tokio::io::copy(&mut r, &mut w).await;
            });
        }
    }
}
