use std::net::{Ipv4Addr, SocketAddr};

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tokio::net::{TcpListener, TcpStream};
use tracing::info;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenerOptions {
    /// Port 0 picks a free one, see [`ListenResult::addr`].
    pub listen_addr: SocketAddr,
}

impl Default for ListenerOptions {
    fn default() -> Self {
        Self {
            listen_addr: (Ipv4Addr::UNSPECIFIED, 6881).into(),
        }
    }
}

pub(crate) struct ListenResult {
    pub tcp_socket: TcpListener,
    pub addr: SocketAddr,
}

impl ListenerOptions {
    pub(crate) async fn start(&self) -> anyhow::Result<ListenResult> {
        let tcp_socket = TcpListener::bind(self.listen_addr)
            .await
            .with_context(|| format!("error binding TCP to {}", self.listen_addr))?;
        let addr = tcp_socket
            .local_addr()
            .context("error getting local address of the TCP listener")?;
        info!(%addr, "listening for peers over TCP");
        Ok(ListenResult { tcp_socket, addr })
    }
}

pub(crate) async fn accept(listener: &TcpListener) -> anyhow::Result<(TcpStream, SocketAddr)> {
    let (stream, addr) = listener.accept().await.context("error accepting TCP")?;
    // Small writes (Have, Request) shouldn't sit in Nagle's buffer.
    stream.set_nodelay(true).context("error setting TCP_NODELAY")?;
    Ok((stream, addr))
}
