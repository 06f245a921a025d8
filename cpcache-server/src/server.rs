//! TCP acceptor: one connection task per accepted socket.

use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::time;

use crate::app::App;
use crate::connection::Connection;

/// The listening server. Binding and running are split so callers (and
/// tests) can learn the bound address before the accept loop starts.
pub struct Server {
    listener: TcpListener,
    app: App,
}

impl Server {
    /// Binds the configured port. With `ipv6_enabled` the socket is
    /// bound on the IPv6 wildcard, which on Linux accepts IPv4 clients
    /// as well; otherwise it is IPv4 only.
    ///
    /// # Errors
    /// Any error from binding the socket.
    pub async fn bind(app: App) -> io::Result<Self> {
        let port = app.config.port;
        let listener = if app.config.ipv6_enabled {
            TcpListener::bind((Ipv6Addr::UNSPECIFIED, port)).await?
        } else {
            TcpListener::bind((Ipv4Addr::UNSPECIFIED, port)).await?
        };
        Ok(Self { listener, app })
    }

    /// The address actually bound, useful when the configured port is 0.
    ///
    /// # Errors
    /// Any error from the socket layer.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accepts connections forever, spawning one task per socket. There
    /// is no connection limit at this layer. Transient accept errors
    /// (e.g. fd exhaustion) are logged and retried after a short pause.
    pub async fn run(self) -> io::Result<()> {
        loop {
            match self.listener.accept().await {
                Ok((stream, peer)) => {
                    let app = self.app.clone();
                    tokio::spawn(async move {
                        Connection::new(app, stream, peer).serve().await;
                    });
                }
                Err(error) => {
                    tracing::warn!(%error, "accept failed");
                    time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }
}
