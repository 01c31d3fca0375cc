//! Client-facing acceptor
//!
//! Binds the proxy's passive socket and runs one [`Session`] task per
//! accepted connection. Session I/O buffers are drawn from a bounded
//! pool and returned when the session ends.

use crate::config::SharedConfig;
use crate::error::Result;
use crate::metrics::Metrics;
use crate::pool::BufferPool;
use crate::proxy::session::Session;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

pub struct ProxyServer {
    listener: TcpListener,
    config: SharedConfig,
    metrics: Arc<Metrics>,
    pool: Arc<BufferPool>,
}

impl ProxyServer {
    /// Bind the client-facing listener.
    pub async fn bind(
        addr: impl tokio::net::ToSocketAddrs,
        config: SharedConfig,
        metrics: Arc<Metrics>,
    ) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        info!("proxy listening on {}", listener.local_addr()?);
        Ok(Self {
            listener,
            config,
            metrics,
            pool: Arc::new(BufferPool::new()),
        })
    }

    /// The bound address (useful when binding port 0).
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept clients forever.
    pub async fn run(self) -> Result<()> {
        loop {
            let (stream, peer) = match self.listener.accept().await {
                Ok(accepted) => accepted,
                Err(err) => {
                    warn!("accept failed: {}", err);
                    continue;
                }
            };
            debug!("accepted client {}", peer);
            self.metrics.connection_opened();

            let session = Session::new(
                stream,
                peer,
                self.pool.acquire(),
                self.config.clone(),
                self.metrics.clone(),
            );
            let pool = self.pool.clone();
            tokio::spawn(async move {
                let buffers = session.run().await;
                pool.release(buffers);
            });
        }
    }
}
