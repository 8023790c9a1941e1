//! # Plain TCP Transport
//!
//! [`TcpConnector`] is the default [`ConnectionFactory`]: it resolves the
//! peer address and opens a TCP stream with a bounded connect timeout.
//! Hidden-service transports plug in behind the same trait.
//!
//! [`bind_listener`] binds the RPC server's listening socket.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::net::{TcpListener, TcpStream};
use tracing::trace;

use crate::protocols::{ConnectionFactory, PeerStream};

/// Default time allowed for a TCP handshake.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone, Debug)]
pub struct TcpConnector {
    connect_timeout: Duration,
}

impl TcpConnector {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

impl Default for TcpConnector {
    fn default() -> Self {
        Self::new(DEFAULT_CONNECT_TIMEOUT)
    }
}

#[async_trait]
impl ConnectionFactory for TcpConnector {
    async fn open(&self, addr: &str) -> Result<Box<dyn PeerStream>> {
        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(addr))
            .await
            .with_context(|| format!("connect to {addr} timed out"))?
            .with_context(|| format!("failed to connect to {addr}"))?;
        stream.set_nodelay(true).ok();
        trace!(peer = %addr, "tcp connection opened");
        Ok(Box::new(stream))
    }
}

/// Bind the listening socket for the RPC server.
pub async fn bind_listener(addr: &str) -> Result<TcpListener> {
    TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))
}
