//! How connections reach their peer.

use async_trait::async_trait;
use std::io;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

/// A bidirectional byte stream a connection can run over.
pub trait IoStream: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> IoStream for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

/// Boxed [`IoStream`].
pub type BoxedStream = Box<dyn IoStream>;

/// Opens streams to remote addresses.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Open a stream to `address`.
    async fn connect(&self, address: &str) -> io::Result<BoxedStream>;
}

/// [`Connector`] over TCP.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    nodelay: bool,
}

impl TcpConnector {
    /// TCP connector with Nagle's algorithm disabled.
    #[must_use]
    pub const fn new() -> Self {
        Self { nodelay: true }
    }

    /// Set `TCP_NODELAY` on new streams.
    #[must_use]
    pub const fn nodelay(mut self, nodelay: bool) -> Self {
        self.nodelay = nodelay;
        self
    }
}

impl Default for TcpConnector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, address: &str) -> io::Result<BoxedStream> {
        let stream = TcpStream::connect(address).await?;
        stream.set_nodelay(self.nodelay)?;
        Ok(Box::new(stream))
    }
}
