//! Accepts incoming TCP transports.

use std::net::SocketAddr;

use tokio::net::TcpListener;
use tracing::info;

use crate::transport::TcpTransport;

pub struct TransportListener {
    inner: TcpListener,
    local_addr: SocketAddr,
}

impl TransportListener {
    /// Bind on all interfaces (IPv4) at the given port. Port 0 picks an
    /// ephemeral port.
    pub async fn bind(port: u16) -> std::io::Result<Self> {
        let inner = TcpListener::bind(("0.0.0.0", port)).await?;
        let local_addr = inner.local_addr()?;
        info!(addr = %local_addr, "Listening for incoming transports");
        Ok(Self { inner, local_addr })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accept the next incoming transport.
    pub async fn accept(&self) -> std::io::Result<TcpTransport> {
        let (stream, _addr) = self.inner.accept().await?;
        TcpTransport::from_stream(stream)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::destination::Destination;

    #[tokio::test]
    async fn test_bind_and_accept() {
        let listener = TransportListener::bind(0).await.unwrap();
        let mut dest_addr = listener.local_addr();
        dest_addr.set_ip("127.0.0.1".parse().unwrap());
        let dest = Destination::from_socket_addr(dest_addr);

        let (outgoing, incoming) =
            tokio::join!(TcpTransport::connect(&dest), listener.accept());

        assert!(outgoing.is_ok());
        let incoming = incoming.unwrap();
        assert!(incoming.incoming());
    }
}
