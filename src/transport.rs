use std::io::Result as IoResult;
use std::net::SocketAddr;

use async_trait::async_trait;
use tokio::net::UdpSocket;

/// Maximum size of a datagram read from a transport.
pub const COAP_MTU: usize = 1600;

/// Datagram transport underneath an [`Endpoint`](crate::Endpoint).
#[async_trait]
pub trait Transport: Send + Sync {
    async fn recv_from(&self, buf: &mut [u8]) -> IoResult<(usize, SocketAddr)>;

    async fn send_to(&self, buf: &[u8], peer: SocketAddr) -> IoResult<usize>;

    fn local_addr(&self) -> IoResult<SocketAddr>;
}

#[async_trait]
impl Transport for UdpSocket {
    async fn recv_from(&self, buf: &mut [u8]) -> IoResult<(usize, SocketAddr)> {
        UdpSocket::recv_from(self, buf).await
    }

    async fn send_to(&self, buf: &[u8], peer: SocketAddr) -> IoResult<usize> {
        UdpSocket::send_to(self, buf, peer).await
    }

    fn local_addr(&self) -> IoResult<SocketAddr> {
        UdpSocket::local_addr(self)
    }
}
