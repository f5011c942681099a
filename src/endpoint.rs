use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use tokio::net::UdpSocket;
use tracing::{error, trace};

/// This is an abstraction for the hub's datagram socket, introduced to
///  facilitate mocking the I/O part away for testing.
///
/// Sends and receives are non-blocking; the event loop awaits [readable]
///  before draining with [try_recv_from].
#[cfg_attr(test, automock)]
#[async_trait]
pub trait DatagramSocket: Send + Sync + 'static {
    fn try_send_to(&self, to: SocketAddr, datagram: &[u8]) -> io::Result<()>;

    fn try_recv_from(&self, buf: &mut [u8]) -> io::Result<Option<(usize, SocketAddr)>>;

    async fn readable(&self);

    fn local_addr(&self) -> SocketAddr;
}

#[async_trait]
impl DatagramSocket for Arc<UdpSocket> {
    fn try_send_to(&self, to: SocketAddr, datagram: &[u8]) -> io::Result<()> {
        trace!("UDP socket: sending {} bytes to {:?}", datagram.len(), to);
        match UdpSocket::try_send_to(self, datagram, to) {
            Ok(_) => Ok(()),
            // a full send buffer drops the datagram, the protocol's resend
            // machinery recovers reliable traffic
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                trace!("UDP socket: send buffer full, dropping datagram to {:?}", to);
                Ok(())
            }
            Err(e) => {
                error!("error sending UDP datagram to {:?}: {}", to, e);
                Err(e)
            }
        }
    }

    fn try_recv_from(&self, buf: &mut [u8]) -> io::Result<Option<(usize, SocketAddr)>> {
        match UdpSocket::try_recv_from(self, buf) {
            Ok((n, from)) => Ok(Some((n, from))),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn readable(&self) {
        if let Err(e) = UdpSocket::readable(self).await {
            error!("error waiting for UDP socket readability: {}", e);
        }
    }

    fn local_addr(&self) -> SocketAddr {
        UdpSocket::local_addr(self).expect("UdpSocket should have an initialized local addr")
    }
}

/// Binds a UDP socket for a hub. `port` 0 picks an ephemeral port.
pub async fn bind(addr: &str) -> anyhow::Result<Arc<UdpSocket>> {
    let socket = UdpSocket::bind(addr).await?;
    trace!("bound UDP socket at {:?}", socket.local_addr()?);
    Ok(Arc::new(socket))
}
