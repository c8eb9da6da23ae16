//! Byte transport under the connection manager

use log::debug;
use parking_lot::Mutex;
use shared::MAX_PACKET_SIZE;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use thiserror::Error;
use tokio::net::UdpSocket;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport is not connected")]
    NotConnected,
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type TransportFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, TransportError>> + Send + 'a>>;

/// A datagram or stream carrier for framed payloads
///
/// Implementations carry bytes only; framing, codecs and compression are the
/// wire protocol's business.
pub trait Transport: Send + Sync {
    fn connect(&self) -> TransportFuture<'_, ()>;
    fn send<'a>(&'a self, bytes: &'a [u8]) -> TransportFuture<'a, ()>;
    fn receive(&self) -> TransportFuture<'_, Vec<u8>>;
    fn close(&self) -> TransportFuture<'_, ()>;
}

/// UDP transport bound to a single server address
///
/// Reconnecting rebinds the same local port when it is still free, so the
/// server recognises the returning client by address.
pub struct UdpTransport {
    server_addr: SocketAddr,
    socket: Mutex<Option<Arc<UdpSocket>>>,
    local_addr: Mutex<Option<SocketAddr>>,
}

impl UdpTransport {
    pub fn new(server_addr: SocketAddr) -> Self {
        Self {
            server_addr,
            socket: Mutex::new(None),
            local_addr: Mutex::new(None),
        }
    }

    pub fn server_addr(&self) -> SocketAddr {
        self.server_addr
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }

    fn socket(&self) -> Result<Arc<UdpSocket>, TransportError> {
        self.socket
            .lock()
            .as_ref()
            .map(Arc::clone)
            .ok_or(TransportError::NotConnected)
    }

    async fn bind(&self) -> io::Result<UdpSocket> {
        let previous = *self.local_addr.lock();
        if let Some(previous) = previous {
            match UdpSocket::bind(previous).await {
                Ok(socket) => return Ok(socket),
                Err(e) => debug!("Could not rebind {}: {}", previous, e),
            }
        }
        let any: SocketAddr = if self.server_addr.is_ipv4() {
            SocketAddr::from(([0, 0, 0, 0], 0))
        } else {
            SocketAddr::from(([0u16; 8], 0))
        };
        UdpSocket::bind(any).await
    }
}

impl Transport for UdpTransport {
    fn connect(&self) -> TransportFuture<'_, ()> {
        Box::pin(async move {
            // Release the old port before trying to rebind it.
            self.socket.lock().take();

            let socket = self.bind().await?;
            socket.connect(self.server_addr).await?;
            *self.local_addr.lock() = Some(socket.local_addr()?);
            *self.socket.lock() = Some(Arc::new(socket));
            Ok(())
        })
    }

    fn send<'a>(&'a self, bytes: &'a [u8]) -> TransportFuture<'a, ()> {
        Box::pin(async move {
            let socket = self.socket()?;
            socket.send(bytes).await?;
            Ok(())
        })
    }

    fn receive(&self) -> TransportFuture<'_, Vec<u8>> {
        Box::pin(async move {
            let socket = self.socket()?;
            let mut buffer = vec![0u8; MAX_PACKET_SIZE];
            let len = socket.recv(&mut buffer).await?;
            buffer.truncate(len);
            Ok(buffer)
        })
    }

    fn close(&self) -> TransportFuture<'_, ()> {
        Box::pin(async move {
            self.socket.lock().take();
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_err, assert_ok};

    #[tokio::test]
    async fn test_send_before_connect_fails() {
        let transport = UdpTransport::new("127.0.0.1:9".parse().unwrap());
        assert!(matches!(
            transport.send(b"hello").await,
            Err(TransportError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_round_trip_through_echo_socket() {
        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let transport = UdpTransport::new(peer.local_addr().unwrap());
        assert_ok!(transport.connect().await);

        assert_ok!(transport.send(b"ping").await);
        let mut buffer = [0u8; 16];
        let (len, from) = peer.recv_from(&mut buffer).await.unwrap();
        assert_eq!(&buffer[..len], b"ping");
        assert_eq!(Some(from), transport.local_addr());

        peer.send_to(b"pong", from).await.unwrap();
        let received = assert_ok!(transport.receive().await);
        assert_eq!(received, b"pong".to_vec());
    }

    #[tokio::test]
    async fn test_reconnect_keeps_local_port() {
        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let transport = UdpTransport::new(peer.local_addr().unwrap());

        assert_ok!(transport.connect().await);
        let first = transport.local_addr();
        assert_ok!(transport.connect().await);

        assert_eq!(transport.local_addr(), first);
    }

    #[tokio::test]
    async fn test_close_disconnects() {
        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let transport = UdpTransport::new(peer.local_addr().unwrap());
        assert_ok!(transport.connect().await);
        assert_ok!(transport.close().await);

        let error = assert_err!(transport.receive().await);
        assert!(matches!(error, TransportError::NotConnected));
    }
}
