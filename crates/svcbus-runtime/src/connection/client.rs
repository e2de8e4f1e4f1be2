//! Client side socket

use std::net::{Shutdown, SocketAddr, TcpStream};
use std::time::Duration;

use tracing::debug;

use svcbus_core::errors::TransportError;
use svcbus_core::{SvcbusError, SvcbusResult};

/// A connected client socket, split into one stream per I/O thread
#[derive(Debug)]
pub struct ClientConnection {
    address: String,
    peer: SocketAddr,
    stream: TcpStream,
}

impl ClientConnection {
    /// Connect to `address`, trying every resolved socket address in turn.
    /// Each attempt is bounded by `timeout`.
    pub async fn connect(address: &str, timeout: Duration) -> SvcbusResult<Self> {
        let candidates = tokio::net::lookup_host(address)
            .await
            .map_err(|e| SvcbusError::connection_failed(address, e.to_string()))?;

        let mut last_error = None;
        for candidate in candidates {
            match tokio::time::timeout(timeout, tokio::net::TcpStream::connect(candidate)).await {
                Ok(Ok(stream)) => {
                    stream.set_nodelay(true)?;
                    // The I/O threads register their halves with their own runtimes
                    let stream = stream.into_std()?;
                    stream.set_nonblocking(false)?;
                    debug!(address, peer = %candidate, "Socket connected");
                    return Ok(Self {
                        address: address.to_string(),
                        peer: candidate,
                        stream,
                    });
                }
                Ok(Err(e)) => {
                    last_error = Some(SvcbusError::connection_failed(address, e.to_string()));
                }
                Err(_) => {
                    last_error = Some(SvcbusError::Transport(TransportError::Timeout {
                        address: address.to_string(),
                        duration_ms: timeout.as_millis() as u64,
                    }));
                }
            }
        }

        Err(last_error
            .unwrap_or_else(|| SvcbusError::connection_failed(address, "address did not resolve")))
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Independent handles on the socket for the receive and send threads
    pub fn split(&self) -> SvcbusResult<(TcpStream, TcpStream)> {
        Ok((self.stream.try_clone()?, self.stream.try_clone()?))
    }

    /// Shut both directions down; the I/O threads observe end of stream
    pub fn close(&self) {
        if let Err(e) = self.stream.shutdown(Shutdown::Both) {
            debug!(address = %self.address, error = %e, "Socket already closed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};

    #[tokio::test]
    async fn test_connect_and_split() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let address = listener.local_addr().unwrap().to_string();

        let connection = ClientConnection::connect(&address, Duration::from_secs(2))
            .await
            .unwrap();
        let (mut server, _) = listener.accept().unwrap();
        let (mut read, mut write) = connection.split().unwrap();

        write.write_all(b"ping").unwrap();
        let mut buf = [0u8; 4];
        server.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"ping");

        server.write_all(b"pong").unwrap();
        read.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"pong");

        connection.close();
        assert_eq!(server.read(&mut buf).unwrap(), 0);
    }

    #[tokio::test]
    async fn test_refused_connection_is_a_transport_error() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let address = listener.local_addr().unwrap().to_string();
        drop(listener);

        let error = ClientConnection::connect(&address, Duration::from_millis(500))
            .await
            .unwrap_err();
        assert!(error.is_transport());
    }
}
