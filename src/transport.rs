use std::io::{self, ErrorKind, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::time::Duration;

use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use thiserror::Error;
use tracing::{debug, warn};

use crate::modbus_tcp::MAX_ADU_LEN;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Failed to resolve {address}: {source}")]
    Resolve { address: String, source: io::Error },

    #[error("No IPv4 endpoint found for {0}")]
    NoIpv4Endpoint(String),

    #[error("Failed to create socket: {0}")]
    Socket(#[source] io::Error),

    #[error("Failed to connect to {address}: {source}")]
    Connect { address: SocketAddr, source: io::Error },

    #[error("Send failed: {0}")]
    Send(#[source] io::Error),

    #[error("Short write: {written} of {expected} bytes sent")]
    ShortWrite { written: usize, expected: usize },

    #[error("Poll failed: {0}")]
    Poll(#[source] io::Error),

    #[error("Receive failed: {0}")]
    Recv(#[source] io::Error),

    #[error("Connection closed by peer")]
    PeerClosed,

    #[error("Not connected")]
    NotConnected,
}

/// Outcome of a successful readiness wait.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Readiness {
    Ready,
    NotReady,
}

/// One non-blocking TCP connection to a Modbus server.
#[derive(Debug)]
pub struct Connection {
    stream: TcpStream,
    peer: SocketAddr,
}

impl Connection {
    /// Resolves `host:port` to an IPv4 endpoint and connects, waiting at most
    /// `timeout`. Timeout and refusal both surface as `Connect`.
    pub fn connect(host: &str, port: u16, timeout: Duration) -> Result<Self, TransportError> {
        let address = format!("{host}:{port}");
        let peer = (host, port)
            .to_socket_addrs()
            .map_err(|source| TransportError::Resolve {
                address: address.clone(),
                source,
            })?
            .find(SocketAddr::is_ipv4)
            .ok_or(TransportError::NoIpv4Endpoint(address))?;

        let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))
            .map_err(TransportError::Socket)?;
        socket
            .connect_timeout(&SockAddr::from(peer), timeout)
            .map_err(|source| TransportError::Connect {
                address: peer,
                source,
            })?;
        socket.set_nonblocking(true).map_err(TransportError::Socket)?;
        if let Err(e) = socket.set_nodelay(true) {
            warn!("Failed to set TCP_NODELAY: {e}");
        }

        debug!(%peer, "connected to modbus server");
        Ok(Connection {
            stream: socket.into(),
            peer,
        })
    }

    /// Peeks one byte without consuming it. Only an orderly shutdown by the
    /// peer or a hard socket error counts as dead.
    pub fn check_alive(&self) -> bool {
        let mut byte = [0u8; 1];
        match self.stream.peek(&mut byte) {
            Ok(0) => false,
            Ok(_) => true,
            Err(e) => matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::Interrupted),
        }
    }

    /// Writes the whole buffer in a single call.
    pub fn send(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        match self.stream.write(bytes) {
            Ok(written) if written == bytes.len() => Ok(()),
            Ok(written) => Err(TransportError::ShortWrite {
                written,
                expected: bytes.len(),
            }),
            Err(e) => Err(TransportError::Send(e)),
        }
    }

    /// Waits once, for at most `timeout`, until the socket has bytes to read
    /// or the peer has closed.
    pub fn poll_readable(&self, timeout: Duration) -> Result<Readiness, TransportError> {
        // blocking peek bounded by the read timeout, then back to non-blocking
        self.stream.set_nonblocking(false).map_err(TransportError::Poll)?;
        let mut byte = [0u8; 1];
        let outcome = self
            .stream
            .set_read_timeout(Some(timeout))
            .and_then(|()| self.stream.peek(&mut byte));
        self.stream.set_nonblocking(true).map_err(TransportError::Poll)?;

        match outcome {
            Ok(_) => Ok(Readiness::Ready),
            Err(e)
                if matches!(
                    e.kind(),
                    ErrorKind::WouldBlock | ErrorKind::TimedOut | ErrorKind::Interrupted
                ) =>
            {
                Ok(Readiness::NotReady)
            }
            Err(e) => Err(TransportError::Poll(e)),
        }
    }

    /// Single read of up to one maximum-size ADU. Zero bytes means the peer
    /// closed the connection.
    pub fn recv(&mut self) -> Result<Vec<u8>, TransportError> {
        let mut buffer = [0u8; MAX_ADU_LEN];
        match self.stream.read(&mut buffer) {
            Ok(0) => Err(TransportError::PeerClosed),
            Ok(n) => Ok(buffer[..n].to_vec()),
            Err(e) => Err(TransportError::Recv(e)),
        }
    }

    pub fn close(self) {
        // peer may already be gone
        let _ = self.stream.shutdown(Shutdown::Both);
        debug!(peer = %self.peer, "connection closed");
    }
}
