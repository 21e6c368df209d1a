//! The seam between the session engine and a network stack.
//!
//! The engine never blocks and never owns sockets directly. It asks a
//! [`Transport`] to create, write to and close handles, and the host feeds
//! completions back through the `Engine::on_*` methods, tagged with the
//! [`SessionId`] the handle was created or attached for.

use crate::registry::SessionId;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use thiserror::Error;

/// Bytes handed to [`Transport::tcp_write`].
#[derive(Debug, Clone, Copy)]
pub enum Chunk<'a> {
    /// Short-lived data the transport must copy if it queues it.
    Copied(&'a [u8]),
    /// Constant data that may be queued by reference.
    Static(&'static [u8]),
}

impl Chunk<'_> {
    pub fn bytes(&self) -> &[u8] {
        match self {
            Chunk::Copied(bytes) => bytes,
            Chunk::Static(bytes) => bytes,
        }
    }

    pub fn len(&self) -> usize {
        self.bytes().len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes().is_empty()
    }
}

#[derive(Debug, Error)]
pub enum WriteError {
    /// The send buffer cannot take this many bytes right now.
    #[error("send buffer full")]
    BufferFull,
    #[error("write failed: {0}")]
    Failed(#[from] io::Error),
}

/// Non-blocking network primitives used by the engine.
///
/// Every method returns immediately. Handles created for a session report
/// their events for that session until they are closed.
pub trait Transport {
    type TcpListener;
    type TcpStream;
    type UdpSocket;

    /// Monotonic time since an arbitrary epoch.
    fn now(&self) -> Duration;

    /// Starts listening; accepted connections are reported for `owner`.
    fn tcp_listen(&mut self, local: SocketAddr, owner: SessionId) -> io::Result<Self::TcpListener>;

    fn tcp_listener_addr(&self, listener: &Self::TcpListener) -> Option<SocketAddr>;

    fn tcp_close_listener(&mut self, listener: &Self::TcpListener);

    /// Starts connecting; completion is reported through `on_tcp_connected`.
    fn tcp_connect(&mut self, remote: SocketAddr, owner: SessionId) -> io::Result<Self::TcpStream>;

    /// Routes the events of an accepted stream to `owner`.
    fn tcp_attach(&mut self, stream: &Self::TcpStream, owner: SessionId);

    fn tcp_set_tos(&mut self, stream: &Self::TcpStream, tos: u8) -> io::Result<()>;

    /// Largest segment the stream sends in one piece.
    fn tcp_mss(&self, stream: &Self::TcpStream) -> usize;

    /// Queues `chunk` entirely or not at all.
    fn tcp_write(
        &mut self,
        stream: &Self::TcpStream,
        chunk: Chunk<'_>,
        more: bool,
    ) -> Result<(), WriteError>;

    /// Pushes queued data out.
    fn tcp_output(&mut self, stream: &Self::TcpStream);

    /// Tells the stack that `len` received bytes were consumed.
    fn tcp_recved(&mut self, stream: &Self::TcpStream, len: usize);

    fn tcp_local_addr(&self, stream: &Self::TcpStream) -> Option<SocketAddr>;

    fn tcp_peer_addr(&self, stream: &Self::TcpStream) -> Option<SocketAddr>;

    /// Orderly close.
    fn tcp_close(&mut self, stream: &Self::TcpStream) -> io::Result<()>;

    /// Abortive close, used when an orderly close fails.
    fn tcp_abort(&mut self, stream: &Self::TcpStream);

    /// Binds a datagram socket whose traffic is reported for `owner`.
    fn udp_bind(
        &mut self,
        local: SocketAddr,
        reuse_addr: bool,
        owner: SessionId,
    ) -> io::Result<Self::UdpSocket>;

    fn udp_local_addr(&self, socket: &Self::UdpSocket) -> Option<SocketAddr>;

    fn udp_send_to(
        &mut self,
        socket: &Self::UdpSocket,
        data: &[u8],
        remote: SocketAddr,
    ) -> io::Result<()>;

    fn udp_set_tos(&mut self, socket: &Self::UdpSocket, tos: u8) -> io::Result<()>;

    fn udp_join_multicast(&mut self, socket: &Self::UdpSocket, group: IpAddr) -> io::Result<()>;

    fn udp_leave_multicast(&mut self, socket: &Self::UdpSocket, group: IpAddr);

    fn udp_close(&mut self, socket: &Self::UdpSocket);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_accessors() {
        static DATA: [u8; 4] = *b"0123";
        let local = [9u8; 3];
        assert_eq!(Chunk::Static(&DATA).len(), 4);
        assert_eq!(Chunk::Copied(&local).bytes(), &[9, 9, 9]);
        assert!(Chunk::Copied(&[]).is_empty());
    }

    #[test]
    fn test_write_error_display() {
        assert_eq!(WriteError::BufferFull.to_string(), "send buffer full");
        let err: WriteError = io::Error::new(io::ErrorKind::BrokenPipe, "gone").into();
        assert!(matches!(err, WriteError::Failed(_)));
    }
}
