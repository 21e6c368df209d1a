//! [`Transport`] on tokio sockets.
//!
//! Sockets live in maps keyed by a private counter; the engine only sees
//! small key handles. Background tasks (accept loops, readers, connect
//! attempts, write waiters) turn readiness into [`NetEvent`]s on an
//! unbounded channel, which [`crate::host::Host`] feeds back into the
//! engine. All [`Transport`] methods must be called inside a tokio runtime.

use crate::registry::SessionId;
use crate::transport::{Chunk, Transport, WriteError};
use log::{debug, trace, warn};
use socket2::{Domain, SockRef, Socket, Type};
use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Shutdown, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Bytes handed to the kernel per write.
const TCP_WRITE_LEN: usize = 16 * 1024;
const TCP_READ_LEN: usize = 64 * 1024;
const UDP_RECV_LEN: usize = 64 * 1024;
const LISTEN_BACKLOG: i32 = 128;

#[derive(Debug, PartialEq, Eq, Hash)]
pub struct TokioTcpListener {
    key: u64,
}

#[derive(Debug, PartialEq, Eq, Hash)]
pub struct TokioTcpStream {
    key: u64,
}

#[derive(Debug, PartialEq, Eq, Hash)]
pub struct TokioUdpSocket {
    key: u64,
}

/// Readiness reported by the background tasks.
#[derive(Debug)]
pub enum NetEvent {
    TcpConnected {
        key: u64,
        result: io::Result<TcpStream>,
    },
    TcpAccepted {
        key: u64,
        stream: TcpStream,
    },
    TcpData {
        key: u64,
        data: Vec<u8>,
    },
    /// The peer closed its side.
    TcpClosed {
        key: u64,
    },
    TcpWritable {
        key: u64,
    },
    TcpError {
        key: u64,
        error: io::Error,
    },
    UdpDatagram {
        key: u64,
        data: Vec<u8>,
        from: SocketAddr,
    },
}

struct ListenerEntry {
    owner: SessionId,
    local: SocketAddr,
    task: JoinHandle<()>,
}

struct StreamEntry {
    owner: Option<SessionId>,
    /// None while connecting.
    stream: Option<Arc<TcpStream>>,
    local: Option<SocketAddr>,
    peer: Option<SocketAddr>,
    pending: Vec<u8>,
    tasks: Vec<JoinHandle<()>>,
    waiting: bool,
}

impl StreamEntry {
    fn new(owner: Option<SessionId>) -> Self {
        Self {
            owner,
            stream: None,
            local: None,
            peer: None,
            pending: Vec::new(),
            tasks: Vec::new(),
            waiting: false,
        }
    }

    fn stop(&self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

struct UdpEntry {
    owner: SessionId,
    socket: Arc<UdpSocket>,
    local: SocketAddr,
    task: JoinHandle<()>,
}

pub struct TokioTransport {
    epoch: Instant,
    next_key: u64,
    listeners: HashMap<u64, ListenerEntry>,
    streams: HashMap<u64, StreamEntry>,
    udp: HashMap<u64, UdpEntry>,
    events: UnboundedSender<NetEvent>,
}

impl TokioTransport {
    pub fn new(events: UnboundedSender<NetEvent>) -> Self {
        Self {
            epoch: Instant::now(),
            next_key: 0,
            listeners: HashMap::new(),
            streams: HashMap::new(),
            udp: HashMap::new(),
            events,
        }
    }

    fn key(&mut self) -> u64 {
        self.next_key += 1;
        self.next_key
    }

    pub fn listener_owner(&self, key: u64) -> Option<SessionId> {
        self.listeners.get(&key).map(|entry| entry.owner)
    }

    pub fn stream_owner(&self, key: u64) -> Option<SessionId> {
        self.streams.get(&key).and_then(|entry| entry.owner)
    }

    pub fn udp_owner(&self, key: u64) -> Option<SessionId> {
        self.udp.get(&key).map(|entry| entry.owner)
    }

    /// Streams still held, connecting ones included.
    pub fn stream_count(&self) -> usize {
        self.streams.len()
    }

    /// Installs the stream of a finished connect and returns its owner.
    /// Streams whose handle was closed in the meantime are dropped.
    pub fn complete_connect(&mut self, key: u64, stream: TcpStream) -> Option<SessionId> {
        let events = self.events.clone();
        let entry = self.streams.get_mut(&key)?;
        entry.local = stream.local_addr().ok();
        entry.peer = stream.peer_addr().ok();
        let stream = Arc::new(stream);
        entry.tasks.push(spawn_reader(key, stream.clone(), events));
        entry.stream = Some(stream);
        entry.owner
    }

    /// Drops a stream that failed to connect or errored, and returns its owner.
    pub fn forget_stream(&mut self, key: u64) -> Option<SessionId> {
        let entry = self.streams.remove(&key)?;
        entry.stop();
        entry.owner
    }

    /// Registers an accepted stream. Its events are held back until
    /// [`Transport::tcp_attach`] names an owner.
    pub fn adopt_stream(&mut self, stream: TcpStream) -> TokioTcpStream {
        let key = self.key();
        let mut entry = StreamEntry::new(None);
        entry.local = stream.local_addr().ok();
        entry.peer = stream.peer_addr().ok();
        entry.stream = Some(Arc::new(stream));
        self.streams.insert(key, entry);
        TokioTcpStream { key }
    }

    /// Retries queued bytes after the socket became writable. Returns the
    /// owner once nothing is left queued.
    pub fn flush_pending(&mut self, key: u64) -> Option<SessionId> {
        let events = self.events.clone();
        let entry = self.streams.get_mut(&key)?;
        entry.waiting = false;
        let stream = entry.stream.clone()?;
        while !entry.pending.is_empty() {
            match stream.try_write(&entry.pending) {
                Ok(n) => {
                    entry.pending.drain(..n);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    wait_writable(key, entry, events);
                    return None;
                }
                Err(e) => {
                    debug!("flushing stream {} failed: {}", key, e);
                    let _ = events.send(NetEvent::TcpError { key, error: e });
                    return None;
                }
            }
        }
        entry.owner
    }

    fn live_stream(&self, key: u64) -> io::Result<Arc<TcpStream>> {
        self.streams
            .get(&key)
            .and_then(|entry| entry.stream.clone())
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotConnected))
    }
}

fn spawn_reader(key: u64, stream: Arc<TcpStream>, events: UnboundedSender<NetEvent>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut buf = vec![0u8; TCP_READ_LEN];
        loop {
            if let Err(error) = stream.readable().await {
                let _ = events.send(NetEvent::TcpError { key, error });
                return;
            }
            let event = match stream.try_read(&mut buf) {
                Ok(0) => {
                    let _ = events.send(NetEvent::TcpClosed { key });
                    return;
                }
                Ok(n) => NetEvent::TcpData {
                    key,
                    data: buf[..n].to_vec(),
                },
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                Err(error) => {
                    let _ = events.send(NetEvent::TcpError { key, error });
                    return;
                }
            };
            if events.send(event).is_err() {
                return;
            }
        }
    })
}

fn wait_writable(key: u64, entry: &mut StreamEntry, events: UnboundedSender<NetEvent>) {
    if entry.waiting {
        return;
    }
    let Some(stream) = entry.stream.clone() else {
        return;
    };
    entry.waiting = true;
    entry.tasks.retain(|task| !task.is_finished());
    entry.tasks.push(tokio::spawn(async move {
        let event = match stream.writable().await {
            Ok(()) => NetEvent::TcpWritable { key },
            Err(error) => NetEvent::TcpError { key, error },
        };
        let _ = events.send(event);
    }));
}

fn bind_socket(local: SocketAddr, ty: Type, reuse_addr: bool) -> io::Result<Socket> {
    let socket = Socket::new(Domain::for_address(local), ty, None)?;
    socket.set_reuse_address(reuse_addr)?;
    socket.set_nonblocking(true)?;
    socket.bind(&local.into())?;
    Ok(socket)
}

fn set_tos(socket: SockRef<'_>, ipv6: bool, tos: u8) -> io::Result<()> {
    if ipv6 {
        return Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "TOS is only applied to IPv4 sockets",
        ));
    }
    socket.set_tos(tos as u32)
}

impl Transport for TokioTransport {
    type TcpListener = TokioTcpListener;
    type TcpStream = TokioTcpStream;
    type UdpSocket = TokioUdpSocket;

    fn now(&self) -> Duration {
        self.epoch.elapsed()
    }

    fn tcp_listen(&mut self, local: SocketAddr, owner: SessionId) -> io::Result<TokioTcpListener> {
        let socket = bind_socket(local, Type::STREAM, true)?;
        socket.listen(LISTEN_BACKLOG)?;
        let listener = TcpListener::from_std(socket.into())?;
        let local = listener.local_addr()?;

        let key = self.key();
        let events = self.events.clone();
        let task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer)) => {
                        trace!("listener {} accepted {}", key, peer);
                        if events.send(NetEvent::TcpAccepted { key, stream }).is_err() {
                            return;
                        }
                    }
                    Err(e) => {
                        warn!("accept on {} failed: {}", local, e);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                    }
                }
            }
        });
        self.listeners.insert(key, ListenerEntry { owner, local, task });
        Ok(TokioTcpListener { key })
    }

    fn tcp_listener_addr(&self, listener: &TokioTcpListener) -> Option<SocketAddr> {
        self.listeners.get(&listener.key).map(|entry| entry.local)
    }

    fn tcp_close_listener(&mut self, listener: &TokioTcpListener) {
        if let Some(entry) = self.listeners.remove(&listener.key) {
            entry.task.abort();
        }
    }

    fn tcp_connect(&mut self, remote: SocketAddr, owner: SessionId) -> io::Result<TokioTcpStream> {
        let key = self.key();
        let events = self.events.clone();
        let mut entry = StreamEntry::new(Some(owner));
        entry.peer = Some(remote);
        entry.tasks.push(tokio::spawn(async move {
            let result = TcpStream::connect(remote).await;
            let _ = events.send(NetEvent::TcpConnected { key, result });
        }));
        self.streams.insert(key, entry);
        Ok(TokioTcpStream { key })
    }

    fn tcp_attach(&mut self, stream: &TokioTcpStream, owner: SessionId) {
        let events = self.events.clone();
        let Some(entry) = self.streams.get_mut(&stream.key) else {
            return;
        };
        entry.owner = Some(owner);
        if let Some(tcp) = entry.stream.clone() {
            entry.tasks.push(spawn_reader(stream.key, tcp, events));
        }
    }

    fn tcp_set_tos(&mut self, stream: &TokioTcpStream, tos: u8) -> io::Result<()> {
        let tcp = self.live_stream(stream.key)?;
        let ipv6 = tcp.local_addr()?.is_ipv6();
        set_tos(SockRef::from(&*tcp), ipv6, tos)
    }

    fn tcp_mss(&self, _stream: &TokioTcpStream) -> usize {
        TCP_WRITE_LEN
    }

    fn tcp_write(
        &mut self,
        stream: &TokioTcpStream,
        chunk: Chunk<'_>,
        _more: bool,
    ) -> Result<(), WriteError> {
        let events = self.events.clone();
        let entry = self
            .streams
            .get_mut(&stream.key)
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotConnected))?;
        let tcp = entry
            .stream
            .clone()
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotConnected))?;
        if !entry.pending.is_empty() {
            wait_writable(stream.key, entry, events);
            return Err(WriteError::BufferFull);
        }

        let bytes = chunk.bytes();
        match tcp.try_write(bytes) {
            Ok(n) if n == bytes.len() => Ok(()),
            Ok(n) => {
                entry.pending.extend_from_slice(&bytes[n..]);
                wait_writable(stream.key, entry, events);
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                wait_writable(stream.key, entry, events);
                Err(WriteError::BufferFull)
            }
            Err(e) => Err(WriteError::Failed(e)),
        }
    }

    /// Arms a writable waiter, so the owner hears `sent` once the socket
    /// can take more.
    fn tcp_output(&mut self, stream: &TokioTcpStream) {
        let events = self.events.clone();
        if let Some(entry) = self.streams.get_mut(&stream.key) {
            wait_writable(stream.key, entry, events);
        }
    }

    fn tcp_recved(&mut self, _stream: &TokioTcpStream, _len: usize) {}

    fn tcp_local_addr(&self, stream: &TokioTcpStream) -> Option<SocketAddr> {
        self.streams.get(&stream.key).and_then(|entry| entry.local)
    }

    fn tcp_peer_addr(&self, stream: &TokioTcpStream) -> Option<SocketAddr> {
        self.streams.get(&stream.key).and_then(|entry| entry.peer)
    }

    fn tcp_close(&mut self, stream: &TokioTcpStream) -> io::Result<()> {
        let Some(entry) = self.streams.remove(&stream.key) else {
            return Ok(());
        };
        entry.stop();
        let Some(tcp) = entry.stream else {
            return Ok(());
        };
        if entry.pending.is_empty() {
            return SockRef::from(&*tcp).shutdown(Shutdown::Write);
        }

        // queued bytes were already counted as sent
        let key = stream.key;
        let mut pending = entry.pending;
        tokio::spawn(async move {
            while !pending.is_empty() {
                if let Err(e) = tcp.writable().await {
                    debug!("stream {} dropped {} queued bytes: {}", key, pending.len(), e);
                    return;
                }
                match tcp.try_write(&pending) {
                    Ok(n) => {
                        pending.drain(..n);
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                    Err(e) => {
                        debug!("stream {} dropped {} queued bytes: {}", key, pending.len(), e);
                        return;
                    }
                }
            }
            if let Err(e) = SockRef::from(&*tcp).shutdown(Shutdown::Write) {
                debug!("stream {} shutdown: {}", key, e);
            }
        });
        Ok(())
    }

    fn tcp_abort(&mut self, stream: &TokioTcpStream) {
        let Some(entry) = self.streams.remove(&stream.key) else {
            return;
        };
        entry.stop();
        if let Some(tcp) = entry.stream {
            if let Err(e) = SockRef::from(&*tcp).set_linger(Some(Duration::ZERO)) {
                debug!("stream {} linger: {}", stream.key, e);
            }
        }
    }

    fn udp_bind(
        &mut self,
        local: SocketAddr,
        reuse_addr: bool,
        owner: SessionId,
    ) -> io::Result<TokioUdpSocket> {
        let socket = bind_socket(local, Type::DGRAM, reuse_addr)?;
        let socket = Arc::new(UdpSocket::from_std(socket.into())?);
        let local = socket.local_addr()?;

        let key = self.key();
        let events = self.events.clone();
        let reader = socket.clone();
        let task = tokio::spawn(async move {
            let mut buf = vec![0u8; UDP_RECV_LEN];
            loop {
                match reader.recv_from(&mut buf).await {
                    Ok((n, from)) => {
                        let event = NetEvent::UdpDatagram {
                            key,
                            data: buf[..n].to_vec(),
                            from,
                        };
                        if events.send(event).is_err() {
                            return;
                        }
                    }
                    // ICMP errors surface here on some platforms.
                    Err(e) => trace!("UDP socket {} recv: {}", key, e),
                }
            }
        });
        self.udp.insert(
            key,
            UdpEntry {
                owner,
                socket,
                local,
                task,
            },
        );
        Ok(TokioUdpSocket { key })
    }

    fn udp_local_addr(&self, socket: &TokioUdpSocket) -> Option<SocketAddr> {
        self.udp.get(&socket.key).map(|entry| entry.local)
    }

    fn udp_send_to(&mut self, socket: &TokioUdpSocket, data: &[u8], remote: SocketAddr) -> io::Result<()> {
        let entry = self
            .udp
            .get(&socket.key)
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotConnected))?;
        entry.socket.try_send_to(data, remote).map(|_| ())
    }

    fn udp_set_tos(&mut self, socket: &TokioUdpSocket, tos: u8) -> io::Result<()> {
        let entry = self
            .udp
            .get(&socket.key)
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotConnected))?;
        set_tos(SockRef::from(&*entry.socket), entry.local.is_ipv6(), tos)
    }

    fn udp_join_multicast(&mut self, socket: &TokioUdpSocket, group: IpAddr) -> io::Result<()> {
        let entry = self
            .udp
            .get(&socket.key)
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotConnected))?;
        match group {
            IpAddr::V4(group) => entry.socket.join_multicast_v4(group, Ipv4Addr::UNSPECIFIED),
            IpAddr::V6(group) => entry.socket.join_multicast_v6(&group, 0),
        }
    }

    fn udp_leave_multicast(&mut self, socket: &TokioUdpSocket, group: IpAddr) {
        let Some(entry) = self.udp.get(&socket.key) else {
            return;
        };
        let result = match group {
            IpAddr::V4(group) => entry.socket.leave_multicast_v4(group, Ipv4Addr::UNSPECIFIED),
            IpAddr::V6(group) => entry.socket.leave_multicast_v6(&group, 0),
        };
        if let Err(e) = result {
            debug!("leaving {} failed: {}", group, e);
        }
    }

    fn udp_close(&mut self, socket: &TokioUdpSocket) {
        if let Some(entry) = self.udp.remove(&socket.key) {
            entry.task.abort();
        }
    }
}

impl Drop for TokioTransport {
    fn drop(&mut self) {
        for entry in self.listeners.values() {
            entry.task.abort();
        }
        for entry in self.streams.values() {
            entry.stop();
        }
        for entry in self.udp.values() {
            entry.task.abort();
        }
    }
}
