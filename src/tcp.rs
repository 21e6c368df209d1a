//! TCP sessions.
//!
//! A server listener spawns one child per accepted connection. The child
//! reads the 60-byte settings header at the start of the stream and then
//! either counts incoming bytes, turns around and sends on the same
//! connection (reverse), or connects back to the client (dual/tradeoff).
//!
//! Senders write the settings header again at the start of every block so
//! that a stream looks the same as one produced by iperf2 itself.

use crate::config::{Protocol, TestMode};
use crate::engine::{Direction, Engine, Role, Session, SessionBase};
use crate::protocol::{payload_at, Amount, Flags, Settings, EXTENDED_SETTINGS_LEN};
use crate::registry::SessionId;
use crate::report::{ReportRef, Termination};
use crate::transport::{Chunk, Transport, WriteError};
use crate::{Error, Result};
use log::{debug, info, warn};
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

/// Lifecycle of a TCP session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcpState {
    Listening,
    /// Waiting for the peer's settings header, or for the first data of a
    /// reverse test.
    Handshaking,
    Transferring,
    Closing,
}

/// Parameters of an outbound TCP test.
#[derive(Debug, Clone)]
pub struct TcpClientParams {
    pub remote: SocketAddr,
    pub mode: TestMode,
    pub amount: Amount,
    /// Bytes per write; 0 leaves it to the transport.
    pub buffer_len: u32,
    pub tos: u8,
}

impl TcpClientParams {
    pub fn new(remote: SocketAddr, amount: Amount) -> Self {
        Self {
            remote,
            mode: TestMode::Send,
            amount,
            buffer_len: 0,
            tos: 0,
        }
    }

    /// Settings header announcing this test to the server.
    pub fn settings(&self) -> Settings {
        let mut settings = Settings::new(self.amount, self.buffer_len);
        match self.mode {
            TestMode::Send => {}
            TestMode::Reverse => {
                settings.flags.version2 = true;
                settings.extended_mut().eflags.reverse = true;
            }
            TestMode::Dual => {
                settings.flags.answer_test = true;
                settings.flags.answer_now = true;
            }
            TestMode::Tradeoff => {
                settings.flags.answer_test = true;
            }
        }
        settings
    }
}

pub(crate) enum TcpHandle<T: Transport> {
    None,
    Listener(T::TcpListener),
    Stream(T::TcpStream),
}

pub(crate) struct TcpSession<T: Transport> {
    pub base: SessionBase,
    pub state: TcpState,
    pub handle: TcpHandle<T>,
    pub idle_polls: u32,
    /// Sent by clients, captured by server children.
    pub settings: Option<Settings>,
    /// Set on dual/tradeoff listeners: the only peer they accept.
    pub specific_remote: Option<IpAddr>,
    /// Keep the listener until the paired client has finished.
    pub tradeoff: bool,
    pub tos: u8,
}

impl<T: Transport> TcpSession<T> {
    fn new(base: SessionBase, state: TcpState) -> Self {
        Self {
            base,
            state,
            handle: TcpHandle::None,
            idle_polls: 0,
            settings: None,
            specific_remote: None,
            tradeoff: false,
            tos: 0,
        }
    }

    pub fn stream(&self) -> Option<&T::TcpStream> {
        match &self.handle {
            TcpHandle::Stream(stream) => Some(stream),
            _ => None,
        }
    }

    pub fn peer_addr(&self, transport: &T) -> Option<SocketAddr> {
        self.stream().and_then(|stream| transport.tcp_peer_addr(stream))
    }

    fn local_addr(&self, transport: &T) -> Option<SocketAddr> {
        match &self.handle {
            TcpHandle::Listener(listener) => transport.tcp_listener_addr(listener),
            TcpHandle::Stream(stream) => transport.tcp_local_addr(stream),
            TcpHandle::None => None,
        }
    }
}

impl<T: Transport> Engine<T> {
    /// Starts a listener that runs one receive test per accepted connection.
    pub fn start_tcp_server(
        &mut self,
        local: SocketAddr,
        report: Option<ReportRef>,
    ) -> Result<SessionId> {
        let id = self.tcp_listen(local, report, None)?;
        info!("TCP server {} listening on {}", id, local);
        Ok(id)
    }

    /// Connects to an iperf2 server and starts the test described by `params`.
    ///
    /// Dual and tradeoff tests also open a listener for the server's return
    /// connection. If that listener cannot be opened the client is dropped
    /// and the error returned.
    pub fn start_tcp_client(
        &mut self,
        params: TcpClientParams,
        report: Option<ReportRef>,
    ) -> Result<SessionId> {
        let settings = params.settings();
        let client = self.tcp_tx_start(params.remote, settings, report.clone(), None, params.tos)?;
        info!(
            "TCP client {} started ({}) to {}",
            client, params.mode, params.remote
        );

        if matches!(params.mode, TestMode::Dual | TestMode::Tradeoff) {
            let local_ip = self
                .sessions
                .get(client)
                .and_then(|session| match session {
                    Session::Tcp(conn) => conn.stream(),
                    Session::Udp(_) => None,
                })
                .and_then(|stream| self.transport.tcp_local_addr(stream))
                .map(|addr| addr.ip())
                .unwrap_or_else(|| unspecified_like(params.remote.ip()));
            let local = SocketAddr::new(local_ip, self.config.dual_port);

            let listener = match self.tcp_listen(local, report, Some(client)) {
                Ok(listener) => listener,
                Err(e) => {
                    warn!("Cannot listen for the return test on {}: {}", local, e);
                    self.close_silently(client);
                    return Err(e);
                }
            };
            let port = match self.sessions.get_mut(listener) {
                Some(Session::Tcp(conn)) => {
                    conn.specific_remote = Some(params.remote.ip());
                    conn.tradeoff = params.mode == TestMode::Tradeoff;
                    match &conn.handle {
                        TcpHandle::Listener(handle) => self.transport.tcp_listener_addr(handle).map(|a| a.port()),
                        _ => None,
                    }
                }
                _ => None,
            };
            // an ephemeral dual port is only known once bound
            if let (Some(port), Some(Session::Tcp(conn))) = (port, self.sessions.get_mut(client)) {
                if let Some(settings) = conn.settings.as_mut() {
                    settings.remote_port = port as u32;
                }
            }
            debug!("return listener {} on {} for {}", listener, local, client);
        }
        Ok(client)
    }

    fn tcp_listen(
        &mut self,
        local: SocketAddr,
        report: Option<ReportRef>,
        master: Option<SessionId>,
    ) -> Result<SessionId> {
        let mut base = SessionBase::new(Role::Server, report, self.transport.now());
        base.master = master;
        let id = self.insert(Session::Tcp(TcpSession::new(base, TcpState::Listening)))?;

        match self.transport.tcp_listen(local, id) {
            Ok(listener) => {
                if let Some(Session::Tcp(conn)) = self.sessions.get_mut(id) {
                    conn.handle = TcpHandle::Listener(listener);
                }
                Ok(id)
            }
            Err(e) => {
                self.sessions.remove(id);
                Err(Error::Io(e))
            }
        }
    }

    /// Registers an outbound session and starts connecting.
    fn tcp_tx_start(
        &mut self,
        remote: SocketAddr,
        settings: Settings,
        report: Option<ReportRef>,
        master: Option<SessionId>,
        tos: u8,
    ) -> Result<SessionId> {
        let mut base = SessionBase::new(Role::Client, report, self.transport.now());
        base.master = master;
        let state = if settings.reverse_requested() {
            base.direction = Direction::Reverse;
            TcpState::Handshaking
        } else {
            TcpState::Transferring
        };
        let mut conn = TcpSession::new(base, state);
        conn.settings = Some(settings);
        conn.tos = tos;
        let id = self.insert(Session::Tcp(conn))?;

        match self.transport.tcp_connect(remote, id) {
            Ok(stream) => {
                if let Some(Session::Tcp(conn)) = self.sessions.get_mut(id) {
                    conn.handle = TcpHandle::Stream(stream);
                }
                Ok(id)
            }
            Err(e) => {
                self.sessions.remove(id);
                Err(Error::Connection(format!("connect to {} failed: {}", remote, e)))
            }
        }
    }

    /// Connects back to the peer of `id` for a dual or tradeoff test.
    fn tcp_tx_start_passive(&mut self, id: SessionId) -> Result<SessionId> {
        let Some(Session::Tcp(conn)) = self.sessions.get(id) else {
            return Err(Error::NotFound(id.to_string()));
        };
        let settings = conn
            .settings
            .ok_or_else(|| Error::Protocol("no settings captured".to_string()))?;
        let peer = conn
            .peer_addr(&self.transport)
            .ok_or_else(|| Error::Connection("peer address unknown".to_string()))?;
        let remote = SocketAddr::new(peer.ip(), settings.remote_port as u16);
        let report = conn.base.report.clone();
        let master = conn.base.master;

        // cleared so that the peer does not answer the answer
        let settings = Settings {
            flags: Flags::default(),
            extended: None,
            ..settings
        };
        let client = self.tcp_tx_start(remote, settings, report, master, 0)?;
        info!("TCP return test {} to {}", client, remote);
        Ok(client)
    }

    /// Turns a server child around to send on its own connection.
    fn tcp_tx_start_reverse(&mut self, id: SessionId) -> Result<()> {
        let now = self.transport.now();
        let Some(Session::Tcp(conn)) = self.sessions.get_mut(id) else {
            return Err(Error::NotFound(id.to_string()));
        };
        if conn.stream().is_none() {
            return Err(Error::Connection("no stream to send on".to_string()));
        }
        conn.base.direction = Direction::Reverse;
        conn.state = TcpState::Transferring;
        conn.idle_polls = 0;
        conn.base.started_at = now;
        debug!("TCP session {} sending back to its client", id);
        self.tcp_send_more(id);
        Ok(())
    }

    /// A session without a server master: it opened the test and echoes
    /// its settings at the start of every block.
    fn is_primary_sender(&self, id: SessionId) -> bool {
        let Some(session) = self.sessions.get(id) else {
            return false;
        };
        match session.base().master {
            None => true,
            Some(master) => self
                .sessions
                .get(master)
                .map_or(true, |m| m.base().role != Role::Server),
        }
    }

    /// Writes as much as the transport accepts, checking the test target
    /// before every chunk.
    pub(crate) fn tcp_send_more(&mut self, id: SessionId) {
        let primary = self.is_primary_sender(id);
        let block_size = self.config.block_size.max(EXTENDED_SETTINGS_LEN as u64 + 1);
        let header = EXTENDED_SETTINGS_LEN as u64;

        loop {
            let now = self.transport.now();
            let Some(Session::Tcp(conn)) = self.sessions.get_mut(id) else {
                return;
            };
            let Some(settings) = conn.settings else {
                return;
            };
            let TcpHandle::Stream(stream) = &conn.handle else {
                return;
            };

            let elapsed_ms = now.saturating_sub(conn.base.started_at).as_millis() as u64;
            if settings.amount.is_reached(elapsed_ms, conn.base.bytes) {
                let reason = conn.base.tx_done();
                self.close(id, reason);
                return;
            }

            let mut mss = self.transport.tcp_mss(stream).max(1);
            if settings.buffer_len != 0 && (settings.buffer_len as usize) < mss {
                mss = settings.buffer_len as usize;
            }

            let wire = settings.to_stream_bytes();
            let bytes = conn.base.bytes;
            let (chunk, more, keep_going) = if primary && bytes < header {
                (Chunk::Copied(&wire[bytes as usize..]), false, false)
            } else {
                let block_pos = if primary {
                    (bytes - header) % block_size
                } else {
                    bytes % block_size
                };
                if primary && block_pos < header {
                    (Chunk::Copied(&wire[block_pos as usize..]), true, true)
                } else {
                    let mut len = mss as u64;
                    if block_pos == header {
                        len = len.saturating_sub(header).max(1);
                    }
                    if block_pos + len > block_size {
                        len = block_size - block_pos;
                    }
                    (Chunk::Static(payload_at(block_pos, len as usize)), false, true)
                }
            };

            let mut len = chunk.len();
            let written = loop {
                let piece = match chunk {
                    Chunk::Copied(data) => Chunk::Copied(&data[..len]),
                    Chunk::Static(data) => Chunk::Static(&data[..len]),
                };
                match self.transport.tcp_write(stream, piece, more) {
                    Ok(()) => break Some(len),
                    Err(WriteError::BufferFull) => {
                        len /= 2;
                        if len == 0 || len < mss / 2 {
                            break None;
                        }
                    }
                    Err(WriteError::Failed(e)) => {
                        debug!("TCP session {} write failed: {}", id, e);
                        break None;
                    }
                }
            };

            match written {
                Some(len) => {
                    if conn.base.role == Role::Server || conn.base.direction == Direction::Normal {
                        conn.base.bytes += len as u64;
                    }
                    if !keep_going {
                        break;
                    }
                }
                None => break,
            }
        }

        if let Some(Session::Tcp(conn)) = self.sessions.get(id) {
            if let Some(stream) = conn.stream() {
                self.transport.tcp_output(stream);
            }
        }
    }

    /// Outcome of a connection attempt started by a client session.
    pub fn on_tcp_connected(&mut self, id: SessionId, result: io::Result<()>) {
        if let Err(e) = result {
            warn!("TCP session {} failed to connect: {}", id, e);
            self.close(id, Termination::AbortedRemote);
            return;
        }
        let now = self.transport.now();
        let Some(Session::Tcp(conn)) = self.sessions.get_mut(id) else {
            return;
        };
        conn.idle_polls = 0;
        conn.base.started_at = now;
        if conn.tos != 0 {
            if let Some(stream) = conn.stream() {
                if let Err(e) = self.transport.tcp_set_tos(stream, conn.tos) {
                    debug!("TCP session {} cannot set TOS: {}", id, e);
                }
            }
        }
        self.tcp_send_more(id);
    }

    /// A connection arrived on listener `listener`.
    ///
    /// Returns the id of the new receive session. A rejected stream is
    /// aborted here.
    pub fn on_tcp_accept(&mut self, listener: SessionId, stream: T::TcpStream) -> Result<SessionId> {
        let now = self.transport.now();
        let Some(Session::Tcp(server)) = self.sessions.get(listener) else {
            self.transport.tcp_abort(&stream);
            return Err(Error::NotFound(listener.to_string()));
        };
        if server.state != TcpState::Listening {
            self.transport.tcp_abort(&stream);
            return Err(Error::Rejected(format!("session {} is not listening", listener)));
        }

        if let Some(expected) = server.specific_remote {
            let peer = self.transport.tcp_peer_addr(&stream).map(|addr| addr.ip());
            if peer != Some(expected) {
                debug!(
                    "listener {} rejects {:?}, waiting for {}",
                    listener, peer, expected
                );
                self.transport.tcp_abort(&stream);
                return Err(Error::Rejected(format!("unexpected peer {:?}", peer)));
            }
        }

        let specific = server.specific_remote.is_some();
        let tradeoff = server.tradeoff;
        let paired_client = server.base.master;

        let mut base = SessionBase::new(Role::Server, server.base.report.clone(), now);
        if specific {
            // the client may already be gone in a tradeoff test
            base.master = paired_client;
            base.deallocated_master = server.base.deallocated_master;
        } else {
            base.master = Some(listener);
        }
        // the return connection of a dual test carries no settings header
        let state = if specific {
            TcpState::Transferring
        } else {
            TcpState::Handshaking
        };
        let mut conn = TcpSession::new(base, state);
        let peer = self.transport.tcp_peer_addr(&stream);
        conn.handle = TcpHandle::Stream(stream);

        let id = match self.sessions.insert(Session::Tcp(conn)) {
            Ok(id) => id,
            Err(Session::Tcp(conn)) => {
                if let TcpHandle::Stream(stream) = &conn.handle {
                    self.transport.tcp_abort(stream);
                }
                return Err(Error::ResourceExhausted(self.sessions.capacity_limit()));
            }
            Err(Session::Udp(_)) => {
                return Err(Error::ResourceExhausted(self.sessions.capacity_limit()));
            }
        };
        if let Some(Session::Tcp(conn)) = self.sessions.get(id) {
            if let Some(stream) = conn.stream() {
                self.transport.tcp_attach(stream, id);
            }
        }
        info!("TCP session {} accepted from {:?} on {}", id, peer, listener);

        if specific {
            let client_live = paired_client.map_or(false, |client| self.sessions.contains(client));
            if !tradeoff || !client_live {
                self.close_silently(listener);
            }
        }
        Ok(id)
    }

    /// Data on a stream, or `None` once the peer closed it.
    pub fn on_tcp_recv(&mut self, id: SessionId, data: Option<&[u8]>) {
        let primary = self.is_primary_sender(id);
        let now = self.transport.now();
        let Some(Session::Tcp(conn)) = self.sessions.get_mut(id) else {
            return;
        };

        let Some(data) = data else {
            let reason = match conn.base.direction {
                Direction::Reverse => Termination::DoneClientRx,
                Direction::Normal => Termination::DoneServerRx,
            };
            if conn.settings.map_or(false, |s| s.flags.wants_return_after()) {
                debug!("TCP session {} peer wants a test back", id);
                if let Err(e) = self.tcp_tx_start_passive(id) {
                    warn!("TCP session {} cannot start the return test: {}", id, e);
                }
            }
            self.close(id, reason);
            return;
        };

        conn.idle_polls = 0;
        let mut payload = data;

        if !primary && conn.settings.is_none() {
            if data.len() < EXTENDED_SETTINGS_LEN {
                warn!(
                    "TCP session {} got {} bytes, settings need {}",
                    id,
                    data.len(),
                    EXTENDED_SETTINGS_LEN
                );
                self.close(id, Termination::AbortedLocalDataError);
                return;
            }
            let settings = match Settings::from_stream_bytes(data) {
                Ok(settings) => settings,
                Err(e) => {
                    warn!("TCP session {} sent bad settings: {}", id, e);
                    self.close(id, Termination::AbortedLocalDataError);
                    return;
                }
            };
            debug!("TCP session {} settings {:?}", id, settings);
            conn.settings = Some(settings);
            conn.state = TcpState::Transferring;

            if settings.reverse_requested() {
                if let Err(e) = self.tcp_tx_start_reverse(id) {
                    warn!("TCP session {} cannot send back: {}", id, e);
                    self.close(id, Termination::AbortedLocalTxError);
                    return;
                }
            } else if settings.flags.wants_return_now() {
                if let Err(e) = self.tcp_tx_start_passive(id) {
                    warn!("TCP session {} cannot start the dual test: {}", id, e);
                    self.close(id, Termination::AbortedLocalTxError);
                    return;
                }
            }

            let Some(Session::Tcp(conn)) = self.sessions.get_mut(id) else {
                return;
            };
            if conn.base.role == Role::Client || conn.base.direction == Direction::Normal {
                conn.base.bytes += EXTENDED_SETTINGS_LEN as u64;
                conn.base.started_at = now;
            }
            payload = &data[EXTENDED_SETTINGS_LEN..];
        }

        let Some(Session::Tcp(conn)) = self.sessions.get_mut(id) else {
            return;
        };
        if conn.state == TcpState::Handshaking {
            conn.state = TcpState::Transferring;
        }
        if conn.base.role == Role::Client || conn.base.direction == Direction::Normal {
            conn.base.bytes += payload.len() as u64;
        }
        if let Some(stream) = conn.stream() {
            self.transport.tcp_recved(stream, data.len());
        }
    }

    /// The transport has room for more data.
    pub fn on_tcp_sent(&mut self, id: SessionId) {
        let Some(Session::Tcp(conn)) = self.sessions.get_mut(id) else {
            return;
        };
        conn.idle_polls = 0;
        if conn.state == TcpState::Transferring && conn.base.is_transmitter() {
            self.tcp_send_more(id);
        }
    }

    /// Periodic poll of one connected session.
    pub fn on_tcp_poll(&mut self, id: SessionId) {
        let max_idle = self.config.max_idle_polls;
        let Some(Session::Tcp(conn)) = self.sessions.get_mut(id) else {
            return;
        };
        if conn.stream().is_none() {
            return;
        }
        conn.idle_polls += 1;
        if conn.idle_polls >= max_idle {
            info!("TCP session {} idle for {} polls", id, conn.idle_polls);
            self.close(id, Termination::AbortedLocal);
            return;
        }
        if conn.state == TcpState::Transferring && conn.base.is_transmitter() {
            self.tcp_send_more(id);
        }
    }

    /// Polls every connected TCP session.
    pub fn poll_tcp(&mut self) {
        for id in self.sessions.ids() {
            if matches!(self.sessions.get(id), Some(Session::Tcp(_))) {
                self.on_tcp_poll(id);
            }
        }
    }

    /// The transport failed the stream. The engine only drops its handle:
    /// the transport releases the stream once this returns.
    pub fn on_tcp_error(&mut self, id: SessionId, error: io::Error) {
        let Some(Session::Tcp(conn)) = self.sessions.get_mut(id) else {
            return;
        };
        debug!("TCP session {} error: {}", id, error);
        conn.handle = TcpHandle::None;
        self.close(id, Termination::AbortedRemote);
    }

    pub(crate) fn release_tcp(&mut self, id: SessionId, mut conn: TcpSession<T>, termination: Termination) {
        conn.state = TcpState::Closing;
        let local = conn.local_addr(&self.transport);
        let remote = conn.peer_addr(&self.transport);
        self.emit_report(id, &conn.base, Protocol::Tcp, termination, local, remote, None);

        match std::mem::replace(&mut conn.handle, TcpHandle::None) {
            TcpHandle::Listener(listener) => self.transport.tcp_close_listener(&listener),
            TcpHandle::Stream(stream) => {
                if let Err(e) = self.transport.tcp_close(&stream) {
                    debug!("TCP session {} close failed, aborting: {}", id, e);
                    self.transport.tcp_abort(&stream);
                }
            }
            TcpHandle::None => {}
        }
    }
}

pub(crate) fn unspecified_like(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
    }
}
