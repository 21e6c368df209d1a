//! UDP sessions.
//!
//! A UDP server owns one socket and creates a child session for every new
//! remote endpoint. The child parses the settings embedded in the first
//! datagram, tracks loss and jitter, and answers the terminal datagrams with
//! a report, sent twice since either copy may be lost.
//!
//! Clients and return transmitters are paced by [`Engine::poll_udp_pacing`],
//! which the host calls on a short fixed tick.

use crate::config::{Protocol, TestMode};
use crate::engine::{pacer_for, Direction, Engine, Role, Session, SessionBase};
use crate::measurements::UdpRxStats;
use crate::pacing::Pacer;
use crate::protocol::{
    payload_at, report_answers_test, report_is_extended, Amount, Flags, Settings,
    DEFAULT_UDP_BUFFER_LEN_V4, DEFAULT_UDP_BUFFER_LEN_V6, DEFAULT_UDP_RATE,
};
use crate::registry::SessionId;
use crate::report::{ReportRef, Termination};
use crate::tcp::unspecified_like;
use crate::transport::Transport;
use crate::udp_packet::{build_report_datagram, parse_report_datagram, DatagramHeader, UdpReport};
use crate::{Error, Result};
use log::{debug, info, trace, warn};
use std::net::{IpAddr, Ipv6Addr, SocketAddr};
use std::time::Duration;

/// Lifecycle of a UDP session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UdpState {
    /// A server socket waiting for new remotes.
    AwaitingHandshake,
    /// Sending paced datagrams.
    Transmitting(Pacer),
    /// Counting datagrams from one remote.
    Receiving,
    Closing,
}

/// Parameters of an outbound UDP test.
#[derive(Debug, Clone)]
pub struct UdpClientParams {
    /// Local address to send from. Its port is used for the return server
    /// of dual and tradeoff tests; the sending socket always gets an
    /// ephemeral port.
    pub local: SocketAddr,
    pub remote: SocketAddr,
    pub mode: TestMode,
    pub amount: Amount,
    /// Datagram size; 0 or anything above the path default picks the default.
    pub buffer_len: u32,
    /// Bits per second.
    pub rate: u32,
    pub tos: u8,
}

impl UdpClientParams {
    pub fn new(remote: SocketAddr, amount: Amount) -> Self {
        Self {
            local: SocketAddr::new(unspecified_like(remote.ip()), 0),
            remote,
            mode: TestMode::Send,
            amount,
            buffer_len: 0,
            rate: DEFAULT_UDP_RATE,
            tos: 0,
        }
    }

    /// Datagram size actually used towards `remote`.
    pub fn datagram_len(&self) -> u32 {
        let max = default_buffer_len(self.remote);
        if self.buffer_len == 0 {
            max
        } else {
            self.buffer_len.min(max)
        }
    }

    /// Settings embedded in every datagram. `return_port` is where the
    /// local return server listens, if one was started.
    pub fn settings(&self, return_port: Option<u16>) -> Settings {
        let mut settings = Settings::new(self.amount, self.datagram_len());
        settings.remote_port = return_port.unwrap_or(0) as u32;
        if self.rate != DEFAULT_UDP_RATE {
            settings.extended_mut().rate = self.rate as i32;
            settings.win_band = self.rate;
        }
        match self.mode {
            TestMode::Send => {}
            TestMode::Reverse => {
                settings.flags.udp_test = true;
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

/// Report datagram waiting for its second transmission.
pub(crate) struct PendingReport {
    pub datagram: Vec<u8>,
    pub retry_at: Option<Duration>,
}

pub(crate) struct UdpSession<T: Transport> {
    pub base: SessionBase,
    pub state: UdpState,
    /// Children of a server have no socket of their own.
    pub socket: Option<T::UdpSocket>,
    pub remote: Option<SocketAddr>,
    pub settings: Option<Settings>,
    pub stats: UdpRxStats,
    pub pending_report: Option<PendingReport>,
    pub report_count: u32,
    /// Return server of a dual/tradeoff client.
    pub temporary: bool,
    pub multicast: Option<IpAddr>,
}

impl<T: Transport> UdpSession<T> {
    fn new(base: SessionBase, state: UdpState) -> Self {
        Self {
            base,
            state,
            socket: None,
            remote: None,
            settings: None,
            stats: UdpRxStats::new(),
            pending_report: None,
            report_count: 0,
            temporary: false,
            multicast: None,
        }
    }
}

impl<T: Transport> Engine<T> {
    /// Binds a server socket. Multicast addresses are joined.
    pub fn start_udp_server(
        &mut self,
        local: SocketAddr,
        report: Option<ReportRef>,
    ) -> Result<SessionId> {
        let id = self.udp_server_start(local, report, false)?;
        info!("UDP server {} listening on {}", id, local);
        Ok(id)
    }

    /// Starts a paced UDP test towards `params.remote`.
    ///
    /// Dual and tradeoff tests first start a local return server whose port
    /// is advertised to the peer. When it cannot be started the test runs
    /// one way only.
    pub fn start_udp_client(
        &mut self,
        params: UdpClientParams,
        report: Option<ReportRef>,
    ) -> Result<SessionId> {
        let temp_server = if matches!(params.mode, TestMode::Dual | TestMode::Tradeoff) {
            let ip = match params.local.ip() {
                IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
                ip => ip,
            };
            match self.udp_server_start(SocketAddr::new(ip, params.local.port()), report.clone(), true)
            {
                Ok(id) => Some(id),
                Err(e) => {
                    warn!("UDP return server failed, dual test disabled: {}", e);
                    None
                }
            }
        } else {
            None
        };
        let return_port = temp_server.and_then(|id| self.udp_local_addr(id)).map(|addr| addr.port());
        if let Some(port) = return_port {
            debug!("UDP return server on port {}", port);
        }

        let datagram_len = params.datagram_len();
        let settings = params.settings(return_port);
        let mut conn = UdpSession::new(
            SessionBase::new(Role::Client, report, self.transport.now()),
            UdpState::Closing,
        );
        conn.remote = Some(params.remote);
        conn.settings = Some(settings);
        if params.mode == TestMode::Reverse {
            conn.base.direction = Direction::Reverse;
        }

        let id = match self.insert(Session::Udp(conn)) {
            Ok(id) => id,
            Err(e) => {
                if let Some(temp) = temp_server {
                    self.close_silently(temp);
                }
                return Err(e);
            }
        };

        if let Err(e) = self.udp_client_socket(id, &params) {
            self.sessions.remove(id);
            if let Some(temp) = temp_server {
                self.close_silently(temp);
            }
            return Err(e);
        }

        if let Some(temp) = temp_server {
            if let Some(session) = self.sessions.get_mut(temp) {
                session.base_mut().master = Some(id);
            }
        }
        info!(
            "UDP client {} started ({}) to {} at {} bit/s",
            id, params.mode, params.remote, params.rate
        );

        if params.mode == TestMode::Reverse {
            self.udp_send_handshake(id);
            if let Some(Session::Udp(conn)) = self.sessions.get_mut(id) {
                conn.state = UdpState::Receiving;
            }
        } else {
            let pacer = pacer_for(&self.config, params.rate, false, datagram_len);
            if let Some(Session::Udp(conn)) = self.sessions.get_mut(id) {
                conn.state = UdpState::Transmitting(pacer);
            }
            self.udp_send_more(id);
        }
        Ok(id)
    }

    fn udp_server_start(
        &mut self,
        local: SocketAddr,
        report: Option<ReportRef>,
        temporary: bool,
    ) -> Result<SessionId> {
        let mut conn = UdpSession::new(
            SessionBase::new(Role::Server, report, self.transport.now()),
            UdpState::AwaitingHandshake,
        );
        conn.temporary = temporary;
        let id = self.insert(Session::Udp(conn))?;

        let socket = match self.transport.udp_bind(local, true, id) {
            Ok(socket) => socket,
            Err(e) => {
                self.sessions.remove(id);
                return Err(Error::Io(e));
            }
        };
        let multicast = if local.ip().is_multicast() {
            if let Err(e) = self.transport.udp_join_multicast(&socket, local.ip()) {
                self.transport.udp_close(&socket);
                self.sessions.remove(id);
                return Err(Error::Io(e));
            }
            Some(local.ip())
        } else {
            None
        };

        if let Some(Session::Udp(conn)) = self.sessions.get_mut(id) {
            conn.socket = Some(socket);
            conn.multicast = multicast;
        }
        Ok(id)
    }

    fn udp_client_socket(&mut self, id: SessionId, params: &UdpClientParams) -> Result<()> {
        let local = SocketAddr::new(params.local.ip(), 0);
        let socket = self.transport.udp_bind(local, false, id)?;
        if params.tos != 0 {
            if let Err(e) = self.transport.udp_set_tos(&socket, params.tos) {
                debug!("UDP client {} cannot set TOS: {}", id, e);
            }
        }
        let multicast = if local.ip().is_multicast() {
            if let Err(e) = self.transport.udp_join_multicast(&socket, local.ip()) {
                self.transport.udp_close(&socket);
                return Err(Error::Io(e));
            }
            Some(local.ip())
        } else {
            None
        };
        if let Some(Session::Udp(conn)) = self.sessions.get_mut(id) {
            conn.socket = Some(socket);
            conn.multicast = multicast;
        }
        Ok(())
    }

    fn udp_local_addr(&self, id: SessionId) -> Option<SocketAddr> {
        match self.sessions.get(id)? {
            Session::Udp(conn) => conn
                .socket
                .as_ref()
                .and_then(|socket| self.transport.udp_local_addr(socket)),
            Session::Tcp(_) => None,
        }
    }

    /// Runs pacing for every transmitter and resends due reports.
    pub fn poll_udp_pacing(&mut self) {
        let now = self.transport.now();
        for id in self.sessions.ids() {
            let (transmitting, retry_due) = match self.sessions.get(id) {
                Some(Session::Udp(conn)) => (
                    matches!(conn.state, UdpState::Transmitting(_)),
                    conn.pending_report
                        .as_ref()
                        .and_then(|pending| pending.retry_at)
                        .map_or(false, |at| at <= now),
                ),
                _ => continue,
            };
            if transmitting {
                self.udp_send_more(id);
            }
            if retry_due {
                self.udp_send_report(id);
            }
        }
    }

    /// A datagram arrived on the socket owned by `owner`.
    pub fn on_udp_recv(&mut self, owner: SessionId, data: &[u8], from: SocketAddr) {
        let Some(Session::Udp(socket_owner)) = self.sessions.get(owner) else {
            return;
        };
        let Some(header) = DatagramHeader::from_bytes(data) else {
            trace!("UDP session {} dropped a {} byte datagram", owner, data.len());
            return;
        };

        let target = if socket_owner.state == UdpState::AwaitingHandshake {
            self.find_udp_child(owner, from)
        } else {
            Some(owner)
        };

        let id = match target {
            Some(id) => id,
            None if header.id >= 0 => match self.udp_new_child(owner, from) {
                Ok(id) => id,
                Err(e) => {
                    debug!("UDP server {} cannot take {}: {}", owner, from, e);
                    return;
                }
            },
            None => return,
        };

        let Some(Session::Udp(conn)) = self.sessions.get(id) else {
            return;
        };
        match (&conn.state, conn.base.direction) {
            (UdpState::Transmitting(_), Direction::Reverse) => {}
            (UdpState::Transmitting(_), Direction::Normal) => self.udp_server_report(id, data),
            (UdpState::Closing, _) => {}
            _ if header.id >= 0 => {
                if conn.settings.is_none() && !self.udp_handshake(id, owner, data, from) {
                    return;
                }
                self.udp_account(id, &header, data.len());
            }
            (_, Direction::Reverse) => {
                info!("UDP session {} got the end of the reverse test", id);
                self.close(id, Termination::DoneClientRx);
            }
            _ => {
                if conn.settings.is_some() && conn.report_count == 0 && conn.pending_report.is_none() {
                    self.udp_queue_report(id, data);
                }
            }
        }
    }

    fn find_udp_child(&self, server: SessionId, from: SocketAddr) -> Option<SessionId> {
        self.sessions.iter().find_map(|(id, session)| match session {
            Session::Udp(conn) if conn.base.master == Some(server) && conn.remote == Some(from) => {
                Some(id)
            }
            _ => None,
        })
    }

    fn udp_new_child(&mut self, server: SessionId, from: SocketAddr) -> Result<SessionId> {
        let report = self
            .sessions
            .get(server)
            .and_then(|session| session.base().report.clone());
        let mut base = SessionBase::new(Role::Server, report, self.transport.now());
        base.master = Some(server);
        let mut conn = UdpSession::new(base, UdpState::Receiving);
        conn.remote = Some(from);
        let id = self.insert(Session::Udp(conn))?;
        info!("UDP session {} for {} on {}", id, from, server);
        Ok(id)
    }

    /// Captures the settings of a new remote. Returns false when the
    /// datagram must not be counted.
    fn udp_handshake(&mut self, id: SessionId, server: SessionId, data: &[u8], from: SocketAddr) -> bool {
        let mut settings = match Settings::from_bytes(&data[DatagramHeader::SIZE..]) {
            Ok(settings) => settings,
            Err(e) => {
                warn!("UDP session {} sent bad settings: {}", id, e);
                self.close(id, Termination::AbortedLocalDataError);
                return false;
            }
        };
        let temporary = matches!(self.sessions.get(server), Some(Session::Udp(s)) if s.temporary);
        if temporary {
            settings.flags.answer_test = false;
            settings.flags.answer_now = false;
        }
        debug!("UDP session {} settings {:?}", id, settings);

        let now = self.transport.now();
        let Some(Session::Udp(conn)) = self.sessions.get_mut(id) else {
            return false;
        };
        conn.settings = Some(settings);
        conn.remote = Some(from);
        conn.base.started_at = now;

        if settings.reverse_requested() {
            conn.base.direction = Direction::Reverse;
            if let Err(e) = self.udp_tx_reverse_start(id) {
                warn!("UDP session {} cannot send back: {}", id, e);
                self.close(id, Termination::AbortedLocalTxError);
            }
            return false;
        }
        if settings.flags.wants_return_now() {
            if let Err(e) = self.udp_tx_start(id) {
                warn!("UDP session {} cannot start the dual test: {}", id, e);
                self.close(id, Termination::AbortedLocalTxError);
                return false;
            }
        }
        true
    }

    fn udp_account(&mut self, id: SessionId, header: &DatagramHeader, len: usize) {
        let arrival_us = self.transport.now().as_micros() as u64;
        let Some(Session::Udp(conn)) = self.sessions.get_mut(id) else {
            return;
        };
        conn.base.bytes += len as u64;
        conn.stats.record(header.id as u32, header.timestamp_us(), arrival_us);
    }

    /// A transmitter got the server's report.
    fn udp_server_report(&mut self, id: SessionId, data: &[u8]) {
        let report = match parse_report_datagram(data) {
            Ok(report) => report,
            Err(e) => {
                trace!("UDP session {} ignored a datagram: {}", id, e);
                return;
            }
        };
        let Some(Session::Udp(conn)) = self.sessions.get_mut(id) else {
            return;
        };
        let answered = report_answers_test(report.flags);
        if conn.report_count == 0 && answered {
            info!(
                "UDP session {} server report: {} bytes, jitter {:.3} ms, lost {}/{}, out of order {}",
                id,
                report.total_bytes(),
                report.jitter_ms(),
                report.error_cnt,
                report.datagrams,
                report.outorder_cnt
            );
            conn.base.bytes = report.total_bytes();
            conn.stats = stats_from_report(&report);
        }
        if report_is_extended(report.flags) {
            debug!("UDP session {} extended report not supported", id);
        }
        if answered {
            conn.report_count += 1;
        }
    }

    fn udp_queue_report(&mut self, id: SessionId, received: &[u8]) {
        let now = self.transport.now();
        let Some(Session::Udp(conn)) = self.sessions.get_mut(id) else {
            return;
        };
        let duration_ms = now.saturating_sub(conn.base.started_at).as_millis() as u64;
        let report = UdpReport::new(conn.base.bytes, duration_ms, &conn.stats);
        info!(
            "UDP session {} done: {} bytes, jitter {:.3} ms, lost {}/{}, out of order {}",
            id,
            conn.base.bytes,
            conn.stats.jitter_ms(),
            conn.stats.lost,
            conn.stats.datagrams,
            conn.stats.out_of_order
        );
        conn.pending_report = Some(PendingReport {
            datagram: build_report_datagram(received, &report),
            retry_at: None,
        });
        self.udp_send_report(id);
    }

    /// Sends the held report. The second transmission finishes the session.
    pub(crate) fn udp_send_report(&mut self, id: SessionId) {
        if !self.sessions.contains(id) {
            debug!("UDP session {} gone before its report", id);
            return;
        }
        let now = self.transport.now();
        let retry_delay = self.config.report_retry_delay;

        let Some(Session::Udp(conn)) = self.sessions.get(id) else {
            return;
        };
        let master = conn.base.master;
        let socket = master
            .and_then(|m| match self.sessions.get(m) {
                Some(Session::Udp(server)) => server.socket.as_ref(),
                _ => None,
            })
            .or(conn.socket.as_ref());
        if let (Some(pending), Some(socket), Some(remote)) = (&conn.pending_report, socket, conn.remote) {
            if let Err(e) = self.transport.udp_send_to(socket, &pending.datagram, remote) {
                debug!("UDP session {} report send failed: {}", id, e);
            }
        }

        let Some(Session::Udp(conn)) = self.sessions.get_mut(id) else {
            return;
        };
        conn.report_count += 1;
        if conn.report_count < 2 {
            if let Some(pending) = conn.pending_report.as_mut() {
                pending.retry_at = Some(now + retry_delay);
            }
            return;
        }
        conn.pending_report = None;

        if conn.settings.map_or(false, |s| s.flags.wants_return_after()) {
            debug!("UDP session {} peer wants a test back", id);
            if let Err(e) = self.udp_tx_start(id) {
                warn!("UDP session {} cannot start the return test: {}", id, e);
            }
        }
        self.close(id, Termination::DoneServerRx);

        if let Some(master) = master {
            if matches!(self.sessions.get(master), Some(Session::Udp(s)) if s.temporary) {
                self.close_silently(master);
            }
        }
    }

    /// Starts a new transmitter back to the peer of `id`.
    fn udp_tx_start(&mut self, id: SessionId) -> Result<SessionId> {
        let Some(Session::Udp(conn)) = self.sessions.get(id) else {
            return Err(Error::NotFound(id.to_string()));
        };
        let settings = conn
            .settings
            .ok_or_else(|| Error::Protocol("no settings captured".to_string()))?;
        let peer = conn
            .remote
            .ok_or_else(|| Error::Connection("peer address unknown".to_string()))?;
        let master = conn.base.master;
        let report = conn.base.report.clone();
        let remote = SocketAddr::new(peer.ip(), settings.remote_port as u16);
        let local_ip = master
            .and_then(|m| self.udp_local_addr(m))
            .map(|addr| addr.ip())
            .unwrap_or_else(|| unspecified_like(remote.ip()));

        let datagram_len = default_buffer_len(remote);
        let (rate, units_pps) = match settings.extended {
            Some(ext) => (ext.rate as u32, ext.eflags.units_pps),
            None if settings.win_band != 0 => (settings.win_band, false),
            None => (DEFAULT_UDP_RATE, false),
        };
        let tx_settings = Settings {
            flags: Flags::default(),
            buffer_len: datagram_len,
            extended: None,
            ..settings
        };

        let mut base = SessionBase::new(Role::Client, report, self.transport.now());
        base.master = master;
        let mut tx = UdpSession::new(
            base,
            UdpState::Transmitting(pacer_for(&self.config, rate, units_pps, datagram_len)),
        );
        tx.remote = Some(remote);
        tx.settings = Some(tx_settings);
        let tx_id = self.insert(Session::Udp(tx))?;

        match self.transport.udp_bind(SocketAddr::new(local_ip, 0), false, tx_id) {
            Ok(socket) => {
                if let Some(Session::Udp(tx)) = self.sessions.get_mut(tx_id) {
                    tx.socket = Some(socket);
                }
            }
            Err(e) => {
                self.sessions.remove(tx_id);
                return Err(Error::Io(e));
            }
        }
        info!("UDP return test {} to {} at {} bit/s", tx_id, remote, rate);
        self.udp_send_more(tx_id);
        Ok(tx_id)
    }

    /// Turns a server child into a transmitter towards its client.
    fn udp_tx_reverse_start(&mut self, id: SessionId) -> Result<()> {
        let Some(Session::Udp(conn)) = self.sessions.get(id) else {
            return Err(Error::NotFound(id.to_string()));
        };
        let settings = conn
            .settings
            .ok_or_else(|| Error::Protocol("no settings captured".to_string()))?;
        let remote = conn
            .remote
            .ok_or_else(|| Error::Connection("peer address unknown".to_string()))?;
        let local_ip = conn
            .base
            .master
            .and_then(|m| self.udp_local_addr(m))
            .map(|addr| addr.ip())
            .unwrap_or_else(|| unspecified_like(remote.ip()));
        let local = SocketAddr::new(local_ip, settings.remote_port as u16);
        let socket = self.transport.udp_bind(local, true, id)?;

        let datagram_len = default_buffer_len(remote);
        let (rate, units_pps) = settings
            .extended
            .map_or((DEFAULT_UDP_RATE, false), |ext| (ext.rate as u32, ext.eflags.units_pps));
        let pacer = pacer_for(&self.config, rate, units_pps, datagram_len);
        let now = self.transport.now();

        let Some(Session::Udp(conn)) = self.sessions.get_mut(id) else {
            self.transport.udp_close(&socket);
            return Err(Error::NotFound(id.to_string()));
        };
        conn.socket = Some(socket);
        conn.base.started_at = now;
        conn.base.bytes = 0;
        conn.base.direction = Direction::Reverse;
        conn.settings = Some(Settings {
            flags: Flags::default(),
            buffer_len: datagram_len,
            extended: None,
            ..settings
        });
        conn.state = UdpState::Transmitting(pacer);
        info!("UDP session {} sending back to {} at {} bit/s", id, remote, rate);
        self.udp_send_more(id);
        Ok(())
    }

    /// Sends the single datagram that starts a reverse test.
    fn udp_send_handshake(&mut self, id: SessionId) {
        let now = self.transport.now();
        let Some(Session::Udp(conn)) = self.sessions.get(id) else {
            return;
        };
        let (Some(settings), Some(socket), Some(remote)) = (conn.settings, conn.socket.as_ref(), conn.remote)
        else {
            return;
        };
        let datagram = build_datagram(DatagramHeader::new(0, now), &settings);
        if let Err(e) = self.transport.udp_send_to(socket, &datagram, remote) {
            debug!("UDP session {} handshake send failed: {}", id, e);
        }
    }

    /// One pacing step of a transmitter.
    pub(crate) fn udp_send_more(&mut self, id: SessionId) {
        let now = self.transport.now();
        let time_margin_ms = self.config.udp_time_margin.as_millis() as u64;
        let byte_margin = self.config.udp_byte_margin;

        let Some(Session::Udp(conn)) = self.sessions.get_mut(id) else {
            return;
        };
        let Some(settings) = conn.settings else {
            return;
        };

        let elapsed_ms = now.saturating_sub(conn.base.started_at).as_millis() as u64;
        let ending = match settings.amount {
            Amount::Time(hundredths) => {
                let target = hundredths as u64 * 10;
                match elapsed_ms {
                    e if e > target + time_margin_ms => 2,
                    e if e >= target => 1,
                    _ => 0,
                }
            }
            Amount::Bytes(target) => {
                let target = target as u64;
                match conn.base.bytes {
                    b if b >= target + byte_margin => 2,
                    b if b >= target => 1,
                    _ => 0,
                }
            }
        };
        if ending > 1 || (ending == 1 && conn.report_count > 0) {
            let reason = conn.base.tx_done();
            self.close(id, reason);
            return;
        }

        let UdpState::Transmitting(pacer) = &mut conn.state else {
            return;
        };
        if !pacer.is_due(now) {
            return;
        }
        let (Some(socket), Some(remote)) = (conn.socket.as_ref(), conn.remote) else {
            return;
        };

        for _ in 0..pacer.frames_per_delay {
            let header = DatagramHeader::new(pacer.next_id(ending > 0), now);
            let datagram = build_datagram(header, &settings);
            pacer.mark_sent(now);
            match self.transport.udp_send_to(socket, &datagram, remote) {
                Ok(()) => {
                    pacer.seq = pacer.seq.wrapping_add(1);
                    conn.base.bytes += datagram.len() as u64;
                }
                Err(e) => {
                    debug!("UDP session {} dropped datagram {}: {}", id, header.id, e);
                    return;
                }
            }
            if ending > 0 {
                pacer.enter_ending();
            }
        }
    }

    pub(crate) fn release_udp(&mut self, id: SessionId, mut conn: UdpSession<T>, termination: Termination) {
        conn.state = UdpState::Closing;
        let local = conn
            .socket
            .as_ref()
            .and_then(|socket| self.transport.udp_local_addr(socket))
            .or_else(|| conn.base.master.and_then(|m| self.udp_local_addr(m)));
        let stats = (conn.stats.datagrams > 0).then_some(conn.stats);
        self.emit_report(id, &conn.base, Protocol::Udp, termination, local, conn.remote, stats);

        conn.pending_report = None;
        if let Some(socket) = conn.socket.take() {
            if let Some(group) = conn.multicast {
                self.transport.udp_leave_multicast(&socket, group);
            }
            self.transport.udp_close(&socket);
        }
    }
}

/// Header, settings and payload up to the datagram size in `settings`.
fn build_datagram(header: DatagramHeader, settings: &Settings) -> Vec<u8> {
    let settings_bytes = settings.to_bytes();
    let len = (settings.buffer_len as usize).max(DatagramHeader::SIZE + settings_bytes.len());
    let mut datagram = Vec::with_capacity(len);
    datagram.extend_from_slice(&header.to_bytes());
    datagram.extend_from_slice(&settings_bytes);
    let rest = len - datagram.len();
    datagram.extend_from_slice(payload_at(0, rest));
    datagram
}

/// The peer's receive statistics as carried in its report.
fn stats_from_report(report: &UdpReport) -> UdpRxStats {
    UdpRxStats {
        lost: report.error_cnt,
        out_of_order: report.outorder_cnt,
        datagrams: report.datagrams,
        jitter_us: report.jitter1 as i64 * 1_000_000 + report.jitter2 as i64 * 1000,
        ..UdpRxStats::default()
    }
}

fn default_buffer_len(remote: SocketAddr) -> u32 {
    if remote.is_ipv6() {
        DEFAULT_UDP_BUFFER_LEN_V6
    } else {
        DEFAULT_UDP_BUFFER_LEN_V4
    }
}
