//! Sans-IO session engine.
//!
//! [`Engine`] owns every session of one process and drives them from
//! transport events and periodic polls. It never blocks: each entry point
//! runs to completion, possibly creating or closing sessions on the way.
//! The TCP and UDP halves live in `tcp.rs` and `udp.rs`.

use crate::config::{EngineConfig, Protocol};
use crate::measurements::UdpRxStats;
use crate::pacing::Pacer;
use crate::protocol::Settings;
use crate::registry::{Linked, Registry, SessionId};
use crate::report::{bandwidth_kbitpsec, Report, ReportRef, Termination};
use crate::tcp::{TcpSession, TcpState};
use crate::transport::Transport;
use crate::udp::{UdpSession, UdpState};
use crate::{Error, Result};
use log::{debug, info};
use serde::Serialize;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

/// Which end of the control handshake a session is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Role {
    Server,
    Client,
}

/// Normal: the handshake initiator sends data. Reverse: it receives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum Direction {
    #[default]
    Normal,
    Reverse,
}

/// Fields every session carries regardless of protocol.
pub(crate) struct SessionBase {
    pub role: Role,
    pub direction: Direction,
    pub master: Option<SessionId>,
    pub deallocated_master: Option<SessionId>,
    pub report: Option<ReportRef>,
    pub started_at: Duration,
    pub bytes: u64,
}

impl SessionBase {
    pub fn new(role: Role, report: Option<ReportRef>, started_at: Duration) -> Self {
        Self {
            role,
            direction: Direction::Normal,
            master: None,
            deallocated_master: None,
            report,
            started_at,
            bytes: 0,
        }
    }

    /// Whether this session is the data source of its test.
    pub fn is_transmitter(&self) -> bool {
        matches!(
            (self.role, self.direction),
            (Role::Client, Direction::Normal) | (Role::Server, Direction::Reverse)
        )
    }

    /// Termination reported when a transmitter reaches its target.
    pub fn tx_done(&self) -> Termination {
        match self.direction {
            Direction::Reverse => Termination::DoneServerTx,
            Direction::Normal => Termination::DoneClientTx,
        }
    }
}

pub(crate) enum Session<T: Transport> {
    Tcp(TcpSession<T>),
    Udp(UdpSession<T>),
}

impl<T: Transport> Session<T> {
    pub fn base(&self) -> &SessionBase {
        match self {
            Session::Tcp(conn) => &conn.base,
            Session::Udp(conn) => &conn.base,
        }
    }

    pub fn base_mut(&mut self) -> &mut SessionBase {
        match self {
            Session::Tcp(conn) => &mut conn.base,
            Session::Udp(conn) => &mut conn.base,
        }
    }

    pub fn protocol(&self) -> Protocol {
        match self {
            Session::Tcp(_) => Protocol::Tcp,
            Session::Udp(_) => Protocol::Udp,
        }
    }
}

impl<T: Transport> Linked for Session<T> {
    fn master(&self) -> Option<SessionId> {
        self.base().master
    }

    fn set_master(&mut self, master: Option<SessionId>) {
        self.base_mut().master = master;
    }

    fn deallocated_master(&self) -> Option<SessionId> {
        self.base().deallocated_master
    }

    fn set_deallocated_master(&mut self, id: Option<SessionId>) {
        self.base_mut().deallocated_master = id;
    }
}

/// Protocol specific state of a session, as seen from outside.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Tcp(TcpState),
    Udp(UdpState),
}

/// Read-only snapshot of one session.
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub id: SessionId,
    pub protocol: Protocol,
    pub role: Role,
    pub direction: Direction,
    pub master: Option<SessionId>,
    pub deallocated_master: Option<SessionId>,
    pub state: SessionState,
    pub bytes: u64,
    pub started_at: Duration,
    pub settings: Option<Settings>,
    pub remote: Option<SocketAddr>,
    /// TCP listeners serving one dual/tradeoff peer only.
    pub specific_remote: Option<IpAddr>,
    pub tradeoff: bool,
    /// UDP servers started as the receiving half of a dual/tradeoff client.
    pub temporary: bool,
    pub udp_stats: Option<UdpRxStats>,
    pub report_count: u32,
    pub idle_polls: u32,
}

/// Owner of all sessions, parameterised over the network stack.
///
/// # Examples
///
/// Driving the engine is up to the host: it forwards transport events to
/// the `on_*` methods and calls [`Engine::poll_udp_pacing`] and
/// [`Engine::poll_tcp`] periodically. [`crate::host::Host`] does this on
/// tokio.
pub struct Engine<T: Transport> {
    pub(crate) transport: T,
    pub(crate) sessions: Registry<Session<T>>,
    pub(crate) config: EngineConfig,
}

impl<T: Transport> Engine<T> {
    pub fn new(transport: T) -> Self {
        Self::with_config(transport, EngineConfig::default())
    }

    pub fn with_config(transport: T, config: EngineConfig) -> Self {
        Self {
            transport,
            sessions: Registry::with_capacity_limit(config.max_sessions),
            config,
        }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Whether `id` still names a live session.
    pub fn contains(&self, id: SessionId) -> bool {
        self.sessions.contains(id)
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_idle(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn session(&self, id: SessionId) -> Option<SessionInfo> {
        self.sessions.get(id).map(|session| self.describe(id, session))
    }

    pub fn sessions(&self) -> Vec<SessionInfo> {
        self.sessions
            .iter()
            .map(|(id, session)| self.describe(id, session))
            .collect()
    }

    /// Whether any live session is `id` or was spawned by it.
    pub fn has_related(&self, id: SessionId) -> bool {
        self.sessions
            .iter()
            .any(|(other, session)| other == id || Self::is_related(session, id))
    }

    /// Closes `target` and every session linked to it as master, live or
    /// already deallocated. Unknown ids are ignored.
    pub fn abort(&mut self, target: SessionId) {
        for id in self.sessions.ids() {
            let matches = match self.sessions.get(id) {
                Some(session) => id == target || Self::is_related(session, target),
                None => false,
            };
            if matches {
                debug!("aborting session {}", id);
                self.close(id, Termination::AbortedLocal);
            }
        }
    }

    /// Closes every session.
    pub fn abort_all(&mut self) {
        for id in self.sessions.ids() {
            self.close(id, Termination::AbortedLocal);
        }
    }

    fn is_related(session: &Session<T>, target: SessionId) -> bool {
        let base = session.base();
        base.master == Some(target) || base.deallocated_master == Some(target)
    }

    pub(crate) fn insert(&mut self, session: Session<T>) -> Result<SessionId> {
        self.sessions
            .insert(session)
            .map_err(|_| Error::ResourceExhausted(self.sessions.capacity_limit()))
    }

    /// Unregisters, reports and releases a session. A no-op for ids that
    /// are no longer live.
    pub(crate) fn close(&mut self, id: SessionId, termination: Termination) {
        let Some(session) = self.sessions.remove(id) else {
            return;
        };
        info!(
            "{} session {} closed: {}",
            session.protocol(),
            id,
            termination
        );
        match session {
            Session::Tcp(conn) => self.release_tcp(id, conn, termination),
            Session::Udp(conn) => self.release_udp(id, conn, termination),
        }
    }

    /// Closes a helper session without producing a report.
    pub(crate) fn close_silently(&mut self, id: SessionId) {
        if let Some(session) = self.sessions.get_mut(id) {
            session.base_mut().report = None;
        }
        self.close(id, Termination::AbortedLocal);
    }

    pub(crate) fn emit_report(
        &self,
        id: SessionId,
        base: &SessionBase,
        protocol: Protocol,
        termination: Termination,
        local: Option<SocketAddr>,
        remote: Option<SocketAddr>,
        udp: Option<UdpRxStats>,
    ) {
        let Some(callback) = &base.report else {
            return;
        };
        let duration_ms = self
            .transport
            .now()
            .saturating_sub(base.started_at)
            .as_millis() as u64;
        callback.on_report(Report {
            session: id,
            protocol,
            termination,
            local,
            remote,
            bytes_transferred: base.bytes,
            duration_ms,
            bandwidth_kbitpsec: bandwidth_kbitpsec(base.bytes, duration_ms),
            udp,
        });
    }

    fn describe(&self, id: SessionId, session: &Session<T>) -> SessionInfo {
        let base = session.base();
        let mut info = SessionInfo {
            id,
            protocol: session.protocol(),
            role: base.role,
            direction: base.direction,
            master: base.master,
            deallocated_master: base.deallocated_master,
            state: SessionState::Tcp(TcpState::Closing),
            bytes: base.bytes,
            started_at: base.started_at,
            settings: None,
            remote: None,
            specific_remote: None,
            tradeoff: false,
            temporary: false,
            udp_stats: None,
            report_count: 0,
            idle_polls: 0,
        };
        match session {
            Session::Tcp(conn) => {
                info.state = SessionState::Tcp(conn.state);
                info.settings = conn.settings;
                info.remote = conn.peer_addr(&self.transport);
                info.specific_remote = conn.specific_remote;
                info.tradeoff = conn.tradeoff;
                info.idle_polls = conn.idle_polls;
            }
            Session::Udp(conn) => {
                info.state = SessionState::Udp(conn.state.clone());
                info.settings = conn.settings;
                info.remote = conn.remote;
                info.temporary = conn.temporary;
                info.udp_stats = Some(conn.stats);
                info.report_count = conn.report_count;
            }
        }
        info
    }
}

/// Pacer for a transmitter, on this engine's clock.
pub(crate) fn pacer_for(config: &EngineConfig, rate: u32, units_pps: bool, buffer_len: u32) -> Pacer {
    Pacer::new(rate, units_pps, buffer_len, config.clock_resolution_us)
}
