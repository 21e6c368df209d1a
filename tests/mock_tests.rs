// Engine tests over a mock transport
// Time, write capacity and delivery are all controlled by the test

use rperf2::protocol::{Amount, Settings};
use rperf2::udp_packet::{build_report_datagram, DatagramHeader, UdpReport};
use rperf2::{
    Chunk, Direction, Engine, EngineConfig, Error, Report, ReportCollector, Role, SessionId,
    SessionState, TcpClientParams, TcpState, TestMode, Termination, Transport, UdpClientParams,
    UdpRxStats, UdpState, WriteError,
};
use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct Handle(u64);

struct MockStream {
    owner: Option<SessionId>,
    local: SocketAddr,
    peer: SocketAddr,
    written: Vec<u8>,
    recved: usize,
    closed: bool,
    aborted: bool,
}

struct Sent {
    from: SocketAddr,
    to: SocketAddr,
    data: Vec<u8>,
}

/// Transport that records everything and never blocks.
struct MockTransport {
    now: Duration,
    next: u64,
    next_port: u16,
    /// Bytes `tcp_write` accepts before reporting a full buffer.
    budget: usize,
    fail_listen: bool,
    fail_connect: bool,
    fail_bind: bool,
    local_ip: IpAddr,
    listeners: HashMap<u64, SocketAddr>,
    streams: HashMap<u64, MockStream>,
    sockets: HashMap<u64, SocketAddr>,
    sent: Vec<Sent>,
    joined: Vec<IpAddr>,
    tos: Vec<u8>,
}

impl MockTransport {
    fn new() -> Self {
        Self {
            now: Duration::from_secs(100),
            next: 0,
            next_port: 40000,
            budget: 0,
            fail_listen: false,
            fail_connect: false,
            fail_bind: false,
            local_ip: "192.168.1.2".parse().unwrap(),
            listeners: HashMap::new(),
            streams: HashMap::new(),
            sockets: HashMap::new(),
            sent: Vec::new(),
            joined: Vec::new(),
            tos: Vec::new(),
        }
    }

    fn handle(&mut self) -> Handle {
        self.next += 1;
        Handle(self.next)
    }

    fn port(&mut self, requested: u16) -> u16 {
        if requested != 0 {
            return requested;
        }
        self.next_port += 1;
        self.next_port
    }

    /// A connection from `peer` arriving on the listener bound to `local`.
    fn incoming(&mut self, local: SocketAddr, peer: SocketAddr) -> Handle {
        let handle = self.handle();
        self.streams.insert(
            handle.0,
            MockStream {
                owner: None,
                local,
                peer,
                written: Vec::new(),
                recved: 0,
                closed: false,
                aborted: false,
            },
        );
        handle
    }

    fn stream_of(&self, owner: SessionId) -> &MockStream {
        self.streams
            .values()
            .find(|s| s.owner == Some(owner))
            .expect("no stream for session")
    }

    fn sent_to(&self, to: SocketAddr) -> Vec<&Sent> {
        self.sent.iter().filter(|s| s.to == to).collect()
    }
}

impl Transport for MockTransport {
    type TcpListener = Handle;
    type TcpStream = Handle;
    type UdpSocket = Handle;

    fn now(&self) -> Duration {
        self.now
    }

    fn tcp_listen(&mut self, local: SocketAddr, _owner: SessionId) -> io::Result<Handle> {
        if self.fail_listen {
            return Err(io::Error::from(io::ErrorKind::AddrInUse));
        }
        let port = self.port(local.port());
        let handle = self.handle();
        self.listeners.insert(handle.0, SocketAddr::new(local.ip(), port));
        Ok(handle)
    }

    fn tcp_listener_addr(&self, listener: &Handle) -> Option<SocketAddr> {
        self.listeners.get(&listener.0).copied()
    }

    fn tcp_close_listener(&mut self, listener: &Handle) {
        self.listeners.remove(&listener.0);
    }

    fn tcp_connect(&mut self, remote: SocketAddr, owner: SessionId) -> io::Result<Handle> {
        if self.fail_connect {
            return Err(io::Error::from(io::ErrorKind::ConnectionRefused));
        }
        let local = SocketAddr::new(self.local_ip, self.port(0));
        let handle = self.incoming(local, remote);
        if let Some(stream) = self.streams.get_mut(&handle.0) {
            stream.owner = Some(owner);
        }
        Ok(handle)
    }

    fn tcp_attach(&mut self, stream: &Handle, owner: SessionId) {
        if let Some(s) = self.streams.get_mut(&stream.0) {
            s.owner = Some(owner);
        }
    }

    fn tcp_set_tos(&mut self, _stream: &Handle, tos: u8) -> io::Result<()> {
        self.tos.push(tos);
        Ok(())
    }

    fn tcp_mss(&self, _stream: &Handle) -> usize {
        1460
    }

    fn tcp_write(&mut self, stream: &Handle, chunk: Chunk<'_>, _more: bool) -> Result<(), WriteError> {
        if chunk.len() > self.budget {
            return Err(WriteError::BufferFull);
        }
        let s = self
            .streams
            .get_mut(&stream.0)
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotConnected))?;
        self.budget -= chunk.len();
        s.written.extend_from_slice(chunk.bytes());
        Ok(())
    }

    fn tcp_output(&mut self, _stream: &Handle) {}

    fn tcp_recved(&mut self, stream: &Handle, len: usize) {
        if let Some(s) = self.streams.get_mut(&stream.0) {
            s.recved += len;
        }
    }

    fn tcp_local_addr(&self, stream: &Handle) -> Option<SocketAddr> {
        self.streams.get(&stream.0).map(|s| s.local)
    }

    fn tcp_peer_addr(&self, stream: &Handle) -> Option<SocketAddr> {
        self.streams.get(&stream.0).map(|s| s.peer)
    }

    fn tcp_close(&mut self, stream: &Handle) -> io::Result<()> {
        if let Some(s) = self.streams.get_mut(&stream.0) {
            s.closed = true;
        }
        Ok(())
    }

    fn tcp_abort(&mut self, stream: &Handle) {
        if let Some(s) = self.streams.get_mut(&stream.0) {
            s.aborted = true;
        }
    }

    fn udp_bind(&mut self, local: SocketAddr, _reuse_addr: bool, _owner: SessionId) -> io::Result<Handle> {
        if self.fail_bind {
            return Err(io::Error::from(io::ErrorKind::AddrInUse));
        }
        let ip = if local.ip().is_unspecified() { self.local_ip } else { local.ip() };
        let port = self.port(local.port());
        let handle = self.handle();
        self.sockets.insert(handle.0, SocketAddr::new(ip, port));
        Ok(handle)
    }

    fn udp_local_addr(&self, socket: &Handle) -> Option<SocketAddr> {
        self.sockets.get(&socket.0).copied()
    }

    fn udp_send_to(&mut self, socket: &Handle, data: &[u8], remote: SocketAddr) -> io::Result<()> {
        let from = self
            .sockets
            .get(&socket.0)
            .copied()
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotConnected))?;
        self.sent.push(Sent {
            from,
            to: remote,
            data: data.to_vec(),
        });
        Ok(())
    }

    fn udp_set_tos(&mut self, _socket: &Handle, tos: u8) -> io::Result<()> {
        self.tos.push(tos);
        Ok(())
    }

    fn udp_join_multicast(&mut self, _socket: &Handle, group: IpAddr) -> io::Result<()> {
        self.joined.push(group);
        Ok(())
    }

    fn udp_leave_multicast(&mut self, _socket: &Handle, group: IpAddr) {
        self.joined.retain(|g| *g != group);
    }

    fn udp_close(&mut self, socket: &Handle) {
        self.sockets.remove(&socket.0);
    }
}

fn engine() -> Engine<MockTransport> {
    Engine::new(MockTransport::new())
}

fn addr(s: &str) -> SocketAddr {
    s.parse().unwrap()
}

fn advance(engine: &mut Engine<MockTransport>, ms: u64) {
    engine.transport_mut().now += Duration::from_millis(ms);
}

fn only_report(collector: &ReportCollector, id: SessionId) -> Report {
    let reports = collector.for_session(id);
    assert_eq!(reports.len(), 1, "expected exactly one report for {}", id);
    reports[0].clone()
}

/// Keeps a sender busy in 10 ms steps until it closes.
fn pump_tcp(engine: &mut Engine<MockTransport>, id: SessionId, budget: usize) {
    for _ in 0..100_000 {
        if !engine.contains(id) {
            return;
        }
        engine.transport_mut().budget = budget;
        engine.on_tcp_sent(id);
        advance(engine, 10);
    }
    panic!("sender {} never finished", id);
}

/// Accepts one connection from `peer` on `listener` at `local`.
fn accept(engine: &mut Engine<MockTransport>, listener: SessionId, local: SocketAddr, peer: SocketAddr) -> SessionId {
    let stream = engine.transport_mut().incoming(local, peer);
    engine.on_tcp_accept(listener, stream).unwrap()
}

fn datagram(id: i32, now: Duration, settings: &Settings) -> Vec<u8> {
    let mut data = DatagramHeader::new(id, now).to_bytes().to_vec();
    data.extend_from_slice(&settings.to_bytes());
    data.resize(settings.buffer_len as usize, b'x');
    data
}

mod tcp_client {
    use super::*;

    #[test]
    fn test_time_limited_client_stops_after_one_second() {
        let collector = ReportCollector::new();
        let mut engine = engine();
        let params = TcpClientParams::new(addr("10.0.0.1:5001"), Amount::from_wire((-100i32) as u32));
        let id = engine
            .start_tcp_client(params, Some(collector.forwarding_to(None)))
            .unwrap();
        assert_eq!(
            engine.session(id).unwrap().state,
            SessionState::Tcp(TcpState::Transferring)
        );

        engine.on_tcp_connected(id, Ok(()));
        pump_tcp(&mut engine, id, 16 * 1024);

        let report = only_report(&collector, id);
        assert_eq!(report.termination, Termination::DoneClientTx);
        assert!(report.duration_ms >= 1000);
        assert!(report.duration_ms < 1010);
        assert!(report.bytes_transferred > 0);
    }

    #[test]
    fn test_byte_limited_client_sends_at_least_the_target() {
        let collector = ReportCollector::new();
        let mut engine = engine();
        let params = TcpClientParams::new(addr("10.0.0.1:5001"), Amount::Bytes(1_048_576));
        let id = engine
            .start_tcp_client(params, Some(collector.forwarding_to(None)))
            .unwrap();
        engine.on_tcp_connected(id, Ok(()));
        pump_tcp(&mut engine, id, 64 * 1024);

        let report = only_report(&collector, id);
        assert_eq!(report.termination, Termination::DoneClientTx);
        assert!(report.bytes_transferred >= 1_048_576);

        let stream = engine.transport().stream_of(id);
        assert_eq!(stream.written.len() as u64, report.bytes_transferred);
        assert!(stream.closed);
    }

    #[test]
    fn test_stream_starts_with_settings_and_repeats_them_per_block() {
        let mut engine = Engine::with_config(
            MockTransport::new(),
            EngineConfig {
                block_size: 4096,
                ..EngineConfig::default()
            },
        );
        let params = TcpClientParams::new(addr("10.0.0.1:5001"), Amount::Bytes(20_000));
        let settings = params.settings();
        let id = engine.start_tcp_client(params, None).unwrap();
        engine.on_tcp_connected(id, Ok(()));
        pump_tcp(&mut engine, id, 64 * 1024);

        let written = &engine.transport().stream_of(id).written;
        let header = settings.to_stream_bytes();
        assert_eq!(&written[..60], &header[..]);
        // next block starts 4096 bytes after the first header
        assert_eq!(&written[60 + 4096..60 + 4096 + 60], &header[..]);
    }

    #[test]
    fn test_connect_failure_reports_aborted_remote() {
        let collector = ReportCollector::new();
        let mut engine = engine();
        let params = TcpClientParams::new(addr("10.0.0.1:5001"), Amount::Time(100));
        let id = engine
            .start_tcp_client(params, Some(collector.forwarding_to(None)))
            .unwrap();

        engine.on_tcp_connected(id, Err(io::Error::from(io::ErrorKind::ConnectionRefused)));
        assert!(!engine.contains(id));
        assert_eq!(only_report(&collector, id).termination, Termination::AbortedRemote);
    }

    #[test]
    fn test_connect_error_leaves_nothing_registered() {
        let mut engine = engine();
        engine.transport_mut().fail_connect = true;
        let params = TcpClientParams::new(addr("10.0.0.1:5001"), Amount::Time(100));
        assert!(matches!(
            engine.start_tcp_client(params, None),
            Err(Error::Connection(_))
        ));
        assert!(engine.is_idle());
    }

    #[test]
    fn test_tos_applied_on_connect() {
        let mut engine = engine();
        let params = TcpClientParams {
            tos: 0x10,
            ..TcpClientParams::new(addr("10.0.0.1:5001"), Amount::Time(100))
        };
        let id = engine.start_tcp_client(params, None).unwrap();
        engine.on_tcp_connected(id, Ok(()));
        assert_eq!(engine.transport().tos, vec![0x10]);
    }

    #[test]
    fn test_reverse_client_sends_settings_then_counts_received_bytes() {
        let collector = ReportCollector::new();
        let mut engine = engine();
        engine.transport_mut().budget = 1 << 20;
        let params = TcpClientParams {
            mode: TestMode::Reverse,
            ..TcpClientParams::new(addr("10.0.0.1:5001"), Amount::Time(100))
        };
        let id = engine
            .start_tcp_client(params, Some(collector.forwarding_to(None)))
            .unwrap();
        engine.on_tcp_connected(id, Ok(()));

        let info = engine.session(id).unwrap();
        assert_eq!(info.direction, Direction::Reverse);
        assert_eq!(engine.transport().stream_of(id).written.len(), 60);

        engine.on_tcp_sent(id);
        assert_eq!(engine.transport().stream_of(id).written.len(), 60);

        engine.on_tcp_recv(id, Some(&[7u8; 1000]));
        engine.on_tcp_recv(id, Some(&[7u8; 500]));
        assert_eq!(
            engine.session(id).unwrap().state,
            SessionState::Tcp(TcpState::Transferring)
        );
        engine.on_tcp_recv(id, None);

        let report = only_report(&collector, id);
        assert_eq!(report.termination, Termination::DoneClientRx);
        assert_eq!(report.bytes_transferred, 1500);
    }
}

mod tcp_server {
    use super::*;

    fn server(engine: &mut Engine<MockTransport>, collector: &ReportCollector) -> (SessionId, SocketAddr) {
        let local = addr("192.168.1.1:5001");
        let id = engine
            .start_tcp_server(local, Some(collector.forwarding_to(None)))
            .unwrap();
        (id, local)
    }

    #[test]
    fn test_receives_and_counts_settings_and_payload() {
        let collector = ReportCollector::new();
        let mut engine = engine();
        let (listener, local) = server(&mut engine, &collector);
        let child = accept(&mut engine, listener, local, addr("10.0.0.9:41000"));
        assert_eq!(engine.session(child).unwrap().master, Some(listener));

        let settings = TcpClientParams::new(local, Amount::Time(1000)).settings();
        let mut first = settings.to_stream_bytes().to_vec();
        first.extend_from_slice(&[0u8; 1000]);
        engine.on_tcp_recv(child, Some(&first));
        engine.on_tcp_recv(child, Some(&[0u8; 2000]));
        assert_eq!(engine.session(child).unwrap().settings, Some(settings));
        assert_eq!(engine.transport().stream_of(child).recved, 3060);

        engine.on_tcp_recv(child, None);
        let report = only_report(&collector, child);
        assert_eq!(report.termination, Termination::DoneServerRx);
        assert_eq!(report.bytes_transferred, 3060);
        assert_eq!(report.remote, Some(addr("10.0.0.9:41000")));
        assert!(engine.contains(listener));
    }

    #[test]
    fn test_short_handshake_is_a_data_error() {
        let collector = ReportCollector::new();
        let mut engine = engine();
        let (listener, local) = server(&mut engine, &collector);
        let child = accept(&mut engine, listener, local, addr("10.0.0.9:41000"));

        engine.on_tcp_recv(child, Some(&[0u8; 30]));
        assert!(!engine.contains(child));
        assert_eq!(
            only_report(&collector, child).termination,
            Termination::AbortedLocalDataError
        );
    }

    #[test]
    fn test_idle_child_times_out() {
        let collector = ReportCollector::new();
        let mut engine = engine();
        let (listener, local) = server(&mut engine, &collector);
        let child = accept(&mut engine, listener, local, addr("10.0.0.9:41000"));

        for _ in 0..9 {
            engine.poll_tcp();
        }
        assert!(engine.contains(child));
        engine.poll_tcp();
        assert!(!engine.contains(child));
        assert_eq!(only_report(&collector, child).termination, Termination::AbortedLocal);
        // listeners are not polled for idleness
        assert!(engine.contains(listener));
    }

    #[test]
    fn test_reverse_request_turns_child_into_sender() {
        let collector = ReportCollector::new();
        let mut engine = engine();
        let (listener, local) = server(&mut engine, &collector);
        let child = accept(&mut engine, listener, local, addr("10.0.0.9:41000"));

        let settings = TcpClientParams {
            mode: TestMode::Reverse,
            ..TcpClientParams::new(local, Amount::Bytes(10_000))
        }
        .settings();
        engine.on_tcp_recv(child, Some(&settings.to_stream_bytes()));

        let info = engine.session(child).unwrap();
        assert_eq!(info.role, Role::Server);
        assert_eq!(info.direction, Direction::Reverse);
        pump_tcp(&mut engine, child, 4096);

        let report = only_report(&collector, child);
        assert_eq!(report.termination, Termination::DoneServerTx);
        assert!(report.bytes_transferred >= 10_000);
        // a server child does not echo the settings header
        let written = &engine.transport().stream_of(child).written;
        assert_ne!(&written[..60], &settings.to_stream_bytes()[..]);
    }

    #[test]
    fn test_tradeoff_request_connects_back_after_receive() {
        let mut engine = engine();
        let collector = ReportCollector::new();
        let (listener, local) = server(&mut engine, &collector);
        let child = accept(&mut engine, listener, local, addr("10.0.0.9:41000"));

        let mut settings = TcpClientParams {
            mode: TestMode::Tradeoff,
            ..TcpClientParams::new(local, Amount::Bytes(5000))
        }
        .settings();
        settings.remote_port = 6001;
        engine.on_tcp_recv(child, Some(&settings.to_stream_bytes()));
        assert_eq!(engine.session_count(), 2);

        engine.on_tcp_recv(child, None);
        let back = engine
            .sessions()
            .into_iter()
            .find(|s| s.role == Role::Client)
            .expect("return client");
        assert_eq!(back.remote, Some(addr("10.0.0.9:6001")));
        assert_eq!(back.master, Some(listener));
        let back_settings = back.settings.unwrap();
        assert!(!back_settings.flags.answer_test);
        assert!(back_settings.extended.is_none());
    }

    #[test]
    fn test_listen_failure_leaves_nothing_registered() {
        let mut engine = engine();
        engine.transport_mut().fail_listen = true;
        assert!(engine.start_tcp_server(addr("0.0.0.0:5001"), None).is_err());
        assert!(engine.is_idle());
    }

    #[test]
    fn test_capacity_limit() {
        let mut engine = Engine::with_config(
            MockTransport::new(),
            EngineConfig {
                max_sessions: 1,
                ..EngineConfig::default()
            },
        );
        engine.start_tcp_server(addr("0.0.0.0:5001"), None).unwrap();
        assert!(matches!(
            engine.start_udp_server(addr("0.0.0.0:5002"), None),
            Err(Error::ResourceExhausted(1))
        ));
        assert_eq!(engine.session_count(), 1);
    }
}

mod dual {
    use super::*;

    fn listener_of(engine: &Engine<MockTransport>, client: SessionId) -> SessionId {
        engine
            .sessions()
            .into_iter()
            .find(|s| s.master == Some(client) && s.specific_remote.is_some())
            .map(|s| s.id)
            .expect("dual listener")
    }

    #[test]
    fn test_dual_listener_accepts_only_the_server_once() {
        let mut engine = engine();
        let params = TcpClientParams {
            mode: TestMode::Dual,
            ..TcpClientParams::new(addr("10.0.0.1:5001"), Amount::Time(100))
        };
        let client = engine.start_tcp_client(params, None).unwrap();
        assert_eq!(engine.session_count(), 2);

        let listener = listener_of(&engine, client);
        let info = engine.session(listener).unwrap();
        assert_eq!(info.specific_remote, Some("10.0.0.1".parse().unwrap()));
        assert!(!info.tradeoff);
        let local = addr("192.168.1.2:5001");

        let stranger = engine.transport_mut().incoming(local, addr("10.0.0.7:50000"));
        assert!(matches!(
            engine.on_tcp_accept(listener, stranger.clone()),
            Err(Error::Rejected(_))
        ));
        assert!(engine.transport().streams[&stranger.0].aborted);
        assert!(engine.contains(listener));

        let child = accept(&mut engine, listener, local, addr("10.0.0.1:50001"));
        assert!(!engine.contains(listener));
        let info = engine.session(child).unwrap();
        assert_eq!(info.master, Some(client));
        // the return connection carries no settings header
        assert_eq!(info.state, SessionState::Tcp(TcpState::Transferring));
    }

    #[test]
    fn test_tradeoff_listener_outlives_one_accept_while_client_runs() {
        let mut engine = engine();
        let params = TcpClientParams {
            mode: TestMode::Tradeoff,
            ..TcpClientParams::new(addr("10.0.0.1:5001"), Amount::Bytes(4000))
        };
        let client = engine.start_tcp_client(params, None).unwrap();
        let listener = listener_of(&engine, client);
        assert!(engine.session(listener).unwrap().tradeoff);
        let local = addr("192.168.1.2:5001");

        accept(&mut engine, listener, local, addr("10.0.0.1:50001"));
        assert!(engine.contains(listener));

        engine.on_tcp_connected(client, Ok(()));
        pump_tcp(&mut engine, client, 64 * 1024);
        assert!(!engine.contains(client));
        let info = engine.session(listener).unwrap();
        assert_eq!(info.master, None);
        assert_eq!(info.deallocated_master, Some(client));

        let late = accept(&mut engine, listener, local, addr("10.0.0.1:50002"));
        assert!(!engine.contains(listener));
        assert!(engine.has_related(client));
        assert_eq!(engine.session(late).unwrap().deallocated_master, Some(client));
    }

    #[test]
    fn test_listen_failure_drops_client() {
        let mut engine = Engine::with_config(
            MockTransport::new(),
            EngineConfig {
                dual_port: 0,
                ..EngineConfig::default()
            },
        );
        engine.transport_mut().fail_listen = true;
        let params = TcpClientParams {
            mode: TestMode::Dual,
            ..TcpClientParams::new(addr("10.0.0.1:5001"), Amount::Time(100))
        };
        assert!(engine.start_tcp_client(params, None).is_err());
        assert!(engine.is_idle());
    }

    #[test]
    fn test_ephemeral_dual_port_is_advertised() {
        let mut engine = Engine::with_config(
            MockTransport::new(),
            EngineConfig {
                dual_port: 0,
                ..EngineConfig::default()
            },
        );
        let params = TcpClientParams {
            mode: TestMode::Dual,
            ..TcpClientParams::new(addr("10.0.0.1:5001"), Amount::Time(100))
        };
        let client = engine.start_tcp_client(params, None).unwrap();
        let listener = listener_of(&engine, client);
        let port = engine.transport().listeners.values().next().unwrap().port();
        assert_ne!(port, 0);
        assert_eq!(engine.session(client).unwrap().settings.unwrap().remote_port, port as u32);
        assert!(engine.contains(listener));
    }

    #[test]
    fn test_abort_is_idempotent_and_reaches_children() {
        let collector = ReportCollector::new();
        let mut engine = engine();
        let params = TcpClientParams {
            mode: TestMode::Dual,
            ..TcpClientParams::new(addr("10.0.0.1:5001"), Amount::Time(100))
        };
        let client = engine
            .start_tcp_client(params, Some(collector.forwarding_to(None)))
            .unwrap();
        assert_eq!(engine.session_count(), 2);

        engine.abort(client);
        assert!(engine.is_idle());
        assert_eq!(collector.len(), 2);
        assert!(collector
            .reports()
            .iter()
            .all(|r| r.termination == Termination::AbortedLocal));

        engine.abort(client);
        assert_eq!(collector.len(), 2);
    }
}

mod udp_server {
    use super::*;

    fn client_settings(mode: TestMode) -> Settings {
        UdpClientParams {
            mode,
            ..UdpClientParams::new(addr("192.168.1.1:5001"), Amount::Time(100))
        }
        .settings(Some(6001))
    }

    #[test]
    fn test_loss_and_reordering_are_reported_twice() {
        let collector = ReportCollector::new();
        let mut engine = engine();
        let server = engine
            .start_udp_server(addr("192.168.1.1:5001"), Some(collector.forwarding_to(None)))
            .unwrap();
        let peer = addr("10.0.0.9:41000");
        let settings = client_settings(TestMode::Send);

        for id in [0, 1, 3, 2, 4] {
            let now = engine.transport().now;
            engine.on_udp_recv(server, &datagram(id, now, &settings), peer);
            advance(&mut engine, 1);
        }
        let child = engine
            .sessions()
            .into_iter()
            .find(|s| s.master == Some(server))
            .expect("child session");
        assert_eq!(child.state, SessionState::Udp(UdpState::Receiving));
        assert_eq!(child.bytes, 5 * 1470);

        let now = engine.transport().now;
        engine.on_udp_recv(server, &datagram(-5, now, &settings), peer);
        assert_eq!(engine.transport().sent_to(peer).len(), 1);
        assert!(engine.contains(child.id));

        // further terminal datagrams do not produce extra reports
        engine.on_udp_recv(server, &datagram(-5, now, &settings), peer);
        assert_eq!(engine.transport().sent_to(peer).len(), 1);

        advance(&mut engine, 10);
        engine.poll_udp_pacing();
        assert_eq!(engine.transport().sent_to(peer).len(), 2);
        assert!(!engine.contains(child.id));

        let report = only_report(&collector, child.id);
        assert_eq!(report.termination, Termination::DoneServerRx);
        let stats = report.udp.unwrap();
        assert_eq!(stats.lost, 1);
        assert_eq!(stats.out_of_order, 1);
        assert_eq!(stats.datagrams, 5);

        let reply = &engine.transport().sent_to(peer)[0].data;
        let parsed = rperf2::udp_packet::parse_report_datagram(reply).unwrap();
        assert_eq!(parsed.total_bytes(), 5 * 1470);
        assert_eq!(parsed.error_cnt, 1);
        assert_eq!(parsed.outorder_cnt, 1);
    }

    #[test]
    fn test_short_and_malformed_datagrams() {
        let collector = ReportCollector::new();
        let mut engine = engine();
        let server = engine
            .start_udp_server(addr("192.168.1.1:5001"), Some(collector.forwarding_to(None)))
            .unwrap();

        engine.on_udp_recv(server, &[0u8; 10], addr("10.0.0.9:41000"));
        assert_eq!(engine.session_count(), 1);

        // a header with a truncated settings block
        let mut short = DatagramHeader::new(0, Duration::ZERO).to_bytes().to_vec();
        short.extend_from_slice(&[0u8; 8]);
        engine.on_udp_recv(server, &short, addr("10.0.0.9:41000"));
        assert_eq!(engine.session_count(), 1);
        assert_eq!(
            collector.with_termination(Termination::AbortedLocalDataError).len(),
            1
        );
    }

    #[test]
    fn test_dual_request_starts_return_sender() {
        let mut engine = engine();
        let server = engine.start_udp_server(addr("192.168.1.1:5001"), None).unwrap();
        let peer = addr("10.0.0.9:41000");
        let settings = client_settings(TestMode::Dual);

        engine.on_udp_recv(server, &datagram(0, engine.transport().now, &settings), peer);
        assert_eq!(engine.session_count(), 3);
        let sender = engine
            .sessions()
            .into_iter()
            .find(|s| s.role == Role::Client)
            .expect("return sender");
        assert_eq!(sender.remote, Some(addr("10.0.0.9:6001")));
        assert!(matches!(sender.state, SessionState::Udp(UdpState::Transmitting(_))));
        assert_eq!(sender.master, Some(server));
        let sent = engine.transport().sent_to(addr("10.0.0.9:6001"));
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].data.len(), 1470);
    }

    #[test]
    fn test_reverse_request_flips_child_to_sender() {
        let collector = ReportCollector::new();
        let mut engine = engine();
        let server = engine
            .start_udp_server(addr("192.168.1.1:5001"), Some(collector.forwarding_to(None)))
            .unwrap();
        let peer = addr("10.0.0.9:41000");
        let settings = client_settings(TestMode::Reverse);

        engine.on_udp_recv(server, &datagram(0, engine.transport().now, &settings), peer);
        let child = engine
            .sessions()
            .into_iter()
            .find(|s| s.master == Some(server))
            .expect("child session");
        assert_eq!(child.direction, Direction::Reverse);
        assert!(matches!(child.state, SessionState::Udp(UdpState::Transmitting(_))));

        let sent = engine.transport().sent_to(peer);
        assert_eq!(sent.len(), 1);
        // the reverse sender uses its own socket
        assert_ne!(sent[0].from, addr("192.168.1.1:5001"));

        // one second plus the ending margin
        for _ in 0..1600 {
            advance(&mut engine, 1);
            engine.poll_udp_pacing();
        }
        assert!(!engine.contains(child.id));
        assert_eq!(only_report(&collector, child.id).termination, Termination::DoneServerTx);
    }
}

mod udp_client {
    use super::*;

    fn run_pacing(engine: &mut Engine<MockTransport>, id: SessionId, max_ms: u64) {
        for _ in 0..max_ms {
            if !engine.contains(id) {
                return;
            }
            advance(engine, 1);
            engine.poll_udp_pacing();
        }
    }

    fn ids(sent: &[&Sent]) -> Vec<i32> {
        sent.iter()
            .map(|s| DatagramHeader::from_bytes(&s.data).unwrap().id)
            .collect()
    }

    #[test]
    fn test_sender_gives_up_after_the_ending_margin() {
        let collector = ReportCollector::new();
        let mut engine = engine();
        let server = addr("10.0.0.1:5001");
        let id = engine
            .start_udp_client(
                UdpClientParams::new(server, Amount::Time(100)),
                Some(collector.forwarding_to(None)),
            )
            .unwrap();
        run_pacing(&mut engine, id, 3000);

        let report = only_report(&collector, id);
        assert_eq!(report.termination, Termination::DoneClientTx);
        assert!(report.duration_ms > 1500);
        assert!(report.duration_ms < 1600);
        assert!(report.udp.is_none());

        let sent = engine.transport().sent_to(server);
        let ids = ids(&sent);
        assert_eq!(ids[0], 0);
        assert!(ids[1] > 0);
        assert!(*ids.last().unwrap() < 0);
        assert!(sent.iter().all(|s| s.data.len() == 1470));
    }

    #[test]
    fn test_sender_stops_after_server_report() {
        let collector = ReportCollector::new();
        let mut engine = engine();
        let server = addr("10.0.0.1:5001");
        let id = engine
            .start_udp_client(
                UdpClientParams::new(server, Amount::Time(100)),
                Some(collector.forwarding_to(None)),
            )
            .unwrap();
        run_pacing(&mut engine, id, 1100);
        assert!(engine.contains(id));

        let terminal = engine.transport().sent.last().unwrap().data.clone();
        assert!(DatagramHeader::from_bytes(&terminal).unwrap().is_terminal());
        let mut rx = UdpRxStats::new();
        rx.datagrams = 90;
        rx.lost = 2;
        let reply = build_report_datagram(&terminal, &UdpReport::new(123_456, 1000, &rx));
        engine.on_udp_recv(id, &reply, server);
        assert_eq!(engine.session(id).unwrap().report_count, 1);

        run_pacing(&mut engine, id, 100);
        let report = only_report(&collector, id);
        assert_eq!(report.termination, Termination::DoneClientTx);
        assert_eq!(report.bytes_transferred, 123_456);
        let stats = report.udp.unwrap();
        assert_eq!(stats.datagrams, 90);
        assert_eq!(stats.lost, 2);
    }

    #[test]
    fn test_byte_limited_sender() {
        let collector = ReportCollector::new();
        let mut engine = engine();
        let server = addr("10.0.0.1:5001");
        let params = UdpClientParams {
            rate: 10_000_000,
            ..UdpClientParams::new(server, Amount::Bytes(14_700))
        };
        let id = engine
            .start_udp_client(params, Some(collector.forwarding_to(None)))
            .unwrap();
        let settings = engine.session(id).unwrap().settings.unwrap();
        assert_eq!(settings.win_band, 10_000_000);
        run_pacing(&mut engine, id, 5000);

        let report = only_report(&collector, id);
        assert_eq!(report.termination, Termination::DoneClientTx);
        assert!(report.bytes_transferred >= 14_700 + 4096);
        // extended settings travel with the 60 byte form
        let first = &engine.transport().sent_to(server)[0].data;
        let parsed = Settings::from_bytes(&first[DatagramHeader::SIZE..]).unwrap();
        assert_eq!(parsed.extended.map(|e| e.rate), Some(10_000_000));
    }

    #[test]
    fn test_reverse_client_sends_handshake_and_receives() {
        let collector = ReportCollector::new();
        let mut engine = engine();
        let server = addr("10.0.0.1:5001");
        let params = UdpClientParams {
            mode: TestMode::Reverse,
            ..UdpClientParams::new(server, Amount::Time(100))
        };
        let id = engine
            .start_udp_client(params, Some(collector.forwarding_to(None)))
            .unwrap();
        assert_eq!(engine.transport().sent_to(server).len(), 1);
        assert_eq!(engine.session(id).unwrap().state, SessionState::Udp(UdpState::Receiving));
        let handshake = engine.transport().sent[0].data.clone();
        let settings = Settings::from_bytes(&handshake[DatagramHeader::SIZE..]).unwrap();
        assert!(settings.reverse_requested());

        // the handshake itself is not counted
        run_pacing(&mut engine, id, 50);
        assert_eq!(engine.transport().sent_to(server).len(), 1);
        assert_eq!(engine.session(id).unwrap().bytes, 0);

        let sender = addr("10.0.0.1:40001");
        for seq in 0..3 {
            let now = engine.transport().now;
            engine.on_udp_recv(id, &datagram(seq, now, &settings), sender);
        }
        let now = engine.transport().now;
        engine.on_udp_recv(id, &datagram(-3, now, &settings), sender);

        let report = only_report(&collector, id);
        assert_eq!(report.termination, Termination::DoneClientRx);
        assert_eq!(report.bytes_transferred, 3 * 1470);
        assert_eq!(report.udp.unwrap().datagrams, 3);
    }

    #[test]
    fn test_dual_client_starts_temporary_server() {
        let collector = ReportCollector::new();
        let mut engine = engine();
        let server = addr("10.0.0.1:5001");
        let params = UdpClientParams {
            mode: TestMode::Dual,
            ..UdpClientParams::new(server, Amount::Time(100))
        };
        let id = engine
            .start_udp_client(params, Some(collector.forwarding_to(None)))
            .unwrap();
        assert_eq!(engine.session_count(), 2);
        let temp = engine
            .sessions()
            .into_iter()
            .find(|s| s.temporary)
            .expect("temporary server");
        assert_eq!(temp.master, Some(id));
        let settings = engine.session(id).unwrap().settings.unwrap();
        assert!(settings.flags.wants_return_now());
        assert_ne!(settings.remote_port, 0);

        run_pacing(&mut engine, id, 3000);
        assert!(!engine.contains(id));
        let temp_info = engine.session(temp.id).unwrap();
        assert_eq!(temp_info.master, None);
        assert_eq!(temp_info.deallocated_master, Some(id));
        assert!(engine.has_related(id));

        // the temporary server must not request yet another return test
        let mut back = settings;
        back.remote_port = 7000;
        let from = addr("10.0.0.1:40100");
        let now = engine.transport().now;
        engine.on_udp_recv(temp.id, &datagram(0, now, &back), from);
        assert_eq!(engine.session_count(), 2);
        let child = engine
            .sessions()
            .into_iter()
            .find(|s| s.master == Some(temp.id))
            .expect("return receiver");
        assert!(!child.settings.unwrap().flags.answer_test);

        let now = engine.transport().now;
        engine.on_udp_recv(temp.id, &datagram(-1, now, &back), from);
        advance(&mut engine, 10);
        engine.poll_udp_pacing();
        assert!(engine.is_idle());
        assert!(!engine.has_related(id));

        // the temporary server closes without a report of its own
        assert!(collector.for_session(temp.id).is_empty());
        assert_eq!(only_report(&collector, child.id).termination, Termination::DoneServerRx);

        // aborting a finished client is harmless
        engine.abort(id);
    }

    #[test]
    fn test_bind_failure_leaves_nothing_registered() {
        let mut engine = engine();
        engine.transport_mut().fail_bind = true;
        let params = UdpClientParams {
            mode: TestMode::Dual,
            ..UdpClientParams::new(addr("10.0.0.1:5001"), Amount::Time(100))
        };
        assert!(engine.start_udp_client(params, None).is_err());
        assert!(engine.is_idle());
    }

    #[test]
    fn test_multicast_server_joins_and_leaves() {
        let mut engine = engine();
        let group: IpAddr = "239.1.1.1".parse().unwrap();
        let server = engine
            .start_udp_server(SocketAddr::new(group, 5001), None)
            .unwrap();
        assert_eq!(engine.transport().joined, vec![group]);
        engine.abort(server);
        assert!(engine.transport().joined.is_empty());
    }
}
