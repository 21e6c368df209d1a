//! Runs an [`Engine`] on tokio.

use crate::config::EngineConfig;
use crate::engine::Engine;
use crate::net::{NetEvent, TokioTransport};
use log::debug;
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Owns an engine and the event stream of its transport.
///
/// # Examples
///
/// ```no_run
/// use rperf2::host::Host;
/// use rperf2::EngineConfig;
/// use tokio_util::sync::CancellationToken;
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let mut host = Host::new(EngineConfig::default());
/// let server = host
///     .engine_mut()
///     .start_tcp_server("0.0.0.0:5001".parse()?, None)?;
///
/// let cancel = CancellationToken::new();
/// host.run_until(&cancel, |engine| !engine.contains(server)).await;
/// # Ok(())
/// # }
/// ```
pub struct Host {
    engine: Engine<TokioTransport>,
    events: UnboundedReceiver<NetEvent>,
}

impl Host {
    /// Must be called inside a tokio runtime.
    pub fn new(config: EngineConfig) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            engine: Engine::with_config(TokioTransport::new(tx), config),
            events: rx,
        }
    }

    pub fn engine(&self) -> &Engine<TokioTransport> {
        &self.engine
    }

    pub fn engine_mut(&mut self) -> &mut Engine<TokioTransport> {
        &mut self.engine
    }

    /// Feeds one transport event into the engine.
    pub fn dispatch(&mut self, event: NetEvent) {
        match event {
            NetEvent::TcpConnected { key, result } => match result {
                Ok(stream) => {
                    if let Some(owner) = self.engine.transport_mut().complete_connect(key, stream) {
                        self.engine.on_tcp_connected(owner, Ok(()));
                    }
                }
                Err(e) => {
                    if let Some(owner) = self.engine.transport_mut().forget_stream(key) {
                        self.engine.on_tcp_connected(owner, Err(e));
                    }
                }
            },
            NetEvent::TcpAccepted { key, stream } => {
                let Some(listener) = self.engine.transport().listener_owner(key) else {
                    return;
                };
                let handle = self.engine.transport_mut().adopt_stream(stream);
                if let Err(e) = self.engine.on_tcp_accept(listener, handle) {
                    debug!("connection on {} not accepted: {}", listener, e);
                }
            }
            NetEvent::TcpData { key, data } => {
                if let Some(owner) = self.engine.transport().stream_owner(key) {
                    self.engine.on_tcp_recv(owner, Some(&data));
                }
            }
            NetEvent::TcpClosed { key } => {
                if let Some(owner) = self.engine.transport().stream_owner(key) {
                    self.engine.on_tcp_recv(owner, None);
                }
            }
            NetEvent::TcpWritable { key } => {
                if let Some(owner) = self.engine.transport_mut().flush_pending(key) {
                    self.engine.on_tcp_sent(owner);
                }
            }
            NetEvent::TcpError { key, error } => {
                // the report still reads the stream's addresses
                if let Some(owner) = self.engine.transport().stream_owner(key) {
                    self.engine.on_tcp_error(owner, error);
                }
                self.engine.transport_mut().forget_stream(key);
            }
            NetEvent::UdpDatagram { key, data, from } => {
                if let Some(owner) = self.engine.transport().udp_owner(key) {
                    self.engine.on_udp_recv(owner, &data, from);
                }
            }
        }
    }

    /// Drives the engine until `done` holds or `cancel` fires. Returns
    /// whether `done` was reached.
    pub async fn run_until<F>(&mut self, cancel: &CancellationToken, mut done: F) -> bool
    where
        F: FnMut(&Engine<TokioTransport>) -> bool,
    {
        let mut pacing = time::interval(self.engine.config().pacing_interval);
        pacing.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut tcp_poll = time::interval(self.engine.config().tcp_poll_interval);
        tcp_poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick of an interval fires at once.
        tcp_poll.tick().await;

        loop {
            if done(&self.engine) {
                return true;
            }
            tokio::select! {
                _ = cancel.cancelled() => return false,
                Some(event) = self.events.recv() => self.dispatch(event),
                _ = pacing.tick() => self.engine.poll_udp_pacing(),
                _ = tcp_poll.tick() => self.engine.poll_tcp(),
            }
        }
    }

    /// Drives the engine until `cancel` fires.
    pub async fn run(&mut self, cancel: &CancellationToken) {
        self.run_until(cancel, |_| false).await;
    }
}
