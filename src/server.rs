use crate::config::{Config, Mode, Protocol};
use crate::host::Host;
use crate::measurements::ReportCollector;
use crate::report::{Report, ReportCallback, ReportRef};
use crate::{Error, Result};
use log::info;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// iperf2-compatible test server.
///
/// The server listens on one port and answers every test a client starts:
/// plain receive tests, reverse tests where it sends back on the same
/// connection, and dual or tradeoff tests where it opens a return session
/// to the client.
///
/// # Examples
///
/// ## Basic TCP Server
///
/// ```no_run
/// use rperf2::{Server, Config};
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let config = Config::server(5001);
/// let server = Server::new(config);
///
/// println!("Starting server on port 5001...");
/// server.run().await?;
/// # Ok(())
/// # }
/// ```
///
/// ## UDP Server printing every report
///
/// ```no_run
/// use rperf2::{Server, Config, Protocol, Report};
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let config = Config::server(5001).with_protocol(Protocol::Udp);
///
/// let server = Server::new(config).with_callback(|report: Report| {
///     println!("{}: {} kbit/s", report.termination, report.bandwidth_kbitpsec);
/// });
/// server.run().await?;
/// # Ok(())
/// # }
/// ```
pub struct Server {
    config: Config,
    reports: ReportCollector,
    callback: Option<ReportRef>,
    cancellation_token: CancellationToken,
}

impl Server {
    /// Creates a new server with the given configuration.
    ///
    /// # Examples
    ///
    /// ```
    /// use rperf2::{Server, Config};
    ///
    /// let server = Server::new(Config::server(5001));
    /// ```
    pub fn new(config: Config) -> Self {
        Self {
            config,
            reports: ReportCollector::new(),
            callback: None,
            cancellation_token: CancellationToken::new(),
        }
    }

    /// Attaches a callback invoked with the report of every finished session.
    pub fn with_callback<C: ReportCallback + 'static>(mut self, callback: C) -> Self {
        self.callback = Some(Arc::new(callback));
        self
    }

    /// Token that stops [`Server::run`] when cancelled.
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancellation_token
    }

    /// Address the server listens on.
    pub fn local_addr(&self) -> SocketAddr {
        let ip = self
            .config
            .bind_addr
            .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
        SocketAddr::new(ip, self.config.port)
    }

    /// Listens and serves tests until the cancellation token fires.
    ///
    /// Sessions still running at that point are aborted and reported.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or the port cannot
    /// be bound.
    pub async fn run(&self) -> Result<()> {
        if self.config.mode != Mode::Server {
            return Err(Error::Config("server needs a server configuration".to_string()));
        }
        self.config.validate()?;

        let local = self.local_addr();
        let report = self.reports.forwarding_to(self.callback.clone());
        let mut host = Host::new(self.config.engine.clone());
        let listener = match self.config.protocol {
            Protocol::Tcp => host.engine_mut().start_tcp_server(local, Some(report))?,
            Protocol::Udp => host.engine_mut().start_udp_server(local, Some(report))?,
        };
        info!("rperf2 {} server listening on {}", self.config.protocol, local);

        host.run_until(&self.cancellation_token, |engine| !engine.contains(listener))
            .await;
        host.engine_mut().abort_all();
        info!("rperf2 server on {} stopped", local);
        Ok(())
    }

    /// Reports of every session finished so far.
    pub fn reports(&self) -> Vec<Report> {
        self.reports.reports()
    }
}
