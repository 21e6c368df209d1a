use crate::config::{Config, Mode, Protocol};
use crate::host::Host;
use crate::measurements::ReportCollector;
use crate::report::{Report, ReportCallback, ReportRef};
use crate::tcp::{unspecified_like, TcpClientParams};
use crate::udp::UdpClientParams;
use crate::{Error, Result};
use log::{debug, info, warn};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::time;
use tokio_util::sync::CancellationToken;

/// iperf2-compatible test client.
///
/// Runs one test against a server and returns once every session of that
/// test (including the return sessions of dual and tradeoff tests) has
/// finished.
///
/// # Examples
///
/// ```no_run
/// use rperf2::{Client, Config, Report, TestMode};
/// use std::time::Duration;
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let config = Config::client("127.0.0.1".to_string(), 5001)
///     .with_duration(Duration::from_secs(10))
///     .with_test_mode(TestMode::Dual);
///
/// let client = Client::new(config)?.with_callback(|report: Report| {
///     println!(
///         "{} {}: {} bytes in {} ms",
///         report.protocol, report.termination, report.bytes_transferred, report.duration_ms
///     );
/// });
///
/// client.run().await?;
/// # Ok(())
/// # }
/// ```
pub struct Client {
    config: Config,
    reports: ReportCollector,
    callback: Option<ReportRef>,
    cancellation_token: CancellationToken,
}

impl Client {
    /// Creates a new client with the given configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration doesn't have a server address set.
    ///
    /// # Examples
    ///
    /// ```
    /// use rperf2::{Client, Config};
    ///
    /// let config = Config::client("127.0.0.1".to_string(), 5001);
    /// let client = Client::new(config).expect("Failed to create client");
    /// ```
    pub fn new(config: Config) -> Result<Self> {
        if config.mode != Mode::Client || config.server_addr.is_none() {
            return Err(Error::Config(
                "Server address is required for client mode".to_string(),
            ));
        }
        config.validate()?;

        Ok(Self {
            config,
            reports: ReportCollector::new(),
            callback: None,
            cancellation_token: CancellationToken::new(),
        })
    }

    /// Attaches a callback invoked with the report of every finished session.
    pub fn with_callback<C: ReportCallback + 'static>(mut self, callback: C) -> Self {
        self.callback = Some(Arc::new(callback));
        self
    }

    /// Token that aborts [`Client::run`] when cancelled.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use rperf2::{Client, Config};
    /// use std::time::Duration;
    ///
    /// # #[tokio::main]
    /// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
    /// let client = Client::new(Config::client("127.0.0.1".to_string(), 5001))?;
    ///
    /// let cancel_token = client.cancellation_token().clone();
    /// tokio::spawn(async move {
    ///     tokio::time::sleep(Duration::from_secs(5)).await;
    ///     cancel_token.cancel();
    /// });
    ///
    /// client.run().await?;
    /// # Ok(())
    /// # }
    /// ```
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancellation_token
    }

    /// Runs the configured test to completion.
    ///
    /// A cancelled test is aborted; its sessions are still reported.
    ///
    /// # Errors
    ///
    /// Returns an error if the server address does not resolve or the test
    /// cannot be started.
    pub async fn run(&self) -> Result<()> {
        let remote = self.resolve().await?;
        let report = self.reports.forwarding_to(self.callback.clone());
        let mut host = Host::new(self.config.engine.clone());

        let id = match self.config.protocol {
            Protocol::Tcp => {
                let params = TcpClientParams {
                    mode: self.config.test_mode,
                    buffer_len: self.config.buffer_len,
                    tos: self.config.tos,
                    ..TcpClientParams::new(remote, self.config.amount)
                };
                host.engine_mut().start_tcp_client(params, Some(report))?
            }
            Protocol::Udp => {
                let local_ip = self
                    .config
                    .bind_addr
                    .unwrap_or_else(|| unspecified_like(remote.ip()));
                let params = UdpClientParams {
                    local: SocketAddr::new(local_ip, 0),
                    mode: self.config.test_mode,
                    buffer_len: self.config.buffer_len,
                    rate: self.config.bandwidth,
                    tos: self.config.tos,
                    ..UdpClientParams::new(remote, self.config.amount)
                };
                host.engine_mut().start_udp_client(params, Some(report))?
            }
        };
        info!(
            "rperf2 {} client connecting to {} ({})",
            self.config.protocol, remote, self.config.test_mode
        );

        let run = host.run_until(&self.cancellation_token, |engine| !engine.has_related(id));
        let finished = match self.config.timeout {
            Some(limit) => time::timeout(limit, run).await.ok(),
            None => Some(run.await),
        };
        match finished {
            Some(true) => {}
            Some(false) => {
                warn!("test cancelled");
                host.engine_mut().abort(id);
            }
            None => {
                warn!(
                    "test not finished after {:?}, the server may never have answered",
                    self.config.timeout.unwrap_or_default()
                );
                host.engine_mut().abort(id);
            }
        }
        Ok(())
    }

    async fn resolve(&self) -> Result<SocketAddr> {
        let server = self
            .config
            .server_addr
            .as_deref()
            .ok_or_else(|| Error::Config("Server address not set".to_string()))?;
        let mut addrs = tokio::net::lookup_host((server, self.config.port)).await?;
        let addr = addrs
            .next()
            .ok_or_else(|| Error::Connection(format!("{} did not resolve", server)))?;
        debug!("{} resolved to {}", server, addr);
        Ok(addr)
    }

    /// Reports of every session of the test finished so far.
    pub fn reports(&self) -> Vec<Report> {
        self.reports.reports()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TestMode;
    use std::time::{Duration, Instant};

    #[test]
    fn test_requires_server_address() {
        assert!(Client::new(Config::server(5001)).is_err());
        assert!(Client::new(Config::new()).is_err());
        assert!(Client::new(Config::client("127.0.0.1".to_string(), 5001)).is_ok());
    }

    #[tokio::test]
    async fn test_resolve_literal_address() {
        let client = Client::new(Config::client("127.0.0.1".to_string(), 6001)).unwrap();
        assert_eq!(client.resolve().await.unwrap(), "127.0.0.1:6001".parse().unwrap());
    }

    #[tokio::test]
    async fn test_connection_refused_is_reported() {
        let probe = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = probe.local_addr().unwrap().port();
        drop(probe);

        let client = Client::new(Config::client("127.0.0.1".to_string(), port)).unwrap();
        client.run().await.unwrap();
        let reports = client.reports();
        assert_eq!(reports.len(), 1);
        assert!(reports[0].termination.is_aborted());
    }

    #[tokio::test]
    async fn test_timeout_gives_up_on_missing_return_test() {
        // answers nothing, so the reverse handshake goes unanswered
        let silent = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        let port = silent.local_addr().unwrap().port();

        let config = Config::client("127.0.0.1".to_string(), port)
            .with_protocol(Protocol::Udp)
            .with_test_mode(TestMode::Reverse)
            .with_duration(Duration::from_secs(1))
            .with_timeout(Duration::from_millis(300));
        let client = Client::new(config).unwrap();
        let started = Instant::now();
        client.run().await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(1));

        let reports = client.reports();
        assert!(!reports.is_empty());
        assert!(reports.iter().all(|r| r.termination.is_aborted()));
        drop(silent);
    }
}
