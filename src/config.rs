use crate::protocol::{Amount, DEFAULT_PORT, DEFAULT_UDP_RATE};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;
use std::time::Duration;

/// Transport protocol type for network testing.
///
/// # Examples
///
/// ```
/// use rperf2::{Config, Protocol};
///
/// let tcp_config = Config::client("127.0.0.1".to_string(), 5001)
///     .with_protocol(Protocol::Tcp);
///
/// let udp_config = Config::client("127.0.0.1".to_string(), 5001)
///     .with_protocol(Protocol::Udp)
///     .with_bandwidth(10_000_000); // 10 Mbps
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Protocol {
    /// Transmission Control Protocol - provides reliable, ordered delivery
    Tcp,
    /// User Datagram Protocol - paced, loss and jitter are measured
    Udp,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Tcp => f.write_str("TCP"),
            Protocol::Udp => f.write_str("UDP"),
        }
    }
}

/// Test mode: client or server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Mode {
    /// Server mode - listens for incoming tests
    Server,
    /// Client mode - starts a test against a server
    Client,
}

/// Which way data flows in a client-initiated test.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum TestMode {
    /// Client sends, server receives.
    #[default]
    Send,
    /// Server sends, client receives.
    Reverse,
    /// Both sides send at the same time over two sessions.
    Dual,
    /// Client sends first, then the server sends back.
    Tradeoff,
}

impl FromStr for TestMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "send" | "client" => Ok(TestMode::Send),
            "reverse" | "receive" => Ok(TestMode::Reverse),
            "dual" => Ok(TestMode::Dual),
            "tradeoff" => Ok(TestMode::Tradeoff),
            other => Err(Error::Config(format!("unknown test mode '{}'", other))),
        }
    }
}

impl fmt::Display for TestMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TestMode::Send => "send",
            TestMode::Reverse => "reverse",
            TestMode::Dual => "dual",
            TestMode::Tradeoff => "tradeoff",
        };
        f.write_str(name)
    }
}

/// Engine tunables.
///
/// The defaults match what iperf2 peers expect; tests shorten the host
/// intervals.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Consecutive TCP polls without traffic before a session is dropped.
    pub max_idle_polls: u32,
    /// Granularity of the pacing clock in microseconds.
    pub clock_resolution_us: u32,
    /// Upper bound on simultaneously registered sessions.
    pub max_sessions: usize,
    /// TCP senders repeat the settings header at the start of every block.
    pub block_size: u64,
    /// Port the dual/tradeoff TCP listener is opened on.
    pub dual_port: u16,
    /// Delay before a UDP report is sent the second time.
    pub report_retry_delay: Duration,
    /// A time-limited UDP sender keeps sending terminal datagrams this long
    /// past its target while no report arrives.
    pub udp_time_margin: Duration,
    /// Same as `udp_time_margin` for byte-limited senders.
    pub udp_byte_margin: u64,
    /// How often the host runs the UDP pacing poll.
    pub pacing_interval: Duration,
    /// How often the host polls TCP sessions for idleness.
    pub tcp_poll_interval: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_idle_polls: 10,
            clock_resolution_us: 1000,
            max_sessions: 1024,
            block_size: 128 * 1024,
            dual_port: DEFAULT_PORT,
            report_retry_delay: Duration::from_millis(10),
            udp_time_margin: Duration::from_millis(500),
            udp_byte_margin: 4096,
            pacing_interval: Duration::from_millis(1),
            tcp_poll_interval: Duration::from_secs(1),
        }
    }
}

/// Configuration for rperf2 tests.
///
/// Use the builder methods to customize the configuration.
///
/// # Examples
///
/// ## Time-limited TCP client
///
/// ```
/// use rperf2::Config;
/// use std::time::Duration;
///
/// let config = Config::client("192.168.1.100".to_string(), 5001)
///     .with_duration(Duration::from_secs(30));
/// ```
///
/// ## Byte-limited UDP client
///
/// ```
/// use rperf2::{Config, Protocol};
///
/// let config = Config::client("192.168.1.100".to_string(), 5001)
///     .with_protocol(Protocol::Udp)
///     .with_bandwidth(5_000_000)
///     .with_bytes(10 * 1024 * 1024);
/// ```
///
/// ## Dual test
///
/// ```
/// use rperf2::{Config, TestMode};
///
/// let config = Config::client("192.168.1.100".to_string(), 5001)
///     .with_test_mode(TestMode::Dual);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Server mode or client mode
    pub mode: Mode,

    /// Protocol to use (TCP or UDP)
    pub protocol: Protocol,

    /// Port to listen on or connect to
    pub port: u16,

    /// Server address (for client mode)
    pub server_addr: Option<String>,

    /// Local address to bind
    pub bind_addr: Option<IpAddr>,

    /// Direction of the test (client mode)
    pub test_mode: TestMode,

    /// How long the test runs
    pub amount: Amount,

    /// Bytes per write or per datagram; 0 picks the protocol default
    pub buffer_len: u32,

    /// UDP target rate in bits per second
    pub bandwidth: u32,

    /// IP type-of-service byte for client traffic; 0 leaves it alone
    pub tos: u8,

    /// Output in JSON format
    pub json: bool,

    /// Client gives up on a test still running after this long
    pub timeout: Option<Duration>,

    pub engine: EngineConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mode: Mode::Client,
            protocol: Protocol::Tcp,
            port: DEFAULT_PORT,
            server_addr: None,
            bind_addr: None,
            test_mode: TestMode::Send,
            amount: Amount::Time(1000),
            buffer_len: 0,
            bandwidth: DEFAULT_UDP_RATE,
            tos: 0,
            json: false,
            timeout: None,
            engine: EngineConfig::default(),
        }
    }
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a new server configuration listening on `port`.
    ///
    /// # Examples
    ///
    /// ```
    /// use rperf2::Config;
    ///
    /// let config = Config::server(5001);
    /// ```
    pub fn server(port: u16) -> Self {
        Self {
            mode: Mode::Server,
            port,
            ..Default::default()
        }
    }

    /// Creates a new client configuration for the server at `server_addr:port`.
    ///
    /// # Examples
    ///
    /// ```
    /// use rperf2::Config;
    ///
    /// let config = Config::client("192.168.1.100".to_string(), 5001);
    /// assert_eq!(config.port, 5001);
    /// ```
    pub fn client(server_addr: String, port: u16) -> Self {
        Self {
            mode: Mode::Client,
            server_addr: Some(server_addr),
            port,
            ..Default::default()
        }
    }

    pub fn with_protocol(mut self, protocol: Protocol) -> Self {
        self.protocol = protocol;
        self
    }

    pub fn with_test_mode(mut self, test_mode: TestMode) -> Self {
        self.test_mode = test_mode;
        self
    }

    pub fn with_amount(mut self, amount: Amount) -> Self {
        self.amount = amount;
        self
    }

    /// Runs the test for `duration` (hundredth-of-a-second granularity).
    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.amount = Amount::from_duration(duration);
        self
    }

    /// Runs the test until `bytes` have been transferred.
    pub fn with_bytes(mut self, bytes: u64) -> Self {
        self.amount = Amount::bytes(bytes);
        self
    }

    pub fn with_buffer_len(mut self, buffer_len: u32) -> Self {
        self.buffer_len = buffer_len;
        self
    }

    /// Sets the UDP target rate in bits per second.
    pub fn with_bandwidth(mut self, bandwidth: u32) -> Self {
        self.bandwidth = bandwidth;
        self
    }

    pub fn with_bind_addr(mut self, bind_addr: IpAddr) -> Self {
        self.bind_addr = Some(bind_addr);
        self
    }

    pub fn with_tos(mut self, tos: u8) -> Self {
        self.tos = tos;
        self
    }

    pub fn with_json(mut self, json: bool) -> Self {
        self.json = json;
        self
    }

    /// Aborts the test if it has not finished after `timeout`.
    ///
    /// Without one, a client whose reverse handshake or return connection
    /// never arrives waits until it is cancelled.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_engine_config(mut self, engine: EngineConfig) -> Self {
        self.engine = engine;
        self
    }

    /// Checks the combination of options before a test is started.
    pub fn validate(&self) -> Result<()> {
        if self.mode == Mode::Client && self.server_addr.is_none() {
            return Err(Error::Config("client mode needs a server address".to_string()));
        }
        if self.mode == Mode::Client && self.amount == Amount::Time(0) {
            return Err(Error::Config(
                "test duration must be at least 10 ms".to_string(),
            ));
        }
        if self.protocol == Protocol::Udp && self.bandwidth == 0 {
            return Err(Error::Config("UDP bandwidth must be positive".to_string()));
        }
        if self.engine.clock_resolution_us == 0 {
            return Err(Error::Config("clock resolution must be positive".to_string()));
        }
        if self.engine.pacing_interval.is_zero() || self.engine.tcp_poll_interval.is_zero() {
            return Err(Error::Config("poll intervals must be positive".to_string()));
        }
        Ok(())
    }
}
