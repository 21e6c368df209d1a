//! rperf2 - an iperf2-compatible network throughput engine
//!
//! This library runs iperf2 tests over TCP and UDP and speaks the iperf2
//! wire format, so either end can be a stock iperf2.
//!
//! # Features
//!
//! - TCP and UDP, client and server
//! - Reverse, dual and tradeoff tests
//! - Paced UDP with loss, reordering and jitter measurement
//! - A sans-IO [`Engine`] that any [`Transport`] can drive
//! - A tokio host and `Server`/`Client` façades on top of it
//!
//! # Examples
//!
//! ```no_run
//! use rperf2::{Client, Config, Protocol};
//! use std::time::Duration;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = Config::client("192.168.1.10".to_string(), 5001)
//!     .with_protocol(Protocol::Udp)
//!     .with_bandwidth(10_000_000)
//!     .with_duration(Duration::from_secs(5));
//!
//! let client = Client::new(config)?;
//! client.run().await?;
//! for report in client.reports() {
//!     println!("{}: {} kbit/s", report.termination, report.bandwidth_kbitpsec);
//! }
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod config;
pub mod engine;
pub mod error;
pub mod host;
pub mod measurements;
pub mod net;
pub mod pacing;
pub mod protocol;
pub mod registry;
pub mod report;
pub mod server;
pub mod tcp;
pub mod transport;
pub mod udp;
pub mod udp_packet;

pub use client::Client;
pub use config::{Config, EngineConfig, Mode, Protocol, TestMode};
pub use engine::{Direction, Engine, Role, SessionInfo, SessionState};
pub use error::{Error, Result};
pub use measurements::{ReportCollector, UdpRxStats};
pub use protocol::{Amount, Settings};
pub use registry::SessionId;
pub use report::{Report, ReportCallback, ReportRef, Termination};
pub use server::Server;
pub use tcp::{TcpClientParams, TcpState};
pub use transport::{Chunk, Transport, WriteError};
pub use udp::{UdpClientParams, UdpState};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
