//! End-of-session reports.
//!
//! Every session produces exactly one [`Report`] when it closes, unless it is
//! closed silently (a dual-test helper that did its job). Reports are handed
//! to a [`ReportCallback`] registered when the session was started.

use crate::config::Protocol;
use crate::measurements::UdpRxStats;
use crate::registry::SessionId;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

/// Why a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Termination {
    /// The server received a complete test.
    DoneServerRx,
    /// The server sent a complete test (reverse or dual).
    DoneServerTx,
    /// The client sent a complete test.
    DoneClientTx,
    /// The client received a complete test (reverse).
    DoneClientRx,
    /// Aborted locally: idle timeout or explicit abort.
    AbortedLocal,
    /// The peer sent a short or malformed settings header.
    AbortedLocalDataError,
    /// Starting the return transfer failed.
    AbortedLocalTxError,
    /// The transport reported an error or the connection failed.
    AbortedRemote,
}

impl Termination {
    pub fn is_done(&self) -> bool {
        matches!(
            self,
            Termination::DoneServerRx
                | Termination::DoneServerTx
                | Termination::DoneClientTx
                | Termination::DoneClientRx
        )
    }

    pub fn is_aborted(&self) -> bool {
        !self.is_done()
    }
}

impl fmt::Display for Termination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Termination::DoneServerRx => "server rx done",
            Termination::DoneServerTx => "server tx done",
            Termination::DoneClientTx => "client tx done",
            Termination::DoneClientRx => "client rx done",
            Termination::AbortedLocal => "aborted locally",
            Termination::AbortedLocalDataError => "aborted: bad settings",
            Termination::AbortedLocalTxError => "aborted: tx start failed",
            Termination::AbortedRemote => "aborted by remote",
        };
        f.write_str(text)
    }
}

/// Final statistics of one session.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Report {
    pub session: SessionId,
    pub protocol: Protocol,
    pub termination: Termination,
    /// Best effort; a UDP child without its own socket reports its server's address.
    pub local: Option<SocketAddr>,
    pub remote: Option<SocketAddr>,
    pub bytes_transferred: u64,
    pub duration_ms: u64,
    pub bandwidth_kbitpsec: u64,
    /// Receive statistics, for UDP sessions that received data.
    pub udp: Option<UdpRxStats>,
}

impl Report {
    pub fn duration(&self) -> Duration {
        Duration::from_millis(self.duration_ms)
    }

    pub fn bits_per_second(&self) -> f64 {
        self.bandwidth_kbitpsec as f64 * 1000.0
    }
}

/// `bytes * 8 / duration_ms`, i.e. kbit/s; zero for an empty duration.
pub fn bandwidth_kbitpsec(bytes: u64, duration_ms: u64) -> u64 {
    if duration_ms == 0 {
        0
    } else {
        bytes.saturating_mul(8) / duration_ms
    }
}

/// Receiver of session reports.
///
/// Implemented for any `Fn(Report) + Send + Sync` closure.
///
/// # Examples
///
/// ```
/// use rperf2::{Report, ReportCallback};
///
/// struct Printer;
///
/// impl ReportCallback for Printer {
///     fn on_report(&self, report: Report) {
///         println!("{}: {} bytes", report.termination, report.bytes_transferred);
///     }
/// }
/// ```
pub trait ReportCallback: Send + Sync {
    fn on_report(&self, report: Report);
}

impl<F> ReportCallback for F
where
    F: Fn(Report) + Send + Sync,
{
    fn on_report(&self, report: Report) {
        self(report)
    }
}

pub type ReportRef = Arc<dyn ReportCallback>;
