//! iperf2 UDP datagram header and server report.
//!
//! Every UDP test datagram starts with a small header carrying a sequence id
//! and the send time. The receiver uses the ids for loss and reordering
//! detection and the timestamps for jitter.
//!
//! # Packet Format
//!
//! ```text
//! ┌──────────────┬──────────────┬──────────────┬──────────────┬──────────────────────┐
//! │      id      │    tv_sec    │   tv_usec    │     id2      │ settings + payload   │
//! │   (4 bytes)  │  (4 bytes)   │  (4 bytes)   │  (4 bytes)   │     (variable)       │
//! └──────────────┴──────────────┴──────────────┴──────────────┴──────────────────────┘
//! ```
//!
//! A negative id marks the end of the test. The receiver answers those with a
//! datagram whose header is followed by a [`UdpReport`].

use crate::measurements::UdpRxStats;
use crate::protocol::{read_i32, read_u32, REPORT_FLAGS};
use crate::{Error, Result};
use std::time::Duration;

/// Per-datagram header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DatagramHeader {
    /// Sequence id; negative on the final datagrams of a test.
    pub id: i32,
    pub tv_sec: u32,
    pub tv_usec: u32,
    /// Upper sequence bits for 64-bit sequence numbers; always 0 here.
    pub id2: i32,
}

impl DatagramHeader {
    /// Size of the header in bytes
    pub const SIZE: usize = 16;

    /// Header stamped with `timestamp`.
    pub fn new(id: i32, timestamp: Duration) -> Self {
        Self {
            id,
            tv_sec: timestamp.as_secs() as u32,
            tv_usec: timestamp.subsec_micros(),
            id2: 0,
        }
    }

    /// Send time in microseconds.
    pub fn timestamp_us(&self) -> u64 {
        self.tv_sec as u64 * 1_000_000 + self.tv_usec as u64
    }

    pub fn is_terminal(&self) -> bool {
        self.id < 0
    }

    /// Serializes the header to bytes (big-endian)
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut bytes = [0u8; Self::SIZE];
        bytes[0..4].copy_from_slice(&self.id.to_be_bytes());
        bytes[4..8].copy_from_slice(&self.tv_sec.to_be_bytes());
        bytes[8..12].copy_from_slice(&self.tv_usec.to_be_bytes());
        bytes[12..16].copy_from_slice(&self.id2.to_be_bytes());
        bytes
    }

    /// Deserializes a header from the start of a datagram.
    ///
    /// Returns `None` when the datagram is shorter than the header.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < Self::SIZE {
            return None;
        }

        Some(Self {
            id: read_i32(bytes, 0),
            tv_sec: read_u32(bytes, 4),
            tv_usec: read_u32(bytes, 8),
            id2: read_i32(bytes, 12),
        })
    }
}

/// Statistics a UDP receiver sends back to the transmitter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UdpReport {
    pub flags: u32,
    pub total_len1: u32,
    pub total_len2: u32,
    pub stop_sec: u32,
    pub stop_usec: u32,
    pub error_cnt: u32,
    pub outorder_cnt: u32,
    pub datagrams: u32,
    /// Whole seconds of jitter.
    pub jitter1: u32,
    /// Remaining jitter in milliseconds.
    pub jitter2: u32,
}

impl UdpReport {
    pub const SIZE: usize = 40;

    /// Builds the report for a receiver that got `bytes` in `duration_ms`.
    pub fn new(bytes: u64, duration_ms: u64, stats: &UdpRxStats) -> Self {
        let jitter = stats.jitter_us.max(0) as u64;
        Self {
            flags: REPORT_FLAGS,
            total_len1: (bytes >> 32) as u32,
            total_len2: bytes as u32,
            stop_sec: (duration_ms / 1000) as u32,
            stop_usec: ((duration_ms % 1000) * 1000) as u32,
            error_cnt: stats.lost,
            outorder_cnt: stats.out_of_order,
            datagrams: stats.datagrams,
            jitter1: (jitter / 1_000_000) as u32,
            jitter2: ((jitter % 1_000_000) / 1000) as u32,
        }
    }

    pub fn total_bytes(&self) -> u64 {
        ((self.total_len1 as u64) << 32) | self.total_len2 as u64
    }

    pub fn jitter_ms(&self) -> f64 {
        self.jitter1 as f64 * 1000.0 + self.jitter2 as f64
    }

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let words = [
            self.flags,
            self.total_len1,
            self.total_len2,
            self.stop_sec,
            self.stop_usec,
            self.error_cnt,
            self.outorder_cnt,
            self.datagrams,
            self.jitter1,
            self.jitter2,
        ];
        let mut bytes = [0u8; Self::SIZE];
        for (i, word) in words.iter().enumerate() {
            bytes[i * 4..i * 4 + 4].copy_from_slice(&word.to_be_bytes());
        }
        bytes
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < Self::SIZE {
            return Err(Error::Protocol(format!(
                "report needs {} bytes, got {}",
                Self::SIZE,
                bytes.len()
            )));
        }
        Ok(Self {
            flags: read_u32(bytes, 0),
            total_len1: read_u32(bytes, 4),
            total_len2: read_u32(bytes, 8),
            stop_sec: read_u32(bytes, 12),
            stop_usec: read_u32(bytes, 16),
            error_cnt: read_u32(bytes, 20),
            outorder_cnt: read_u32(bytes, 24),
            datagrams: read_u32(bytes, 28),
            jitter1: read_u32(bytes, 32),
            jitter2: read_u32(bytes, 36),
        })
    }
}

/// Builds the reply to a terminal datagram.
///
/// The reply keeps the received datagram's length and id, with the report
/// written right after the header.
pub fn build_report_datagram(received: &[u8], report: &UdpReport) -> Vec<u8> {
    let min_len = DatagramHeader::SIZE + UdpReport::SIZE;
    let mut datagram = received.to_vec();
    if datagram.len() < min_len {
        datagram.resize(min_len, 0);
    }
    datagram[DatagramHeader::SIZE..min_len].copy_from_slice(&report.to_bytes());
    datagram
}

/// Extracts the report from a reply datagram.
pub fn parse_report_datagram(datagram: &[u8]) -> Result<UdpReport> {
    if datagram.len() < DatagramHeader::SIZE {
        return Err(Error::Protocol("report datagram too short".to_string()));
    }
    UdpReport::from_bytes(&datagram[DatagramHeader::SIZE..])
}
