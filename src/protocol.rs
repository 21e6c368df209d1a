//! iperf2 test settings header.
//!
//! Every iperf2 test starts with the initiating side sending a settings header
//! that describes the test: how long to run, how large the buffers are and
//! whether the peer should send data back. TCP sends it as the first bytes of
//! the stream; UDP embeds it right after the datagram header of every packet.
//!
//! # Wire Format
//!
//! All words are big-endian.
//!
//! ```text
//! ┌─────────┬─────────────┬─────────────┬────────────┬──────────┬──────────┐
//! │  flags  │ num_threads │ remote_port │ buffer_len │ win_band │  amount  │  24 bytes
//! ├─────────┼─────────────┼─────────────┼────────────┼──────────┼──────────┤
//! │  type   │   length    │   eflags    │ version_u  │version_l │ reserved │
//! ├─────────┼─────────────┼─────────────┼────────────┴──────────┴──────────┘
//! │  rate   │ rate_units  │  real_time  │                                     +36 bytes
//! └─────────┴─────────────┴─────────────┘
//! ```
//!
//! The second part is only meaningful when the "extended settings" flag is
//! set. TCP always transmits the full 60 bytes.
//!
//! # Examples
//!
//! ```
//! use rperf2::protocol::{Amount, Settings};
//!
//! let settings = Settings::new(Amount::Time(100), 1470);
//! let bytes = settings.to_bytes();
//! assert_eq!(bytes.len(), 24);
//!
//! let parsed = Settings::from_bytes(&bytes).unwrap();
//! assert_eq!(parsed, settings);
//! ```

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Length of the base settings record.
pub const SETTINGS_LEN: usize = 24;

/// Length of the base record followed by the extended record.
pub const EXTENDED_SETTINGS_LEN: usize = 60;

/// Default iperf2 port.
pub const DEFAULT_PORT: u16 = 5001;

/// Rate a client assumes when none was negotiated (1 Mbit/s).
pub const DEFAULT_UDP_RATE: u32 = 1024 * 1024;

/// Largest datagram payload for IPv4 peers.
pub const DEFAULT_UDP_BUFFER_LEN_V4: u32 = 1470;

/// Largest datagram payload for IPv6 peers.
pub const DEFAULT_UDP_BUFFER_LEN_V6: u32 = 1450;

const FLAG_ANSWER_TEST: u32 = 0x8000_0000;
const FLAG_EXTEND: u32 = 0x4000_0000;
const FLAG_UDP_TEST: u32 = 0x2000_0000;
const FLAG_SEQNO64: u32 = 0x0800_0000;
const FLAG_VERSION2: u32 = 0x0400_0000;
const FLAG_ANSWER_NOW: u32 = 0x0000_0001;
const KNOWN_FLAGS: u32 =
    FLAG_ANSWER_TEST | FLAG_EXTEND | FLAG_UDP_TEST | FLAG_SEQNO64 | FLAG_VERSION2 | FLAG_ANSWER_NOW;

const EFLAG_UNITS_PPS: u32 = 0x0000_0001;
const EFLAG_REVERSE: u32 = 0x0400_0000;
const KNOWN_EFLAGS: u32 = EFLAG_UNITS_PPS | EFLAG_REVERSE;

const PAYLOAD_PATTERN: &[u8; 10] = b"0123456789";

/// Size of the constant transmit buffer.
///
/// Ten bytes longer than the largest chunk ever taken from it so that any
/// chunk can start at `offset % 10` and keep the digit sequence continuous.
pub const PAYLOAD_LEN: usize = 16 * 1024 + PAYLOAD_PATTERN.len();

const fn build_payload() -> [u8; PAYLOAD_LEN] {
    let mut buf = [0u8; PAYLOAD_LEN];
    let mut i = 0;
    while i < PAYLOAD_LEN {
        buf[i] = PAYLOAD_PATTERN[i % PAYLOAD_PATTERN.len()];
        i += 1;
    }
    buf
}

/// Repeating `"0123456789"` bytes used as test payload.
pub static PAYLOAD: [u8; PAYLOAD_LEN] = build_payload();

/// Returns `len` payload bytes that continue the digit pattern at stream
/// position `position`. `len` is capped to what the buffer can provide.
pub fn payload_at(position: u64, len: usize) -> &'static [u8] {
    let offset = (position % PAYLOAD_PATTERN.len() as u64) as usize;
    let len = len.min(PAYLOAD_LEN - PAYLOAD_PATTERN.len());
    &PAYLOAD[offset..offset + len]
}

/// How long a test runs.
///
/// On the wire this is one signed word: positive values are a byte count,
/// negative values are a duration in hundredths of a second. A zero word
/// reads back as `Bytes(0)`, so `Time(0)` does not survive the wire;
/// [`Config::validate`](crate::Config::validate) refuses it for clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Amount {
    /// Stop after this many bytes.
    Bytes(u32),
    /// Stop after this many hundredths of a second.
    Time(u32),
}

impl Amount {
    /// Byte target, clamped to what the signed wire word can carry.
    pub fn bytes(bytes: u64) -> Self {
        Amount::Bytes(bytes.min(i32::MAX as u64) as u32)
    }

    /// Time target with hundredth-of-a-second granularity.
    pub fn from_duration(duration: Duration) -> Self {
        let hundredths = (duration.as_millis() / 10).min(i32::MAX as u128) as u32;
        Amount::Time(hundredths)
    }

    pub fn from_wire(raw: u32) -> Self {
        if (raw as i32) < 0 {
            Amount::Time(0u32.wrapping_sub(raw))
        } else {
            Amount::Bytes(raw)
        }
    }

    pub fn to_wire(self) -> u32 {
        match self {
            Amount::Bytes(bytes) => bytes,
            Amount::Time(hundredths) => 0u32.wrapping_sub(hundredths),
        }
    }

    /// Whether a test that has run for `elapsed_ms` and moved `bytes` is done.
    pub fn is_reached(self, elapsed_ms: u64, bytes: u64) -> bool {
        match self {
            Amount::Bytes(target) => bytes >= target as u64,
            Amount::Time(hundredths) => elapsed_ms >= hundredths as u64 * 10,
        }
    }
}

/// Named view of the settings flag word.
///
/// The "extended settings follow" bit is not stored here: it is derived from
/// [`Settings::extended`]. Bits this implementation does not know about are
/// kept in `other` so they survive a decode/encode cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Flags {
    /// The peer should run a test back to us.
    pub answer_test: bool,
    /// Together with `answer_test`: run it simultaneously (dual test).
    pub answer_now: bool,
    pub udp_test: bool,
    pub seqno64: bool,
    pub version2: bool,
    pub other: u32,
}

impl Flags {
    pub fn from_bits(bits: u32) -> Self {
        Self {
            answer_test: bits & FLAG_ANSWER_TEST != 0,
            answer_now: bits & FLAG_ANSWER_NOW != 0,
            udp_test: bits & FLAG_UDP_TEST != 0,
            seqno64: bits & FLAG_SEQNO64 != 0,
            version2: bits & FLAG_VERSION2 != 0,
            other: bits & !KNOWN_FLAGS,
        }
    }

    /// Flag word without the extended bit.
    pub fn bits(&self) -> u32 {
        let mut bits = self.other & !KNOWN_FLAGS;
        if self.answer_test {
            bits |= FLAG_ANSWER_TEST;
        }
        if self.answer_now {
            bits |= FLAG_ANSWER_NOW;
        }
        if self.udp_test {
            bits |= FLAG_UDP_TEST;
        }
        if self.seqno64 {
            bits |= FLAG_SEQNO64;
        }
        if self.version2 {
            bits |= FLAG_VERSION2;
        }
        bits
    }

    /// True when the peer must start a return test once this one ends.
    pub fn wants_return_after(&self) -> bool {
        self.answer_test && !self.answer_now
    }

    /// True when the peer must start a return test right away.
    pub fn wants_return_now(&self) -> bool {
        self.answer_test && self.answer_now
    }
}

/// Report flag word with the answer bit set, as sent by UDP receivers.
pub const REPORT_FLAGS: u32 = FLAG_ANSWER_TEST;

/// Whether a report flag word carries the answer bit.
pub fn report_answers_test(flags: u32) -> bool {
    flags & FLAG_ANSWER_TEST != 0
}

/// Whether a report flag word announces an extended report.
pub fn report_is_extended(flags: u32) -> bool {
    flags & FLAG_EXTEND != 0
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExtendedFlags {
    /// The server sends and the client receives.
    pub reverse: bool,
    /// `rate` is packets per second rather than bits per second.
    pub units_pps: bool,
    pub other: u32,
}

impl ExtendedFlags {
    pub fn from_bits(bits: u32) -> Self {
        Self {
            reverse: bits & EFLAG_REVERSE != 0,
            units_pps: bits & EFLAG_UNITS_PPS != 0,
            other: bits & !KNOWN_EFLAGS,
        }
    }

    pub fn bits(&self) -> u32 {
        let mut bits = self.other & !KNOWN_EFLAGS;
        if self.reverse {
            bits |= EFLAG_REVERSE;
        }
        if self.units_pps {
            bits |= EFLAG_UNITS_PPS;
        }
        bits
    }
}

/// Optional second half of the settings header.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExtendedSettings {
    pub test_type: i32,
    pub length: i32,
    pub eflags: ExtendedFlags,
    pub version_major: i32,
    pub version_minor: i32,
    pub reserved: i32,
    pub rate: i32,
    pub rate_units: i32,
    pub real_time: i32,
}

/// Test settings exchanged at the start of every iperf2 session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Settings {
    pub flags: Flags,
    /// Always 1 for this implementation; the peer ignores it.
    pub num_threads: u32,
    /// Port the peer should connect back to for dual and tradeoff tests.
    pub remote_port: u32,
    pub buffer_len: u32,
    /// Window size for TCP, bandwidth for UDP.
    pub win_band: u32,
    pub amount: Amount,
    pub extended: Option<ExtendedSettings>,
}

impl Settings {
    /// Settings for a plain one-way test.
    pub fn new(amount: Amount, buffer_len: u32) -> Self {
        Self {
            flags: Flags::default(),
            num_threads: 1,
            remote_port: DEFAULT_PORT as u32,
            buffer_len,
            win_band: 0,
            amount,
            extended: None,
        }
    }

    /// Complete flag word as it goes on the wire.
    pub fn flag_bits(&self) -> u32 {
        let mut bits = self.flags.bits();
        if self.extended.is_some() {
            bits |= FLAG_EXTEND;
        }
        bits
    }

    /// Number of bytes [`Settings::to_bytes`] produces.
    pub fn wire_len(&self) -> usize {
        if self.extended.is_some() {
            EXTENDED_SETTINGS_LEN
        } else {
            SETTINGS_LEN
        }
    }

    pub fn reverse_requested(&self) -> bool {
        self.extended.map_or(false, |ext| ext.eflags.reverse)
    }

    /// Mutable access to the extended part, creating a zeroed one if absent.
    pub fn extended_mut(&mut self) -> &mut ExtendedSettings {
        self.extended.get_or_insert_with(ExtendedSettings::default)
    }

    /// Serializes the header; 24 bytes, or 60 when extended settings are present.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = vec![0u8; self.wire_len()];
        self.write_words(&mut bytes);
        bytes
    }

    /// Serializes the full 60-byte form used on TCP streams.
    ///
    /// The extended words are zero when no extended settings are present.
    pub fn to_stream_bytes(&self) -> [u8; EXTENDED_SETTINGS_LEN] {
        let mut bytes = [0u8; EXTENDED_SETTINGS_LEN];
        self.write_words(&mut bytes);
        bytes
    }

    fn write_words(&self, bytes: &mut [u8]) {
        let base = [
            self.flag_bits(),
            self.num_threads,
            self.remote_port,
            self.buffer_len,
            self.win_band,
            self.amount.to_wire(),
        ];
        for (i, word) in base.iter().enumerate() {
            bytes[i * 4..i * 4 + 4].copy_from_slice(&word.to_be_bytes());
        }

        if let Some(ext) = &self.extended {
            let words = [
                ext.test_type,
                ext.length,
                ext.eflags.bits() as i32,
                ext.version_major,
                ext.version_minor,
                ext.reserved,
                ext.rate,
                ext.rate_units,
                ext.real_time,
            ];
            for (i, word) in words.iter().enumerate() {
                let at = SETTINGS_LEN + i * 4;
                bytes[at..at + 4].copy_from_slice(&word.to_be_bytes());
            }
        }
    }

    /// Parses a settings header.
    ///
    /// Requires 24 bytes, or 60 when the flag word announces extended
    /// settings. Trailing bytes are ignored.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < SETTINGS_LEN {
            return Err(Error::Protocol(format!(
                "settings header needs {} bytes, got {}",
                SETTINGS_LEN,
                bytes.len()
            )));
        }

        let flag_bits = read_u32(bytes, 0);
        let extended = if flag_bits & FLAG_EXTEND != 0 {
            if bytes.len() < EXTENDED_SETTINGS_LEN {
                return Err(Error::Protocol(format!(
                    "extended settings header needs {} bytes, got {}",
                    EXTENDED_SETTINGS_LEN,
                    bytes.len()
                )));
            }
            Some(ExtendedSettings {
                test_type: read_i32(bytes, 24),
                length: read_i32(bytes, 28),
                eflags: ExtendedFlags::from_bits(read_u32(bytes, 32)),
                version_major: read_i32(bytes, 36),
                version_minor: read_i32(bytes, 40),
                reserved: read_i32(bytes, 44),
                rate: read_i32(bytes, 48),
                rate_units: read_i32(bytes, 52),
                real_time: read_i32(bytes, 56),
            })
        } else {
            None
        };

        Ok(Self {
            flags: Flags::from_bits(flag_bits),
            num_threads: read_u32(bytes, 4),
            remote_port: read_u32(bytes, 8),
            buffer_len: read_u32(bytes, 12),
            win_band: read_u32(bytes, 16),
            amount: Amount::from_wire(read_u32(bytes, 20)),
            extended,
        })
    }

    /// Parses the 60-byte form sent at the start of a TCP stream.
    pub fn from_stream_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < EXTENDED_SETTINGS_LEN {
            return Err(Error::Protocol(format!(
                "stream settings header needs {} bytes, got {}",
                EXTENDED_SETTINGS_LEN,
                bytes.len()
            )));
        }
        Self::from_bytes(&bytes[..EXTENDED_SETTINGS_LEN])
    }
}

pub(crate) fn read_u32(bytes: &[u8], at: usize) -> u32 {
    u32::from_be_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
}

pub(crate) fn read_i32(bytes: &[u8], at: usize) -> i32 {
    read_u32(bytes, at) as i32
}
