//! UDP transmit pacing.
//!
//! The host calls the pacing poll at a fixed tick. A [`Pacer`] turns a target
//! rate into "send `frames_per_delay` datagrams every `delay_us`" with the
//! delay truncated to the host clock resolution. When the rate is too high
//! for one datagram per tick, the delay is pinned to one tick and several
//! datagrams go out per tick instead.
//!
//! All arithmetic is integer; bandwidth accuracy is bounded by the tick.

use std::time::Duration;

/// Delay between final datagrams while a test is ending.
pub const ENDING_DELAY_US: u32 = 50_000;

/// Datagrams sent per ending interval, to make the terminal id hard to miss.
pub const ENDING_FRAMES: u32 = 10;

/// Transmit schedule and sequence counter of a UDP sender.
///
/// # Examples
///
/// ```
/// use rperf2::pacing::Pacer;
///
/// // 1470-byte datagrams at 1 Mbit/s with a 1 ms clock
/// let pacer = Pacer::new(1_000_000, false, 1470, 1000);
/// assert_eq!(pacer.delay_us, 11_000);
/// assert_eq!(pacer.frames_per_delay, 1);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pacer {
    /// Minimum time between send bursts.
    pub delay_us: u32,
    /// Datagrams per burst.
    pub frames_per_delay: u32,
    /// Id of the next datagram.
    pub seq: u32,
    last_send: Option<Duration>,
}

impl Pacer {
    /// Schedule for `rate` (bits/s, or packets/s when `units_pps`) with
    /// `buffer_len`-byte datagrams on a clock ticking every `resolution_us`.
    ///
    /// A zero rate falls back to 1 Mbit/s.
    pub fn new(rate: u32, units_pps: bool, buffer_len: u32, resolution_us: u32) -> Self {
        let resolution = resolution_us.max(1) as u64;
        let (rate, units_pps) = if rate == 0 {
            (crate::protocol::DEFAULT_UDP_RATE, false)
        } else {
            (rate, units_pps)
        };

        let ideal_us = if units_pps {
            1_000_000 / rate as u64
        } else {
            buffer_len as u64 * 8 * 1_000_000 / rate as u64
        };

        let truncated = ideal_us / resolution * resolution;
        let (delay_us, frames_per_delay) = if truncated == 0 {
            (resolution, resolution / ideal_us.max(1))
        } else {
            (truncated, 1)
        };

        Self {
            delay_us: delay_us.min(u32::MAX as u64) as u32,
            frames_per_delay: frames_per_delay.max(1) as u32,
            seq: 0,
            last_send: None,
        }
    }

    /// Whether enough time has passed since the previous burst.
    pub fn is_due(&self, now: Duration) -> bool {
        match self.last_send {
            None => true,
            Some(last) => now.saturating_sub(last).as_micros() >= self.delay_us as u128,
        }
    }

    pub fn mark_sent(&mut self, now: Duration) {
        self.last_send = Some(now);
    }

    pub fn last_send(&self) -> Option<Duration> {
        self.last_send
    }

    /// Switches to the short, repeated schedule used for terminal datagrams.
    pub fn enter_ending(&mut self) {
        self.delay_us = ENDING_DELAY_US;
        self.frames_per_delay = ENDING_FRAMES;
    }

    /// Sequence id for the next datagram; negated while ending.
    ///
    /// Ids saturate at `i32::MAX` rather than wrapping into the terminal
    /// range, and an ending id is never 0 so a test that ends before its
    /// first datagram still tells the server it is over.
    pub fn next_id(&self, ending: bool) -> i32 {
        let id = self.seq.min(i32::MAX as u32) as i32;
        if ending {
            -id.max(1)
        } else {
            id
        }
    }
}
