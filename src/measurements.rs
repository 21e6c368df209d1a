//! Receive statistics and report collection.

use crate::registry::SessionId;
use crate::report::{Report, ReportCallback, ReportRef, Termination};
use log::trace;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;

/// Loss, reordering and jitter seen by a UDP receiver.
///
/// Jitter follows RFC 1889: `J += (|D(i-1,i)| - J) / 16`, where `D` is the
/// change in transit time between consecutive datagrams.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct UdpRxStats {
    /// Id the next in-order datagram should carry.
    pub expected_id: u32,
    pub lost: u32,
    pub out_of_order: u32,
    pub datagrams: u32,
    /// Smoothed jitter in microseconds.
    pub jitter_us: i64,
    #[serde(skip)]
    pub last_transit_us: Option<i64>,
}

impl UdpRxStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accounts one data datagram with sequence `id`, sent at `sent_us` and
    /// received at `arrival_us`.
    ///
    /// An id ahead of the expected one counts the gap as lost plus one
    /// out-of-order event and resyncs. An id behind it is a late arrival:
    /// it was already counted as lost and is only tallied as received.
    pub fn record(&mut self, id: u32, sent_us: u64, arrival_us: u64) {
        self.datagrams = self.datagrams.wrapping_add(1);

        if id == self.expected_id {
            self.expected_id = id.wrapping_add(1);
        } else {
            let ahead = id.wrapping_sub(self.expected_id);
            if ahead < 0x8000_0000 {
                self.lost = self.lost.wrapping_add(ahead);
                self.out_of_order = self.out_of_order.wrapping_add(1);
                self.expected_id = id.wrapping_add(1);
            } else {
                trace!("late datagram {} (expected {})", id, self.expected_id);
            }
        }

        let transit = arrival_us as i64 - sent_us as i64;
        if let Some(last) = self.last_transit_us {
            let delta = (transit - last).abs();
            self.jitter_us += (delta - self.jitter_us) / 16;
        }
        self.last_transit_us = Some(transit);
    }

    pub fn jitter_ms(&self) -> f64 {
        self.jitter_us as f64 / 1000.0
    }

    pub fn lost_percent(&self) -> f64 {
        let expected = self.datagrams as u64 + self.lost as u64;
        if expected == 0 {
            0.0
        } else {
            self.lost as f64 * 100.0 / expected as f64
        }
    }
}

/// Thread-safe collector of finished session reports.
///
/// Cloning shares the underlying storage, so one clone can be registered as
/// the report callback while another is read after the test.
///
/// # Examples
///
/// ```
/// use rperf2::ReportCollector;
///
/// let collector = ReportCollector::new();
/// let callback = collector.clone();
/// assert!(collector.is_empty());
/// # drop(callback);
/// ```
#[derive(Debug, Clone, Default)]
pub struct ReportCollector {
    inner: Arc<Mutex<Vec<Report>>>,
}

impl ReportCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reports(&self) -> Vec<Report> {
        self.inner.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    pub fn for_session(&self, session: SessionId) -> Vec<Report> {
        self.inner
            .lock()
            .iter()
            .filter(|r| r.session == session)
            .cloned()
            .collect()
    }

    pub fn with_termination(&self, termination: Termination) -> Vec<Report> {
        self.inner
            .lock()
            .iter()
            .filter(|r| r.termination == termination)
            .cloned()
            .collect()
    }

    pub fn total_bytes(&self) -> u64 {
        self.inner.lock().iter().map(|r| r.bytes_transferred).sum()
    }

    pub fn clear(&self) {
        self.inner.lock().clear();
    }

    /// A callback that records into this collector after handing each
    /// report to `next`.
    pub fn forwarding_to(&self, next: Option<ReportRef>) -> ReportRef {
        let collector = self.clone();
        Arc::new(move |report: Report| {
            if let Some(next) = &next {
                next.on_report(report.clone());
            }
            collector.on_report(report);
        })
    }
}

impl ReportCallback for ReportCollector {
    fn on_report(&self, report: Report) {
        self.inner.lock().push(report);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed(ids: &[u32]) -> UdpRxStats {
        let mut stats = UdpRxStats::new();
        for (i, id) in ids.iter().enumerate() {
            stats.record(*id, i as u64 * 1000, i as u64 * 1000 + 500);
        }
        stats
    }

    #[test]
    fn test_in_order_sequence_has_no_loss() {
        let ids: Vec<u32> = (0..100).collect();
        let stats = feed(&ids);
        assert_eq!(stats.lost, 0);
        assert_eq!(stats.out_of_order, 0);
        assert_eq!(stats.datagrams, 100);
        assert_eq!(stats.expected_id, 100);
    }

    #[test]
    fn test_swapped_pair() {
        let stats = feed(&[0, 1, 3, 2, 4]);
        assert_eq!(stats.lost, 1);
        assert_eq!(stats.out_of_order, 1);
        assert_eq!(stats.datagrams, 5);
        assert_eq!(stats.expected_id, 5);
    }

    #[test]
    fn test_gap_counts_loss() {
        let stats = feed(&[0, 1, 5, 6]);
        assert_eq!(stats.lost, 3);
        assert_eq!(stats.out_of_order, 1);
        assert_eq!(stats.datagrams, 4);
    }

    #[test]
    fn test_sequence_wraparound() {
        let mut stats = UdpRxStats {
            expected_id: u32::MAX - 1,
            ..UdpRxStats::default()
        };
        stats.record(u32::MAX - 1, 0, 0);
        stats.record(u32::MAX, 0, 0);
        stats.record(0, 0, 0);
        stats.record(2, 0, 0);
        assert_eq!(stats.lost, 1);
        assert_eq!(stats.out_of_order, 1);
        assert_eq!(stats.expected_id, 3);
    }

    #[test]
    fn test_first_sample_only_seeds_jitter() {
        let mut stats = UdpRxStats::new();
        stats.record(0, 0, 10_000);
        assert_eq!(stats.jitter_us, 0);
        assert_eq!(stats.last_transit_us, Some(10_000));

        // transit grows by 1600us: J = 0 + (1600 - 0) / 16
        stats.record(1, 1000, 12_600);
        assert_eq!(stats.jitter_us, 100);

        // constant transit pulls jitter back down
        stats.record(2, 2000, 13_600);
        assert_eq!(stats.jitter_us, 100 + (0 - 100) / 16);
    }

    #[test]
    fn test_lost_percent() {
        let stats = feed(&[0, 1, 5, 6]);
        assert!((stats.lost_percent() - 3.0 * 100.0 / 7.0).abs() < 1e-9);
        assert_eq!(UdpRxStats::new().lost_percent(), 0.0);
    }

    #[test]
    fn test_collector_is_shared_between_clones() {
        use crate::config::Protocol;

        let id = SessionId::from_raw(0, 1);

        let collector = ReportCollector::new();
        let callback = collector.clone();
        callback.on_report(Report {
            session: id,
            protocol: Protocol::Tcp,
            termination: Termination::DoneServerRx,
            local: None,
            remote: None,
            bytes_transferred: 42,
            duration_ms: 1,
            bandwidth_kbitpsec: 336,
            udp: None,
        });

        assert_eq!(collector.len(), 1);
        assert_eq!(collector.total_bytes(), 42);
        assert_eq!(collector.for_session(id).len(), 1);
        assert_eq!(collector.with_termination(Termination::DoneServerRx).len(), 1);
        collector.clear();
        assert!(callback.is_empty());
    }

    #[test]
    fn test_forwarding_reaches_both() {
        use crate::config::Protocol;
        use std::sync::atomic::{AtomicU64, Ordering};

        let forwarded = Arc::new(AtomicU64::new(0));
        let counter = forwarded.clone();
        let next: ReportRef = Arc::new(move |report: Report| {
            counter.fetch_add(report.bytes_transferred, Ordering::SeqCst);
        });

        let collector = ReportCollector::new();
        let callback = collector.forwarding_to(Some(next));
        for bytes in [10, 20] {
            callback.on_report(Report {
                session: SessionId::from_raw(1, 0),
                protocol: Protocol::Udp,
                termination: Termination::DoneClientTx,
                local: None,
                remote: None,
                bytes_transferred: bytes,
                duration_ms: 0,
                bandwidth_kbitpsec: 0,
                udp: None,
            });
        }
        assert_eq!(forwarded.load(Ordering::SeqCst), 30);
        assert_eq!(collector.total_bytes(), 30);

        collector.forwarding_to(None).on_report(collector.reports()[0].clone());
        assert_eq!(collector.len(), 3);
    }
}
