//! Xrun accounting and off-thread reporting.
//!
//! Real-time threads must not log or allocate, so a missed deadline is
//! recorded as a counter bump plus a `try_send` on a bounded channel. A
//! non-real-time thread drains the channel with [`XrunMonitor::drain`] and
//! does the logging there. A full channel silently drops reports; the
//! counters still account for every event.

use crossbeam_channel::{bounded, Receiver, Sender, TryRecvError};
use log::warn;

use crate::lockfree::AtomicCounter;

const REPORT_CAPACITY: usize = 64;

/// Which side of the ring missed its deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum XrunKind {
    /// The hardware side found no ready period in time.
    Underrun,
    /// The producer side found no free slot in time.
    Overrun,
}

/// One missed deadline, stamped with where the transport stood.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct XrunReport {
    pub kind: XrunKind,
    /// Musical position at the time of the miss.
    pub note_offset: u64,
    /// Hardware periods elapsed since start.
    pub period_index: u64,
}

/// Counters plus the drain side of the report channel.
pub struct XrunMonitor {
    underruns: AtomicCounter,
    overruns: AtomicCounter,
    tx: Sender<XrunReport>,
    rx: Receiver<XrunReport>,
}

impl XrunMonitor {
    pub fn new() -> Self {
        let (tx, rx) = bounded(REPORT_CAPACITY);
        Self {
            underruns: AtomicCounter::default(),
            overruns: AtomicCounter::default(),
            tx,
            rx,
        }
    }

    /// Handle for real-time threads. Cheap to clone, never blocks.
    pub fn reporter(&self) -> XrunReporter {
        XrunReporter {
            tx: self.tx.clone(),
        }
    }

    pub fn underruns(&self) -> u64 {
        self.underruns.get()
    }

    pub fn overruns(&self) -> u64 {
        self.overruns.get()
    }

    pub fn reset(&self) {
        self.underruns.reset();
        self.overruns.reset();
        while self.rx.try_recv().is_ok() {}
    }

    /// Drain pending reports, bump counters, and log each one. Call from a
    /// non-real-time thread.
    pub fn drain(&self) -> Vec<XrunReport> {
        let mut reports = Vec::new();
        loop {
            match self.rx.try_recv() {
                Ok(report) => {
                    match report.kind {
                        XrunKind::Underrun => {
                            self.underruns.incr();
                            warn!(
                                "underrun at note_offset {} (period {})",
                                report.note_offset, report.period_index
                            );
                        }
                        XrunKind::Overrun => {
                            self.overruns.incr();
                            warn!(
                                "overrun at note_offset {} (period {})",
                                report.note_offset, report.period_index
                            );
                        }
                    }
                    reports.push(report);
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }
        reports
    }
}

impl Default for XrunMonitor {
    fn default() -> Self {
        Self::new()
    }
}

/// Real-time-safe xrun report handle.
#[derive(Clone)]
pub struct XrunReporter {
    tx: Sender<XrunReport>,
}

impl XrunReporter {
    /// Record a missed deadline. Never blocks; if the channel is full the
    /// report is dropped.
    pub fn report(&self, kind: XrunKind, note_offset: u64, period_index: u64) {
        let _ = self.tx.try_send(XrunReport {
            kind,
            note_offset,
            period_index,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_drain_counts_by_kind() {
        let monitor = XrunMonitor::new();
        let reporter = monitor.reporter();

        reporter.report(XrunKind::Underrun, 10, 100);
        reporter.report(XrunKind::Underrun, 11, 110);
        reporter.report(XrunKind::Overrun, 12, 120);

        let reports = monitor.drain();
        assert_eq!(reports.len(), 3);
        assert_eq!(monitor.underruns(), 2);
        assert_eq!(monitor.overruns(), 1);
        assert_eq!(reports[0].note_offset, 10);
    }

    #[test]
    fn test_full_channel_drops_without_blocking() {
        let monitor = XrunMonitor::new();
        let reporter = monitor.reporter();

        for i in 0..(REPORT_CAPACITY as u64 + 10) {
            reporter.report(XrunKind::Underrun, i, i);
        }

        // try_send dropped the overflow; nothing blocked.
        let reports = monitor.drain();
        assert_eq!(reports.len(), REPORT_CAPACITY);
        assert_eq!(monitor.underruns(), REPORT_CAPACITY as u64);
    }

    #[test]
    fn test_reset_clears_counters_and_backlog() {
        let monitor = XrunMonitor::new();
        let reporter = monitor.reporter();

        reporter.report(XrunKind::Overrun, 1, 1);
        monitor.drain();
        reporter.report(XrunKind::Overrun, 2, 2);

        monitor.reset();
        assert_eq!(monitor.overruns(), 0);
        assert!(monitor.drain().is_empty());
    }
}
