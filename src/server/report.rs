//! Throughput accounting: per-connection counters and the periodic
//! aggregate report.
//!
//! Counters live in one shared, lock-protected list. The same lock covers
//! allocation on accept, increment on token flush, removal on close, and the
//! consume-and-reset cycle of report generation.

use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

/// Length of the reporting window in seconds. The report math assumes the
/// caller polls at exactly this cadence; the component itself keeps no clock.
pub const REPORT_WINDOW_SECS: u64 = 20;

/// Counter collection shared between the event loop and the report thread.
pub type SharedCounters = Arc<Mutex<Vec<ConnCounter>>>;

/// Messages processed by one connection during the current window.
///
/// Identified by the connection's remote address; two counters are equal
/// when their addresses are, regardless of count.
#[derive(Debug)]
pub struct ConnCounter {
    address: SocketAddr,
    messages_processed: u64,
}

impl ConnCounter {
    pub fn new(address: SocketAddr) -> Self {
        Self {
            address,
            messages_processed: 0,
        }
    }

    pub fn address(&self) -> SocketAddr {
        self.address
    }

    pub fn increment(&mut self) {
        self.messages_processed += 1;
    }

    pub fn count(&self) -> u64 {
        self.messages_processed
    }

    pub fn reset(&mut self) {
        self.messages_processed = 0;
    }
}

impl PartialEq for ConnCounter {
    fn eq(&self, other: &Self) -> bool {
        self.address == other.address
    }
}

/// Aggregate throughput over one reporting window.
#[derive(Debug, Clone, PartialEq)]
pub struct Report {
    pub connections: usize,
    pub total_per_second: f64,
    pub mean_per_second: f64,
    pub std_dev_per_second: f64,
}

impl Report {
    /// Compute the aggregate for one window from a counter snapshot.
    ///
    /// Mean and standard deviation degenerate to 0 when there are no
    /// connections or the total is not finite. The standard deviation is the
    /// population form (divide by the connection count, not count - 1).
    pub fn new(counters: &[ConnCounter]) -> Self {
        let connections = counters.len();
        let window = REPORT_WINDOW_SECS as f64;
        let total: u64 = counters.iter().map(ConnCounter::count).sum();
        let total_per_second = total as f64 / window;

        let (mean_per_second, std_dev_per_second) =
            if connections > 0 && total_per_second.is_finite() {
                let mean = total_per_second / connections as f64;
                let variance = counters
                    .iter()
                    .map(|c| {
                        let per_second = c.count() as f64 / window;
                        (per_second - mean).powi(2)
                    })
                    .sum::<f64>()
                    / connections as f64;
                (mean, variance.sqrt())
            } else {
                (0.0, 0.0)
            };

        Self {
            connections,
            total_per_second,
            mean_per_second,
            std_dev_per_second,
        }
    }
}

impl fmt::Display for Report {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Server Throughput: {:.2} messages/s, \
             Active Client Connections: {}, \
             Mean Per-client Throughput: {:.2} messages/s, \
             Std. Dev. of Per-client Throughput: {:.2} messages/s",
            self.total_per_second,
            self.connections,
            self.mean_per_second,
            self.std_dev_per_second
        )
    }
}

/// Snapshot all counters into a report and reset each to zero.
///
/// This is consume-and-reset, not a pure read: counts observed here will
/// never appear in a later report.
pub fn take_report(counters: &Mutex<Vec<ConnCounter>>) -> Report {
    let mut counters = counters.lock().unwrap();
    let report = Report::new(&counters);
    for counter in counters.iter_mut() {
        counter.reset();
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counter(port: u16, count: u64) -> ConnCounter {
        let mut c = ConnCounter::new(format!("127.0.0.1:{port}").parse().unwrap());
        for _ in 0..count {
            c.increment();
        }
        c
    }

    #[test]
    fn test_report_uniform_counts() {
        let counters = vec![counter(1, 10), counter(2, 10), counter(3, 10)];
        let report = Report::new(&counters);

        assert_eq!(report.connections, 3);
        assert_eq!(report.total_per_second, 1.5);
        assert_eq!(report.mean_per_second, 0.5);
        assert_eq!(report.std_dev_per_second, 0.0);
    }

    #[test]
    fn test_report_no_connections() {
        let report = Report::new(&[]);

        assert_eq!(report.connections, 0);
        assert_eq!(report.total_per_second, 0.0);
        assert_eq!(report.mean_per_second, 0.0);
        assert_eq!(report.std_dev_per_second, 0.0);
    }

    #[test]
    fn test_report_population_std_dev() {
        // Counts 0 and 40 over 20 s: rates 0 and 2, mean 1, deviation 1
        let counters = vec![counter(1, 0), counter(2, 40)];
        let report = Report::new(&counters);

        assert_eq!(report.mean_per_second, 1.0);
        assert_eq!(report.std_dev_per_second, 1.0);
    }

    #[test]
    fn test_take_report_resets_counters() {
        let counters = Mutex::new(vec![counter(1, 4), counter(2, 6)]);

        let first = take_report(&counters);
        assert_eq!(first.total_per_second, 0.5);

        let second = take_report(&counters);
        assert_eq!(second.connections, 2);
        assert_eq!(second.total_per_second, 0.0);
    }

    #[test]
    fn test_counter_equality_is_address_only() {
        let a = counter(9, 5);
        let b = counter(9, 100);
        let c = counter(10, 5);

        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
