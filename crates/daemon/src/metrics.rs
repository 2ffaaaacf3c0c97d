//! Probe counters
//!
//! A handful of process-lifetime counters rendered in Prometheus text
//! exposition format. The probe holds no other state between requests.

use std::sync::atomic::{AtomicU64, Ordering};

/// Counters shared across HTTP handlers.
#[derive(Debug, Default)]
pub struct Metrics {
    pub cid_checks_total: AtomicU64,
    pub peer_checks_total: AtomicU64,
    pub check_errors_total: AtomicU64,
}

impl Metrics {
    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Render all counters in Prometheus text exposition format.
    pub fn render(&self) -> String {
        let mut out = String::new();
        for (name, help, value) in [
            (
                "cidcheck_cid_checks_total",
                "Number of CID checks served",
                self.cid_checks_total.load(Ordering::Relaxed),
            ),
            (
                "cidcheck_peer_checks_total",
                "Number of peer checks served",
                self.peer_checks_total.load(Ordering::Relaxed),
            ),
            (
                "cidcheck_check_errors_total",
                "Number of checks rejected for bad input or setup failure",
                self.check_errors_total.load(Ordering::Relaxed),
            ),
        ] {
            out.push_str(&format!("# HELP {} {}\n", name, help));
            out.push_str(&format!("# TYPE {} counter\n", name));
            out.push_str(&format!("{} {}\n", name, value));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_contains_counters() {
        let metrics = Metrics::default();
        Metrics::incr(&metrics.cid_checks_total);
        Metrics::incr(&metrics.cid_checks_total);
        Metrics::incr(&metrics.peer_checks_total);

        let text = metrics.render();
        assert!(text.contains("cidcheck_cid_checks_total 2"));
        assert!(text.contains("cidcheck_peer_checks_total 1"));
        assert!(text.contains("cidcheck_check_errors_total 0"));
        assert!(text.contains("# TYPE cidcheck_cid_checks_total counter"));
    }
}
