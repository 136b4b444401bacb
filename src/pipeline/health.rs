use std::sync::atomic::{AtomicU32, Ordering};

/// Items that must fail in a row, each after its whole retry budget,
/// before a run suspects the server rather than the items.
pub const OUTAGE_THRESHOLD: u32 = 3;

/// Counts consecutive exhausted transient failures against one server.
#[derive(Debug)]
pub struct OutageMonitor {
    consecutive: AtomicU32,
    threshold: u32,
}

impl OutageMonitor {
    pub fn new(threshold: u32) -> Self {
        Self {
            consecutive: AtomicU32::new(0),
            threshold: threshold.max(1),
        }
    }

    pub fn success(&self) {
        self.consecutive.store(0, Ordering::SeqCst);
    }

    /// Count one failure. Returns true for exactly the failure that
    /// reaches the threshold.
    pub fn failure(&self) -> bool {
        self.consecutive.fetch_add(1, Ordering::SeqCst) + 1 == self.threshold
    }

    pub fn consecutive(&self) -> u32 {
        self.consecutive.load(Ordering::SeqCst)
    }
}

impl Default for OutageMonitor {
    fn default() -> Self {
        Self::new(OUTAGE_THRESHOLD)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trips_once_at_threshold() {
        let monitor = OutageMonitor::new(3);
        assert!(!monitor.failure());
        assert!(!monitor.failure());
        assert!(monitor.failure());
        assert!(!monitor.failure());
        assert_eq!(monitor.consecutive(), 4);
    }

    #[test]
    fn test_success_resets_the_run() {
        let monitor = OutageMonitor::new(2);
        assert!(!monitor.failure());
        monitor.success();
        assert!(!monitor.failure());
        assert!(monitor.failure());
    }
}
