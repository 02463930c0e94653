use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, warn};

/// Process-scoped counters shared by every task in one service.
///
/// Constructed once at startup and passed down as an explicit collaborator;
/// the counter map is the only piece of state behind a lock here.
#[derive(Debug, Default)]
pub struct Metrics {
    counters: Mutex<HashMap<String, i64>>,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment(&self, name: &str, value: i64) {
        if let Ok(mut counters) = self.counters.lock() {
            *counters.entry(name.to_string()).or_insert(0) += value;
        }
    }

    pub fn get(&self, name: &str) -> i64 {
        self.counters
            .lock()
            .map(|counters| counters.get(name).copied().unwrap_or(0))
            .unwrap_or(0)
    }

    pub fn record_duration(&self, name: &str, duration: Duration) {
        debug!(name, duration_ms = duration.as_millis() as u64, "metric recorded");
    }

    /// Informational line-count check: scanned lines should equal parsed
    /// entries plus lines the parser skipped. A divergence points at a
    /// parser bug, never at lost data, so it only bumps a counter.
    pub fn verify_line_counts(
        &self,
        log_type: &str,
        file_name: &str,
        scanned_lines: u64,
        accounted_lines: u64,
    ) {
        if scanned_lines != accounted_lines {
            self.increment("data_integrity_mismatches", 1);
            warn!(
                log_type,
                file = file_name,
                scanned = scanned_lines,
                accounted = accounted_lines,
                "line count mismatch"
            );
        }
    }
}
