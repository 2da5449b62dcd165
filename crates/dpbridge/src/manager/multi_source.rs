use std::collections::HashMap;
use std::time::Duration;
use std::time::Instant;

use tracing::debug;

use crate::source::StatusEntry;

/// Which source last reported a data point, and when.
#[derive(Debug, Clone, PartialEq, Eq)]
struct SourceRecord {
    source: String,
    last_seen: Instant,
}

/// Arbitrates between sources reporting the same data point.
///
/// The source that reported a code last stays authoritative for it during
/// the authority window; reports from other sources inside the window are
/// discarded. A zero window accepts every report.
#[derive(Debug)]
pub struct MultiSourceHandler {
    authority_window: Duration,
    records: HashMap<String, HashMap<String, SourceRecord>>,
}

impl MultiSourceHandler {
    pub fn new(authority_window: Duration) -> Self {
        Self {
            authority_window,
            records: HashMap::new(),
        }
    }

    /// Record a status list reported by `source` and return the entries it
    /// is authoritative for. Entries without a code are dropped.
    pub fn register_status_list_from_source(
        &mut self,
        device_id: &str,
        source: &str,
        status_list: &[StatusEntry],
        now: Instant,
    ) -> Vec<StatusEntry> {
        let records = self.records.entry(device_id.to_string()).or_default();
        let mut accepted = Vec::with_capacity(status_list.len());

        for entry in status_list {
            let Some(code) = entry.code.as_deref() else {
                continue;
            };
            let authoritative = match records.get(code) {
                Some(record) if record.source != source => {
                    now.duration_since(record.last_seen) >= self.authority_window
                }
                _ => true,
            };
            if !authoritative {
                debug!(
                    "{}: ignoring {} from {}, owned by another source",
                    device_id, code, source
                );
                continue;
            }
            records.insert(
                code.to_string(),
                SourceRecord {
                    source: source.to_string(),
                    last_seen: now,
                },
            );
            accepted.push(entry.clone());
        }

        accepted
    }

    pub fn authoritative_source(&self, device_id: &str, code: &str) -> Option<&str> {
        self.records
            .get(device_id)?
            .get(code)
            .map(|record| record.source.as_str())
    }

    /// Every source that has reported for the device, sorted.
    pub fn sources_of(&self, device_id: &str) -> Vec<String> {
        let mut sources: Vec<String> = self
            .records
            .get(device_id)
            .map(|records| records.values().map(|r| r.source.clone()).collect())
            .unwrap_or_default();
        sources.sort();
        sources.dedup();
        sources
    }

    pub fn forget_device(&mut self, device_id: &str) {
        self.records.remove(device_id);
    }

    pub fn clear(&mut self) {
        self.records.clear();
    }
}
