//! Output versions per (equipment, rule) pair
//!
//! A batch rerun always moves to the next version before writing any output.
//! A realtime run keeps the current version, unless the instance's binding
//! changed since the version was issued, in which case the new actor
//! generation gets a fresh one.

use dashmap::DashMap;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct VersionEntry {
    version: u32,
    fingerprint: u64,
}

/// Version counters shared by every run of one engine
#[derive(Debug, Default)]
pub struct VersionRegistry {
    entries: DashMap<(String, String), VersionEntry>,
}

impl VersionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self, equipment_id: &str, rule_id: &str) -> Option<u32> {
        self.entries
            .get(&(equipment_id.to_string(), rule_id.to_string()))
            .map(|e| e.version)
    }

    /// Next version for a batch rerun
    pub fn bump(&self, equipment_id: &str, rule_id: &str, fingerprint: u64) -> u32 {
        let mut entry = self
            .entries
            .entry((equipment_id.to_string(), rule_id.to_string()))
            .or_insert(VersionEntry {
                version: 0,
                fingerprint,
            });
        entry.version += 1;
        entry.fingerprint = fingerprint;
        debug!("{}_{} now at V{}", equipment_id, rule_id, entry.version);
        entry.version
    }

    /// Version for a realtime run, 1 when none was issued yet
    pub fn realtime(&self, equipment_id: &str, rule_id: &str, fingerprint: u64) -> u32 {
        let mut entry = self
            .entries
            .entry((equipment_id.to_string(), rule_id.to_string()))
            .or_insert(VersionEntry {
                version: 1,
                fingerprint,
            });
        if entry.fingerprint != fingerprint {
            entry.version += 1;
            entry.fingerprint = fingerprint;
            debug!(
                "{}_{} rebound, now at V{}",
                equipment_id, rule_id, entry.version
            );
        }
        entry.version
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
