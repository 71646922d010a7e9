//! Bounded log of recent scheduler operations, exposed through `health`.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const OPS_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpKind {
    Start,
    Stop,
    Switch,
    Failure,
    Blacklist,
    Recovery,
    GracefulStop,
    EmergencyStop,
    Cleanup,
    DeviceBusy,
    DeviceReset,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpRecord {
    pub at: DateTime<Utc>,
    pub op: OpKind,
    pub detail: String,
}

#[derive(Debug, Clone)]
pub struct OpsLog {
    entries: VecDeque<OpRecord>,
    capacity: usize,
}

impl Default for OpsLog {
    fn default() -> Self {
        Self::with_capacity(OPS_CAPACITY)
    }
}

impl OpsLog {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    pub fn record(&mut self, op: OpKind, detail: impl Into<String>) {
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(OpRecord {
            at: Utc::now(),
            op,
            detail: detail.into(),
        });
    }

    /// Oldest first.
    pub fn entries(&self) -> Vec<OpRecord> {
        self.entries.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn oldest_entries_fall_off() {
        let mut log = OpsLog::with_capacity(3);
        for i in 0..5 {
            log.record(OpKind::Switch, format!("switch {i}"));
        }
        let details: Vec<_> = log.entries().into_iter().map(|e| e.detail).collect();
        assert_eq!(details, vec!["switch 2", "switch 3", "switch 4"]);
    }
}
