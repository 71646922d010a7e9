//! Per-frequency and session-wide failure accounting.
//!
//! Pure bookkeeping: the scheduler feeds it failures and successes and acts
//! on the returned verdicts.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::time::Duration;

use tokio::time::Instant;

use spectra_core::config::FailureSettings;
use spectra_core::Frequency;

const RATE_WINDOW: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureVerdict {
    /// Consecutive failures of this frequency, including this one.
    pub consecutive: u32,
    /// The frequency reached its threshold and leaves the rotation.
    pub blacklist: bool,
    /// Session-wide limits were exceeded; the reason for stopping.
    pub session_fatal: Option<String>,
}

#[derive(Debug, Clone)]
pub struct FailureTracker {
    settings: FailureSettings,
    consecutive: HashMap<u64, u32>,
    tally: BTreeMap<String, u32>,
    session_consecutive: u32,
    recent: VecDeque<Instant>,
    total: u32,
}

impl FailureTracker {
    pub fn new(settings: FailureSettings) -> Self {
        Self {
            settings,
            consecutive: HashMap::new(),
            tally: BTreeMap::new(),
            session_consecutive: 0,
            recent: VecDeque::new(),
            total: 0,
        }
    }

    pub fn threshold(&self) -> u32 {
        self.settings.per_frequency_threshold
    }

    pub fn record_failure(&mut self, frequency: &Frequency, now: Instant) -> FailureVerdict {
        let consecutive = {
            let count = self.consecutive.entry(frequency.key()).or_insert(0);
            *count += 1;
            *count
        };
        *self.tally.entry(frequency.to_string()).or_insert(0) += 1;
        self.total += 1;
        self.session_consecutive += 1;

        self.recent.push_back(now);
        while let Some(oldest) = self.recent.front() {
            if now.duration_since(*oldest) > RATE_WINDOW {
                self.recent.pop_front();
            } else {
                break;
            }
        }

        let session_fatal = if self.session_consecutive >= self.settings.session_threshold {
            Some(format!(
                "{} consecutive failures across the session (limit {})",
                self.session_consecutive, self.settings.session_threshold
            ))
        } else if self.recent.len() as u32 > self.settings.max_failures_per_minute {
            Some(format!(
                "{} failures within one minute (limit {}/min)",
                self.recent.len(),
                self.settings.max_failures_per_minute
            ))
        } else {
            None
        };

        FailureVerdict {
            consecutive,
            blacklist: consecutive >= self.settings.per_frequency_threshold,
            session_fatal,
        }
    }

    /// Data arrived on `frequency`: its streak and the session streak reset.
    pub fn record_success(&mut self, frequency: &Frequency) {
        self.consecutive.remove(&frequency.key());
        self.session_consecutive = 0;
    }

    pub fn tally(&self) -> &BTreeMap<String, u32> {
        &self.tally
    }

    pub fn total(&self) -> u32 {
        self.total
    }
}
