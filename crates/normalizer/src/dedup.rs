//! Per-contract duplicate and ordering tracker
//!
//! Best effort and in memory only: history does not survive a restart, and
//! only the most recent `history` event times per key are remembered.

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Utc};
use common::{ContractKey, Source};

/// Outcome of observing one event time
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Newest so far for its key, or carries no event time
    InOrder,
    /// Older than the latest accepted event for its key; still persisted
    OutOfOrder,
    /// Same key and event time as a record already forwarded
    Duplicate,
}

#[derive(Debug)]
struct KeyHistory {
    latest: DateTime<Utc>,
    recent: VecDeque<DateTime<Utc>>,
}

#[derive(Debug)]
pub struct DedupTracker {
    history: usize,
    keys: HashMap<Source, HashMap<ContractKey, KeyHistory>>,
}

impl DedupTracker {
    pub fn new(history: usize) -> Self {
        Self {
            history: history.max(1),
            keys: HashMap::new(),
        }
    }

    /// Classify and record `event_time` for `(source, key)`
    ///
    /// Duplicates are not recorded.
    pub fn observe(&mut self, source: Source, key: &ContractKey, event_time: Option<DateTime<Utc>>) -> Verdict {
        let Some(at) = event_time else {
            return Verdict::InOrder;
        };

        let per_source = self.keys.entry(source).or_default();
        let Some(entry) = per_source.get_mut(key) else {
            per_source.insert(
                key.clone(),
                KeyHistory {
                    latest: at,
                    recent: VecDeque::from([at]),
                },
            );
            return Verdict::InOrder;
        };

        if entry.latest == at || entry.recent.contains(&at) {
            return Verdict::Duplicate;
        }

        if entry.recent.len() >= self.history {
            entry.recent.pop_front();
        }
        entry.recent.push_back(at);

        if at < entry.latest {
            Verdict::OutOfOrder
        } else {
            entry.latest = at;
            Verdict::InOrder
        }
    }

    /// Number of tracked `(source, contract_key)` pairs
    pub fn tracked_keys(&self) -> usize {
        self.keys.values().map(HashMap::len).sum()
    }
}
