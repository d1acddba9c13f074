//! Subscription sets pushed by the position/portfolio collaborator

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::types::{ContractKey, InstrumentSpec, Source};

/// One instrument a source should stream greeks for
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subscription {
    pub source: Source,
    /// Source-native identifier: DXLink streamer symbol or IBKR conid
    pub feed_symbol: String,
    pub instrument: InstrumentSpec,
}

impl Subscription {
    pub fn new(source: Source, feed_symbol: impl Into<String>, instrument: InstrumentSpec) -> Self {
        Self {
            source,
            feed_symbol: feed_symbol.into(),
            instrument,
        }
    }

    pub fn contract_key(&self) -> ContractKey {
        self.instrument.contract_key()
    }
}

/// The full set of subscriptions across all sources
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionSet {
    entries: Vec<Subscription>,
}

impl SubscriptionSet {
    pub fn new(entries: Vec<Subscription>) -> Self {
        Self { entries }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Subscription> {
        self.entries.iter()
    }

    /// Subscriptions for one source keyed by contract key
    ///
    /// A later entry for the same key replaces an earlier one.
    pub fn for_source(&self, source: Source) -> BTreeMap<ContractKey, Subscription> {
        self.entries
            .iter()
            .filter(|s| s.source == source)
            .map(|s| (s.contract_key(), s.clone()))
            .collect()
    }
}

/// Shared handle on the live subscription set
///
/// Every session watches the same set; replacing it makes each live session
/// apply the difference on its open connection.
#[derive(Debug, Clone)]
pub struct SubscriptionHandle {
    tx: Arc<watch::Sender<SubscriptionSet>>,
}

impl SubscriptionHandle {
    pub fn new(initial: SubscriptionSet) -> Self {
        let (tx, _) = watch::channel(initial);
        Self { tx: Arc::new(tx) }
    }

    /// Replace the set; returns the number of entries now live
    pub fn replace(&self, subscriptions: SubscriptionSet) -> usize {
        let len = subscriptions.len();
        self.tx.send_replace(subscriptions);
        len
    }

    pub fn current(&self) -> SubscriptionSet {
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SubscriptionSet> {
        self.tx.subscribe()
    }
}

/// Changes needed to move a session from one subscribed set to another
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SubscriptionDiff {
    pub added: Vec<Subscription>,
    pub removed: Vec<Subscription>,
}

impl SubscriptionDiff {
    /// Compute the diff between what is subscribed and what is wanted
    ///
    /// A key whose feed symbol changed shows up in both lists.
    pub fn between(
        current: &BTreeMap<ContractKey, Subscription>,
        wanted: &BTreeMap<ContractKey, Subscription>,
    ) -> Self {
        let mut diff = Self::default();

        for (key, sub) in wanted {
            match current.get(key) {
                Some(existing) if existing.feed_symbol == sub.feed_symbol => {}
                Some(existing) => {
                    diff.removed.push(existing.clone());
                    diff.added.push(sub.clone());
                }
                None => diff.added.push(sub.clone()),
            }
        }

        for (key, sub) in current {
            if !wanted.contains_key(key) {
                diff.removed.push(sub.clone());
            }
        }

        diff
    }

    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    use crate::types::OptionRight;

    fn sub(source: Source, symbol: &str, strike: f64) -> Subscription {
        let expiry = NaiveDate::from_ymd_opt(2024, 1, 19).unwrap();
        Subscription::new(
            source,
            symbol,
            InstrumentSpec::option("SPY", expiry, strike, OptionRight::Call),
        )
    }

    #[test]
    fn test_for_source_filters() {
        let set = SubscriptionSet::new(vec![
            sub(Source::Tastytrade, ".SPY240119C450", 450.0),
            sub(Source::Ibkr, "1001", 450.0),
            sub(Source::Ibkr, "1002", 455.0),
        ]);
        assert_eq!(set.for_source(Source::Tastytrade).len(), 1);
        assert_eq!(set.for_source(Source::Ibkr).len(), 2);
    }

    #[test]
    fn test_diff_adds_removes_and_replaces() {
        let current = SubscriptionSet::new(vec![
            sub(Source::Ibkr, "1001", 450.0),
            sub(Source::Ibkr, "1002", 455.0),
        ])
        .for_source(Source::Ibkr);
        let wanted = SubscriptionSet::new(vec![
            sub(Source::Ibkr, "2001", 450.0),
            sub(Source::Ibkr, "1003", 460.0),
        ])
        .for_source(Source::Ibkr);

        let diff = SubscriptionDiff::between(&current, &wanted);
        let added: Vec<_> = diff.added.iter().map(|s| s.feed_symbol.as_str()).collect();
        let removed: Vec<_> = diff.removed.iter().map(|s| s.feed_symbol.as_str()).collect();
        assert_eq!(added, vec!["2001", "1003"]);
        assert_eq!(removed, vec!["1001", "1002"]);
    }

    #[test]
    fn test_diff_of_identical_sets_is_empty() {
        let set = SubscriptionSet::new(vec![sub(Source::Tastytrade, ".SPY240119C450", 450.0)])
            .for_source(Source::Tastytrade);
        assert!(SubscriptionDiff::between(&set, &set).is_empty());
    }

    #[test]
    fn test_handle_replace_reaches_watchers() {
        let handle = SubscriptionHandle::new(SubscriptionSet::default());
        let mut rx = handle.subscribe();
        let cloned = handle.clone();

        let set = SubscriptionSet::new(vec![sub(Source::Ibkr, "1001", 450.0)]);
        assert_eq!(cloned.replace(set.clone()), 1);
        assert!(rx.has_changed().unwrap());
        assert_eq!(*rx.borrow_and_update(), set);
        assert_eq!(handle.current(), set);
    }
}
