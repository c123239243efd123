//! Per-source conditioning state.
//!
//! The registry owns one [`SourceEntry`] per source, created on first sight
//! and kept for the life of the process. Membership is guarded by a map-level
//! read/write lock; each entry has its own mutex so ingest for one source
//! never waits on another.

use crate::config::Config;
use crate::core::{ConditionedReading, FingerSessionTracker, SignalSmoother, SignalStats, SourceId};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// Conditioning state and latest output for one source.
#[derive(Debug)]
pub struct SourceEntry {
    pub smoother: SignalSmoother,
    pub session: FingerSessionTracker,
    latest: Option<ConditionedReading>,
}

impl SourceEntry {
    pub fn record_latest(&mut self, reading: ConditionedReading) {
        self.latest = Some(reading);
    }

    pub fn latest(&self) -> Option<&ConditionedReading> {
        self.latest.as_ref()
    }
}

/// Shared handle to one source's entry.
pub type SharedEntry = Arc<Mutex<SourceEntry>>;

/// History ring and statistics of one source.
#[derive(Debug, Clone, PartialEq)]
pub struct SignalHistory {
    pub history: Vec<f64>,
    pub statistics: Option<SignalStats>,
}

/// Concurrency-safe map from source to its conditioning state.
pub struct SourceRegistry {
    sources: RwLock<HashMap<SourceId, SharedEntry>>,
    config: Config,
}

impl SourceRegistry {
    pub fn new(config: Config) -> Self {
        Self {
            sources: RwLock::new(HashMap::new()),
            config,
        }
    }

    /// Get the entry for a source, creating it on first sight.
    pub fn get_or_create(&self, source: SourceId) -> SharedEntry {
        if let Some(entry) = self.sources.read().get(&source) {
            return entry.clone();
        }

        let mut sources = self.sources.write();
        sources
            .entry(source)
            .or_insert_with(|| {
                tracing::info!(source = %source, "Created conditioning state for new source");
                Arc::new(Mutex::new(SourceEntry {
                    smoother: SignalSmoother::new(&self.config.smoothing),
                    session: FingerSessionTracker::new(self.config.no_finger_threshold),
                    latest: None,
                }))
            })
            .clone()
    }

    fn get(&self, source: SourceId) -> Option<SharedEntry> {
        self.sources.read().get(&source).cloned()
    }

    /// Snapshot of all entries, so iteration does not hold the map lock.
    fn entries(&self) -> Vec<(SourceId, SharedEntry)> {
        self.sources
            .read()
            .iter()
            .map(|(id, entry)| (*id, entry.clone()))
            .collect()
    }

    /// Store the latest reading for a source, creating the entry if needed.
    pub fn record_latest(&self, source: SourceId, reading: ConditionedReading) {
        self.get_or_create(source).lock().record_latest(reading);
    }

    pub fn latest(&self, source: SourceId) -> Option<ConditionedReading> {
        self.get(source)?.lock().latest().cloned()
    }

    /// Latest reading of every source that has produced one.
    pub fn all_latest(&self) -> BTreeMap<SourceId, ConditionedReading> {
        self.entries()
            .into_iter()
            .filter_map(|(id, entry)| entry.lock().latest().cloned().map(|r| (id, r)))
            .collect()
    }

    /// Statistics of every known source; `None` where no sample was accepted yet.
    pub fn all_statistics(&self) -> BTreeMap<SourceId, Option<SignalStats>> {
        self.entries()
            .into_iter()
            .map(|(id, entry)| (id, entry.lock().smoother.statistics()))
            .collect()
    }

    pub fn history(&self, source: SourceId) -> Option<SignalHistory> {
        let entry = self.get(source)?;
        let entry = entry.lock();
        Some(SignalHistory {
            history: entry.smoother.history(),
            statistics: entry.smoother.statistics(),
        })
    }

    /// Sources with a latest reading, in ascending order.
    pub fn source_ids(&self) -> Vec<SourceId> {
        let mut ids: Vec<SourceId> = self
            .entries()
            .into_iter()
            .filter(|(_, entry)| entry.lock().latest().is_some())
            .map(|(id, _)| id)
            .collect();
        ids.sort();
        ids
    }

    /// Run `f` on a source's latest reading while holding that source's lock.
    ///
    /// Ingest cannot broadcast a newer reading for the source while `f` runs,
    /// so anything `f` enqueues lands ahead of later live readings.
    pub fn with_latest<F, R>(&self, source: SourceId, f: F) -> Option<R>
    where
        F: FnOnce(&ConditionedReading) -> R,
    {
        let entry = self.get(source)?;
        let entry = entry.lock();
        entry.latest().map(f)
    }

    pub fn len(&self) -> usize {
        self.sources.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.read().is_empty()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::RawReading;
    use chrono::Utc;

    fn reading(source: i64, bpm: f64) -> ConditionedReading {
        let raw = RawReading {
            source: SourceId(source),
            value: bpm,
            finger_present: true,
            sender: "10.0.0.2:4000".parse().unwrap(),
            received_at: Utc::now(),
            extra: serde_json::Map::new(),
        };
        ConditionedReading::measured(&raw, bpm, true)
    }

    #[test]
    fn test_get_or_create_is_idempotent() {
        let registry = SourceRegistry::new(Config::default());
        let a = registry.get_or_create(SourceId(1));
        let b = registry.get_or_create(SourceId(1));
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.len(), 1);

        registry.get_or_create(SourceId(2));
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_latest_and_unknown_source() {
        let registry = SourceRegistry::new(Config::default());
        assert!(registry.latest(SourceId(9)).is_none());
        assert!(registry.history(SourceId(9)).is_none());

        registry.record_latest(SourceId(9), reading(9, 70.0));
        assert_eq!(registry.latest(SourceId(9)).unwrap().bpm.value(), Some(70.0));

        registry.record_latest(SourceId(9), reading(9, 75.0));
        assert_eq!(registry.latest(SourceId(9)).unwrap().bpm.value(), Some(75.0));
    }

    #[test]
    fn test_all_latest_skips_sources_without_output() {
        let registry = SourceRegistry::new(Config::default());
        registry.get_or_create(SourceId(1));
        registry.record_latest(SourceId(2), reading(2, 80.0));
        registry.record_latest(SourceId(3), reading(3, 90.0));

        let all = registry.all_latest();
        assert_eq!(all.keys().copied().collect::<Vec<_>>(), vec![SourceId(2), SourceId(3)]);
        assert_eq!(registry.source_ids(), vec![SourceId(2), SourceId(3)]);
    }

    #[test]
    fn test_with_latest() {
        let registry = SourceRegistry::new(Config::default());
        registry.get_or_create(SourceId(1));
        registry.record_latest(SourceId(2), reading(2, 64.0));

        assert_eq!(registry.with_latest(SourceId(1), |r| r.user), None);
        assert_eq!(registry.with_latest(SourceId(3), |r| r.user), None);
        assert_eq!(
            registry.with_latest(SourceId(2), |r| r.bpm.value()),
            Some(Some(64.0))
        );
    }

    #[test]
    fn test_history_and_statistics() {
        let registry = SourceRegistry::new(Config::default());
        {
            let entry = registry.get_or_create(SourceId(4));
            let mut entry = entry.lock();
            entry.smoother.add_sample(60.0);
            entry.smoother.add_sample(80.0);
        }
        registry.get_or_create(SourceId(5));

        let history = registry.history(SourceId(4)).unwrap();
        assert_eq!(history.history, vec![60.0, 80.0]);
        assert_eq!(history.statistics.unwrap().mean, 70.0);

        let stats = registry.all_statistics();
        assert_eq!(stats.len(), 2);
        assert!(stats[&SourceId(4)].is_some());
        assert!(stats[&SourceId(5)].is_none());
    }

    #[test]
    fn test_concurrent_creation_yields_one_entry_per_source() {
        let registry = Arc::new(SourceRegistry::new(Config::default()));
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let registry = registry.clone();
                std::thread::spawn(move || {
                    for i in 0..200 {
                        let source = SourceId(i % 10);
                        let entry = registry.get_or_create(source);
                        entry.lock().smoother.add_sample(60.0 + t as f64);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(registry.len(), 10);
        for (_, stats) in registry.all_statistics() {
            assert!(stats.is_some());
        }
    }
}
