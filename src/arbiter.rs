//! ==============================================================================
//! arbiter.rs - source arbitration
//! ==============================================================================
//!
//! purpose:
//!     answers "what is the current reading" from three candidates:
//!
//! ```text
//!         1. latest remote push, while its timestamp is within the freshness window of now
//!         2. latest local device reading
//!         3. latest row in the sample store
//!         4. nothing -> `None`
//!
//!     a stale remote producer (network down, board powered off) must not hide a
//!     live local reading.
//! ```
//!
//! concurrency:
//!     both slots sit behind ONE mutex so a reader never sees one slot updated
//!     and the other not. the lock is never held across an await; the store
//!     fallback runs after the snapshot is taken.
//!
//! ==============================================================================

use chrono::{Duration, Utc};
use std::sync::{Mutex, MutexGuard};

use crate::domain::{Current, Measurement, Source};
use crate::error::StoreError;
use crate::store::SampleStore;

#[derive(Debug, Default, Clone)]
struct Slots {
    latest_remote: Option<Measurement>,
    latest_local: Option<Measurement>,
}

#[derive(Debug)]
pub struct SourceArbiter {
    slots: Mutex<Slots>,
    freshness: Duration,
    store: SampleStore,
}

impl SourceArbiter {
    pub fn new(store: SampleStore, freshness: std::time::Duration) -> Self {
        Self {
            slots: Mutex::new(Slots::default()),
            freshness: Duration::from_std(freshness).unwrap_or(Duration::MAX),
            store,
        }
    }

    fn slots(&self) -> MutexGuard<'_, Slots> {
        // slots are replaced whole, a poisoned guard still holds consistent data
        self.slots.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn record_remote(&self, m: Measurement) {
        self.slots().latest_remote = Some(m);
    }

    pub fn record_local(&self, m: Measurement) {
        self.slots().latest_local = Some(m);
    }

    /// routes a measurement to the slot matching its source
    pub fn record(&self, m: Measurement) {
        match m.source {
            Source::Remote => self.record_remote(m),
            Source::Local => self.record_local(m),
            Source::Persisted => {
                tracing::debug!("persisted reading offered to the arbiter, ignoring");
            }
        }
    }

    /// in-memory part of the policy; `None` means "ask the store"
    fn pick_in_memory(&self) -> Option<Current> {
        let slots = self.slots().clone();
        let now = Utc::now();

        if let Some(remote) = slots.latest_remote {
            // a clock running ahead counts as distance from now too
            if remote.age(now).abs() <= self.freshness {
                return Some(Current { method: Source::Remote, reading: remote });
            }
        }

        slots
            .latest_local
            .map(|local| Current { method: Source::Local, reading: local })
    }

    pub async fn current(&self) -> Result<Option<Current>, StoreError> {
        if let Some(current) = self.pick_in_memory() {
            return Ok(Some(current));
        }

        let row = self.store.latest().await?;
        Ok(row.map(|row| Current { method: Source::Persisted, reading: row.measurement }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn arbiter() -> (TempDir, SampleStore, SourceArbiter) {
        let dir = tempfile::tempdir().unwrap();
        let store = SampleStore::open(dir.path().join("readings.db")).await.unwrap();
        let arbiter = SourceArbiter::new(store.clone(), std::time::Duration::from_secs(60));
        (dir, store, arbiter)
    }

    fn aged(t: f64, source: Source, seconds_ago: i64) -> Measurement {
        Measurement {
            temperature: t,
            humidity: 40.0,
            timestamp: Utc::now() - Duration::seconds(seconds_ago),
            source,
            raw: None,
        }
    }

    #[tokio::test]
    async fn fresh_remote_wins_over_newer_local() {
        let (_dir, _store, arbiter) = arbiter().await;
        arbiter.record(aged(18.0, Source::Remote, 30));
        arbiter.record(aged(25.0, Source::Local, 1));

        let current = arbiter.current().await.unwrap().unwrap();
        assert_eq!(current.method, Source::Remote);
        assert_eq!(current.reading.temperature, 18.0);
    }

    #[tokio::test]
    async fn stale_remote_yields_to_local() {
        let (_dir, _store, arbiter) = arbiter().await;
        arbiter.record(aged(18.0, Source::Remote, 120));
        arbiter.record(aged(25.0, Source::Local, 1));

        let current = arbiter.current().await.unwrap().unwrap();
        assert_eq!(current.method, Source::Local);
        assert_eq!(current.reading.temperature, 25.0);
    }

    #[tokio::test]
    async fn future_stamped_remote_does_not_hide_local() {
        let (_dir, _store, arbiter) = arbiter().await;
        arbiter.record(aged(10.0, Source::Remote, -365 * 24 * 3600));
        arbiter.record(aged(25.0, Source::Local, 1));

        let current = arbiter.current().await.unwrap().unwrap();
        assert_eq!(current.method, Source::Local);
        assert_eq!(current.reading.temperature, 25.0);
    }

    #[tokio::test]
    async fn slightly_early_remote_still_counts_as_fresh() {
        let (_dir, _store, arbiter) = arbiter().await;
        arbiter.record(aged(18.0, Source::Remote, -5));
        arbiter.record(aged(25.0, Source::Local, 1));

        let current = arbiter.current().await.unwrap().unwrap();
        assert_eq!(current.method, Source::Remote);
    }

    #[tokio::test]
    async fn stale_remote_alone_falls_through_to_store() {
        let (_dir, store, arbiter) = arbiter().await;
        store.append(&aged(30.0, Source::Remote, 500)).await.unwrap();
        arbiter.record(aged(18.0, Source::Remote, 120));

        let current = arbiter.current().await.unwrap().unwrap();
        assert_eq!(current.method, Source::Persisted);
        assert_eq!(current.reading.temperature, 30.0);
    }

    #[tokio::test]
    async fn empty_memory_uses_persisted_row() {
        let (_dir, store, arbiter) = arbiter().await;
        store.append(&aged(21.0, Source::Local, 3600)).await.unwrap();

        let current = arbiter.current().await.unwrap().unwrap();
        assert_eq!(current.method, Source::Persisted);
        assert_eq!(current.reading.temperature, 21.0);
    }

    #[tokio::test]
    async fn no_data_anywhere() {
        let (_dir, _store, arbiter) = arbiter().await;
        assert!(arbiter.current().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn later_record_supersedes_earlier() {
        let (_dir, _store, arbiter) = arbiter().await;
        arbiter.record(aged(18.0, Source::Remote, 5));
        arbiter.record(aged(19.0, Source::Remote, 0));

        let current = arbiter.current().await.unwrap().unwrap();
        assert_eq!(current.reading.temperature, 19.0);
    }
}
