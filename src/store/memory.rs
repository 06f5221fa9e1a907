//! In-process counter store.
//!
//! Gives single-instance deployments and tests the same semantics as the
//! Redis adapter: atomic per-key increments, NX per-field expiry or refreshed
//! whole-key expiry, and `None` for missing fields.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::debug;

use super::{CounterBatch, CounterStore, ExpiryMode};
use crate::error::StoreError;
use crate::ratelimit::Clock;

#[derive(Debug, Default)]
struct FieldEntry {
    count: u64,
    expires_at_ms: Option<u64>,
}

#[derive(Debug, Default)]
struct HashEntry {
    fields: HashMap<String, FieldEntry>,
    expires_at_ms: Option<u64>,
}

impl HashEntry {
    fn is_expired(&self, now_ms: u64) -> bool {
        self.expires_at_ms.is_some_and(|at| at <= now_ms)
    }

    fn purge_expired_fields(&mut self, now_ms: u64) {
        self.fields
            .retain(|_, field| field.expires_at_ms.map_or(true, |at| at > now_ms));
    }

    fn count_of(&self, field: &str) -> Option<u64> {
        self.fields.get(field).map(|f| f.count)
    }
}

/// Counter store held in a sharded concurrent map.
///
/// The shard lock taken by `DashMap::entry` covers the whole batch, so an
/// increment and the reads that follow it are applied as one step.
///
/// Expired keys and fields are swept at most once per bucket TTL, by
/// whichever increment first finds the sweep due. Clients that never return
/// are dropped within two TTLs of their last write.
#[derive(Debug, Clone)]
pub struct MemoryCounterStore {
    entries: Arc<DashMap<String, HashEntry>>,
    clock: Arc<dyn Clock>,
    next_sweep_ms: Arc<AtomicU64>,
}

impl MemoryCounterStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
            clock,
            next_sweep_ms: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Number of live bucket fields stored under `key`.
    pub fn live_fields(&self, key: &str) -> usize {
        let now_ms = self.clock.now_millis();
        self.entries
            .get(key)
            .filter(|entry| !entry.is_expired(now_ms))
            .map(|entry| {
                entry
                    .fields
                    .values()
                    .filter(|f| f.expires_at_ms.map_or(true, |at| at > now_ms))
                    .count()
            })
            .unwrap_or(0)
    }

    /// Sum of every live bucket under `key`, regardless of window.
    pub fn total_count(&self, key: &str) -> u64 {
        let now_ms = self.clock.now_millis();
        self.entries
            .get(key)
            .filter(|entry| !entry.is_expired(now_ms))
            .map(|entry| {
                entry
                    .fields
                    .values()
                    .filter(|f| f.expires_at_ms.map_or(true, |at| at > now_ms))
                    .map(|f| f.count)
                    .sum()
            })
            .unwrap_or(0)
    }

    /// Drop expired keys and fields.
    pub fn purge_expired(&self) {
        self.purge_at(self.clock.now_millis());
    }

    fn purge_at(&self, now_ms: u64) {
        let before = self.entries.len();
        self.entries.retain(|_, entry| {
            if entry.is_expired(now_ms) {
                return false;
            }
            entry.purge_expired_fields(now_ms);
            !entry.fields.is_empty()
        });

        let removed = before.saturating_sub(self.entries.len());
        if removed > 0 {
            debug!(removed, remaining = self.entries.len(), "Purged expired counters");
        }
    }

    /// Sweep the whole map if the last sweep is at least `interval_ms` old.
    ///
    /// Must not be called while holding a reference into `entries`.
    fn sweep_if_due(&self, now_ms: u64, interval_ms: u64) {
        let due_ms = self.next_sweep_ms.load(Ordering::Acquire);
        if now_ms < due_ms {
            return;
        }
        let next_ms = now_ms.saturating_add(interval_ms);
        if self
            .next_sweep_ms
            .compare_exchange(due_ms, next_ms, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            self.purge_at(now_ms);
        }
    }

    /// Number of client keys currently held.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl CounterStore for MemoryCounterStore {
    async fn record_and_read(&self, batch: &CounterBatch) -> Result<Vec<Option<u64>>, StoreError> {
        let now_ms = self.clock.now_millis();
        let ttl_ms = batch.ttl.as_millis() as u64;
        self.sweep_if_due(now_ms, ttl_ms);

        let mut entry = self.entries.entry(batch.key.clone()).or_default();
        if entry.is_expired(now_ms) {
            *entry = HashEntry::default();
        }
        entry.purge_expired_fields(now_ms);

        let field = entry.fields.entry(batch.field.clone()).or_default();
        field.count = field.count.saturating_add(batch.increment);

        match batch.expiry {
            ExpiryMode::Field => {
                if field.expires_at_ms.is_none() {
                    field.expires_at_ms = Some(now_ms + ttl_ms);
                }
            }
            ExpiryMode::Key => {
                entry.expires_at_ms = Some(now_ms + ttl_ms);
            }
        }

        Ok(batch.reads.iter().map(|f| entry.count_of(f)).collect())
    }

    async fn read(&self, key: &str, fields: &[String]) -> Result<Vec<Option<u64>>, StoreError> {
        let now_ms = self.clock.now_millis();
        let values = match self.entries.get(key) {
            Some(entry) if !entry.is_expired(now_ms) => fields
                .iter()
                .map(|f| {
                    entry
                        .fields
                        .get(f)
                        .filter(|field| field.expires_at_ms.map_or(true, |at| at > now_ms))
                        .map(|field| field.count)
                })
                .collect(),
            _ => vec![None; fields.len()],
        };
        Ok(values)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::ManualClock;
    use std::time::Duration;

    fn batch(field: &str, reads: &[&str], expiry: ExpiryMode) -> CounterBatch {
        CounterBatch {
            key: "rate_limit:abc".to_string(),
            field: field.to_string(),
            increment: 1,
            ttl: Duration::from_secs(60),
            expiry,
            reads: reads.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[tokio::test]
    async fn test_increment_then_read() {
        let clock = ManualClock::new(0);
        let store = MemoryCounterStore::new(Arc::new(clock));

        let values = store
            .record_and_read(&batch("12", &["12", "11"], ExpiryMode::Field))
            .await
            .unwrap();
        assert_eq!(values, vec![Some(1), None]);

        let values = store
            .record_and_read(&batch("12", &["12", "11"], ExpiryMode::Field))
            .await
            .unwrap();
        assert_eq!(values, vec![Some(2), None]);
    }

    #[tokio::test]
    async fn test_field_expiry_is_pinned_on_first_write() {
        let clock = ManualClock::new(0);
        let store = MemoryCounterStore::new(Arc::new(clock.clone()));

        store
            .record_and_read(&batch("0", &[], ExpiryMode::Field))
            .await
            .unwrap();
        clock.advance(Duration::from_secs(30));
        store
            .record_and_read(&batch("0", &[], ExpiryMode::Field))
            .await
            .unwrap();

        // Expires 60s after the first write, not the second.
        clock.set(60_000);
        let values = store
            .read("rate_limit:abc", &["0".to_string()])
            .await
            .unwrap();
        assert_eq!(values, vec![None]);
    }

    #[tokio::test]
    async fn test_field_expiry_is_independent_per_field() {
        let clock = ManualClock::new(0);
        let store = MemoryCounterStore::new(Arc::new(clock.clone()));

        store
            .record_and_read(&batch("0", &[], ExpiryMode::Field))
            .await
            .unwrap();
        clock.set(40_000);
        store
            .record_and_read(&batch("4", &[], ExpiryMode::Field))
            .await
            .unwrap();

        clock.set(61_000);
        let values = store
            .read("rate_limit:abc", &["0".to_string(), "4".to_string()])
            .await
            .unwrap();
        assert_eq!(values, vec![None, Some(1)]);
        assert_eq!(store.live_fields("rate_limit:abc"), 1);
    }

    #[tokio::test]
    async fn test_key_expiry_refreshes_on_each_increment() {
        let clock = ManualClock::new(0);
        let store = MemoryCounterStore::new(Arc::new(clock.clone()));

        store
            .record_and_read(&batch("0", &[], ExpiryMode::Key))
            .await
            .unwrap();
        clock.set(50_000);
        store
            .record_and_read(&batch("5", &[], ExpiryMode::Key))
            .await
            .unwrap();

        // Bucket 0 outlives its own window while the key stays busy.
        clock.set(100_000);
        let values = store
            .read("rate_limit:abc", &["0".to_string(), "5".to_string()])
            .await
            .unwrap();
        assert_eq!(values, vec![Some(1), Some(1)]);

        clock.set(110_000);
        let values = store
            .read("rate_limit:abc", &["5".to_string()])
            .await
            .unwrap();
        assert_eq!(values, vec![None]);
    }

    #[tokio::test]
    async fn test_purge_expired() {
        let clock = ManualClock::new(0);
        let store = MemoryCounterStore::new(Arc::new(clock.clone()));

        store
            .record_and_read(&batch("0", &[], ExpiryMode::Field))
            .await
            .unwrap();
        assert_eq!(store.len(), 1);

        clock.advance(Duration::from_secs(61));
        store.purge_expired();
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_idle_clients_are_swept_by_later_traffic() {
        let clock = ManualClock::new(0);
        let store = MemoryCounterStore::new(Arc::new(clock.clone()));

        for hour in 0..5 {
            for client in 0..1000 {
                let mut b = batch("0", &[], ExpiryMode::Field);
                b.key = format!("rate_limit:{}:{}", hour, client);
                store.record_and_read(&b).await.unwrap();
            }
            assert!(store.len() <= 1001, "hour {}: {} keys held", hour, store.len());

            clock.advance(Duration::from_secs(3600));
            store
                .record_and_read(&batch("0", &[], ExpiryMode::Field))
                .await
                .unwrap();
            assert_eq!(store.len(), 1, "hour {}", hour);
        }
    }

    #[tokio::test]
    async fn test_sweep_runs_at_most_once_per_ttl() {
        let clock = ManualClock::new(0);
        let store = MemoryCounterStore::new(Arc::new(clock.clone()));

        let mut idle = batch("0", &[], ExpiryMode::Field);
        idle.key = "rate_limit:idle".to_string();
        store.record_and_read(&idle).await.unwrap();

        // Expired, but the next sweep is not due until 60s.
        clock.set(59_000);
        let mut early = batch("0", &[], ExpiryMode::Field);
        early.ttl = Duration::from_secs(1);
        store.record_and_read(&early).await.unwrap();
        assert_eq!(store.len(), 2);

        clock.set(60_000);
        store
            .record_and_read(&batch("1", &[], ExpiryMode::Field))
            .await
            .unwrap();
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_sweep_drops_expired_whole_keys() {
        let clock = ManualClock::new(0);
        let store = MemoryCounterStore::new(Arc::new(clock.clone()));

        let mut idle = batch("0", &[], ExpiryMode::Key);
        idle.key = "rate_limit:idle".to_string();
        store.record_and_read(&idle).await.unwrap();

        clock.set(120_000);
        store
            .record_and_read(&batch("12", &[], ExpiryMode::Key))
            .await
            .unwrap();
        assert_eq!(store.len(), 1);
        assert_eq!(store.total_count("rate_limit:idle"), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_increments_are_not_lost() {
        let clock = ManualClock::new(0);
        let store = MemoryCounterStore::new(Arc::new(clock));

        let tasks: Vec<_> = (0..200)
            .map(|_| {
                let store = store.clone();
                tokio::spawn(async move {
                    store
                        .record_and_read(&batch("0", &["0"], ExpiryMode::Field))
                        .await
                        .unwrap()
                })
            })
            .collect();

        let mut seen: Vec<u64> = Vec::new();
        for task in tasks {
            seen.push(task.await.unwrap()[0].unwrap());
        }
        seen.sort_unstable();

        assert_eq!(store.total_count("rate_limit:abc"), 200);
        assert_eq!(seen, (1..=200).collect::<Vec<u64>>());
    }
}
