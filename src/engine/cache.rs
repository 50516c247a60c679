use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::NaiveDate;
use dashmap::DashMap;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::model::*;

use super::Engine;

struct CacheSlot {
    epoch: u64,
    result: Option<Arc<AvailabilityResult>>,
}

/// Per-(bay, date) availability results.
///
/// Every invalidation stamps the key with a fresh epoch. A writer reads the
/// epoch before computing and only stores if it is unchanged, so a result
/// computed from pre-invalidation data can never overwrite the invalidation.
/// A key's effective epoch is never below the last `clear`, which also covers
/// keys that had no entry when the cache was cleared.
pub struct AvailabilityCache {
    entries: DashMap<SlotKey, CacheSlot>,
    next_epoch: AtomicU64,
    cleared_at: AtomicU64,
}

impl Default for AvailabilityCache {
    fn default() -> Self {
        Self::new()
    }
}

impl AvailabilityCache {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
            next_epoch: AtomicU64::new(1),
            cleared_at: AtomicU64::new(0),
        }
    }

    /// The cached result, unless one of the holds folded into it has lapsed by `now`.
    pub fn get(&self, key: &SlotKey, now: Ms) -> Option<Arc<AvailabilityResult>> {
        self.entries
            .get(key)
            .and_then(|slot| slot.result.clone())
            .filter(|result| result.is_fresh(now))
    }

    /// 0 for a key that was never invalidated or cleared.
    pub fn epoch(&self, key: &SlotKey) -> u64 {
        let own = self.entries.get(key).map(|slot| slot.epoch).unwrap_or(0);
        own.max(self.cleared_at.load(Ordering::SeqCst))
    }

    /// Store `result` unless `key` was invalidated or the cache cleared after `epoch` was read.
    pub fn store_if_current(&self, key: SlotKey, epoch: u64, result: Arc<AvailabilityResult>) -> bool {
        let mut slot = self.entries.entry(key).or_insert(CacheSlot { epoch: 0, result: None });
        if slot.epoch.max(self.cleared_at.load(Ordering::SeqCst)) != epoch {
            return false;
        }
        slot.result = Some(result);
        true
    }

    /// Drop the cached result and advance the epoch, even when nothing is cached.
    pub fn invalidate(&self, key: SlotKey) {
        let epoch = self.next_epoch.fetch_add(1, Ordering::Relaxed);
        self.entries.insert(key, CacheSlot { epoch, result: None });
    }

    /// Forget every key dated before `date`.
    pub fn prune_before(&self, date: NaiveDate) -> usize {
        let before = self.entries.len();
        self.entries.retain(|key, _| key.date >= date);
        before - self.entries.len()
    }

    /// Invalidate every key, including ones with a computation in flight but no entry yet.
    pub fn clear(&self) {
        let generation = self.next_epoch.fetch_add(1, Ordering::SeqCst);
        self.cleared_at.store(generation, Ordering::SeqCst);
        let keys: Vec<SlotKey> = self.entries.iter().map(|e| *e.key()).collect();
        for key in keys {
            self.invalidate(key);
        }
    }

    /// Number of keys holding a result.
    pub fn len(&self) -> usize {
        self.entries.iter().filter(|e| e.result.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Engine {
    /// Invalidate every cached date a ledger event can have changed.
    pub fn invalidate_event(&self, event: &LedgerEvent) {
        let bay_id = event.bay_id();
        let calendar = self.resolver.calendar();
        for range in event.touched_ranges() {
            for date in calendar.dates_touched(&range) {
                self.invalidate_key(SlotKey::new(bay_id, date), "booking_event");
            }
        }
    }
}

/// Follow ledger events and invalidate the affected cache keys until cancelled.
/// A lagged receiver has missed events, so everything is invalidated.
pub async fn run_invalidation_listener(
    engine: Arc<Engine>,
    mut events: broadcast::Receiver<LedgerEvent>,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            received = events.recv() => match received {
                Ok(event) => engine.invalidate_event(&event),
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    tracing::warn!("invalidation listener lagged by {missed} events, clearing cache");
                    engine.cache.clear();
                    metrics::counter!(crate::observability::CACHE_INVALIDATIONS_TOTAL, "cause" => "lagged").increment(1);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }
    tracing::debug!("invalidation listener stopped");
}
