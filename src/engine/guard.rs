use std::sync::Arc;

use chrono::NaiveDate;
use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::debug;
use ulid::Ulid;

use crate::interval;
use crate::limits::*;
use crate::model::*;

use super::{Engine, EngineError};

pub type SharedHolds = Arc<Mutex<Vec<ReservationToken>>>;

/// Per-(bay, date) critical sections and the holds granted under them.
///
/// The mutex for a key guards that key's hold list; holding it is what makes
/// check-then-reserve atomic. Unrelated keys never share a lock.
#[derive(Default)]
pub struct ReservationGuard {
    slots: DashMap<SlotKey, SharedHolds>,
    /// token -> (key, expires_at). Outlives the hold itself so a late
    /// `complete` can tell an expired token from an unknown one.
    token_to_slot: DashMap<Ulid, (SlotKey, Ms)>,
}

impl ReservationGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// The critical section for `key`, created on first use.
    pub fn slot(&self, key: SlotKey) -> SharedHolds {
        self.slots.entry(key).or_default().clone()
    }

    pub fn slot_of(&self, token_id: &Ulid) -> Option<SlotKey> {
        self.token_to_slot.get(token_id).map(|e| e.0)
    }

    /// Unexpired holds on `key`. Waits for an in-flight reservation on the same key.
    pub async fn live_holds(&self, key: &SlotKey, now: Ms) -> Vec<ReservationToken> {
        let Some(slot) = self.slots.get(key).map(|e| e.clone()) else {
            return Vec::new();
        };
        let holds = slot.lock().await;
        holds.iter().filter(|t| t.is_live(now)).cloned().collect()
    }

    /// Expired tokens across every key. Keys whose lock is busy are skipped
    /// and picked up on the next sweep.
    pub fn collect_expired(&self, now: Ms) -> Vec<(Ulid, SlotKey)> {
        let mut expired = Vec::new();
        for entry in self.slots.iter() {
            if let Ok(holds) = entry.value().try_lock() {
                expired.extend(
                    holds
                        .iter()
                        .filter(|t| !t.is_live(now))
                        .map(|t| (t.id, t.key())),
                );
            }
        }
        expired
    }

    /// Number of unexpired tokens.
    pub fn active_count(&self, now: Ms) -> usize {
        self.token_to_slot.iter().filter(|e| e.value().1 > now).count()
    }

    /// Drop expired holds from a locked list. Their index entries stay until
    /// [`forget_expired_before`](Self::forget_expired_before).
    fn prune(&self, holds: &mut Vec<ReservationToken>, now: Ms) -> usize {
        let before = holds.len();
        holds.retain(|t| t.is_live(now));
        before - holds.len()
    }

    /// Drop index entries of tokens that expired before `cutoff`.
    pub fn forget_expired_before(&self, cutoff: Ms) {
        self.token_to_slot.retain(|_, (_, expires_at)| *expires_at >= cutoff);
    }

    /// Remove one token from its slot. An already pruned token that is still
    /// indexed comes back as `TokenExpired`.
    async fn take(&self, token_id: Ulid) -> Result<ReservationToken, EngineError> {
        let key = self.slot_of(&token_id).ok_or(EngineError::NotFound(token_id))?;
        let slot = self.slot(key);
        let mut holds = slot.lock().await;
        let pos = holds.iter().position(|t| t.id == token_id);
        self.token_to_slot.remove(&token_id);
        match pos {
            Some(pos) => Ok(holds.remove(pos)),
            None => Err(EngineError::TokenExpired(token_id)),
        }
    }

    /// Drop slot entries with no holds left and no other users.
    pub fn shrink(&self) {
        self.slots.retain(|_, slot| {
            Arc::strong_count(slot) > 1 || slot.try_lock().map(|h| !h.is_empty()).unwrap_or(true)
        });
    }
}

impl Engine {
    /// Check a requested range against working hours and current occupancy and,
    /// if free, grant a short-lived hold on it.
    pub async fn reserve(&self, bay_id: BayId, date: NaiveDate, start: Ms, end: Ms) -> ReservationDecision {
        let decision = match self.try_reserve(bay_id, date, start, end).await {
            Ok(token) => {
                debug!("reserved {}..{} on {bay_id}@{date} as {}", start, end, token.id);
                metrics::counter!(crate::observability::RESERVATIONS_TOTAL, "outcome" => "accept").increment(1);
                ReservationDecision::Accept(token)
            }
            Err(e) => {
                debug!("rejected {}..{} on {bay_id}@{date}: {e}", start, end);
                let label = crate::observability::rejection_label(&e);
                metrics::counter!(crate::observability::RESERVATIONS_TOTAL, "outcome" => label).increment(1);
                ReservationDecision::Reject(e)
            }
        };
        metrics::gauge!(crate::observability::HOLDS_ACTIVE).set(self.guard.active_count(self.now()) as f64);
        decision
    }

    async fn try_reserve(&self, bay_id: BayId, date: NaiveDate, start: Ms, end: Ms) -> Result<ReservationToken, EngineError> {
        let requested = TimeRange::new(start, end)?;
        if requested.duration_ms() > MAX_RESERVATION_DURATION_MS {
            return Err(EngineError::InvalidRange(format!(
                "reservation of {} ms exceeds the {} ms maximum",
                requested.duration_ms(),
                MAX_RESERVATION_DURATION_MS
            )));
        }
        self.check_reserve_horizon(date)?;
        let day = self.calendar().day_range(date)?;
        if !day.contains_range(&requested) {
            return Err(EngineError::InvalidRange(format!("range {start}..{end} is not within {date}")));
        }
        if start < self.now() {
            return Err(EngineError::InvalidRange(format!("range {start}..{end} starts in the past")));
        }

        let windows = self.resolver.resolve(bay_id, date)?;
        if !interval::covered_by(&requested, &windows) {
            return Err(EngineError::OutsideWorkingHours { requested });
        }

        let key = SlotKey::new(bay_id, date);
        let slot = self.guard.slot(key);
        let mut holds = slot.lock().await;
        let entered = std::time::Instant::now();

        // Authoritative occupancy, never from cache.
        let busy = self.busy.build(bay_id, day).await?;
        let conflicts = busy.conflicting(&requested);
        if !conflicts.is_empty() {
            return Err(EngineError::SlotConflict { conflicts });
        }

        let now = self.now();
        self.guard.prune(&mut holds, now);
        if holds.iter().any(|t| t.range.overlaps(&requested)) {
            return Err(EngineError::SlotConflict { conflicts: Vec::new() });
        }
        if holds.len() >= MAX_HOLDS_PER_SLOT {
            return Err(EngineError::LimitExceeded("too many outstanding reservations for this bay and date"));
        }

        let token = ReservationToken {
            id: Ulid::new(),
            bay_id,
            date,
            range: requested,
            expires_at: now + self.config.token_ttl_ms,
        };
        holds.push(token.clone());
        self.guard.token_to_slot.insert(token.id, (key, token.expires_at));
        drop(holds);

        metrics::histogram!(crate::observability::RESERVE_CRITICAL_SECTION_SECONDS)
            .record(entered.elapsed().as_secs_f64());
        self.invalidate_key(key, "reservation");
        Ok(token)
    }

    /// The booking for `token_id` has been persisted; drop the hold.
    pub async fn complete(&self, token_id: Ulid) -> Result<ReservationToken, EngineError> {
        let token = self.guard.take(token_id).await?;
        self.invalidate_key(token.key(), "reservation");
        if !token.is_live(self.now()) {
            return Err(EngineError::TokenExpired(token_id));
        }
        Ok(token)
    }

    /// Give a hold back without booking it.
    pub async fn release(&self, token_id: Ulid) -> Result<ReservationToken, EngineError> {
        let token = self.guard.take(token_id).await?;
        self.invalidate_key(token.key(), "reservation");
        Ok(token)
    }

    /// Sweep expired holds and invalidate their keys. Returns how many were dropped.
    pub async fn reap_expired_holds(&self) -> usize {
        let now = self.now();
        let mut reaped = 0;
        for (token_id, key) in self.guard.collect_expired(now) {
            let slot = self.guard.slot(key);
            let mut holds = slot.lock().await;
            let removed = self.guard.prune(&mut holds, now);
            drop(holds);
            if removed > 0 {
                debug!("reaped expired hold {token_id} on {key}");
                self.invalidate_key(key, "hold_expired");
                reaped += removed;
            }
        }
        self.guard.forget_expired_before(now - self.config.token_ttl_ms);
        self.guard.shrink();
        metrics::counter!(crate::observability::HOLDS_REAPED_TOTAL).increment(reaped as u64);
        metrics::gauge!(crate::observability::HOLDS_ACTIVE).set(self.guard.active_count(now) as f64);
        reaped
    }
}
