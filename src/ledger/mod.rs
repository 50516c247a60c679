//! WAL-backed booking table with a per-bay exclusion constraint.
//!
//! The ledger is the final authority on double-booking: a blocking booking is
//! only written if no other blocking booking on the same bay overlaps it, and
//! that check runs under the bay's write lock.

mod writer;
#[cfg(test)]
mod tests;

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, RwLock};

use crate::engine::{BookingStore, EngineError};
use crate::limits::*;
use crate::model::*;
use crate::notify::NotifyHub;
use crate::wal::Wal;

use writer::{wal_writer_loop, WalCommand};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerEntry {
    pub occupancy: BookingOccupancy,
    pub label: Option<String>,
}

/// All bookings of one bay, sorted by scheduled start.
#[derive(Debug, Default)]
pub struct BayLedger {
    entries: Vec<LedgerEntry>,
}

impl BayLedger {
    fn insert(&mut self, entry: LedgerEntry) {
        let start = entry.occupancy.scheduled.start();
        let pos = self
            .entries
            .partition_point(|e| e.occupancy.scheduled.start() <= start);
        self.entries.insert(pos, entry);
    }

    fn remove(&mut self, id: BookingId) -> Option<LedgerEntry> {
        let pos = self.entries.iter().position(|e| e.occupancy.booking_id == id)?;
        Some(self.entries.remove(pos))
    }

    fn get(&self, id: BookingId) -> Option<&LedgerEntry> {
        self.entries.iter().find(|e| e.occupancy.booking_id == id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries whose scheduled range overlaps `query`, any status.
    pub fn overlapping(&self, query: &TimeRange) -> impl Iterator<Item = &LedgerEntry> {
        // Everything at index >= right_bound starts at or after query.end → can't overlap.
        let right_bound = self
            .entries
            .partition_point(|e| e.occupancy.scheduled.start() < query.end());
        self.entries[..right_bound]
            .iter()
            .filter(move |e| e.occupancy.scheduled.end() > query.start())
    }

    /// Blocking bookings other than `except` that overlap `range`.
    fn blocking_conflicts(&self, range: &TimeRange, except: Option<BookingId>) -> Vec<BookingOccupancy> {
        self.overlapping(range)
            .filter(|e| e.occupancy.is_blocking() && Some(e.occupancy.booking_id) != except)
            .map(|e| e.occupancy.clone())
            .collect()
    }

    fn apply(&mut self, event: &LedgerEvent) {
        match event {
            LedgerEvent::BookingRecorded { occupancy, label } => self.insert(LedgerEntry {
                occupancy: occupancy.clone(),
                label: label.clone(),
            }),
            LedgerEvent::StatusChanged {
                booking_id, status, ..
            } => {
                if let Some(entry) = self.entries.iter_mut().find(|e| e.occupancy.booking_id == *booking_id) {
                    entry.occupancy.status = *status;
                }
            }
            LedgerEvent::BookingRescheduled {
                booking_id, scheduled, ..
            } => {
                if let Some(mut entry) = self.remove(*booking_id) {
                    entry.occupancy.scheduled = *scheduled;
                    self.insert(entry);
                }
            }
        }
    }
}

type SharedBayLedger = Arc<RwLock<BayLedger>>;

pub struct Ledger {
    bays: DashMap<BayId, SharedBayLedger>,
    /// Reverse lookup: booking id → bay id
    booking_to_bay: DashMap<BookingId, BayId>,
    wal_tx: mpsc::Sender<WalCommand>,
    notify: Arc<NotifyHub>,
}

impl Ledger {
    /// Replay `wal_path` and start the group-commit writer. Must run inside a Tokio runtime.
    pub fn open(wal_path: PathBuf, notify: Arc<NotifyHub>) -> std::io::Result<Self> {
        let (wal, events) = Wal::recover(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let ledger = Self {
            bays: DashMap::new(),
            booking_to_bay: DashMap::new(),
            wal_tx,
            notify,
        };

        // Sole owner of every lock here, so try_write never contends. Never use
        // blocking_write: this may run inside an async context.
        for event in &events {
            let bay = ledger.bay_entry(event.bay_id());
            let mut guard = bay.try_write().expect("replay: uncontended write");
            ledger.index(event);
            guard.apply(event);
        }
        tracing::info!(
            "ledger opened: {} events replayed, {} bookings on {} bays",
            events.len(),
            ledger.booking_to_bay.len(),
            ledger.bays.len()
        );

        Ok(ledger)
    }

    pub fn notify(&self) -> &Arc<NotifyHub> {
        &self.notify
    }

    fn bay_entry(&self, bay_id: BayId) -> SharedBayLedger {
        self.bays.entry(bay_id).or_default().value().clone()
    }

    fn index(&self, event: &LedgerEvent) {
        if let LedgerEvent::BookingRecorded { occupancy, .. } = event {
            self.booking_to_bay.insert(occupancy.booking_id, occupancy.bay_id);
        }
    }

    async fn wal_append(&self, event: &LedgerEvent) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    /// WAL-append + apply + notify. Caller holds the bay's write lock.
    async fn persist_and_apply(&self, bay: &mut BayLedger, event: LedgerEvent) -> Result<(), EngineError> {
        self.wal_append(&event).await?;
        self.index(&event);
        bay.apply(&event);
        self.notify.send(&event);
        Ok(())
    }

    async fn resolve_booking_write(
        &self,
        booking_id: BookingId,
    ) -> Result<tokio::sync::OwnedRwLockWriteGuard<BayLedger>, EngineError> {
        let bay_id = self
            .booking_to_bay
            .get(&booking_id)
            .map(|e| *e.value())
            .ok_or(EngineError::NotFound(booking_id))?;
        let bay = self
            .bays
            .get(&bay_id)
            .map(|e| e.value().clone())
            .ok_or(EngineError::NotFound(bay_id))?;
        Ok(bay.write_owned().await)
    }

    /// Persist a new booking. Blocking bookings must not overlap another blocking booking.
    pub async fn record_booking(&self, occupancy: BookingOccupancy, label: Option<String>) -> Result<(), EngineError> {
        validate_range(&occupancy.scheduled)?;
        if let Some(ref l) = label
            && l.len() > MAX_LABEL_LEN {
                return Err(EngineError::LimitExceeded("label too long"));
            }

        let bay = self.bay_entry(occupancy.bay_id);
        let mut guard = bay.write().await;
        if self.booking_to_bay.contains_key(&occupancy.booking_id) {
            return Err(EngineError::AlreadyExists(occupancy.booking_id));
        }
        if guard.len() >= MAX_BOOKINGS_PER_BAY {
            return Err(EngineError::LimitExceeded("too many bookings on bay"));
        }
        if occupancy.is_blocking() {
            let conflicts = guard.blocking_conflicts(&occupancy.scheduled, None);
            if !conflicts.is_empty() {
                return Err(EngineError::SlotConflict { conflicts });
            }
        }

        let event = LedgerEvent::BookingRecorded { occupancy, label };
        self.persist_and_apply(&mut guard, event).await
    }

    /// Move a booking into `status`. Re-entering the blocking set re-checks the constraint.
    pub async fn set_status(&self, booking_id: BookingId, status: BookingStatus) -> Result<BookingOccupancy, EngineError> {
        let mut guard = self.resolve_booking_write(booking_id).await?;
        let current = guard
            .get(booking_id)
            .map(|e| e.occupancy.clone())
            .ok_or(EngineError::NotFound(booking_id))?;
        if current.status == status {
            return Ok(current);
        }
        if status.is_blocking() && !current.is_blocking() {
            let conflicts = guard.blocking_conflicts(&current.scheduled, Some(booking_id));
            if !conflicts.is_empty() {
                return Err(EngineError::SlotConflict { conflicts });
            }
        }

        let event = LedgerEvent::StatusChanged {
            booking_id,
            bay_id: current.bay_id,
            scheduled: current.scheduled,
            status,
        };
        self.persist_and_apply(&mut guard, event).await?;
        Ok(BookingOccupancy { status, ..current })
    }

    pub async fn cancel(&self, booking_id: BookingId) -> Result<BookingOccupancy, EngineError> {
        self.set_status(booking_id, BookingStatus::Cancelled).await
    }

    /// Move a booking to `scheduled` on the same bay.
    pub async fn reschedule(&self, booking_id: BookingId, scheduled: TimeRange) -> Result<BookingOccupancy, EngineError> {
        validate_range(&scheduled)?;
        let mut guard = self.resolve_booking_write(booking_id).await?;
        let current = guard
            .get(booking_id)
            .map(|e| e.occupancy.clone())
            .ok_or(EngineError::NotFound(booking_id))?;
        if current.scheduled == scheduled {
            return Ok(current);
        }
        if current.is_blocking() {
            let conflicts = guard.blocking_conflicts(&scheduled, Some(booking_id));
            if !conflicts.is_empty() {
                return Err(EngineError::SlotConflict { conflicts });
            }
        }

        let event = LedgerEvent::BookingRescheduled {
            booking_id,
            bay_id: current.bay_id,
            previous: current.scheduled,
            scheduled,
        };
        self.persist_and_apply(&mut guard, event).await?;
        Ok(BookingOccupancy { scheduled, ..current })
    }

    pub async fn get(&self, booking_id: BookingId) -> Option<LedgerEntry> {
        let bay_id = *self.booking_to_bay.get(&booking_id)?.value();
        let bay = self.bays.get(&bay_id)?.value().clone();
        let guard = bay.read().await;
        guard.get(booking_id).cloned()
    }

    pub async fn bookings(&self, bay_id: BayId) -> Vec<LedgerEntry> {
        let Some(bay) = self.bays.get(&bay_id).map(|e| e.value().clone()) else {
            return Vec::new();
        };
        let guard = bay.read().await;
        guard.entries.clone()
    }

    /// Rewrite the WAL with one `BookingRecorded` per booking in its current state.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let bays: Vec<SharedBayLedger> = self.bays.iter().map(|e| e.value().clone()).collect();
        let mut events = Vec::with_capacity(self.booking_to_bay.len());
        for bay in bays {
            let guard = bay.read().await;
            events.extend(guard.entries.iter().map(|e| LedgerEvent::BookingRecorded {
                occupancy: e.occupancy.clone(),
                label: e.label.clone(),
            }));
        }

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}

#[async_trait]
impl BookingStore for Ledger {
    async fn list_occupancies(&self, bay_id: BayId, range: TimeRange) -> Result<Vec<BookingOccupancy>, EngineError> {
        let Some(bay) = self.bays.get(&bay_id).map(|e| e.value().clone()) else {
            return Ok(Vec::new());
        };
        let guard = bay.read().await;
        Ok(guard.overlapping(&range).map(|e| e.occupancy.clone()).collect())
    }
}

fn validate_range(range: &TimeRange) -> Result<(), EngineError> {
    if range.start() < MIN_VALID_TIMESTAMP_MS || range.end() > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    if range.duration_ms() > MAX_RESERVATION_DURATION_MS {
        return Err(EngineError::LimitExceeded("booking too long"));
    }
    Ok(())
}
