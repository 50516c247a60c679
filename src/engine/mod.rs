mod availability;
mod busy;
mod cache;
mod error;
mod guard;
mod materializer;

pub use availability::compute_availability;
pub use busy::{blocking_occupancies, BookingStore, BusySet, BusySetBuilder};
pub use cache::{run_invalidation_listener, AvailabilityCache};
pub use error::EngineError;
pub use guard::ReservationGuard;
pub use materializer::{duration_until, run_materializer, MaterializationReport};

use std::sync::Arc;

use chrono::NaiveDate;

use crate::clock::Clock;
use crate::config::EngineConfig;
use crate::model::*;
use crate::schedule::{BranchCalendar, ScheduleStore, WorkingHoursResolver};

/// Availability and reservation core for one branch timezone.
///
/// Reads go through the per-(bay, date) cache; reservations go through the
/// per-(bay, date) guard. Both key on the branch-local date.
pub struct Engine {
    config: EngineConfig,
    clock: Arc<dyn Clock>,
    resolver: WorkingHoursResolver,
    busy: BusySetBuilder,
    guard: ReservationGuard,
    cache: AvailabilityCache,
}

impl Engine {
    pub fn new(
        config: EngineConfig,
        schedule: Arc<dyn ScheduleStore>,
        bookings: Arc<dyn BookingStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let calendar = BranchCalendar::new(config.timezone);
        Self {
            resolver: WorkingHoursResolver::new(schedule, calendar),
            busy: BusySetBuilder::new(bookings, config.store_timeout),
            guard: ReservationGuard::new(),
            cache: AvailabilityCache::new(),
            clock,
            config,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn calendar(&self) -> &BranchCalendar {
        self.resolver.calendar()
    }

    pub fn now(&self) -> Ms {
        self.clock.now_ms()
    }

    /// Branch-local date of the clock's current instant.
    pub fn today(&self) -> Result<NaiveDate, EngineError> {
        let now = self.now();
        self.calendar()
            .date_of(now)
            .ok_or_else(|| EngineError::InvalidRange(format!("clock instant {now} has no calendar date")))
    }

    /// Drop the cached availability for one (bay, date); the next read recomputes.
    pub fn invalidate(&self, bay_id: BayId, date: NaiveDate) {
        self.invalidate_key(SlotKey::new(bay_id, date), "explicit");
    }

    pub(crate) fn invalidate_key(&self, key: SlotKey, cause: &'static str) {
        self.cache.invalidate(key);
        metrics::counter!(crate::observability::CACHE_INVALIDATIONS_TOTAL, "cause" => cause).increment(1);
    }

    pub fn cached(&self, bay_id: BayId, date: NaiveDate) -> Option<Arc<AvailabilityResult>> {
        self.cache.get(&SlotKey::new(bay_id, date), self.now())
    }

    /// Holds granted and not yet expired, completed or released.
    pub fn active_holds(&self) -> usize {
        self.guard.active_count(self.now())
    }

    // ── Horizon ──────────────────────────────────────────────────

    /// Reads may look back as far as they look ahead.
    fn check_query_horizon(&self, date: NaiveDate) -> Result<(), EngineError> {
        let today = self.today()?;
        let days = i64::from(self.config.horizon_days);
        let offset = (date - today).num_days();
        if offset.abs() > days {
            return Err(EngineError::InvalidRange(format!(
                "{date} is more than {days} days from {today}"
            )));
        }
        Ok(())
    }

    fn check_reserve_horizon(&self, date: NaiveDate) -> Result<(), EngineError> {
        let today = self.today()?;
        if date < today {
            return Err(EngineError::InvalidRange(format!("{date} is in the past")));
        }
        let days = i64::from(self.config.horizon_days);
        if (date - today).num_days() > days {
            return Err(EngineError::InvalidRange(format!(
                "{date} is more than {days} days ahead of {today}"
            )));
        }
        Ok(())
    }
}
