//! Working hours: configuration access and per-date resolution.
//!
//! Resolution order for a bay on a date:
//! 1. bay date override (an empty list closes the bay for the day)
//! 2. bay weekly hours for that weekday
//! 3. branch weekly hours for that weekday
//! 4. closed
//!
//! An unconfigured bay is closed, never open all day.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;

use chrono::{Datelike, NaiveDate, NaiveTime, TimeZone, Weekday};
use chrono_tz::Tz;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::config::ConfigError;
use crate::engine::EngineError;
use crate::limits::MAX_WINDOWS_PER_DAY;
use crate::model::*;

/// Wall-clock opening span in the branch timezone. A `close` of 00:00 means
/// the following midnight, so a window can run to the end of the day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalWindow {
    pub open: NaiveTime,
    pub close: NaiveTime,
}

impl LocalWindow {
    pub fn new(open: NaiveTime, close: NaiveTime) -> Self {
        Self { open, close }
    }
}

/// Weekday → windows. A missing weekday defers to the next level; an empty list means closed.
pub type WeeklyHours = HashMap<Weekday, Vec<LocalWindow>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BayInfo {
    pub id: BayId,
    pub branch_id: BranchId,
    pub active: bool,
}

/// Read access to branch/bay opening-hours configuration.
pub trait ScheduleStore: Send + Sync {
    fn bay(&self, bay_id: BayId) -> Option<BayInfo>;
    fn bay_override(&self, bay_id: BayId, date: NaiveDate) -> Option<Vec<LocalWindow>>;
    fn bay_weekly(&self, bay_id: BayId, weekday: Weekday) -> Option<Vec<LocalWindow>>;
    fn branch_weekly(&self, branch_id: BranchId, weekday: Weekday) -> Option<Vec<LocalWindow>>;
    fn active_bays(&self) -> Vec<BayId>;
}

// ── Branch calendar ──────────────────────────────────────────────

/// Maps branch-local dates and wall-clock times to instants.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BranchCalendar {
    tz: Tz,
}

impl BranchCalendar {
    pub fn new(tz: Tz) -> Self {
        Self { tz }
    }

    pub fn timezone(&self) -> Tz {
        self.tz
    }

    /// Local wall-clock time to instant. Times inside a DST gap or fold are rejected.
    pub fn local_instant(&self, date: NaiveDate, time: NaiveTime) -> Result<Ms, EngineError> {
        self.tz
            .from_local_datetime(&date.and_time(time))
            .single()
            .map(|dt| dt.timestamp_millis())
            .ok_or_else(|| {
                EngineError::InvalidRange(format!(
                    "{date} {time} is not a unique local time in {}",
                    self.tz
                ))
            })
    }

    /// `[local midnight, next local midnight)`.
    pub fn day_range(&self, date: NaiveDate) -> Result<TimeRange, EngineError> {
        let next = date
            .succ_opt()
            .ok_or_else(|| EngineError::InvalidRange(format!("{date} has no successor")))?;
        let start = self.local_instant(date, NaiveTime::MIN)?;
        let end = self.local_instant(next, NaiveTime::MIN)?;
        TimeRange::new(start, end)
    }

    pub fn date_of(&self, t: Ms) -> Option<NaiveDate> {
        self.tz
            .timestamp_millis_opt(t)
            .single()
            .map(|dt| dt.date_naive())
    }

    /// Every local date `range` touches.
    pub fn dates_touched(&self, range: &TimeRange) -> Vec<NaiveDate> {
        let (Some(first), Some(last)) = (self.date_of(range.start()), self.date_of(range.end() - 1))
        else {
            return Vec::new();
        };
        first.iter_days().take_while(|d| *d <= last).collect()
    }

    pub fn window_range(&self, date: NaiveDate, window: &LocalWindow) -> Result<TimeRange, EngineError> {
        let until_midnight = window.close == NaiveTime::MIN;
        if !until_midnight && window.open >= window.close {
            return Err(EngineError::InvalidRange(format!(
                "window {}–{} on {date} closes before it opens",
                window.open, window.close
            )));
        }
        let start = self.local_instant(date, window.open)?;
        let end = if until_midnight {
            self.day_range(date)?.end()
        } else {
            self.local_instant(date, window.close)?
        };
        TimeRange::new(start, end)
    }
}

// ── Resolver ─────────────────────────────────────────────────────

pub struct WorkingHoursResolver {
    store: Arc<dyn ScheduleStore>,
    calendar: BranchCalendar,
}

impl WorkingHoursResolver {
    pub fn new(store: Arc<dyn ScheduleStore>, calendar: BranchCalendar) -> Self {
        Self { store, calendar }
    }

    pub fn calendar(&self) -> &BranchCalendar {
        &self.calendar
    }

    pub fn store(&self) -> &Arc<dyn ScheduleStore> {
        &self.store
    }

    /// Ordered, disjoint working windows for `bay_id` on `date`. Empty means closed.
    pub fn resolve(&self, bay_id: BayId, date: NaiveDate) -> Result<Vec<TimeRange>, EngineError> {
        let bay = self.store.bay(bay_id).ok_or(EngineError::NotFound(bay_id))?;
        if !bay.active {
            return Ok(Vec::new());
        }

        let weekday = date.weekday();
        let local = self
            .store
            .bay_override(bay_id, date)
            .or_else(|| self.store.bay_weekly(bay_id, weekday))
            .or_else(|| self.store.branch_weekly(bay.branch_id, weekday))
            .unwrap_or_default();

        if local.len() > MAX_WINDOWS_PER_DAY {
            return Err(EngineError::LimitExceeded("too many working windows in a day"));
        }

        let mut windows: Vec<TimeRange> = Vec::with_capacity(local.len());
        for w in &local {
            let range = self.calendar.window_range(date, w)?;
            if let Some(prev) = windows.last()
                && range.start() < prev.end() {
                    return Err(EngineError::InvalidRange(format!(
                        "working windows for bay {bay_id} on {date} overlap or are unsorted"
                    )));
                }
            windows.push(range);
        }
        Ok(windows)
    }
}

// ── Static schedule ──────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BranchHours {
    pub id: BranchId,
    #[serde(default)]
    pub weekly: WeeklyHours,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BayHours {
    pub id: BayId,
    pub branch_id: BranchId,
    #[serde(default = "default_active")]
    pub active: bool,
    #[serde(default)]
    pub weekly: WeeklyHours,
    #[serde(default)]
    pub overrides: BTreeMap<NaiveDate, Vec<LocalWindow>>,
}

fn default_active() -> bool {
    true
}

/// On-disk schedule file layout.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScheduleDocument {
    #[serde(default)]
    pub branches: Vec<BranchHours>,
    #[serde(default)]
    pub bays: Vec<BayHours>,
}

/// In-memory [`ScheduleStore`] that can be edited at runtime.
#[derive(Default)]
pub struct StaticSchedule {
    branches: DashMap<BranchId, BranchHours>,
    bays: DashMap<BayId, BayHours>,
}

impl StaticSchedule {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_document(doc: ScheduleDocument) -> Self {
        let schedule = Self::new();
        for branch in doc.branches {
            schedule.upsert_branch(branch);
        }
        for bay in doc.bays {
            schedule.upsert_bay(bay);
        }
        schedule
    }

    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let doc: ScheduleDocument = serde_json::from_str(json)?;
        Ok(Self::from_document(doc))
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json(&json)
    }

    pub fn upsert_branch(&self, branch: BranchHours) {
        self.branches.insert(branch.id, branch);
    }

    pub fn upsert_bay(&self, bay: BayHours) {
        self.bays.insert(bay.id, bay);
    }

    pub fn set_bay_weekly(&self, bay_id: BayId, weekday: Weekday, windows: Vec<LocalWindow>) -> Result<(), EngineError> {
        let mut bay = self.bays.get_mut(&bay_id).ok_or(EngineError::NotFound(bay_id))?;
        bay.weekly.insert(weekday, windows);
        Ok(())
    }

    pub fn set_bay_override(&self, bay_id: BayId, date: NaiveDate, windows: Vec<LocalWindow>) -> Result<(), EngineError> {
        let mut bay = self.bays.get_mut(&bay_id).ok_or(EngineError::NotFound(bay_id))?;
        bay.overrides.insert(date, windows);
        Ok(())
    }

    pub fn clear_bay_override(&self, bay_id: BayId, date: NaiveDate) -> Result<(), EngineError> {
        let mut bay = self.bays.get_mut(&bay_id).ok_or(EngineError::NotFound(bay_id))?;
        bay.overrides.remove(&date);
        Ok(())
    }

    pub fn set_bay_active(&self, bay_id: BayId, active: bool) -> Result<(), EngineError> {
        let mut bay = self.bays.get_mut(&bay_id).ok_or(EngineError::NotFound(bay_id))?;
        bay.active = active;
        Ok(())
    }

    pub fn set_branch_weekly(&self, branch_id: BranchId, weekday: Weekday, windows: Vec<LocalWindow>) {
        self.branches
            .entry(branch_id)
            .or_insert_with(|| BranchHours {
                id: branch_id,
                weekly: WeeklyHours::new(),
            })
            .weekly
            .insert(weekday, windows);
    }
}

impl ScheduleStore for StaticSchedule {
    fn bay(&self, bay_id: BayId) -> Option<BayInfo> {
        self.bays.get(&bay_id).map(|b| BayInfo {
            id: b.id,
            branch_id: b.branch_id,
            active: b.active,
        })
    }

    fn bay_override(&self, bay_id: BayId, date: NaiveDate) -> Option<Vec<LocalWindow>> {
        self.bays.get(&bay_id)?.overrides.get(&date).cloned()
    }

    fn bay_weekly(&self, bay_id: BayId, weekday: Weekday) -> Option<Vec<LocalWindow>> {
        self.bays.get(&bay_id)?.weekly.get(&weekday).cloned()
    }

    fn branch_weekly(&self, branch_id: BranchId, weekday: Weekday) -> Option<Vec<LocalWindow>> {
        self.branches.get(&branch_id)?.weekly.get(&weekday).cloned()
    }

    fn active_bays(&self) -> Vec<BayId> {
        let mut ids: Vec<BayId> = self
            .bays
            .iter()
            .filter(|b| b.active)
            .map(|b| *b.key())
            .collect();
        ids.sort();
        ids
    }
}
