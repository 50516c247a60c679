use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::engine::EngineError;

/// Unix milliseconds — the only instant type.
pub type Ms = i64;

pub type BayId = Ulid;
pub type BranchId = Ulid;
pub type BookingId = Ulid;

/// Half-open interval `[start, end)`. Zero-length and inverted ranges
/// cannot be constructed, deserialized included.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "RawTimeRange")]
pub struct TimeRange {
    start: Ms,
    end: Ms,
}

#[derive(Deserialize)]
struct RawTimeRange {
    start: Ms,
    end: Ms,
}

impl TryFrom<RawTimeRange> for TimeRange {
    type Error = EngineError;

    fn try_from(raw: RawTimeRange) -> Result<Self, Self::Error> {
        TimeRange::new(raw.start, raw.end)
    }
}

impl TimeRange {
    pub fn new(start: Ms, end: Ms) -> Result<Self, EngineError> {
        if start >= end {
            return Err(EngineError::InvalidRange(format!(
                "range start {start} must be before end {end}"
            )));
        }
        Ok(Self { start, end })
    }

    /// Internal constructor for ranges whose bounds are already known to be ordered.
    pub(crate) fn from_bounds(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "TimeRange start must be before end");
        Self { start, end }
    }

    pub fn start(&self) -> Ms {
        self.start
    }

    pub fn end(&self) -> Ms {
        self.end
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    /// Touching endpoints do not overlap.
    pub fn overlaps(&self, other: &TimeRange) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn contains_instant(&self, t: Ms) -> bool {
        self.start <= t && t < self.end
    }

    /// Returns true if `self` fully contains `other`.
    pub fn contains_range(&self, other: &TimeRange) -> bool {
        self.start <= other.start && other.end <= self.end
    }

    pub fn intersection(&self, other: &TimeRange) -> Option<TimeRange> {
        let start = self.start.max(other.start);
        let end = self.end.min(other.end);
        (start < end).then(|| TimeRange::from_bounds(start, end))
    }
}

/// Booking lifecycle as seen by the scheduling core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BookingStatus {
    Pending,
    Confirmed,
    CheckedIn,
    InProgress,
    Completed,
    Cancelled,
    NoShow,
}

/// Statuses that occupy calendar time and exclude new reservations.
pub const BLOCKING_STATUSES: [BookingStatus; 4] = [
    BookingStatus::Pending,
    BookingStatus::Confirmed,
    BookingStatus::CheckedIn,
    BookingStatus::InProgress,
];

impl BookingStatus {
    pub fn is_blocking(self) -> bool {
        BLOCKING_STATUSES.contains(&self)
    }
}

/// Read-only projection of a booking row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookingOccupancy {
    pub booking_id: BookingId,
    pub bay_id: BayId,
    pub branch_id: BranchId,
    pub scheduled: TimeRange,
    pub status: BookingStatus,
}

impl BookingOccupancy {
    pub fn is_blocking(&self) -> bool {
        self.status.is_blocking()
    }
}

/// Cache and lock key: one bay on one branch-local calendar date.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SlotKey {
    pub bay_id: BayId,
    pub date: NaiveDate,
}

impl SlotKey {
    pub fn new(bay_id: BayId, date: NaiveDate) -> Self {
        Self { bay_id, date }
    }
}

impl std::fmt::Display for SlotKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.bay_id, self.date)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AvailabilityResult {
    pub bay_id: BayId,
    pub date: NaiveDate,
    /// Open-for-business spans, sorted and disjoint.
    pub working_windows: Vec<TimeRange>,
    /// Merged blocking bookings and live holds touching the day.
    pub occupied_ranges: Vec<TimeRange>,
    /// Bookable time, each range at least one granularity long.
    pub free_ranges: Vec<TimeRange>,
    pub computed_at: Ms,
    /// Earliest expiry among the holds counted as occupied; stale from then on.
    pub valid_until: Option<Ms>,
}

impl AvailabilityResult {
    pub fn is_fresh(&self, now: Ms) -> bool {
        self.valid_until.is_none_or(|t| now < t)
    }
}

/// Short-lived proof that a range passed the conflict check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReservationToken {
    pub id: Ulid,
    pub bay_id: BayId,
    pub date: NaiveDate,
    pub range: TimeRange,
    pub expires_at: Ms,
}

impl ReservationToken {
    pub fn key(&self) -> SlotKey {
        SlotKey::new(self.bay_id, self.date)
    }

    pub fn is_live(&self, now: Ms) -> bool {
        self.expires_at > now
    }
}

#[derive(Debug)]
pub enum ReservationDecision {
    Accept(ReservationToken),
    Reject(EngineError),
}

impl ReservationDecision {
    pub fn is_accept(&self) -> bool {
        matches!(self, ReservationDecision::Accept(_))
    }

    /// Bookings the request collided with; empty unless rejected for a conflict.
    pub fn conflicts(&self) -> &[BookingOccupancy] {
        match self {
            ReservationDecision::Reject(EngineError::SlotConflict { conflicts }) => conflicts,
            _ => &[],
        }
    }

    pub fn into_result(self) -> Result<ReservationToken, EngineError> {
        match self {
            ReservationDecision::Accept(token) => Ok(token),
            ReservationDecision::Reject(err) => Err(err),
        }
    }
}

/// Ledger WAL record format — flat, no nesting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LedgerEvent {
    BookingRecorded {
        occupancy: BookingOccupancy,
        label: Option<String>,
    },
    StatusChanged {
        booking_id: BookingId,
        bay_id: BayId,
        scheduled: TimeRange,
        status: BookingStatus,
    },
    BookingRescheduled {
        booking_id: BookingId,
        bay_id: BayId,
        previous: TimeRange,
        scheduled: TimeRange,
    },
}

impl LedgerEvent {
    pub fn bay_id(&self) -> BayId {
        match self {
            LedgerEvent::BookingRecorded { occupancy, .. } => occupancy.bay_id,
            LedgerEvent::StatusChanged { bay_id, .. }
            | LedgerEvent::BookingRescheduled { bay_id, .. } => *bay_id,
        }
    }

    /// Every range whose availability this event can change.
    pub fn touched_ranges(&self) -> Vec<TimeRange> {
        match self {
            LedgerEvent::BookingRecorded { occupancy, .. } => vec![occupancy.scheduled],
            LedgerEvent::StatusChanged { scheduled, .. } => vec![*scheduled],
            LedgerEvent::BookingRescheduled {
                previous, scheduled, ..
            } => vec![*previous, *scheduled],
        }
    }
}
