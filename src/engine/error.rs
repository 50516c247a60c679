use thiserror::Error;
use ulid::Ulid;

use crate::model::{BayId, BookingOccupancy, TimeRange};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    /// Malformed input: inverted bounds, out-of-horizon date, DST-ambiguous time.
    #[error("invalid range: {0}")]
    InvalidRange(String),
    #[error("[{}, {}) is outside working hours", .requested.start(), .requested.end())]
    OutsideWorkingHours { requested: TimeRange },
    #[error("conflicts with {}", describe_conflicts(.conflicts))]
    SlotConflict { conflicts: Vec<BookingOccupancy> },
    #[error("booking store did not answer in time")]
    UpstreamTimeout,
    #[error("could not materialize bay {bay_id}: {reason}")]
    MaterializationFailure { bay_id: BayId, reason: String },
    #[error("not found: {0}")]
    NotFound(Ulid),
    #[error("already exists: {0}")]
    AlreadyExists(Ulid),
    #[error("reservation token expired: {0}")]
    TokenExpired(Ulid),
    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),
    #[error("booking store error: {0}")]
    Store(String),
    #[error("WAL error: {0}")]
    WalError(String),
}

impl EngineError {
    /// Whether the same request may succeed if simply repeated.
    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::UpstreamTimeout | EngineError::Store(_))
    }
}

fn describe_conflicts(conflicts: &[BookingOccupancy]) -> String {
    if conflicts.is_empty() {
        return "an outstanding reservation".to_string();
    }
    conflicts
        .iter()
        .map(|c| {
            format!(
                "booking {} at [{}, {})",
                c.booking_id,
                c.scheduled.start(),
                c.scheduled.end()
            )
        })
        .collect::<Vec<_>>()
        .join(", ")
}
