use crate::model::Ms;

/// Earliest instant accepted anywhere (2000-01-01T00:00:00Z).
pub const MIN_VALID_TIMESTAMP_MS: Ms = 946_684_800_000;

/// Latest instant accepted anywhere (2100-01-01T00:00:00Z).
pub const MAX_VALID_TIMESTAMP_MS: Ms = 4_102_444_800_000;

/// A single reservation may not exceed one day.
pub const MAX_RESERVATION_DURATION_MS: Ms = 24 * 3_600_000;

/// Working windows per bay per day.
pub const MAX_WINDOWS_PER_DAY: usize = 16;

/// Bookings the ledger keeps per bay before refusing new ones.
pub const MAX_BOOKINGS_PER_BAY: usize = 100_000;

/// Outstanding reservation tokens per (bay, date).
pub const MAX_HOLDS_PER_SLOT: usize = 1_000;

pub const MAX_LABEL_LEN: usize = 1_024;

/// Largest WAL payload; a longer length prefix is treated as corruption.
pub const MAX_FRAME_LEN: u32 = 1 << 20;

/// Upper bound for the configurable booking horizon.
pub const MAX_HORIZON_DAYS: u32 = 3_650;
