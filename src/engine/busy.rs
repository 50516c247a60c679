use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::model::*;

use super::EngineError;

/// Source of persisted bookings. Implementations may be remote; every call is
/// wrapped in a deadline by [`BusySetBuilder`].
#[async_trait]
pub trait BookingStore: Send + Sync {
    /// Bookings on `bay_id` whose scheduled range intersects `range`, any status.
    async fn list_occupancies(&self, bay_id: BayId, range: TimeRange) -> Result<Vec<BookingOccupancy>, EngineError>;
}

/// Blocking bookings occupying one bay on one day.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BusySet {
    pub occupancies: Vec<BookingOccupancy>,
}

impl BusySet {
    /// Unsorted, unmerged scheduled ranges.
    pub fn ranges(&self) -> Vec<TimeRange> {
        self.occupancies.iter().map(|o| o.scheduled).collect()
    }

    pub fn conflicting(&self, requested: &TimeRange) -> Vec<BookingOccupancy> {
        self.occupancies
            .iter()
            .filter(|o| o.scheduled.overlaps(requested))
            .cloned()
            .collect()
    }
}

/// Keep rows that belong to `bay_id`, intersect `day` and hold a blocking status.
pub fn blocking_occupancies(rows: Vec<BookingOccupancy>, bay_id: BayId, day: &TimeRange) -> BusySet {
    BusySet {
        occupancies: rows
            .into_iter()
            .filter(|o| o.bay_id == bay_id && o.is_blocking() && o.scheduled.overlaps(day))
            .collect(),
    }
}

pub struct BusySetBuilder {
    store: Arc<dyn BookingStore>,
    timeout: Duration,
}

impl BusySetBuilder {
    pub fn new(store: Arc<dyn BookingStore>, timeout: Duration) -> Self {
        Self { store, timeout }
    }

    /// Query the store under a deadline. A timeout is an error, never an empty set.
    pub async fn build(&self, bay_id: BayId, day: TimeRange) -> Result<BusySet, EngineError> {
        let rows = match tokio::time::timeout(self.timeout, self.store.list_occupancies(bay_id, day)).await {
            Ok(rows) => rows?,
            Err(_) => {
                metrics::counter!(crate::observability::STORE_TIMEOUTS_TOTAL).increment(1);
                tracing::warn!("booking store timed out after {:?} for bay {bay_id}", self.timeout);
                return Err(EngineError::UpstreamTimeout);
            }
        };
        Ok(blocking_occupancies(rows, bay_id, &day))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ulid::Ulid;

    fn occ(bay_id: BayId, start: Ms, end: Ms, status: BookingStatus) -> BookingOccupancy {
        BookingOccupancy {
            booking_id: Ulid::new(),
            bay_id,
            branch_id: Ulid::new(),
            scheduled: TimeRange::new(start, end).unwrap(),
            status,
        }
    }

    struct SlowStore {
        rows: Vec<BookingOccupancy>,
        delay: Duration,
    }

    #[async_trait]
    impl BookingStore for SlowStore {
        async fn list_occupancies(&self, _bay_id: BayId, _range: TimeRange) -> Result<Vec<BookingOccupancy>, EngineError> {
            tokio::time::sleep(self.delay).await;
            Ok(self.rows.clone())
        }
    }

    #[test]
    fn filters_non_blocking_statuses() {
        let bay = Ulid::new();
        let day = TimeRange::new(0, 1_000).unwrap();
        let rows = vec![
            occ(bay, 0, 100, BookingStatus::Pending),
            occ(bay, 100, 200, BookingStatus::Confirmed),
            occ(bay, 200, 300, BookingStatus::CheckedIn),
            occ(bay, 300, 400, BookingStatus::InProgress),
            occ(bay, 400, 500, BookingStatus::Cancelled),
            occ(bay, 500, 600, BookingStatus::NoShow),
            occ(bay, 600, 700, BookingStatus::Completed),
        ];
        let busy = blocking_occupancies(rows, bay, &day);
        assert_eq!(busy.occupancies.len(), 4);
        assert!(busy.occupancies.iter().all(|o| o.is_blocking()));
    }

    #[test]
    fn filters_other_bays_and_days() {
        let bay = Ulid::new();
        let day = TimeRange::new(1_000, 2_000).unwrap();
        let rows = vec![
            occ(Ulid::new(), 1_100, 1_200, BookingStatus::Confirmed),
            occ(bay, 0, 1_000, BookingStatus::Confirmed), // ends at day start
            occ(bay, 2_000, 2_100, BookingStatus::Confirmed), // starts at day end
            occ(bay, 900, 1_100, BookingStatus::Confirmed), // straddles midnight
        ];
        let busy = blocking_occupancies(rows, bay, &day);
        assert_eq!(busy.ranges(), vec![TimeRange::new(900, 1_100).unwrap()]);
    }

    #[test]
    fn conflicting_ignores_touching() {
        let bay = Ulid::new();
        let a = occ(bay, 100, 200, BookingStatus::Confirmed);
        let busy = BusySet {
            occupancies: vec![a.clone()],
        };
        assert!(busy.conflicting(&TimeRange::new(200, 300).unwrap()).is_empty());
        assert_eq!(busy.conflicting(&TimeRange::new(150, 250).unwrap()), vec![a]);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_store_times_out() {
        let store = Arc::new(SlowStore {
            rows: vec![],
            delay: Duration::from_secs(10),
        });
        let builder = BusySetBuilder::new(store, Duration::from_secs(1));
        let result = builder.build(Ulid::new(), TimeRange::new(0, 1_000).unwrap()).await;
        assert_eq!(result, Err(EngineError::UpstreamTimeout));
    }

    #[tokio::test(start_paused = true)]
    async fn store_within_deadline_succeeds() {
        let bay = Ulid::new();
        let store = Arc::new(SlowStore {
            rows: vec![occ(bay, 10, 20, BookingStatus::Confirmed)],
            delay: Duration::from_millis(100),
        });
        let builder = BusySetBuilder::new(store, Duration::from_secs(1));
        let busy = builder.build(bay, TimeRange::new(0, 1_000).unwrap()).await.unwrap();
        assert_eq!(busy.occupancies.len(), 1);
    }
}
