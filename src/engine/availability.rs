use std::sync::Arc;

use chrono::NaiveDate;

use crate::interval;
use crate::model::*;

use super::{Engine, EngineError};

// ── Availability Algorithm ────────────────────────────────────────

/// Free time on one day: every working window minus the merged busy set,
/// with gaps shorter than `granularity_ms` dropped rather than rounded.
///
/// Pure and allocation-only; safe to call from any thread. `windows` must be
/// sorted and disjoint (as returned by the resolver); `busy` may be in any order
/// and may overlap.
pub fn compute_availability(windows: &[TimeRange], busy: &[TimeRange], granularity_ms: Ms) -> Vec<TimeRange> {
    let merged = interval::merge(busy);
    let mut free = interval::subtract_sorted(windows, &merged);
    free.retain(|r| r.duration_ms() >= granularity_ms);
    free
}

impl Engine {
    /// Availability for a bay on a branch-local date. Served from cache when a
    /// current entry exists, otherwise recomputed and stored.
    pub async fn get_available_ranges(&self, bay_id: BayId, date: NaiveDate) -> Result<Arc<AvailabilityResult>, EngineError> {
        self.check_query_horizon(date)?;
        let key = SlotKey::new(bay_id, date);

        if let Some(hit) = self.cache.get(&key, self.now()) {
            metrics::counter!(crate::observability::AVAILABILITY_QUERIES_TOTAL, "cache" => "hit").increment(1);
            return Ok(hit);
        }
        metrics::counter!(crate::observability::AVAILABILITY_QUERIES_TOTAL, "cache" => "miss").increment(1);

        // An invalidation racing with the computation bumps the epoch, so the
        // stale result is returned to this caller but never cached.
        let epoch = self.cache.epoch(&key);
        let result = Arc::new(self.compute_result(bay_id, date).await?);
        self.cache.store_if_current(key, epoch, result.clone());
        Ok(result)
    }

    /// Resolve, query and compute without touching the cache.
    pub(super) async fn compute_result(&self, bay_id: BayId, date: NaiveDate) -> Result<AvailabilityResult, EngineError> {
        let calendar = self.resolver.calendar();
        let day = calendar.day_range(date)?;
        let working_windows = self.resolver.resolve(bay_id, date)?;

        let busy = self.busy.build(bay_id, day).await?;
        let holds = self.guard.live_holds(&SlotKey::new(bay_id, date), self.now()).await;
        let mut occupied = busy.ranges();
        occupied.extend(holds.iter().map(|t| t.range));
        let occupied_ranges = interval::merge(&occupied);
        // The first hold to lapse frees time without any event to invalidate on.
        let valid_until = holds.iter().map(|t| t.expires_at).min();

        let free_ranges = compute_availability(&working_windows, &occupied_ranges, self.config.granularity_ms);
        Ok(AvailabilityResult {
            bay_id,
            date,
            working_windows,
            occupied_ranges,
            free_ranges,
            computed_at: self.now(),
            valid_until,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const MIN: Ms = 60_000;
    const HOUR: Ms = 60 * MIN;

    fn r(start: Ms, end: Ms) -> TimeRange {
        TimeRange::new(start, end).unwrap()
    }

    #[test]
    fn lunch_break_with_booking() {
        let windows = [r(9 * HOUR, 12 * HOUR), r(13 * HOUR, 18 * HOUR)];
        let busy = [r(10 * HOUR, 11 * HOUR)];
        let free = compute_availability(&windows, &busy, 15 * MIN);
        assert_eq!(
            free,
            vec![r(9 * HOUR, 10 * HOUR), r(11 * HOUR, 12 * HOUR), r(13 * HOUR, 18 * HOUR)]
        );
    }

    #[test]
    fn closed_day_has_no_free_time() {
        assert!(compute_availability(&[], &[r(0, HOUR)], 15 * MIN).is_empty());
    }

    #[test]
    fn short_gap_dropped_not_rounded() {
        // 10-minute gap between bookings, 15-minute granularity
        let windows = [r(9 * HOUR, 12 * HOUR)];
        let busy = [r(9 * HOUR, 10 * HOUR), r(10 * HOUR + 10 * MIN, 12 * HOUR)];
        assert!(compute_availability(&windows, &busy, 15 * MIN).is_empty());

        // exactly one granularity survives
        let busy = [r(9 * HOUR, 10 * HOUR), r(10 * HOUR + 15 * MIN, 12 * HOUR)];
        assert_eq!(
            compute_availability(&windows, &busy, 15 * MIN),
            vec![r(10 * HOUR, 10 * HOUR + 15 * MIN)]
        );
    }

    #[test]
    fn overlapping_busy_ranges_merge() {
        let windows = [r(0, 10 * HOUR)];
        let busy = [r(2 * HOUR, 5 * HOUR), r(HOUR, 3 * HOUR), r(4 * HOUR, 6 * HOUR)];
        assert_eq!(
            compute_availability(&windows, &busy, MIN),
            vec![r(0, HOUR), r(6 * HOUR, 10 * HOUR)]
        );
    }

    #[test]
    fn busy_outside_windows_ignored() {
        let windows = [r(9 * HOUR, 12 * HOUR)];
        let busy = [r(6 * HOUR, 8 * HOUR), r(20 * HOUR, 22 * HOUR)];
        assert_eq!(compute_availability(&windows, &busy, MIN), windows.to_vec());
    }

    fn windows_strategy() -> impl Strategy<Value = Vec<TimeRange>> {
        // Up to four disjoint windows built from sorted, deduplicated cut points.
        prop::collection::btree_set(0i64..(24 * 4), 0..8).prop_map(|cuts| {
            let cuts: Vec<Ms> = cuts.into_iter().map(|q| q * 15 * MIN).collect();
            cuts.chunks_exact(2).map(|pair| r(pair[0], pair[1])).collect()
        })
    }

    fn busy_strategy() -> impl Strategy<Value = Vec<TimeRange>> {
        prop::collection::vec((0i64..(24 * 60), 1i64..240), 0..10)
            .prop_map(|v| v.into_iter().map(|(s, len)| r(s * MIN, (s + len) * MIN)).collect())
    }

    proptest! {
        #[test]
        fn free_is_inside_windows_and_outside_busy(
            windows in windows_strategy(),
            busy in busy_strategy(),
            granularity in 1i64..60,
        ) {
            let g = granularity * MIN;
            let free = compute_availability(&windows, &busy, g);
            for f in &free {
                prop_assert!(interval::covered_by(f, &windows));
                prop_assert!(busy.iter().all(|b| !b.overlaps(f)));
                prop_assert!(f.duration_ms() >= g);
            }
            for pair in free.windows(2) {
                prop_assert!(pair[0].end() <= pair[1].start());
            }
        }

        #[test]
        fn computation_is_idempotent(windows in windows_strategy(), busy in busy_strategy()) {
            let first = compute_availability(&windows, &busy, 15 * MIN);
            let second = compute_availability(&windows, &busy, 15 * MIN);
            prop_assert_eq!(first, second);
        }

        #[test]
        fn busy_order_does_not_matter(windows in windows_strategy(), mut busy in busy_strategy()) {
            let forward = compute_availability(&windows, &busy, 15 * MIN);
            busy.reverse();
            prop_assert_eq!(forward, compute_availability(&windows, &busy, 15 * MIN));
        }
    }
}
