//! Pure interval arithmetic over half-open [`TimeRange`]s.

use crate::model::TimeRange;

/// Symmetric; touching endpoints are not an overlap.
pub fn overlaps(a: &TimeRange, b: &TimeRange) -> bool {
    a.overlaps(b)
}

/// Fuse overlapping or adjacent ranges. Input order does not matter.
pub fn merge(ranges: &[TimeRange]) -> Vec<TimeRange> {
    let mut sorted = ranges.to_vec();
    sorted.sort_by_key(|r| r.start());
    merge_sorted(&sorted)
}

/// Merge ranges already sorted by start.
pub fn merge_sorted(sorted: &[TimeRange]) -> Vec<TimeRange> {
    let mut merged: Vec<TimeRange> = Vec::new();
    for &range in sorted {
        if let Some(last) = merged.last_mut()
            && range.start() <= last.end() {
                if range.end() > last.end() {
                    *last = TimeRange::from_bounds(last.start(), range.end());
                }
                continue;
            }
        merged.push(range);
    }
    merged
}

/// The parts of `window` not covered by any of `busy`.
pub fn subtract(window: &TimeRange, busy: &[TimeRange]) -> Vec<TimeRange> {
    let mut sorted = busy.to_vec();
    sorted.sort_by_key(|r| r.start());
    subtract_sorted(std::slice::from_ref(window), &sorted)
}

/// Sweep `to_remove` (sorted by start) across `base` (sorted, disjoint).
pub fn subtract_sorted(base: &[TimeRange], to_remove: &[TimeRange]) -> Vec<TimeRange> {
    let mut result = Vec::new();
    let mut ri = 0;

    for b in base {
        let mut current_start = b.start();
        let current_end = b.end();

        while ri < to_remove.len() && to_remove[ri].end() <= current_start {
            ri += 1;
        }

        let mut j = ri;
        while j < to_remove.len() && to_remove[j].start() < current_end {
            let r = &to_remove[j];
            if r.start() > current_start {
                result.push(TimeRange::from_bounds(current_start, r.start()));
            }
            current_start = current_start.max(r.end());
            j += 1;
        }

        if current_start < current_end {
            result.push(TimeRange::from_bounds(current_start, current_end));
        }
    }

    result
}

/// True if `range` lies entirely inside one of `windows`.
pub fn covered_by(range: &TimeRange, windows: &[TimeRange]) -> bool {
    windows.iter().any(|w| w.contains_range(range))
}
