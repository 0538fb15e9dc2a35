//! Incremental merge of sorted measure batches.
//!
//! `measures` can hold tens of millions of values on long runs, so new
//! batches are merged in place from the back instead of being appended and
//! re-sorted.

use std::cmp::Ordering;

/// Merge a sorted `batch` into the sorted `measures`, in O(n + m).
///
/// Both inputs must be sorted ascending; the result is sorted ascending.
pub fn merge_sorted(measures: &mut Vec<f64>, batch: &[f64]) {
    if batch.is_empty() {
        return;
    }

    let mut left = measures.len();
    let mut right = batch.len();
    measures.resize(left + right, 0.0);
    let mut write = measures.len();

    while right > 0 {
        write -= 1;
        if left > 0 && measures[left - 1].total_cmp(&batch[right - 1]) == Ordering::Greater {
            measures[write] = measures[left - 1];
            left -= 1;
        } else {
            measures[write] = batch[right - 1];
            right -= 1;
        }
    }
}

/// Sort a freshly received batch. Batches are small compared to `measures`.
pub fn sort_batch(batch: &mut [f64]) {
    batch.sort_unstable_by(f64::total_cmp);
}
