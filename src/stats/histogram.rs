use serde::{Deserialize, Serialize};

/// One equal-width histogram bucket.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bucket {
    pub start: f64,
    pub end: f64,
    /// Share of the trimmed measures falling in this bucket, `0.0..=1.0`.
    pub frequency: f64,
}

/// Histogram of `array[low_index..=high_index]` with `bucket_count` buckets.
///
/// Bucket membership is found with a binary search per bucket edge, so the
/// cost is O(buckets * log n) on top of the already sorted array. The last
/// edge is `high` itself to avoid float roundoff leaving the maximum outside.
pub fn histogram(array: &[f64], low_index: usize, high_index: usize, bucket_count: usize) -> Vec<Bucket> {
    let trimmed = &array[low_index..=high_index];
    let low = trimmed[0];
    let high = trimmed[trimmed.len() - 1];
    let length = trimmed.len() as f64;
    let bucket_size = (high - low) / bucket_count as f64;

    let mut start_index = 0;
    (0..bucket_count)
        .map(|bucket_index| {
            let start = low + bucket_index as f64 * bucket_size;
            let end = if bucket_index + 1 == bucket_count {
                high
            } else {
                low + (bucket_index + 1) as f64 * bucket_size
            };

            let end_index = start_index + trimmed[start_index..].partition_point(|&value| value <= end);
            let frequency = (end_index - start_index) as f64 / length;
            start_index = end_index;

            Bucket { start, end, frequency }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_histogram_frequencies_sum_to_one() {
        let array: Vec<f64> = (0..1000).map(|value| (value % 97) as f64).collect::<Vec<_>>();
        let mut array = array;
        array.sort_unstable_by(f64::total_cmp);
        let buckets = histogram(&array, 0, array.len() - 1, 10);

        assert_eq!(buckets.len(), 10);
        let total: f64 = buckets.iter().map(|bucket| bucket.frequency).sum();
        assert!((total - 1.0).abs() < 1e-9);
        assert_eq!(buckets[0].start, 0.0);
        assert_eq!(buckets[9].end, 96.0);
    }

    #[test]
    fn test_histogram_constant_values() {
        let array = vec![5.0; 8];
        let buckets = histogram(&array, 0, 7, 4);
        assert_eq!(buckets[0].frequency, 1.0);
        assert!(buckets[1..].iter().all(|bucket| bucket.frequency == 0.0));
    }

    #[test]
    fn test_histogram_respects_trim_bounds() {
        let array = vec![0.0, 1.0, 2.0, 3.0, 100.0];
        let buckets = histogram(&array, 1, 3, 2);
        assert_eq!(buckets[0].start, 1.0);
        assert_eq!(buckets[1].end, 3.0);
        assert!((buckets[0].frequency - 2.0 / 3.0).abs() < 1e-9);
    }
}
