//! Order statistics over sorted arrays.
//!
//! Every function in this module expects its input to be sorted ascending and
//! non-empty. Positions use the `(n - 1) * p` convention with linear
//! interpolation between neighbours, which is also what `median` uses.

/// Retrieve the value at `percentage` (`0.0..=1.0`) of a sorted array.
pub fn quantile(array: &[f64], percentage: f64) -> f64 {
    let position = quantile_position(array, percentage);
    let lower = position.floor();
    let upper = position.ceil();

    if lower == upper {
        return array[position as usize];
    }

    array[lower as usize] * (upper - position) + array[upper as usize] * (position - lower)
}

/// Median of a sorted array, interpolating for even lengths.
pub fn median(array: &[f64]) -> f64 {
    quantile(array, 0.5)
}

/// `count + 1` evenly spaced quantiles, from the minimum to the maximum.
pub fn quantiles(array: &[f64], count: usize) -> Vec<f64> {
    (0..=count)
        .map(|index| quantile(array, index as f64 / count as f64))
        .collect()
}

/// Index of the element closest to `percentage`, used to trim outliers
/// without cloning the array.
pub fn rounded_position(array: &[f64], percentage: f64) -> usize {
    quantile_position(array, percentage).round() as usize
}

fn quantile_position(array: &[f64], percentage: f64) -> f64 {
    (array.len() - 1) as f64 * percentage.clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_median_odd_and_even() {
        assert_eq!(median(&[1.0, 2.0, 9.0]), 2.0);
        assert_eq!(median(&[1.0, 2.0, 4.0, 9.0]), 3.0);
        assert_eq!(median(&[7.0]), 7.0);
    }

    #[test]
    fn test_quantile_interpolates() {
        let array = [0.0, 10.0, 20.0, 30.0, 40.0];
        assert_eq!(quantile(&array, 0.0), 0.0);
        assert_eq!(quantile(&array, 1.0), 40.0);
        assert!((quantile(&array, 0.1) - 4.0).abs() < 1e-9);
    }

    #[test]
    fn test_quantiles_cover_extremes() {
        let array: Vec<f64> = (0..=100).map(f64::from).collect();
        let values = quantiles(&array, 4);
        assert_eq!(values, vec![0.0, 25.0, 50.0, 75.0, 100.0]);
    }

    #[test]
    fn test_rounded_position() {
        let array: Vec<f64> = (0..21).map(f64::from).collect();
        assert_eq!(rounded_position(&array, 0.05), 1);
        assert_eq!(rounded_position(&array, 0.95), 19);
    }
}
