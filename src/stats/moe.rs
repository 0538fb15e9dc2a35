//! Margin of error and Student's t critical values.

/// Two-tailed 95% critical values, indexed by degrees of freedom `1..=30`.
const T_VALUES: [f64; 30] = [
    12.706, 4.303, 3.182, 2.776, 2.571, 2.447, 2.365, 2.306, 2.262, 2.228, 2.201, 2.179, 2.160,
    2.145, 2.131, 2.120, 2.110, 2.101, 2.093, 2.086, 2.080, 2.074, 2.069, 2.064, 2.060, 2.056,
    2.052, 2.048, 2.045, 2.042,
];

/// Critical values above 30 degrees of freedom, as `(min_df, value)`.
const T_VALUES_LARGE: [(u64, f64); 7] = [
    (40, 2.021),
    (50, 2.009),
    (60, 2.000),
    (80, 1.990),
    (100, 1.984),
    (120, 1.980),
    (1000, 1.962),
];

const T_VALUE_INFINITY: f64 = 1.960;

/// Two-tailed 95% Student's t critical value for `degrees_of_freedom`.
///
/// Between table rows the next lower row is used, which errs on the side of a
/// wider interval.
pub fn t_value(degrees_of_freedom: u64) -> f64 {
    match degrees_of_freedom {
        0 => f64::INFINITY,
        df @ 1..=30 => T_VALUES[(df - 1) as usize],
        df if df > 1000 => T_VALUE_INFINITY,
        df => T_VALUES_LARGE
            .iter()
            .rev()
            .find(|(min_df, _)| df >= *min_df)
            .map(|(_, value)| *value)
            .unwrap_or(T_VALUES[29]),
    }
}

/// Half-width of the 95% confidence interval around the median.
pub fn margin_of_error(stdev: f64, length: usize) -> f64 {
    let standard_error = stdev / (length as f64).sqrt();
    standard_error * t_value(length.saturating_sub(1) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_t_value_table() {
        assert_eq!(t_value(1), 12.706);
        assert_eq!(t_value(30), 2.042);
        assert_eq!(t_value(45), 2.021);
        assert_eq!(t_value(35), 2.042);
        assert_eq!(t_value(1_000_000), 1.960);
        assert!(t_value(0).is_infinite());
    }

    #[test]
    fn test_margin_of_error() {
        let moe = margin_of_error(10.0, 101);
        assert!((moe - 10.0 / 101f64.sqrt() * 1.984).abs() < 1e-9);
    }
}
