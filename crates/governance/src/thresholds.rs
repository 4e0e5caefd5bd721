//! Usage alert thresholds
//!
//! Thresholds are percent-of-allowance breakpoints. The list is a contract:
//! it must be sorted descending, and the matcher returns the first (highest)
//! threshold at or below the computed usage percentage.

/// Alert thresholds as percent of the allowance, sorted descending
pub const API_USAGE_ALERT_THRESHOLDS: [i32; 4] = [100, 90, 75, 50];

/// Find the highest threshold at or below the usage percentage.
///
/// `thresholds` must be pre-sorted descending. Usage percent is truncated to
/// an integer before comparison, matching the stored notification values.
/// Returns `None` when usage is below every threshold or the limit is not
/// positive.
pub fn matched_threshold(api_usage: i64, allowed_api_calls: i64, thresholds: &[i32]) -> Option<i32> {
    if allowed_api_calls <= 0 {
        return None;
    }

    let usage_percent = (100 * api_usage / allowed_api_calls) as i32;

    thresholds
        .iter()
        .copied()
        .find(|&threshold| threshold <= usage_percent)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_matches_highest_threshold_at_or_below_usage() {
        // 950 / 1000 = 95% -> 90 wins over 75 and 50
        assert_eq!(matched_threshold(950, 1_000, &API_USAGE_ALERT_THRESHOLDS), Some(90));
        assert_eq!(matched_threshold(1_000, 1_000, &API_USAGE_ALERT_THRESHOLDS), Some(100));
        assert_eq!(matched_threshold(2_100, 1_000, &API_USAGE_ALERT_THRESHOLDS), Some(100));
        assert_eq!(matched_threshold(760, 1_000, &API_USAGE_ALERT_THRESHOLDS), Some(75));
        assert_eq!(matched_threshold(500, 1_000, &API_USAGE_ALERT_THRESHOLDS), Some(50));
    }

    #[test]
    fn test_below_lowest_threshold_matches_nothing() {
        assert_eq!(matched_threshold(499, 1_000, &API_USAGE_ALERT_THRESHOLDS), None);
        assert_eq!(matched_threshold(0, 1_000, &API_USAGE_ALERT_THRESHOLDS), None);
    }

    #[test]
    fn test_percent_is_truncated() {
        // 899 / 1000 = 89.9% truncates to 89 -> matches 75, not 90
        assert_eq!(matched_threshold(899, 1_000, &API_USAGE_ALERT_THRESHOLDS), Some(75));
    }

    #[test]
    fn test_non_positive_limit_matches_nothing() {
        assert_eq!(matched_threshold(1_000, 0, &API_USAGE_ALERT_THRESHOLDS), None);
        assert_eq!(matched_threshold(1_000, -5, &API_USAGE_ALERT_THRESHOLDS), None);
    }

    #[test]
    fn test_returns_maximum_qualifying_threshold_for_any_descending_set() {
        let thresholds = [80, 60, 40, 20, 10];
        for percent in 0..200i64 {
            let result = matched_threshold(percent, 100, &thresholds);
            let expected = thresholds
                .iter()
                .copied()
                .filter(|&t| i64::from(t) <= percent)
                .max();
            assert_eq!(result, expected, "percent {}", percent);
        }
    }
}
