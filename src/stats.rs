use std::cmp::Ordering;

use crate::models::{EngagementPattern, Quartile, Trajectory, UsageChange};

fn sorted(values: &[f64]) -> Vec<f64> {
    let mut values = values.to_vec();
    values.sort_by(|a, b| a.partial_cmp(b).unwrap_or(Ordering::Equal));
    values
}

pub fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    Some(values.iter().sum::<f64>() / values.len() as f64)
}

/// Population standard deviation.
pub fn std_dev(values: &[f64]) -> Option<f64> {
    let mean = mean(values)?;
    let variance =
        values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / values.len() as f64;
    Some(variance.sqrt())
}

/// Quantile with linear interpolation between the two closest ranks.
pub fn quantile(values: &[f64], q: f64) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let values = sorted(values);
    let position = (values.len() - 1) as f64 * q.clamp(0.0, 1.0);
    let lower = position.floor() as usize;
    let upper = position.ceil() as usize;
    let fraction = position - lower as f64;
    Some(values[lower] + (values[upper] - values[lower]) * fraction)
}

pub fn median(values: &[f64]) -> Option<f64> {
    quantile(values, 0.5)
}

/// Percentile rank (0, 100] of every value; ties share their averaged rank.
pub fn percentile_ranks(values: &[f64]) -> Vec<f64> {
    let n = values.len();
    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by(|&a, &b| values[a].partial_cmp(&values[b]).unwrap_or(Ordering::Equal));

    let mut ranks = vec![0.0; n];
    let mut i = 0;
    while i < n {
        let mut j = i;
        while j + 1 < n && values[order[j + 1]] == values[order[i]] {
            j += 1;
        }
        // 1-based ranks i+1 ..= j+1 share their average
        let average = (i + j) as f64 / 2.0 + 1.0;
        for &index in &order[i..=j] {
            ranks[index] = average / n as f64 * 100.0;
        }
        i = j + 1;
    }
    ranks
}

/// Buckets at the 25/50/75 percentiles; a value on a cut point belongs to the lower bucket.
pub fn assign_quartiles(values: &[f64]) -> Vec<Quartile> {
    let (Some(q25), Some(q50), Some(q75)) = (
        quantile(values, 0.25),
        quantile(values, 0.50),
        quantile(values, 0.75),
    ) else {
        return Vec::new();
    };

    values
        .iter()
        .map(|&v| {
            if v <= q25 {
                Quartile::Q1
            } else if v <= q50 {
                Quartile::Q2
            } else if v <= q75 {
                Quartile::Q3
            } else {
                Quartile::Q4
            }
        })
        .collect()
}

/// Equal-frequency binning into `bins` groups, returning each value's bin index.
///
/// The first bin is closed on both ends, the others only on the right. Returns `None`
/// when there is nothing to bin or when two quantile edges coincide.
pub fn qcut(values: &[f64], bins: usize) -> Option<Vec<usize>> {
    if values.is_empty() || bins == 0 {
        return None;
    }

    let edges: Vec<f64> = (0..=bins)
        .map(|i| quantile(values, i as f64 / bins as f64))
        .collect::<Option<_>>()?;
    if edges.windows(2).any(|pair| pair[0] >= pair[1]) {
        return None;
    }

    values
        .iter()
        .map(|&v| (0..bins).find(|&i| v <= edges[i + 1]))
        .collect()
}

/// Classifies a chronological percentile sequence; shorter than three points is `None`.
pub fn classify_trajectory(percentiles: &[f64]) -> Option<Trajectory> {
    if percentiles.len() < 3 {
        return None;
    }

    let first = percentiles[0];
    let last = percentiles[percentiles.len() - 1];
    let mean = mean(percentiles)?;
    let volatility = std_dev(percentiles)?;
    let slope = (last - first) / percentiles.len() as f64;
    let lowest = percentiles.iter().copied().fold(f64::INFINITY, f64::min);

    let trajectory = if mean >= 60.0 && volatility < 10.0 {
        Trajectory::StableHigh
    } else if mean <= 40.0 && volatility < 10.0 {
        Trajectory::StableLow
    } else if slope >= 5.0 {
        Trajectory::Rising
    } else if slope <= -5.0 {
        Trajectory::Falling
    } else if lowest <= first - 10.0 && last >= first {
        Trajectory::Recovering
    } else if volatility >= 15.0 {
        Trajectory::Volatile
    } else {
        Trajectory::Other
    };
    Some(trajectory)
}

/// Interquartile range, or `None` when fewer than `min_sample` scores are available.
pub fn inequality_spread(scores: &[f64], min_sample: usize) -> Option<f64> {
    if scores.is_empty() || scores.len() < min_sample {
        return None;
    }
    Some(quantile(scores, 0.75)? - quantile(scores, 0.25)?)
}

pub fn usage_change_bin(delta_hours: f64) -> UsageChange {
    if delta_hours <= -5.0 {
        UsageChange::LargeDecrease
    } else if delta_hours <= -1.0 {
        UsageChange::SlightDecrease
    } else if delta_hours <= 1.0 {
        UsageChange::NoChange
    } else if delta_hours <= 5.0 {
        UsageChange::SlightIncrease
    } else {
        UsageChange::LargeIncrease
    }
}

/// Usage pattern in the two windows following a setback.
pub fn engagement_pattern(first_hours: f64, second_hours: f64) -> EngagementPattern {
    match (first_hours > 0.0, second_hours > 0.0) {
        (false, false) => EngagementPattern::NoUsage,
        (true, false) => EngagementPattern::Temporary,
        (false, true) => EngagementPattern::Delayed,
        (true, true) if second_hours >= first_hours * 0.7 => EngagementPattern::Sustained,
        (true, true) => EngagementPattern::Unstable,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn approx(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn quantile_interpolates_linearly() {
        let values = [1.0, 2.0, 3.0, 4.0];
        assert!(approx(quantile(&values, 0.25).unwrap(), 1.75));
        assert!(approx(quantile(&values, 0.5).unwrap(), 2.5));
        assert!(approx(quantile(&values, 1.0).unwrap(), 4.0));
        assert!(quantile(&[], 0.5).is_none());
    }

    #[test]
    fn percentile_ranks_average_ties() {
        let ranks = percentile_ranks(&[10.0, 20.0, 20.0, 40.0]);
        assert!(approx(ranks[0], 25.0));
        assert!(approx(ranks[1], 62.5));
        assert!(approx(ranks[2], 62.5));
        assert!(approx(ranks[3], 100.0));
    }

    #[test]
    fn unique_extremes_get_boundary_ranks() {
        let ranks = percentile_ranks(&[55.0, 12.0, 90.0, 70.0, 31.0]);
        assert!(approx(ranks[2], 100.0));
        assert!(approx(ranks[1], 20.0));

        let single = percentile_ranks(&[42.0]);
        assert!(approx(single[0], 100.0));
    }

    #[test]
    fn quartiles_partition_every_value() {
        let values: Vec<f64> = (0..37).map(|i| ((i * 7) % 11) as f64).collect();
        let quartiles = assign_quartiles(&values);
        assert_eq!(quartiles.len(), values.len());

        let counts: usize = Quartile::ALL
            .iter()
            .map(|q| quartiles.iter().filter(|x| *x == q).count())
            .sum();
        assert_eq!(counts, values.len());
    }

    #[test]
    fn quartile_cut_points_fall_in_lower_bucket() {
        let values = [1.0, 2.0, 3.0, 4.0, 5.0];
        // q25 = 2, q50 = 3, q75 = 4
        assert_eq!(
            assign_quartiles(&values),
            vec![Quartile::Q1, Quartile::Q1, Quartile::Q2, Quartile::Q3, Quartile::Q4]
        );
    }

    #[test]
    fn all_zero_usage_lands_in_first_quartile() {
        let quartiles = assign_quartiles(&[0.0, 0.0, 0.0]);
        assert!(quartiles.iter().all(|q| *q == Quartile::Q1));
    }

    #[test]
    fn qcut_splits_evenly_and_rejects_duplicate_edges() {
        let bins = qcut(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0], 4).unwrap();
        assert_eq!(bins, vec![0, 0, 1, 1, 2, 2, 3, 3]);

        assert!(qcut(&[0.0, 0.0, 0.0, 1.0], 4).is_none());
        assert!(qcut(&[], 3).is_none());
    }

    #[test]
    fn trajectory_worked_example_is_other() {
        assert_eq!(classify_trajectory(&[50.0, 55.0, 62.0]), Some(Trajectory::Other));
    }

    #[test]
    fn trajectory_follows_fixed_rule_order() {
        assert_eq!(classify_trajectory(&[70.0, 72.0, 68.0]), Some(Trajectory::StableHigh));
        assert_eq!(classify_trajectory(&[20.0, 25.0, 22.0]), Some(Trajectory::StableLow));
        assert_eq!(classify_trajectory(&[30.0, 45.0, 60.0]), Some(Trajectory::Rising));
        assert_eq!(classify_trajectory(&[80.0, 65.0, 50.0]), Some(Trajectory::Falling));
        assert_eq!(
            classify_trajectory(&[50.0, 38.0, 52.0]),
            Some(Trajectory::Recovering)
        );
        assert_eq!(
            classify_trajectory(&[50.0, 90.0, 45.0, 85.0, 48.0]),
            Some(Trajectory::Volatile)
        );
        // slope is 6 but the stable-high rule is checked first
        assert_eq!(classify_trajectory(&[61.0, 61.0, 79.0]), Some(Trajectory::StableHigh));
    }

    #[test]
    fn trajectory_needs_three_points() {
        assert_eq!(classify_trajectory(&[10.0, 90.0]), None);
    }

    #[test]
    fn inequality_requires_minimum_sample() {
        let nineteen: Vec<f64> = (0..19).map(f64::from).collect();
        let twenty: Vec<f64> = (0..20).map(f64::from).collect();
        assert_eq!(inequality_spread(&nineteen, 20), None);
        assert!(approx(inequality_spread(&twenty, 20).unwrap(), 9.5));
    }

    #[test]
    fn usage_change_bins_are_right_closed() {
        assert_eq!(usage_change_bin(-5.0), UsageChange::LargeDecrease);
        assert_eq!(usage_change_bin(-4.9), UsageChange::SlightDecrease);
        assert_eq!(usage_change_bin(1.0), UsageChange::NoChange);
        assert_eq!(usage_change_bin(5.0), UsageChange::SlightIncrease);
        assert_eq!(usage_change_bin(5.1), UsageChange::LargeIncrease);
    }

    #[test]
    fn engagement_patterns_cover_all_cases() {
        assert_eq!(engagement_pattern(0.0, 0.0), EngagementPattern::NoUsage);
        assert_eq!(engagement_pattern(2.0, 0.0), EngagementPattern::Temporary);
        assert_eq!(engagement_pattern(0.0, 1.0), EngagementPattern::Delayed);
        assert_eq!(engagement_pattern(2.0, 1.5), EngagementPattern::Sustained);
        assert_eq!(engagement_pattern(2.0, 1.0), EngagementPattern::Unstable);
    }
}
