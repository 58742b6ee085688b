//! Cluster bootstrap over source images.
//!
//! Resampling units are source images in image-to-image mode. Text-to-image
//! records have no source, so each record is its own unit.

use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::disparity::{DisparityResult, GroupKey, Grouping, aggregate_by};
use crate::types::ObservedRecord;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntervalEstimate {
    pub group: GroupKey,
    /// `refusal_rate`, `erasure_rate`, `delta_refusal` or `delta_erasure`.
    pub metric: String,
    /// Attribute value for rate metrics.
    pub value: Option<String>,
    pub point: f64,
    pub lower: f64,
    pub upper: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BootstrapIntervals {
    pub iterations: usize,
    pub confidence_level: f64,
    pub resampling_units: usize,
    pub estimates: Vec<IntervalEstimate>,
}

type MetricId = (GroupKey, &'static str, Option<String>);

fn metrics(result: &DisparityResult) -> Vec<(MetricId, f64)> {
    let mut out = Vec::new();
    for group in &result.groups {
        out.push(((group.group.clone(), "delta_refusal", None), group.delta_refusal));
        out.push(((group.group.clone(), "delta_erasure", None), group.delta_erasure));
        for cell in &group.cells {
            out.push((
                (group.group.clone(), "refusal_rate", Some(cell.value.clone())),
                cell.refusal_rate,
            ));
            if let Some(rate) = cell.erasure_rate {
                out.push((
                    (group.group.clone(), "erasure_rate", Some(cell.value.clone())),
                    rate,
                ));
            }
        }
    }
    out
}

fn unit_of(record: &ObservedRecord) -> String {
    if record.key.has_source() {
        record.key.source_image_id.clone()
    } else {
        record.key.to_string()
    }
}

/// Percentile of sorted data with linear interpolation, `pct` in `[0, 100]`.
pub fn percentile(sorted: &[f64], pct: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    if sorted.len() == 1 {
        return sorted[0];
    }
    let rank = (pct / 100.0) * (sorted.len() - 1) as f64;
    let lower = rank.floor() as usize;
    let upper = rank.ceil() as usize;
    if lower == upper {
        sorted[lower]
    } else {
        let frac = rank - lower as f64;
        sorted[lower] * (1.0 - frac) + sorted[upper] * frac
    }
}

/// Percentile intervals for every rate and Δ in `point`.
///
/// `point` must be the aggregation of `records` under `grouping`. A metric
/// missing from a resample (its group had no records) is skipped for that
/// iteration.
pub fn bootstrap(
    records: &[&ObservedRecord],
    grouping: &Grouping,
    point: &DisparityResult,
    iterations: usize,
    confidence_level: f64,
    seed: u64,
) -> BootstrapIntervals {
    let mut units: BTreeMap<String, Vec<&ObservedRecord>> = BTreeMap::new();
    for &record in records {
        units.entry(unit_of(record)).or_default().push(record);
    }
    let clusters: Vec<&Vec<&ObservedRecord>> = units.values().collect();

    let estimates = metrics(point);
    let mut samples: BTreeMap<MetricId, Vec<f64>> = estimates
        .iter()
        .map(|(id, _)| (id.clone(), Vec::with_capacity(iterations)))
        .collect();

    let mut rng = StdRng::seed_from_u64(seed);
    if !clusters.is_empty() {
        for _ in 0..iterations {
            let resample: Vec<&ObservedRecord> = (0..clusters.len())
                .filter_map(|_| clusters.choose(&mut rng))
                .flat_map(|c| c.iter().copied())
                .collect();
            let result = aggregate_by(resample, grouping, ObservedRecord::is_refused);
            for (id, value) in metrics(&result) {
                if let Some(s) = samples.get_mut(&id) {
                    s.push(value);
                }
            }
        }
    }

    let tail = (1.0 - confidence_level) / 2.0 * 100.0;
    BootstrapIntervals {
        iterations,
        confidence_level,
        resampling_units: clusters.len(),
        estimates: estimates
            .into_iter()
            .map(|((group, metric, value), point)| {
                let mut s = samples
                    .remove(&(group.clone(), metric, value.clone()))
                    .unwrap_or_default();
                s.sort_by(f64::total_cmp);
                let (lower, upper) = if s.is_empty() {
                    (point, point)
                } else {
                    (percentile(&s, tail), percentile(&s, 100.0 - tail))
                };
                IntervalEstimate {
                    group,
                    metric: metric.to_string(),
                    value,
                    point,
                    lower,
                    upper,
                }
            })
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StatsConfig;
    use crate::stats::disparity::aggregate;
    use crate::stats::fixtures::RecordBuilder;

    fn records() -> Vec<ObservedRecord> {
        let mut out = Vec::new();
        for image in 0..20 {
            out.push(
                RecordBuilder::new("b1", "race", "A")
                    .image(image)
                    .refused(image % 4 == 0)
                    .build(),
            );
            out.push(
                RecordBuilder::new("b1", "race", "B")
                    .image(image)
                    .refused(image % 2 == 0)
                    .build(),
            );
        }
        out
    }

    #[test]
    fn test_intervals_bracket_point_estimates() {
        let records = records();
        let grouping = Grouping::from_config(&StatsConfig::default());
        let point = aggregate(&records, &grouping).unwrap();
        let refs: Vec<&ObservedRecord> = records.iter().collect();

        let intervals = bootstrap(&refs, &grouping, &point, 300, 0.95, 7);
        assert_eq!(intervals.resampling_units, 20);
        let delta = intervals
            .estimates
            .iter()
            .find(|e| e.metric == "delta_refusal")
            .unwrap();
        assert_eq!(delta.point, 0.25);
        assert!(delta.lower <= delta.point && delta.point <= delta.upper);
        assert!(delta.upper > delta.lower);

        let again = bootstrap(&refs, &grouping, &point, 300, 0.95, 7);
        assert_eq!(intervals, again);
    }

    #[test]
    fn test_percentile_interpolates() {
        let data = [1.0, 2.0, 3.0, 4.0, 5.0];
        assert_eq!(percentile(&data, 50.0), 3.0);
        assert_eq!(percentile(&data, 25.0), 2.0);
        assert!((percentile(&data, 10.0) - 1.4).abs() < 1e-12);
        assert_eq!(percentile(&[], 50.0), 0.0);
    }
}
