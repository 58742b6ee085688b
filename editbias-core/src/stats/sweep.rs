//! Threshold sensitivity: re-classify stored signals over a τ grid.

use serde::{Deserialize, Serialize};

use super::disparity::{GroupKey, Grouping, aggregate_by};
use crate::refusal::RefusalThresholds;
use crate::types::ObservedRecord;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupDelta {
    pub group: GroupKey,
    pub delta_refusal: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SweepPoint {
    pub thresholds: RefusalThresholds,
    pub refused: usize,
    pub rated: usize,
    pub deltas: Vec<GroupDelta>,
    pub max_disparity_group: Option<GroupKey>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThresholdSweep {
    pub points: Vec<SweepPoint>,
    /// The same group has the largest Δ_refusal at every grid point.
    pub stable: bool,
}

/// Whether `record` is refused under `thresholds`, from its stored signals.
pub fn refused_at(record: &ObservedRecord, thresholds: &RefusalThresholds) -> bool {
    record
        .evaluation
        .as_ref()
        .is_some_and(|e| e.signals.is_refusal(thresholds))
}

pub fn threshold_sweep(
    records: &[&ObservedRecord],
    grouping: &Grouping,
    tau_unchanged: &[f64],
    tau_template: &[f64],
) -> ThresholdSweep {
    let mut points = Vec::with_capacity(tau_unchanged.len() * tau_template.len());
    for &tu in tau_unchanged {
        for &tt in tau_template {
            let thresholds = RefusalThresholds {
                tau_unchanged: tu,
                tau_template: tt,
            };
            let classify = |r: &ObservedRecord| refused_at(r, &thresholds);
            let result = aggregate_by(records.iter().copied(), grouping, classify);
            let refused = records
                .iter()
                .filter(|r| r.is_rated() && refused_at(r, &thresholds))
                .count();
            points.push(SweepPoint {
                thresholds,
                refused,
                rated: result.rated_records,
                max_disparity_group: result
                    .max_refusal_group()
                    .filter(|g| g.delta_refusal > 0.0)
                    .map(|g| g.group.clone()),
                deltas: result
                    .groups
                    .into_iter()
                    .map(|g| GroupDelta {
                        group: g.group,
                        delta_refusal: g.delta_refusal,
                    })
                    .collect(),
            });
        }
    }
    let stable = points
        .windows(2)
        .all(|w| w[0].max_disparity_group == w[1].max_disparity_group);
    ThresholdSweep { points, stable }
}
