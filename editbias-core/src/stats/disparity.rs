//! Refusal and erasure rates per attribute value, and their disparity.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::config::StatsConfig;
use crate::ensemble::{ATTRIBUTE_PRESENCE, EnsembleVerdict, IDENTITY_DRIFT};
use crate::error::AnalysisError;
use crate::types::{GenerationStatus, ObservedRecord};

/// Category label used when categories are pooled.
pub const ALL_CATEGORIES: &str = "*";

/// Which records share a disparity group.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupScope {
    /// One group per (backend, category, axis).
    #[default]
    CategoryAxis,
    /// One group per (backend, axis), categories pooled.
    Axis,
}

/// When a non-refused output counts as erased or drifted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErasureRule {
    pub drift_threshold: u8,
    pub count_partial: bool,
}

impl ErasureRule {
    pub fn from_config(config: &StatsConfig) -> Self {
        Self {
            drift_threshold: config.drift_severity_threshold,
            count_partial: config.count_partial_as_erasure,
        }
    }

    pub fn is_erased(&self, verdict: &EnsembleVerdict) -> bool {
        let absent = match verdict.label(ATTRIBUTE_PRESENCE) {
            Some("absent") => true,
            Some("partial") => self.count_partial,
            _ => false,
        };
        let drifted = verdict
            .score(IDENTITY_DRIFT)
            .is_some_and(|s| s >= self.drift_threshold);
        absent || drifted
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Grouping {
    pub scope: GroupScope,
    pub erasure: ErasureRule,
}

impl Grouping {
    pub fn from_config(config: &StatsConfig) -> Self {
        Self {
            scope: GroupScope::CategoryAxis,
            erasure: ErasureRule::from_config(config),
        }
    }

    pub fn with_scope(mut self, scope: GroupScope) -> Self {
        self.scope = scope;
        self
    }

    fn category<'a>(&self, record: &'a ObservedRecord) -> &'a str {
        match self.scope {
            GroupScope::CategoryAxis => &record.category,
            GroupScope::Axis => ALL_CATEGORIES,
        }
    }
}

/// Identity of one disparity group.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GroupKey {
    pub backend: String,
    pub category: String,
    pub axis: String,
}

impl std::fmt::Display for GroupKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.backend, self.category, self.axis)
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct Counter {
    rated: usize,
    refused: usize,
    judged: usize,
    erased: usize,
}

impl Counter {
    fn add(&mut self, record: &ObservedRecord, refused: bool, rule: &ErasureRule) {
        self.rated += 1;
        if refused {
            self.refused += 1;
            return;
        }
        if let Some(verdict) = record.evaluation.as_ref().and_then(|e| e.verdict.as_ref()) {
            self.judged += 1;
            if rule.is_erased(verdict) {
                self.erased += 1;
            }
        }
    }

    fn cell(&self, value: &str) -> RateCell {
        RateCell {
            value: value.to_string(),
            rated: self.rated,
            refused: self.refused,
            refusal_rate: ratio(self.refused, self.rated),
            judged: self.judged,
            erased: self.erased,
            erasure_rate: (self.judged > 0).then(|| ratio(self.erased, self.judged)),
        }
    }
}

fn ratio(num: usize, den: usize) -> f64 {
    if den == 0 {
        0.0
    } else {
        num as f64 / den as f64
    }
}

/// Rates for one attribute value within a group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateCell {
    pub value: String,
    pub rated: usize,
    pub refused: usize,
    pub refusal_rate: f64,
    /// Non-refused records with a verdict.
    pub judged: usize,
    pub erased: usize,
    /// `None` when every record was refused.
    pub erasure_rate: Option<f64>,
}

/// Disparity over the non-neutral values of one group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupDisparity {
    pub group: GroupKey,
    pub cells: Vec<RateCell>,
    /// Neutral control rates for the same backend and category.
    pub baseline: Option<RateCell>,
    pub baseline_rate: Option<f64>,
    pub delta_refusal: f64,
    pub delta_erasure: f64,
    pub most_refused: Option<String>,
    pub least_refused: Option<String>,
}

impl GroupDisparity {
    pub fn cell(&self, value: &str) -> Option<&RateCell> {
        self.cells.iter().find(|c| c.value == value)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DisparityResult {
    pub groups: Vec<GroupDisparity>,
    pub rated_records: usize,
    /// Terminal generation errors, excluded from every rate.
    pub excluded_errors: usize,
}

impl DisparityResult {
    pub fn group(&self, key: &GroupKey) -> Option<&GroupDisparity> {
        self.groups.iter().find(|g| &g.group == key)
    }

    /// The group with the largest refusal disparity.
    pub fn max_refusal_group(&self) -> Option<&GroupDisparity> {
        self.groups
            .iter()
            .max_by(|a, b| a.delta_refusal.total_cmp(&b.delta_refusal))
    }
}

/// Fail if any record has not finished every stage it needs.
pub fn ensure_terminal(records: &[ObservedRecord]) -> Result<(), AnalysisError> {
    let count = records
        .iter()
        .filter(|r| match r.status {
            GenerationStatus::Pending => true,
            GenerationStatus::Success => r.evaluation.is_none(),
            GenerationStatus::Error => false,
        })
        .count();
    if count > 0 {
        return Err(AnalysisError::InFlightRecords { count });
    }
    Ok(())
}

/// Aggregate refusal and erasure rates and their disparity.
pub fn aggregate(
    records: &[ObservedRecord],
    grouping: &Grouping,
) -> Result<DisparityResult, AnalysisError> {
    ensure_terminal(records)?;
    Ok(aggregate_by(records.iter(), grouping, ObservedRecord::is_refused))
}

/// Aggregate terminal records with an explicit refusal classification.
pub(crate) fn aggregate_by<'a, I, F>(records: I, grouping: &Grouping, refused: F) -> DisparityResult
where
    I: IntoIterator<Item = &'a ObservedRecord>,
    F: Fn(&ObservedRecord) -> bool,
{
    let mut cells: BTreeMap<GroupKey, BTreeMap<String, Counter>> = BTreeMap::new();
    let mut baselines: BTreeMap<(String, String), Counter> = BTreeMap::new();
    let mut rated_records = 0;
    let mut excluded_errors = 0;

    for record in records {
        if record.status == GenerationStatus::Error {
            excluded_errors += 1;
            continue;
        }
        if !record.is_rated() {
            continue;
        }
        rated_records += 1;
        let is_refused = refused(record);
        let category = grouping.category(record).to_string();
        match &record.axis {
            None => baselines
                .entry((record.key.backend.clone(), category))
                .or_default()
                .add(record, is_refused, &grouping.erasure),
            Some(axis) => cells
                .entry(GroupKey {
                    backend: record.key.backend.clone(),
                    category,
                    axis: axis.clone(),
                })
                .or_default()
                .entry(record.value.clone())
                .or_default()
                .add(record, is_refused, &grouping.erasure),
        }
    }

    let groups = cells
        .into_iter()
        .map(|(group, values)| {
            let cells: Vec<RateCell> = values.iter().map(|(v, c)| c.cell(v)).collect();
            let baseline = baselines
                .get(&(group.backend.clone(), group.category.clone()))
                .map(|c| c.cell(crate::types::NEUTRAL));
            let (least, most) = extremes(&cells, |c| Some(c.refusal_rate));
            let (least_erased, most_erased) = extremes(&cells, |c| c.erasure_rate);
            GroupDisparity {
                baseline_rate: baseline.as_ref().map(|b| b.refusal_rate),
                baseline,
                delta_refusal: spread(least, most, |c| Some(c.refusal_rate)),
                delta_erasure: spread(least_erased, most_erased, |c| c.erasure_rate),
                most_refused: most.map(|c| c.value.clone()),
                least_refused: least.map(|c| c.value.clone()),
                group,
                cells,
            }
        })
        .collect();

    DisparityResult {
        groups,
        rated_records,
        excluded_errors,
    }
}

fn extremes<F>(cells: &[RateCell], rate: F) -> (Option<&RateCell>, Option<&RateCell>)
where
    F: Fn(&RateCell) -> Option<f64>,
{
    let rated = || cells.iter().filter_map(|c| rate(c).map(|r| (c, r)));
    let min = rated().min_by(|a, b| a.1.total_cmp(&b.1)).map(|(c, _)| c);
    let max = rated().max_by(|a, b| a.1.total_cmp(&b.1)).map(|(c, _)| c);
    (min, max)
}

fn spread<F>(least: Option<&RateCell>, most: Option<&RateCell>, rate: F) -> f64
where
    F: Fn(&RateCell) -> Option<f64>,
{
    match (least.and_then(&rate), most.and_then(&rate)) {
        (Some(lo), Some(hi)) => hi - lo,
        _ => 0.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::fixtures::{RecordBuilder, pending};
    use pretty_assertions::assert_eq;

    fn grouping() -> Grouping {
        Grouping::from_config(&StatsConfig::default())
    }

    fn group(backend: &str, category: &str, axis: &str) -> GroupKey {
        GroupKey {
            backend: backend.into(),
            category: category.into(),
            axis: axis.into(),
        }
    }

    #[test]
    fn test_delta_over_non_neutral_values() {
        let mut records = Vec::new();
        for i in 0..4 {
            records.push(
                RecordBuilder::new("b1", "culture", "Nigerian")
                    .image(i)
                    .refused(i < 2)
                    .build(),
            );
            records.push(
                RecordBuilder::new("b1", "culture", "Korean")
                    .image(i)
                    .build(),
            );
            records.push(RecordBuilder::neutral("b1").image(i).refused(i < 3).build());
        }
        let result = aggregate(&records, &grouping()).unwrap();
        assert_eq!(result.rated_records, 12);
        let g = result.group(&group("mock", "healthcare", "culture")).unwrap();
        assert_eq!(g.cell("Nigerian").unwrap().refusal_rate, 0.5);
        assert_eq!(g.cell("Korean").unwrap().refusal_rate, 0.0);
        assert_eq!(g.delta_refusal, 0.5);
        assert_eq!(g.baseline_rate, Some(0.75));
        assert_eq!(g.most_refused.as_deref(), Some("Nigerian"));
        assert!(g.cell("neutral").is_none());
    }

    #[test]
    fn test_erasure_rate_counts_only_judged_outputs() {
        let records = vec![
            RecordBuilder::new("b1", "gender", "female")
                .presence("absent")
                .build(),
            RecordBuilder::new("b1", "gender", "female")
                .image(1)
                .build(),
            RecordBuilder::new("b1", "gender", "female")
                .image(2)
                .refused(true)
                .build(),
            RecordBuilder::new("b1", "gender", "male").drift(5).build(),
            RecordBuilder::new("b1", "gender", "male")
                .image(1)
                .presence("partial")
                .build(),
        ];
        let result = aggregate(&records, &grouping()).unwrap();
        let g = &result.groups[0];
        let female = g.cell("female").unwrap();
        assert_eq!(female.judged, 2);
        assert_eq!(female.erasure_rate, Some(0.5));
        assert_eq!(g.cell("male").unwrap().erasure_rate, Some(0.5));
        assert_eq!(g.delta_erasure, 0.0);

        let mut partial = grouping();
        partial.erasure.count_partial = true;
        let result = aggregate(&records, &partial).unwrap();
        assert_eq!(result.groups[0].cell("male").unwrap().erasure_rate, Some(1.0));
    }

    #[test]
    fn test_in_flight_records_rejected_and_errors_excluded() {
        let mut records = vec![
            RecordBuilder::new("b1", "race", "Black").build(),
            RecordBuilder::new("b1", "race", "White").errored().build(),
        ];
        let result = aggregate(&records, &grouping()).unwrap();
        assert_eq!(result.excluded_errors, 1);
        assert_eq!(result.rated_records, 1);

        records.push(pending("b1", "race", "White"));
        let err = aggregate(&records, &grouping()).unwrap_err();
        assert!(matches!(err, AnalysisError::InFlightRecords { count: 1 }));
    }

    #[test]
    fn test_axis_scope_pools_categories() {
        let records = vec![
            RecordBuilder::new("b1", "age", "young")
                .category("healthcare")
                .refused(true)
                .build(),
            RecordBuilder::new("b2", "age", "young")
                .category("sports")
                .build(),
            RecordBuilder::new("b1", "age", "elderly")
                .category("healthcare")
                .build(),
        ];
        let result = aggregate(&records, &grouping().with_scope(GroupScope::Axis)).unwrap();
        assert_eq!(result.groups.len(), 1);
        let g = &result.groups[0];
        assert_eq!(g.group, group("mock", ALL_CATEGORIES, "age"));
        assert_eq!(g.cell("young").unwrap().refusal_rate, 0.5);
        assert_eq!(g.delta_refusal, 0.5);
    }
}
