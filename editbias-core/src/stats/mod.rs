//! Stage IV: disparity and statistics engine.
//!
//! [`analyze`] validates the neutral baseline first and refuses to report
//! anything if it fails. Everything else reads stored records only: the
//! threshold sweep re-classifies stored refusal signals instead of re-running
//! detection.

pub mod anova;
pub mod baseline;
pub mod bootstrap;
pub mod disparity;
pub mod mixed;
pub mod pairwise;
pub mod scs;
pub mod special;
pub mod sweep;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{info, warn};

use crate::config::AuditConfig;
use crate::ensemble::agreement::{AgreementResult, ensemble_agreement};
use crate::error::AnalysisError;
use crate::refusal::{RefusalCause, RefusalThresholds};
use crate::types::{EvaluationRecord, GenerationStatus, NEUTRAL, ObservedRecord};

pub use anova::{OneWayAnova, TwoWayAnova};
pub use baseline::{BaselineCheck, baseline_check};
pub use bootstrap::BootstrapIntervals;
pub use disparity::{
    DisparityResult, ErasureRule, GroupDisparity, GroupKey, GroupScope, Grouping, RateCell,
    aggregate,
};
pub use mixed::MixedModelFit;
pub use pairwise::PairwiseComparison;
pub use scs::ScsSummary;
pub use sweep::ThresholdSweep;

/// `axis=value`, or `neutral` for the control.
pub(crate) fn value_label(record: &ObservedRecord) -> String {
    match &record.axis {
        Some(axis) => format!("{axis}={}", record.value),
        None => NEUTRAL.to_string(),
    }
}

/// Counts per error category.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ErrorCounts {
    /// Stage I rejections by reason code.
    pub validation_rejections: BTreeMap<String, usize>,
    pub generation_errors: usize,
    /// Hard refusals by cause.
    pub refusals: BTreeMap<String, usize>,
    pub needs_review: usize,
    pub single_evaluator: usize,
    pub synthetic_source_records: usize,
}

impl ErrorCounts {
    pub fn from_records(records: &[ObservedRecord]) -> Self {
        let mut counts = ErrorCounts::default();
        for record in records {
            if record.status == GenerationStatus::Error {
                counts.generation_errors += 1;
            }
            if record.synthetic_source {
                counts.synthetic_source_records += 1;
            }
            let Some(evaluation) = &record.evaluation else {
                continue;
            };
            if let Some(cause) = evaluation.refusal_cause {
                *counts.refusals.entry(cause.as_str().to_string()).or_default() += 1;
            }
            if let Some(verdict) = &evaluation.verdict {
                if verdict.needs_review {
                    counts.needs_review += 1;
                }
                if verdict.is_single_evaluator() {
                    counts.single_evaluator += 1;
                }
            }
        }
        counts
    }

    pub fn refusals_by(&self, cause: RefusalCause) -> usize {
        self.refusals.get(cause.as_str()).copied().unwrap_or(0)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AnovaSection {
    pub by_attribute: Vec<OneWayAnova>,
    pub by_category: Vec<OneWayAnova>,
    pub interaction: Vec<TwoWayAnova>,
}

/// Everything Stage IV produces.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatisticalReport {
    pub generated_at: DateTime<Utc>,
    pub thresholds: RefusalThresholds,
    pub records: usize,
    pub rated_records: usize,
    pub excluded_synthetic: usize,
    pub baseline: BaselineCheck,
    pub disparity: DisparityResult,
    /// Same rates with categories pooled.
    pub disparity_by_axis: DisparityResult,
    pub scs: Vec<ScsSummary>,
    pub anova: AnovaSection,
    pub pairwise: Vec<PairwiseComparison>,
    pub mixed_models: Vec<MixedModelFit>,
    pub bootstrap: BootstrapIntervals,
    pub sweep: ThresholdSweep,
    pub agreement: Vec<AgreementResult>,
    pub errors: ErrorCounts,
}

impl StatisticalReport {
    pub fn with_rejections(mut self, rejections: BTreeMap<String, usize>) -> Self {
        self.errors.validation_rejections = rejections;
        self
    }
}

/// Run the full analysis over terminal records.
pub fn analyze(
    records: &[ObservedRecord],
    config: &AuditConfig,
) -> Result<StatisticalReport, AnalysisError> {
    disparity::ensure_terminal(records)?;
    let stats = &config.stats;

    let working: Vec<&ObservedRecord> = records
        .iter()
        .filter(|r| !(stats.exclude_synthetic && r.synthetic_source))
        .collect();
    let excluded_synthetic = records.len() - working.len();
    let rated: Vec<&ObservedRecord> = working.iter().copied().filter(|r| r.is_rated()).collect();
    if rated.is_empty() {
        return Err(AnalysisError::InsufficientData {
            message: format!("no rated records among {}", records.len()),
        });
    }

    let baseline = baseline_check(&working, stats.baseline_noise_threshold);
    if !baseline.passed {
        let diagnostic = baseline.diagnostic();
        warn!(%diagnostic, "Baseline validation failed");
        return Err(AnalysisError::BaselineValidationFailed { diagnostic });
    }
    if let Some(note) = &baseline.note {
        info!(note = %note, "Baseline validation passed with a caveat");
    }

    let grouping = Grouping::from_config(stats);
    let disparity =
        disparity::aggregate_by(working.iter().copied(), &grouping, ObservedRecord::is_refused);
    let disparity_by_axis = disparity::aggregate_by(
        working.iter().copied(),
        &grouping.with_scope(GroupScope::Axis),
        ObservedRecord::is_refused,
    );

    let backends: BTreeSet<&str> = rated.iter().map(|r| r.key.backend.as_str()).collect();
    let mut anova = AnovaSection::default();
    let mut mixed_models = Vec::new();
    for backend in &backends {
        let subset: Vec<&ObservedRecord> = rated
            .iter()
            .copied()
            .filter(|r| r.key.backend == *backend)
            .collect();
        let y = |r: &ObservedRecord| if r.is_refused() { 1.0 } else { 0.0 };

        let by_value: Vec<(String, f64)> = subset.iter().map(|&r| (value_label(r), y(r))).collect();
        let by_category: Vec<(String, f64)> =
            subset.iter().map(|&r| (r.category.clone(), y(r))).collect();
        let crossed: Vec<(String, String, f64)> = subset
            .iter()
            .map(|&r| (value_label(r), r.category.clone(), y(r)))
            .collect();
        anova
            .by_attribute
            .extend(anova::one_way(backend, "attribute_value", &by_value));
        anova
            .by_category
            .extend(anova::one_way(backend, "category", &by_category));
        anova.interaction.extend(anova::two_way(
            backend,
            "attribute_value",
            "category",
            &crossed,
        ));

        let data = mixed::GlmmData::from_records(&subset);
        mixed_models.push(mixed::fit(backend, &data, stats.mixed_model_max_iterations));
    }

    let evaluations: Vec<EvaluationRecord> = working
        .iter()
        .filter_map(|r| r.evaluation.clone())
        .collect();

    let report = StatisticalReport {
        generated_at: Utc::now(),
        thresholds: config.refusal.thresholds(),
        records: records.len(),
        rated_records: rated.len(),
        excluded_synthetic,
        scs: scs::stereotype_congruence(&working, stats.scs_min_baseline_rate),
        pairwise: pairwise::pairwise_refusal_tests(&disparity, stats.correction, stats.alpha),
        bootstrap: bootstrap::bootstrap(
            &working,
            &grouping,
            &disparity,
            stats.bootstrap_iterations,
            stats.confidence_level,
            config.run.seed,
        ),
        sweep: sweep::threshold_sweep(
            &working,
            &grouping,
            &stats.sweep_tau_unchanged,
            &stats.sweep_tau_template,
        ),
        agreement: ensemble_agreement(&evaluations, &config.ensemble.dimensions),
        errors: ErrorCounts::from_records(records),
        baseline,
        disparity,
        disparity_by_axis,
        anova,
        mixed_models,
    };
    info!(
        records = report.records,
        rated = report.rated_records,
        groups = report.disparity.groups.len(),
        "Stage IV analysis complete"
    );
    Ok(report)
}
