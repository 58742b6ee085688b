//! Inter-evaluator agreement metrics.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::hash::Hash;

use super::{DimensionKind, DimensionSpec};
use crate::types::EvaluationRecord;

/// Agreement on one dimension across the stored raw judge responses.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgreementResult {
    pub dimension: String,
    pub method: String,
    pub score: f64,
    pub annotator_count: usize,
    pub sample_count: usize,
    pub interpretation: String,
}

/// Cohen's kappa for two annotators over any label type.
pub fn cohens_kappa<T: Eq + Hash>(annotations_a: &[T], annotations_b: &[T]) -> f64 {
    if annotations_a.len() != annotations_b.len() || annotations_a.is_empty() {
        return 0.0;
    }
    let n = annotations_a.len() as f64;
    let agree = annotations_a
        .iter()
        .zip(annotations_b.iter())
        .filter(|(a, b)| a == b)
        .count() as f64;
    let po = agree / n;

    let categories: HashSet<&T> = annotations_a.iter().chain(annotations_b.iter()).collect();
    let mut pe = 0.0;
    for cat in categories {
        let count_a = annotations_a.iter().filter(|a| *a == cat).count() as f64;
        let count_b = annotations_b.iter().filter(|b| *b == cat).count() as f64;
        pe += (count_a / n) * (count_b / n);
    }

    if (1.0 - pe).abs() < f64::EPSILON {
        return 1.0;
    }
    (po - pe) / (1.0 - pe)
}

/// Landis & Koch bands.
pub fn interpret_kappa(kappa: f64) -> &'static str {
    if kappa < 0.0 {
        "Poor"
    } else if kappa < 0.20 {
        "Slight"
    } else if kappa < 0.40 {
        "Fair"
    } else if kappa < 0.60 {
        "Moderate"
    } else if kappa < 0.80 {
        "Substantial"
    } else {
        "Almost Perfect"
    }
}

/// Intraclass correlation, one-way random model.
///
/// One row per subject, one column per rater; ragged input returns 0.
pub fn icc(ratings: &[Vec<f64>]) -> f64 {
    let Some(first) = ratings.first() else {
        return 0.0;
    };
    let k = first.len();
    if k < 2 || ratings.iter().any(|r| r.len() != k) {
        return 0.0;
    }
    let n = ratings.len() as f64;
    let kf = k as f64;

    let total: f64 = ratings.iter().flat_map(|r| r.iter()).sum();
    let grand_mean = total / (n * kf);
    let row_means: Vec<f64> = ratings.iter().map(|r| r.iter().sum::<f64>() / kf).collect();

    let ssb: f64 = row_means
        .iter()
        .map(|m| kf * (m - grand_mean).powi(2))
        .sum();
    let ssw: f64 = ratings
        .iter()
        .zip(row_means.iter())
        .map(|(row, rm)| row.iter().map(|x| (x - rm).powi(2)).sum::<f64>())
        .sum();

    let df_b = n - 1.0;
    let df_w = n * (kf - 1.0);
    if df_b <= 0.0 || df_w <= 0.0 {
        return 0.0;
    }

    let msb = ssb / df_b;
    let msw = ssw / df_w;
    let denom = msb + (kf - 1.0) * msw;
    if denom.abs() < f64::EPSILON {
        return 0.0;
    }
    (msb - msw) / denom
}

fn interpret_icc(icc: f64) -> &'static str {
    if icc < 0.5 {
        "Poor"
    } else if icc < 0.75 {
        "Moderate"
    } else if icc < 0.9 {
        "Good"
    } else {
        "Excellent"
    }
}

/// Kappa (first two judges) per categorical dimension, ICC per ordinal one.
///
/// Only records where every counted judge parsed the dimension contribute.
pub fn ensemble_agreement(
    evaluations: &[EvaluationRecord],
    dimensions: &[DimensionSpec],
) -> Vec<AgreementResult> {
    let verdicts: Vec<_> = evaluations.iter().filter_map(|e| e.verdict.as_ref()).collect();
    let raters = verdicts
        .iter()
        .map(|v| v.raw_responses.len())
        .max()
        .unwrap_or(0);
    if raters < 2 {
        return Vec::new();
    }

    dimensions
        .iter()
        .map(|spec| match &spec.kind {
            DimensionKind::Categorical { .. } => {
                let (a, b): (Vec<String>, Vec<String>) = verdicts
                    .iter()
                    .filter_map(|v| {
                        let label = |i: usize| {
                            v.raw_responses
                                .get(i)?
                                .parsed
                                .get(&spec.name)?
                                .label()
                                .map(str::to_string)
                        };
                        Some((label(0)?, label(1)?))
                    })
                    .unzip();
                let score = cohens_kappa(&a, &b);
                AgreementResult {
                    dimension: spec.name.clone(),
                    method: "cohens_kappa".into(),
                    score,
                    annotator_count: 2,
                    sample_count: a.len(),
                    interpretation: interpret_kappa(score).into(),
                }
            }
            DimensionKind::Ordinal { .. } => {
                let rows: Vec<Vec<f64>> = verdicts
                    .iter()
                    .filter(|v| v.raw_responses.len() == raters)
                    .filter_map(|v| {
                        v.raw_responses
                            .iter()
                            .map(|r| r.parsed.get(&spec.name)?.score().map(f64::from))
                            .collect::<Option<Vec<f64>>>()
                    })
                    .collect();
                let score = icc(&rows);
                AgreementResult {
                    dimension: spec.name.clone(),
                    method: "icc".into(),
                    score,
                    annotator_count: raters,
                    sample_count: rows.len(),
                    interpretation: interpret_icc(score).into(),
                }
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cohens_kappa_perfect() {
        let a = vec![1, 2, 3, 1, 2];
        let b = vec![1, 2, 3, 1, 2];
        assert!((cohens_kappa(&a, &b) - 1.0).abs() < 0.001);
    }

    #[test]
    fn test_cohens_kappa_labels() {
        let a = ["present", "absent", "present", "present"];
        let b = ["present", "absent", "absent", "present"];
        // po = 0.75, pe = 0.75*0.5 + 0.25*0.5 = 0.5
        assert!((cohens_kappa(&a, &b) - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_interpret_kappa() {
        assert_eq!(interpret_kappa(0.85), "Almost Perfect");
        assert_eq!(interpret_kappa(0.45), "Moderate");
    }

    #[test]
    fn test_icc_perfect_and_degenerate() {
        let rows = vec![vec![1.0, 1.0], vec![3.0, 3.0], vec![5.0, 5.0]];
        assert!((icc(&rows) - 1.0).abs() < 1e-9);
        assert_eq!(icc(&[]), 0.0);
        assert_eq!(icc(&[vec![1.0], vec![2.0]]), 0.0);
    }
}
