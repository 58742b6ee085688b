//! Pairwise two-proportion z-tests with multiple-comparison correction.
//!
//! Each disparity group (backend, category, axis) is one family: its values are
//! compared pairwise and corrected together.

use serde::{Deserialize, Serialize};

use super::disparity::{DisparityResult, GroupKey};
use super::special::normal_two_sided_p;
use crate::config::Correction;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PairwiseComparison {
    pub group: GroupKey,
    pub value_a: String,
    pub value_b: String,
    pub rate_a: f64,
    pub rate_b: f64,
    pub z: f64,
    pub p_value: f64,
    pub p_adjusted: f64,
    pub significant: bool,
}

/// z statistic and two-sided p for `x1/n1` against `x2/n2`, pooled variance.
pub fn two_proportion_z(x1: usize, n1: usize, x2: usize, n2: usize) -> (f64, f64) {
    if n1 == 0 || n2 == 0 {
        return (0.0, 1.0);
    }
    let (n1f, n2f) = (n1 as f64, n2 as f64);
    let p1 = x1 as f64 / n1f;
    let p2 = x2 as f64 / n2f;
    let pooled = (x1 + x2) as f64 / (n1f + n2f);
    let se = (pooled * (1.0 - pooled) * (1.0 / n1f + 1.0 / n2f)).sqrt();
    if se <= 0.0 {
        return (0.0, 1.0);
    }
    let z = (p1 - p2) / se;
    (z, normal_two_sided_p(z))
}

/// Adjust a family of p-values.
pub fn adjust(p_values: &[f64], correction: Correction) -> Vec<f64> {
    let m = p_values.len() as f64;
    match correction {
        Correction::Bonferroni => p_values.iter().map(|p| (p * m).min(1.0)).collect(),
        Correction::Holm => {
            let mut order: Vec<usize> = (0..p_values.len()).collect();
            order.sort_by(|&a, &b| p_values[a].total_cmp(&p_values[b]));
            let mut adjusted = vec![0.0; p_values.len()];
            let mut running = 0.0_f64;
            for (rank, &i) in order.iter().enumerate() {
                let candidate = ((m - rank as f64) * p_values[i]).min(1.0);
                running = running.max(candidate);
                adjusted[i] = running;
            }
            adjusted
        }
    }
}

/// Every pair of attribute values within each group.
pub fn pairwise_refusal_tests(
    disparity: &DisparityResult,
    correction: Correction,
    alpha: f64,
) -> Vec<PairwiseComparison> {
    let mut out = Vec::new();
    for group in &disparity.groups {
        let mut family = Vec::new();
        for (i, a) in group.cells.iter().enumerate() {
            for b in &group.cells[i + 1..] {
                let (z, p) = two_proportion_z(a.refused, a.rated, b.refused, b.rated);
                family.push(PairwiseComparison {
                    group: group.group.clone(),
                    value_a: a.value.clone(),
                    value_b: b.value.clone(),
                    rate_a: a.refusal_rate,
                    rate_b: b.refusal_rate,
                    z,
                    p_value: p,
                    p_adjusted: p,
                    significant: false,
                });
            }
        }
        let raw: Vec<f64> = family.iter().map(|c| c.p_value).collect();
        for (comparison, adjusted) in family.iter_mut().zip(adjust(&raw, correction)) {
            comparison.p_adjusted = adjusted;
            comparison.significant = adjusted < alpha;
        }
        out.extend(family);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_two_proportion_z() {
        let (z, p) = two_proportion_z(30, 100, 30, 100);
        assert_eq!(z, 0.0);
        assert!((p - 1.0).abs() < 1e-7);

        // 45/100 vs 25/100: pooled 0.35, se = 0.06745, z = 2.965.
        let (z, p) = two_proportion_z(45, 100, 25, 100);
        assert!((z - 2.965).abs() < 1e-3);
        assert!(p < 0.01);

        assert_eq!(two_proportion_z(0, 10, 0, 10), (0.0, 1.0));
    }

    #[test]
    fn test_holm_is_step_down_and_monotone() {
        let p = [0.01, 0.04, 0.03, 0.5];
        let holm = adjust(&p, Correction::Holm);
        // Sorted: 0.01*4, 0.03*3, 0.04*2, 0.5*1 with running max.
        assert_eq!(holm.len(), 4);
        assert!((holm[0] - 0.04).abs() < 1e-12);
        assert!((holm[2] - 0.09).abs() < 1e-12);
        assert!((holm[1] - 0.09).abs() < 1e-12);
        assert!((holm[3] - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_bonferroni_caps_at_one() {
        let adjusted = adjust(&[0.01, 0.4], Correction::Bonferroni);
        assert_eq!(adjusted, vec![0.02, 0.8]);
        assert_eq!(adjust(&[0.6, 0.7], Correction::Bonferroni), vec![1.0, 1.0]);
    }
}
