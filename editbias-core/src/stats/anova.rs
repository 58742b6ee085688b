//! One- and two-way ANOVA on the 0/1 refusal indicator.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::special::f_survival;

/// One row of an ANOVA table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnovaTerm {
    pub factor: String,
    pub df: f64,
    pub sum_sq: f64,
    pub mean_sq: f64,
    /// `None` when the residual mean square is zero.
    pub f_statistic: Option<f64>,
    pub p_value: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OneWayAnova {
    pub backend: String,
    pub term: AnovaTerm,
    pub levels: usize,
    pub observations: usize,
    pub residual_df: f64,
    pub residual_sum_sq: f64,
    pub eta_squared: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TwoWayAnova {
    pub backend: String,
    pub factor_a: AnovaTerm,
    pub factor_b: AnovaTerm,
    pub interaction: AnovaTerm,
    pub residual_df: f64,
    pub residual_sum_sq: f64,
    pub observations: usize,
    pub cells: usize,
}

fn term(factor: &str, df: f64, sum_sq: f64, residual_df: f64, residual_sum_sq: f64) -> AnovaTerm {
    let mean_sq = if df > 0.0 { sum_sq / df } else { 0.0 };
    let residual_ms = if residual_df > 0.0 {
        residual_sum_sq / residual_df
    } else {
        0.0
    };
    let (f_statistic, p_value) = if df <= 0.0 || residual_df <= 0.0 {
        (None, 1.0)
    } else if residual_ms <= f64::EPSILON {
        // No within-cell variance: any between-level difference is exact.
        (None, if mean_sq > f64::EPSILON { 0.0 } else { 1.0 })
    } else {
        let f = mean_sq / residual_ms;
        (Some(f), f_survival(f, df, residual_df))
    };
    AnovaTerm {
        factor: factor.to_string(),
        df,
        sum_sq,
        mean_sq,
        f_statistic,
        p_value,
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct Moments {
    n: usize,
    sum: f64,
}

impl Moments {
    fn push(&mut self, y: f64) {
        self.n += 1;
        self.sum += y;
    }

    fn mean(&self) -> f64 {
        if self.n == 0 { 0.0 } else { self.sum / self.n as f64 }
    }
}

/// One-way ANOVA of `y` over the levels of a single factor.
///
/// Returns `None` with fewer than two levels or no residual degrees of freedom.
pub fn one_way(backend: &str, factor: &str, observations: &[(String, f64)]) -> Option<OneWayAnova> {
    let mut levels: BTreeMap<&str, Moments> = BTreeMap::new();
    let mut total = Moments::default();
    for (level, y) in observations {
        levels.entry(level.as_str()).or_default().push(*y);
        total.push(*y);
    }
    let k = levels.len();
    let n = total.n;
    if k < 2 || n <= k {
        return None;
    }
    let grand = total.mean();

    let ss_between: f64 = levels
        .values()
        .map(|m| m.n as f64 * (m.mean() - grand).powi(2))
        .sum();
    let ss_within: f64 = observations
        .iter()
        .map(|(level, y)| (y - levels[level.as_str()].mean()).powi(2))
        .sum();
    let ss_total = ss_between + ss_within;
    let residual_df = (n - k) as f64;

    Some(OneWayAnova {
        backend: backend.to_string(),
        term: term(factor, (k - 1) as f64, ss_between, residual_df, ss_within),
        levels: k,
        observations: n,
        residual_df,
        residual_sum_sq: ss_within,
        eta_squared: if ss_total > 0.0 { ss_between / ss_total } else { 0.0 },
    })
}

/// Two-way ANOVA with interaction, by cell-mean decomposition.
///
/// The interaction sum of squares is `SS_cells - SS_A - SS_B`, clamped at zero
/// for unbalanced designs. Empty cells reduce the interaction degrees of
/// freedom.
pub fn two_way(
    backend: &str,
    factor_a: &str,
    factor_b: &str,
    observations: &[(String, String, f64)],
) -> Option<TwoWayAnova> {
    let mut a: BTreeMap<&str, Moments> = BTreeMap::new();
    let mut b: BTreeMap<&str, Moments> = BTreeMap::new();
    let mut cells: BTreeMap<(&str, &str), Moments> = BTreeMap::new();
    let mut total = Moments::default();
    for (la, lb, y) in observations {
        a.entry(la.as_str()).or_default().push(*y);
        b.entry(lb.as_str()).or_default().push(*y);
        cells.entry((la.as_str(), lb.as_str())).or_default().push(*y);
        total.push(*y);
    }
    let (ka, kb, kc, n) = (a.len(), b.len(), cells.len(), total.n);
    if ka < 2 || kb < 2 || n <= kc {
        return None;
    }
    let grand = total.mean();
    let ss = |m: &Moments| m.n as f64 * (m.mean() - grand).powi(2);

    let ss_a: f64 = a.values().map(ss).sum();
    let ss_b: f64 = b.values().map(ss).sum();
    let ss_cells: f64 = cells.values().map(ss).sum();
    let ss_ab = (ss_cells - ss_a - ss_b).max(0.0);
    let ss_within: f64 = observations
        .iter()
        .map(|(la, lb, y)| (y - cells[&(la.as_str(), lb.as_str())].mean()).powi(2))
        .sum();

    let df_a = (ka - 1) as f64;
    let df_b = (kb - 1) as f64;
    let df_ab = (kc as f64 - ka as f64 - kb as f64 + 1.0).max(0.0);
    let residual_df = (n - kc) as f64;

    Some(TwoWayAnova {
        backend: backend.to_string(),
        factor_a: term(factor_a, df_a, ss_a, residual_df, ss_within),
        factor_b: term(factor_b, df_b, ss_b, residual_df, ss_within),
        interaction: term(
            &format!("{factor_a}:{factor_b}"),
            df_ab,
            ss_ab,
            residual_df,
            ss_within,
        ),
        residual_df,
        residual_sum_sq: ss_within,
        observations: n,
        cells: kc,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn obs(level: &str, ys: &[f64]) -> Vec<(String, f64)> {
        ys.iter().map(|y| (level.to_string(), *y)).collect()
    }

    #[test]
    fn test_one_way_textbook_example() {
        // Groups with means 2, 4, 6 and unit within-group spread.
        let mut data = obs("a", &[1.0, 2.0, 3.0]);
        data.extend(obs("b", &[3.0, 4.0, 5.0]));
        data.extend(obs("c", &[5.0, 6.0, 7.0]));

        let result = one_way("m", "value", &data).unwrap();
        assert_eq!(result.levels, 3);
        assert!((result.term.sum_sq - 24.0).abs() < 1e-12);
        assert!((result.residual_sum_sq - 6.0).abs() < 1e-12);
        let f = result.term.f_statistic.unwrap();
        assert!((f - 12.0).abs() < 1e-12);
        // F(2, 6) = 12 has p of about 0.008.
        assert!((result.term.p_value - 0.008).abs() < 1e-3);
        assert!((result.eta_squared - 0.8).abs() < 1e-12);
    }

    #[test]
    fn test_identical_groups_are_not_significant() {
        let mut data = obs("a", &[0.0, 1.0, 0.0, 1.0]);
        data.extend(obs("b", &[1.0, 0.0, 1.0, 0.0]));
        let result = one_way("m", "value", &data).unwrap();
        assert_eq!(result.term.sum_sq, 0.0);
        assert_eq!(result.term.p_value, 1.0);
    }

    #[test]
    fn test_one_way_needs_two_levels() {
        assert!(one_way("m", "value", &obs("a", &[1.0, 0.0])).is_none());
    }

    #[test]
    fn test_two_way_interaction_only() {
        // Crossed design where only the interaction carries signal.
        let mut data = Vec::new();
        for (a, b, y) in [("x", "p", 1.0), ("x", "q", 0.0), ("y", "p", 0.0), ("y", "q", 1.0)] {
            for noise in [-0.1, 0.1] {
                data.push((a.to_string(), b.to_string(), y + noise));
            }
        }
        let result = two_way("m", "value", "category", &data).unwrap();
        assert!(result.factor_a.sum_sq.abs() < 1e-12);
        assert!(result.factor_b.sum_sq.abs() < 1e-12);
        assert!((result.interaction.sum_sq - 2.0).abs() < 1e-12);
        assert_eq!(result.interaction.df, 1.0);
        assert_eq!(result.residual_df, 4.0);
        assert!(result.interaction.p_value < 0.001);
        assert!(result.factor_a.p_value > 0.9);
    }
}
