//! Mixed-effects logistic regression on the refusal indicator.
//!
//! Fixed effects: intercept, attribute value, prompt category. Crossed random
//! intercepts: source image and prompt. Fit by penalized quasi-likelihood: each
//! iteration linearizes the logit link into a weighted working response, solves
//! Henderson's mixed-model equations by Cholesky, and updates the two variance
//! components by EM.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::special::normal_two_sided_p;
use super::value_label;
use crate::types::{NEUTRAL, ObservedRecord};

const MIN_WEIGHT: f64 = 1e-6;
const MIN_VARIANCE: f64 = 1e-8;
const FIXED_RIDGE: f64 = 1e-8;
const TOLERANCE: f64 = 1e-6;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FixedEffect {
    pub term: String,
    pub estimate: f64,
    pub std_error: f64,
    pub z: f64,
    pub p_value: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MixedModelFit {
    pub backend: String,
    pub observations: usize,
    pub images: usize,
    pub prompts: usize,
    pub fixed_effects: Vec<FixedEffect>,
    pub image_variance: f64,
    pub prompt_variance: f64,
    pub iterations: usize,
    pub converged: bool,
    #[serde(default)]
    pub note: Option<String>,
}

/// Design of one model: dense fixed effects, indexed random effects.
#[derive(Debug, Clone, Default)]
pub struct GlmmData {
    pub terms: Vec<String>,
    pub x: Vec<Vec<f64>>,
    pub y: Vec<f64>,
    pub image: Vec<usize>,
    pub prompt: Vec<usize>,
    pub images: usize,
    pub prompts: usize,
}

fn index<'a>(levels: &mut BTreeMap<&'a str, usize>, level: &'a str) -> usize {
    let next = levels.len();
    *levels.entry(level).or_insert(next)
}

impl GlmmData {
    /// Treatment-coded design over rated records. The neutral control (or the
    /// first value in sort order) and the first category are the references.
    pub fn from_records(records: &[&ObservedRecord]) -> Self {
        let rated: Vec<&ObservedRecord> =
            records.iter().copied().filter(|r| r.is_rated()).collect();

        let mut values: Vec<String> = rated.iter().map(|r| value_label(r)).collect();
        values.sort();
        values.dedup();
        if let Some(pos) = values.iter().position(|v| v == NEUTRAL) {
            let neutral = values.remove(pos);
            values.insert(0, neutral);
        }
        let mut categories: Vec<&str> = rated.iter().map(|r| r.category.as_str()).collect();
        categories.sort_unstable();
        categories.dedup();

        let mut terms = vec!["(intercept)".to_string()];
        terms.extend(values.iter().skip(1).map(|v| format!("value[{v}]")));
        terms.extend(categories.iter().skip(1).map(|c| format!("category[{c}]")));

        let mut images = BTreeMap::new();
        let mut prompts = BTreeMap::new();
        let mut data = GlmmData {
            terms,
            ..Default::default()
        };
        for record in rated {
            let mut row = vec![0.0; data.terms.len()];
            row[0] = 1.0;
            let value = value_label(record);
            if let Some(i) = values.iter().skip(1).position(|v| *v == value) {
                row[1 + i] = 1.0;
            }
            if let Some(i) = categories
                .iter()
                .skip(1)
                .position(|c| *c == record.category)
            {
                row[values.len() + i] = 1.0;
            }
            data.x.push(row);
            data.y.push(if record.is_refused() { 1.0 } else { 0.0 });
            data.image.push(index(&mut images, &record.key.source_image_id));
            data.prompt.push(index(&mut prompts, &record.key.prompt_id));
        }
        data.images = images.len();
        data.prompts = prompts.len();
        data
    }
}

/// Lower-triangular Cholesky factor of a symmetric positive-definite matrix
/// stored row-major.
pub fn cholesky(a: &[f64], n: usize) -> Option<Vec<f64>> {
    let mut l = vec![0.0; n * n];
    for i in 0..n {
        for j in 0..=i {
            let mut sum = a[i * n + j];
            for k in 0..j {
                sum -= l[i * n + k] * l[j * n + k];
            }
            if i == j {
                if sum <= 0.0 || !sum.is_finite() {
                    return None;
                }
                l[i * n + i] = sum.sqrt();
            } else {
                l[i * n + j] = sum / l[j * n + j];
            }
        }
    }
    Some(l)
}

/// Solve `L Lᵀ x = b`.
pub fn cholesky_solve(l: &[f64], n: usize, b: &[f64]) -> Vec<f64> {
    let mut y = vec![0.0; n];
    for i in 0..n {
        let mut sum = b[i];
        for k in 0..i {
            sum -= l[i * n + k] * y[k];
        }
        y[i] = sum / l[i * n + i];
    }
    let mut x = vec![0.0; n];
    for i in (0..n).rev() {
        let mut sum = y[i];
        for k in i + 1..n {
            sum -= l[k * n + i] * x[k];
        }
        x[i] = sum / l[i * n + i];
    }
    x
}

fn logistic(eta: f64) -> f64 {
    1.0 / (1.0 + (-eta.clamp(-30.0, 30.0)).exp())
}

/// Fit the model by PQL.
pub fn fit(backend: &str, data: &GlmmData, max_iterations: usize) -> MixedModelFit {
    let n = data.y.len();
    let p = data.terms.len();
    let q = data.images + data.prompts;
    let dim = p + q;
    let mut result = MixedModelFit {
        backend: backend.to_string(),
        observations: n,
        images: data.images,
        prompts: data.prompts,
        fixed_effects: Vec::new(),
        image_variance: 0.0,
        prompt_variance: 0.0,
        iterations: 0,
        converged: false,
        note: None,
    };

    let refused = data.y.iter().filter(|y| **y > 0.5).count();
    if n <= p {
        result.note = Some(format!("{n} observations for {p} fixed effects"));
        return result;
    }
    if refused == 0 || refused == n {
        result.note = Some("refusal indicator has no variation".into());
        return result;
    }

    let mut var_image = 1.0_f64;
    let mut var_prompt = 1.0_f64;
    let mut eta: Vec<f64> = data
        .y
        .iter()
        .map(|y| {
            let mu = (y + 0.5) / 2.0;
            (mu / (1.0 - mu)).ln()
        })
        .collect();
    let mut beta = vec![0.0; p];
    let mut inverse_diag = vec![0.0; dim];

    for iteration in 1..=max_iterations.max(1) {
        result.iterations = iteration;

        let mut c = vec![0.0; dim * dim];
        let mut rhs = vec![0.0; dim];
        for i in 0..n {
            let mu = logistic(eta[i]);
            let w = (mu * (1.0 - mu)).max(MIN_WEIGHT);
            let z = eta[i] + (data.y[i] - mu) / w;

            let mut cols: Vec<(usize, f64)> = data.x[i]
                .iter()
                .enumerate()
                .filter(|(_, v)| **v != 0.0)
                .map(|(j, v)| (j, *v))
                .collect();
            cols.push((p + data.image[i], 1.0));
            cols.push((p + data.images + data.prompt[i], 1.0));
            for &(a, va) in &cols {
                rhs[a] += w * va * z;
                for &(b, vb) in &cols {
                    c[a * dim + b] += w * va * vb;
                }
            }
        }
        for j in 0..p {
            c[j * dim + j] += FIXED_RIDGE;
        }
        for j in 0..data.images {
            c[(p + j) * dim + p + j] += 1.0 / var_image;
        }
        for j in 0..data.prompts {
            let k = p + data.images + j;
            c[k * dim + k] += 1.0 / var_prompt;
        }

        let Some(l) = cholesky(&c, dim) else {
            result.note = Some(format!(
                "mixed-model equations not positive definite at iteration {iteration}"
            ));
            break;
        };
        let theta = cholesky_solve(&l, dim, &rhs);

        let mut unit = vec![0.0; dim];
        for j in 0..dim {
            unit[j] = 1.0;
            inverse_diag[j] = cholesky_solve(&l, dim, &unit)[j];
            unit[j] = 0.0;
        }

        let (image_u, prompt_u) = theta[p..].split_at(data.images);
        let next_image = em_variance(image_u, &inverse_diag[p..p + data.images]);
        let next_prompt = em_variance(prompt_u, &inverse_diag[p + data.images..]);

        let beta_change = theta[..p]
            .iter()
            .zip(&beta)
            .map(|(a, b)| (a - b).abs())
            .fold(0.0, f64::max);
        let var_change = ((next_image - var_image).abs() / var_image.max(1.0))
            .max((next_prompt - var_prompt).abs() / var_prompt.max(1.0));

        beta.copy_from_slice(&theta[..p]);
        var_image = next_image;
        var_prompt = next_prompt;
        for (i, e) in eta.iter_mut().enumerate() {
            let fixed: f64 = data.x[i].iter().zip(&beta).map(|(x, b)| x * b).sum();
            *e = fixed + image_u[data.image[i]] + prompt_u[data.prompt[i]];
        }

        if iteration > 1 && beta_change < TOLERANCE && var_change < TOLERANCE {
            result.converged = true;
            break;
        }
    }

    if !result.converged && result.note.is_none() {
        result.note = Some(format!(
            "did not converge within {} iterations",
            result.iterations
        ));
    }
    result.image_variance = var_image;
    result.prompt_variance = var_prompt;
    result.fixed_effects = data
        .terms
        .iter()
        .enumerate()
        .map(|(j, term)| {
            let std_error = inverse_diag[j].max(0.0).sqrt();
            let z = if std_error > 0.0 { beta[j] / std_error } else { 0.0 };
            FixedEffect {
                term: term.clone(),
                estimate: beta[j],
                std_error,
                z,
                p_value: normal_two_sided_p(z),
            }
        })
        .collect();
    result
}

fn em_variance(u: &[f64], inverse_diag: &[f64]) -> f64 {
    if u.is_empty() {
        return MIN_VARIANCE;
    }
    let total: f64 = u.iter().map(|v| v * v).sum::<f64>() + inverse_diag.iter().sum::<f64>();
    (total / u.len() as f64).max(MIN_VARIANCE)
}
