//! Maximum-likelihood fitting and Kolmogorov–Smirnov model selection.

use std::f64::consts::PI;

use crate::error::EstimationError;

use super::distribution::{Distribution, Gamma, GenLogistic, Normal, Uniform};

/// Pick the family that best explains `history`.
///
/// A single sample yields `Uniform(0, sample)`. Otherwise every family that
/// can be fitted is scored by the asymptotic KS p-value and the best one wins;
/// ties keep the earlier family (uniform, normal, gamma, generalized logistic).
///
/// # Errors
///
/// Returns [`EstimationError::EmptyHistory`] for an empty history and
/// [`EstimationError::InvalidParameter`] when a sample is not finite.
pub fn get_best_distribution(history: &[f64]) -> Result<Box<dyn Distribution>, EstimationError> {
    if history.is_empty() {
        return Err(EstimationError::EmptyHistory);
    }
    if history.iter().any(|x| !x.is_finite()) {
        return Err(EstimationError::InvalidParameter("history"));
    }
    if let [sample] = history {
        return Ok(Box::new(Uniform::new(0.0, *sample)));
    }

    let mut sorted = history.to_vec();
    sorted.sort_by(f64::total_cmp);

    let candidates: Vec<Box<dyn Distribution>> = [
        Some(Box::new(fit_uniform(&sorted)) as Box<dyn Distribution>),
        fit_normal(&sorted).map(|d| Box::new(d) as Box<dyn Distribution>),
        fit_gamma(&sorted).map(|d| Box::new(d) as Box<dyn Distribution>),
        fit_genlogistic(&sorted).map(|d| Box::new(d) as Box<dyn Distribution>),
    ]
    .into_iter()
    .flatten()
    .collect();

    let mut best: Option<(f64, Box<dyn Distribution>)> = None;
    for candidate in candidates {
        let score = ks_p_value(&sorted, candidate.as_ref());
        if best.as_ref().is_none_or(|(best_score, _)| score > *best_score) {
            best = Some((score, candidate));
        }
    }
    Ok(best.map_or_else(|| Box::new(fit_uniform(&sorted)) as Box<dyn Distribution>, |(_, d)| d))
}

fn mean(samples: &[f64]) -> f64 {
    samples.iter().sum::<f64>() / samples_len(samples)
}

fn fit_uniform(sorted: &[f64]) -> Uniform {
    Uniform::new(sorted[0], sorted[sorted.len() - 1])
}

fn fit_normal(samples: &[f64]) -> Option<Normal> {
    let mean = mean(samples);
    let variance = samples.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / samples_len(samples);
    let std_dev = variance.sqrt();
    (std_dev > 0.0).then_some(Normal { mean, std_dev })
}

/// Minka's closed-form approximation of the shape MLE.
fn fit_gamma(samples: &[f64]) -> Option<Gamma> {
    if samples.iter().any(|x| *x <= 0.0) {
        return None;
    }
    let mean = mean(samples);
    let log_mean = samples.iter().map(|x| x.ln()).sum::<f64>() / samples_len(samples);
    let s = mean.ln() - log_mean;
    if s <= 0.0 || !s.is_finite() {
        return None;
    }
    let shape = (3.0 - s + ((s - 3.0).powi(2) + 24.0 * s).sqrt()) / (12.0 * s);
    Some(Gamma {
        shape,
        scale: mean / shape,
    })
}

fn fit_genlogistic(samples: &[f64]) -> Option<GenLogistic> {
    let normal = fit_normal(samples)?;
    let start = [0.0, normal.mean, (normal.std_dev * 3f64.sqrt() / PI).ln()];
    let negative_log_likelihood = |params: &[f64; 3]| {
        let dist = GenLogistic {
            shape: params[0].exp(),
            loc: params[1],
            scale: params[2].exp(),
        };
        let total: f64 = samples.iter().map(|x| dist.ln_pdf(*x)).sum();
        if total.is_finite() { -total } else { f64::INFINITY }
    };
    let best = nelder_mead(negative_log_likelihood, start, 400);
    let fitted = GenLogistic {
        shape: best[0].exp(),
        loc: best[1],
        scale: best[2].exp(),
    };
    (fitted.shape.is_finite() && fitted.scale.is_finite() && fitted.scale > 0.0).then_some(fitted)
}

#[allow(clippy::cast_precision_loss)]
fn samples_len(samples: &[f64]) -> f64 {
    samples.len() as f64
}

/// Downhill simplex minimisation over three parameters.
fn nelder_mead(objective: impl Fn(&[f64; 3]) -> f64, start: [f64; 3], iterations: usize) -> [f64; 3] {
    const N: usize = 3;
    const WEIGHT: f64 = 1.0 / 3.0;

    let mut simplex: Vec<([f64; N], f64)> = Vec::with_capacity(N + 1);
    simplex.push((start, objective(&start)));
    for i in 0..N {
        let mut vertex = start;
        vertex[i] += if vertex[i].abs() > 1e-3 { 0.1 * vertex[i].abs() } else { 0.1 };
        simplex.push((vertex, objective(&vertex)));
    }

    let towards = |from: &[f64; N], to: &[f64; N], factor: f64| -> [f64; N] {
        std::array::from_fn(|i| from[i] + factor * (to[i] - from[i]))
    };

    for _ in 0..iterations {
        simplex.sort_by(|a, b| a.1.total_cmp(&b.1));
        if (simplex[N].1 - simplex[0].1).abs() < 1e-10 {
            break;
        }

        let centroid: [f64; N] =
            std::array::from_fn(|i| WEIGHT * simplex[..N].iter().map(|(vertex, _)| vertex[i]).sum::<f64>());
        let worst = simplex[N];

        let reflected = towards(&centroid, &worst.0, -1.0);
        let reflected_score = objective(&reflected);
        if reflected_score < simplex[0].1 {
            let expanded = towards(&centroid, &worst.0, -2.0);
            let expanded_score = objective(&expanded);
            simplex[N] = if expanded_score < reflected_score {
                (expanded, expanded_score)
            } else {
                (reflected, reflected_score)
            };
        } else if reflected_score < simplex[N - 1].1 {
            simplex[N] = (reflected, reflected_score);
        } else {
            let contracted = towards(&centroid, &worst.0, 0.5);
            let contracted_score = objective(&contracted);
            if contracted_score < worst.1 {
                simplex[N] = (contracted, contracted_score);
            } else {
                let best = simplex[0].0;
                for (vertex, score) in &mut simplex[1..] {
                    *vertex = towards(&best, vertex, 0.5);
                    *score = objective(vertex);
                }
            }
        }
    }

    simplex.sort_by(|a, b| a.1.total_cmp(&b.1));
    simplex[0].0
}

/// Asymptotic p-value of the one-sample Kolmogorov–Smirnov statistic.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn ks_p_value(sorted: &[f64], dist: &dyn Distribution) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let n = sorted.len() as f64;
    let statistic = sorted
        .iter()
        .enumerate()
        .map(|(i, x)| {
            let f = dist.cdf(*x);
            let below = i as f64 / n;
            let above = (i + 1) as f64 / n;
            (f - below).max(above - f)
        })
        .fold(0.0, f64::max);

    let root = n.sqrt();
    let lambda = (root + 0.12 + 0.11 / root) * statistic;
    if lambda < 1e-3 {
        return 1.0;
    }
    // two series of the Kolmogorov distribution, each fast on its side of 1.18
    let q = if lambda < 1.18 {
        let y = (-PI * PI / (8.0 * lambda * lambda)).exp();
        1.0 - (2.0 * PI).sqrt() / lambda * (y + y.powi(9) + y.powi(25) + y.powi(49))
    } else {
        let x = (-2.0 * lambda * lambda).exp();
        2.0 * (x - x.powi(4) + x.powi(9))
    };
    q.clamp(0.0, 1.0)
}
