//! Noise schedules: pure numeric routines producing descending sigma ramps
//! for the sampler, plus the quadrature used by linear-multistep sampling.

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleKind {
    #[default]
    Karras,
    Exponential,
    VariancePreserving,
}

fn append_zero(mut sigmas: Vec<f64>) -> Vec<f64> {
    sigmas.push(0.0);
    sigmas
}

fn linspace(start: f64, stop: f64, n: usize) -> Vec<f64> {
    if n == 1 {
        return vec![start];
    }
    let step = (stop - start) / (n - 1) as f64;
    (0..n).map(|i| start + step * i as f64).collect()
}

/// Power-law ramp in inverse-rho space between `sigma_max` and `sigma_min`,
/// with a terminal zero. Length is `n + 1`.
pub fn sigmas_karras(n: usize, sigma_min: f64, sigma_max: f64, rho: f64) -> Vec<f64> {
    let min_inv_rho = sigma_min.powf(1.0 / rho);
    let max_inv_rho = sigma_max.powf(1.0 / rho);
    let sigmas = linspace(0.0, 1.0, n)
        .into_iter()
        .map(|ramp| (max_inv_rho + ramp * (min_inv_rho - max_inv_rho)).powf(rho))
        .collect();
    append_zero(sigmas)
}

/// Log-linear ramp between `sigma_max` and `sigma_min`. A single step, or a
/// degenerate `sigma_min == sigma_max` range, short-circuits to avoid the
/// zero-width interpolation in log space.
pub fn sigmas_exponential(n: usize, sigma_min: f64, sigma_max: f64) -> Vec<f64> {
    if n == 1 || sigma_min == sigma_max {
        return append_zero(vec![sigma_max; n]);
    }
    let sigmas = linspace(sigma_max.ln(), sigma_min.ln(), n)
        .into_iter()
        .map(f64::exp)
        .collect();
    append_zero(sigmas)
}

/// Continuous variance-preserving schedule from the closed-form VP SDE.
pub fn sigmas_vp(n: usize, beta_d: f64, beta_min: f64, eps_s: f64) -> Vec<f64> {
    let sigmas = linspace(1.0, eps_s, n)
        .into_iter()
        .map(|t| ((beta_d * t * t / 2.0 + beta_min * t).exp() - 1.0).sqrt())
        .collect();
    append_zero(sigmas)
}

pub fn sigmas_for(kind: ScheduleKind, n: usize, sigma_min: f64, sigma_max: f64) -> Vec<f64> {
    match kind {
        ScheduleKind::Karras => sigmas_karras(n, sigma_min, sigma_max, 7.0),
        ScheduleKind::Exponential => sigmas_exponential(n, sigma_min, sigma_max),
        ScheduleKind::VariancePreserving => sigmas_vp(n, 19.9, 0.1, 1e-3),
    }
}

/// Relative tolerance for the multistep coefficient quadrature.
const QUAD_EPSREL: f64 = 1e-4;

fn simpson(f: &dyn Fn(f64) -> f64, a: f64, b: f64) -> f64 {
    (b - a) / 6.0 * (f(a) + 4.0 * f((a + b) / 2.0) + f(b))
}

fn adaptive_simpson(f: &dyn Fn(f64) -> f64, a: f64, b: f64, eps: f64, whole: f64, depth: u32) -> f64 {
    let m = (a + b) / 2.0;
    let left = simpson(f, a, m);
    let right = simpson(f, m, b);
    let delta = left + right - whole;
    if depth == 0 || delta.abs() <= 15.0 * eps * whole.abs().max(1e-12) {
        return left + right + delta / 15.0;
    }
    adaptive_simpson(f, a, m, eps / 2.0, left, depth - 1)
        + adaptive_simpson(f, m, b, eps / 2.0, right, depth - 1)
}

fn integrate(f: impl Fn(f64) -> f64, a: f64, b: f64) -> f64 {
    if a == b {
        return 0.0;
    }
    let whole = simpson(&f, a, b);
    adaptive_simpson(&f, a, b, QUAD_EPSREL, whole, 32)
}

/// Coefficient of the `j`-th stored derivative for a linear-multistep update
/// from `sigmas[i]` to `sigmas[i + 1]`: the integral of the Lagrange basis
/// polynomial over the step interval.
pub fn linear_multistep_coeff(order: usize, sigmas: &[f64], i: usize, j: usize) -> Result<f64> {
    if order > i + 1 {
        return Err(Error::config(format!("order {order} too high for step {i}")));
    }
    let basis = |tau: f64| -> f64 {
        let mut prod = 1.0;
        for k in 0..order {
            if j == k {
                continue;
            }
            prod *= (tau - sigmas[i - k]) / (sigmas[i - j] - sigmas[i - k]);
        }
        prod
    };
    Ok(integrate(basis, sigmas[i], sigmas[i + 1]))
}
