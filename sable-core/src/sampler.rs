//! Sampler adapter: a closed set of step algorithms driven over a sigma
//! schedule, invoking a guided denoiser at each discretization step and
//! reporting progress through an injected callback.

use std::str::FromStr;

use candle_core::Tensor;
use serde::{Deserialize, Serialize};

use crate::denoiser::GuidedDenoiser;
use crate::schedule::linear_multistep_coeff;
use crate::{Error, Result};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum SamplerKind {
    #[serde(rename = "k_euler", alias = "euler")]
    Euler,
    #[serde(rename = "k_euler_a", alias = "euler_a", alias = "euler_ancestral")]
    EulerAncestral,
    #[serde(rename = "k_heun", alias = "heun")]
    Heun,
    #[serde(rename = "k_dpm_2", alias = "dpm2", alias = "dpm_2")]
    Dpm2,
    #[serde(rename = "k_dpm_2_a", alias = "dpm2_a", alias = "dpm_2_ancestral")]
    Dpm2Ancestral,
    #[serde(rename = "k_lms", alias = "lms")]
    Lms,
    #[default]
    #[serde(rename = "ddim")]
    Ddim,
    #[serde(rename = "plms")]
    Plms,
}

serde_plain::derive_display_from_serialize!(SamplerKind);

impl FromStr for SamplerKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        serde_plain::from_str(&s.to_lowercase())
            .map_err(|_| Error::config(format!("unknown sampler name: {s}")))
    }
}

/// Snapshot of the sampling loop after a step. The callback may read it but
/// never mutates it.
pub struct SamplingState<'a> {
    pub x: &'a Tensor,
    pub denoised: &'a Tensor,
    pub step: usize,
    pub steps: usize,
    pub sigma: f64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StepControl {
    Continue,
    Cancel,
}

pub type ProgressFn<'a> = dyn FnMut(&SamplingState<'_>) -> Result<StepControl> + 'a;

/// Forwards a state snapshot to the callback. Callback errors are logged and
/// swallowed so they can never take down the loop; only an explicit cancel
/// (or a `Cancelled` error) unwinds.
fn notify(progress: &mut ProgressFn<'_>, state: &SamplingState<'_>) -> Result<()> {
    match progress(state) {
        Ok(StepControl::Continue) => Ok(()),
        Ok(StepControl::Cancel) => Err(Error::Cancelled),
        Err(Error::Cancelled) => Err(Error::Cancelled),
        Err(err) => {
            tracing::warn!("progress callback failed: {err}");
            Ok(())
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct SampleOptions {
    /// Stochasticity of the DDIM step; 0 is fully deterministic.
    pub ddim_eta: f64,
}

impl Default for SampleOptions {
    fn default() -> Self {
        Self { ddim_eta: 0.0 }
    }
}

pub struct Sampler {
    kind: SamplerKind,
}

impl Sampler {
    pub fn new(kind: SamplerKind) -> Self {
        Self { kind }
    }

    pub fn kind(&self) -> SamplerKind {
        self.kind
    }

    /// Run the configured step algorithm over `sigmas` (descending, terminal
    /// zero). `x` is the initial latent already scaled to the first sigma's
    /// noise level.
    pub fn sample(
        &self,
        model: &dyn GuidedDenoiser,
        x: &Tensor,
        sigmas: &[f64],
        opts: &SampleOptions,
        progress: &mut ProgressFn<'_>,
    ) -> Result<Tensor> {
        if sigmas.len() < 2 {
            return Err(Error::invalid("sigma schedule must contain at least one step"));
        }
        let x = x.clone();
        match self.kind {
            SamplerKind::Euler => sample_euler(model, x, sigmas, progress),
            SamplerKind::EulerAncestral => sample_euler_ancestral(model, x, sigmas, progress),
            SamplerKind::Heun => sample_heun(model, x, sigmas, progress),
            SamplerKind::Dpm2 => sample_dpm_2(model, x, sigmas, progress),
            SamplerKind::Dpm2Ancestral => sample_dpm_2_ancestral(model, x, sigmas, progress),
            SamplerKind::Lms => sample_lms(model, x, sigmas, progress),
            SamplerKind::Ddim => sample_ddim(model, x, sigmas, opts.ddim_eta, progress),
            SamplerKind::Plms => sample_plms(model, x, sigmas, progress),
        }
    }
}

/// Converts a denoiser output to the Karras ODE derivative.
fn to_d(x: &Tensor, sigma: f64, denoised: &Tensor) -> Result<Tensor> {
    Ok(((x - denoised)? * (1.0 / sigma))?)
}

/// Noise split for an ancestral step between two sigmas, optionally damped
/// by `eta`.
fn ancestral_step(sigma_from: f64, sigma_to: f64, eta: f64) -> (f64, f64) {
    if sigma_to == 0.0 {
        return (0.0, 0.0);
    }
    let up = eta
        * (sigma_to.powi(2) * (sigma_from.powi(2) - sigma_to.powi(2)) / sigma_from.powi(2)).sqrt();
    let down = (sigma_to.powi(2) - up.powi(2)).sqrt();
    (down, up)
}

fn sample_euler(
    model: &dyn GuidedDenoiser,
    mut x: Tensor,
    sigmas: &[f64],
    progress: &mut ProgressFn<'_>,
) -> Result<Tensor> {
    let n = sigmas.len() - 1;
    for i in 0..n {
        let denoised = model.denoise(&x, sigmas[i])?;
        let d = to_d(&x, sigmas[i], &denoised)?;
        let dt = sigmas[i + 1] - sigmas[i];
        x = (&x + (d * dt)?)?;
        notify(progress, &SamplingState { x: &x, denoised: &denoised, step: i, steps: n, sigma: sigmas[i] })?;
    }
    Ok(x)
}

fn sample_euler_ancestral(
    model: &dyn GuidedDenoiser,
    mut x: Tensor,
    sigmas: &[f64],
    progress: &mut ProgressFn<'_>,
) -> Result<Tensor> {
    let n = sigmas.len() - 1;
    for i in 0..n {
        let denoised = model.denoise(&x, sigmas[i])?;
        let (sigma_down, sigma_up) = ancestral_step(sigmas[i], sigmas[i + 1], 1.0);
        let d = to_d(&x, sigmas[i], &denoised)?;
        let dt = sigma_down - sigmas[i];
        x = (&x + (d * dt)?)?;
        if sigma_up > 0.0 {
            x = (&x + (x.randn_like(0.0, 1.0)? * sigma_up)?)?;
        }
        notify(progress, &SamplingState { x: &x, denoised: &denoised, step: i, steps: n, sigma: sigmas[i] })?;
    }
    Ok(x)
}

fn sample_heun(
    model: &dyn GuidedDenoiser,
    mut x: Tensor,
    sigmas: &[f64],
    progress: &mut ProgressFn<'_>,
) -> Result<Tensor> {
    let n = sigmas.len() - 1;
    for i in 0..n {
        let denoised = model.denoise(&x, sigmas[i])?;
        let d = to_d(&x, sigmas[i], &denoised)?;
        let dt = sigmas[i + 1] - sigmas[i];
        if sigmas[i + 1] == 0.0 {
            x = (&x + (d * dt)?)?;
        } else {
            let x_2 = (&x + (&d * dt)?)?;
            let denoised_2 = model.denoise(&x_2, sigmas[i + 1])?;
            let d_2 = to_d(&x_2, sigmas[i + 1], &denoised_2)?;
            let d_prime = ((d + d_2)? * 0.5)?;
            x = (&x + (d_prime * dt)?)?;
        }
        notify(progress, &SamplingState { x: &x, denoised: &denoised, step: i, steps: n, sigma: sigmas[i] })?;
    }
    Ok(x)
}

/// Log-space geometric midpoint used by the DPM-2 steps.
fn dpm_midpoint(sigma_from: f64, sigma_to: f64) -> f64 {
    ((sigma_from.powf(1.0 / 3.0) + sigma_to.powf(1.0 / 3.0)) / 2.0).powi(3)
}

fn sample_dpm_2(
    model: &dyn GuidedDenoiser,
    mut x: Tensor,
    sigmas: &[f64],
    progress: &mut ProgressFn<'_>,
) -> Result<Tensor> {
    let n = sigmas.len() - 1;
    for i in 0..n {
        let denoised = model.denoise(&x, sigmas[i])?;
        let d = to_d(&x, sigmas[i], &denoised)?;
        if sigmas[i + 1] == 0.0 {
            let dt = sigmas[i + 1] - sigmas[i];
            x = (&x + (d * dt)?)?;
        } else {
            let sigma_mid = dpm_midpoint(sigmas[i], sigmas[i + 1]);
            let dt_1 = sigma_mid - sigmas[i];
            let dt_2 = sigmas[i + 1] - sigmas[i];
            let x_2 = (&x + (d * dt_1)?)?;
            let denoised_2 = model.denoise(&x_2, sigma_mid)?;
            let d_2 = to_d(&x_2, sigma_mid, &denoised_2)?;
            x = (&x + (d_2 * dt_2)?)?;
        }
        notify(progress, &SamplingState { x: &x, denoised: &denoised, step: i, steps: n, sigma: sigmas[i] })?;
    }
    Ok(x)
}

fn sample_dpm_2_ancestral(
    model: &dyn GuidedDenoiser,
    mut x: Tensor,
    sigmas: &[f64],
    progress: &mut ProgressFn<'_>,
) -> Result<Tensor> {
    let n = sigmas.len() - 1;
    for i in 0..n {
        let denoised = model.denoise(&x, sigmas[i])?;
        let (sigma_down, sigma_up) = ancestral_step(sigmas[i], sigmas[i + 1], 1.0);
        let d = to_d(&x, sigmas[i], &denoised)?;
        if sigma_down == 0.0 {
            let dt = sigma_down - sigmas[i];
            x = (&x + (d * dt)?)?;
        } else {
            let sigma_mid = dpm_midpoint(sigmas[i], sigma_down);
            let dt_1 = sigma_mid - sigmas[i];
            let dt_2 = sigma_down - sigmas[i];
            let x_2 = (&x + (d * dt_1)?)?;
            let denoised_2 = model.denoise(&x_2, sigma_mid)?;
            let d_2 = to_d(&x_2, sigma_mid, &denoised_2)?;
            x = (&x + (d_2 * dt_2)?)?;
        }
        if sigma_up > 0.0 {
            x = (&x + (x.randn_like(0.0, 1.0)? * sigma_up)?)?;
        }
        notify(progress, &SamplingState { x: &x, denoised: &denoised, step: i, steps: n, sigma: sigmas[i] })?;
    }
    Ok(x)
}

const LMS_ORDER: usize = 4;

fn sample_lms(
    model: &dyn GuidedDenoiser,
    mut x: Tensor,
    sigmas: &[f64],
    progress: &mut ProgressFn<'_>,
) -> Result<Tensor> {
    let n = sigmas.len() - 1;
    let mut ds: Vec<Tensor> = Vec::with_capacity(LMS_ORDER);
    for i in 0..n {
        let denoised = model.denoise(&x, sigmas[i])?;
        let d = to_d(&x, sigmas[i], &denoised)?;
        ds.push(d);
        if ds.len() > LMS_ORDER {
            ds.remove(0);
        }
        let cur_order = (i + 1).min(LMS_ORDER);
        for j in 0..cur_order {
            let coeff = linear_multistep_coeff(cur_order, sigmas, i, j)?;
            x = (&x + (&ds[ds.len() - 1 - j] * coeff)?)?;
        }
        notify(progress, &SamplingState { x: &x, denoised: &denoised, step: i, steps: n, sigma: sigmas[i] })?;
    }
    Ok(x)
}

fn sample_ddim(
    model: &dyn GuidedDenoiser,
    mut x: Tensor,
    sigmas: &[f64],
    eta: f64,
    progress: &mut ProgressFn<'_>,
) -> Result<Tensor> {
    let n = sigmas.len() - 1;
    for i in 0..n {
        let denoised = model.denoise(&x, sigmas[i])?;
        let (sigma_down, sigma_up) = ancestral_step(sigmas[i], sigmas[i + 1], eta);
        let d = to_d(&x, sigmas[i], &denoised)?;
        let dt = sigma_down - sigmas[i];
        x = (&x + (d * dt)?)?;
        if sigma_up > 0.0 {
            x = (&x + (x.randn_like(0.0, 1.0)? * sigma_up)?)?;
        }
        notify(progress, &SamplingState { x: &x, denoised: &denoised, step: i, steps: n, sigma: sigmas[i] })?;
    }
    Ok(x)
}

fn sample_plms(
    model: &dyn GuidedDenoiser,
    mut x: Tensor,
    sigmas: &[f64],
    progress: &mut ProgressFn<'_>,
) -> Result<Tensor> {
    let n = sigmas.len() - 1;
    // most recent previous derivative first
    let mut old_d: Vec<Tensor> = Vec::with_capacity(3);
    for i in 0..n {
        let denoised = model.denoise(&x, sigmas[i])?;
        let d = to_d(&x, sigmas[i], &denoised)?;
        let dt = sigmas[i + 1] - sigmas[i];
        let d_prime = match old_d.len() {
            0 => d.clone(),
            1 => (((&d * 3.0)? - &old_d[0])? * 0.5)?,
            2 => ((((&d * 23.0)? - (&old_d[0] * 16.0)?)? + (&old_d[1] * 5.0)?)? * (1.0 / 12.0))?,
            _ => (((((&d * 55.0)? - (&old_d[0] * 59.0)?)? + (&old_d[1] * 37.0)?)?
                - (&old_d[2] * 9.0)?)?
                * (1.0 / 24.0))?,
        };
        x = (&x + (d_prime * dt)?)?;
        old_d.insert(0, d);
        old_d.truncate(3);
        notify(progress, &SamplingState { x: &x, denoised: &denoised, step: i, steps: n, sigma: sigmas[i] })?;
    }
    Ok(x)
}

/// Inverts an encoded init image into the noise that would produce it, by
/// integrating the probability-flow ODE from low to high sigma. The result is
/// rescaled by the final (largest) sigma so it can stand in for unit noise.
pub fn find_noise_for_image(
    model: &dyn GuidedDenoiser,
    init_latent: &Tensor,
    sigmas: &[f64],
    progress: &mut ProgressFn<'_>,
) -> Result<Tensor> {
    if sigmas.len() < 2 {
        return Err(Error::invalid("sigma schedule must contain at least one step"));
    }
    let flipped: Vec<f64> = sigmas.iter().rev().copied().collect();
    let steps = flipped.len() - 1;
    let mut x = init_latent.clone();
    for i in 1..flipped.len() {
        // the first step has no previous sigma to evaluate at
        let sigma = if i == 1 { flipped[i] } else { flipped[i - 1] };
        let denoised = model.denoise(&x, sigma)?;
        let d = if i == 1 {
            ((&x - &denoised)? * (1.0 / (2.0 * flipped[i])))?
        } else {
            to_d(&x, flipped[i - 1], &denoised)?
        };
        notify(progress, &SamplingState { x: &x, denoised: &denoised, step: i - 1, steps, sigma })?;
        let dt = flipped[i] - flipped[i - 1];
        x = (&x + (d * dt)?)?;
    }
    let sigma_max = *flipped.last().expect("non-empty schedule");
    Ok((x * (1.0 / sigma_max))?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::denoiser::GuidedDenoiser;
    use candle_core::Device;

    /// A perfect denoiser: always predicts the all-zero latent, which pulls
    /// every sampler to zero by the terminal sigma.
    struct ZeroDenoiser;

    impl GuidedDenoiser for ZeroDenoiser {
        fn denoise(&self, x: &Tensor, _sigma: f64) -> Result<Tensor> {
            Ok(x.zeros_like()?)
        }
    }

    fn unit_noise() -> Tensor {
        Tensor::full(1f32, (1, 4, 8, 8), &Device::Cpu).unwrap()
    }

    fn max_abs(t: &Tensor) -> f32 {
        t.flatten_all()
            .unwrap()
            .to_vec1::<f32>()
            .unwrap()
            .iter()
            .fold(0f32, |acc, v| acc.max(v.abs()))
    }

    #[test]
    fn sampler_names_parse() {
        assert_eq!("k_lms".parse::<SamplerKind>().unwrap(), SamplerKind::Lms);
        assert_eq!("DDIM".parse::<SamplerKind>().unwrap(), SamplerKind::Ddim);
        assert_eq!("euler_a".parse::<SamplerKind>().unwrap(), SamplerKind::EulerAncestral);
        assert!(matches!(
            "banana".parse::<SamplerKind>(),
            Err(Error::Configuration(_))
        ));
    }

    #[test]
    fn deterministic_samplers_reach_zero_with_perfect_denoiser() {
        let sigmas = crate::schedule::sigmas_karras(12, 0.03, 10.0, 7.0);
        for kind in [SamplerKind::Euler, SamplerKind::Heun, SamplerKind::Dpm2, SamplerKind::Plms] {
            let sampler = Sampler::new(kind);
            let mut progress = |_: &SamplingState<'_>| Ok(StepControl::Continue);
            let out = sampler
                .sample(&ZeroDenoiser, &unit_noise(), &sigmas, &SampleOptions::default(), &mut progress)
                .unwrap();
            assert!(max_abs(&out) < 1e-3, "{kind} left residual noise");
        }
    }

    #[test]
    fn callback_runs_once_per_step() {
        let sigmas = crate::schedule::sigmas_karras(7, 0.03, 10.0, 7.0);
        let mut calls = 0usize;
        let mut progress = |state: &SamplingState<'_>| {
            assert_eq!(state.steps, 7);
            calls += 1;
            Ok(StepControl::Continue)
        };
        Sampler::new(SamplerKind::Euler)
            .sample(&ZeroDenoiser, &unit_noise(), &sigmas, &SampleOptions::default(), &mut progress)
            .unwrap();
        assert_eq!(calls, 7);
    }

    #[test]
    fn cancel_unwinds_the_loop() {
        let sigmas = crate::schedule::sigmas_karras(10, 0.03, 10.0, 7.0);
        let mut calls = 0usize;
        let mut progress = |_: &SamplingState<'_>| {
            calls += 1;
            Ok(if calls == 3 { StepControl::Cancel } else { StepControl::Continue })
        };
        let res = Sampler::new(SamplerKind::Lms).sample(
            &ZeroDenoiser,
            &unit_noise(),
            &sigmas,
            &SampleOptions::default(),
            &mut progress,
        );
        assert!(matches!(res, Err(Error::Cancelled)));
        assert_eq!(calls, 3);
    }

    #[test]
    fn callback_errors_do_not_crash_the_loop() {
        let sigmas = crate::schedule::sigmas_karras(5, 0.03, 10.0, 7.0);
        let mut progress =
            |_: &SamplingState<'_>| Err(Error::transient("preview backend went away"));
        let out = Sampler::new(SamplerKind::Euler).sample(
            &ZeroDenoiser,
            &unit_noise(),
            &sigmas,
            &SampleOptions::default(),
            &mut progress,
        );
        assert!(out.is_ok());
    }

    #[test]
    fn find_noise_rescales_by_final_sigma() {
        let sigmas = crate::schedule::sigmas_karras(8, 0.03, 10.0, 7.0);
        let latent = unit_noise();
        let mut progress = |_: &SamplingState<'_>| Ok(StepControl::Continue);
        let noise = find_noise_for_image(&ZeroDenoiser, &latent, &sigmas, &mut progress).unwrap();
        assert_eq!(noise.dims(), latent.dims());
        assert!(max_abs(&noise).is_finite());
    }
}
