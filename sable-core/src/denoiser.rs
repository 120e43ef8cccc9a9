//! Denoiser wrappers: the sigma-space adapter over an eps-predicting
//! diffusion network, and classifier-free guidance on top of it.

use candle_core::Tensor;

use crate::{DenoiseModel, Error, Result};

/// A model operating in sigma space: given a noisy latent and the noise
/// magnitude, produce the denoised estimate.
pub trait Denoiser: Send + Sync {
    fn denoise(&self, x: &Tensor, sigma: f64, cond: &Tensor) -> Result<Tensor>;
}

/// Denoiser with conditioning baked in, as consumed by the sampling loops.
pub trait GuidedDenoiser {
    fn denoise(&self, x: &Tensor, sigma: f64) -> Result<Tensor>;
}

/// Discrete DDPM sigma table for CompVis-style eps models, with the
/// scaled-linear beta ramp the v1 checkpoints were trained on.
#[derive(Debug, Clone)]
pub struct CompVisSchedule {
    sigmas: Vec<f64>,
    log_sigmas: Vec<f64>,
}

impl CompVisSchedule {
    const TRAIN_STEPS: usize = 1000;
    const BETA_START: f64 = 0.00085;
    const BETA_END: f64 = 0.012;

    pub fn ddpm() -> Self {
        let n = Self::TRAIN_STEPS;
        let (b0, b1) = (Self::BETA_START.sqrt(), Self::BETA_END.sqrt());
        let mut sigmas = Vec::with_capacity(n);
        let mut alpha_cumprod = 1.0;
        for i in 0..n {
            let beta = (b0 + (b1 - b0) * i as f64 / (n - 1) as f64).powi(2);
            alpha_cumprod *= 1.0 - beta;
            sigmas.push(((1.0 - alpha_cumprod) / alpha_cumprod).sqrt());
        }
        let log_sigmas = sigmas.iter().map(|s| s.ln()).collect();
        Self { sigmas, log_sigmas }
    }

    pub fn sigma_min(&self) -> f64 {
        self.sigmas[0]
    }

    pub fn sigma_max(&self) -> f64 {
        *self.sigmas.last().expect("non-empty sigma table")
    }

    /// Descending schedule of `n` sigmas sampled evenly (in trained-timestep
    /// space) from the table, with a terminal zero appended.
    pub fn get_sigmas(&self, n: usize) -> Vec<f64> {
        let last = (self.sigmas.len() - 1) as f64;
        let mut out = Vec::with_capacity(n + 1);
        for i in 0..n {
            let t = if n == 1 { last } else { last * (1.0 - i as f64 / (n - 1) as f64) };
            out.push(self.t_to_sigma(t));
        }
        out.push(0.0);
        out
    }

    /// Continuous timestep for a sigma, by linear interpolation in log-sigma.
    pub fn sigma_to_t(&self, sigma: f64) -> f64 {
        let log_sigma = sigma.ln();
        let n = self.log_sigmas.len();
        let mut low_idx = n - 2;
        for i in 0..n - 1 {
            if log_sigma <= self.log_sigmas[i + 1] {
                low_idx = i;
                break;
            }
        }
        let (low, high) = (self.log_sigmas[low_idx], self.log_sigmas[low_idx + 1]);
        let w = ((low - log_sigma) / (low - high)).clamp(0.0, 1.0);
        (1.0 - w) * low_idx as f64 + w * (low_idx + 1) as f64
    }

    pub fn t_to_sigma(&self, t: f64) -> f64 {
        let low_idx = (t.floor() as usize).min(self.log_sigmas.len() - 1);
        let high_idx = (t.ceil() as usize).min(self.log_sigmas.len() - 1);
        let w = t - t.floor();
        ((1.0 - w) * self.log_sigmas[low_idx] + w * self.log_sigmas[high_idx]).exp()
    }
}

/// Adapts an eps-predicting network into a sigma-space denoiser: scales the
/// input by `1/sqrt(sigma^2+1)`, maps sigma to the trained timestep, and
/// reconstructs `x - eps * sigma`.
pub struct CompVisDenoiser<'a> {
    model: &'a dyn DenoiseModel,
    schedule: CompVisSchedule,
}

impl<'a> CompVisDenoiser<'a> {
    pub fn new(model: &'a dyn DenoiseModel) -> Self {
        Self { model, schedule: CompVisSchedule::ddpm() }
    }

    pub fn schedule(&self) -> &CompVisSchedule {
        &self.schedule
    }

    pub fn get_sigmas(&self, n: usize) -> Vec<f64> {
        self.schedule.get_sigmas(n)
    }
}

impl Denoiser for CompVisDenoiser<'_> {
    fn denoise(&self, x: &Tensor, sigma: f64, cond: &Tensor) -> Result<Tensor> {
        let c_in = 1.0 / (sigma * sigma + 1.0).sqrt();
        let t = self.schedule.sigma_to_t(sigma);
        let eps = self.model.apply(&(x * c_in)?, t, cond)?;
        Ok((x - (eps * sigma)?)?)
    }
}

/// Classifier-free guidance: one batched forward over `[x, x]` with
/// `[uncond, cond]`, then `uncond + (cond - uncond) * scale`.
pub struct CfgDenoiser<'a> {
    inner: &'a dyn Denoiser,
    uncond: Tensor,
    cond: Tensor,
    cond_scale: f64,
}

impl<'a> CfgDenoiser<'a> {
    pub fn new(inner: &'a dyn Denoiser, uncond: Tensor, cond: Tensor, cond_scale: f64) -> Self {
        Self { inner, uncond, cond, cond_scale }
    }
}

impl GuidedDenoiser for CfgDenoiser<'_> {
    fn denoise(&self, x: &Tensor, sigma: f64) -> Result<Tensor> {
        let x_in = Tensor::cat(&[x, x], 0)?;
        let cond_in = Tensor::cat(&[&self.uncond, &self.cond], 0)?;
        let out = self.inner.denoise(&x_in, sigma, &cond_in)?;
        let chunks = out.chunk(2, 0)?;
        let (uncond_out, cond_out) = (&chunks[0], &chunks[1]);
        Ok((uncond_out + ((cond_out - uncond_out)? * self.cond_scale)?)?)
    }
}

/// Guided denoiser for inpainting: unmasked pixels are pinned to the
/// original latent, masked pixels take the guided denoise.
pub struct MaskedCfgDenoiser<'a> {
    cfg: CfgDenoiser<'a>,
    mask: Tensor,
    orig: Tensor,
}

impl<'a> MaskedCfgDenoiser<'a> {
    pub fn new(
        inner: &'a dyn Denoiser,
        uncond: Tensor,
        cond: Tensor,
        cond_scale: f64,
        mask: Tensor,
        orig: Option<Tensor>,
    ) -> Result<Self> {
        let orig = orig.ok_or_else(|| {
            Error::invalid("masked denoising requires the original latent alongside the mask")
        })?;
        let (mh, mw) = (mask.dim(mask.rank() - 2)?, mask.dim(mask.rank() - 1)?);
        let (oh, ow) = (orig.dim(orig.rank() - 2)?, orig.dim(orig.rank() - 1)?);
        if (mh, mw) != (oh, ow) {
            return Err(Error::invalid(format!(
                "mask shape {mh}x{mw} does not match latent shape {oh}x{ow}"
            )));
        }
        Ok(Self { cfg: CfgDenoiser::new(inner, uncond, cond, cond_scale), mask, orig })
    }
}

impl GuidedDenoiser for MaskedCfgDenoiser<'_> {
    fn denoise(&self, x: &Tensor, sigma: f64) -> Result<Tensor> {
        let denoised = self.cfg.denoise(x, sigma)?;
        let inv_mask = self.mask.affine(-1.0, 1.0)?;
        let kept = self.orig.broadcast_mul(&inv_mask)?;
        let filled = denoised.broadcast_mul(&self.mask)?;
        Ok(kept.broadcast_add(&filled)?)
    }
}
