pub mod denoiser;
pub mod device_map;
mod error;
pub mod images;
pub mod monitor;
pub mod outpaint;
pub mod pipeline;
pub mod prompt;
pub mod registry;
pub mod retry;
pub mod sampler;
pub mod schedule;
pub mod sd;

use candle_core::Tensor;
use image::DynamicImage;
use serde::{Deserialize, Serialize};

pub use device_map::*;
pub use error::{Error, Result};
pub use images::{ResizeMode, SaveFormat};
pub use pipeline::{GenerationOutcome, ModelNames, NoiseMode, Orchestrator, OutputConfig};
pub use prompt::Seed;
pub use registry::{Manager, ModelDescriptor, ModelInstance, ModelLease, ModelLoader, StageKind};
pub use sampler::{ProgressFn, SamplerKind, SamplingState, StepControl};

/// Tokens that did not fit the conditioning model's context window.
#[derive(Clone, Debug)]
pub struct TokenOverflow {
    pub count: usize,
    pub text: String,
}

/// Text-conditioning stage: maps prompts to embedding tensors.
pub trait CondStageModel: Send + Sync {
    fn get_learned_conditioning(&self, prompts: &[String]) -> Result<Tensor>;

    /// Report tokens beyond the context window, if the backing tokenizer can
    /// tell. Used for a non-fatal truncation warning only.
    fn token_overflow(&self, _prompt: &str) -> Result<Option<TokenOverflow>> {
        Ok(None)
    }

    /// Install a learned concept embedding behind a `<token>` placeholder.
    /// Stages without an embedding manager ignore the request.
    fn load_embedding(&self, _token: &str, _path: &std::path::Path) -> Result<()> {
        Ok(())
    }
}

/// Denoising (U-Net) stage: predicts the noise component of a latent at a
/// trained timestep.
pub trait DenoiseModel: Send + Sync {
    fn apply(&self, x: &Tensor, t: f64, cond: &Tensor) -> Result<Tensor>;
}

/// First (VAE) stage: maps between pixel space in [-1, 1] and latent space.
pub trait FirstStageModel: Send + Sync {
    fn encode(&self, image: &Tensor) -> Result<Tensor>;
    fn decode(&self, latent: &Tensor) -> Result<Tensor>;
}

/// Post-processing models (upscalers, face restorers, latent
/// super-resolution) behind a single enhancement entry point.
pub trait Enhancer: Send + Sync {
    fn enhance(&self, image: &DynamicImage) -> Result<DynamicImage>;
}

// Define the request type.
#[derive(Deserialize, Serialize, Debug, Clone, Default)]
pub struct GenerationRequest {
    pub prompt: String,
    pub width: Option<usize>,
    pub height: Option<usize>,
    pub steps: Option<usize>,
    pub sampler: Option<String>,
    pub cfg_scale: Option<f64>,
    pub seed: Option<Seed>,
    pub batch_size: Option<usize>,
    pub n_iter: Option<usize>,
    #[serde(default)]
    pub prompt_matrix: bool,
    pub normalize_prompt_weights: Option<bool>,
    pub ddim_eta: Option<f64>,
    pub denoising_strength: Option<f64>,
    #[serde(default)]
    pub noise_mode: NoiseMode,
    pub find_noise_steps: Option<usize>,
    #[serde(default)]
    pub variant_amount: f64,
    pub variant_seed: Option<Seed>,
    #[serde(default)]
    pub resize_mode: ResizeMode,
    #[serde(default)]
    pub use_face_restoration: bool,
    #[serde(default)]
    pub use_upscaling: bool,
    #[serde(default)]
    pub use_latent_sr: bool,
    #[serde(default)]
    pub mask_restore: bool,
    pub mask_blur_strength: Option<f32>,
    #[serde(default)]
    pub outpaint: outpaint::NoiseMatchOptions,
    #[serde(default)]
    pub save_grid: bool,
    /// Directory of learned concept embeddings, resolved against `<token>`
    /// placeholders in the prompt.
    pub concepts_library: Option<std::path::PathBuf>,
    /// Init image for img2img; set programmatically, not over the wire.
    #[serde(skip)]
    pub init_image: Option<DynamicImage>,
    /// Inpainting mask (white = regenerate); requires `init_image`.
    #[serde(skip)]
    pub init_mask: Option<DynamicImage>,
}
