//! Stable Diffusion v1.x stage loaders: fetch checkpoints from the hub and
//! adapt the candle text encoder, U-Net, and autoencoder to the registry's
//! stage contracts. Network architectures stay candle's concern; these are
//! thin wrappers around its builders.

use std::path::PathBuf;
use std::sync::Arc;

use candle_core::{DType, Device, Module, Tensor};
use candle_transformers::models::stable_diffusion::{
    self, clip::ClipTextTransformer, unet_2d::UNet2DConditionModel, vae::AutoEncoderKL,
    StableDiffusionConfig,
};
use hf_hub::api::sync::Api;
use tokenizers::Tokenizer;

use crate::device_map::{DeviceMap, Precision};
use crate::registry::{FullPipeline, Manager, ModelDescriptor, ModelInstance, ModelLoader, StageKind};
use crate::{CondStageModel, DenoiseModel, Error, FirstStageModel, ModelNames, Result, TokenOverflow};

pub const DEFAULT_MODEL_ID: &str = "stable-diffusion-v1-5/stable-diffusion-v1-5";
const TOKENIZER_REPO: &str = "openai/clip-vit-base-patch32";
const VAE_SCALE: f64 = 0.18215;

/// Registry names for the preconfigured model set.
pub mod names {
    pub const SD_FULL: &str = "sd_full";
    pub const SD_CS: &str = "sd_cs";
    pub const SD_UNET: &str = "sd_unet";
    pub const SD_FS: &str = "sd_fs";
}

/// Stage names the orchestrator should resolve against, for either the
/// whole-pipeline or the staged registration.
pub fn model_names(optimized: bool, display: &str) -> ModelNames {
    if optimized {
        ModelNames::staged(names::SD_UNET, names::SD_CS, names::SD_FS, display)
    } else {
        ModelNames::full(names::SD_FULL, display)
    }
}

struct SdWeights {
    tokenizer: PathBuf,
    clip: PathBuf,
    unet: PathBuf,
    vae: PathBuf,
}

fn hub_file(api: &Api, repo: &str, path: &str) -> Result<PathBuf> {
    api.model(repo.to_string())
        .get(path)
        .map_err(|e| Error::transient(format!("failed to fetch {repo}/{path}: {e}")))
}

fn fetch_weights(model_id: &str) -> Result<SdWeights> {
    let api = Api::new().map_err(|e| Error::transient(format!("hub api: {e}")))?;
    Ok(SdWeights {
        tokenizer: hub_file(&api, TOKENIZER_REPO, "tokenizer.json")?,
        clip: hub_file(&api, model_id, "text_encoder/model.safetensors")?,
        unet: hub_file(&api, model_id, "unet/diffusion_pytorch_model.safetensors")?,
        vae: hub_file(&api, model_id, "vae/diffusion_pytorch_model.safetensors")?,
    })
}

/// CLIP text encoder as the conditioning stage.
pub struct ClipCondStage {
    tokenizer: Tokenizer,
    model: ClipTextTransformer,
    device: Device,
    max_tokens: usize,
    pad_id: u32,
}

impl ClipCondStage {
    fn load(config: &StableDiffusionConfig, weights: &SdWeights, device: &Device, dtype: DType) -> Result<Self> {
        let tokenizer = Tokenizer::from_file(&weights.tokenizer)
            .map_err(|e| Error::invalid(format!("failed to load tokenizer: {e}")))?;
        let pad_token = config.clip.pad_with.clone().unwrap_or_else(|| "<|endoftext|>".to_string());
        let pad_id = *tokenizer
            .get_vocab(true)
            .get(pad_token.as_str())
            .ok_or_else(|| Error::invalid(format!("tokenizer has no pad token {pad_token}")))?;
        let model = stable_diffusion::build_clip_transformer(&config.clip, &weights.clip, device, dtype)
            .map_err(|e| Error::transient(format!("failed to load text encoder: {e}")))?;
        Ok(Self {
            tokenizer,
            model,
            device: device.clone(),
            max_tokens: config.clip.max_position_embeddings,
            pad_id,
        })
    }

    fn token_ids(&self, prompt: &str) -> Result<Vec<u32>> {
        let encoding = self
            .tokenizer
            .encode(prompt, true)
            .map_err(|e| Error::invalid(format!("tokenization failed: {e}")))?;
        Ok(encoding.get_ids().to_vec())
    }
}

impl CondStageModel for ClipCondStage {
    fn get_learned_conditioning(&self, prompts: &[String]) -> Result<Tensor> {
        let mut rows = Vec::with_capacity(prompts.len());
        for prompt in prompts {
            let mut tokens = self.token_ids(prompt)?;
            tokens.truncate(self.max_tokens);
            while tokens.len() < self.max_tokens {
                tokens.push(self.pad_id);
            }
            rows.push(Tensor::new(tokens.as_slice(), &self.device)?.unsqueeze(0)?);
        }
        let refs: Vec<&Tensor> = rows.iter().collect();
        let token_batch = Tensor::cat(&refs, 0)?;
        Ok(self.model.forward(&token_batch)?)
    }

    fn token_overflow(&self, prompt: &str) -> Result<Option<TokenOverflow>> {
        let tokens = self.token_ids(prompt)?;
        if tokens.len() <= self.max_tokens {
            return Ok(None);
        }
        let overflowing = &tokens[self.max_tokens..];
        let text = self
            .tokenizer
            .decode(overflowing, true)
            .map_err(|e| Error::invalid(format!("token decoding failed: {e}")))?;
        Ok(Some(TokenOverflow { count: overflowing.len(), text }))
    }
}

/// Diffusion U-Net as the denoising stage; predicts eps at a trained
/// timestep.
pub struct SdUnet {
    unet: UNet2DConditionModel,
}

impl SdUnet {
    fn load(config: &StableDiffusionConfig, weights: &SdWeights, device: &Device, dtype: DType) -> Result<Self> {
        let unet = config
            .build_unet(&weights.unet, device, 4, false, dtype)
            .map_err(|e| Error::transient(format!("failed to load unet: {e}")))?;
        Ok(Self { unet })
    }
}

impl DenoiseModel for SdUnet {
    fn apply(&self, x: &Tensor, t: f64, cond: &Tensor) -> Result<Tensor> {
        Ok(self.unet.forward(x, t, cond)?)
    }
}

/// VAE as the first stage.
pub struct SdFirstStage {
    vae: AutoEncoderKL,
}

impl SdFirstStage {
    fn load(config: &StableDiffusionConfig, weights: &SdWeights, device: &Device, dtype: DType) -> Result<Self> {
        let vae = config
            .build_vae(&weights.vae, device, dtype)
            .map_err(|e| Error::transient(format!("failed to load vae: {e}")))?;
        Ok(Self { vae })
    }
}

impl FirstStageModel for SdFirstStage {
    fn encode(&self, image: &Tensor) -> Result<Tensor> {
        let dist = self.vae.encode(image)?;
        Ok((dist.sample()? * VAE_SCALE)?)
    }

    fn decode(&self, latent: &Tensor) -> Result<Tensor> {
        Ok(self.vae.decode(&(latent / VAE_SCALE)?)?)
    }
}

/// All three stages loaded as one unit.
pub struct SdPipeline {
    cond: ClipCondStage,
    unet: SdUnet,
    first_stage: SdFirstStage,
}

impl CondStageModel for SdPipeline {
    fn get_learned_conditioning(&self, prompts: &[String]) -> Result<Tensor> {
        self.cond.get_learned_conditioning(prompts)
    }

    fn token_overflow(&self, prompt: &str) -> Result<Option<TokenOverflow>> {
        self.cond.token_overflow(prompt)
    }
}

impl DenoiseModel for SdPipeline {
    fn apply(&self, x: &Tensor, t: f64, cond: &Tensor) -> Result<Tensor> {
        self.unet.apply(x, t, cond)
    }
}

impl FirstStageModel for SdPipeline {
    fn encode(&self, image: &Tensor) -> Result<Tensor> {
        self.first_stage.encode(image)
    }

    fn decode(&self, latent: &Tensor) -> Result<Tensor> {
        self.first_stage.decode(latent)
    }
}

impl FullPipeline for SdPipeline {}

/// Loader for one SD stage (or the whole pipeline). Checkpoints are fetched
/// lazily on first load, so registration itself never touches the network.
pub struct SdLoader {
    model_id: String,
    stage: StageKind,
}

impl SdLoader {
    pub fn new(model_id: impl Into<String>, stage: StageKind) -> Self {
        Self { model_id: model_id.into(), stage }
    }
}

impl ModelLoader for SdLoader {
    fn load(&self, device: &Device, dtype: DType) -> Result<ModelInstance> {
        if !self.stage.is_diffusion_stage() {
            return Err(Error::config(format!(
                "stage {:?} cannot be loaded from a diffusion checkpoint",
                self.stage
            )));
        }
        let weights = fetch_weights(&self.model_id)?;
        let config = StableDiffusionConfig::v1_5(None, None, None);
        match self.stage {
            StageKind::CondStage => Ok(ModelInstance::CondStage(Arc::new(ClipCondStage::load(
                &config, &weights, device, dtype,
            )?))),
            StageKind::Unet => Ok(ModelInstance::Unet(Arc::new(SdUnet::load(
                &config, &weights, device, dtype,
            )?))),
            StageKind::FirstStage => Ok(ModelInstance::FirstStage(Arc::new(SdFirstStage::load(
                &config, &weights, device, dtype,
            )?))),
            _ => {
                let cond = ClipCondStage::load(&config, &weights, device, dtype)?;
                let unet = SdUnet::load(&config, &weights, device, dtype)?;
                let first_stage = SdFirstStage::load(&config, &weights, device, dtype)?;
                Ok(ModelInstance::Full(Arc::new(SdPipeline { cond, unet, first_stage })))
            }
        }
    }
}

/// Register the preconfigured model set: the whole pipeline under one name,
/// or one loader per stage when the memory-optimized split is active.
pub fn register_sd_models(
    manager: &mut Manager,
    model_id: &str,
    device: DeviceMap,
    precision: Precision,
    optimized: bool,
) -> Result<()> {
    if optimized {
        for (name, stage) in [
            (names::SD_CS, StageKind::CondStage),
            (names::SD_UNET, StageKind::Unet),
            (names::SD_FS, StageKind::FirstStage),
        ] {
            manager.register(ModelDescriptor::new(
                name,
                stage,
                device,
                precision,
                Arc::new(SdLoader::new(model_id, stage)),
            ))?;
        }
    } else {
        manager.register(ModelDescriptor::new(
            names::SD_FULL,
            StageKind::Full,
            device,
            precision,
            Arc::new(SdLoader::new(model_id, StageKind::Full)),
        ))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn model_names_select_stage_registrations() {
        let full = model_names(false, "Stable Diffusion v1.5");
        assert_eq!(full.unet, names::SD_FULL);
        assert_eq!(full.cond_stage, names::SD_FULL);
        let staged = model_names(true, "Stable Diffusion v1.5");
        assert_eq!(staged.unet, names::SD_UNET);
        assert_eq!(staged.first_stage, names::SD_FS);
    }

    #[test]
    fn enhancer_stages_are_not_diffusion_loadable() {
        let loader = SdLoader::new(DEFAULT_MODEL_ID, StageKind::Upscaler);
        let err = loader.load(&Device::Cpu, DType::F32);
        assert!(matches!(err, Err(Error::Configuration(_))));
    }

    #[test]
    fn staged_registration_registers_three_names() {
        let mut manager = Manager::new(Arc::new(crate::monitor::NoopProbe), true);
        register_sd_models(
            &mut manager,
            DEFAULT_MODEL_ID,
            DeviceMap::ForceCpu,
            Precision::Half,
            true,
        )
        .unwrap();
        assert!(manager.is_loadable(names::SD_CS));
        assert!(manager.is_loadable(names::SD_UNET));
        assert!(manager.is_loadable(names::SD_FS));
        assert!(!manager.is_loadable(names::SD_FULL));
    }
}
