//! Generation orchestrator: expands a request into per-image (prompt, seed)
//! work, acquires model stages from the registry, drives the sampler, decodes
//! latents, applies post-processing combinations, and persists the results.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use candle_core::{Device, Tensor};
use image::DynamicImage;
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};

use crate::denoiser::{CfgDenoiser, CompVisDenoiser, MaskedCfgDenoiser};
use crate::device_map::{select_best_device, DeviceMap};
use crate::images::{self, SampleMetadata, SaveFormat};
use crate::monitor::{MemUsageMonitor, MemoryProbe, NoopProbe};
use crate::outpaint::matched_noise;
use crate::prompt::{self, Seed};
use crate::registry::Manager;
use crate::sampler::{find_noise_for_image, ProgressFn, SampleOptions, Sampler, SamplerKind};
use crate::{Error, GenerationRequest, Result, TokenOverflow};

/// Latent channels and the pixel-to-latent downscale factor of the v1
/// autoencoder. Changing these breaks the checkpoints, so they are fixed.
pub const LATENT_CHANNELS: usize = 4;
pub const LATENT_FACTOR: usize = 8;

/// How the initial latent noise is produced for a generation.
///
/// With `variant_amount > 0` the base-seed noise is always slerped toward
/// whatever target noise the active mode produced, synthetic or inverted;
/// there is no mode-specific precedence.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NoiseMode {
    /// Per-seed Gaussian noise.
    #[default]
    Seed,
    /// Invert the init image through the sampler into its generating noise.
    FindNoise,
    /// Replace masked regions of the init image with spectrum-matched noise
    /// before encoding.
    MatchedNoise,
    /// Both of the above.
    FindAndMatched,
}

impl NoiseMode {
    fn inverts_image(self) -> bool {
        matches!(self, Self::FindNoise | Self::FindAndMatched)
    }

    fn matches_spectrum(self) -> bool {
        matches!(self, Self::MatchedNoise | Self::FindAndMatched)
    }
}

/// Registry names the orchestrator resolves its stages against.
#[derive(Clone, Debug)]
pub struct ModelNames {
    pub unet: String,
    pub cond_stage: String,
    pub first_stage: String,
    pub face_restorer: Option<String>,
    pub upscaler: Option<String>,
    pub latent_sr: Option<String>,
    /// Display name recorded in output metadata.
    pub loaded_model: String,
}

impl ModelNames {
    /// All diffusion stages served by one full-pipeline registration.
    pub fn full(name: &str, display: &str) -> Self {
        Self {
            unet: name.to_string(),
            cond_stage: name.to_string(),
            first_stage: name.to_string(),
            face_restorer: None,
            upscaler: None,
            latent_sr: None,
            loaded_model: display.to_string(),
        }
    }

    pub fn staged(unet: &str, cond_stage: &str, first_stage: &str, display: &str) -> Self {
        Self {
            unet: unet.to_string(),
            cond_stage: cond_stage.to_string(),
            first_stage: first_stage.to_string(),
            face_restorer: None,
            upscaler: None,
            latent_sr: None,
            loaded_model: display.to_string(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct OutputConfig {
    pub outdir: PathBuf,
    pub save_format: SaveFormat,
    pub grid_format: SaveFormat,
    /// Embed metadata into the image files themselves.
    pub embed_metadata: bool,
    /// Write a YAML sidecar per saved image.
    pub write_info_files: bool,
    /// Group samples into per-prompt subdirectories.
    pub sort_samples: bool,
    pub save_individual_images: bool,
    /// Skip the prompt token-length check.
    pub no_verify_input: bool,
    /// Grid rows; 0 means one row per batch, absent means a square-ish grid.
    pub n_rows: Option<usize>,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            outdir: PathBuf::from("outputs"),
            save_format: SaveFormat::Png,
            grid_format: SaveFormat::Png,
            embed_metadata: true,
            write_info_files: false,
            sort_samples: true,
            save_individual_images: true,
            no_verify_input: false,
            n_rows: None,
        }
    }
}

pub struct GenerationOutcome {
    /// All produced images; when a grid was composed it sits at index 0.
    pub images: Vec<DynamicImage>,
    pub seed: u32,
    pub info: String,
    pub stats: String,
    pub comments: Vec<String>,
    /// The request was cancelled through the progress callback; `images`
    /// holds whatever completed before that.
    pub cancelled: bool,
}

/// Request fields resolved against defaults and validated once per call.
struct Validated {
    width: usize,
    height: usize,
    steps: usize,
    sampler: SamplerKind,
    cfg_scale: f64,
    seed: u32,
    batch_size: usize,
    n_iter: usize,
    ddim_eta: f64,
    normalize_weights: bool,
    denoising_strength: f64,
    variant_amount: f64,
    find_noise_steps: usize,
    noise_mode: NoiseMode,
}

struct InitData {
    /// Encoded init image, batch of one, on the compute device.
    latent: Tensor,
    /// Latent-resolution mask, 1 where content is regenerated.
    mask: Option<Tensor>,
}

pub struct Orchestrator<'a> {
    manager: &'a Manager,
    names: ModelNames,
    output: OutputConfig,
    probe: Arc<dyn MemoryProbe>,
    device: Device,
}

impl<'a> Orchestrator<'a> {
    pub fn new(
        manager: &'a Manager,
        names: ModelNames,
        output: OutputConfig,
        device_map: DeviceMap,
    ) -> Result<Self> {
        Ok(Self {
            manager,
            names,
            output,
            probe: Arc::new(NoopProbe),
            device: select_best_device(device_map)?,
        })
    }

    pub fn with_probe(mut self, probe: Arc<dyn MemoryProbe>) -> Self {
        self.probe = probe;
        self
    }

    fn validate(&self, request: &GenerationRequest) -> Result<Validated> {
        let sampler: SamplerKind = match &request.sampler {
            Some(name) => name.parse()?,
            None => SamplerKind::default(),
        };
        let steps = request.steps.unwrap_or(50);
        if steps == 0 {
            return Err(Error::config("step count must be at least 1"));
        }
        let width = request.width.unwrap_or(512);
        let height = request.height.unwrap_or(512);
        if width == 0 || height == 0 || width % LATENT_FACTOR != 0 || height % LATENT_FACTOR != 0 {
            return Err(Error::config(format!(
                "width and height must be nonzero multiples of {LATENT_FACTOR}, got {width}x{height}"
            )));
        }
        let denoising_strength = request.denoising_strength.unwrap_or(0.75);
        if !(0.0..=1.0).contains(&denoising_strength) {
            return Err(Error::config(format!(
                "denoising strength must be within [0, 1], got {denoising_strength}"
            )));
        }
        if request.init_mask.is_some() && request.init_image.is_none() {
            return Err(Error::invalid("an inpainting mask requires an init image"));
        }
        if request.noise_mode != NoiseMode::Seed && request.init_image.is_none() {
            return Err(Error::invalid("noise modes other than seeded require an init image"));
        }
        if request.noise_mode.matches_spectrum() {
            if request.init_mask.is_none() {
                return Err(Error::invalid("matched-noise seeding requires an inpainting mask"));
            }
            request.outpaint.validate()?;
        }
        Ok(Validated {
            width,
            height,
            steps,
            sampler,
            cfg_scale: request.cfg_scale.unwrap_or(7.5),
            seed: prompt::seed_to_int(request.seed.as_ref()),
            batch_size: request.batch_size.unwrap_or(1).max(1),
            n_iter: request.n_iter.unwrap_or(1).max(1),
            ddim_eta: request.ddim_eta.unwrap_or(0.0),
            normalize_weights: request.normalize_prompt_weights.unwrap_or(true),
            denoising_strength,
            variant_amount: request.variant_amount.clamp(0.0, 1.0),
            find_noise_steps: request.find_noise_steps.unwrap_or(steps),
            noise_mode: request.noise_mode,
        })
    }

    /// This is the main loop that txt2img and img2img both run through.
    pub fn generate(
        &self,
        request: &GenerationRequest,
        progress: &mut ProgressFn<'_>,
    ) -> Result<GenerationOutcome> {
        let v = self.validate(request)?;
        let start_time = Instant::now();
        let mem_mon = MemUsageMonitor::start("generation", self.probe.clone());

        let result = self.run_batches(request, &v, progress);
        let (mem_peak, mem_total) = mem_mon.read_and_stop();
        let mut run = result?;

        let elapsed = start_time.elapsed().as_secs_f64();
        let per_image = elapsed / run.output_images.len().max(1) as f64;
        let mut stats = format!("Took {elapsed:.2}s total ({per_image:.2}s per image)");
        if mem_total > 0 {
            stats.push_str(&format!(
                "\nPeak memory usage: {} MiB / {} MiB / {:.3}%",
                mem_peak.div_ceil(1_048_576),
                mem_total.div_ceil(1_048_576),
                mem_peak as f64 / mem_total as f64 * 100.0
            ));
        }

        let mut info = format!(
            "{}\nSteps: {}, Sampler: {}, CFG scale: {}, Seed: {}",
            request.prompt, v.steps, v.sampler, v.cfg_scale, v.seed
        );
        if request.init_image.is_some() {
            info.push_str(&format!(", Denoising strength: {}", v.denoising_strength));
        }
        if request.prompt_matrix {
            info.push_str(", Prompt Matrix Mode.");
        }
        for comment in &run.comments {
            info.push_str("\n\n");
            info.push_str(comment);
        }

        Ok(GenerationOutcome {
            images: std::mem::take(&mut run.output_images),
            seed: v.seed,
            info,
            stats,
            comments: std::mem::take(&mut run.comments),
            cancelled: run.cancelled,
        })
    }

    fn check_prompt_length(&self, text: &str, comments: &mut Vec<String>) {
        let overflow = (|| -> Result<Option<TokenOverflow>> {
            let lease = self.manager.acquire(&self.names.cond_stage)?;
            lease.cond_stage()?.token_overflow(text)
        })();
        match overflow {
            Ok(Some(overflow)) => comments.push(format!(
                "Warning: too many input tokens; some ({}) have been truncated:\n{}\n",
                overflow.count, overflow.text
            )),
            Ok(None) => {}
            Err(err) => tracing::warn!("error verifying input: {err}"),
        }
    }

    /// Resolve `<token>` placeholders in the prompt against the concept
    /// library and hand the embedding files to the conditioning stage.
    fn load_concept_embeddings(&self, text: &str, library: &std::path::Path) -> Result<()> {
        let placeholder = regex::Regex::new("<([a-zA-Z0-9-]+)>").expect("valid token pattern");
        for capture in placeholder.captures_iter(text) {
            let token = &capture[1];
            let dir = library.join(token);
            if !dir.is_dir() {
                continue;
            }
            let lease = self.manager.acquire(&self.names.cond_stage)?;
            for entry in std::fs::read_dir(&dir)? {
                let path = entry?.path();
                let known = path
                    .extension()
                    .and_then(|e| e.to_str())
                    .is_some_and(|e| e == "pt" || e == "bin");
                if known {
                    tracing::info!("loading concept embedding <{token}> from {path:?}");
                    lease.cond_stage()?.load_embedding(token, &path)?;
                }
            }
        }
        Ok(())
    }

    /// Deterministic per-seed Gaussian noise, generated on the CPU so the
    /// same seed yields the same image on every device.
    fn create_random_tensors(&self, shape: (usize, usize, usize), seeds: &[u32]) -> Result<Tensor> {
        let cpu = Device::Cpu;
        let mut tensors = Vec::with_capacity(seeds.len());
        for &seed in seeds {
            cpu.set_seed(seed as u64)?;
            let (c, h, w) = shape;
            tensors.push(Tensor::randn(0f32, 1f32, (c, h, w), &cpu)?);
        }
        Ok(Tensor::stack(&tensors, 0)?.to_device(&self.device)?)
    }

    /// Resize the init image, optionally splice matched noise into masked
    /// regions, and encode everything the sampling loop needs from it.
    fn prepare_init_data(&self, request: &GenerationRequest, v: &Validated) -> Result<Option<InitData>> {
        let Some(init_image) = &request.init_image else {
            return Ok(None);
        };
        let resized = images::resize_image(request.resize_mode, init_image, v.width, v.height);

        let source = if v.noise_mode.matches_spectrum() {
            let mask = request.init_mask.as_ref().expect("validated mask");
            let mask = mask.resize_exact(
                v.width as u32,
                v.height as u32,
                image::imageops::FilterType::Lanczos3,
            );
            let src = images::image_to_array3(&resized);
            let mask_arr = images::image_to_array3(&mask);
            let mut rng = StdRng::seed_from_u64(v.seed as u64);
            let matched = matched_noise(&src, &mask_arr, &request.outpaint, &mut rng)?;
            images::array3_to_image(&matched)
        } else {
            resized
        };

        let lease = self.manager.acquire(&self.names.first_stage)?;
        let pixels = images::image_to_tensor(&source, &self.device)?;
        let latent = lease.first_stage()?.encode(&pixels)?;

        let mask = match &request.init_mask {
            Some(mask) => Some(images::mask_to_latent_tensor(
                mask,
                v.width / LATENT_FACTOR,
                v.height / LATENT_FACTOR,
                request.mask_blur_strength.unwrap_or(3.0),
                &self.device,
            )?),
            None => None,
        };
        Ok(Some(InitData { latent, mask }))
    }

    fn run_batches(
        &self,
        request: &GenerationRequest,
        v: &Validated,
        progress: &mut ProgressFn<'_>,
    ) -> Result<RunState> {
        let mut run = RunState::default();

        std::fs::create_dir_all(&self.output.outdir)?;
        let sample_path = self.output.outdir.join("samples");

        // A bare @ prefix without a matrix is just an escaped prompt.
        let mut prompt_text = request.prompt.clone();
        if !prompt_text.contains('|') && prompt_text.starts_with('@') && !request.prompt_matrix {
            prompt_text.remove(0);
        }
        let (positive, negative) = prompt::split_negative(&prompt_text);

        let mut simple_templating = false;
        let mut matrix_parts: Vec<String> = Vec::new();
        let mut per_image_captions: Vec<String> = Vec::new();
        let mut needrows: Option<usize> = None;

        let (all_prompts, mut all_seeds, n_iter) = if request.prompt_matrix {
            if positive.starts_with('@') {
                simple_templating = true;
                let ox = prompt::oxlamon_matrix(&positive, v.seed, v.n_iter, v.batch_size);
                needrows = ox.needrows;
                per_image_captions = ox.parts;
                (ox.prompts, ox.seeds, ox.n_iter)
            } else {
                let (prompts, parts) = prompt::prompt_matrix(&positive);
                matrix_parts = parts;
                let n_iter = prompts.len().div_ceil(v.batch_size);
                let seeds = vec![v.seed; prompts.len()];
                (prompts, seeds, n_iter)
            }
        } else {
            if !self.output.no_verify_input {
                self.check_prompt_length(&positive, &mut run.comments);
            }
            let prompts = vec![positive.clone(); v.batch_size * v.n_iter];
            let seeds = (0..prompts.len()).map(|i| v.seed.wrapping_add(i as u32)).collect();
            (prompts, seeds, v.n_iter)
        };
        if request.prompt_matrix {
            tracing::info!(
                "prompt matrix will create {} images using a total of {n_iter} batches",
                all_prompts.len()
            );
        }

        if let Some(library) = &request.concepts_library {
            self.load_concept_embeddings(&positive, library)?;
        }

        let init_data = self.prepare_init_data(request, v)?;
        let latent_shape =
            (LATENT_CHANNELS, v.height / LATENT_FACTOR, v.width / LATENT_FACTOR);

        // Variants: keep one base-seed noise and offset every per-image seed
        // by a random amount, so reruns produce different variant families.
        let mut base_noise = None;
        if v.variant_amount > 0.0 {
            let randomizer = prompt::seed_to_int(None);
            base_noise = Some(self.create_random_tensors(latent_shape, &[v.seed])?);
            for seed in &mut all_seeds {
                *seed = seed.wrapping_add(randomizer);
            }
        }

        for n in 0..n_iter {
            let lo = n * v.batch_size;
            let hi = ((n + 1) * v.batch_size).min(all_prompts.len());
            if lo >= hi {
                break;
            }
            tracing::info!("iteration {}/{}", n + 1, n_iter);
            let prompts = &all_prompts[lo..hi];
            let mut seeds: Vec<u32> = all_seeds[lo..hi].to_vec();
            let captions = per_image_captions.get(lo..hi).unwrap_or(&[]);

            // conditioning from the cond stage; the lease is released before
            // the U-Net is activated so staged swaps can happen in between
            let (uc, c, inversion_cond) = {
                let lease = self.manager.acquire(&self.names.cond_stage)?;
                let cond_stage = lease.cond_stage()?;
                let uc = cond_stage
                    .get_learned_conditioning(&vec![negative.clone(); prompts.len()])?;
                let weighted = prompt::split_weighted_subprompts(&prompts[0], v.normalize_weights);
                let c = if weighted.len() > 1 {
                    let mut acc = uc.zeros_like()?;
                    for sub in &weighted {
                        let emb = cond_stage
                            .get_learned_conditioning(&vec![sub.text.clone(); prompts.len()])?;
                        acc = (acc + (emb * sub.weight)?)?;
                    }
                    acc
                } else {
                    cond_stage.get_learned_conditioning(&prompts.to_vec())?
                };
                let inversion_cond = if v.noise_mode.inverts_image() {
                    Some(
                        cond_stage
                            .get_learned_conditioning(&vec![String::new(); 1])?
                            .to_device(&self.device)?,
                    )
                } else {
                    None
                };
                (uc.to_device(&self.device)?, c.to_device(&self.device)?, inversion_cond)
            };

            // initial noise
            let mut x = if let (true, Some(init)) = (v.noise_mode.inverts_image(), &init_data) {
                let lease = self.manager.acquire(&self.names.unet)?;
                let wrapper = CompVisDenoiser::new(lease.unet()?);
                let sigmas = wrapper.get_sigmas(v.find_noise_steps);
                let empty = inversion_cond.expect("inversion conditioning prepared");
                let cfg = CfgDenoiser::new(&wrapper, empty.clone(), empty, 0.0);
                let single = find_noise_for_image(&cfg, &init.latent, &sigmas, progress);
                let single = match single {
                    Err(Error::Cancelled) => {
                        run.cancelled = true;
                        break;
                    }
                    other => other?,
                };
                let copies: Vec<&Tensor> = std::iter::repeat(&single).take(prompts.len()).collect();
                Tensor::cat(&copies, 0)?
            } else {
                self.create_random_tensors(latent_shape, &seeds)?
            };

            if v.variant_amount > 0.0 {
                // a specified variant seed replaces the per-image seeds
                if let Some(variant_seed) = &request.variant_seed {
                    let specified = prompt::seed_to_int(Some(variant_seed));
                    seeds = vec![specified; seeds.len()];
                }
                let base = base_noise.as_ref().expect("base noise prepared");
                let copies: Vec<&Tensor> = std::iter::repeat(base).take(prompts.len()).collect();
                let base = Tensor::cat(&copies, 0)?.reshape(x.dims())?;
                x = prompt::slerp(v.variant_amount, &base, &x)?;
            }

            // sampling
            let samples = {
                let lease = self.manager.acquire(&self.names.unet)?;
                let wrapper = CompVisDenoiser::new(lease.unet()?);
                let sigmas = wrapper.get_sigmas(v.steps);
                let sampler = Sampler::new(v.sampler);
                let opts = SampleOptions { ddim_eta: v.ddim_eta };

                let result = if let Some(init) = &init_data {
                    let t_enc = (v.denoising_strength * v.steps as f64) as usize;
                    let first = (v.steps - t_enc).saturating_sub(1);
                    let sigma_sched = &sigmas[first..];
                    let copies: Vec<&Tensor> =
                        std::iter::repeat(&init.latent).take(prompts.len()).collect();
                    let latent_batch = Tensor::cat(&copies, 0)?;
                    let xi = (&latent_batch + (x * sigma_sched[0])?)?;
                    match &init.mask {
                        Some(mask) => {
                            let masked = MaskedCfgDenoiser::new(
                                &wrapper,
                                uc.clone(),
                                c.clone(),
                                v.cfg_scale,
                                mask.clone(),
                                Some(latent_batch.clone()),
                            )?;
                            sampler.sample(&masked, &xi, sigma_sched, &opts, progress)
                        }
                        None => {
                            let cfg =
                                CfgDenoiser::new(&wrapper, uc.clone(), c.clone(), v.cfg_scale);
                            sampler.sample(&cfg, &xi, sigma_sched, &opts, progress)
                        }
                    }
                } else {
                    let cfg = CfgDenoiser::new(&wrapper, uc.clone(), c.clone(), v.cfg_scale);
                    let xi = (&x * sigmas[0])?;
                    sampler.sample(&cfg, &xi, &sigmas, &opts, progress)
                };
                match result {
                    Err(Error::Cancelled) => {
                        run.cancelled = true;
                        break;
                    }
                    other => other?,
                }
            };

            // decode
            let batch_images = {
                let lease = self.manager.acquire(&self.names.first_stage)?;
                let decoded = lease.first_stage()?.decode(&samples)?;
                let pixels = ((decoded + 1.0)? / 2.0)?.clamp(0.0, 1.0)?;
                images::tensor_batch_to_images(&pixels)?
            };

            for (i, image) in batch_images.iter().enumerate() {
                self.finish_image(
                    request,
                    v,
                    &run_ctx(&sample_path, prompts, &seeds, i),
                    image,
                    captions.get(i),
                    simple_templating,
                    &mut run,
                )?;
            }
        }

        self.compose_grid(request, v, &matrix_parts, needrows, simple_templating, &mut run)?;
        Ok(run)
    }

    /// Post-process one decoded image, save each variant, and record grid
    /// captions.
    #[allow(clippy::too_many_arguments)]
    fn finish_image(
        &self,
        request: &GenerationRequest,
        v: &Validated,
        ctx: &ImageContext<'_>,
        image: &DynamicImage,
        caption: Option<&String>,
        simple_templating: bool,
        run: &mut RunState,
    ) -> Result<()> {
        let sanitized = slugify(ctx.prompt);
        let (dir, filename) = if self.output.sort_samples {
            let dir = ctx.sample_path.join(&sanitized);
            let count = images::next_sequence_number(&dir, "")?;
            (dir, format!("{count:05}-{}_{}_{}", v.steps, v.sampler, ctx.seed))
        } else {
            let count = images::next_sequence_number(ctx.sample_path, "")?;
            (
                ctx.sample_path.to_path_buf(),
                format!("{count:05}-{}_{}_{}_{sanitized}", v.steps, v.sampler, ctx.seed),
            )
        };
        let metadata = self.metadata_for(request, v, ctx.prompt, ctx.seed);

        let face = request.use_face_restoration
            && self.names.face_restorer.as_deref().is_some_and(|m| self.manager.is_loadable(m));
        let upscale = request.use_upscaling
            && self.names.upscaler.as_deref().is_some_and(|m| self.manager.is_loadable(m));
        let latent_sr = request.use_latent_sr
            && self.names.latent_sr.as_deref().is_some_and(|m| self.manager.is_loadable(m));

        let enhanced: Option<(DynamicImage, &str, &str)> = if face && upscale {
            let restored = self.enhance(self.names.face_restorer.as_deref().unwrap(), image)?;
            let upscaled = self.enhance(self.names.upscaler.as_deref().unwrap(), &restored)?;
            Some((upscaled, "-gfpgan-esrgan4x", "gfpgan_esrgan"))
        } else if face && latent_sr {
            let restored = self.enhance(self.names.face_restorer.as_deref().unwrap(), image)?;
            let upscaled = self.enhance(self.names.latent_sr.as_deref().unwrap(), &restored)?;
            Some((upscaled, "-gfpgan-ldsr4x", "gfpgan_ldsr"))
        } else if face {
            let restored = self.enhance(self.names.face_restorer.as_deref().unwrap(), image)?;
            Some((restored, "-gfpgan", "gfpgan"))
        } else if upscale {
            let upscaled = self.enhance(self.names.upscaler.as_deref().unwrap(), image)?;
            Some((upscaled, "-esrgan4x", "esrgan"))
        } else if latent_sr {
            let upscaled = self.enhance(self.names.latent_sr.as_deref().unwrap(), image)?;
            Some((upscaled, "-ldsr4x", "ldsr"))
        } else {
            None
        };

        if let Some((enhanced, suffix, tag)) = enhanced {
            images::save_sample(
                &enhanced,
                &dir,
                &format!("{filename}{suffix}"),
                self.output.save_format,
                &metadata,
                self.output.embed_metadata,
                self.output.write_info_files,
            )?;
            if simple_templating {
                if let Some(caption) = caption {
                    run.grid_captions.push(format!("{caption}\n{tag}"));
                }
            }
            run.output_images.push(enhanced);
        } else {
            if simple_templating {
                if let Some(caption) = caption {
                    run.grid_captions.push(caption.clone());
                }
            }
            run.output_images.push(image.clone());
        }

        let mut final_image = image.clone();
        if request.mask_restore {
            if let (Some(init_img), Some(mask)) = (&request.init_image, &request.init_mask) {
                final_image = images::restore_unmasked(
                    &final_image,
                    init_img,
                    mask,
                    request.mask_blur_strength.unwrap_or(3.0),
                );
            }
        }
        if self.output.save_individual_images {
            images::save_sample(
                &final_image,
                &dir,
                &filename,
                self.output.save_format,
                &metadata,
                self.output.embed_metadata,
                self.output.write_info_files,
            )?;
        }
        Ok(())
    }

    fn enhance(&self, name: &str, image: &DynamicImage) -> Result<DynamicImage> {
        let lease = self.manager.acquire(name)?;
        lease.enhancer()?.enhance(image)
    }

    fn compose_grid(
        &self,
        request: &GenerationRequest,
        v: &Validated,
        matrix_parts: &[String],
        needrows: Option<usize>,
        simple_templating: bool,
        run: &mut RunState,
    ) -> Result<()> {
        if !(request.prompt_matrix || request.save_grid) || run.output_images.is_empty() {
            return Ok(());
        }
        let grid = if request.prompt_matrix {
            if simple_templating {
                let rows = needrows
                    .unwrap_or_else(|| (run.output_images.len() as f64).sqrt().round() as usize);
                images::image_grid(&run.output_images, rows.max(1), &run.grid_captions)?
            } else {
                let rows = 1usize << ((matrix_parts.len().saturating_sub(1)) / 2);
                let plain = images::image_grid(&run.output_images, rows, &[])?;
                match images::draw_prompt_matrix(&plain, v.width, v.height, matrix_parts) {
                    Ok(labeled) => labeled,
                    Err(err) => {
                        tracing::warn!("error creating prompt matrix labels: {err}");
                        plain
                    }
                }
            }
        } else {
            let rows = match self.output.n_rows {
                Some(0) => v.batch_size,
                Some(n) => n,
                None => (run.output_images.len() as f64).sqrt().round() as usize,
            };
            images::image_grid(&run.output_images, rows.max(1), &[])?
        };

        let grid_count = images::next_sequence_number(&self.output.outdir, "grid-")?;
        let slug = slugify(&request.prompt);
        let metadata = self.metadata_for(request, v, &request.prompt, v.seed);
        images::save_sample(
            &grid,
            &self.output.outdir,
            &format!("grid-{grid_count:05}-{}_{slug}", v.seed),
            self.output.grid_format,
            &metadata,
            false,
            false,
        )?;
        if run.output_images.len() > 1 {
            run.output_images.insert(0, grid);
        }
        Ok(())
    }

    fn metadata_for(
        &self,
        request: &GenerationRequest,
        v: &Validated,
        prompt: &str,
        seed: u32,
    ) -> SampleMetadata {
        let img2img = request.init_image.is_some();
        let offset = if img2img { 2 } else { 0 };
        let mut toggles = Vec::new();
        if request.prompt_matrix {
            toggles.push(0);
        }
        if v.normalize_weights {
            toggles.push(1);
        }
        if self.output.save_individual_images {
            toggles.push(2 + offset);
        }
        if request.save_grid {
            toggles.push(3 + offset);
        }
        if self.output.sort_samples {
            toggles.push(4 + offset);
        }
        if self.output.write_info_files {
            toggles.push(5 + offset);
        }
        if request.use_face_restoration {
            toggles.push(6 + offset);
        }
        SampleMetadata {
            target: if img2img { "img2img" } else { "txt2img" }.to_string(),
            prompt: prompt.to_string(),
            ddim_steps: v.steps,
            toggles,
            sampler_name: v.sampler.to_string(),
            ddim_eta: v.ddim_eta,
            n_iter: v.n_iter,
            batch_size: v.batch_size,
            cfg_scale: v.cfg_scale,
            seed,
            width: v.width,
            height: v.height,
            normalize_prompt_weights: v.normalize_weights,
            model_name: self.names.loaded_model.clone(),
            denoising_strength: img2img.then_some(v.denoising_strength),
            resize_mode: img2img.then(|| format!("{:?}", request.resize_mode).to_lowercase()),
        }
    }
}

#[derive(Default)]
struct RunState {
    output_images: Vec<DynamicImage>,
    grid_captions: Vec<String>,
    comments: Vec<String>,
    cancelled: bool,
}

struct ImageContext<'a> {
    sample_path: &'a std::path::Path,
    prompt: &'a str,
    seed: u32,
}

fn run_ctx<'a>(
    sample_path: &'a std::path::Path,
    prompts: &'a [String],
    seeds: &[u32],
    i: usize,
) -> ImageContext<'a> {
    ImageContext { sample_path, prompt: &prompts[i], seed: seeds[i] }
}

/// Filesystem-safe slug of a prompt, used in sample paths and filenames.
fn slugify(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut pending_dash = false;
    for ch in text.chars() {
        if ch.is_ascii_alphanumeric() {
            if pending_dash && !out.is_empty() {
                out.push('-');
            }
            pending_dash = false;
            out.push(ch.to_ascii_lowercase());
        } else {
            pending_dash = true;
        }
    }
    out.truncate(128);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device_map::Precision;
    use crate::monitor::NoopProbe;
    use crate::registry::{
        FullPipeline, ModelDescriptor, ModelInstance, ModelLoader, StageKind,
    };
    use crate::sampler::{SamplingState, StepControl};
    use crate::{CondStageModel, DenoiseModel, Enhancer, FirstStageModel};
    use candle_core::{DType, Device};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FakePipeline {
        device: Device,
    }

    impl CondStageModel for FakePipeline {
        fn get_learned_conditioning(&self, prompts: &[String]) -> Result<Tensor> {
            Ok(Tensor::zeros((prompts.len(), 8, 16), DType::F32, &self.device)?)
        }
    }

    impl DenoiseModel for FakePipeline {
        fn apply(&self, x: &Tensor, _t: f64, _cond: &Tensor) -> Result<Tensor> {
            Ok(x.zeros_like()?)
        }
    }

    impl FirstStageModel for FakePipeline {
        fn encode(&self, image: &Tensor) -> Result<Tensor> {
            let (b, _c, h, w) = image.dims4()?;
            Ok(Tensor::zeros(
                (b, LATENT_CHANNELS, h / LATENT_FACTOR, w / LATENT_FACTOR),
                DType::F32,
                &self.device,
            )?)
        }

        fn decode(&self, latent: &Tensor) -> Result<Tensor> {
            let (b, _c, h, w) = latent.dims4()?;
            Ok(Tensor::zeros(
                (b, 3, h * LATENT_FACTOR, w * LATENT_FACTOR),
                DType::F32,
                &self.device,
            )?)
        }
    }

    impl FullPipeline for FakePipeline {}

    struct FakeLoader {
        loads: Arc<AtomicUsize>,
    }

    impl ModelLoader for FakeLoader {
        fn load(&self, device: &Device, _dtype: DType) -> Result<ModelInstance> {
            self.loads.fetch_add(1, Ordering::SeqCst);
            Ok(ModelInstance::Full(Arc::new(FakePipeline { device: device.clone() })))
        }
    }

    struct DoublingEnhancer;

    impl Enhancer for DoublingEnhancer {
        fn enhance(&self, image: &DynamicImage) -> Result<DynamicImage> {
            Ok(image.resize_exact(
                image.width() * 2,
                image.height() * 2,
                image::imageops::FilterType::Nearest,
            ))
        }
    }

    struct EnhancerLoader;

    impl ModelLoader for EnhancerLoader {
        fn load(&self, _device: &Device, _dtype: DType) -> Result<ModelInstance> {
            Ok(ModelInstance::Enhancer(Arc::new(DoublingEnhancer)))
        }
    }

    fn test_manager(loads: Arc<AtomicUsize>) -> Manager {
        let mut manager = Manager::new(Arc::new(NoopProbe), false);
        manager
            .register(ModelDescriptor::new(
                "sd_full",
                StageKind::Full,
                DeviceMap::ForceCpu,
                Precision::Full,
                Arc::new(FakeLoader { loads }),
            ))
            .unwrap();
        manager
            .register(ModelDescriptor::new(
                "upscaler_4x",
                StageKind::Upscaler,
                DeviceMap::ForceCpu,
                Precision::Full,
                Arc::new(EnhancerLoader),
            ))
            .unwrap();
        manager
    }

    fn test_output(tag: &str) -> OutputConfig {
        let outdir =
            std::env::temp_dir().join(format!("sable-pipe-{tag}-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&outdir);
        OutputConfig { outdir, write_info_files: true, ..OutputConfig::default() }
    }

    fn names() -> ModelNames {
        let mut names = ModelNames::full("sd_full", "Stable Diffusion v1.4");
        names.upscaler = Some("upscaler_4x".into());
        names
    }

    fn no_progress() -> impl FnMut(&SamplingState<'_>) -> Result<StepControl> {
        |_: &SamplingState<'_>| Ok(StepControl::Continue)
    }

    #[test]
    fn end_to_end_txt2img_writes_one_image_and_sidecar() {
        let loads = Arc::new(AtomicUsize::new(0));
        let manager = test_manager(loads);
        let output = test_output("e2e");
        let outdir = output.outdir.clone();
        let orchestrator =
            Orchestrator::new(&manager, names(), output, DeviceMap::ForceCpu).unwrap();

        let request = GenerationRequest {
            prompt: "test".into(),
            steps: Some(20),
            sampler: Some("ddim".into()),
            seed: Some(Seed::Number(123)),
            width: Some(64),
            height: Some(64),
            ..Default::default()
        };
        let mut progress = no_progress();
        let outcome = orchestrator.generate(&request, &mut progress).unwrap();
        assert_eq!(outcome.images.len(), 1);
        assert_eq!(outcome.seed, 123);
        assert!(!outcome.cancelled);
        assert!(outcome.info.contains("Seed: 123"));

        let sample_dir = outdir.join("samples").join("test");
        let entries: Vec<_> = std::fs::read_dir(&sample_dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        let pngs: Vec<_> = entries.iter().filter(|n| n.ends_with(".png")).collect();
        let yamls: Vec<_> = entries.iter().filter(|n| n.ends_with(".yaml")).collect();
        assert_eq!(pngs.len(), 1);
        assert_eq!(yamls.len(), 1);
        assert!(pngs[0].contains("20_ddim_123"));
        let yaml = std::fs::read_to_string(sample_dir.join(yamls[0])).unwrap();
        let value: serde_yaml::Value = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(value["seed"].as_u64(), Some(123));
        assert_eq!(value["ddim_steps"].as_u64(), Some(20));
        let _ = std::fs::remove_dir_all(&outdir);
    }

    #[test]
    fn unknown_sampler_fails_before_any_model_load() {
        let loads = Arc::new(AtomicUsize::new(0));
        let manager = test_manager(loads.clone());
        let output = test_output("badsampler");
        let outdir = output.outdir.clone();
        let orchestrator =
            Orchestrator::new(&manager, names(), output, DeviceMap::ForceCpu).unwrap();
        let request = GenerationRequest {
            prompt: "test".into(),
            sampler: Some("warp_drive".into()),
            ..Default::default()
        };
        let mut progress = no_progress();
        let result = orchestrator.generate(&request, &mut progress);
        assert!(matches!(result, Err(Error::Configuration(_))));
        assert_eq!(loads.load(Ordering::SeqCst), 0);
        let _ = std::fs::remove_dir_all(&outdir);
    }

    #[test]
    fn cancellation_stops_cleanly_with_partial_results() {
        let loads = Arc::new(AtomicUsize::new(0));
        let manager = test_manager(loads);
        let output = test_output("cancel");
        let outdir = output.outdir.clone();
        let orchestrator =
            Orchestrator::new(&manager, names(), output, DeviceMap::ForceCpu).unwrap();
        let request = GenerationRequest {
            prompt: "test".into(),
            steps: Some(10),
            width: Some(64),
            height: Some(64),
            n_iter: Some(2),
            seed: Some(Seed::Number(7)),
            ..Default::default()
        };
        let mut calls = 0usize;
        let mut progress = |_: &SamplingState<'_>| {
            calls += 1;
            // let the first iteration finish, then cancel in the second
            Ok(if calls > 12 { StepControl::Cancel } else { StepControl::Continue })
        };
        let outcome = orchestrator.generate(&request, &mut progress).unwrap();
        assert!(outcome.cancelled);
        assert_eq!(outcome.images.len(), 1);
        let _ = std::fs::remove_dir_all(&outdir);
    }

    #[test]
    fn prompt_matrix_produces_all_combinations_plus_grid() {
        let loads = Arc::new(AtomicUsize::new(0));
        let manager = test_manager(loads);
        let output = test_output("matrix");
        let outdir = output.outdir.clone();
        let orchestrator =
            Orchestrator::new(&manager, names(), output, DeviceMap::ForceCpu).unwrap();
        let request = GenerationRequest {
            prompt: "a|b".into(),
            prompt_matrix: true,
            steps: Some(4),
            width: Some(64),
            height: Some(64),
            seed: Some(Seed::Number(1)),
            ..Default::default()
        };
        let mut progress = no_progress();
        let outcome = orchestrator.generate(&request, &mut progress).unwrap();
        // 2^(2-1) combination images plus the grid at index 0
        assert_eq!(outcome.images.len(), 3);
        let _ = std::fs::remove_dir_all(&outdir);
    }

    #[test]
    fn upscaling_doubles_output_dimensions() {
        let loads = Arc::new(AtomicUsize::new(0));
        let manager = test_manager(loads);
        let output = test_output("upscale");
        let outdir = output.outdir.clone();
        let orchestrator =
            Orchestrator::new(&manager, names(), output, DeviceMap::ForceCpu).unwrap();
        let request = GenerationRequest {
            prompt: "test".into(),
            steps: Some(2),
            width: Some(64),
            height: Some(64),
            use_upscaling: true,
            seed: Some(Seed::Number(3)),
            ..Default::default()
        };
        let mut progress = no_progress();
        let outcome = orchestrator.generate(&request, &mut progress).unwrap();
        assert_eq!(outcome.images.len(), 1);
        assert_eq!(outcome.images[0].width(), 128);
        let _ = std::fs::remove_dir_all(&outdir);
    }

    #[test]
    fn mask_without_init_image_is_rejected() {
        let loads = Arc::new(AtomicUsize::new(0));
        let manager = test_manager(loads.clone());
        let output = test_output("badmask");
        let outdir = output.outdir.clone();
        let orchestrator =
            Orchestrator::new(&manager, names(), output, DeviceMap::ForceCpu).unwrap();
        let request = GenerationRequest {
            prompt: "test".into(),
            init_mask: Some(DynamicImage::new_rgb8(64, 64)),
            ..Default::default()
        };
        let mut progress = no_progress();
        let result = orchestrator.generate(&request, &mut progress);
        assert!(matches!(result, Err(Error::InvalidArgument(_))));
        assert_eq!(loads.load(Ordering::SeqCst), 0);
        let _ = std::fs::remove_dir_all(&outdir);
    }

    #[test]
    fn img2img_inpainting_runs_end_to_end() {
        let loads = Arc::new(AtomicUsize::new(0));
        let manager = test_manager(loads);
        let output = test_output("inpaint");
        let outdir = output.outdir.clone();
        let orchestrator =
            Orchestrator::new(&manager, names(), output, DeviceMap::ForceCpu).unwrap();
        let mut mask = image::RgbImage::new(64, 64);
        for (x, _y, p) in mask.enumerate_pixels_mut() {
            *p = if x >= 32 { image::Rgb([255, 255, 255]) } else { image::Rgb([0, 0, 0]) };
        }
        let request = GenerationRequest {
            prompt: "fill the right half".into(),
            steps: Some(6),
            width: Some(64),
            height: Some(64),
            seed: Some(Seed::Number(5)),
            init_image: Some(DynamicImage::new_rgb8(64, 64)),
            init_mask: Some(DynamicImage::ImageRgb8(mask)),
            noise_mode: NoiseMode::MatchedNoise,
            ..Default::default()
        };
        let mut progress = no_progress();
        let outcome = orchestrator.generate(&request, &mut progress).unwrap();
        assert_eq!(outcome.images.len(), 1);
        assert!(outcome.info.contains("Denoising strength"));
        let _ = std::fs::remove_dir_all(&outdir);
    }

    struct RecordingCond {
        tokens: Arc<std::sync::Mutex<Vec<String>>>,
    }

    impl CondStageModel for RecordingCond {
        fn get_learned_conditioning(&self, prompts: &[String]) -> Result<Tensor> {
            Ok(Tensor::zeros((prompts.len(), 8, 16), DType::F32, &Device::Cpu)?)
        }

        fn load_embedding(&self, token: &str, _path: &std::path::Path) -> Result<()> {
            self.tokens.lock().unwrap().push(token.to_string());
            Ok(())
        }
    }

    struct RecordingCondLoader {
        tokens: Arc<std::sync::Mutex<Vec<String>>>,
    }

    impl ModelLoader for RecordingCondLoader {
        fn load(&self, _device: &Device, _dtype: DType) -> Result<ModelInstance> {
            Ok(ModelInstance::CondStage(Arc::new(RecordingCond { tokens: self.tokens.clone() })))
        }
    }

    #[test]
    fn concept_embeddings_resolve_prompt_tokens() {
        let tokens = Arc::new(std::sync::Mutex::new(Vec::new()));
        let mut manager = Manager::new(Arc::new(NoopProbe), false);
        manager
            .register(ModelDescriptor::new(
                "rec_cs",
                StageKind::CondStage,
                DeviceMap::ForceCpu,
                Precision::Full,
                Arc::new(RecordingCondLoader { tokens: tokens.clone() }),
            ))
            .unwrap();
        let output = test_output("concepts");
        let outdir = output.outdir.clone();
        let mut names = ModelNames::full("rec_cs", "test");
        names.cond_stage = "rec_cs".into();
        let orchestrator =
            Orchestrator::new(&manager, names, output, DeviceMap::ForceCpu).unwrap();

        let library = outdir.join("concepts");
        std::fs::create_dir_all(library.join("my-style")).unwrap();
        std::fs::write(library.join("my-style").join("learned_embeds.bin"), b"x").unwrap();
        std::fs::create_dir_all(library.join("ignored")).unwrap();
        std::fs::write(library.join("ignored").join("readme.txt"), b"x").unwrap();

        orchestrator
            .load_concept_embeddings("a portrait in <my-style> and <missing>", &library)
            .unwrap();
        let loaded = tokens.lock().unwrap();
        assert_eq!(loaded.as_slice(), ["my-style"]);
        let _ = std::fs::remove_dir_all(&outdir);
    }

    #[test]
    fn slugify_flattens_prompts() {
        assert_eq!(slugify("A cat, riding a Bike!"), "a-cat-riding-a-bike");
        assert_eq!(slugify("test"), "test");
    }
}
