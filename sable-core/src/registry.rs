//! Model registry and lifecycle manager: named loaders, lazy residency,
//! reference-counted scoped leases, and the staged GPU/CPU swap policy used
//! when the diffusion pipeline runs split into stages under a memory budget.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use candle_core::{DType, Device};

use crate::device_map::{select_best_device, DeviceMap, Precision};
use crate::monitor::MemoryProbe;
use crate::retry::RetryPolicy;
use crate::{CondStageModel, DenoiseModel, Enhancer, Error, FirstStageModel, Result};

/// Which part of the pipeline a registered model provides.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StageKind {
    /// The whole diffusion pipeline behind one name.
    Full,
    CondStage,
    Unet,
    FirstStage,
    Upscaler,
    FaceRestorer,
    LatentSr,
}

impl StageKind {
    /// Stages that contend for the same GPU budget in staged mode.
    pub fn is_diffusion_stage(self) -> bool {
        matches!(self, Self::Full | Self::CondStage | Self::Unet | Self::FirstStage)
    }
}

/// A whole pipeline loaded as one unit, usable as any of its stages.
pub trait FullPipeline: CondStageModel + DenoiseModel + FirstStageModel {}

/// A live, device-resident model. Cloning shares the underlying instance.
#[derive(Clone)]
pub enum ModelInstance {
    Full(Arc<dyn FullPipeline>),
    CondStage(Arc<dyn CondStageModel>),
    Unet(Arc<dyn DenoiseModel>),
    FirstStage(Arc<dyn FirstStageModel>),
    Enhancer(Arc<dyn Enhancer>),
}

impl ModelInstance {
    pub fn cond_stage(&self) -> Result<&dyn CondStageModel> {
        match self {
            Self::CondStage(m) => Ok(m.as_ref()),
            Self::Full(m) => Ok(m.as_ref() as &dyn CondStageModel),
            _ => Err(Error::invalid("model does not provide a conditioning stage")),
        }
    }

    pub fn unet(&self) -> Result<&dyn DenoiseModel> {
        match self {
            Self::Unet(m) => Ok(m.as_ref()),
            Self::Full(m) => Ok(m.as_ref() as &dyn DenoiseModel),
            _ => Err(Error::invalid("model does not provide a denoising stage")),
        }
    }

    pub fn first_stage(&self) -> Result<&dyn FirstStageModel> {
        match self {
            Self::FirstStage(m) => Ok(m.as_ref()),
            Self::Full(m) => Ok(m.as_ref() as &dyn FirstStageModel),
            _ => Err(Error::invalid("model does not provide a first stage")),
        }
    }

    pub fn enhancer(&self) -> Result<&dyn Enhancer> {
        match self {
            Self::Enhancer(m) => Ok(m.as_ref()),
            _ => Err(Error::invalid("model is not an image enhancer")),
        }
    }
}

/// Produces a live instance on a target device. Loaders must be safe to call
/// once per residency cycle.
pub trait ModelLoader: Send + Sync {
    fn load(&self, device: &Device, dtype: DType) -> Result<ModelInstance>;
}

/// Immutable description of a loadable model.
pub struct ModelDescriptor {
    pub name: String,
    pub stage: StageKind,
    pub device: DeviceMap,
    pub precision: Precision,
    loader: Arc<dyn ModelLoader>,
}

impl ModelDescriptor {
    pub fn new(
        name: impl Into<String>,
        stage: StageKind,
        device: DeviceMap,
        precision: Precision,
        loader: Arc<dyn ModelLoader>,
    ) -> Self {
        Self { name: name.into(), stage, device, precision, loader }
    }
}

struct Resident {
    instance: ModelInstance,
    leases: usize,
    stage: StageKind,
    on_gpu: bool,
    /// Device memory in use just before this instance was loaded; the swap
    /// target when the instance is evicted.
    memory_baseline: u64,
}

const SWAP_POLL_INTERVAL: Duration = Duration::from_millis(100);

pub struct Manager {
    descriptors: HashMap<String, ModelDescriptor>,
    residents: Mutex<HashMap<String, Resident>>,
    probe: Arc<dyn MemoryProbe>,
    /// Staged mode: at most one diffusion stage resident on the GPU at a time.
    staged: bool,
    swap_timeout: Duration,
    retry: RetryPolicy,
}

impl Manager {
    pub fn new(probe: Arc<dyn MemoryProbe>, staged: bool) -> Self {
        Self {
            descriptors: HashMap::new(),
            residents: Mutex::new(HashMap::new()),
            probe,
            staged,
            swap_timeout: Duration::from_secs(30),
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_swap_timeout(mut self, timeout: Duration) -> Self {
        self.swap_timeout = timeout;
        self
    }

    pub fn is_staged(&self) -> bool {
        self.staged
    }

    pub fn register(&mut self, descriptor: ModelDescriptor) -> Result<()> {
        if self.descriptors.contains_key(&descriptor.name) {
            return Err(Error::config(format!(
                "duplicate model name: {}",
                descriptor.name
            )));
        }
        tracing::debug!("registered model loader: {}", descriptor.name);
        self.descriptors.insert(descriptor.name.clone(), descriptor);
        Ok(())
    }

    /// Existence check with no side effects: no loading happens here.
    pub fn is_loadable(&self, name: &str) -> bool {
        self.descriptors.contains_key(name)
    }

    /// Acquire a scoped lease on a model, loading it if not resident.
    /// Dropping the lease releases it; release happens on every exit path.
    pub fn acquire(&self, name: &str) -> Result<ModelLease<'_>> {
        let descriptor = self
            .descriptors
            .get(name)
            .ok_or_else(|| Error::config(format!("unknown model name: {name}")))?;

        let mut residents = self.residents.lock().expect("registry lock");
        if let Some(resident) = residents.get_mut(name) {
            resident.leases += 1;
            let instance = resident.instance.clone();
            return Ok(ModelLease { manager: self, name: name.to_string(), instance });
        }

        let device = select_best_device(descriptor.device)?;
        let on_gpu = !device.is_cpu();
        if self.staged && on_gpu && descriptor.stage.is_diffusion_stage() {
            self.evict_conflicting_stages(&mut residents, name)?;
        }

        let memory_baseline = self.probe.used_bytes().unwrap_or(0);
        let dtype = descriptor.precision.dtype(&device);
        tracing::info!("loading model {name} on {device:?} ({dtype:?})");
        let instance = self
            .retry
            .run(&format!("load {name}"), || descriptor.loader.load(&device, dtype))?;
        residents.insert(
            name.to_string(),
            Resident {
                instance: instance.clone(),
                leases: 1,
                stage: descriptor.stage,
                on_gpu,
                memory_baseline,
            },
        );
        Ok(ModelLease { manager: self, name: name.to_string(), instance })
    }

    /// Unload every resident with no outstanding leases.
    pub fn evict_idle(&self) {
        let mut residents = self.residents.lock().expect("registry lock");
        residents.retain(|name, resident| {
            if resident.leases == 0 {
                tracing::debug!("evicting idle model {name}");
                false
            } else {
                true
            }
        });
    }

    /// Drop other GPU-resident diffusion stages and wait until device memory
    /// falls back to the level recorded before they were loaded.
    fn evict_conflicting_stages(
        &self,
        residents: &mut HashMap<String, Resident>,
        incoming: &str,
    ) -> Result<()> {
        let conflicting: Vec<String> = residents
            .iter()
            .filter(|(name, r)| {
                name.as_str() != incoming
                    && r.on_gpu
                    && r.stage.is_diffusion_stage()
                    && r.leases == 0
            })
            .map(|(name, _)| name.clone())
            .collect();
        for name in conflicting {
            let resident = residents.remove(&name).expect("resident listed for eviction");
            let baseline = resident.memory_baseline;
            tracing::info!("swapping out stage {name} before activating {incoming}");
            drop(resident);
            self.wait_for_memory(baseline, &name)?;
        }
        Ok(())
    }

    fn wait_for_memory(&self, baseline: u64, evicted: &str) -> Result<()> {
        let deadline = Instant::now() + self.swap_timeout;
        loop {
            match self.probe.used_bytes() {
                Ok(used) if used <= baseline => return Ok(()),
                Ok(_) => {}
                // a probe outage must not wedge the swap
                Err(_) => return Ok(()),
            }
            if Instant::now() >= deadline {
                return Err(Error::exhausted(format!(
                    "device memory did not return to baseline after evicting {evicted}"
                )));
            }
            std::thread::sleep(SWAP_POLL_INTERVAL);
        }
    }

    fn release(&self, name: &str) {
        let mut residents = self.residents.lock().expect("registry lock");
        if let Some(resident) = residents.get_mut(name) {
            resident.leases = resident.leases.saturating_sub(1);
        }
    }

    /// Number of outstanding leases for a model, for diagnostics.
    pub fn lease_count(&self, name: &str) -> usize {
        self.residents
            .lock()
            .expect("registry lock")
            .get(name)
            .map_or(0, |r| r.leases)
    }

    pub fn is_resident(&self, name: &str) -> bool {
        self.residents.lock().expect("registry lock").contains_key(name)
    }
}

/// Scoped access to a resident model. The lease is released when dropped,
/// on success and failure paths alike.
pub struct ModelLease<'a> {
    manager: &'a Manager,
    name: String,
    instance: ModelInstance,
}

impl ModelLease<'_> {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn instance(&self) -> &ModelInstance {
        &self.instance
    }

    pub fn cond_stage(&self) -> Result<&dyn CondStageModel> {
        self.instance.cond_stage()
    }

    pub fn unet(&self) -> Result<&dyn DenoiseModel> {
        self.instance.unet()
    }

    pub fn first_stage(&self) -> Result<&dyn FirstStageModel> {
        self.instance.first_stage()
    }

    pub fn enhancer(&self) -> Result<&dyn Enhancer> {
        self.instance.enhancer()
    }
}

impl Drop for ModelLease<'_> {
    fn drop(&mut self) {
        self.manager.release(&self.name);
    }
}
