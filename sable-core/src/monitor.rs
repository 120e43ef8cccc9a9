//! Device memory probing and the per-generation peak-usage monitor.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::Result;

/// Reports device memory usage. The registry polls this during staged model
/// swaps; the monitor samples it for peak-usage reporting.
pub trait MemoryProbe: Send + Sync {
    fn used_bytes(&self) -> Result<u64>;
    fn total_bytes(&self) -> Result<u64>;
}

/// Probe for hosts without management libraries: reports zero, which makes
/// staged swaps complete immediately and peak reporting a no-op.
pub struct NoopProbe;

impl MemoryProbe for NoopProbe {
    fn used_bytes(&self) -> Result<u64> {
        Ok(0)
    }

    fn total_bytes(&self) -> Result<u64> {
        Ok(0)
    }
}

#[cfg(feature = "nvml")]
pub struct NvmlProbe {
    nvml: nvml_wrapper::Nvml,
    index: u32,
}

#[cfg(feature = "nvml")]
impl NvmlProbe {
    pub fn new(index: u32) -> Result<Self> {
        let nvml = nvml_wrapper::Nvml::init()
            .map_err(|e| crate::Error::transient(format!("NVML initialization failed: {e}")))?;
        Ok(Self { nvml, index })
    }

    fn memory_info(&self) -> Result<nvml_wrapper::struct_wrappers::device::MemoryInfo> {
        self.nvml
            .device_by_index(self.index)
            .and_then(|d| d.memory_info())
            .map_err(|e| crate::Error::transient(format!("NVML query failed: {e}")))
    }
}

#[cfg(feature = "nvml")]
impl MemoryProbe for NvmlProbe {
    fn used_bytes(&self) -> Result<u64> {
        Ok(self.memory_info()?.used)
    }

    fn total_bytes(&self) -> Result<u64> {
        Ok(self.memory_info()?.total)
    }
}

const SAMPLE_INTERVAL: Duration = Duration::from_millis(100);

/// Background thread recording peak device memory usage over one generation
/// call. Never influences control flow; stopped and joined before results
/// are returned.
pub struct MemUsageMonitor {
    stop: Arc<AtomicBool>,
    peak: Arc<AtomicU64>,
    total: Arc<AtomicU64>,
    handle: Option<JoinHandle<()>>,
}

impl MemUsageMonitor {
    pub fn start(name: &str, probe: Arc<dyn MemoryProbe>) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let peak = Arc::new(AtomicU64::new(0));
        let total = Arc::new(AtomicU64::new(0));
        let name = name.to_string();
        let handle = {
            let (stop, peak, total) = (stop.clone(), peak.clone(), total.clone());
            std::thread::spawn(move || {
                match probe.total_bytes() {
                    Ok(bytes) => total.store(bytes, Ordering::Relaxed),
                    Err(err) => {
                        tracing::info!("[{name}] memory stats unavailable: {err}");
                        return;
                    }
                }
                while !stop.load(Ordering::Relaxed) {
                    if let Ok(used) = probe.used_bytes() {
                        peak.fetch_max(used, Ordering::Relaxed);
                    }
                    std::thread::sleep(SAMPLE_INTERVAL);
                }
            })
        };
        Self { stop, peak, total, handle: Some(handle) }
    }

    /// Peak and total bytes observed so far.
    pub fn read(&self) -> (u64, u64) {
        (self.peak.load(Ordering::Relaxed), self.total.load(Ordering::Relaxed))
    }

    /// Stop sampling, join the thread, and return the final readings.
    pub fn read_and_stop(mut self) -> (u64, u64) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
        self.read()
    }
}

impl Drop for MemUsageMonitor {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

pub fn human_readable_size(bytes: u64) -> String {
    let mut size = bytes as f64;
    for unit in ["B", "KB", "MB", "GB"] {
        if size < 1024.0 {
            return format!("{size:.3}{unit}");
        }
        size /= 1024.0;
    }
    format!("{size:.3}TB")
}

/// Settable probe for exercising swap and monitor behavior in tests.
#[cfg(test)]
pub(crate) struct FakeProbe {
    used: std::sync::Mutex<u64>,
    total: u64,
}

#[cfg(test)]
impl FakeProbe {
    pub(crate) fn new(used: u64, total: u64) -> Self {
        Self { used: std::sync::Mutex::new(used), total }
    }

    pub(crate) fn set_used(&self, used: u64) {
        *self.used.lock().unwrap() = used;
    }
}

#[cfg(test)]
impl MemoryProbe for FakeProbe {
    fn used_bytes(&self) -> Result<u64> {
        Ok(*self.used.lock().unwrap())
    }

    fn total_bytes(&self) -> Result<u64> {
        Ok(self.total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn monitor_records_peak_and_joins() {
        let probe = Arc::new(FakeProbe::new(100, 1000));
        let monitor = MemUsageMonitor::start("test", probe.clone());
        std::thread::sleep(Duration::from_millis(150));
        probe.set_used(400);
        std::thread::sleep(Duration::from_millis(150));
        probe.set_used(50);
        std::thread::sleep(Duration::from_millis(150));
        let (peak, total) = monitor.read_and_stop();
        assert_eq!(peak, 400);
        assert_eq!(total, 1000);
    }

    #[test]
    fn human_sizes() {
        assert_eq!(human_readable_size(512), "512.000B");
        assert_eq!(human_readable_size(2048), "2.000KB");
    }
}
