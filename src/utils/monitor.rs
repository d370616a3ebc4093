#[cfg(feature = "cli")]
use std::sync::Mutex;
#[cfg(feature = "cli")]
use std::time::{Duration, Instant};
#[cfg(feature = "cli")]
use sysinfo::{Pid, System};

#[cfg(feature = "cli")]
#[derive(Debug, Clone)]
pub struct ProcessStats {
    pub cpu_usage: f32,
    pub memory_mb: u64,
    pub peak_memory_mb: u64,
    pub elapsed: Duration,
}

/// 每個階段結束時記錄行程的 CPU 與記憶體用量
#[cfg(feature = "cli")]
pub struct SystemMonitor {
    inner: Option<Sampler>,
}

#[cfg(feature = "cli")]
struct Sampler {
    system: Mutex<System>,
    pid: Pid,
    started: Instant,
    peak_memory_mb: Mutex<u64>,
}

#[cfg(feature = "cli")]
impl SystemMonitor {
    pub fn new(enabled: bool) -> Self {
        let inner = if enabled {
            match sysinfo::get_current_pid() {
                Ok(pid) => Some(Sampler {
                    system: Mutex::new(System::new_all()),
                    pid,
                    started: Instant::now(),
                    peak_memory_mb: Mutex::new(0),
                }),
                Err(e) => {
                    tracing::warn!("Process monitoring unavailable: {}", e);
                    None
                }
            }
        } else {
            None
        };
        Self { inner }
    }

    pub fn sample(&self) -> Option<ProcessStats> {
        let sampler = self.inner.as_ref()?;
        let mut system = sampler.system.lock().ok()?;
        system.refresh_all();
        let process = system.process(sampler.pid)?;
        let memory_mb = process.memory() / 1024 / 1024;

        let mut peak = sampler.peak_memory_mb.lock().ok()?;
        *peak = (*peak).max(memory_mb);

        Some(ProcessStats {
            cpu_usage: process.cpu_usage(),
            memory_mb,
            peak_memory_mb: *peak,
            elapsed: sampler.started.elapsed(),
        })
    }

    pub fn log_stage(&self, pipeline: &str, category: &str, stage: &str) {
        if let Some(stats) = self.sample() {
            tracing::info!(
                pipeline,
                category,
                stage,
                cpu = format!("{:.1}%", stats.cpu_usage),
                memory_mb = stats.memory_mb,
                peak_memory_mb = stats.peak_memory_mb,
                "📊 stage finished after {:?}",
                stats.elapsed
            );
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.is_some()
    }
}

#[cfg(feature = "cli")]
impl Default for SystemMonitor {
    fn default() -> Self {
        Self::new(false)
    }
}

// 非 CLI 環境 (Lambda) 不帶 sysinfo
#[cfg(not(feature = "cli"))]
#[derive(Default)]
pub struct SystemMonitor;

#[cfg(not(feature = "cli"))]
impl SystemMonitor {
    pub fn new(_enabled: bool) -> Self {
        Self
    }

    pub fn log_stage(&self, _pipeline: &str, _category: &str, _stage: &str) {}

    pub fn is_enabled(&self) -> bool {
        false
    }
}
