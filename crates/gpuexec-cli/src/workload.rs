//! Synthetic submission workload run against the simulated device.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, ensure, Context};
use gpuexec_csr::sim::{ExecutionMode, SimDevice};
use gpuexec_csr::{
    create_command_stream_receiver, Command, CommandStreamReceiver, CsrConfig, CsrParams,
    CsrStatsSnapshot, DispatchFlags, EngineDescriptor, EngineType, FlushPayload, GfxFamily,
    HostPtrSurface, WaitStatus,
};
use gpuexec_mem::{
    AllocationProperties, AllocationType, ContextId, DeviceBitfield, GraphicsAllocation,
    HostMemoryBackend, MemoryManager, MemoryManagerConfig, TaskCount, MAX_OS_CONTEXTS, PAGE_SIZE,
};
use serde::{Deserialize, Serialize};

const HOST_RANGE_BASE: u64 = 0x7f00_0000_0000;
const HOST_RANGE_STRIDE: u64 = 0x100_0000;
const SCRATCH_BYTES_PER_THREAD: u32 = 2048;
const FINAL_WAIT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    pub family: GfxFamily,
    pub mode: ExecutionMode,
    pub engines: u32,
    pub flushes: u32,
    pub tiles: u32,
    /// Every n-th flush blocks until complete; 0 never blocks.
    pub blocking_every: u32,
    /// Every n-th flush asks for scratch space; 0 never does.
    pub scratch_every: u32,
    /// Map a host range into every flush.
    pub host_surfaces: bool,
    pub csr: CsrConfig,
    pub memory: MemoryManagerConfig,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            family: GfxFamily::XeHpc,
            mode: ExecutionMode::Immediate,
            engines: 2,
            flushes: 16,
            tiles: 1,
            blocking_every: 4,
            scratch_every: 8,
            host_surfaces: true,
            csr: CsrConfig::default(),
            memory: MemoryManagerConfig::default(),
        }
    }
}

impl RunConfig {
    /// Defaults with receiver and memory tunables taken from `GPUEXEC_*` variables.
    pub fn from_env() -> anyhow::Result<Self> {
        Ok(Self {
            csr: CsrConfig::from_env().context("receiver configuration")?,
            memory: MemoryManagerConfig::from_env(),
            ..Self::default()
        })
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        ensure!(
            (1..=MAX_OS_CONTEXTS as u32).contains(&self.engines),
            "engines must be between 1 and {MAX_OS_CONTEXTS}, got {}",
            self.engines
        );
        ensure!(
            (1..=4).contains(&self.tiles),
            "tiles must be between 1 and 4, got {}",
            self.tiles
        );
        self.csr.validate().context("receiver configuration")?;
        Ok(())
    }
}

#[derive(Debug, Serialize)]
pub struct EngineReport {
    pub context_id: ContextId,
    pub task_count: TaskCount,
    pub completed_task_count: TaskCount,
    pub direct_submission: bool,
    pub kernels_executed: u32,
    pub stats: CsrStatsSnapshot,
}

#[derive(Debug, Serialize)]
pub struct Report {
    pub family: GfxFamily,
    pub mode: ExecutionMode,
    pub engines: Vec<EngineReport>,
    pub submissions: u64,
    pub gpu_hang: bool,
    pub live_allocations_after_teardown: usize,
}

struct Engine {
    csr: Arc<CommandStreamReceiver>,
    counter: Arc<GraphicsAllocation>,
    host_range: u64,
}

fn every(n: u32, index: u32) -> bool {
    n != 0 && (index + 1) % n == 0
}

fn drive(engine: &Engine, config: &RunConfig) -> anyhow::Result<()> {
    let csr = &engine.csr;
    let walker = Command::ComputeWalker {
        kernel_id: 1,
        groups: [1, 1, 1],
        args_address: engine.counter.gpu_address(),
    };
    for index in 0..config.flushes {
        let mut residency = vec![engine.counter.clone()];
        let mut surface = HostPtrSurface::new(engine.host_range, PAGE_SIZE)
            .with_copy(vec![index as u8; PAGE_SIZE]);
        if config.host_surfaces {
            csr.create_allocation_for_host_surface(&mut surface)
                .with_context(|| format!("host surface for flush {index}"))?;
            residency.extend(surface.allocation().cloned());
        }

        let flags = DispatchFlags {
            blocking: every(config.blocking_every, index),
            scratch_per_thread: if every(config.scratch_every, index) {
                SCRATCH_BYTES_PER_THREAD
            } else {
                0
            },
            ..DispatchFlags::default()
        };
        let stamp = csr.flush(FlushPayload::Immediate(&[walker]), &residency, &flags);
        if let Some(status) = stamp.failure_status() {
            bail!(
                "context {} flush {index} failed: {status:?}",
                csr.context_id()
            );
        }
        tracing::debug!(
            context_id = csr.context_id(),
            index,
            task_count = stamp.task_count,
            "flushed"
        );
    }

    match csr.wait_for_task_count(csr.task_count(), Some(FINAL_WAIT_TIMEOUT)) {
        WaitStatus::Ready => {
            csr.internal_allocation_storage().clean_allocation_list(
                csr.task_count(),
                gpuexec_mem::AllocationUsage::Temporary,
            );
            Ok(())
        }
        status => Err(anyhow!(
            "context {} did not complete task {}: {status:?}",
            csr.context_id(),
            csr.task_count()
        )),
    }
}

fn engine_report(engine: &Engine) -> anyhow::Result<EngineReport> {
    let csr = &engine.csr;
    Ok(EngineReport {
        context_id: csr.context_id(),
        task_count: csr.task_count(),
        completed_task_count: csr.completed_task_count(),
        direct_submission: csr.is_direct_submission_enabled(),
        kernels_executed: engine
            .counter
            .memory()
            .read_u32(0)
            .context("reading kernel counter")?,
        stats: csr.stats().snapshot(),
    })
}

/// Build one receiver per engine, drive them concurrently and report what happened.
pub fn run(config: &RunConfig) -> anyhow::Result<Report> {
    config.validate()?;
    let backend = Arc::new(HostMemoryBackend::new(config.memory.device_memory_budget));
    let memory_manager = Arc::new(MemoryManager::new(backend, config.memory.clone()));
    let device = SimDevice::new(config.mode);
    device.set_log_capacity(0);
    let worker = match config.mode {
        ExecutionMode::Deferred => Some(device.spawn_worker()),
        ExecutionMode::Immediate => None,
    };
    let device_bitfield = DeviceBitfield::first_tiles(config.tiles);

    let mut engines = Vec::with_capacity(config.engines as usize);
    for index in 0..config.engines {
        let os_context = device.create_os_context(EngineDescriptor::new(
            EngineType::Compute,
            device_bitfield,
        ));
        let csr = create_command_stream_receiver(
            config.family,
            CsrParams {
                os_context,
                submitter: device.clone(),
                memory_manager: memory_manager.clone(),
                config: config.csr.clone(),
            },
        )
        .with_context(|| format!("creating receiver for engine {index}"))?;
        let counter = memory_manager
            .allocate_graphics_memory_with_properties(&AllocationProperties::new(
                0,
                PAGE_SIZE,
                AllocationType::Buffer,
                device_bitfield,
            ))
            .context("allocating kernel counter")?;
        engines.push(Engine {
            csr,
            counter,
            host_range: HOST_RANGE_BASE + u64::from(index) * HOST_RANGE_STRIDE,
        });
    }
    tracing::info!(
        family = ?config.family,
        mode = ?config.mode,
        engines = config.engines,
        flushes = config.flushes,
        "running workload"
    );

    let results: Vec<anyhow::Result<()>> = std::thread::scope(|scope| {
        let handles: Vec<_> = engines
            .iter()
            .map(|engine| scope.spawn(move || drive(engine, config)))
            .collect();
        handles
            .into_iter()
            .map(|handle| {
                handle
                    .join()
                    .unwrap_or_else(|_| Err(anyhow!("engine thread panicked")))
            })
            .collect()
    });
    for result in results {
        result?;
    }

    let reports = engines
        .iter()
        .map(engine_report)
        .collect::<anyhow::Result<Vec<_>>>()?;
    let counters: Vec<_> = engines.iter().map(|engine| engine.counter.clone()).collect();
    drop(engines);
    for counter in counters {
        memory_manager.free_graphics_memory(counter);
    }
    drop(worker);

    Ok(Report {
        family: config.family,
        mode: config.mode,
        engines: reports,
        submissions: device.submissions(),
        gpu_hang: device.is_hang_detected(),
        live_allocations_after_teardown: memory_manager.live_allocation_count(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn small(family: GfxFamily) -> RunConfig {
        RunConfig {
            family,
            engines: 2,
            flushes: 6,
            ..RunConfig::default()
        }
    }

    #[test]
    fn every_engine_runs_every_kernel_and_teardown_frees_everything() {
        let report = run(&small(GfxFamily::Gen12)).unwrap();
        assert_eq!(report.engines.len(), 2);
        for engine in &report.engines {
            assert_eq!(engine.kernels_executed, 6);
            assert_eq!(engine.completed_task_count, engine.task_count);
            assert_eq!(engine.stats.failed_submissions, 0);
        }
        assert!(!report.gpu_hang);
        assert_eq!(report.live_allocations_after_teardown, 0);
    }

    #[test]
    fn deferred_mode_is_driven_by_the_worker() {
        let config = RunConfig {
            mode: ExecutionMode::Deferred,
            ..small(GfxFamily::XeHpc)
        };
        let report = run(&config).unwrap();
        assert!(report.engines.iter().all(|engine| engine.direct_submission));
        assert!(report.engines.iter().all(|engine| engine.kernels_executed == 6));
        assert_eq!(report.live_allocations_after_teardown, 0);
    }

    #[test]
    fn multi_tile_engines_complete_on_every_partition() {
        let config = RunConfig {
            tiles: 2,
            engines: 1,
            ..small(GfxFamily::XeHpc)
        };
        let report = run(&config).unwrap();
        assert_eq!(report.engines[0].kernels_executed, 6);
        assert_eq!(
            report.engines[0].completed_task_count,
            report.engines[0].task_count
        );
    }

    #[test]
    fn invalid_engine_counts_are_rejected() {
        let config = RunConfig {
            engines: 0,
            ..RunConfig::default()
        };
        let err = run(&config).unwrap_err();
        assert!(err.to_string().contains("engines"), "{err}");
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let config: RunConfig =
            serde_json::from_str(r#"{"family": "gen12", "csr": {"direct_submission": true}}"#)
                .unwrap();
        assert_eq!(config.family, GfxFamily::Gen12);
        assert_eq!(config.engines, RunConfig::default().engines);
        assert_eq!(config.csr.direct_submission, Some(true));
    }

    #[test]
    fn every_counts_from_one() {
        assert!(!every(0, 3));
        assert!(!every(4, 0));
        assert!(every(4, 3));
        assert!(every(1, 0));
    }
}
