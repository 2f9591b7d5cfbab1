#![allow(dead_code)]

use std::sync::Arc;

use gpuexec::csr::sim::{ExecutionMode, SimDevice};
use gpuexec::csr::{
    create_command_stream_receiver, Command, CommandStreamReceiver, CsrConfig, CsrParams,
    EngineDescriptor, EngineType, GfxFamily,
};
use gpuexec::mem::{
    AllocationProperties, AllocationType, DeviceBitfield, GraphicsAllocation, HostMemoryBackend,
    MemoryManager, MemoryManagerConfig,
};

/// Route engine logs to the test harness; `RUST_LOG` selects what is shown.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn config() -> CsrConfig {
    CsrConfig {
        default_wait_timeout_ms: Some(2_000),
        ..CsrConfig::default()
    }
}

/// A simulated device with its memory manager.
pub struct Rig {
    pub device: Arc<SimDevice>,
    pub backend: Arc<HostMemoryBackend>,
    pub mm: Arc<MemoryManager>,
}

impl Rig {
    pub fn new(mode: ExecutionMode) -> Self {
        Self::with_memory(mode, MemoryManagerConfig::default())
    }

    pub fn with_memory(mode: ExecutionMode, memory: MemoryManagerConfig) -> Self {
        init_tracing();
        let backend = Arc::new(HostMemoryBackend::new(memory.device_memory_budget));
        let mm = Arc::new(MemoryManager::new(backend.clone(), memory));
        Self {
            device: SimDevice::new(mode),
            backend,
            mm,
        }
    }

    pub fn receiver(&self, family: GfxFamily) -> Arc<CommandStreamReceiver> {
        self.receiver_with(family, DeviceBitfield::TILE0, config())
    }

    pub fn receiver_with(
        &self,
        family: GfxFamily,
        device_bitfield: DeviceBitfield,
        config: CsrConfig,
    ) -> Arc<CommandStreamReceiver> {
        let os_context = self
            .device
            .create_os_context(EngineDescriptor::new(EngineType::Compute, device_bitfield));
        create_command_stream_receiver(
            family,
            CsrParams {
                os_context,
                submitter: self.device.clone(),
                memory_manager: self.mm.clone(),
                config,
            },
        )
        .unwrap()
    }

    pub fn buffer(&self, size: usize) -> Arc<GraphicsAllocation> {
        self.mm
            .allocate_graphics_memory_with_properties(&AllocationProperties::new(
                0,
                size,
                AllocationType::Buffer,
                DeviceBitfield::TILE0,
            ))
            .unwrap()
    }
}

/// Kernel dispatch that increments the dword at `counter`.
pub fn walker(counter: &GraphicsAllocation) -> Command {
    Command::ComputeWalker {
        kernel_id: 1,
        groups: [1, 1, 1],
        args_address: counter.gpu_address(),
    }
}
