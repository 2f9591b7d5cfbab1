use std::sync::Arc;

use gpuexec_mem::{DeviceBitfield, HostMemoryBackend, MemoryManager, MemoryManagerConfig};

use crate::config::CsrConfig;
use crate::csr::CommandStreamReceiver;
use crate::factory::{CsrParams, FamilyTraits, GfxFamily};
use crate::os_context::{EngineDescriptor, EngineType};
use crate::sim::{ExecutionMode, SimDevice};

pub(crate) fn test_config() -> CsrConfig {
    CsrConfig {
        default_wait_timeout_ms: Some(2_000),
        ..CsrConfig::default()
    }
}

pub(crate) struct Harness {
    pub device: Arc<SimDevice>,
    pub backend: Arc<HostMemoryBackend>,
    pub mm: Arc<MemoryManager>,
}

impl Harness {
    pub fn new(mode: ExecutionMode) -> Self {
        Self::with_memory_config(mode, MemoryManagerConfig::default())
    }

    pub fn with_memory_config(mode: ExecutionMode, config: MemoryManagerConfig) -> Self {
        let backend = Arc::new(HostMemoryBackend::new(config.device_memory_budget));
        let mm = Arc::new(MemoryManager::new(backend.clone(), config));
        Self {
            device: SimDevice::new(mode),
            backend,
            mm,
        }
    }

    pub fn csr(&self, family: GfxFamily) -> Arc<CommandStreamReceiver> {
        self.csr_with(family, DeviceBitfield::TILE0, test_config())
    }

    pub fn csr_with(
        &self,
        family: GfxFamily,
        device_bitfield: DeviceBitfield,
        config: CsrConfig,
    ) -> Arc<CommandStreamReceiver> {
        let os_context = self
            .device
            .create_os_context(EngineDescriptor::new(EngineType::Compute, device_bitfield));
        CommandStreamReceiver::new(
            CsrParams {
                os_context,
                submitter: self.device.clone(),
                memory_manager: self.mm.clone(),
                config,
            },
            FamilyTraits::for_family(family),
        )
        .unwrap()
    }
}
