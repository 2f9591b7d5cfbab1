//! Construction of command stream receivers per GPU family.
//!
//! The process-wide registry is populated once on first use and read-only afterwards; callers
//! that need different factories build their own [`CsrFactoryRegistry`].

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use gpuexec_mem::{MemoryManager, PAGE_SIZE_64K};
use serde::{Deserialize, Serialize};

use crate::config::CsrConfig;
use crate::csr::CommandStreamReceiver;
use crate::error::{CsrError, Result};
use crate::os_context::OsContext;
use crate::submission::GpuSubmitter;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GfxFamily {
    Gen9,
    Gen12,
    XeHpc,
    Xe2,
}

/// What a family's engines support and how their receivers are sized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FamilyTraits {
    pub family: GfxFamily,
    pub heapless_supported: bool,
    pub heapless_default: bool,
    pub ray_tracing_supported: bool,
    pub system_memory_fence_required: bool,
    pub sip_required: bool,
    pub static_work_partitioning: bool,
    /// Command buffers put on the reuse list when preallocation is first requested.
    pub preallocated_command_buffers: u32,
    pub direct_submission_default: bool,
    /// Hardware threads a scratch allocation must cover.
    pub scratch_threads: u32,
    pub preemption_surface_size: usize,
    pub debug_surface_size: usize,
}

impl FamilyTraits {
    pub fn for_family(family: GfxFamily) -> Self {
        let base = Self {
            family,
            heapless_supported: false,
            heapless_default: false,
            ray_tracing_supported: false,
            system_memory_fence_required: false,
            sip_required: false,
            static_work_partitioning: false,
            preallocated_command_buffers: 0,
            direct_submission_default: false,
            scratch_threads: 64,
            preemption_surface_size: PAGE_SIZE_64K,
            debug_surface_size: 0,
        };
        match family {
            GfxFamily::Gen9 => base,
            GfxFamily::Gen12 => Self {
                preallocated_command_buffers: 2,
                scratch_threads: 96,
                ..base
            },
            GfxFamily::XeHpc => Self {
                ray_tracing_supported: true,
                system_memory_fence_required: true,
                sip_required: true,
                static_work_partitioning: true,
                preallocated_command_buffers: 4,
                direct_submission_default: true,
                scratch_threads: 512,
                debug_surface_size: PAGE_SIZE_64K,
                ..base
            },
            GfxFamily::Xe2 => Self {
                heapless_supported: true,
                heapless_default: true,
                ray_tracing_supported: true,
                system_memory_fence_required: true,
                sip_required: true,
                static_work_partitioning: true,
                preallocated_command_buffers: 4,
                direct_submission_default: true,
                scratch_threads: 512,
                debug_surface_size: PAGE_SIZE_64K,
                ..base
            },
        }
    }
}

/// Collaborators a receiver is built from.
#[derive(Clone)]
pub struct CsrParams {
    pub os_context: Arc<dyn OsContext>,
    pub submitter: Arc<dyn GpuSubmitter>,
    pub memory_manager: Arc<MemoryManager>,
    pub config: CsrConfig,
}

pub trait CsrFactory: Send + Sync {
    fn traits(&self) -> FamilyTraits;

    fn create(&self, params: CsrParams) -> Result<Arc<CommandStreamReceiver>> {
        CommandStreamReceiver::new(params, self.traits())
    }
}

/// Factory building the hardware receiver for a fixed set of family traits.
#[derive(Debug, Clone, Copy)]
pub struct HwCsrFactory {
    traits: FamilyTraits,
}

impl HwCsrFactory {
    pub fn new(traits: FamilyTraits) -> Self {
        Self { traits }
    }
}

impl CsrFactory for HwCsrFactory {
    fn traits(&self) -> FamilyTraits {
        self.traits
    }
}

#[derive(Default)]
pub struct CsrFactoryRegistry {
    factories: HashMap<GfxFamily, Box<dyn CsrFactory>>,
}

impl std::fmt::Debug for CsrFactoryRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CsrFactoryRegistry")
            .field("families", &self.factories.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl CsrFactoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding a hardware factory for every known family.
    pub fn with_builtin_families() -> Self {
        let mut registry = Self::new();
        for family in [
            GfxFamily::Gen9,
            GfxFamily::Gen12,
            GfxFamily::XeHpc,
            GfxFamily::Xe2,
        ] {
            registry.register(
                family,
                Box::new(HwCsrFactory::new(FamilyTraits::for_family(family))),
            );
        }
        registry
    }

    /// The process-wide registry.
    pub fn global() -> &'static CsrFactoryRegistry {
        static REGISTRY: OnceLock<CsrFactoryRegistry> = OnceLock::new();
        REGISTRY.get_or_init(CsrFactoryRegistry::with_builtin_families)
    }

    pub fn register(&mut self, family: GfxFamily, factory: Box<dyn CsrFactory>) {
        self.factories.insert(family, factory);
    }

    pub fn get(&self, family: GfxFamily) -> Option<&dyn CsrFactory> {
        self.factories.get(&family).map(|f| f.as_ref())
    }

    pub fn traits(&self, family: GfxFamily) -> Result<FamilyTraits> {
        self.get(family)
            .map(|f| f.traits())
            .ok_or(CsrError::UnknownFamily(family))
    }

    pub fn create(&self, family: GfxFamily, params: CsrParams) -> Result<Arc<CommandStreamReceiver>> {
        self.get(family)
            .ok_or(CsrError::UnknownFamily(family))?
            .create(params)
    }
}

/// Build a receiver for `family` through the process-wide registry.
pub fn create_command_stream_receiver(
    family: GfxFamily,
    params: CsrParams,
) -> Result<Arc<CommandStreamReceiver>> {
    CsrFactoryRegistry::global().create(family, params)
}
