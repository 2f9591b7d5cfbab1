use gpuexec_mem::{ContextId, DeviceBitfield};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineType {
    Render,
    #[default]
    Compute,
    Copy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineUsage {
    #[default]
    Regular,
    LowPriority,
    HighPriority,
    Internal,
}

/// The (engine, priority, sub-device set) an OS context is bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineDescriptor {
    pub engine_type: EngineType,
    pub usage: EngineUsage,
    pub device_bitfield: DeviceBitfield,
    pub root_device_index: u32,
}

impl EngineDescriptor {
    pub fn new(engine_type: EngineType, device_bitfield: DeviceBitfield) -> Self {
        Self {
            engine_type,
            usage: EngineUsage::Regular,
            device_bitfield,
            root_device_index: 0,
        }
    }

    pub fn with_usage(mut self, usage: EngineUsage) -> Self {
        self.usage = usage;
        self
    }

    pub fn with_root_device_index(mut self, root_device_index: u32) -> Self {
        self.root_device_index = root_device_index;
        self
    }
}

/// A kernel-side execution context a command stream receiver submits through.
pub trait OsContext: Send + Sync {
    fn context_id(&self) -> ContextId;

    fn descriptor(&self) -> &EngineDescriptor;

    /// Create the kernel-side context. Called once before the first submission; repeated calls
    /// after success are no-ops.
    fn initialize_context(&self) -> crate::Result<()>;

    fn is_initialized(&self) -> bool;

    /// Driver-model hang check.
    fn is_hang_detected(&self) -> bool;

    fn is_direct_submission_supported(&self) -> bool;

    fn device_bitfield(&self) -> DeviceBitfield {
        self.descriptor().device_bitfield
    }

    fn root_device_index(&self) -> u32 {
        self.descriptor().root_device_index
    }

    fn engine_type(&self) -> EngineType {
        self.descriptor().engine_type
    }

    fn is_low_priority(&self) -> bool {
        self.descriptor().usage == EngineUsage::LowPriority
    }
}
