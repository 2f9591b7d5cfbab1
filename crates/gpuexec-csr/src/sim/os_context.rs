use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use gpuexec_mem::ContextId;

use super::device::SimDevice;
use crate::error::{CsrError, Result};
use crate::os_context::{EngineDescriptor, OsContext};

/// OS context backed by a [`SimDevice`].
#[derive(Debug)]
pub struct SimOsContext {
    context_id: ContextId,
    descriptor: EngineDescriptor,
    device: Arc<SimDevice>,
    initialized: AtomicBool,
}

impl SimOsContext {
    pub(crate) fn new(context_id: ContextId, descriptor: EngineDescriptor, device: Arc<SimDevice>) -> Self {
        Self {
            context_id,
            descriptor,
            device,
            initialized: AtomicBool::new(false),
        }
    }

    pub fn device(&self) -> &Arc<SimDevice> {
        &self.device
    }
}

impl OsContext for SimOsContext {
    fn context_id(&self) -> ContextId {
        self.context_id
    }

    fn descriptor(&self) -> &EngineDescriptor {
        &self.descriptor
    }

    fn initialize_context(&self) -> Result<()> {
        if self.initialized.load(Ordering::Acquire) {
            return Ok(());
        }
        if self.device.take_context_init_failure(self.context_id) {
            return Err(CsrError::ContextInitialization {
                context_id: self.context_id,
                reason: "device rejected context creation".into(),
            });
        }
        self.initialized.store(true, Ordering::Release);
        tracing::debug!(
            context_id = self.context_id,
            engine = ?self.descriptor.engine_type,
            usage = ?self.descriptor.usage,
            "os context initialized"
        );
        Ok(())
    }

    fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    fn is_hang_detected(&self) -> bool {
        self.device.is_hang_detected()
    }

    fn is_direct_submission_supported(&self) -> bool {
        self.device
            .supports_direct_submission(self.descriptor.engine_type)
    }
}
