use std::sync::Arc;

use gpuexec_mem::{
    align_up, AllocationProperties, AllocationType, DeviceBitfield, GraphicsAllocation,
    MemoryManager,
};

/// Per-thread scratch sizes are programmed in 1 KiB units.
pub const SCRATCH_SIZE_GRANULARITY: u32 = 1024;

/// Result of growing the scratch space.
#[derive(Debug, Default)]
pub struct ScratchUpdate {
    /// A new allocation was installed; front end and state base address must be reprogrammed.
    pub changed: bool,
    /// The replaced allocation. In-flight work may still use it.
    pub retired: Option<Arc<GraphicsAllocation>>,
}

/// Owns the scratch allocation of one engine and grows it on demand. It never shrinks.
#[derive(Debug)]
pub struct ScratchSpaceController {
    allocation: Option<Arc<GraphicsAllocation>>,
    per_thread_size: u32,
    threads: u32,
    root_device_index: u32,
    device_bitfield: DeviceBitfield,
}

impl ScratchSpaceController {
    pub fn new(threads: u32, root_device_index: u32, device_bitfield: DeviceBitfield) -> Self {
        Self {
            allocation: None,
            per_thread_size: 0,
            threads: threads.max(1),
            root_device_index,
            device_bitfield,
        }
    }

    pub fn ensure(
        &mut self,
        memory_manager: &MemoryManager,
        required_per_thread: u32,
    ) -> gpuexec_mem::Result<ScratchUpdate> {
        if required_per_thread == 0 || required_per_thread <= self.per_thread_size {
            return Ok(ScratchUpdate::default());
        }
        let per_thread = align_up(
            u64::from(required_per_thread),
            u64::from(SCRATCH_SIZE_GRANULARITY),
        ) as u32;
        let size = per_thread as usize * self.threads as usize;
        let allocation = memory_manager.allocate_graphics_memory_with_properties(
            &AllocationProperties::new(
                self.root_device_index,
                size,
                AllocationType::Scratch,
                self.device_bitfield,
            ),
        )?;
        tracing::debug!(
            per_thread,
            size,
            gpu_address = allocation.gpu_address(),
            "grew scratch space"
        );
        self.per_thread_size = per_thread;
        Ok(ScratchUpdate {
            changed: true,
            retired: self.allocation.replace(allocation),
        })
    }

    pub fn allocation(&self) -> Option<&Arc<GraphicsAllocation>> {
        self.allocation.as_ref()
    }

    pub fn gpu_address(&self) -> u64 {
        self.allocation.as_ref().map_or(0, |a| a.gpu_address())
    }

    pub fn per_thread_size(&self) -> u32 {
        self.per_thread_size
    }

    pub fn take(&mut self) -> Option<Arc<GraphicsAllocation>> {
        self.per_thread_size = 0;
        self.allocation.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gpuexec_mem::MemoryManagerConfig;

    #[test]
    fn scratch_grows_in_granular_steps_and_retires_the_old_allocation() {
        let mm = MemoryManager::with_host_backend(MemoryManagerConfig::default());
        let mut scratch = ScratchSpaceController::new(8, 0, DeviceBitfield::TILE0);

        let update = scratch.ensure(&mm, 0).unwrap();
        assert!(!update.changed);
        assert!(scratch.allocation().is_none());

        let update = scratch.ensure(&mm, 100).unwrap();
        assert!(update.changed);
        assert!(update.retired.is_none());
        assert_eq!(scratch.per_thread_size(), 1024);
        let first = scratch.allocation().unwrap().clone();
        assert_eq!(first.size(), 8 * 1024);

        assert!(!scratch.ensure(&mm, 1024).unwrap().changed);

        let update = scratch.ensure(&mm, 1025).unwrap();
        assert!(update.changed);
        assert_eq!(update.retired.unwrap().id(), first.id());
        assert_eq!(scratch.per_thread_size(), 2048);
    }
}
