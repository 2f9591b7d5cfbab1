use std::sync::Arc;

use gpuexec_mem::{GraphicsAllocation, MemoryError, TaskCount};

/// Distance between the completion tags of consecutive partitions.
pub const TAG_PARTITION_STRIDE: usize = 16;
pub const TAG_BUFFER_SIZE: usize = 4096;
/// Task count every tag starts at; the first real submission is task count 1.
pub const INITIAL_HARDWARE_TAG: TaskCount = 0;

/// Device-written completion counters of one context, one per active partition.
#[derive(Debug)]
pub struct TagStore {
    allocation: Arc<GraphicsAllocation>,
    partitions: u32,
}

impl TagStore {
    pub fn new(allocation: Arc<GraphicsAllocation>, partitions: u32) -> gpuexec_mem::Result<Self> {
        let partitions = partitions.max(1);
        let needed = partitions as usize * TAG_PARTITION_STRIDE;
        if needed > allocation.size() {
            return Err(MemoryError::OutOfBounds {
                offset: 0,
                len: needed,
                size: allocation.size(),
            });
        }
        let store = Self {
            allocation,
            partitions,
        };
        store.initialize(INITIAL_HARDWARE_TAG)?;
        Ok(store)
    }

    pub fn initialize(&self, value: TaskCount) -> gpuexec_mem::Result<()> {
        for partition in 0..self.partitions {
            self.allocation
                .memory()
                .write_u32(partition as usize * TAG_PARTITION_STRIDE, value)?;
        }
        Ok(())
    }

    pub fn allocation(&self) -> &Arc<GraphicsAllocation> {
        &self.allocation
    }

    pub fn partitions(&self) -> u32 {
        self.partitions
    }

    /// GPU address of partition `partition`'s tag; partition 0 is the base the fence writes to.
    pub fn tag_address(&self, partition: u32) -> u64 {
        self.allocation.gpu_address() + u64::from(partition) * TAG_PARTITION_STRIDE as u64
    }

    pub fn read(&self, partition: u32) -> TaskCount {
        if partition >= self.partitions {
            return INITIAL_HARDWARE_TAG;
        }
        self.allocation
            .memory()
            .read_u32(partition as usize * TAG_PARTITION_STRIDE)
            .unwrap_or(INITIAL_HARDWARE_TAG)
    }

    /// Progress of the context: the slowest active partition.
    pub fn completed_task_count(&self) -> TaskCount {
        (0..self.partitions)
            .map(|partition| self.read(partition))
            .min()
            .unwrap_or(INITIAL_HARDWARE_TAG)
    }

    pub fn is_task_count_ready(&self, task_count: TaskCount) -> bool {
        (0..self.partitions).all(|partition| self.read(partition) >= task_count)
    }
}
