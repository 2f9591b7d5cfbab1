use std::sync::Arc;

use gpuexec_mem::{GraphicsAllocation, MemoryError, TaskCount};
use serde::Serialize;

use crate::completion::CompletionStamp;
use crate::os_context::OsContext;

/// Outcome of handing a batch buffer to the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SubmissionStatus {
    Success,
    Failed,
    OutOfMemory,
    OutOfHostMemory,
    Unsupported,
    DeviceUninitialized,
}

impl SubmissionStatus {
    pub fn is_success(self) -> bool {
        self == SubmissionStatus::Success
    }

    /// Task count sentinel carried by a [`CompletionStamp`] for this status.
    pub fn sentinel(self) -> TaskCount {
        match self {
            // A successful submission has a real task count; asking for its sentinel is a
            // caller bug, reported as a generic failure.
            SubmissionStatus::Success | SubmissionStatus::Failed => CompletionStamp::FAILED,
            SubmissionStatus::OutOfMemory => CompletionStamp::OUT_OF_DEVICE_MEMORY,
            SubmissionStatus::OutOfHostMemory => CompletionStamp::OUT_OF_HOST_MEMORY,
            SubmissionStatus::Unsupported => CompletionStamp::UNSUPPORTED,
            SubmissionStatus::DeviceUninitialized => CompletionStamp::DEVICE_UNINITIALIZED,
        }
    }

    pub fn from_sentinel(task_count: TaskCount) -> Option<Self> {
        Some(match task_count {
            CompletionStamp::FAILED => SubmissionStatus::Failed,
            CompletionStamp::OUT_OF_DEVICE_MEMORY => SubmissionStatus::OutOfMemory,
            CompletionStamp::OUT_OF_HOST_MEMORY => SubmissionStatus::OutOfHostMemory,
            CompletionStamp::UNSUPPORTED => SubmissionStatus::Unsupported,
            CompletionStamp::DEVICE_UNINITIALIZED => SubmissionStatus::DeviceUninitialized,
            _ => return None,
        })
    }
}

impl From<&MemoryError> for SubmissionStatus {
    fn from(err: &MemoryError) -> Self {
        match err {
            MemoryError::OutOfDeviceMemory { .. } => SubmissionStatus::OutOfMemory,
            MemoryError::OutOfHostMemory => SubmissionStatus::OutOfHostMemory,
            _ => SubmissionStatus::Failed,
        }
    }
}

/// One submission: `used_size` bytes of commands starting at `start_offset` of
/// `command_buffer`.
#[derive(Debug, Clone)]
pub struct BatchBuffer {
    pub command_buffer: Arc<GraphicsAllocation>,
    pub start_offset: usize,
    pub used_size: usize,
    pub task_count: TaskCount,
    pub has_fence: bool,
    pub low_priority: bool,
    /// Submitted through a persistent ring rather than as a discrete submission.
    pub direct_submission: bool,
}

impl BatchBuffer {
    pub fn start_gpu_address(&self) -> u64 {
        self.command_buffer.gpu_address() + self.start_offset as u64
    }
}

/// The device submission boundary.
///
/// `residency` lists every allocation the batch may touch; implementations must make them
/// visible to the device before executing it.
pub trait GpuSubmitter: Send + Sync {
    fn submit(
        &self,
        batch: &BatchBuffer,
        residency: &[Arc<GraphicsAllocation>],
        os_context: &dyn OsContext,
    ) -> SubmissionStatus;

    /// Page out allocations no longer needed by `os_context`.
    fn process_eviction(&self, _evictions: &[Arc<GraphicsAllocation>], _os_context: &dyn OsContext) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_errors_map_to_submission_statuses() {
        assert_eq!(
            SubmissionStatus::from(&MemoryError::OutOfDeviceMemory {
                requested: 1,
                available: 0
            }),
            SubmissionStatus::OutOfMemory
        );
        assert_eq!(
            SubmissionStatus::from(&MemoryError::OutOfHostMemory),
            SubmissionStatus::OutOfHostMemory
        );
        assert_eq!(
            SubmissionStatus::from(&MemoryError::InvalidSize(0)),
            SubmissionStatus::Failed
        );
    }
}
