use gpuexec_mem::TaskCount;
use serde::Serialize;

use crate::submission::SubmissionStatus;

/// Result of a flush: the task count assigned to the submission, or a failure sentinel.
///
/// Sentinels sit just below `TaskCount::MAX` so they never collide with a real task count and
/// never compare as "completed" against a tag that counts up from zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CompletionStamp {
    pub task_count: TaskCount,
    pub task_level: u32,
    pub flush_stamp: u64,
}

impl CompletionStamp {
    pub const NOT_READY: TaskCount = TaskCount::MAX - 0xf;
    pub const GPU_HANG: TaskCount = TaskCount::MAX - 0x10;
    pub const OUT_OF_DEVICE_MEMORY: TaskCount = TaskCount::MAX - 0x11;
    pub const OUT_OF_HOST_MEMORY: TaskCount = TaskCount::MAX - 0x12;
    pub const FAILED: TaskCount = TaskCount::MAX - 0x13;
    pub const UNSUPPORTED: TaskCount = TaskCount::MAX - 0x14;
    pub const DEVICE_UNINITIALIZED: TaskCount = TaskCount::MAX - 0x15;

    /// Smallest reserved value; every task count at or above it is a sentinel.
    pub const FIRST_SENTINEL: TaskCount = Self::DEVICE_UNINITIALIZED;

    pub fn submitted(task_count: TaskCount, task_level: u32, flush_stamp: u64) -> Self {
        Self {
            task_count,
            task_level,
            flush_stamp,
        }
    }

    pub fn failed(status: SubmissionStatus) -> Self {
        Self {
            task_count: status.sentinel(),
            task_level: 0,
            flush_stamp: 0,
        }
    }

    pub fn is_sentinel(task_count: TaskCount) -> bool {
        task_count >= Self::FIRST_SENTINEL && task_count <= Self::NOT_READY
    }

    pub fn is_success(&self) -> bool {
        !Self::is_sentinel(self.task_count)
    }

    /// The submission status a sentinel encodes, `None` for a real task count.
    pub fn failure_status(&self) -> Option<SubmissionStatus> {
        SubmissionStatus::from_sentinel(self.task_count)
    }
}

/// Outcome of waiting for a task count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WaitStatus {
    Ready,
    NotReady,
    GpuHang,
}
