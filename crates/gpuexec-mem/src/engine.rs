use std::time::Duration;

use crate::internal_allocation_storage::InternalAllocationStorage;
use crate::{ContextId, TaskCount};

/// Non-owning view of one execution engine (a command stream receiver bound to an OS context).
///
/// The memory manager keeps weak references to every engine so it can wait for and reclaim
/// temporary allocations across engines; each engine's own [`InternalAllocationStorage`] holds
/// one too, to read the engine's current task count without owning it.
pub trait EngineControl: Send + Sync {
    fn context_id(&self) -> ContextId;

    fn root_device_index(&self) -> u32;

    /// Task count of the last successful submission.
    fn task_count(&self) -> TaskCount;

    /// Task count the device has reported complete on every active partition.
    fn completed_task_count(&self) -> TaskCount;

    /// Highest task count handed to the device, including submissions without a fence.
    fn latest_sent_task_count(&self) -> TaskCount;

    /// Block until `task_count` completes or `timeout` elapses. Returns true on completion.
    fn wait_for_completion(&self, task_count: TaskCount, timeout: Option<Duration>) -> bool;

    fn internal_allocation_storage(&self) -> &InternalAllocationStorage;
}
