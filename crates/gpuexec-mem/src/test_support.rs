use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use crate::device_bitfield::DeviceBitfield;
use crate::engine::EngineControl;
use crate::internal_allocation_storage::InternalAllocationStorage;
use crate::memory_manager::MemoryManager;
use crate::{ContextId, TaskCount};

/// Engine whose counters are set directly by the test.
pub(crate) struct FakeEngine {
    context_id: ContextId,
    task_count: AtomicU32,
    completed: AtomicU32,
    latest_sent: AtomicU32,
    completes_on_wait: AtomicBool,
    storage: InternalAllocationStorage,
}

impl FakeEngine {
    pub(crate) fn new(context_id: ContextId, memory_manager: Arc<MemoryManager>) -> Arc<Self> {
        let engine = Arc::new_cyclic(|weak: &Weak<FakeEngine>| {
            let weak: Weak<dyn EngineControl> = weak.clone();
            FakeEngine {
                context_id,
                task_count: AtomicU32::new(0),
                completed: AtomicU32::new(0),
                latest_sent: AtomicU32::new(0),
                completes_on_wait: AtomicBool::new(false),
                storage: InternalAllocationStorage::new(
                    weak,
                    context_id,
                    DeviceBitfield::TILE0,
                    memory_manager.clone(),
                ),
            }
        });
        let weak: Weak<dyn EngineControl> = Arc::downgrade(&engine) as Weak<dyn EngineControl>;
        memory_manager.register_engine(weak);
        engine
    }

    pub(crate) fn set_task_count(&self, value: TaskCount) {
        self.task_count.store(value, Ordering::Release);
    }

    pub(crate) fn set_completed(&self, value: TaskCount) {
        self.completed.store(value, Ordering::Release);
    }

    pub(crate) fn set_latest_sent(&self, value: TaskCount) {
        self.latest_sent.store(value, Ordering::Release);
    }

    pub(crate) fn set_completes_on_wait(&self, value: bool) {
        self.completes_on_wait.store(value, Ordering::Release);
    }
}

impl EngineControl for FakeEngine {
    fn context_id(&self) -> ContextId {
        self.context_id
    }

    fn root_device_index(&self) -> u32 {
        0
    }

    fn task_count(&self) -> TaskCount {
        self.task_count.load(Ordering::Acquire)
    }

    fn completed_task_count(&self) -> TaskCount {
        self.completed.load(Ordering::Acquire)
    }

    fn latest_sent_task_count(&self) -> TaskCount {
        self.latest_sent.load(Ordering::Acquire)
    }

    fn wait_for_completion(&self, task_count: TaskCount, _timeout: Option<Duration>) -> bool {
        if self.completes_on_wait.load(Ordering::Acquire) {
            self.completed.fetch_max(task_count, Ordering::AcqRel);
        }
        self.completed_task_count() >= task_count
    }

    fn internal_allocation_storage(&self) -> &InternalAllocationStorage {
        &self.storage
    }
}
