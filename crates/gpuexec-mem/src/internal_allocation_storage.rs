use std::sync::{Arc, Mutex, Weak};

use crate::allocation::{AllocationId, AllocationType, GraphicsAllocation};
use crate::allocations_list::{AllocationUsage, AllocationsList, DetachRequest};
use crate::device_bitfield::DeviceBitfield;
use crate::engine::EngineControl;
use crate::memory_manager::MemoryManager;
use crate::{lock, ContextId, TaskCount};

/// Allocations whose lifetime is bound to task-count completion on one engine.
///
/// Owned by the engine's command stream receiver; the back-reference to the engine is weak so
/// ownership stays one-directional. The temporary list is either private or, when the memory
/// manager runs with shared temporary allocations, one list shared by every engine on the same
/// device bitfield.
pub struct InternalAllocationStorage {
    engine: Weak<dyn EngineControl>,
    context_id: ContextId,
    device_bitfield: DeviceBitfield,
    memory_manager: Arc<MemoryManager>,
    temporary: Arc<Mutex<AllocationsList>>,
    shared_temporary: bool,
    reusable: Mutex<AllocationsList>,
    deferred: Mutex<AllocationsList>,
}

impl std::fmt::Debug for InternalAllocationStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InternalAllocationStorage")
            .field("context_id", &self.context_id)
            .field("device_bitfield", &self.device_bitfield)
            .field("shared_temporary", &self.shared_temporary)
            .finish_non_exhaustive()
    }
}

impl InternalAllocationStorage {
    pub fn new(
        engine: Weak<dyn EngineControl>,
        context_id: ContextId,
        device_bitfield: DeviceBitfield,
        memory_manager: Arc<MemoryManager>,
    ) -> Self {
        let (temporary, shared_temporary) = match memory_manager.shared_temporary_list(device_bitfield) {
            Some(list) => (list, true),
            None => (
                Arc::new(Mutex::new(AllocationsList::new(AllocationUsage::Temporary))),
                false,
            ),
        };
        Self {
            engine,
            context_id,
            device_bitfield,
            memory_manager,
            temporary,
            shared_temporary,
            reusable: Mutex::new(AllocationsList::new(AllocationUsage::Reusable)),
            deferred: Mutex::new(AllocationsList::new(AllocationUsage::Deferred)),
        }
    }

    pub fn context_id(&self) -> ContextId {
        self.context_id
    }

    pub fn device_bitfield(&self) -> DeviceBitfield {
        self.device_bitfield
    }

    pub fn memory_manager(&self) -> &Arc<MemoryManager> {
        &self.memory_manager
    }

    pub fn is_temporary_list_shared(&self) -> bool {
        self.shared_temporary
    }

    fn list(&self, usage: AllocationUsage) -> &Mutex<AllocationsList> {
        match usage {
            AllocationUsage::Temporary => &self.temporary,
            AllocationUsage::Reusable => &self.reusable,
            AllocationUsage::Deferred => &self.deferred,
        }
    }

    /// Store `allocation` stamped with the task count after which it is safe to touch again.
    ///
    /// Reusable allocations are stamped with the engine's current task count, since the engine
    /// has just stopped using them. Temporary and deferred allocations keep the task count of
    /// their last use on this context.
    pub fn store_allocation(&self, allocation: Arc<GraphicsAllocation>, usage: AllocationUsage) {
        let task_count = match (usage, self.engine.upgrade()) {
            (AllocationUsage::Reusable, Some(engine)) => engine.task_count(),
            _ => allocation.task_count(self.context_id),
        };
        self.store_allocation_with_task_count(allocation, usage, task_count);
    }

    pub fn store_allocation_with_task_count(
        &self,
        allocation: Arc<GraphicsAllocation>,
        usage: AllocationUsage,
        task_count: TaskCount,
    ) {
        allocation.update_task_count(task_count, self.context_id);
        lock(self.list(usage)).push_tail(allocation);
    }

    /// Free every `usage` entry whose task count on this context is at most `wait_task_count`.
    ///
    /// With a shared temporary list, and always for deferred entries, an entry is only freed
    /// once it is idle on every registered engine, not just this one.
    pub fn clean_allocation_list(&self, wait_task_count: TaskCount, usage: AllocationUsage) {
        let check_all_engines = usage == AllocationUsage::Deferred
            || (usage == AllocationUsage::Temporary && self.shared_temporary);
        let context_id = self.context_id;
        let memory_manager = &self.memory_manager;

        let ready = lock(self.list(usage)).take_where(|allocation| {
            if check_all_engines {
                let own = allocation.task_count(context_id);
                (own == crate::OBJECT_NOT_USED || own <= wait_task_count)
                    && memory_manager.is_allocation_idle_on_all_engines(allocation)
            } else {
                allocation.task_count(context_id) <= wait_task_count
            }
        });

        if !ready.is_empty() {
            tracing::trace!(
                context_id,
                ?usage,
                wait_task_count,
                freed = ready.len(),
                "cleaned allocation list"
            );
        }
        for allocation in ready {
            self.memory_manager.free_graphics_memory(allocation);
        }
    }

    /// Detach a completed reusable allocation of `allocation_type` holding at least `size` bytes.
    pub fn obtain_reusable_allocation(
        &self,
        size: usize,
        allocation_type: AllocationType,
    ) -> Option<Arc<GraphicsAllocation>> {
        let completed_task_count = self.engine.upgrade()?.completed_task_count();
        lock(&self.reusable).detach_allocation(&DetachRequest {
            required_size: size,
            required_ptr: None,
            allocation_type,
            context_id: self.context_id,
            completed_task_count,
        })
    }

    /// Detach a temporary allocation previously created for `host_ptr`, regardless of completion.
    pub fn obtain_temporary_allocation_with_ptr(
        &self,
        size: usize,
        host_ptr: u64,
        allocation_type: AllocationType,
    ) -> Option<Arc<GraphicsAllocation>> {
        lock(&self.temporary).detach_allocation(&DetachRequest {
            required_size: size,
            required_ptr: Some(host_ptr),
            allocation_type,
            context_id: self.context_id,
            completed_task_count: 0,
        })
    }

    /// Free everything this storage owns. The caller waits for completion first.
    ///
    /// Entries of a shared temporary list are only freed when idle on every engine; the rest stay
    /// with the other engines sharing the list.
    pub fn free_all(&self) {
        let temporary = if self.shared_temporary {
            let memory_manager = &self.memory_manager;
            let context_id = self.context_id;
            lock(&self.temporary).take_where(|allocation| {
                allocation.is_used_by_context(context_id)
                    && memory_manager.is_allocation_idle_on_all_engines(allocation)
            })
        } else {
            lock(&self.temporary).drain()
        };
        let reusable = lock(&self.reusable).drain();
        let deferred = lock(&self.deferred).drain();
        for allocation in temporary.into_iter().chain(reusable).chain(deferred) {
            self.memory_manager.free_graphics_memory(allocation);
        }
    }

    pub fn len(&self, usage: AllocationUsage) -> usize {
        lock(self.list(usage)).len()
    }

    pub fn is_empty(&self, usage: AllocationUsage) -> bool {
        lock(self.list(usage)).is_empty()
    }

    pub fn contains(&self, usage: AllocationUsage, id: AllocationId) -> bool {
        lock(self.list(usage)).peek_contains(id)
    }

    pub fn ids(&self, usage: AllocationUsage) -> Vec<AllocationId> {
        lock(self.list(usage)).ids()
    }
}
