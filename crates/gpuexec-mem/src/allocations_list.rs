use std::collections::VecDeque;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::allocation::{AllocationId, AllocationType, GraphicsAllocation};
use crate::{ContextId, TaskCount};

/// Which list of an [`crate::InternalAllocationStorage`] an allocation lives on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AllocationUsage {
    /// Short-lived staging allocations, freed once their task count completes.
    Temporary,
    /// Idle allocations kept warm for reuse by the same engine.
    Reusable,
    /// Allocations released by their owner while the device may still read them.
    Deferred,
}

/// Criteria for [`AllocationsList::detach_allocation`].
#[derive(Debug, Clone, Copy)]
pub struct DetachRequest {
    pub required_size: usize,
    pub required_ptr: Option<u64>,
    pub allocation_type: AllocationType,
    pub context_id: ContextId,
    /// Completion tag of the requesting engine; reusable entries must have completed.
    pub completed_task_count: TaskCount,
}

#[derive(Debug)]
pub struct AllocationsList {
    usage: AllocationUsage,
    entries: VecDeque<Arc<GraphicsAllocation>>,
}

impl AllocationsList {
    pub fn new(usage: AllocationUsage) -> Self {
        Self {
            usage,
            entries: VecDeque::new(),
        }
    }

    pub fn usage(&self) -> AllocationUsage {
        self.usage
    }

    pub fn push_tail(&mut self, allocation: Arc<GraphicsAllocation>) {
        self.entries.push_back(allocation);
    }

    /// Remove and return the first entry matching `request`.
    ///
    /// Temporary entries match on pointer, type and size regardless of completion, since the
    /// caller is about to resubmit the same host range. Reusable and deferred entries must also
    /// have completed on the requesting context.
    pub fn detach_allocation(&mut self, request: &DetachRequest) -> Option<Arc<GraphicsAllocation>> {
        let position = self.entries.iter().position(|alloc| {
            let completed = self.usage == AllocationUsage::Temporary
                || request.completed_task_count >= alloc.task_count(request.context_id);
            if !completed
                || alloc.size() < request.required_size
                || alloc.allocation_type() != request.allocation_type
            {
                return false;
            }
            match request.required_ptr {
                Some(ptr) => alloc.host_ptr() == Some(ptr),
                None => true,
            }
        })?;
        self.entries.remove(position)
    }

    /// Split off every entry for which `ready` returns true, preserving the order of the rest.
    pub fn take_where(
        &mut self,
        mut ready: impl FnMut(&GraphicsAllocation) -> bool,
    ) -> Vec<Arc<GraphicsAllocation>> {
        let mut taken = Vec::new();
        let mut kept = VecDeque::with_capacity(self.entries.len());
        for alloc in self.entries.drain(..) {
            if ready(&alloc) {
                taken.push(alloc);
            } else {
                kept.push_back(alloc);
            }
        }
        self.entries = kept;
        taken
    }

    pub fn drain(&mut self) -> Vec<Arc<GraphicsAllocation>> {
        self.entries.drain(..).collect()
    }

    pub fn peek_contains(&self, id: AllocationId) -> bool {
        self.entries.iter().any(|alloc| alloc.id() == id)
    }

    pub fn ids(&self) -> Vec<AllocationId> {
        self.entries.iter().map(|alloc| alloc.id()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocation::AllocationProperties;
    use crate::device_bitfield::DeviceBitfield;
    use crate::device_memory::DeviceMemory;
    use crate::host_ptr_manager::OsHandleStorage;

    fn alloc(id: u64, size: usize, ty: AllocationType) -> Arc<GraphicsAllocation> {
        let props = AllocationProperties::new(0, size, ty, DeviceBitfield::TILE0);
        Arc::new(GraphicsAllocation::new(
            AllocationId(id),
            &props,
            id << 20,
            Arc::new(DeviceMemory::new(size)),
        ))
    }

    fn request(size: usize, ty: AllocationType, completed: TaskCount) -> DetachRequest {
        DetachRequest {
            required_size: size,
            required_ptr: None,
            allocation_type: ty,
            context_id: 0,
            completed_task_count: completed,
        }
    }

    #[test]
    fn reusable_detach_requires_completion_size_and_type() {
        let mut list = AllocationsList::new(AllocationUsage::Reusable);
        let small = alloc(1, 4096, AllocationType::CommandBuffer);
        let big = alloc(2, 65536, AllocationType::CommandBuffer);
        let heap = alloc(3, 65536, AllocationType::LinearStream);
        small.update_task_count(1, 0);
        big.update_task_count(5, 0);
        heap.update_task_count(1, 0);
        list.push_tail(small);
        list.push_tail(big);
        list.push_tail(heap);

        assert!(list
            .detach_allocation(&request(8192, AllocationType::CommandBuffer, 4))
            .is_none());
        let got = list
            .detach_allocation(&request(8192, AllocationType::CommandBuffer, 5))
            .unwrap();
        assert_eq!(got.id(), AllocationId(2));
        assert_eq!(list.len(), 2);
    }

    #[test]
    fn temporary_detach_matches_pointer_and_ignores_completion() {
        let mut list = AllocationsList::new(AllocationUsage::Temporary);
        let props = AllocationProperties::new(0, 4096, AllocationType::ExternalHostPtr, DeviceBitfield::TILE0);
        let with_ptr = Arc::new(
            GraphicsAllocation::new(AllocationId(7), &props, 0x10_0000, Arc::new(DeviceMemory::new(4096)))
                .with_host_ptr(0x5000, OsHandleStorage::default()),
        );
        with_ptr.update_task_count(100, 0);
        list.push_tail(with_ptr);

        let mut req = request(4096, AllocationType::ExternalHostPtr, 0);
        req.required_ptr = Some(0x6000);
        assert!(list.detach_allocation(&req).is_none());

        req.required_ptr = Some(0x5000);
        assert_eq!(list.detach_allocation(&req).unwrap().id(), AllocationId(7));
        assert!(list.is_empty());
    }

    #[test]
    fn take_where_preserves_order_of_remaining_entries() {
        let mut list = AllocationsList::new(AllocationUsage::Temporary);
        for id in 1..=4 {
            list.push_tail(alloc(id, 4096, AllocationType::Buffer));
        }
        let taken = list.take_where(|a| a.id().0 % 2 == 0);
        assert_eq!(taken.len(), 2);
        assert_eq!(list.ids(), vec![AllocationId(1), AllocationId(3)]);
    }
}
