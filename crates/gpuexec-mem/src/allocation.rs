use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};

use serde::{Deserialize, Serialize};

use crate::device_bitfield::DeviceBitfield;
use crate::device_memory::DeviceMemory;
use crate::host_ptr_manager::OsHandleStorage;
use crate::{ContextId, TaskCount, MAX_OS_CONTEXTS};

/// Task count of an allocation that no submission on a context has referenced.
pub const OBJECT_NOT_USED: TaskCount = TaskCount::MAX;
/// Residency task count of an allocation that is not resident on a context.
pub const OBJECT_NOT_RESIDENT: TaskCount = TaskCount::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AllocationType {
    CommandBuffer,
    LinearStream,
    TagBuffer,
    Scratch,
    PreemptionSurface,
    DebugSurface,
    WorkPartitionSurface,
    GlobalFence,
    RayTracingBuffer,
    GlobalStatelessHeap,
    InternalHeap,
    RingBuffer,
    SemaphoreBuffer,
    ExternalHostPtr,
    InternalHostMemory,
    Buffer,
}

impl AllocationType {
    /// Allocations the driver creates for its own bookkeeping rather than on behalf of an
    /// application object.
    pub fn is_internal(self) -> bool {
        !matches!(
            self,
            AllocationType::Buffer | AllocationType::ExternalHostPtr
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AllocationId(pub u64);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocationProperties {
    pub root_device_index: u32,
    pub size: usize,
    pub allocation_type: AllocationType,
    pub device_bitfield: DeviceBitfield,
    pub alignment: Option<usize>,
    pub multi_os_context_capable: bool,
}

impl AllocationProperties {
    pub fn new(
        root_device_index: u32,
        size: usize,
        allocation_type: AllocationType,
        device_bitfield: DeviceBitfield,
    ) -> Self {
        Self {
            root_device_index,
            size,
            allocation_type,
            device_bitfield,
            alignment: None,
            multi_os_context_capable: false,
        }
    }

    pub fn with_alignment(mut self, alignment: usize) -> Self {
        self.alignment = Some(alignment);
        self
    }

    pub fn with_multi_os_context_capable(mut self, capable: bool) -> Self {
        self.multi_os_context_capable = capable;
        self
    }
}

/// A range of device-visible memory.
///
/// Allocations are shared through `Arc`: the memory manager that created one is its owner in
/// the sense that only [`crate::MemoryManager::free_graphics_memory`] releases its backing,
/// while command stream receivers, allocation lists and in-flight submissions merely hold
/// references. Per-context task counts record the last submission on each context that used
/// the allocation; per-context residency task counts record the submission it was last made
/// resident for.
#[derive(Debug)]
pub struct GraphicsAllocation {
    id: AllocationId,
    root_device_index: u32,
    allocation_type: AllocationType,
    device_bitfield: DeviceBitfield,
    size: usize,
    gpu_address: u64,
    host_ptr: Option<u64>,
    memory: Arc<DeviceMemory>,
    task_counts: Box<[AtomicU32]>,
    residency_task_counts: Box<[AtomicU32]>,
    evictable: AtomicBool,
    freed: AtomicBool,
    fragments: Mutex<Option<OsHandleStorage>>,
    shared_handle: OnceLock<u32>,
}

impl GraphicsAllocation {
    pub fn new(
        id: AllocationId,
        properties: &AllocationProperties,
        gpu_address: u64,
        memory: Arc<DeviceMemory>,
    ) -> Self {
        Self {
            id,
            root_device_index: properties.root_device_index,
            allocation_type: properties.allocation_type,
            device_bitfield: properties.device_bitfield,
            size: properties.size,
            gpu_address,
            host_ptr: None,
            memory,
            task_counts: counters(OBJECT_NOT_USED),
            residency_task_counts: counters(OBJECT_NOT_RESIDENT),
            evictable: AtomicBool::new(true),
            freed: AtomicBool::new(false),
            fragments: Mutex::new(None),
            shared_handle: OnceLock::new(),
        }
    }

    pub fn with_host_ptr(mut self, host_ptr: u64, fragments: OsHandleStorage) -> Self {
        self.host_ptr = Some(host_ptr);
        self.fragments = Mutex::new(Some(fragments));
        self
    }

    pub fn with_shared_handle(self, handle: u32) -> Self {
        let _ = self.shared_handle.set(handle);
        self
    }

    pub fn id(&self) -> AllocationId {
        self.id
    }

    pub fn root_device_index(&self) -> u32 {
        self.root_device_index
    }

    pub fn allocation_type(&self) -> AllocationType {
        self.allocation_type
    }

    pub fn device_bitfield(&self) -> DeviceBitfield {
        self.device_bitfield
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn gpu_address(&self) -> u64 {
        self.gpu_address
    }

    pub fn gpu_end(&self) -> u64 {
        self.gpu_address.saturating_add(self.size as u64)
    }

    pub fn host_ptr(&self) -> Option<u64> {
        self.host_ptr
    }

    pub fn memory(&self) -> &Arc<DeviceMemory> {
        &self.memory
    }

    pub fn shared_handle(&self) -> Option<u32> {
        self.shared_handle.get().copied()
    }

    pub(crate) fn set_shared_handle(&self, handle: u32) -> u32 {
        *self.shared_handle.get_or_init(|| handle)
    }

    /// Whether `[address, address + len)` lies inside this allocation's GPU range.
    pub fn contains_gpu_range(&self, address: u64, len: u64) -> bool {
        match address.checked_add(len) {
            Some(end) => address >= self.gpu_address && end <= self.gpu_end(),
            None => false,
        }
    }

    pub fn update_task_count(&self, task_count: TaskCount, context_id: ContextId) {
        if let Some(slot) = self.task_counts.get(context_id as usize) {
            slot.store(task_count, Ordering::Release);
        }
    }

    pub fn task_count(&self, context_id: ContextId) -> TaskCount {
        self.task_counts
            .get(context_id as usize)
            .map_or(OBJECT_NOT_USED, |slot| slot.load(Ordering::Acquire))
    }

    pub fn is_used_by_context(&self, context_id: ContextId) -> bool {
        self.task_count(context_id) != OBJECT_NOT_USED
    }

    pub fn is_used(&self) -> bool {
        self.used_contexts().next().is_some()
    }

    pub fn is_used_by_many_contexts(&self) -> bool {
        self.used_contexts().nth(1).is_some()
    }

    /// `(context, task count)` for every context that has used this allocation.
    pub fn used_contexts(&self) -> impl Iterator<Item = (ContextId, TaskCount)> + '_ {
        self.task_counts
            .iter()
            .enumerate()
            .map(|(ctx, slot)| (ctx as ContextId, slot.load(Ordering::Acquire)))
            .filter(|(_, tc)| *tc != OBJECT_NOT_USED)
    }

    pub fn update_residency_task_count(&self, task_count: TaskCount, context_id: ContextId) {
        if let Some(slot) = self.residency_task_counts.get(context_id as usize) {
            slot.store(task_count, Ordering::Release);
        }
    }

    pub fn residency_task_count(&self, context_id: ContextId) -> TaskCount {
        self.residency_task_counts
            .get(context_id as usize)
            .map_or(OBJECT_NOT_RESIDENT, |slot| slot.load(Ordering::Acquire))
    }

    pub fn is_resident(&self, context_id: ContextId) -> bool {
        self.residency_task_count(context_id) != OBJECT_NOT_RESIDENT
    }

    pub fn is_residency_task_count_below(&self, task_count: TaskCount, context_id: ContextId) -> bool {
        !self.is_resident(context_id) || self.residency_task_count(context_id) < task_count
    }

    pub fn release_residency_in_context(&self, context_id: ContextId) {
        self.update_residency_task_count(OBJECT_NOT_RESIDENT, context_id);
    }

    pub fn is_evictable(&self) -> bool {
        self.evictable.load(Ordering::Acquire)
    }

    pub fn set_evictable(&self, evictable: bool) {
        self.evictable.store(evictable, Ordering::Release);
    }

    /// Returns true exactly once, for the caller that releases the backing.
    pub(crate) fn mark_freed(&self) -> bool {
        !self.freed.swap(true, Ordering::AcqRel)
    }

    pub fn is_freed(&self) -> bool {
        self.freed.load(Ordering::Acquire)
    }

    pub(crate) fn fragments(&self) -> MutexGuard<'_, Option<OsHandleStorage>> {
        crate::lock(&self.fragments)
    }

    /// Number of host-pointer fragments backing this allocation.
    pub fn fragment_count(&self) -> usize {
        self.fragments()
            .as_ref()
            .map_or(0, |storage| storage.fragment_count())
    }
}

fn counters(initial: TaskCount) -> Box<[AtomicU32]> {
    (0..MAX_OS_CONTEXTS).map(|_| AtomicU32::new(initial)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn allocation() -> GraphicsAllocation {
        let props = AllocationProperties::new(0, 4096, AllocationType::Buffer, DeviceBitfield::TILE0);
        GraphicsAllocation::new(AllocationId(1), &props, 0x1_0000, Arc::new(DeviceMemory::new(4096)))
    }

    #[test]
    fn task_counts_are_tracked_per_context() {
        let alloc = allocation();
        assert!(!alloc.is_used());

        alloc.update_task_count(5, 0);
        assert!(alloc.is_used_by_context(0));
        assert!(!alloc.is_used_by_context(1));
        assert!(!alloc.is_used_by_many_contexts());

        alloc.update_task_count(2, 3);
        assert!(alloc.is_used_by_many_contexts());
        assert_eq!(alloc.used_contexts().collect::<Vec<_>>(), vec![(0, 5), (3, 2)]);
    }

    #[test]
    fn residency_below_check_treats_non_resident_as_below() {
        let alloc = allocation();
        assert!(alloc.is_residency_task_count_below(1, 0));

        alloc.update_residency_task_count(3, 0);
        assert!(alloc.is_resident(0));
        assert!(!alloc.is_residency_task_count_below(3, 0));
        assert!(alloc.is_residency_task_count_below(4, 0));

        alloc.release_residency_in_context(0);
        assert!(!alloc.is_resident(0));
    }

    #[test]
    fn out_of_range_contexts_read_as_unused() {
        let alloc = allocation();
        alloc.update_task_count(1, MAX_OS_CONTEXTS as ContextId);
        assert_eq!(alloc.task_count(MAX_OS_CONTEXTS as ContextId), OBJECT_NOT_USED);
    }

    #[test]
    fn fragments_stay_readable_after_a_panicking_holder() {
        let alloc = Arc::new(allocation());
        let holder = alloc.clone();
        let result = std::thread::spawn(move || {
            let _fragments = holder.fragments();
            panic!("holder died with the fragment lock");
        })
        .join();
        assert!(result.is_err());
        assert!(alloc.fragments.is_poisoned());
        assert_eq!(alloc.fragment_count(), 0);
    }

    #[test]
    fn gpu_range_containment() {
        let alloc = allocation();
        assert!(alloc.contains_gpu_range(0x1_0000, 4096));
        assert!(alloc.contains_gpu_range(0x1_0ffc, 4));
        assert!(!alloc.contains_gpu_range(0x1_0ffc, 8));
        assert!(!alloc.contains_gpu_range(u64::MAX, 2));
    }
}
