//! Device memory bookkeeping for the GPU execution core.
//!
//! - [`GraphicsAllocation`]: a device-visible range with per-context task and residency counts
//! - [`MemoryManager`]: allocation, host-pointer mapping and deferred destruction across engines
//! - [`HostPtrManager`]: page-granular fragment table for host memory made device visible
//! - [`InternalAllocationStorage`]: per-engine reusable, temporary and deferred allocation lists
//! - [`MemoryBackend`]: the OS allocation boundary, with an in-process [`HostMemoryBackend`]
#![forbid(unsafe_code)]

mod allocation;
mod allocations_list;
mod backend;
mod device_bitfield;
mod device_memory;
mod engine;
mod error;
mod host_ptr_manager;
mod internal_allocation_storage;
mod memory_manager;

use std::sync::{Mutex, MutexGuard};

pub use allocation::{
    AllocationId, AllocationProperties, AllocationType, GraphicsAllocation, OBJECT_NOT_RESIDENT,
    OBJECT_NOT_USED,
};
pub use allocations_list::{AllocationUsage, AllocationsList, DetachRequest};
pub use backend::{Backing, HostMemoryBackend, MemoryBackend};
pub use device_bitfield::DeviceBitfield;
pub use device_memory::DeviceMemory;
pub use engine::EngineControl;
pub use error::{MemoryError, Result};
pub use host_ptr_manager::{
    AllocationFragment, AllocationRequirements, FragmentPosition, FragmentSlot, FragmentStorage,
    HostPtrEntryKey, HostPtrManager, OsHandle, OsHandleStorage, OverlapStatus,
    RequirementsStatus, TemporaryAllocationCleaner, MAX_FRAGMENTS_COUNT,
};
pub use internal_allocation_storage::InternalAllocationStorage;
pub use memory_manager::{
    MemoryManager, MemoryManagerConfig, DEFAULT_DEVICE_MEMORY_BUDGET,
    DEFAULT_OVERLAP_WAIT_TIMEOUT_MS,
};

/// Host-side submission counter.
pub type TaskCount = u32;
/// Index of an OS context; keys per-allocation task and residency counts.
pub type ContextId = u32;

pub const MAX_OS_CONTEXTS: usize = 64;

pub const PAGE_SIZE: usize = 4096;
pub const PAGE_SIZE_64K: usize = 64 * 1024;
pub const PAGE_SIZE_2M: usize = 2 * 1024 * 1024;
pub const CACHE_LINE_SIZE: usize = 64;

/// Round `value` up to a multiple of `alignment`, saturating at the largest aligned value.
pub fn align_up(value: u64, alignment: u64) -> u64 {
    debug_assert!(alignment > 0);
    match value.checked_add(alignment - 1) {
        Some(v) => v / alignment * alignment,
        None => u64::MAX / alignment * alignment,
    }
}

pub fn align_down(value: u64, alignment: u64) -> u64 {
    debug_assert!(alignment > 0);
    value / alignment * alignment
}

pub fn align_up_usize(value: usize, alignment: usize) -> usize {
    align_up(value as u64, alignment as u64).min(usize::MAX as u64) as usize
}

/// Reads a boolean-ish environment variable (`1`, `true`, `yes`, `on`).
pub fn env_var_truthy(name: &str) -> bool {
    let Ok(raw) = std::env::var(name) else {
        return false;
    };

    let v = raw.trim();
    v == "1"
        || v.eq_ignore_ascii_case("true")
        || v.eq_ignore_ascii_case("yes")
        || v.eq_ignore_ascii_case("on")
}

/// Lock ignoring poisoning.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod test_support;

#[cfg(all(test, not(target_arch = "wasm32")))]
mod proptests;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn align_up_rounds_to_multiple() {
        assert_eq!(align_up(0, 4096), 0);
        assert_eq!(align_up(1, 4096), 4096);
        assert_eq!(align_up(4096, 4096), 4096);
        assert_eq!(align_up(0x1045, 0x1000), 0x2000);
        assert_eq!(align_up(u64::MAX - 3, 4096), u64::MAX / 4096 * 4096);
        assert_eq!(align_down(0x1fff, 0x1000), 0x1000);
        assert_eq!(align_up_usize(65, CACHE_LINE_SIZE), 128);
    }
}
