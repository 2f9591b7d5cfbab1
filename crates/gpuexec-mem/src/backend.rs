use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::allocation::AllocationProperties;
use crate::device_memory::DeviceMemory;
use crate::error::{MemoryError, Result};
use crate::host_ptr_manager::{OsHandle, OsHandleStorage};
use crate::{align_up, lock, PAGE_SIZE, PAGE_SIZE_64K};

/// Device-visible memory returned by a [`MemoryBackend`].
#[derive(Debug, Clone)]
pub struct Backing {
    pub gpu_address: u64,
    pub memory: Arc<DeviceMemory>,
}

/// Boundary between the generic memory manager and the OS allocation mechanics.
///
/// Implementations reserve GPU virtual address space, provide the backing store and map host
/// fragments. All methods take `&self`; implementations are shared between engines.
pub trait MemoryBackend: Send + Sync {
    fn allocate(&self, properties: &AllocationProperties) -> Result<Backing>;

    /// Map `[host_ptr, host_ptr + size)` for device access. The host range itself is mapped
    /// through fragments; this only reserves the GPU virtual range.
    fn allocate_for_host_ptr(&self, properties: &AllocationProperties, host_ptr: u64) -> Result<Backing>;

    fn release(&self, gpu_address: u64, size: usize);

    /// Create OS handles for every slot of `storage` that has none yet.
    fn populate_os_handles(&self, storage: &mut OsHandleStorage, root_device_index: u32) -> Result<()>;

    /// Destroy the OS handles of slots marked `free_the_fragment`.
    fn clean_os_handles(&self, storage: &OsHandleStorage, root_device_index: u32);

    /// Publish `backing` under a process-wide handle. Exporting the same backing twice yields
    /// the same handle.
    fn export_shared_handle(&self, backing: &Backing, size: usize) -> Result<u32>;

    fn import_shared_handle(&self, handle: u32) -> Result<Backing>;

    /// Drop one allocation's reference to a shared handle. Returns true when it was the last
    /// one and the backing itself may be released.
    fn release_shared_handle(&self, handle: u32) -> bool;
}

#[derive(Debug, Clone)]
struct SharedEntry {
    backing: Backing,
    size: usize,
    refs: u32,
}

#[derive(Debug, Default)]
struct VaState {
    next_address: u64,
    used_bytes: usize,
}

/// In-process backend: a bump GPU virtual address allocator over host memory with a byte budget.
#[derive(Debug)]
pub struct HostMemoryBackend {
    budget: usize,
    va: Mutex<VaState>,
    next_os_handle: AtomicU64,
    live_os_handles: AtomicUsize,
    next_shared_handle: AtomicU64,
    shared: Mutex<HashMap<u32, SharedEntry>>,
    fail_os_handle_population: AtomicBool,
}

impl HostMemoryBackend {
    /// First GPU virtual address handed out; zero is kept invalid.
    pub const GPU_VA_BASE: u64 = 0x1_0000_0000;

    pub fn new(budget: usize) -> Self {
        Self {
            budget,
            va: Mutex::new(VaState {
                next_address: Self::GPU_VA_BASE,
                used_bytes: 0,
            }),
            next_os_handle: AtomicU64::new(1),
            live_os_handles: AtomicUsize::new(0),
            next_shared_handle: AtomicU64::new(1),
            shared: Mutex::new(HashMap::new()),
            fail_os_handle_population: AtomicBool::new(false),
        }
    }

    pub fn used_bytes(&self) -> usize {
        lock(&self.va).used_bytes
    }

    pub fn live_os_handles(&self) -> usize {
        self.live_os_handles.load(Ordering::Acquire)
    }

    /// Make every subsequent `populate_os_handles` call fail with `OutOfHostMemory`.
    pub fn set_fail_os_handle_population(&self, fail: bool) {
        self.fail_os_handle_population.store(fail, Ordering::Release);
    }

    fn reserve(&self, size: usize, alignment: usize) -> Result<u64> {
        if size == 0 {
            return Err(MemoryError::InvalidSize(size));
        }
        if !alignment.is_power_of_two() {
            return Err(MemoryError::InvalidAlignment(alignment));
        }
        let mut va = lock(&self.va);
        let available = self.budget.saturating_sub(va.used_bytes);
        if size > available {
            return Err(MemoryError::OutOfDeviceMemory {
                requested: size,
                available,
            });
        }
        let alignment = alignment.max(PAGE_SIZE_64K) as u64;
        let address = align_up(va.next_address, alignment);
        let next = address
            .checked_add(align_up(size as u64, PAGE_SIZE as u64))
            .ok_or(MemoryError::Overflow)?;
        va.next_address = next;
        va.used_bytes += size;
        Ok(address)
    }
}

impl Default for HostMemoryBackend {
    fn default() -> Self {
        Self::new(crate::memory_manager::DEFAULT_DEVICE_MEMORY_BUDGET)
    }
}

impl MemoryBackend for HostMemoryBackend {
    fn allocate(&self, properties: &AllocationProperties) -> Result<Backing> {
        let alignment = properties.alignment.unwrap_or(PAGE_SIZE);
        let gpu_address = self.reserve(properties.size, alignment)?;
        Ok(Backing {
            gpu_address,
            memory: Arc::new(DeviceMemory::new(properties.size)),
        })
    }

    fn allocate_for_host_ptr(&self, properties: &AllocationProperties, host_ptr: u64) -> Result<Backing> {
        let offset = (host_ptr % PAGE_SIZE as u64) as usize;
        let mapped = properties.size.checked_add(offset).ok_or(MemoryError::Overflow)?;
        let base = self.reserve(mapped, PAGE_SIZE)?;
        Ok(Backing {
            gpu_address: base + offset as u64,
            memory: Arc::new(DeviceMemory::new(properties.size)),
        })
    }

    fn release(&self, _gpu_address: u64, size: usize) {
        let mut va = lock(&self.va);
        va.used_bytes = va.used_bytes.saturating_sub(size);
    }

    fn populate_os_handles(&self, storage: &mut OsHandleStorage, root_device_index: u32) -> Result<()> {
        if self.fail_os_handle_population.load(Ordering::Acquire) {
            tracing::warn!(root_device_index, "os handle population failed");
            return Err(MemoryError::OutOfHostMemory);
        }
        for slot in storage.slots.iter_mut().flatten() {
            if slot.os_handle.is_none() {
                let handle = self.next_os_handle.fetch_add(1, Ordering::Relaxed);
                slot.os_handle = Some(OsHandle(handle));
                self.live_os_handles.fetch_add(1, Ordering::AcqRel);
            }
        }
        Ok(())
    }

    fn clean_os_handles(&self, storage: &OsHandleStorage, _root_device_index: u32) {
        for slot in storage.iter() {
            if slot.free_the_fragment && slot.os_handle.is_some() {
                self.live_os_handles.fetch_sub(1, Ordering::AcqRel);
            }
        }
    }

    fn export_shared_handle(&self, backing: &Backing, size: usize) -> Result<u32> {
        let mut shared = lock(&self.shared);
        if let Some((handle, entry)) = shared
            .iter_mut()
            .find(|(_, entry)| entry.backing.gpu_address == backing.gpu_address)
        {
            return Ok(*handle);
        }
        let handle = u32::try_from(self.next_shared_handle.fetch_add(1, Ordering::Relaxed))
            .map_err(|_| MemoryError::Overflow)?;
        shared.insert(
            handle,
            SharedEntry {
                backing: backing.clone(),
                size,
                refs: 1,
            },
        );
        Ok(handle)
    }

    fn import_shared_handle(&self, handle: u32) -> Result<Backing> {
        let mut shared = lock(&self.shared);
        let entry = shared
            .get_mut(&handle)
            .ok_or(MemoryError::UnknownSharedHandle(handle))?;
        entry.refs += 1;
        tracing::debug!(handle, size = entry.size, "imported shared handle");
        Ok(entry.backing.clone())
    }

    fn release_shared_handle(&self, handle: u32) -> bool {
        let mut shared = lock(&self.shared);
        let Some(entry) = shared.get_mut(&handle) else {
            return true;
        };
        entry.refs = entry.refs.saturating_sub(1);
        if entry.refs == 0 {
            shared.remove(&handle);
            return true;
        }
        false
    }
}
