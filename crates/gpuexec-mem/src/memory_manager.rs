use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::allocation::{AllocationId, AllocationProperties, AllocationType, GraphicsAllocation};
use crate::allocations_list::{AllocationUsage, AllocationsList};
use crate::backend::{Backing, HostMemoryBackend, MemoryBackend};
use crate::device_bitfield::DeviceBitfield;
use crate::engine::EngineControl;
use crate::error::{MemoryError, Result};
use crate::host_ptr_manager::{HostPtrManager, TemporaryAllocationCleaner};
use crate::{env_var_truthy, lock, ContextId, OBJECT_NOT_USED};

pub const DEFAULT_DEVICE_MEMORY_BUDGET: usize = 1 << 30;
pub const DEFAULT_OVERLAP_WAIT_TIMEOUT_MS: u64 = 2_000;

const OVERLAP_WAIT_TIMEOUT_ENV: &str = "GPUEXEC_OVERLAP_WAIT_TIMEOUT_MS";
const SHARED_TEMPORARY_ENV: &str = "GPUEXEC_SHARED_TEMPORARY_ALLOCATIONS";
const DEVICE_MEMORY_BUDGET_ENV: &str = "GPUEXEC_DEVICE_MEMORY_BUDGET";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryManagerConfig {
    /// Upper bound on each per-engine wait while resolving a host-pointer overlap. `None` waits
    /// until the engine completes.
    pub overlap_wait_timeout_ms: Option<u64>,
    /// Engines on the same device bitfield share one temporary allocation list.
    pub shared_temporary_allocations: bool,
    /// Bytes the in-process backend may hand out.
    pub device_memory_budget: usize,
}

impl Default for MemoryManagerConfig {
    fn default() -> Self {
        Self {
            overlap_wait_timeout_ms: Some(DEFAULT_OVERLAP_WAIT_TIMEOUT_MS),
            shared_temporary_allocations: false,
            device_memory_budget: DEFAULT_DEVICE_MEMORY_BUDGET,
        }
    }
}

impl MemoryManagerConfig {
    /// Defaults overridden by `GPUEXEC_*` environment variables. Unparsable values are ignored.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(raw) = std::env::var(OVERLAP_WAIT_TIMEOUT_ENV) {
            match raw.trim() {
                "" | "none" | "infinite" => config.overlap_wait_timeout_ms = None,
                value => {
                    if let Ok(ms) = value.parse::<u64>() {
                        config.overlap_wait_timeout_ms = Some(ms);
                    }
                }
            }
        }
        config.shared_temporary_allocations = env_var_truthy(SHARED_TEMPORARY_ENV);
        if let Some(budget) = std::env::var(DEVICE_MEMORY_BUDGET_ENV)
            .ok()
            .and_then(|s| s.trim().parse::<usize>().ok())
        {
            config.device_memory_budget = budget;
        }
        config
    }

    pub fn overlap_wait_timeout(&self) -> Option<Duration> {
        self.overlap_wait_timeout_ms.map(Duration::from_millis)
    }
}

/// Generic allocation layer shared by every engine of a device.
///
/// Owns the host pointer manager and the registry of live engines. Allocations handed out are
/// reference counted; `free_graphics_memory` is the only path that releases backing memory and
/// host fragments.
pub struct MemoryManager {
    backend: Arc<dyn MemoryBackend>,
    host_ptr_manager: HostPtrManager,
    config: MemoryManagerConfig,
    next_id: AtomicU64,
    live_allocations: AtomicUsize,
    engines: Mutex<Vec<Weak<dyn EngineControl>>>,
    shared_temporary: Mutex<HashMap<DeviceBitfield, Arc<Mutex<AllocationsList>>>>,
}

impl std::fmt::Debug for MemoryManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryManager")
            .field("config", &self.config)
            .field("live_allocations", &self.live_allocation_count())
            .field("fragments", &self.host_ptr_manager.get_fragment_count())
            .finish_non_exhaustive()
    }
}

impl MemoryManager {
    pub fn new(backend: Arc<dyn MemoryBackend>, config: MemoryManagerConfig) -> Self {
        Self {
            backend,
            host_ptr_manager: HostPtrManager::new(),
            config,
            next_id: AtomicU64::new(1),
            live_allocations: AtomicUsize::new(0),
            engines: Mutex::new(Vec::new()),
            shared_temporary: Mutex::new(HashMap::new()),
        }
    }

    /// Manager over a [`HostMemoryBackend`] sized by `config.device_memory_budget`.
    pub fn with_host_backend(config: MemoryManagerConfig) -> Self {
        let backend = HostMemoryBackend::new(config.device_memory_budget);
        Self::new(Arc::new(backend), config)
    }

    pub fn config(&self) -> &MemoryManagerConfig {
        &self.config
    }

    pub fn backend(&self) -> &Arc<dyn MemoryBackend> {
        &self.backend
    }

    pub fn host_ptr_manager(&self) -> &HostPtrManager {
        &self.host_ptr_manager
    }

    pub fn live_allocation_count(&self) -> usize {
        self.live_allocations.load(Ordering::Acquire)
    }

    fn next_id(&self) -> AllocationId {
        AllocationId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    fn track(&self, allocation: GraphicsAllocation) -> Arc<GraphicsAllocation> {
        self.live_allocations.fetch_add(1, Ordering::AcqRel);
        tracing::trace!(
            id = allocation.id().0,
            allocation_type = ?allocation.allocation_type(),
            size = allocation.size(),
            gpu_address = allocation.gpu_address(),
            "allocated graphics memory"
        );
        Arc::new(allocation)
    }

    pub fn allocate_graphics_memory_with_properties(
        &self,
        properties: &AllocationProperties,
    ) -> Result<Arc<GraphicsAllocation>> {
        if properties.size == 0 {
            return Err(MemoryError::InvalidSize(0));
        }
        let Backing { gpu_address, memory } = self.backend.allocate(properties)?;
        Ok(self.track(GraphicsAllocation::new(
            self.next_id(),
            properties,
            gpu_address,
            memory,
        )))
    }

    /// Make `[host_ptr, host_ptr + properties.size)` device visible without copying.
    ///
    /// Registers the range's fragments with the host pointer manager, resolving overlaps with
    /// earlier registrations first. On failure no fragment references are left behind.
    pub fn allocate_graphics_memory_with_host_ptr(
        &self,
        properties: &AllocationProperties,
        host_ptr: u64,
    ) -> Result<Arc<GraphicsAllocation>> {
        if properties.size == 0 {
            return Err(MemoryError::InvalidSize(0));
        }
        let root = properties.root_device_index;
        let mut storage = self.host_ptr_manager.prepare_os_storage_for_allocation(
            self,
            self.backend.as_ref(),
            properties.size,
            host_ptr,
            root,
        )?;

        let backing = match self.backend.allocate_for_host_ptr(properties, host_ptr) {
            Ok(backing) => backing,
            Err(err) => {
                self.host_ptr_manager.release_handle_storage(root, &mut storage);
                self.backend.clean_os_handles(&storage, root);
                return Err(err);
            }
        };

        let allocation = GraphicsAllocation::new(self.next_id(), properties, backing.gpu_address, backing.memory)
            .with_host_ptr(host_ptr, storage);
        Ok(self.track(allocation))
    }

    /// Device-owned copy of `data`, used when a host range cannot be mapped directly.
    pub fn allocate_internal_graphics_memory_with_host_copy(
        &self,
        root_device_index: u32,
        device_bitfield: DeviceBitfield,
        data: &[u8],
    ) -> Result<Arc<GraphicsAllocation>> {
        let properties = AllocationProperties::new(
            root_device_index,
            data.len(),
            AllocationType::InternalHostMemory,
            device_bitfield,
        );
        let allocation = self.allocate_graphics_memory_with_properties(&properties)?;
        if let Err(err) = allocation.memory().write_bytes(0, data) {
            self.free_graphics_memory(allocation);
            return Err(err);
        }
        Ok(allocation)
    }

    /// Release `allocation`'s host fragments and backing. Freeing twice is a no-op.
    pub fn free_graphics_memory(&self, allocation: Arc<GraphicsAllocation>) {
        if !allocation.mark_freed() {
            tracing::warn!(id = allocation.id().0, "graphics allocation freed twice");
            return;
        }
        let root = allocation.root_device_index();
        let fragments = allocation.fragments().take();
        if let Some(mut storage) = fragments {
            self.host_ptr_manager.release_handle_storage(root, &mut storage);
            self.backend.clean_os_handles(&storage, root);
        }

        let release_backing = match allocation.shared_handle() {
            Some(handle) => self.backend.release_shared_handle(handle),
            None => true,
        };
        if release_backing {
            self.backend.release(allocation.gpu_address(), allocation.size());
        }
        self.live_allocations.fetch_sub(1, Ordering::AcqRel);
        tracing::trace!(id = allocation.id().0, "freed graphics memory");
    }

    /// Free `allocation` now if no engine can still be reading it, else hand it to the deferred
    /// list of the first engine that is still busy with it.
    pub fn check_gpu_usage_and_destroy(&self, allocation: Arc<GraphicsAllocation>) {
        for engine in self.registered_engines() {
            let task_count = allocation.task_count(engine.context_id());
            if task_count != OBJECT_NOT_USED && engine.completed_task_count() < task_count {
                tracing::debug!(
                    id = allocation.id().0,
                    context_id = engine.context_id(),
                    task_count,
                    "deferring free of busy allocation"
                );
                engine
                    .internal_allocation_storage()
                    .store_allocation(allocation, AllocationUsage::Deferred);
                return;
            }
        }
        self.free_graphics_memory(allocation);
    }

    pub fn export_shared_handle(&self, allocation: &GraphicsAllocation) -> Result<u32> {
        if let Some(handle) = allocation.shared_handle() {
            return Ok(handle);
        }
        if allocation.host_ptr().is_some() {
            return Err(MemoryError::NotShareable(allocation.id().0));
        }
        let backing = Backing {
            gpu_address: allocation.gpu_address(),
            memory: allocation.memory().clone(),
        };
        let handle = self.backend.export_shared_handle(&backing, allocation.size())?;
        Ok(allocation.set_shared_handle(handle))
    }

    pub fn create_graphics_allocation_from_shared_handle(
        &self,
        handle: u32,
        properties: &AllocationProperties,
    ) -> Result<Arc<GraphicsAllocation>> {
        let Backing { gpu_address, memory } = self.backend.import_shared_handle(handle)?;
        let mut properties = properties.clone();
        properties.size = memory.size();
        let allocation = GraphicsAllocation::new(self.next_id(), &properties, gpu_address, memory)
            .with_shared_handle(handle);
        Ok(self.track(allocation))
    }

    pub fn register_engine(&self, engine: Weak<dyn EngineControl>) {
        let mut engines = lock(&self.engines);
        engines.retain(|e| e.strong_count() > 0);
        engines.push(engine);
    }

    pub fn unregister_engine(&self, context_id: ContextId) {
        let mut dropped = Vec::new();
        {
            let mut engines = lock(&self.engines);
            engines.retain(|weak| match weak.upgrade() {
                Some(engine) if engine.context_id() == context_id => {
                    dropped.push(engine);
                    false
                }
                Some(engine) => {
                    dropped.push(engine);
                    true
                }
                None => false,
            });
        }
        drop(dropped);
    }

    /// Live engines, upgraded under the registry lock and returned for use outside it.
    pub fn registered_engines(&self) -> Vec<Arc<dyn EngineControl>> {
        lock(&self.engines)
            .iter()
            .filter_map(Weak::upgrade)
            .collect()
    }

    /// The temporary list shared by engines on `device_bitfield`, when sharing is enabled.
    pub fn shared_temporary_list(&self, device_bitfield: DeviceBitfield) -> Option<Arc<Mutex<AllocationsList>>> {
        if !self.config.shared_temporary_allocations {
            return None;
        }
        let mut lists = lock(&self.shared_temporary);
        Some(
            lists
                .entry(device_bitfield)
                .or_insert_with(|| Arc::new(Mutex::new(AllocationsList::new(AllocationUsage::Temporary))))
                .clone(),
        )
    }

    /// Whether every registered engine has completed its last use of `allocation`.
    pub fn is_allocation_idle_on_all_engines(&self, allocation: &GraphicsAllocation) -> bool {
        self.registered_engines().iter().all(|engine| {
            let task_count = allocation.task_count(engine.context_id());
            task_count == OBJECT_NOT_USED || engine.completed_task_count() >= task_count
        })
    }

    pub fn clean_temporary_allocation_list_on_all_engines(&self, wait_for_completion: bool) {
        let timeout = self.config.overlap_wait_timeout();
        for engine in self.registered_engines() {
            if wait_for_completion {
                let latest = engine.latest_sent_task_count();
                if !engine.wait_for_completion(latest, timeout) {
                    tracing::warn!(
                        context_id = engine.context_id(),
                        task_count = latest,
                        "engine did not complete within the overlap wait timeout"
                    );
                }
            }
            let storage = engine.internal_allocation_storage();
            let completed = engine.completed_task_count();
            storage.clean_allocation_list(completed, AllocationUsage::Temporary);
            storage.clean_allocation_list(completed, AllocationUsage::Deferred);
        }
    }
}

impl TemporaryAllocationCleaner for MemoryManager {
    fn clean_temporary_allocation_list_on_all_engines(&self, wait_for_completion: bool) {
        MemoryManager::clean_temporary_allocation_list_on_all_engines(self, wait_for_completion);
    }
}
