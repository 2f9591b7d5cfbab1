//! The command stream receiver: one per engine context.
//!
//! A receiver owns the engine's command buffer, completion tags, programmed-state tracking and
//! resident set, and turns flush requests into submissions. Mutable submission state lives
//! behind one mutex so task count `N` is fully built and handed to the device before `N + 1`
//! starts. Counters read by waiters and by the memory manager are atomics outside that lock.

mod flush;
mod residency;
mod resources;
mod wait;

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use gpuexec_mem::{
    AllocationProperties, AllocationType, ContextId, DeviceBitfield, EngineControl,
    GraphicsAllocation, InternalAllocationStorage, MemoryManager, TaskCount,
};

use crate::completion::WaitStatus;
use crate::config::CsrConfig;
use crate::direct_submission::DirectSubmission;
use crate::error::Result;
use crate::factory::{CsrParams, FamilyTraits};
use crate::hw_state::HardwareState;
use crate::linear_stream::{IndirectHeap, LinearStream};
use crate::os_context::OsContext;
use crate::scratch::ScratchSpaceController;
use crate::stats::CsrStats;
use crate::submission::GpuSubmitter;
use crate::tag_store::{TagStore, TAG_BUFFER_SIZE};

pub use flush::{Dependency, DispatchFlags, FlushPayload};
pub use resources::HostPtrSurface;

/// Driver-owned allocations created on first flush.
#[derive(Debug, Default)]
struct Surfaces {
    global_fence: Option<Arc<GraphicsAllocation>>,
    preemption: Option<Arc<GraphicsAllocation>>,
    debug: Option<Arc<GraphicsAllocation>>,
    work_partition: Option<Arc<GraphicsAllocation>>,
    global_stateless_heap: Option<Arc<GraphicsAllocation>>,
    ray_tracing: Option<Arc<GraphicsAllocation>>,
}

impl Surfaces {
    fn iter(&self) -> impl Iterator<Item = &Arc<GraphicsAllocation>> {
        [
            &self.global_fence,
            &self.preemption,
            &self.debug,
            &self.work_partition,
            &self.global_stateless_heap,
            &self.ray_tracing,
        ]
        .into_iter()
        .flatten()
    }

    fn take_all(&mut self) -> Vec<Arc<GraphicsAllocation>> {
        [
            self.global_fence.take(),
            self.preemption.take(),
            self.debug.take(),
            self.work_partition.take(),
            self.global_stateless_heap.take(),
            self.ray_tracing.take(),
        ]
        .into_iter()
        .flatten()
        .collect()
    }
}

/// State mutated while building a submission.
#[derive(Debug)]
struct CsrState {
    command_stream: LinearStream,
    hw: HardwareState,
    residency: Vec<Arc<GraphicsAllocation>>,
    /// Task counts to restore if the pending submission fails.
    residency_restore: Vec<(Arc<GraphicsAllocation>, TaskCount)>,
    eviction: Vec<Arc<GraphicsAllocation>>,
    resources_initialized: bool,
    surfaces: Surfaces,
    scratch: ScratchSpaceController,
    heaps: [Option<IndirectHeap>; 3],
    direct_submission: Option<DirectSubmission>,
    preallocation_requests: u32,
    preallocated: u32,
}

pub struct CommandStreamReceiver {
    os_context: Arc<dyn OsContext>,
    submitter: Arc<dyn GpuSubmitter>,
    memory_manager: Arc<MemoryManager>,
    traits: FamilyTraits,
    config: CsrConfig,
    storage: InternalAllocationStorage,
    tags: TagStore,
    heapless: bool,
    task_count: AtomicU32,
    latest_flushed: AtomicU32,
    latest_sent: AtomicU32,
    /// Last task count submitted with a completion fence.
    last_fenced: AtomicU32,
    flush_stamp: AtomicU64,
    state: Mutex<CsrState>,
    host_surface_lock: Mutex<()>,
    stats: CsrStats,
}

impl std::fmt::Debug for CommandStreamReceiver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandStreamReceiver")
            .field("context_id", &self.context_id())
            .field("family", &self.traits.family)
            .field("task_count", &self.task_count())
            .field("heapless", &self.heapless)
            .finish_non_exhaustive()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl CommandStreamReceiver {
    /// Build a receiver and register it with the memory manager.
    ///
    /// The tag allocation is created here; everything else is created on the first flush.
    pub fn new(params: CsrParams, traits: FamilyTraits) -> Result<Arc<Self>> {
        let CsrParams {
            os_context,
            submitter,
            memory_manager,
            config,
        } = params;
        config.validate()?;

        let context_id = os_context.context_id();
        let device_bitfield = os_context.device_bitfield();
        let root_device_index = os_context.root_device_index();
        let heapless = traits.heapless_supported && config.heapless.unwrap_or(traits.heapless_default);
        let partitions = if traits.static_work_partitioning {
            device_bitfield.tile_count()
        } else {
            1
        };

        let tag_allocation = memory_manager.allocate_graphics_memory_with_properties(
            &AllocationProperties::new(
                root_device_index,
                TAG_BUFFER_SIZE,
                AllocationType::TagBuffer,
                device_bitfield,
            ),
        )?;
        tag_allocation.set_evictable(false);
        let tags = match TagStore::new(tag_allocation.clone(), partitions) {
            Ok(tags) => tags,
            Err(err) => {
                memory_manager.free_graphics_memory(tag_allocation);
                return Err(err.into());
            }
        };

        let csr = Arc::new_cyclic(|weak: &Weak<CommandStreamReceiver>| {
            let engine: Weak<dyn EngineControl> = weak.clone();
            CommandStreamReceiver {
                storage: InternalAllocationStorage::new(
                    engine,
                    context_id,
                    device_bitfield,
                    memory_manager.clone(),
                ),
                state: Mutex::new(CsrState {
                    command_stream: LinearStream::default(),
                    hw: HardwareState::new(),
                    residency: Vec::new(),
                    residency_restore: Vec::new(),
                    eviction: Vec::new(),
                    resources_initialized: false,
                    surfaces: Surfaces::default(),
                    scratch: ScratchSpaceController::new(
                        traits.scratch_threads,
                        root_device_index,
                        device_bitfield,
                    ),
                    heaps: [None, None, None],
                    direct_submission: None,
                    preallocation_requests: 0,
                    preallocated: 0,
                }),
                os_context,
                submitter,
                memory_manager: memory_manager.clone(),
                traits,
                config,
                tags,
                heapless,
                task_count: AtomicU32::new(0),
                latest_flushed: AtomicU32::new(0),
                latest_sent: AtomicU32::new(0),
                last_fenced: AtomicU32::new(0),
                flush_stamp: AtomicU64::new(0),
                host_surface_lock: Mutex::new(()),
                stats: CsrStats::new(),
            }
        });
        let engine: Weak<dyn EngineControl> = Arc::downgrade(&csr) as Weak<dyn EngineControl>;
        memory_manager.register_engine(engine);

        tracing::debug!(
            context_id,
            family = ?traits.family,
            partitions,
            heapless,
            tag_address = csr.tag_address(),
            "command stream receiver created"
        );
        Ok(csr)
    }

    pub fn context_id(&self) -> ContextId {
        self.os_context.context_id()
    }

    pub fn root_device_index(&self) -> u32 {
        self.os_context.root_device_index()
    }

    pub fn device_bitfield(&self) -> DeviceBitfield {
        self.os_context.device_bitfield()
    }

    pub fn os_context(&self) -> &Arc<dyn OsContext> {
        &self.os_context
    }

    pub fn memory_manager(&self) -> &Arc<MemoryManager> {
        &self.memory_manager
    }

    pub fn internal_allocation_storage(&self) -> &InternalAllocationStorage {
        &self.storage
    }

    pub fn traits(&self) -> &FamilyTraits {
        &self.traits
    }

    pub fn config(&self) -> &CsrConfig {
        &self.config
    }

    pub fn stats(&self) -> &CsrStats {
        &self.stats
    }

    pub fn task_count(&self) -> TaskCount {
        self.task_count.load(Ordering::Acquire)
    }

    pub fn latest_sent_task_count(&self) -> TaskCount {
        self.latest_sent.load(Ordering::Acquire)
    }

    pub fn latest_flushed_task_count(&self) -> TaskCount {
        self.latest_flushed.load(Ordering::Acquire)
    }

    /// Device progress as reported by the completion tags.
    pub fn completed_task_count(&self) -> TaskCount {
        self.tags.completed_task_count()
    }

    pub fn tag_store(&self) -> &TagStore {
        &self.tags
    }

    pub fn tag_allocation(&self) -> &Arc<GraphicsAllocation> {
        self.tags.allocation()
    }

    pub fn tag_address(&self) -> u64 {
        self.tags.tag_address(0)
    }

    pub fn active_partitions(&self) -> u32 {
        self.tags.partitions()
    }

    pub fn is_heapless(&self) -> bool {
        self.heapless
    }

    pub fn is_direct_submission_enabled(&self) -> bool {
        lock(&self.state).direct_submission.is_some()
    }

    /// The allocation currently backing the receiver's own command stream.
    pub fn command_buffer(&self) -> Option<Arc<GraphicsAllocation>> {
        lock(&self.state).command_stream.allocation().cloned()
    }

    pub fn command_stream_used(&self) -> usize {
        lock(&self.state).command_stream.used()
    }

    /// Copy of the programmed hardware state.
    pub fn hardware_state(&self) -> HardwareState {
        lock(&self.state).hw.clone()
    }

    pub fn scratch_allocation(&self) -> Option<Arc<GraphicsAllocation>> {
        lock(&self.state).scratch.allocation().cloned()
    }

    pub fn global_stateless_heap(&self) -> Option<Arc<GraphicsAllocation>> {
        lock(&self.state).surfaces.global_stateless_heap.clone()
    }

    fn default_wait_timeout(&self) -> Option<Duration> {
        self.config.default_wait_timeout()
    }
}

impl EngineControl for CommandStreamReceiver {
    fn context_id(&self) -> ContextId {
        CommandStreamReceiver::context_id(self)
    }

    fn root_device_index(&self) -> u32 {
        CommandStreamReceiver::root_device_index(self)
    }

    fn task_count(&self) -> TaskCount {
        CommandStreamReceiver::task_count(self)
    }

    fn completed_task_count(&self) -> TaskCount {
        CommandStreamReceiver::completed_task_count(self)
    }

    fn latest_sent_task_count(&self) -> TaskCount {
        CommandStreamReceiver::latest_sent_task_count(self)
    }

    fn wait_for_completion(&self, task_count: TaskCount, timeout: Option<Duration>) -> bool {
        self.wait_for_task_count(task_count, timeout) == WaitStatus::Ready
    }

    fn internal_allocation_storage(&self) -> &InternalAllocationStorage {
        &self.storage
    }
}

impl Drop for CommandStreamReceiver {
    fn drop(&mut self) {
        let context_id = self.context_id();
        let latest = self.latest_flushed_task_count();
        if latest > self.completed_task_count()
            && self.wait_for_completion_with_timeout(self.default_wait_timeout(), latest)
                != WaitStatus::Ready
        {
            tracing::warn!(
                context_id,
                task_count = latest,
                "tearing down receiver with work still in flight"
            );
        }

        self.storage.free_all();

        let state = self
            .state
            .get_mut()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        state.residency.clear();
        state.residency_restore.clear();
        state.eviction.clear();

        let mut owned = state.surfaces.take_all();
        owned.extend(state.command_stream.take_buffer());
        owned.extend(state.scratch.take());
        owned.extend(state.heaps.iter_mut().filter_map(|heap| heap.take().map(|h| h.allocation)));
        if let Some(direct_submission) = state.direct_submission.take() {
            owned.extend(direct_submission.stop());
        }
        for allocation in owned {
            self.memory_manager.free_graphics_memory(allocation);
        }
        self.memory_manager
            .free_graphics_memory(self.tags.allocation().clone());
        self.memory_manager.unregister_engine(context_id);
        tracing::debug!(context_id, "command stream receiver destroyed");
    }
}

#[cfg(test)]
mod tests;
