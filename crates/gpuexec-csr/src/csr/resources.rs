use std::sync::Arc;

use gpuexec_mem::{
    align_up_usize, AllocationProperties, AllocationType, AllocationUsage, GraphicsAllocation,
    PAGE_SIZE, PAGE_SIZE_2M, PAGE_SIZE_64K,
};

use super::{lock, CommandStreamReceiver, CsrState};
use crate::completion::CompletionStamp;
use crate::direct_submission::DirectSubmission;
use crate::error::{CsrError, Result};
use crate::linear_stream::{HeapKind, IndirectHeap};

pub(crate) const DEFAULT_HEAP_SIZE: usize = PAGE_SIZE_64K;
pub(crate) const GLOBAL_STATELESS_HEAP_SIZE: usize = PAGE_SIZE_64K;

/// A caller-owned host range a submission reads or writes.
#[derive(Debug, Clone)]
pub struct HostPtrSurface {
    pub ptr: u64,
    pub size: usize,
    /// Fall back to a device copy of `host_data` when the range cannot be mapped.
    pub copy_allowed: bool,
    pub host_data: Option<Vec<u8>>,
    allocation: Option<Arc<GraphicsAllocation>>,
}

impl HostPtrSurface {
    pub fn new(ptr: u64, size: usize) -> Self {
        Self {
            ptr,
            size,
            copy_allowed: false,
            host_data: None,
            allocation: None,
        }
    }

    pub fn with_copy(mut self, host_data: Vec<u8>) -> Self {
        self.copy_allowed = true;
        self.host_data = Some(host_data);
        self
    }

    /// The allocation backing this surface once created.
    pub fn allocation(&self) -> Option<&Arc<GraphicsAllocation>> {
        self.allocation.as_ref()
    }
}

impl CommandStreamReceiver {
    fn allocate(&self, size: usize, allocation_type: AllocationType) -> Result<Arc<GraphicsAllocation>> {
        Ok(self.memory_manager.allocate_graphics_memory_with_properties(
            &AllocationProperties::new(
                self.root_device_index(),
                size,
                allocation_type,
                self.device_bitfield(),
            ),
        )?)
    }

    /// Create the context and the driver-owned surfaces the family needs. Surfaces created by
    /// an earlier, failed attempt are kept.
    pub(super) fn initialize_resources_locked(&self, state: &mut CsrState) -> Result<()> {
        if state.resources_initialized {
            return Ok(());
        }
        if !self.os_context.is_initialized() {
            self.os_context.initialize_context()?;
        }

        if self.traits.system_memory_fence_required && state.surfaces.global_fence.is_none() {
            state.surfaces.global_fence = Some(self.allocate(PAGE_SIZE, AllocationType::GlobalFence)?);
        }
        if self.traits.preemption_surface_size > 0 && state.surfaces.preemption.is_none() {
            state.surfaces.preemption = Some(self.allocate(
                self.traits.preemption_surface_size,
                AllocationType::PreemptionSurface,
            )?);
        }
        if self.traits.debug_surface_size > 0 && state.surfaces.debug.is_none() {
            state.surfaces.debug =
                Some(self.allocate(self.traits.debug_surface_size, AllocationType::DebugSurface)?);
        }
        let partitions = self.active_partitions();
        if partitions > 1 && state.surfaces.work_partition.is_none() {
            let allocation = self.allocate(PAGE_SIZE, AllocationType::WorkPartitionSurface)?;
            let ids: Vec<u32> = (0..partitions).collect();
            if let Err(err) = allocation.memory().write_dwords(0, &ids) {
                self.memory_manager.free_graphics_memory(allocation);
                return Err(err.into());
            }
            state.surfaces.work_partition = Some(allocation);
        }
        if self.heapless && state.surfaces.global_stateless_heap.is_none() {
            state.surfaces.global_stateless_heap = Some(self.allocate(
                GLOBAL_STATELESS_HEAP_SIZE,
                AllocationType::GlobalStatelessHeap,
            )?);
        }
        if state.direct_submission.is_none()
            && self
                .config
                .direct_submission
                .unwrap_or(self.traits.direct_submission_default)
        {
            self.init_direct_submission_locked(state);
        }

        state.resources_initialized = true;
        tracing::debug!(
            context_id = self.context_id(),
            direct_submission = state.direct_submission.is_some(),
            "receiver resources initialized"
        );
        Ok(())
    }

    /// Start ring submission, falling back to discrete submissions when the engine or memory
    /// does not allow it.
    fn init_direct_submission_locked(&self, state: &mut CsrState) -> bool {
        let context_id = self.context_id();
        if !self.os_context.is_direct_submission_supported() {
            tracing::info!(context_id, "direct submission unsupported, using discrete submissions");
            return false;
        }
        match DirectSubmission::initialize(
            &self.memory_manager,
            self.config.direct_submission_ring_size,
            self.root_device_index(),
            self.device_bitfield(),
        ) {
            Ok(direct_submission) => {
                state.direct_submission = Some(direct_submission);
                true
            }
            Err(err) => {
                tracing::warn!(context_id, %err, "direct submission unavailable, using discrete submissions");
                false
            }
        }
    }

    /// Return to discrete submissions. The rings are released once the device is done with them.
    pub fn stop_direct_submission(&self) {
        let Some(direct_submission) = lock(&self.state).direct_submission.take() else {
            return;
        };
        for ring in direct_submission.stop() {
            self.storage.store_allocation(ring, AllocationUsage::Temporary);
        }
    }

    /// Make sure the command stream has `min_size` free bytes plus `additional` reserved ones.
    pub fn ensure_command_buffer_allocation(&self, min_size: usize, additional: usize) -> Result<()> {
        let mut state = lock(&self.state);
        self.ensure_command_buffer_allocation_locked(&mut state, min_size, additional)
    }

    pub(super) fn ensure_command_buffer_allocation_locked(
        &self,
        state: &mut CsrState,
        min_size: usize,
        additional: usize,
    ) -> Result<()> {
        if state.command_stream.allocation().is_some()
            && state.command_stream.available_space() >= min_size
        {
            return Ok(());
        }

        let requested = min_size.saturating_add(additional).max(self.config.command_buffer_size);
        let alignment = if requested >= self.config.huge_page_threshold {
            PAGE_SIZE_2M
        } else {
            PAGE_SIZE_64K
        };
        let mut size = align_up_usize(requested, alignment);
        if let Some(forced) = self.config.forced_command_buffer_alignment() {
            size = align_up_usize(size, forced);
        }

        let allocation = match self
            .storage
            .obtain_reusable_allocation(size, AllocationType::CommandBuffer)
        {
            Some(allocation) => {
                self.stats.inc_command_buffer_reuses();
                allocation
            }
            None => {
                let allocation = self.memory_manager.allocate_graphics_memory_with_properties(
                    &AllocationProperties::new(
                        self.root_device_index(),
                        size,
                        AllocationType::CommandBuffer,
                        self.device_bitfield(),
                    )
                    .with_alignment(alignment),
                )?;
                self.stats.inc_command_buffer_allocations();
                allocation
            }
        };
        let max_available = allocation.size().saturating_sub(additional);
        tracing::trace!(
            context_id = self.context_id(),
            size = allocation.size(),
            gpu_address = allocation.gpu_address(),
            "switched command buffer"
        );
        if let Some(previous) = state.command_stream.replace_buffer(allocation, max_available) {
            self.storage.store_allocation(previous, AllocationUsage::Reusable);
        }
        Ok(())
    }

    /// Stock the reuse list with command buffers. Only the first outstanding request allocates.
    pub fn request_preallocation(&self) {
        let mut state = lock(&self.state);
        state.preallocation_requests += 1;
        if state.preallocation_requests != 1 {
            return;
        }
        let target = self
            .config
            .preallocated_command_buffers
            .unwrap_or(self.traits.preallocated_command_buffers);
        let completed = self.completed_task_count();
        let size = align_up_usize(self.config.command_buffer_size, PAGE_SIZE_64K);
        let mut created = 0u64;
        while state.preallocated < target {
            match self.allocate(size, AllocationType::CommandBuffer) {
                Ok(allocation) => {
                    self.storage.store_allocation_with_task_count(
                        allocation,
                        AllocationUsage::Reusable,
                        completed,
                    );
                    state.preallocated += 1;
                    created += 1;
                }
                Err(err) => {
                    tracing::warn!(context_id = self.context_id(), %err, "command buffer preallocation stopped");
                    break;
                }
            }
        }
        self.stats.add_preallocated_command_buffers(created);
    }

    pub fn release_preallocation_request(&self) {
        let mut state = lock(&self.state);
        if state.preallocation_requests == 0 {
            tracing::warn!(
                context_id = self.context_id(),
                "preallocation released without a matching request"
            );
            return;
        }
        state.preallocation_requests -= 1;
    }

    pub fn preallocation_requests(&self) -> u32 {
        lock(&self.state).preallocation_requests
    }

    /// The `kind` heap, replaced by a larger one when it cannot hold `min_size` bytes.
    pub fn get_indirect_heap(&self, kind: HeapKind, min_size: usize) -> Result<IndirectHeap> {
        if self.heapless {
            return Err(CsrError::HeaplessHeap(kind));
        }
        let mut state = lock(&self.state);
        let slot = &mut state.heaps[kind.index()];
        if let Some(heap) = slot.as_ref().filter(|heap| heap.max_available >= min_size) {
            return Ok(heap.clone());
        }
        if let Some(retired) = slot.take() {
            self.storage
                .store_allocation(retired.allocation, AllocationUsage::Reusable);
        }

        let reserved = if kind == HeapKind::SurfaceState { PAGE_SIZE } else { 0 };
        let size = align_up_usize(
            min_size.saturating_add(reserved).max(DEFAULT_HEAP_SIZE),
            PAGE_SIZE,
        );
        let allocation_type = match kind {
            HeapKind::IndirectObject => AllocationType::InternalHeap,
            HeapKind::DynamicState | HeapKind::SurfaceState => AllocationType::LinearStream,
        };
        let allocation = match self.storage.obtain_reusable_allocation(size, allocation_type) {
            Some(allocation) => allocation,
            None => self.allocate(size, allocation_type)?,
        };
        let heap = IndirectHeap {
            kind,
            max_available: allocation.size().saturating_sub(reserved),
            allocation,
        };
        *slot = Some(heap.clone());
        Ok(heap)
    }

    pub fn release_indirect_heap(&self, kind: HeapKind) {
        let retired = lock(&self.state).heaps[kind.index()].take();
        if let Some(heap) = retired {
            self.storage
                .store_allocation(heap.allocation, AllocationUsage::Reusable);
        }
    }

    /// Make `surface`'s host range device visible for the next submission.
    ///
    /// Runs without the submission lock: mapping a host range may wait for other engines to
    /// retire overlapping allocations, and those waits submit tag updates.
    pub fn create_allocation_for_host_surface(&self, surface: &mut HostPtrSurface) -> Result<()> {
        let _guard = lock(&self.host_surface_lock);
        let context_id = self.context_id();
        let allocation = match self.storage.obtain_temporary_allocation_with_ptr(
            surface.size,
            surface.ptr,
            AllocationType::ExternalHostPtr,
        ) {
            Some(allocation) => allocation,
            None => self.allocate_for_host_range(surface)?,
        };
        allocation.update_task_count(CompletionStamp::NOT_READY, context_id);
        surface.allocation = Some(allocation.clone());
        self.storage
            .store_allocation(allocation, AllocationUsage::Temporary);
        Ok(())
    }

    fn allocate_for_host_range(&self, surface: &HostPtrSurface) -> Result<Arc<GraphicsAllocation>> {
        let properties = AllocationProperties::new(
            self.root_device_index(),
            surface.size,
            AllocationType::ExternalHostPtr,
            self.device_bitfield(),
        );
        let err = match self
            .memory_manager
            .allocate_graphics_memory_with_host_ptr(&properties, surface.ptr)
        {
            Ok(allocation) => return Ok(allocation),
            Err(err) => err,
        };
        match surface.host_data.as_deref() {
            Some(data) if surface.copy_allowed => {
                tracing::debug!(
                    context_id = self.context_id(),
                    ptr = surface.ptr,
                    %err,
                    "host range not mappable, copying"
                );
                Ok(self
                    .memory_manager
                    .allocate_internal_graphics_memory_with_host_copy(
                        self.root_device_index(),
                        self.device_bitfield(),
                        data,
                    )?)
            }
            _ => Err(err.into()),
        }
    }
}
