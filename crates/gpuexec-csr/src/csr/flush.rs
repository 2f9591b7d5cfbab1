use std::sync::atomic::Ordering;
use std::sync::Arc;

use gpuexec_mem::{
    AllocationProperties, AllocationType, AllocationUsage, GraphicsAllocation, TaskCount,
    CACHE_LINE_SIZE, PAGE_SIZE_64K,
};

use super::{lock, CommandStreamReceiver, CsrState};
use crate::command::{
    BaseAddresses, Command, CompareOp, ComputeModeConfig, FrontEndConfig, PipeControlFlags,
    PipelineSelectMode, PostSync, PreemptionMode, ThreadArbitrationPolicy,
};
use crate::completion::{CompletionStamp, WaitStatus};
use crate::error::{CsrError, Result};
use crate::hw_state::{RequiredState, StatePlan};
use crate::linear_stream::{HeapKind, LinearStream};
use crate::submission::{BatchBuffer, SubmissionStatus};
use crate::tag_store::TAG_PARTITION_STRIDE;

/// Bytes kept free at the end of every command buffer for prefetch overrun.
pub(crate) const COMMAND_BUFFER_RESERVED_BYTES: usize = CACHE_LINE_SIZE;
pub(crate) const RAY_TRACING_BUFFER_SIZE: usize = PAGE_SIZE_64K;

/// A value another context must reach before this submission may proceed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dependency {
    pub address: u64,
    pub value: TaskCount,
}

/// Per-flush requirements.
#[derive(Debug, Clone)]
pub struct DispatchFlags {
    /// Write the completion tag when this submission finishes.
    pub guard_completion: bool,
    /// Wait for completion before returning. Implies a fence.
    pub blocking: bool,
    pub dc_flush: bool,
    pub pipeline_select: PipelineSelectMode,
    pub systolic: bool,
    pub thread_arbitration: ThreadArbitrationPolicy,
    pub large_grf: bool,
    pub coherency_required: bool,
    pub disable_eu_fusion: bool,
    pub preemption: PreemptionMode,
    pub uses_ray_tracing: bool,
    /// Scratch bytes each hardware thread needs; 0 for none.
    pub scratch_per_thread: u32,
    pub dependencies: Vec<Dependency>,
    pub low_priority: bool,
    pub task_level: u32,
}

impl Default for DispatchFlags {
    fn default() -> Self {
        Self {
            guard_completion: true,
            blocking: false,
            dc_flush: false,
            pipeline_select: PipelineSelectMode::default(),
            systolic: false,
            thread_arbitration: ThreadArbitrationPolicy::default(),
            large_grf: false,
            coherency_required: false,
            disable_eu_fusion: false,
            preemption: PreemptionMode::default(),
            uses_ray_tracing: false,
            scratch_per_thread: 0,
            dependencies: Vec::new(),
            low_priority: false,
            task_level: 0,
        }
    }
}

/// Work carried by a flush.
#[derive(Debug)]
pub enum FlushPayload<'a> {
    /// Commands copied into the receiver's own command buffer.
    Immediate(&'a [Command]),
    /// A caller-built stream the receiver chains into. The completion fence and the batch end
    /// are appended to `stream`, which must therefore have room for them.
    Stream {
        stream: &'a mut LinearStream,
        start_offset: usize,
    },
}

impl CommandStreamReceiver {
    /// Submit `payload` with everything it needs resident and programmed.
    ///
    /// Returns the assigned task count, or a sentinel stamp when nothing was submitted. A
    /// blocking flush that observes a hang reports [`CompletionStamp::GPU_HANG`] even though
    /// the task count was consumed.
    pub fn flush(
        &self,
        payload: FlushPayload<'_>,
        residency: &[Arc<GraphicsAllocation>],
        flags: &DispatchFlags,
    ) -> CompletionStamp {
        let stamp = {
            let mut state = lock(&self.state);
            match self.flush_locked(&mut state, payload, residency, flags, true) {
                Ok(stamp) => stamp,
                Err(status) => CompletionStamp::failed(status),
            }
        };

        if flags.blocking && stamp.is_success() {
            match self.wait_for_task_count(stamp.task_count, self.default_wait_timeout()) {
                WaitStatus::Ready => {
                    self.storage
                        .clean_allocation_list(stamp.task_count, AllocationUsage::Temporary);
                    self.storage
                        .clean_allocation_list(stamp.task_count, AllocationUsage::Deferred);
                }
                WaitStatus::GpuHang => {
                    return CompletionStamp {
                        task_count: CompletionStamp::GPU_HANG,
                        ..stamp
                    }
                }
                WaitStatus::NotReady => tracing::warn!(
                    context_id = self.context_id(),
                    task_count = stamp.task_count,
                    "blocking flush timed out"
                ),
            }
        }
        stamp
    }

    /// Submit an empty batch whose only job is to advance the completion tag.
    pub fn flush_tag_update(&self) -> CompletionStamp {
        self.stats.inc_tag_updates();
        let mut state = lock(&self.state);
        let flags = DispatchFlags::default();
        match self.flush_locked(&mut state, FlushPayload::Immediate(&[]), &[], &flags, false) {
            Ok(stamp) => stamp,
            Err(status) => CompletionStamp::failed(status),
        }
    }

    /// Dependencies that hold a submission until this receiver completes `task_count`.
    pub fn completion_dependencies(&self, task_count: TaskCount) -> Vec<Dependency> {
        (0..self.active_partitions())
            .map(|partition| Dependency {
                address: self.tags.tag_address(partition),
                value: task_count,
            })
            .collect()
    }

    fn flush_error(&self, err: &CsrError) -> SubmissionStatus {
        let status = err.submission_status();
        tracing::warn!(context_id = self.context_id(), %err, ?status, "flush aborted");
        self.stats.inc_failed_submissions();
        status
    }

    pub(super) fn flush_locked(
        &self,
        state: &mut CsrState,
        payload: FlushPayload<'_>,
        residency: &[Arc<GraphicsAllocation>],
        flags: &DispatchFlags,
        program_state: bool,
    ) -> std::result::Result<CompletionStamp, SubmissionStatus> {
        self.stats.inc_flushes();
        let context_id = self.context_id();

        self.initialize_resources_locked(state)
            .map_err(|err| self.flush_error(&err))?;
        let plan = if program_state {
            self.prepare_state_locked(state, flags)
                .map_err(|err| self.flush_error(&err))?
        } else {
            StatePlan::default()
        };

        let previous_task_count = self.task_count();
        let task_count = previous_task_count
            .checked_add(1)
            .filter(|tc| !CompletionStamp::is_sentinel(*tc))
            .ok_or_else(|| {
                tracing::error!(context_id, previous_task_count, "task count exhausted");
                SubmissionStatus::Failed
            })?;
        let fenced = flags.guard_completion || flags.blocking;

        let mut tail = Vec::with_capacity(2);
        if fenced {
            tail.push(self.completion_fence(task_count, flags.dc_flush));
        }
        tail.push(Command::BatchBufferEnd);

        let mut commands = plan.commands.clone();
        commands.extend(flags.dependencies.iter().map(|dependency| Command::SemaphoreWait {
            address: dependency.address,
            value: dependency.value,
            compare: CompareOp::GreaterOrEqual,
        }));

        let mut caller: Option<(&mut LinearStream, usize)> = None;
        match payload {
            FlushPayload::Immediate(payload) => {
                commands.extend_from_slice(payload);
                commands.extend_from_slice(&tail);
            }
            FlushPayload::Stream {
                stream,
                start_offset,
            } => {
                commands.push(Command::BatchBufferStart {
                    address: stream.gpu_address_at(start_offset),
                    second_level: false,
                });
                caller = Some((stream, start_offset));
            }
        }

        let used_size: usize = commands.iter().map(Command::byte_len).sum();
        self.ensure_command_buffer_allocation_locked(
            state,
            used_size,
            COMMAND_BUFFER_RESERVED_BYTES,
        )
        .map_err(|err| self.flush_error(&err))?;

        let caller_end = match caller.as_mut() {
            Some((stream, _)) => {
                let end = stream.used();
                stream
                    .write_commands(&tail)
                    .map_err(|err| self.flush_error(&err))?;
                Some(end)
            }
            None => None,
        };
        let start_offset = match state.command_stream.write_commands(&commands) {
            Ok(offset) => offset,
            Err(err) => {
                if let (Some((stream, _)), Some(end)) = (caller.as_mut(), caller_end) {
                    stream.rewind_to(end);
                }
                return Err(self.flush_error(&err));
            }
        };
        let command_buffer = match state.command_stream.allocation() {
            Some(allocation) => allocation.clone(),
            None => return Err(self.flush_error(&CsrError::NoCommandBuffer)),
        };

        let mut resident = self.always_resident_locked(state);
        if let Some(allocation) = caller.as_ref().and_then(|(stream, _)| stream.allocation()) {
            resident.push(allocation.clone());
        }
        for allocation in residency.iter().chain(resident.iter()) {
            Self::make_resident_locked(state, allocation, task_count, context_id);
        }

        let previous_latest_sent = self.latest_sent.swap(task_count, Ordering::AcqRel);
        let batch = BatchBuffer {
            command_buffer,
            start_offset,
            used_size,
            task_count,
            has_fence: fenced,
            low_priority: flags.low_priority || self.os_context.is_low_priority(),
            direct_submission: false,
        };
        // Ring segments write the tag themselves.
        let fenced = fenced || state.direct_submission.is_some();
        let status = self.submit_locked(state, batch);

        let result = if status.is_success() {
            self.task_count.store(task_count, Ordering::Release);
            self.latest_flushed.store(task_count, Ordering::Release);
            if fenced {
                self.last_fenced.store(task_count, Ordering::Release);
            }
            state.hw.commit(&plan);
            for item in plan.items() {
                self.stats.inc_state_emit(item);
            }
            state.residency_restore.clear();
            let flush_stamp = self.flush_stamp.fetch_add(1, Ordering::AcqRel) + 1;
            tracing::trace!(context_id, task_count, used_size, fenced, "flushed");
            Ok(CompletionStamp::submitted(task_count, flags.task_level, flush_stamp))
        } else {
            state.command_stream.rewind_to(start_offset);
            if let (Some((stream, _)), Some(end)) = (caller.as_mut(), caller_end) {
                stream.rewind_to(end);
            }
            for (allocation, previous) in state.residency_restore.drain(..) {
                allocation.update_task_count(previous, context_id);
            }
            self.latest_sent
                .store(previous_latest_sent, Ordering::Release);
            self.stats.inc_failed_submissions();
            tracing::warn!(context_id, task_count, ?status, "submission rejected");
            Err(status)
        };

        self.make_surface_pack_non_resident_locked(state);
        self.process_eviction_locked(state);
        result
    }

    fn completion_fence(&self, task_count: TaskCount, dc_flush: bool) -> Command {
        let partitions = self.active_partitions();
        let mut flags = PipeControlFlags::CS_STALL | PipeControlFlags::POST_SYNC_WRITE;
        if dc_flush {
            flags |= PipeControlFlags::DC_FLUSH;
        }
        if partitions > 1 {
            flags |= PipeControlFlags::WORKLOAD_PARTITION;
        }
        Command::PipeControl {
            flags,
            post_sync: Some(PostSync {
                address: self.tag_address(),
                value: u64::from(task_count),
                partition_count: partitions,
                partition_stride: TAG_PARTITION_STRIDE as u32,
            }),
        }
    }

    fn submit_locked(&self, state: &mut CsrState, batch: BatchBuffer) -> SubmissionStatus {
        let Some(direct_submission) = state.direct_submission.as_mut() else {
            return self
                .submitter
                .submit(&batch, &state.residency, self.os_context.as_ref());
        };

        let timeout = self.default_wait_timeout();
        let tag_write = self.completion_fence(batch.task_count, false);
        let segment = match direct_submission.dispatch(batch.start_gpu_address(), tag_write, |task_count| {
            self.wait_for_completion_with_timeout(timeout, task_count) == WaitStatus::Ready
        }) {
            Ok(segment) => segment,
            Err(err) => {
                tracing::warn!(context_id = self.context_id(), %err, "direct submission dispatch failed");
                return err.submission_status();
            }
        };
        if segment.switched {
            self.stats.inc_direct_submission_ring_switches();
        }

        let ring_batch = BatchBuffer {
            command_buffer: segment.ring.clone(),
            start_offset: segment.start_offset,
            used_size: segment.used_size,
            has_fence: true,
            direct_submission: true,
            ..batch
        };
        let status = self
            .submitter
            .submit(&ring_batch, &state.residency, self.os_context.as_ref());
        if status.is_success() {
            direct_submission.commit(&segment, ring_batch.task_count);
            self.stats.inc_direct_submission_dispatches();
        } else {
            direct_submission.rollback(&segment);
        }
        status
    }

    fn prepare_state_locked(&self, state: &mut CsrState, flags: &DispatchFlags) -> Result<StatePlan> {
        let update = state
            .scratch
            .ensure(&self.memory_manager, flags.scratch_per_thread)?;
        if let Some(retired) = update.retired {
            self.storage.store_allocation(retired, AllocationUsage::Temporary);
        }
        if update.changed {
            state.hw.front_end.mark_dirty();
            state.hw.state_base_address.mark_dirty();
        }

        if flags.uses_ray_tracing
            && self.traits.ray_tracing_supported
            && state.surfaces.ray_tracing.is_none()
        {
            let allocation = self.memory_manager.allocate_graphics_memory_with_properties(
                &AllocationProperties::new(
                    self.root_device_index(),
                    RAY_TRACING_BUFFER_SIZE,
                    AllocationType::RayTracingBuffer,
                    self.device_bitfield(),
                ),
            )?;
            state.surfaces.ray_tracing = Some(allocation);
        }

        let heap_base = |kind: HeapKind| {
            state.heaps[kind.index()]
                .as_ref()
                .map_or(0, |heap| heap.gpu_base())
        };
        let (state_base_address, binding_table_pool) = if self.heapless {
            (None, None)
        } else {
            let bases = BaseAddresses {
                general_state: state.scratch.gpu_address(),
                surface_state: heap_base(HeapKind::SurfaceState),
                dynamic_state: heap_base(HeapKind::DynamicState),
                indirect_object: heap_base(HeapKind::IndirectObject),
                instruction: 0,
            };
            let pool = state.heaps[HeapKind::SurfaceState.index()]
                .as_ref()
                .map(|heap| (heap.gpu_base(), heap.allocation.size() as u32));
            (Some(bases), pool)
        };

        let required = RequiredState {
            pipeline_select: (flags.pipeline_select, flags.systolic),
            compute_mode: ComputeModeConfig {
                thread_arbitration: flags.thread_arbitration,
                large_grf: flags.large_grf,
                coherency_required: flags.coherency_required,
            },
            front_end: FrontEndConfig {
                scratch_address: state.scratch.gpu_address(),
                per_thread_scratch_size: state.scratch.per_thread_size(),
                disable_eu_fusion: flags.disable_eu_fusion,
                compute_dispatch_all_walker: self.active_partitions() > 1,
                single_slice_dispatch: false,
            },
            state_base_address,
            binding_table_pool,
            preemption: flags.preemption,
            sip_address: if self.traits.sip_required {
                state.surfaces.preemption.as_ref().map(|a| a.gpu_address())
            } else {
                None
            },
            system_mem_fence: state.surfaces.global_fence.as_ref().map(|a| a.gpu_address()),
            ray_tracing: state
                .surfaces
                .ray_tracing
                .as_ref()
                .map(|a| (a.gpu_address(), a.size() as u32)),
            work_partition: state
                .surfaces
                .work_partition
                .as_ref()
                .map(|a| a.gpu_address()),
        };
        Ok(state.hw.plan(&required))
    }
}
