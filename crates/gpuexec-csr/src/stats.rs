use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

use crate::hw_state::StateItem;

/// Counters of one command stream receiver.
///
/// Updated with relaxed atomics from the submitting thread; safe to snapshot from any thread.
#[derive(Debug, Default)]
pub struct CsrStats {
    flushes: AtomicU64,
    failed_submissions: AtomicU64,
    tag_updates: AtomicU64,

    pipeline_select_emits: AtomicU64,
    compute_mode_emits: AtomicU64,
    front_end_emits: AtomicU64,
    state_base_address_emits: AtomicU64,
    binding_table_pool_emits: AtomicU64,
    preemption_emits: AtomicU64,
    one_shot_emits: AtomicU64,

    command_buffer_allocations: AtomicU64,
    command_buffer_reuses: AtomicU64,
    preallocated_command_buffers: AtomicU64,

    waits: AtomicU64,
    wait_timeouts: AtomicU64,
    gpu_hangs: AtomicU64,

    direct_submission_dispatches: AtomicU64,
    direct_submission_ring_switches: AtomicU64,
}

impl CsrStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc_flushes(&self) {
        self.flushes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_failed_submissions(&self) {
        self.failed_submissions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_tag_updates(&self) {
        self.tag_updates.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_state_emit(&self, item: StateItem) {
        let counter = match item {
            StateItem::PipelineSelect => &self.pipeline_select_emits,
            StateItem::ComputeMode => &self.compute_mode_emits,
            StateItem::FrontEnd => &self.front_end_emits,
            StateItem::StateBaseAddress => &self.state_base_address_emits,
            StateItem::BindingTablePool => &self.binding_table_pool_emits,
            StateItem::Preemption => &self.preemption_emits,
            StateItem::Sip
            | StateItem::SystemMemFence
            | StateItem::RayTracing
            | StateItem::WorkPartition => &self.one_shot_emits,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_command_buffer_allocations(&self) {
        self.command_buffer_allocations
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_command_buffer_reuses(&self) {
        self.command_buffer_reuses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_preallocated_command_buffers(&self, count: u64) {
        self.preallocated_command_buffers
            .fetch_add(count, Ordering::Relaxed);
    }

    pub fn inc_waits(&self) {
        self.waits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_wait_timeouts(&self) {
        self.wait_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_gpu_hangs(&self) {
        self.gpu_hangs.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_direct_submission_dispatches(&self) {
        self.direct_submission_dispatches
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_direct_submission_ring_switches(&self) {
        self.direct_submission_ring_switches
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CsrStatsSnapshot {
        CsrStatsSnapshot {
            flushes: self.flushes.load(Ordering::Relaxed),
            failed_submissions: self.failed_submissions.load(Ordering::Relaxed),
            tag_updates: self.tag_updates.load(Ordering::Relaxed),

            pipeline_select_emits: self.pipeline_select_emits.load(Ordering::Relaxed),
            compute_mode_emits: self.compute_mode_emits.load(Ordering::Relaxed),
            front_end_emits: self.front_end_emits.load(Ordering::Relaxed),
            state_base_address_emits: self.state_base_address_emits.load(Ordering::Relaxed),
            binding_table_pool_emits: self.binding_table_pool_emits.load(Ordering::Relaxed),
            preemption_emits: self.preemption_emits.load(Ordering::Relaxed),
            one_shot_emits: self.one_shot_emits.load(Ordering::Relaxed),

            command_buffer_allocations: self.command_buffer_allocations.load(Ordering::Relaxed),
            command_buffer_reuses: self.command_buffer_reuses.load(Ordering::Relaxed),
            preallocated_command_buffers: self
                .preallocated_command_buffers
                .load(Ordering::Relaxed),

            waits: self.waits.load(Ordering::Relaxed),
            wait_timeouts: self.wait_timeouts.load(Ordering::Relaxed),
            gpu_hangs: self.gpu_hangs.load(Ordering::Relaxed),

            direct_submission_dispatches: self
                .direct_submission_dispatches
                .load(Ordering::Relaxed),
            direct_submission_ring_switches: self
                .direct_submission_ring_switches
                .load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CsrStatsSnapshot {
    pub flushes: u64,
    pub failed_submissions: u64,
    pub tag_updates: u64,

    pub pipeline_select_emits: u64,
    pub compute_mode_emits: u64,
    pub front_end_emits: u64,
    pub state_base_address_emits: u64,
    pub binding_table_pool_emits: u64,
    pub preemption_emits: u64,
    pub one_shot_emits: u64,

    pub command_buffer_allocations: u64,
    pub command_buffer_reuses: u64,
    pub preallocated_command_buffers: u64,

    pub waits: u64,
    pub wait_timeouts: u64,
    pub gpu_hangs: u64,

    pub direct_submission_dispatches: u64,
    pub direct_submission_ring_switches: u64,
}
