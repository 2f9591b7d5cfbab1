use std::sync::Arc;

use gpuexec_mem::{ContextId, GraphicsAllocation, TaskCount};

use super::{lock, CommandStreamReceiver, CsrState};

impl CommandStreamReceiver {
    /// Add `allocation` to the resident set of the next submission.
    ///
    /// Making an allocation resident twice for the same submission is a no-op.
    pub fn make_resident(&self, allocation: &Arc<GraphicsAllocation>) {
        let mut state = lock(&self.state);
        let next = self.task_count().saturating_add(1);
        Self::make_resident_locked(&mut state, allocation, next, self.context_id());
    }

    /// Remove `allocation` from the resident set, queueing it for eviction when allowed.
    pub fn make_non_resident(&self, allocation: &Arc<GraphicsAllocation>) {
        let mut state = lock(&self.state);
        state.residency.retain(|a| a.id() != allocation.id());
        Self::make_non_resident_locked(&mut state, allocation, self.context_id());
    }

    pub fn residency_allocations(&self) -> Vec<Arc<GraphicsAllocation>> {
        lock(&self.state).residency.clone()
    }

    pub fn eviction_allocations(&self) -> Vec<Arc<GraphicsAllocation>> {
        lock(&self.state).eviction.clone()
    }

    /// Hand pending evictions to the device and forget them.
    pub fn process_eviction(&self) {
        let mut state = lock(&self.state);
        self.process_eviction_locked(&mut state);
    }

    pub(super) fn make_resident_locked(
        state: &mut CsrState,
        allocation: &Arc<GraphicsAllocation>,
        task_count: TaskCount,
        context_id: ContextId,
    ) {
        if !allocation.is_residency_task_count_below(task_count, context_id) {
            return;
        }
        state
            .residency_restore
            .push((allocation.clone(), allocation.task_count(context_id)));
        allocation.update_residency_task_count(task_count, context_id);
        allocation.update_task_count(task_count, context_id);
        state.residency.push(allocation.clone());
    }

    pub(super) fn make_non_resident_locked(
        state: &mut CsrState,
        allocation: &Arc<GraphicsAllocation>,
        context_id: ContextId,
    ) {
        if allocation.is_resident(context_id) {
            if allocation.is_evictable() {
                if !state.eviction.iter().any(|a| a.id() == allocation.id()) {
                    state.eviction.push(allocation.clone());
                }
            } else {
                allocation.set_evictable(true);
            }
        }
        allocation.release_residency_in_context(context_id);
    }

    pub(super) fn make_surface_pack_non_resident_locked(&self, state: &mut CsrState) {
        let context_id = self.context_id();
        let residency = std::mem::take(&mut state.residency);
        for allocation in &residency {
            Self::make_non_resident_locked(state, allocation, context_id);
        }
    }

    pub(super) fn process_eviction_locked(&self, state: &mut CsrState) {
        if state.eviction.is_empty() {
            return;
        }
        tracing::trace!(
            context_id = self.context_id(),
            count = state.eviction.len(),
            "processing evictions"
        );
        self.submitter
            .process_eviction(&state.eviction, self.os_context.as_ref());
        state.eviction.clear();
    }

    /// Driver-owned allocations every submission needs.
    pub(super) fn always_resident_locked(&self, state: &CsrState) -> Vec<Arc<GraphicsAllocation>> {
        let mut allocations = vec![self.tags.allocation().clone()];
        allocations.extend(state.command_stream.allocation().cloned());
        allocations.extend(state.scratch.allocation().cloned());
        allocations.extend(state.surfaces.iter().cloned());
        allocations.extend(
            state
                .heaps
                .iter()
                .flatten()
                .map(|heap| heap.allocation.clone()),
        );
        if let Some(direct_submission) = &state.direct_submission {
            allocations.extend(direct_submission.ring_allocations().iter().cloned());
        }
        allocations
    }
}
