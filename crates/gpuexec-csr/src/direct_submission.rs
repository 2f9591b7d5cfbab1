//! Persistent ring submission.
//!
//! Instead of one OS-level submission per command buffer, each flush appends a short segment to
//! a ring allocation that chains into the command buffer, writes the completion tag and returns.
//! Two ring buffers are used alternately; before reusing one, the engine must have finished the
//! last segment written to it. Every segment carries its own tag write, so that wait always
//! terminates even when the command buffer itself was submitted without a fence.

use std::sync::Arc;

use gpuexec_mem::{
    AllocationProperties, AllocationType, DeviceBitfield, GraphicsAllocation, MemoryManager,
    TaskCount, PAGE_SIZE_64K,
};

use crate::command::{Command, Opcode};
use crate::error::{CsrError, Result};
use crate::linear_stream::LinearStream;

/// Bytes one dispatch appends to the ring: chain, tag write, end.
pub const RING_SEGMENT_BYTES: usize = (Opcode::BatchBufferStart.dword_len()
    + Opcode::PipeControl.dword_len()
    + Opcode::BatchBufferEnd.dword_len())
    * 4;

/// Where a dispatch was written, for submission and for undoing it on failure.
#[derive(Debug, Clone)]
pub struct RingSegment {
    pub ring: Arc<GraphicsAllocation>,
    pub start_offset: usize,
    pub used_size: usize,
    pub switched: bool,
}

#[derive(Debug)]
pub struct DirectSubmission {
    rings: [Arc<GraphicsAllocation>; 2],
    current: usize,
    stream: LinearStream,
    ring_task_counts: [TaskCount; 2],
}

impl DirectSubmission {
    pub fn initialize(
        memory_manager: &MemoryManager,
        ring_size: usize,
        root_device_index: u32,
        device_bitfield: DeviceBitfield,
    ) -> gpuexec_mem::Result<Self> {
        let properties = AllocationProperties::new(
            root_device_index,
            ring_size.max(RING_SEGMENT_BYTES),
            AllocationType::RingBuffer,
            device_bitfield,
        )
        .with_alignment(PAGE_SIZE_64K);
        let first = memory_manager.allocate_graphics_memory_with_properties(&properties)?;
        let second = match memory_manager.allocate_graphics_memory_with_properties(&properties) {
            Ok(second) => second,
            Err(err) => {
                memory_manager.free_graphics_memory(first);
                return Err(err);
            }
        };
        tracing::debug!(
            ring_size,
            first = first.gpu_address(),
            second = second.gpu_address(),
            "direct submission rings allocated"
        );
        Ok(Self {
            stream: LinearStream::new(first.clone()),
            rings: [first, second],
            current: 0,
            ring_task_counts: [0; 2],
        })
    }

    pub fn ring_allocations(&self) -> &[Arc<GraphicsAllocation>; 2] {
        &self.rings
    }

    pub fn current_ring(&self) -> usize {
        self.current
    }

    /// Append a segment chaining into `target_gpu_address` and then executing `tag_write`.
    ///
    /// When the current ring is full, switches to the other one after `wait_for` confirms the
    /// engine finished the last task count dispatched through it.
    pub fn dispatch(
        &mut self,
        target_gpu_address: u64,
        tag_write: Command,
        mut wait_for: impl FnMut(TaskCount) -> bool,
    ) -> Result<RingSegment> {
        let mut switched = false;
        if self.stream.available_space() < RING_SEGMENT_BYTES {
            let next = 1 - self.current;
            let last_use = self.ring_task_counts[next];
            if last_use != 0 && !wait_for(last_use) {
                tracing::warn!(ring = next, task_count = last_use, "ring buffer still in use");
                return Err(CsrError::RingStall);
            }
            let ring = self.rings[next].clone();
            let size = ring.size();
            self.stream.replace_buffer(ring, size);
            self.current = next;
            switched = true;
        }

        let start_offset = self.stream.write_commands(&[
            Command::BatchBufferStart {
                address: target_gpu_address,
                second_level: true,
            },
            tag_write,
            Command::BatchBufferEnd,
        ])?;
        Ok(RingSegment {
            ring: self.rings[self.current].clone(),
            start_offset,
            used_size: RING_SEGMENT_BYTES,
            switched,
        })
    }

    /// Record that `segment` was submitted as `task_count`.
    pub fn commit(&mut self, segment: &RingSegment, task_count: TaskCount) {
        if segment.ring.id() == self.rings[self.current].id() {
            self.ring_task_counts[self.current] = task_count;
        }
    }

    /// Forget a segment whose submission failed.
    pub fn rollback(&mut self, segment: &RingSegment) {
        if segment.ring.id() == self.rings[self.current].id() {
            self.stream.rewind_to(segment.start_offset);
        }
    }

    /// Tear down, handing the rings back to be freed.
    pub fn stop(self) -> [Arc<GraphicsAllocation>; 2] {
        tracing::debug!("direct submission stopped");
        self.rings
    }
}
