use std::sync::Arc;

use gpuexec_mem::GraphicsAllocation;
use serde::Serialize;

use crate::command::Command;
use crate::error::{CsrError, Result};

/// Append-only command stream over a device allocation.
///
/// Offsets are in bytes from the start of the allocation and always dword aligned.
#[derive(Debug, Default)]
pub struct LinearStream {
    allocation: Option<Arc<GraphicsAllocation>>,
    used: usize,
    max_available: usize,
}

impl LinearStream {
    pub fn new(allocation: Arc<GraphicsAllocation>) -> Self {
        let max_available = allocation.size();
        Self {
            allocation: Some(allocation),
            used: 0,
            max_available,
        }
    }

    /// Limit the writable region to the first `max_available` bytes.
    pub fn with_max_available(mut self, max_available: usize) -> Self {
        self.max_available = max_available.min(self.capacity());
        self
    }

    pub fn allocation(&self) -> Option<&Arc<GraphicsAllocation>> {
        self.allocation.as_ref()
    }

    fn capacity(&self) -> usize {
        self.allocation.as_ref().map_or(0, |a| a.size())
    }

    pub fn used(&self) -> usize {
        self.used
    }

    pub fn max_available(&self) -> usize {
        self.max_available
    }

    pub fn available_space(&self) -> usize {
        self.max_available.saturating_sub(self.used)
    }

    /// Reserve `size` bytes and return the offset they start at.
    pub fn get_space(&mut self, size: usize) -> Result<usize> {
        if self.allocation.is_none() {
            return Err(CsrError::NoCommandBuffer);
        }
        let size = size.next_multiple_of(4);
        if size > self.available_space() {
            return Err(CsrError::StreamFull {
                requested: size,
                available: self.available_space(),
            });
        }
        let offset = self.used;
        self.used += size;
        Ok(offset)
    }

    pub fn write_dwords(&mut self, dwords: &[u32]) -> Result<usize> {
        let offset = self.get_space(dwords.len() * 4)?;
        let allocation = self.allocation.as_ref().ok_or(CsrError::NoCommandBuffer)?;
        allocation.memory().write_dwords(offset, dwords)?;
        Ok(offset)
    }

    pub fn write_command(&mut self, command: Command) -> Result<usize> {
        self.write_dwords(&command.to_dwords())
    }

    pub fn write_commands(&mut self, commands: &[Command]) -> Result<usize> {
        let mut dwords = Vec::with_capacity(commands.iter().map(Command::dword_len).sum());
        for command in commands {
            command.encode(&mut dwords);
        }
        self.write_dwords(&dwords)
    }

    /// Read back `len` bytes of commands starting at `offset`.
    pub fn read_dwords(&self, offset: usize, len: usize) -> Result<Vec<u32>> {
        let allocation = self.allocation.as_ref().ok_or(CsrError::NoCommandBuffer)?;
        Ok(allocation.memory().read_dwords(offset, len / 4)?)
    }

    /// Swap in a new backing allocation, returning the old one. The stream starts over empty.
    pub fn replace_buffer(
        &mut self,
        allocation: Arc<GraphicsAllocation>,
        max_available: usize,
    ) -> Option<Arc<GraphicsAllocation>> {
        self.max_available = max_available.min(allocation.size());
        self.used = 0;
        self.allocation.replace(allocation)
    }

    pub fn take_buffer(&mut self) -> Option<Arc<GraphicsAllocation>> {
        self.used = 0;
        self.max_available = 0;
        self.allocation.take()
    }

    /// Discard everything written after `offset`.
    pub fn rewind_to(&mut self, offset: usize) {
        self.used = self.used.min(offset);
    }

    pub fn gpu_base(&self) -> u64 {
        self.allocation.as_ref().map_or(0, |a| a.gpu_address())
    }

    pub fn gpu_address_at(&self, offset: usize) -> u64 {
        self.gpu_base() + offset as u64
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HeapKind {
    DynamicState,
    IndirectObject,
    SurfaceState,
}

impl HeapKind {
    pub const ALL: [HeapKind; 3] = [
        HeapKind::DynamicState,
        HeapKind::IndirectObject,
        HeapKind::SurfaceState,
    ];

    pub fn index(self) -> usize {
        match self {
            HeapKind::DynamicState => 0,
            HeapKind::IndirectObject => 1,
            HeapKind::SurfaceState => 2,
        }
    }
}

/// Handle to one of a receiver's indirect heaps, as returned by
/// [`crate::CommandStreamReceiver::get_indirect_heap`].
#[derive(Debug, Clone)]
pub struct IndirectHeap {
    pub kind: HeapKind,
    pub allocation: Arc<GraphicsAllocation>,
    /// Bytes usable by the caller; the surface state heap keeps its last page reserved.
    pub max_available: usize,
}

impl IndirectHeap {
    pub fn gpu_base(&self) -> u64 {
        self.allocation.gpu_address()
    }
}
