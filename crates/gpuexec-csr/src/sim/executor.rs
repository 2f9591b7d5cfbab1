//! Interpreter for submitted command streams.
//!
//! Execution is resumable: a batch blocked on a semaphore keeps its cursor and continues from
//! the same command on the next pass.

use std::collections::BTreeSet;
use std::sync::Arc;

use gpuexec_mem::{AllocationId, GraphicsAllocation, MemoryError};
use thiserror::Error;

use crate::command::{Command, CompareOp, DecodeError, LENGTH_MASK};

/// Nested second-level batch depth the command streamer supports.
pub const MAX_BATCH_NESTING: usize = 8;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Fault {
    #[error("gpu address 0x{address:x} (+{len}) is not backed by a resident allocation")]
    PageFault { address: u64, len: u64 },
    #[error("malformed command at 0x{address:x}: {source}")]
    Decode { address: u64, source: DecodeError },
    #[error(transparent)]
    Memory(#[from] MemoryError),
    #[error("batch buffer nesting deeper than {MAX_BATCH_NESTING}")]
    NestingTooDeep,
    #[error("batch ran more than {0} commands")]
    Runaway(usize),
}

#[derive(Debug)]
pub(crate) enum Step {
    Finished,
    Blocked,
    Fault(Fault),
}

fn matches(compare: CompareOp, current: u32, value: u32) -> bool {
    match compare {
        CompareOp::GreaterOrEqual => current >= value,
        CompareOp::Equal => current == value,
        CompareOp::NotEqual => current != value,
    }
}

fn resolve<'a>(
    residency: &'a [Arc<GraphicsAllocation>],
    address: u64,
    len: u64,
) -> Result<(&'a Arc<GraphicsAllocation>, usize), Fault> {
    residency
        .iter()
        .find(|allocation| allocation.contains_gpu_range(address, len))
        .map(|allocation| (allocation, (address - allocation.gpu_address()) as usize))
        .ok_or(Fault::PageFault { address, len })
}

#[derive(Debug)]
struct PendingWrite {
    partition: u32,
    allocation: Arc<GraphicsAllocation>,
    offset: usize,
    value: u64,
}

/// Post-sync writes of stalled partitions are held back, keeping only the latest value per
/// location, until the partition is released.
#[derive(Debug, Default)]
pub(crate) struct PostSyncGate {
    stalled: BTreeSet<u32>,
    pending: Vec<PendingWrite>,
}

impl PostSyncGate {
    pub(crate) fn stall(&mut self, partition: u32) {
        self.stalled.insert(partition);
    }

    pub(crate) fn release(&mut self, partition: u32) -> Result<(), MemoryError> {
        self.stalled.remove(&partition);
        let (ready, held): (Vec<_>, Vec<_>) = std::mem::take(&mut self.pending)
            .into_iter()
            .partition(|write| write.partition == partition);
        self.pending = held;
        for write in ready {
            write_qword(&write.allocation, write.offset, write.value)?;
        }
        Ok(())
    }

    fn write(
        &mut self,
        partition: u32,
        allocation: &Arc<GraphicsAllocation>,
        offset: usize,
        value: u64,
    ) -> Result<(), MemoryError> {
        if !self.stalled.contains(&partition) {
            return write_qword(allocation, offset, value);
        }
        let id: AllocationId = allocation.id();
        match self
            .pending
            .iter_mut()
            .find(|w| w.partition == partition && w.allocation.id() == id && w.offset == offset)
        {
            Some(write) => write.value = value,
            None => self.pending.push(PendingWrite {
                partition,
                allocation: allocation.clone(),
                offset,
                value,
            }),
        }
        Ok(())
    }
}

fn write_qword(allocation: &GraphicsAllocation, offset: usize, value: u64) -> Result<(), MemoryError> {
    allocation
        .memory()
        .write_dwords(offset, &[value as u32, (value >> 32) as u32])
}

/// Execution position inside a submitted batch.
#[derive(Debug)]
pub(crate) struct Cursor {
    allocation: Arc<GraphicsAllocation>,
    offset: usize,
    return_stack: Vec<(Arc<GraphicsAllocation>, usize)>,
    executed: Vec<Command>,
}

impl Cursor {
    pub(crate) fn new(allocation: Arc<GraphicsAllocation>, offset: usize) -> Self {
        Self {
            allocation,
            offset,
            return_stack: Vec::new(),
            executed: Vec::new(),
        }
    }

    pub(crate) fn executed(&self) -> &[Command] {
        &self.executed
    }

    pub(crate) fn into_executed(self) -> Vec<Command> {
        self.executed
    }

    /// Execute until the batch ends, blocks or faults.
    pub(crate) fn run(
        &mut self,
        residency: &[Arc<GraphicsAllocation>],
        gate: &mut PostSyncGate,
        max_commands: usize,
    ) -> Step {
        match self.run_until_stop(residency, gate, max_commands) {
            Ok(step) => step,
            Err(fault) => Step::Fault(fault),
        }
    }

    fn fetch(&self) -> Result<(Command, usize), Fault> {
        let address = self.allocation.gpu_address() + self.offset as u64;
        let memory = self.allocation.memory();
        let header = memory.read_u32(self.offset)?;
        let len = ((header & LENGTH_MASK) as usize).max(1);
        let available = (memory.size().saturating_sub(self.offset) / 4).min(len);
        let dwords = memory.read_dwords(self.offset, available)?;
        let (command, consumed) =
            Command::decode(&dwords).map_err(|source| Fault::Decode { address, source })?;
        Ok((command, consumed * 4))
    }

    fn run_until_stop(
        &mut self,
        residency: &[Arc<GraphicsAllocation>],
        gate: &mut PostSyncGate,
        max_commands: usize,
    ) -> Result<Step, Fault> {
        loop {
            if self.executed.len() >= max_commands {
                return Err(Fault::Runaway(max_commands));
            }
            let (command, len) = self.fetch()?;
            let next = self.offset + len;

            match command {
                Command::BatchBufferStart {
                    address,
                    second_level,
                } => {
                    let (target, offset) = resolve(residency, address, 4)?;
                    if second_level {
                        if self.return_stack.len() >= MAX_BATCH_NESTING {
                            return Err(Fault::NestingTooDeep);
                        }
                        self.return_stack.push((self.allocation.clone(), next));
                    }
                    self.executed.push(command);
                    self.allocation = target.clone();
                    self.offset = offset;
                    continue;
                }
                Command::BatchBufferEnd => {
                    self.executed.push(command);
                    match self.return_stack.pop() {
                        Some((allocation, offset)) => {
                            self.allocation = allocation;
                            self.offset = offset;
                            continue;
                        }
                        None => return Ok(Step::Finished),
                    }
                }
                Command::SemaphoreWait {
                    address,
                    value,
                    compare,
                } => {
                    let (allocation, offset) = resolve(residency, address, 4)?;
                    let current = allocation.memory().read_u32(offset)?;
                    if !matches(compare, current, value) {
                        return Ok(Step::Blocked);
                    }
                }
                Command::PipeControl {
                    post_sync: Some(post_sync),
                    ..
                } => {
                    for partition in 0..post_sync.partition_count.max(1) {
                        let address = post_sync.address
                            + u64::from(partition) * u64::from(post_sync.partition_stride);
                        let (allocation, offset) = resolve(residency, address, 8)?;
                        gate.write(partition, allocation, offset, post_sync.value)?;
                    }
                }
                Command::StoreDataImm { address, value } => {
                    let (allocation, offset) = resolve(residency, address, 4)?;
                    allocation.memory().write_u32(offset, value)?;
                }
                Command::ComputeWalker { args_address, .. } if args_address != 0 => {
                    let (allocation, offset) = resolve(residency, args_address, 4)?;
                    let current = allocation.memory().read_u32(offset)?;
                    allocation
                        .memory()
                        .write_u32(offset, current.wrapping_add(1))?;
                }
                Command::CopyBlit { src, dst, size } => {
                    let len = u64::from(size);
                    let (source, src_offset) = resolve(residency, src, len)?;
                    let (target, dst_offset) = resolve(residency, dst, len)?;
                    let mut bytes = vec![0u8; size as usize];
                    source.memory().read_bytes(src_offset, &mut bytes)?;
                    target.memory().write_bytes(dst_offset, &bytes)?;
                }
                _ => {}
            }
            self.executed.push(command);
            self.offset = next;
        }
    }
}
