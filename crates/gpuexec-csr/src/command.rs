//! Engine command encoding.
//!
//! Every command starts with a header dword: opcode in bits 31..24 and the total command length
//! in dwords (header included) in bits 15..0. 64-bit fields are stored low dword first.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const OPCODE_SHIFT: u32 = 24;
pub const LENGTH_MASK: u32 = 0xffff;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    Noop = 0x00,
    BatchBufferStart = 0x01,
    BatchBufferEnd = 0x02,
    PipeControl = 0x03,
    StoreDataImm = 0x04,
    SemaphoreWait = 0x05,
    LoadRegisterImm = 0x06,
    PipelineSelect = 0x07,
    StateBaseAddress = 0x08,
    BindingTablePoolAlloc = 0x09,
    FrontEndState = 0x0a,
    StateComputeMode = 0x0b,
    PreemptionControl = 0x0c,
    StateSip = 0x0d,
    StateSystemMemFenceAddress = 0x0e,
    RayTracingBuffer = 0x0f,
    WorkPartitionRegister = 0x10,
    ComputeWalker = 0x11,
    CopyBlit = 0x12,
}

impl Opcode {
    pub fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            0x00 => Self::Noop,
            0x01 => Self::BatchBufferStart,
            0x02 => Self::BatchBufferEnd,
            0x03 => Self::PipeControl,
            0x04 => Self::StoreDataImm,
            0x05 => Self::SemaphoreWait,
            0x06 => Self::LoadRegisterImm,
            0x07 => Self::PipelineSelect,
            0x08 => Self::StateBaseAddress,
            0x09 => Self::BindingTablePoolAlloc,
            0x0a => Self::FrontEndState,
            0x0b => Self::StateComputeMode,
            0x0c => Self::PreemptionControl,
            0x0d => Self::StateSip,
            0x0e => Self::StateSystemMemFenceAddress,
            0x0f => Self::RayTracingBuffer,
            0x10 => Self::WorkPartitionRegister,
            0x11 => Self::ComputeWalker,
            0x12 => Self::CopyBlit,
            _ => return None,
        })
    }

    /// Fixed command length in dwords, header included.
    pub const fn dword_len(self) -> usize {
        match self {
            Self::Noop | Self::BatchBufferEnd => 1,
            Self::PreemptionControl | Self::PipelineSelect | Self::StateComputeMode => 2,
            Self::LoadRegisterImm
            | Self::StateSip
            | Self::StateSystemMemFenceAddress
            | Self::WorkPartitionRegister => 3,
            Self::BatchBufferStart
            | Self::StoreDataImm
            | Self::BindingTablePoolAlloc
            | Self::RayTracingBuffer => 4,
            Self::SemaphoreWait | Self::FrontEndState => 5,
            Self::CopyBlit => 6,
            Self::ComputeWalker => 7,
            Self::PipeControl => 8,
            Self::StateBaseAddress => 11,
        }
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct PipeControlFlags: u32 {
        const CS_STALL = 1 << 0;
        const DC_FLUSH = 1 << 1;
        const NOTIFY = 1 << 2;
        const TEXTURE_CACHE_INVALIDATE = 1 << 3;
        const HDC_PIPELINE_FLUSH = 1 << 4;
        const WORKLOAD_PARTITION = 1 << 5;
        const POST_SYNC_WRITE = 1 << 6;
    }
}

/// Immediate value written after the pipe drains, once per partition at `partition_stride`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PostSync {
    pub address: u64,
    pub value: u64,
    pub partition_count: u32,
    pub partition_stride: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineSelectMode {
    #[default]
    Gpgpu,
    ThreeD,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThreadArbitrationPolicy {
    #[default]
    AgeBased,
    RoundRobin,
    RoundRobinAfterDependency,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PreemptionMode {
    Disabled,
    MidBatch,
    #[default]
    ThreadGroup,
    MidThread,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CompareOp {
    #[default]
    GreaterOrEqual,
    Equal,
    NotEqual,
}

/// Base addresses programmed by `StateBaseAddress`. Zero means "not programmed".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct BaseAddresses {
    pub general_state: u64,
    pub surface_state: u64,
    pub dynamic_state: u64,
    pub indirect_object: u64,
    pub instruction: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct FrontEndConfig {
    pub scratch_address: u64,
    pub per_thread_scratch_size: u32,
    pub disable_eu_fusion: bool,
    pub compute_dispatch_all_walker: bool,
    pub single_slice_dispatch: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ComputeModeConfig {
    pub thread_arbitration: ThreadArbitrationPolicy,
    pub large_grf: bool,
    pub coherency_required: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Noop,
    BatchBufferStart { address: u64, second_level: bool },
    BatchBufferEnd,
    PipeControl { flags: PipeControlFlags, post_sync: Option<PostSync> },
    StoreDataImm { address: u64, value: u32 },
    SemaphoreWait { address: u64, value: u32, compare: CompareOp },
    LoadRegisterImm { register: u32, value: u32 },
    PipelineSelect { mode: PipelineSelectMode, systolic: bool },
    StateBaseAddress(BaseAddresses),
    BindingTablePoolAlloc { base: u64, size: u32 },
    FrontEndState(FrontEndConfig),
    StateComputeMode(ComputeModeConfig),
    PreemptionControl { mode: PreemptionMode },
    StateSip { address: u64 },
    StateSystemMemFenceAddress { address: u64 },
    RayTracingBuffer { address: u64, size: u32 },
    WorkPartitionRegister { address: u64 },
    ComputeWalker { kernel_id: u32, groups: [u32; 3], args_address: u64 },
    CopyBlit { src: u64, dst: u64, size: u32 },
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum DecodeError {
    #[error("command buffer ends inside a command header")]
    BufferTooSmall,
    #[error("unknown opcode 0x{0:02x}")]
    UnknownOpcode(u8),
    #[error("opcode {opcode:?} declares {found} dwords, expected {expected}")]
    BadLength { opcode: Opcode, expected: usize, found: usize },
    #[error("command at dword {offset} ({len} dwords) overruns a {available}-dword stream")]
    CommandOverrunsStream { offset: usize, len: usize, available: usize },
    #[error("invalid field value 0x{value:x} in {opcode:?}")]
    InvalidField { opcode: Opcode, value: u32 },
}

fn header(opcode: Opcode) -> u32 {
    ((opcode as u32) << OPCODE_SHIFT) | opcode.dword_len() as u32
}

fn lo(value: u64) -> u32 {
    value as u32
}

fn hi(value: u64) -> u32 {
    (value >> 32) as u32
}

fn join(lo: u32, hi: u32) -> u64 {
    u64::from(lo) | (u64::from(hi) << 32)
}

impl Command {
    pub fn opcode(&self) -> Opcode {
        match self {
            Self::Noop => Opcode::Noop,
            Self::BatchBufferStart { .. } => Opcode::BatchBufferStart,
            Self::BatchBufferEnd => Opcode::BatchBufferEnd,
            Self::PipeControl { .. } => Opcode::PipeControl,
            Self::StoreDataImm { .. } => Opcode::StoreDataImm,
            Self::SemaphoreWait { .. } => Opcode::SemaphoreWait,
            Self::LoadRegisterImm { .. } => Opcode::LoadRegisterImm,
            Self::PipelineSelect { .. } => Opcode::PipelineSelect,
            Self::StateBaseAddress(_) => Opcode::StateBaseAddress,
            Self::BindingTablePoolAlloc { .. } => Opcode::BindingTablePoolAlloc,
            Self::FrontEndState(_) => Opcode::FrontEndState,
            Self::StateComputeMode(_) => Opcode::StateComputeMode,
            Self::PreemptionControl { .. } => Opcode::PreemptionControl,
            Self::StateSip { .. } => Opcode::StateSip,
            Self::StateSystemMemFenceAddress { .. } => Opcode::StateSystemMemFenceAddress,
            Self::RayTracingBuffer { .. } => Opcode::RayTracingBuffer,
            Self::WorkPartitionRegister { .. } => Opcode::WorkPartitionRegister,
            Self::ComputeWalker { .. } => Opcode::ComputeWalker,
            Self::CopyBlit { .. } => Opcode::CopyBlit,
        }
    }

    pub fn dword_len(&self) -> usize {
        self.opcode().dword_len()
    }

    pub fn byte_len(&self) -> usize {
        self.dword_len() * 4
    }

    /// Append the encoded command to `out`.
    pub fn encode(&self, out: &mut Vec<u32>) {
        out.push(header(self.opcode()));
        match *self {
            Self::Noop | Self::BatchBufferEnd => {}
            Self::BatchBufferStart { address, second_level } => {
                out.extend([lo(address), hi(address), u32::from(second_level)]);
            }
            Self::PipeControl { flags, post_sync } => {
                let mut flags = flags;
                flags.set(PipeControlFlags::POST_SYNC_WRITE, post_sync.is_some());
                let ps = post_sync.unwrap_or(PostSync {
                    address: 0,
                    value: 0,
                    partition_count: 0,
                    partition_stride: 0,
                });
                out.extend([
                    flags.bits(),
                    lo(ps.address),
                    hi(ps.address),
                    lo(ps.value),
                    hi(ps.value),
                    ps.partition_count,
                    ps.partition_stride,
                ]);
            }
            Self::StoreDataImm { address, value } => {
                out.extend([lo(address), hi(address), value]);
            }
            Self::SemaphoreWait { address, value, compare } => {
                out.extend([lo(address), hi(address), value, compare as u32]);
            }
            Self::LoadRegisterImm { register, value } => out.extend([register, value]),
            Self::PipelineSelect { mode, systolic } => {
                out.push(mode as u32 | (u32::from(systolic) << 4));
            }
            Self::StateBaseAddress(b) => {
                for address in [
                    b.general_state,
                    b.surface_state,
                    b.dynamic_state,
                    b.indirect_object,
                    b.instruction,
                ] {
                    out.extend([lo(address), hi(address)]);
                }
            }
            Self::BindingTablePoolAlloc { base, size } => out.extend([lo(base), hi(base), size]),
            Self::FrontEndState(fe) => {
                let bits = u32::from(fe.disable_eu_fusion)
                    | (u32::from(fe.compute_dispatch_all_walker) << 1)
                    | (u32::from(fe.single_slice_dispatch) << 2);
                out.extend([
                    lo(fe.scratch_address),
                    hi(fe.scratch_address),
                    fe.per_thread_scratch_size,
                    bits,
                ]);
            }
            Self::StateComputeMode(cm) => {
                out.push(
                    cm.thread_arbitration as u32
                        | (u32::from(cm.large_grf) << 4)
                        | (u32::from(cm.coherency_required) << 5),
                );
            }
            Self::PreemptionControl { mode } => out.push(mode as u32),
            Self::StateSip { address }
            | Self::StateSystemMemFenceAddress { address }
            | Self::WorkPartitionRegister { address } => out.extend([lo(address), hi(address)]),
            Self::RayTracingBuffer { address, size } => out.extend([lo(address), hi(address), size]),
            Self::ComputeWalker {
                kernel_id,
                groups,
                args_address,
            } => out.extend([
                kernel_id,
                groups[0],
                groups[1],
                groups[2],
                lo(args_address),
                hi(args_address),
            ]),
            Self::CopyBlit { src, dst, size } => {
                out.extend([lo(src), hi(src), lo(dst), hi(dst), size]);
            }
        }
    }

    pub fn to_dwords(&self) -> Vec<u32> {
        let mut out = Vec::with_capacity(self.dword_len());
        self.encode(&mut out);
        out
    }

    /// Decode the command at the start of `dwords`, returning it and its length in dwords.
    pub fn decode(dwords: &[u32]) -> Result<(Command, usize), DecodeError> {
        let (&header, _) = dwords.split_first().ok_or(DecodeError::BufferTooSmall)?;
        let raw_opcode = (header >> OPCODE_SHIFT) as u8;
        let opcode = Opcode::from_u8(raw_opcode).ok_or(DecodeError::UnknownOpcode(raw_opcode))?;
        let len = (header & LENGTH_MASK) as usize;
        if len != opcode.dword_len() {
            return Err(DecodeError::BadLength {
                opcode,
                expected: opcode.dword_len(),
                found: len,
            });
        }
        if dwords.len() < len {
            return Err(DecodeError::CommandOverrunsStream {
                offset: 0,
                len,
                available: dwords.len(),
            });
        }
        let d = &dwords[1..len];
        let invalid = |value: u32| DecodeError::InvalidField { opcode, value };

        let command = match opcode {
            Opcode::Noop => Self::Noop,
            Opcode::BatchBufferEnd => Self::BatchBufferEnd,
            Opcode::BatchBufferStart => Self::BatchBufferStart {
                address: join(d[0], d[1]),
                second_level: d[2] & 1 != 0,
            },
            Opcode::PipeControl => {
                let flags = PipeControlFlags::from_bits(d[0]).ok_or_else(|| invalid(d[0]))?;
                let post_sync = flags.contains(PipeControlFlags::POST_SYNC_WRITE).then(|| PostSync {
                    address: join(d[1], d[2]),
                    value: join(d[3], d[4]),
                    partition_count: d[5],
                    partition_stride: d[6],
                });
                Self::PipeControl { flags, post_sync }
            }
            Opcode::StoreDataImm => Self::StoreDataImm {
                address: join(d[0], d[1]),
                value: d[2],
            },
            Opcode::SemaphoreWait => Self::SemaphoreWait {
                address: join(d[0], d[1]),
                value: d[2],
                compare: match d[3] {
                    0 => CompareOp::GreaterOrEqual,
                    1 => CompareOp::Equal,
                    2 => CompareOp::NotEqual,
                    other => return Err(invalid(other)),
                },
            },
            Opcode::LoadRegisterImm => Self::LoadRegisterImm {
                register: d[0],
                value: d[1],
            },
            Opcode::PipelineSelect => Self::PipelineSelect {
                mode: match d[0] & 0xf {
                    0 => PipelineSelectMode::Gpgpu,
                    1 => PipelineSelectMode::ThreeD,
                    _ => return Err(invalid(d[0])),
                },
                systolic: d[0] & (1 << 4) != 0,
            },
            Opcode::StateBaseAddress => Self::StateBaseAddress(BaseAddresses {
                general_state: join(d[0], d[1]),
                surface_state: join(d[2], d[3]),
                dynamic_state: join(d[4], d[5]),
                indirect_object: join(d[6], d[7]),
                instruction: join(d[8], d[9]),
            }),
            Opcode::BindingTablePoolAlloc => Self::BindingTablePoolAlloc {
                base: join(d[0], d[1]),
                size: d[2],
            },
            Opcode::FrontEndState => Self::FrontEndState(FrontEndConfig {
                scratch_address: join(d[0], d[1]),
                per_thread_scratch_size: d[2],
                disable_eu_fusion: d[3] & 1 != 0,
                compute_dispatch_all_walker: d[3] & 2 != 0,
                single_slice_dispatch: d[3] & 4 != 0,
            }),
            Opcode::StateComputeMode => Self::StateComputeMode(ComputeModeConfig {
                thread_arbitration: match d[0] & 0xf {
                    0 => ThreadArbitrationPolicy::AgeBased,
                    1 => ThreadArbitrationPolicy::RoundRobin,
                    2 => ThreadArbitrationPolicy::RoundRobinAfterDependency,
                    _ => return Err(invalid(d[0])),
                },
                large_grf: d[0] & (1 << 4) != 0,
                coherency_required: d[0] & (1 << 5) != 0,
            }),
            Opcode::PreemptionControl => Self::PreemptionControl {
                mode: match d[0] {
                    0 => PreemptionMode::Disabled,
                    1 => PreemptionMode::MidBatch,
                    2 => PreemptionMode::ThreadGroup,
                    3 => PreemptionMode::MidThread,
                    other => return Err(invalid(other)),
                },
            },
            Opcode::StateSip => Self::StateSip {
                address: join(d[0], d[1]),
            },
            Opcode::StateSystemMemFenceAddress => Self::StateSystemMemFenceAddress {
                address: join(d[0], d[1]),
            },
            Opcode::RayTracingBuffer => Self::RayTracingBuffer {
                address: join(d[0], d[1]),
                size: d[2],
            },
            Opcode::WorkPartitionRegister => Self::WorkPartitionRegister {
                address: join(d[0], d[1]),
            },
            Opcode::ComputeWalker => Self::ComputeWalker {
                kernel_id: d[0],
                groups: [d[1], d[2], d[3]],
                args_address: join(d[4], d[5]),
            },
            Opcode::CopyBlit => Self::CopyBlit {
                src: join(d[0], d[1]),
                dst: join(d[2], d[3]),
                size: d[4],
            },
        };
        Ok((command, len))
    }
}

/// Encodes commands into a dword vector.
#[derive(Debug, Default, Clone)]
pub struct CommandWriter {
    dwords: Vec<u32>,
}

impl CommandWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, command: Command) -> &mut Self {
        command.encode(&mut self.dwords);
        self
    }

    pub fn extend(&mut self, commands: &[Command]) -> &mut Self {
        for command in commands {
            command.encode(&mut self.dwords);
        }
        self
    }

    pub fn len_bytes(&self) -> usize {
        self.dwords.len() * 4
    }

    pub fn is_empty(&self) -> bool {
        self.dwords.is_empty()
    }

    pub fn as_dwords(&self) -> &[u32] {
        &self.dwords
    }

    pub fn finish(self) -> Vec<u32> {
        self.dwords
    }
}

/// Iterates the commands of a dword stream, stopping at the first decode error.
#[derive(Debug, Clone)]
pub struct CommandIter<'a> {
    dwords: &'a [u32],
    offset: usize,
    done: bool,
}

impl<'a> CommandIter<'a> {
    pub fn new(dwords: &'a [u32]) -> Self {
        Self {
            dwords,
            offset: 0,
            done: false,
        }
    }

    /// Dword offset of the next command.
    pub fn offset(&self) -> usize {
        self.offset
    }
}

impl Iterator for CommandIter<'_> {
    type Item = Result<Command, DecodeError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done || self.offset >= self.dwords.len() {
            return None;
        }
        match Command::decode(&self.dwords[self.offset..]) {
            Ok((command, len)) => {
                self.offset += len;
                Some(Ok(command))
            }
            Err(DecodeError::CommandOverrunsStream { len, .. }) => {
                self.done = true;
                Some(Err(DecodeError::CommandOverrunsStream {
                    offset: self.offset,
                    len,
                    available: self.dwords.len(),
                }))
            }
            Err(err) => {
                self.done = true;
                Some(Err(err))
            }
        }
    }
}

/// Decode a whole stream, failing on the first bad command.
pub fn decode_all(dwords: &[u32]) -> Result<Vec<Command>, DecodeError> {
    CommandIter::new(dwords).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn sample_commands() -> Vec<Command> {
        vec![
            Command::PipelineSelect {
                mode: PipelineSelectMode::Gpgpu,
                systolic: true,
            },
            Command::StateBaseAddress(BaseAddresses {
                general_state: 0x1_0000_0000,
                surface_state: 0x2_0000_1000,
                ..BaseAddresses::default()
            }),
            Command::SemaphoreWait {
                address: 0xdead_b000,
                value: 3,
                compare: CompareOp::GreaterOrEqual,
            },
            Command::ComputeWalker {
                kernel_id: 7,
                groups: [4, 2, 1],
                args_address: 0x1234_5678_9abc,
            },
            Command::PipeControl {
                flags: PipeControlFlags::CS_STALL | PipeControlFlags::DC_FLUSH,
                post_sync: Some(PostSync {
                    address: 0x1_0000_0000,
                    value: 42,
                    partition_count: 2,
                    partition_stride: 16,
                }),
            },
            Command::BatchBufferEnd,
        ]
    }

    #[test]
    fn header_carries_opcode_and_length() {
        let dwords = Command::StoreDataImm {
            address: 0x1000,
            value: 5,
        }
        .to_dwords();
        assert_eq!(dwords[0], 0x0400_0004);
        assert_eq!(dwords.len(), 4);
    }

    #[test]
    fn stream_decodes_back_to_the_written_commands() {
        let commands = sample_commands();
        let mut writer = CommandWriter::new();
        writer.extend(&commands);
        assert_eq!(
            writer.len_bytes(),
            commands.iter().map(Command::byte_len).sum::<usize>()
        );
        assert_eq!(decode_all(writer.as_dwords()).unwrap(), commands);
    }

    #[test]
    fn pipe_control_without_post_sync_clears_the_write_flag() {
        let command = Command::PipeControl {
            flags: PipeControlFlags::CS_STALL | PipeControlFlags::POST_SYNC_WRITE,
            post_sync: None,
        };
        let (decoded, _) = Command::decode(&command.to_dwords()).unwrap();
        assert_eq!(
            decoded,
            Command::PipeControl {
                flags: PipeControlFlags::CS_STALL,
                post_sync: None
            }
        );
    }

    #[test]
    fn truncated_stream_reports_overrun_offset() {
        let mut dwords = Command::Noop.to_dwords();
        let walker = Command::ComputeWalker {
            kernel_id: 1,
            groups: [1, 1, 1],
            args_address: 0,
        }
        .to_dwords();
        dwords.extend_from_slice(&walker[..3]);

        let results: Vec<_> = CommandIter::new(&dwords).collect();
        assert_eq!(results[0], Ok(Command::Noop));
        assert_eq!(
            results[1],
            Err(DecodeError::CommandOverrunsStream {
                offset: 1,
                len: 7,
                available: 4
            })
        );
        assert_eq!(results.len(), 2);
    }

    #[test]
    fn unknown_opcode_and_bad_length_are_rejected() {
        assert_eq!(
            Command::decode(&[0x7f00_0001]),
            Err(DecodeError::UnknownOpcode(0x7f))
        );
        assert_eq!(
            Command::decode(&[0x0200_0003]),
            Err(DecodeError::BadLength {
                opcode: Opcode::BatchBufferEnd,
                expected: 1,
                found: 3
            })
        );
        assert_eq!(Command::decode(&[]), Err(DecodeError::BufferTooSmall));
    }

    #[cfg(not(target_arch = "wasm32"))]
    mod prop {
        use super::*;
        use proptest::prelude::*;

        fn dword_strategy() -> impl Strategy<Value = u32> {
            prop_oneof![
                any::<u32>(),
                // Plausible headers: a known opcode byte with a small length.
                (0u32..0x20, 0u32..12).prop_map(|(opcode, len)| (opcode << 24) | len),
            ]
        }

        proptest! {
            #[test]
            fn decoding_arbitrary_dwords_never_overruns(
                dwords in proptest::collection::vec(dword_strategy(), 0..64),
            ) {
                let mut iter = CommandIter::new(&dwords);
                let mut consumed = 0usize;
                for result in iter.by_ref() {
                    match result {
                        Ok(command) => consumed += command.dword_len(),
                        Err(_) => break,
                    }
                }
                prop_assert!(iter.offset() <= dwords.len());
                prop_assert_eq!(iter.offset(), consumed);
            }
        }
    }
}
