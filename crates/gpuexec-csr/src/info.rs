//! Parameter queries copied out into caller-provided byte buffers.
//!
//! Every parameter is described once in [`INFO_TABLE`]; [`get_info`] is the only copy-out path.

use serde::Serialize;
use thiserror::Error;

use crate::csr::CommandStreamReceiver;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CsrInfoParam {
    TaskCount,
    LatestSentTaskCount,
    LatestFlushedTaskCount,
    CompletedTaskCount,
    TagAddress,
    ContextId,
    RootDeviceIndex,
    DeviceBitfield,
    ActivePartitions,
    Heapless,
    DirectSubmission,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InfoKind {
    U32,
    U64,
    /// Written as a `u32` holding 0 or 1.
    Bool,
}

impl InfoKind {
    pub const fn size(self) -> usize {
        match self {
            InfoKind::U32 | InfoKind::Bool => 4,
            InfoKind::U64 => 8,
        }
    }
}

pub struct InfoEntry {
    pub param: CsrInfoParam,
    pub kind: InfoKind,
    read: fn(&CommandStreamReceiver) -> u64,
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum InfoError {
    #[error("{param:?} needs {needed} bytes, buffer holds {provided}")]
    BufferTooSmall {
        param: CsrInfoParam,
        needed: usize,
        provided: usize,
    },
}

pub static INFO_TABLE: [InfoEntry; 11] = [
    InfoEntry {
        param: CsrInfoParam::TaskCount,
        kind: InfoKind::U32,
        read: |csr| u64::from(csr.task_count()),
    },
    InfoEntry {
        param: CsrInfoParam::LatestSentTaskCount,
        kind: InfoKind::U32,
        read: |csr| u64::from(csr.latest_sent_task_count()),
    },
    InfoEntry {
        param: CsrInfoParam::LatestFlushedTaskCount,
        kind: InfoKind::U32,
        read: |csr| u64::from(csr.latest_flushed_task_count()),
    },
    InfoEntry {
        param: CsrInfoParam::CompletedTaskCount,
        kind: InfoKind::U32,
        read: |csr| u64::from(csr.completed_task_count()),
    },
    InfoEntry {
        param: CsrInfoParam::TagAddress,
        kind: InfoKind::U64,
        read: |csr| csr.tag_address(),
    },
    InfoEntry {
        param: CsrInfoParam::ContextId,
        kind: InfoKind::U32,
        read: |csr| u64::from(csr.context_id()),
    },
    InfoEntry {
        param: CsrInfoParam::RootDeviceIndex,
        kind: InfoKind::U32,
        read: |csr| u64::from(csr.root_device_index()),
    },
    InfoEntry {
        param: CsrInfoParam::DeviceBitfield,
        kind: InfoKind::U32,
        read: |csr| u64::from(csr.device_bitfield().bits()),
    },
    InfoEntry {
        param: CsrInfoParam::ActivePartitions,
        kind: InfoKind::U32,
        read: |csr| u64::from(csr.active_partitions()),
    },
    InfoEntry {
        param: CsrInfoParam::Heapless,
        kind: InfoKind::Bool,
        read: |csr| u64::from(csr.is_heapless()),
    },
    InfoEntry {
        param: CsrInfoParam::DirectSubmission,
        kind: InfoKind::Bool,
        read: |csr| u64::from(csr.is_direct_submission_enabled()),
    },
];

pub fn info_entry(param: CsrInfoParam) -> &'static InfoEntry {
    // Every parameter has exactly one row; the table test keeps this exhaustive.
    INFO_TABLE
        .iter()
        .find(|entry| entry.param == param)
        .unwrap_or(&INFO_TABLE[0])
}

pub fn info_size(param: CsrInfoParam) -> usize {
    info_entry(param).kind.size()
}

/// Copy `param` into the start of `out` (little endian), returning the bytes written.
pub fn get_info(
    csr: &CommandStreamReceiver,
    param: CsrInfoParam,
    out: &mut [u8],
) -> Result<usize, InfoError> {
    let entry = info_entry(param);
    let needed = entry.kind.size();
    if out.len() < needed {
        return Err(InfoError::BufferTooSmall {
            param,
            needed,
            provided: out.len(),
        });
    }
    let value = (entry.read)(csr);
    match entry.kind {
        InfoKind::U32 | InfoKind::Bool => out[..4].copy_from_slice(&(value as u32).to_le_bytes()),
        InfoKind::U64 => out[..8].copy_from_slice(&value.to_le_bytes()),
    }
    Ok(needed)
}
