use gpuexec_mem::{ContextId, MemoryError};
use thiserror::Error;

use crate::command::DecodeError;
use crate::config::ConfigError;
use crate::factory::GfxFamily;
use crate::linear_stream::HeapKind;
use crate::submission::SubmissionStatus;

pub type Result<T> = std::result::Result<T, CsrError>;

#[derive(Debug, Error)]
pub enum CsrError {
    #[error(transparent)]
    Memory(#[from] MemoryError),

    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("os context {context_id} failed to initialize: {reason}")]
    ContextInitialization { context_id: ContextId, reason: String },

    #[error("command stream has {available} bytes left, {requested} requested")]
    StreamFull { requested: usize, available: usize },

    #[error("command stream has no backing allocation")]
    NoCommandBuffer,

    #[error("{0:?} heap is unavailable in heapless mode")]
    HeaplessHeap(HeapKind),

    #[error("no command stream receiver factory registered for {0:?}")]
    UnknownFamily(GfxFamily),

    #[error("direct submission ring did not drain in time")]
    RingStall,

    #[error("submission failed: {0:?}")]
    Submission(SubmissionStatus),
}

impl CsrError {
    /// Status reported in place of a task count when this error aborts a flush.
    pub fn submission_status(&self) -> SubmissionStatus {
        match self {
            CsrError::Memory(err) => SubmissionStatus::from(err),
            CsrError::Submission(status) => *status,
            CsrError::ContextInitialization { .. } => SubmissionStatus::DeviceUninitialized,
            _ => SubmissionStatus::Failed,
        }
    }
}
