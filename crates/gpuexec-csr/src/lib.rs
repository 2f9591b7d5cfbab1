//! Command stream receivers: per-engine submission, completion tracking and residency.
//!
//! A [`CommandStreamReceiver`] owns one engine context. It programs hardware state lazily,
//! assigns monotonically increasing task counts, keeps everything a submission touches
//! resident, and reports completion through device-written tags. [`sim`] provides an
//! in-process device to run receivers against.
#![forbid(unsafe_code)]

pub mod command;
pub mod completion;
pub mod config;
mod csr;
pub mod direct_submission;
mod error;
pub mod factory;
pub mod hw_state;
pub mod info;
pub mod linear_stream;
pub mod os_context;
pub mod scratch;
pub mod sim;
pub mod stats;
pub mod submission;
pub mod tag_store;
#[cfg(test)]
mod test_support;

pub use command::{Command, CommandIter, CommandWriter, DecodeError};
pub use completion::{CompletionStamp, WaitStatus};
pub use config::{ConfigError, CsrConfig};
pub use csr::{CommandStreamReceiver, Dependency, DispatchFlags, FlushPayload, HostPtrSurface};
pub use error::{CsrError, Result};
pub use factory::{
    create_command_stream_receiver, CsrFactory, CsrFactoryRegistry, CsrParams, FamilyTraits,
    GfxFamily, HwCsrFactory,
};
pub use info::{get_info, CsrInfoParam, InfoError};
pub use linear_stream::{HeapKind, IndirectHeap, LinearStream};
pub use os_context::{EngineDescriptor, EngineType, EngineUsage, OsContext};
pub use stats::{CsrStats, CsrStatsSnapshot};
pub use submission::{BatchBuffer, GpuSubmitter, SubmissionStatus};
