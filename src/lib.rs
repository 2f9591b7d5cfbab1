//! GPU driver execution core.
//!
//! - [`mem`]: allocations, host-pointer fragments and per-engine allocation lists
//! - [`csr`]: command stream receivers, completion tags and the simulated device
#![forbid(unsafe_code)]

pub use gpuexec_csr as csr;
pub use gpuexec_mem as mem;

pub use gpuexec_csr::{
    CommandStreamReceiver, CompletionStamp, CsrConfig, DispatchFlags, FlushPayload, WaitStatus,
};
pub use gpuexec_mem::{GraphicsAllocation, MemoryManager, MemoryManagerConfig};
