//! A software device for running receivers without hardware.
//!
//! [`SimDevice`] implements [`crate::GpuSubmitter`] by decoding submitted command streams and
//! applying their memory effects: completion fences, immediate stores, semaphore waits, copies
//! and kernel dispatches (which bump a counter at their argument address). Only allocations in
//! a batch's residency list are addressable; touching anything else is a page fault, which hangs
//! the device.

mod device;
mod executor;
mod os_context;

pub use device::{
    ExecutionMode, ExecutionRecord, SimDevice, SimWorker, DEFAULT_LOG_CAPACITY,
    DEFAULT_MAX_COMMANDS_PER_BATCH,
};
pub use executor::{Fault, MAX_BATCH_NESTING};
pub use os_context::SimOsContext;
