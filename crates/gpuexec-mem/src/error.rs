use thiserror::Error;

pub type Result<T> = std::result::Result<T, MemoryError>;

/// Failures surfaced by the allocation layer.
///
/// Exhaustion variants are recoverable: the caller may release other allocations and retry.
/// [`MemoryError::HostPtrOverlap`] and [`MemoryError::MissingFragment`] report a desynchronised
/// fragment table and must not be ignored.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MemoryError {
    #[error("out of device memory (requested {requested} bytes, {available} available)")]
    OutOfDeviceMemory { requested: usize, available: usize },

    #[error("out of host memory")]
    OutOfHostMemory,

    #[error("invalid allocation size {0}")]
    InvalidSize(usize),

    #[error("alignment {0} is not a power of two")]
    InvalidAlignment(usize),

    #[error("integer overflow while computing allocation bounds")]
    Overflow,

    #[error("unaligned access at offset {offset} (expected multiple of {alignment})")]
    Unaligned { offset: usize, alignment: usize },

    #[error("out of bounds: offset={offset} len={len} size={size}")]
    OutOfBounds { offset: usize, len: usize, size: usize },

    #[error("host range 0x{ptr:x}+0x{size:x} overlaps fragments that never became idle")]
    HostPtrOverlap { ptr: u64, size: usize },

    #[error("expected fragment at 0x{ptr:x} on root device {root_device_index} is missing")]
    MissingFragment { root_device_index: u32, ptr: u64 },

    #[error("unknown shared handle {0}")]
    UnknownSharedHandle(u32),

    #[error("allocation {0} cannot be shared")]
    NotShareable(u64),
}

impl MemoryError {
    /// Whether the failure is a resource shortage the caller may retry after freeing memory.
    pub fn is_exhaustion(&self) -> bool {
        matches!(
            self,
            MemoryError::OutOfDeviceMemory { .. } | MemoryError::OutOfHostMemory
        )
    }
}
