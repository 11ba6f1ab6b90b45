//! Error taxonomy and signed status codes
//!
//! Every fallible operation in the crate returns `Result<_, MemError>`;
//! nothing panics outside tests. The embedding host sees each failure as
//! a signed `i64` status code: `0` is success, the fixed negative codes
//! below identify local failure kinds, and device-service failures carry
//! the service's native code forward unchanged.

use thiserror::Error;

/// Native status code reported by the device-memory service.
///
/// The registry never interprets these codes; they are forwarded to the
/// caller exactly as the service produced them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("device status {0}")]
pub struct DeviceError(pub i64);

/// Error type for registry and block operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum MemError {
    /// Null, zero-sized, or undersized input
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
    /// Handle, offset, or size outside valid bounds
    #[error("handle, offset, or size out of range")]
    OutOfRange,
    /// Operation on an empty block
    #[error("block holds no buffer")]
    NotAllocated,
    /// No free slot after a full table scan
    #[error("registry has no free slot")]
    ResourceExhausted,
    /// Device allocation (or initial zeroing) failed
    #[error("device allocation failed: {0}")]
    AllocationFailed(DeviceError),
    /// Device copy or memset failed
    #[error("device transfer failed: {0}")]
    TransferFailed(DeviceError),
}

/// Signed status codes for the linkage-level interface.
///
/// Device-service codes are positive by convention (CUDA-style) and
/// never collide with the local negative codes.
pub mod status {
    /// Success
    pub const OK: i64 = 0;
    /// Null, zero-sized, or undersized input
    pub const INVALID_ARGUMENT: i64 = -1;
    /// Handle, offset, or size outside valid bounds
    pub const OUT_OF_RANGE: i64 = -2;
    /// Operation on an empty block
    pub const NOT_ALLOCATED: i64 = -3;
    /// No free slot in the registry
    pub const RESOURCE_EXHAUSTED: i64 = -4;
    /// Unknown registry instance id (FFI surface only)
    pub const UNKNOWN_INSTANCE: i64 = -5;
}

impl MemError {
    /// Map the error to the signed status code the embedding host sees.
    pub fn status(&self) -> i64 {
        match self {
            MemError::InvalidArgument(_) => status::INVALID_ARGUMENT,
            MemError::OutOfRange => status::OUT_OF_RANGE,
            MemError::NotAllocated => status::NOT_ALLOCATED,
            MemError::ResourceExhausted => status::RESOURCE_EXHAUSTED,
            // Forward the native code verbatim
            MemError::AllocationFailed(DeviceError(code))
            | MemError::TransferFailed(DeviceError(code)) => *code,
        }
    }
}
