//! Devmem - handle-indirected registry for device-resident memory
//!
//! A fixed-capacity table that maps small integer handles to device
//! buffers, so a managed host process can allocate, populate, read back,
//! and release accelerator memory without ever holding or serializing a
//! native pointer across a runtime boundary.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────┐
//! │  Embedding host  │  i64 handles + status codes (ffi)
//! └────────┬─────────┘
//!          ▼
//! ┌──────────────────┐
//! │  MemoryRegistry  │  fixed slot table, circular probe,
//! │                  │  two-tier handle resolution
//! └────────┬─────────┘
//!          │ local [1, cap-1]          delegated [cap, 2*cap-1]
//!          ▼                           ▼
//! ┌──────────────────┐        ┌──────────────────┐
//! │   MemoryBlock    │        │  linked registry │
//! │ owned | borrowed │        │   (handle - cap) │
//! └────────┬─────────┘        └──────────────────┘
//!          ▼
//! ┌──────────────────┐
//! │   DeviceMemory   │  opaque allocator / copy engine
//! └──────────────────┘
//! ```
//!
//! Handle `0` is reserved as the null handle. The table never resizes;
//! exhaustion is reported as an explicit error and the caller owns the
//! retry policy. A registry instance expects a single calling thread;
//! the surrounding runtime serializes access.
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use devmem::{HostMemory, MemoryRegistry};
//!
//! let service = Arc::new(HostMemory::new());
//! let mut registry = MemoryRegistry::new(service);
//!
//! let handle = registry.allocate(0, 1024, None, None).unwrap();
//! registry.write(handle, 4, &[0xAB; 4], None).unwrap();
//!
//! let mut out = vec![0u8; 1024];
//! registry.read(handle, 1024, &mut out).unwrap();
//! assert_eq!(&out[..4], &[0xAB; 4]);
//! assert_eq!(out[4], 0); // remainder stays zeroed
//!
//! registry.free(handle).unwrap();
//! ```

pub mod block;
pub mod device;
pub mod error;
pub mod ffi;
pub mod registry;

pub use block::MemoryBlock;
pub use device::{DeviceMemory, DeviceRef, HostMemory, StreamToken};
pub use error::{status, DeviceError, MemError};
pub use registry::{Handle, MemoryRegistry, SharedRegistry, CAPACITY};
