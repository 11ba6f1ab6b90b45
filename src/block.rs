//! Memory block
//!
//! A [`MemoryBlock`] owns or borrows exactly one contiguous device
//! buffer and performs bounds-checked transfers into and out of it. It
//! is the only component that talks to the device-memory service.
//!
//! A block is either fully empty or fully populated; there is no
//! partially-initialized state. Owned buffers are released on
//! [`MemoryBlock::release`] or on drop; borrowed buffers are never
//! released here; their external owner must outlive the borrow.

use std::sync::Arc;

use tracing::trace;

use crate::device::{DeviceMemory, DeviceRef, StreamToken};
use crate::error::MemError;

/// How the block holds its buffer.
///
/// The sum type makes the no-free-on-borrow rule static: only
/// `Owned` storage ever reaches `DeviceMemory::free`.
#[derive(Debug, Clone, Copy)]
enum Storage {
    Empty,
    Owned(DeviceRef),
    Borrowed(DeviceRef),
}

/// One device buffer, owned or borrowed.
pub struct MemoryBlock {
    service: Arc<dyn DeviceMemory>,
    storage: Storage,
    /// Capacity in bytes; 0 iff the block is empty.
    size_bytes: i64,
    /// Accelerator device id; -1 when unassigned.
    device_id: i32,
}

impl MemoryBlock {
    /// Create an empty block bound to a device-memory service.
    pub fn new(service: Arc<dyn DeviceMemory>) -> Self {
        Self {
            service,
            storage: Storage::Empty,
            size_bytes: 0,
            device_id: -1,
        }
    }

    /// True when the block holds no buffer.
    pub fn is_free(&self) -> bool {
        matches!(self.storage, Storage::Empty)
    }

    /// True when the block is responsible for releasing its buffer.
    pub fn is_owner(&self) -> bool {
        matches!(self.storage, Storage::Owned(_))
    }

    /// Capacity of the buffer in bytes; 0 when empty.
    pub fn size(&self) -> i64 {
        self.size_bytes
    }

    /// Device the buffer lives on; -1 when unassigned.
    pub fn device_id(&self) -> i32 {
        self.device_id
    }

    /// The underlying device reference, if populated.
    pub fn data_ref(&self) -> Option<DeviceRef> {
        match self.storage {
            Storage::Empty => None,
            Storage::Owned(r) | Storage::Borrowed(r) => Some(r),
        }
    }

    /// Populated descriptor `(ref, capacity)`, if any.
    pub(crate) fn descriptor(&self) -> Option<(DeviceRef, i64)> {
        self.data_ref().map(|r| (r, self.size_bytes))
    }

    fn populated(&self) -> Result<DeviceRef, MemError> {
        self.data_ref().ok_or(MemError::NotAllocated)
    }

    /// Allocate a zero-initialized owned buffer of `size_bytes` on
    /// `device_id`, releasing any previously held owned buffer first.
    ///
    /// If `src` is supplied, `size_bytes` bytes are copied from it into
    /// the new buffer, enqueued on `stream` if given and synchronous
    /// otherwise. Any failure rolls the block back to empty.
    pub fn allocate(
        &mut self,
        device_id: i32,
        size_bytes: i64,
        src: Option<&[u8]>,
        stream: Option<StreamToken>,
    ) -> Result<(), MemError> {
        if size_bytes <= 0 {
            return Err(MemError::InvalidArgument("size_bytes must be positive"));
        }

        self.release();

        let bytes = size_bytes as u64;
        let data = self
            .service
            .allocate(device_id, bytes)
            .map_err(MemError::AllocationFailed)?;

        if let Err(err) = self.service.zero(data, bytes) {
            self.service.free(data);
            return Err(MemError::AllocationFailed(err));
        }

        if let Some(src) = src {
            if (src.len() as i64) < size_bytes {
                self.service.free(data);
                return Err(MemError::InvalidArgument(
                    "source shorter than size_bytes",
                ));
            }
            let src = &src[..size_bytes as usize];
            if let Err(err) = self.service.copy_host_to_device(data, 0, src, stream) {
                self.service.free(data);
                return Err(MemError::TransferFailed(err));
            }
        }

        self.storage = Storage::Owned(data);
        self.size_bytes = size_bytes;
        self.device_id = device_id;
        trace!(device_id, size_bytes, "allocated owned buffer");
        Ok(())
    }

    /// Record a caller-supplied buffer without copying or allocating.
    ///
    /// The block never frees this memory; its external owner must
    /// outlive the borrow. Any previously owned buffer is released.
    pub fn attach(
        &mut self,
        device_id: i32,
        external: DeviceRef,
        size_bytes: i64,
    ) -> Result<(), MemError> {
        if size_bytes <= 0 {
            return Err(MemError::InvalidArgument("size_bytes must be positive"));
        }

        self.release();

        self.storage = Storage::Borrowed(external);
        self.size_bytes = size_bytes;
        self.device_id = device_id;
        trace!(device_id, size_bytes, "attached borrowed buffer");
        Ok(())
    }

    /// Clear the block, returning an owned buffer to the service.
    /// Idempotent; borrowed memory is never freed.
    pub fn release(&mut self) {
        if let Storage::Owned(data) = self.storage {
            self.service.free(data);
            trace!(size_bytes = self.size_bytes, "released owned buffer");
        }
        self.storage = Storage::Empty;
        self.size_bytes = 0;
        self.device_id = -1;
    }

    /// Copy the first `size_bytes` of the buffer into `dst`,
    /// device to host, synchronously.
    pub fn read(&self, size_bytes: i64, dst: &mut [u8]) -> Result<(), MemError> {
        let data = self.populated()?;
        if size_bytes <= 0 || size_bytes > self.size_bytes {
            return Err(MemError::OutOfRange);
        }
        if (dst.len() as i64) < size_bytes {
            return Err(MemError::InvalidArgument(
                "destination shorter than size_bytes",
            ));
        }
        self.service
            .copy_device_to_host(&mut dst[..size_bytes as usize], data)
            .map_err(MemError::TransferFailed)
    }

    /// Copy `size_bytes` from `src` into the buffer, host to device.
    ///
    /// A negative `size_bytes` means the full buffer. When the resolved
    /// size is strictly less than capacity, the whole buffer is zeroed
    /// first so no stale bytes survive past the new write. Enqueued on
    /// `stream` if given, synchronous otherwise.
    pub fn write(
        &mut self,
        size_bytes: i64,
        src: &[u8],
        stream: Option<StreamToken>,
    ) -> Result<(), MemError> {
        let data = self.populated()?;
        let size = if size_bytes < 0 { self.size_bytes } else { size_bytes };
        if size <= 0 || size > self.size_bytes {
            return Err(MemError::OutOfRange);
        }
        if (src.len() as i64) < size {
            return Err(MemError::InvalidArgument("source shorter than size_bytes"));
        }
        if size < self.size_bytes {
            self.service
                .zero(data, self.size_bytes as u64)
                .map_err(MemError::TransferFailed)?;
        }
        self.service
            .copy_host_to_device(data, 0, &src[..size as usize], stream)
            .map_err(MemError::TransferFailed)
    }

    /// Copy `size_bytes` from `src` into the buffer at `offset_bytes`,
    /// synchronously. No zero-fill.
    pub fn write_at(
        &mut self,
        size_bytes: i64,
        src: &[u8],
        offset_bytes: i64,
    ) -> Result<(), MemError> {
        let data = self.populated()?;
        if size_bytes <= 0 || offset_bytes < 0 {
            return Err(MemError::OutOfRange);
        }
        let end = offset_bytes
            .checked_add(size_bytes)
            .ok_or(MemError::OutOfRange)?;
        if end > self.size_bytes {
            return Err(MemError::OutOfRange);
        }
        if (src.len() as i64) < size_bytes {
            return Err(MemError::InvalidArgument("source shorter than size_bytes"));
        }
        self.service
            .copy_host_to_device(data, offset_bytes as u64, &src[..size_bytes as usize], None)
            .map_err(MemError::TransferFailed)
    }

    /// Set every byte of the buffer to `value` (device-side memset).
    pub fn fill(&mut self, value: u8) -> Result<(), MemError> {
        let data = self.populated()?;
        if self.size_bytes == 0 {
            return Err(MemError::NotAllocated);
        }
        self.service
            .memset(data, value, self.size_bytes as u64)
            .map_err(MemError::TransferFailed)
    }

    /// Copy `size_bytes` from `other`'s buffer into this one.
    ///
    /// Same semantics as [`MemoryBlock::write`] with `other` as the
    /// source, routed through a device-to-device copy; the transfer is
    /// never staged through host memory.
    pub fn copy_from(&mut self, size_bytes: i64, other: &MemoryBlock) -> Result<(), MemError> {
        self.copy_from_parts(size_bytes, other.descriptor())
    }

    /// `copy_from` against a snapshot of the source descriptor, so a
    /// source living in another registry needs no live borrow.
    pub(crate) fn copy_from_parts(
        &mut self,
        size_bytes: i64,
        src: Option<(DeviceRef, i64)>,
    ) -> Result<(), MemError> {
        let (src_ref, src_size) = src.ok_or(MemError::NotAllocated)?;
        let data = self.populated()?;
        let size = if size_bytes < 0 { self.size_bytes } else { size_bytes };
        if size > src_size {
            return Err(MemError::OutOfRange);
        }
        if size <= 0 || size > self.size_bytes {
            return Err(MemError::OutOfRange);
        }
        if size < self.size_bytes {
            self.service
                .zero(data, self.size_bytes as u64)
                .map_err(MemError::TransferFailed)?;
        }
        self.service
            .copy_device_to_device(data, src_ref, size as u64, None)
            .map_err(MemError::TransferFailed)
    }
}

impl Drop for MemoryBlock {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for MemoryBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryBlock")
            .field("storage", &self.storage)
            .field("size_bytes", &self.size_bytes)
            .field("device_id", &self.device_id)
            .finish()
    }
}
