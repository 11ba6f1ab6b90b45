//! Device-memory service boundary
//!
//! The registry never sees raw device pointers. It talks to an opaque
//! allocator/copy-engine through the [`DeviceMemory`] trait, addressing
//! buffers by service-minted [`DeviceRef`] tokens. Copies that take a
//! [`StreamToken`] may return once the transfer is enqueued; ordering
//! and completion are owned by the service.
//!
//! [`HostMemory`] is an in-process implementation backed by host
//! allocations. It drives the test suite and the bench, and serves
//! embedders running without an accelerator.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::error::DeviceError;

/// Opaque reference to a device-resident buffer.
///
/// Minted by a [`DeviceMemory`] implementation; never a raw pointer and
/// never dereferenced by this crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceRef(u64);

impl DeviceRef {
    /// Wrap a service-native identifier.
    pub fn from_raw(raw: u64) -> Self {
        DeviceRef(raw)
    }

    /// The service-native identifier.
    pub fn as_raw(self) -> u64 {
        self.0
    }
}

/// Opaque ordering context for asynchronous transfers.
///
/// A copy issued with a stream token becomes ordered on that stream and
/// the call returns once the transfer is enqueued. Completion must be
/// awaited through the service's own contract; there is no cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamToken(u64);

impl StreamToken {
    /// Wrap a service-native stream identifier.
    pub fn new(id: u64) -> Self {
        StreamToken(id)
    }

    /// The service-native stream identifier.
    pub fn id(self) -> u64 {
        self.0
    }
}

/// The opaque device allocator and copy engine.
///
/// Errors are native status codes wrapped in [`DeviceError`] and
/// forwarded to callers unchanged.
pub trait DeviceMemory: Send + Sync {
    /// Allocate `bytes` of device memory on `device_id`.
    ///
    /// The returned buffer's contents are unspecified; callers that need
    /// zeroed memory must follow up with [`DeviceMemory::zero`].
    fn allocate(&self, device_id: i32, bytes: u64) -> Result<DeviceRef, DeviceError>;

    /// Return a buffer to the service. Infallible by contract.
    fn free(&self, data: DeviceRef);

    /// Set every byte of the buffer's first `bytes` to `value`.
    fn memset(&self, data: DeviceRef, value: u8, bytes: u64) -> Result<(), DeviceError>;

    /// Zero the buffer's first `bytes`.
    fn zero(&self, data: DeviceRef, bytes: u64) -> Result<(), DeviceError> {
        self.memset(data, 0, bytes)
    }

    /// Copy `src` into the buffer starting at `dst_offset` bytes.
    ///
    /// With a stream token the copy is enqueued on that stream and the
    /// call may return before it completes; without one it blocks until
    /// the copy is done.
    fn copy_host_to_device(
        &self,
        dst: DeviceRef,
        dst_offset: u64,
        src: &[u8],
        stream: Option<StreamToken>,
    ) -> Result<(), DeviceError>;

    /// Copy `dst.len()` bytes from the start of the buffer into `dst`.
    /// Always synchronous.
    fn copy_device_to_host(&self, dst: &mut [u8], src: DeviceRef) -> Result<(), DeviceError>;

    /// Copy `bytes` from the start of `src` to the start of `dst`,
    /// device side.
    fn copy_device_to_device(
        &self,
        dst: DeviceRef,
        src: DeviceRef,
        bytes: u64,
        stream: Option<StreamToken>,
    ) -> Result<(), DeviceError>;
}

// =============================================================================
// Host-backed implementation
// =============================================================================

/// Native code `HostMemory` reports for an unknown ref or a short buffer.
pub const HOST_ERR_INVALID: i64 = 1;
/// Native code `HostMemory` reports for an allocation failure.
pub const HOST_ERR_NO_MEMORY: i64 = 2;

/// In-process [`DeviceMemory`] backed by host allocations.
///
/// "Async" transfers complete at enqueue time; a stream token is an
/// ordering label only. Fault injection (`fail_next_alloc`,
/// `fail_next_copy`) exists so rollback paths can be exercised.
pub struct HostMemory {
    store: Mutex<HashMap<u64, Box<[u8]>>>,
    next_ref: AtomicU64,
    // 0 = no injected failure
    fail_alloc: AtomicI64,
    fail_copy: AtomicI64,
}

impl HostMemory {
    pub fn new() -> Self {
        Self {
            store: Mutex::new(HashMap::new()),
            next_ref: AtomicU64::new(1),
            fail_alloc: AtomicI64::new(0),
            fail_copy: AtomicI64::new(0),
        }
    }

    /// Number of buffers currently held by the backend.
    pub fn live_allocations(&self) -> usize {
        self.store.lock().len()
    }

    /// Fail the next `allocate` call with the given native code.
    pub fn fail_next_alloc(&self, code: i64) {
        self.fail_alloc.store(code, Ordering::SeqCst);
    }

    /// Fail the next copy or memset call with the given native code.
    pub fn fail_next_copy(&self, code: i64) {
        self.fail_copy.store(code, Ordering::SeqCst);
    }

    fn take_injected(&self, slot: &AtomicI64) -> Option<DeviceError> {
        let code = slot.swap(0, Ordering::SeqCst);
        (code != 0).then(|| DeviceError(code))
    }
}

impl Default for HostMemory {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceMemory for HostMemory {
    fn allocate(&self, _device_id: i32, bytes: u64) -> Result<DeviceRef, DeviceError> {
        if let Some(err) = self.take_injected(&self.fail_alloc) {
            return Err(err);
        }
        if bytes == 0 {
            return Err(DeviceError(HOST_ERR_INVALID));
        }
        let raw = self.next_ref.fetch_add(1, Ordering::Relaxed);
        let buf = vec![0u8; bytes as usize].into_boxed_slice();
        self.store.lock().insert(raw, buf);
        Ok(DeviceRef(raw))
    }

    fn free(&self, data: DeviceRef) {
        self.store.lock().remove(&data.0);
    }

    fn memset(&self, data: DeviceRef, value: u8, bytes: u64) -> Result<(), DeviceError> {
        if let Some(err) = self.take_injected(&self.fail_copy) {
            return Err(err);
        }
        let mut store = self.store.lock();
        let buf = store.get_mut(&data.0).ok_or(DeviceError(HOST_ERR_INVALID))?;
        let bytes = bytes as usize;
        if bytes > buf.len() {
            return Err(DeviceError(HOST_ERR_INVALID));
        }
        buf[..bytes].fill(value);
        Ok(())
    }

    fn copy_host_to_device(
        &self,
        dst: DeviceRef,
        dst_offset: u64,
        src: &[u8],
        _stream: Option<StreamToken>,
    ) -> Result<(), DeviceError> {
        if let Some(err) = self.take_injected(&self.fail_copy) {
            return Err(err);
        }
        let mut store = self.store.lock();
        let buf = store.get_mut(&dst.0).ok_or(DeviceError(HOST_ERR_INVALID))?;
        let start = dst_offset as usize;
        let end = start
            .checked_add(src.len())
            .ok_or(DeviceError(HOST_ERR_INVALID))?;
        if end > buf.len() {
            return Err(DeviceError(HOST_ERR_INVALID));
        }
        buf[start..end].copy_from_slice(src);
        Ok(())
    }

    fn copy_device_to_host(&self, dst: &mut [u8], src: DeviceRef) -> Result<(), DeviceError> {
        if let Some(err) = self.take_injected(&self.fail_copy) {
            return Err(err);
        }
        let store = self.store.lock();
        let buf = store.get(&src.0).ok_or(DeviceError(HOST_ERR_INVALID))?;
        if dst.len() > buf.len() {
            return Err(DeviceError(HOST_ERR_INVALID));
        }
        dst.copy_from_slice(&buf[..dst.len()]);
        Ok(())
    }

    fn copy_device_to_device(
        &self,
        dst: DeviceRef,
        src: DeviceRef,
        bytes: u64,
        _stream: Option<StreamToken>,
    ) -> Result<(), DeviceError> {
        if let Some(err) = self.take_injected(&self.fail_copy) {
            return Err(err);
        }
        let bytes = bytes as usize;
        let mut store = self.store.lock();
        // Clone the source range first so dst == src stays well-defined.
        let data = {
            let sbuf = store.get(&src.0).ok_or(DeviceError(HOST_ERR_INVALID))?;
            if bytes > sbuf.len() {
                return Err(DeviceError(HOST_ERR_INVALID));
            }
            sbuf[..bytes].to_vec()
        };
        let dbuf = store.get_mut(&dst.0).ok_or(DeviceError(HOST_ERR_INVALID))?;
        if bytes > dbuf.len() {
            return Err(DeviceError(HOST_ERR_INVALID));
        }
        dbuf[..bytes].copy_from_slice(&data);
        Ok(())
    }
}
