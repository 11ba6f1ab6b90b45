//! Linkage-level surface for an embedding host process
//!
//! The registry is consumed across a process/runtime boundary: the host
//! holds `i64` instance ids and buffer handles, passes raw byte buffers,
//! and receives signed status codes (`0` success, nonzero failure; see
//! [`crate::error::status`]). Handles out-parameters follow the
//! `long* phHandle` convention.
//!
//! Registries are created on the Rust side (they need a concrete
//! [`crate::device::DeviceMemory`] service) and published to the host
//! through a process-global instance table. Raw pointers exist only in
//! this module; the null checks live here.
//!
//! `attach` is deliberately absent: a `DeviceRef` is minted by the
//! device service and cannot be fabricated by the host side.

use std::collections::HashMap;
use std::slice;
use std::sync::atomic::{AtomicI64, Ordering};

use once_cell::sync::Lazy;
use parking_lot::RwLock;

use crate::device::StreamToken;
use crate::error::{status, MemError};
use crate::registry::{Handle, SharedRegistry};

static NEXT_INSTANCE: AtomicI64 = AtomicI64::new(1);

/// Registries published to the embedding host, by instance id.
static INSTANCES: Lazy<RwLock<HashMap<i64, SharedRegistry>>> =
    Lazy::new(|| RwLock::new(HashMap::new()));

/// Publish a registry to the embedding host; returns its instance id.
pub fn register_instance(registry: SharedRegistry) -> i64 {
    let id = NEXT_INSTANCE.fetch_add(1, Ordering::Relaxed);
    INSTANCES.write().insert(id, registry);
    id
}

/// Withdraw a published registry. Returns false for an unknown id.
///
/// Outstanding owned buffers are released when the last reference to
/// the registry drops.
pub fn unregister_instance(id: i64) -> bool {
    INSTANCES.write().remove(&id).is_some()
}

fn instance(id: i64) -> Option<SharedRegistry> {
    INSTANCES.read().get(&id).cloned()
}

fn status_of(result: Result<(), MemError>) -> i64 {
    match result {
        Ok(()) => status::OK,
        Err(err) => err.status(),
    }
}

/// Stream tokens cross the boundary as raw ids; `0` means "no stream".
fn stream_from(raw: u64) -> Option<StreamToken> {
    (raw != 0).then(|| StreamToken::new(raw))
}

/// Allocate a zero-initialized buffer and store its handle in
/// `out_handle`. A null `src` allocates without an initial copy.
///
/// # Safety
///
/// `src`, when non-null, must be valid for `size_bytes` bytes;
/// `out_handle` must be a valid writable pointer.
#[no_mangle]
pub unsafe extern "C" fn devmem_allocate(
    instance_id: i64,
    device_id: i32,
    size_bytes: i64,
    src: *const u8,
    stream: u64,
    out_handle: *mut i64,
) -> i64 {
    if out_handle.is_null() {
        return status::INVALID_ARGUMENT;
    }
    if size_bytes <= 0 {
        return status::INVALID_ARGUMENT;
    }
    let Some(registry) = instance(instance_id) else {
        return status::UNKNOWN_INSTANCE;
    };
    let src = if src.is_null() {
        None
    } else {
        Some(slice::from_raw_parts(src, size_bytes as usize))
    };
    let rc = match registry
        .lock()
        .allocate(device_id, size_bytes, src, stream_from(stream))
    {
        Ok(handle) => {
            *out_handle = handle;
            status::OK
        }
        Err(err) => err.status(),
    };
    rc
}

/// Release the buffer behind `handle`. Idempotent.
#[no_mangle]
pub extern "C" fn devmem_free(instance_id: i64, handle: Handle) -> i64 {
    let Some(registry) = instance(instance_id) else {
        return status::UNKNOWN_INSTANCE;
    };
    let rc = status_of(registry.lock().free(handle));
    rc
}

/// Copy the first `size_bytes` of the buffer behind `handle` into `dst`.
///
/// # Safety
///
/// `dst` must be valid for `size_bytes` writable bytes.
#[no_mangle]
pub unsafe extern "C" fn devmem_read(
    instance_id: i64,
    handle: Handle,
    size_bytes: i64,
    dst: *mut u8,
) -> i64 {
    if dst.is_null() {
        return status::INVALID_ARGUMENT;
    }
    if size_bytes <= 0 {
        return status::OUT_OF_RANGE;
    }
    let Some(registry) = instance(instance_id) else {
        return status::UNKNOWN_INSTANCE;
    };
    let dst = slice::from_raw_parts_mut(dst, size_bytes as usize);
    let rc = status_of(registry.lock().read(handle, size_bytes, dst));
    rc
}

/// Copy `size_bytes` from `src` into the buffer behind `handle`. A
/// negative `size_bytes` writes the buffer's full capacity; short
/// writes zero-fill the remainder.
///
/// # Safety
///
/// `src` must be valid for the resolved byte count (the buffer's
/// capacity when `size_bytes` is negative).
#[no_mangle]
pub unsafe extern "C" fn devmem_write(
    instance_id: i64,
    handle: Handle,
    size_bytes: i64,
    src: *const u8,
    stream: u64,
) -> i64 {
    if src.is_null() {
        return status::INVALID_ARGUMENT;
    }
    let Some(registry) = instance(instance_id) else {
        return status::UNKNOWN_INSTANCE;
    };
    let mut registry = registry.lock();
    // Negative size addresses the full buffer; the slice needs the
    // resolved count up front.
    let resolved = if size_bytes < 0 {
        match registry.size_of(handle) {
            Ok(capacity) => capacity,
            Err(err) => return err.status(),
        }
    } else {
        size_bytes
    };
    if resolved <= 0 {
        return status::OUT_OF_RANGE;
    }
    let src = slice::from_raw_parts(src, resolved as usize);
    status_of(registry.write(handle, resolved, src, stream_from(stream)))
}

/// Copy `size_bytes` from `src` into the buffer behind `handle` at
/// `offset_bytes`, synchronously.
///
/// # Safety
///
/// `src` must be valid for `size_bytes` bytes.
#[no_mangle]
pub unsafe extern "C" fn devmem_write_at(
    instance_id: i64,
    handle: Handle,
    size_bytes: i64,
    src: *const u8,
    offset_bytes: i64,
) -> i64 {
    if src.is_null() {
        return status::INVALID_ARGUMENT;
    }
    if size_bytes <= 0 {
        return status::OUT_OF_RANGE;
    }
    let Some(registry) = instance(instance_id) else {
        return status::UNKNOWN_INSTANCE;
    };
    let src = slice::from_raw_parts(src, size_bytes as usize);
    let rc = status_of(
        registry
            .lock()
            .write_at(handle, size_bytes, src, offset_bytes),
    );
    rc
}

/// Set every byte of the buffer behind `handle` to `value`'s low byte.
#[no_mangle]
pub extern "C" fn devmem_fill(instance_id: i64, handle: Handle, value: i32) -> i64 {
    let Some(registry) = instance(instance_id) else {
        return status::UNKNOWN_INSTANCE;
    };
    let rc = status_of(registry.lock().fill(handle, value as u8));
    rc
}

/// Device-to-device copy of `size_bytes` between two handles.
#[no_mangle]
pub extern "C" fn devmem_copy(
    instance_id: i64,
    dst_handle: Handle,
    src_handle: Handle,
    size_bytes: i64,
) -> i64 {
    let Some(registry) = instance(instance_id) else {
        return status::UNKNOWN_INSTANCE;
    };
    let rc = status_of(registry.lock().copy(dst_handle, src_handle, size_bytes));
    rc
}

/// Store the registry's owned-byte total in `out_bytes`.
///
/// # Safety
///
/// `out_bytes` must be a valid writable pointer.
#[no_mangle]
pub unsafe extern "C" fn devmem_total_used(instance_id: i64, out_bytes: *mut u64) -> i64 {
    if out_bytes.is_null() {
        return status::INVALID_ARGUMENT;
    }
    let Some(registry) = instance(instance_id) else {
        return status::UNKNOWN_INSTANCE;
    };
    *out_bytes = registry.lock().total_used();
    status::OK
}

/// Store the registry's slot capacity in `out_capacity`.
///
/// # Safety
///
/// `out_capacity` must be a valid writable pointer.
#[no_mangle]
pub unsafe extern "C" fn devmem_capacity(instance_id: i64, out_capacity: *mut i64) -> i64 {
    if out_capacity.is_null() {
        return status::INVALID_ARGUMENT;
    }
    let Some(registry) = instance(instance_id) else {
        return status::UNKNOWN_INSTANCE;
    };
    *out_capacity = registry.lock().capacity() as i64;
    status::OK
}
