//! Memory registry
//!
//! A fixed table mapping integer handles to [`MemoryBlock`] slots.
//! Callers hold small `i64` handles instead of device references; every
//! operation resolves its handle and forwards to the target block.
//!
//! # Handle space
//!
//! Handle `0` is permanently reserved as the null handle. With a table
//! of `capacity` slots, handles in `[1, capacity-1]` resolve to local
//! slots directly, and handles in `[capacity, 2*capacity-1]` delegate
//! `handle - capacity` to a linked registry. The numeric range alone
//! decides locality, so two independent registries can share one handle
//! namespace without either knowing the other's layout, at the cost of
//! one extra indirection per foreign handle.
//!
//! The table never resizes; exhaustion is an explicit error. The
//! registry performs no locking of its own state; the surrounding
//! runtime serializes access to a given instance.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::block::MemoryBlock;
use crate::device::{DeviceMemory, DeviceRef, StreamToken};
use crate::error::MemError;

/// Default slot count; a hard ceiling on outstanding buffers.
pub const CAPACITY: usize = 16 * 1024;

/// Opaque buffer handle. `0` is reserved and never returned.
pub type Handle = i64;

/// A registry shared between its owner and a delegating peer.
pub type SharedRegistry = Arc<Mutex<MemoryRegistry>>;

/// Where a handle points after the range test.
enum Resolved {
    Local(usize),
    Delegated(Handle),
}

/// Fixed-size table of handle-addressed memory blocks.
pub struct MemoryRegistry {
    /// Slot 0 is reserved so a returned handle is never falsy.
    slots: Box<[MemoryBlock]>,
    /// Next slot index to begin the free-slot search from; wraps.
    next_probe: usize,
    /// Bytes currently owned through this registry's own slots.
    total_bytes_used: u64,
    /// Peer registry addressed by the high handle range. Never owned.
    linked: Option<SharedRegistry>,
}

impl MemoryRegistry {
    /// Create a registry with the default [`CAPACITY`].
    pub fn new(service: Arc<dyn DeviceMemory>) -> Self {
        Self::with_capacity(service, CAPACITY)
    }

    /// Create a registry with an explicit slot count, fixed for the
    /// registry's lifetime. `capacity` must be at least 2 (slot 0 is
    /// reserved).
    pub fn with_capacity(service: Arc<dyn DeviceMemory>, capacity: usize) -> Self {
        assert!(capacity >= 2, "capacity must leave room past the reserved slot 0");
        let slots: Box<[MemoryBlock]> = (0..capacity)
            .map(|_| MemoryBlock::new(service.clone()))
            .collect();
        Self {
            slots,
            next_probe: 1,
            total_bytes_used: 0,
            linked: None,
        }
    }

    /// Wrap the registry for sharing with a delegating peer.
    pub fn into_shared(self) -> SharedRegistry {
        Arc::new(Mutex::new(self))
    }

    /// Set the peer registry addressed by the high handle range.
    ///
    /// Administrative, performed once during setup. Links must be
    /// acyclic; the registry never owns its peer.
    pub fn link(&mut self, peer: SharedRegistry) {
        self.linked = Some(peer);
    }

    /// Slot count of the table, independent of occupancy.
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Bytes currently allocated through this registry's own slots.
    /// Borrowed blocks and delegated handles are not counted.
    pub fn total_used(&self) -> u64 {
        self.total_bytes_used
    }

    // -------------------------------------------------------------------------
    // Handle resolution
    // -------------------------------------------------------------------------

    fn classify(&self, handle: Handle) -> Result<Resolved, MemError> {
        let cap = self.slots.len() as i64;
        if handle < 1 || handle >= 2 * cap {
            return Err(MemError::OutOfRange);
        }
        if handle >= cap {
            Ok(Resolved::Delegated(handle - cap))
        } else {
            Ok(Resolved::Local(handle as usize))
        }
    }

    /// Run `f` against the block a handle resolves to, delegating
    /// handles in the high range to the linked registry.
    fn with_block<R>(
        &self,
        handle: Handle,
        f: impl FnOnce(&MemoryBlock) -> Result<R, MemError>,
    ) -> Result<R, MemError> {
        match self.classify(handle)? {
            Resolved::Local(index) => f(&self.slots[index]),
            Resolved::Delegated(handle) => {
                let peer = self.linked.as_ref().ok_or(MemError::OutOfRange)?;
                let peer = peer.lock();
                peer.with_block(handle, f)
            }
        }
    }

    fn with_block_mut<R>(
        &mut self,
        handle: Handle,
        f: impl FnOnce(&mut MemoryBlock) -> Result<R, MemError>,
    ) -> Result<R, MemError> {
        match self.classify(handle)? {
            Resolved::Local(index) => f(&mut self.slots[index]),
            Resolved::Delegated(handle) => {
                let peer = self.linked.as_ref().ok_or(MemError::OutOfRange)?;
                let mut peer = peer.lock();
                peer.with_block_mut(handle, f)
            }
        }
    }

    // -------------------------------------------------------------------------
    // Slot search
    // -------------------------------------------------------------------------

    /// Circular scan over `[1, capacity-1]` starting at the cursor.
    fn find_free_slot(&self) -> Option<usize> {
        let cap = self.slots.len();
        let mut index = self.next_probe;
        for _ in 0..cap - 1 {
            if index == 0 || index >= cap {
                index = 1;
            }
            if self.slots[index].is_free() {
                return Some(index);
            }
            index += 1;
        }
        None
    }

    fn advance_probe(&mut self, used: usize) {
        self.next_probe = if used + 1 >= self.slots.len() { 1 } else { used + 1 };
    }

    // -------------------------------------------------------------------------
    // Operations
    // -------------------------------------------------------------------------

    /// Allocate a zero-initialized buffer of `size_bytes` on
    /// `device_id` in a free slot and return its handle.
    ///
    /// If `src` is supplied, the buffer is populated from it, enqueued
    /// on `stream` if given. Returned handles are always in the local
    /// range `[1, capacity-1]`.
    pub fn allocate(
        &mut self,
        device_id: i32,
        size_bytes: i64,
        src: Option<&[u8]>,
        stream: Option<StreamToken>,
    ) -> Result<Handle, MemError> {
        let index = self.find_free_slot().ok_or(MemError::ResourceExhausted)?;
        self.slots[index].allocate(device_id, size_bytes, src, stream)?;
        self.advance_probe(index);
        self.total_bytes_used += size_bytes as u64;
        debug!(handle = index, device_id, size_bytes, "allocate");
        Ok(index as Handle)
    }

    /// Record caller-supplied device memory in a free slot and return
    /// its handle. Borrowed memory is never freed here and does not
    /// count toward [`MemoryRegistry::total_used`].
    pub fn attach(
        &mut self,
        device_id: i32,
        external: DeviceRef,
        size_bytes: i64,
    ) -> Result<Handle, MemError> {
        let index = self.find_free_slot().ok_or(MemError::ResourceExhausted)?;
        self.slots[index].attach(device_id, external, size_bytes)?;
        self.advance_probe(index);
        debug!(handle = index, device_id, size_bytes, "attach");
        Ok(index as Handle)
    }

    /// Release the block a handle resolves to. Idempotent: freeing an
    /// already-empty slot succeeds. Owned local bytes are subtracted
    /// from this registry's accounting; a delegated free adjusts the
    /// linked registry's accounting instead.
    pub fn free(&mut self, handle: Handle) -> Result<(), MemError> {
        match self.classify(handle)? {
            Resolved::Local(index) => {
                let block = &mut self.slots[index];
                if block.is_owner() {
                    self.total_bytes_used =
                        self.total_bytes_used.saturating_sub(block.size() as u64);
                }
                block.release();
                debug!(handle = index, "free");
                Ok(())
            }
            Resolved::Delegated(handle) => {
                let peer = self.linked.as_ref().ok_or(MemError::OutOfRange)?;
                let mut peer = peer.lock();
                peer.free(handle)
            }
        }
    }

    /// Copy the first `size_bytes` of the addressed buffer into `dst`.
    pub fn read(&self, handle: Handle, size_bytes: i64, dst: &mut [u8]) -> Result<(), MemError> {
        self.with_block(handle, |block| block.read(size_bytes, dst))
    }

    /// Copy `size_bytes` from `src` into the addressed buffer; negative
    /// size means the full buffer, short writes zero-fill the remainder.
    pub fn write(
        &mut self,
        handle: Handle,
        size_bytes: i64,
        src: &[u8],
        stream: Option<StreamToken>,
    ) -> Result<(), MemError> {
        self.with_block_mut(handle, |block| block.write(size_bytes, src, stream))
    }

    /// Copy `size_bytes` from `src` into the addressed buffer at
    /// `offset_bytes`, synchronously.
    pub fn write_at(
        &mut self,
        handle: Handle,
        size_bytes: i64,
        src: &[u8],
        offset_bytes: i64,
    ) -> Result<(), MemError> {
        self.with_block_mut(handle, |block| block.write_at(size_bytes, src, offset_bytes))
    }

    /// Set every byte of the addressed buffer to `value`.
    pub fn fill(&mut self, handle: Handle, value: u8) -> Result<(), MemError> {
        self.with_block_mut(handle, |block| block.fill(value))
    }

    /// Device-to-device copy of `size_bytes` from the buffer at
    /// `src_handle` into the buffer at `dst_handle`.
    ///
    /// The source descriptor is snapshotted first, so either handle may
    /// be delegated without holding two blocks at once.
    pub fn copy(
        &mut self,
        dst_handle: Handle,
        src_handle: Handle,
        size_bytes: i64,
    ) -> Result<(), MemError> {
        let src = self.with_block(src_handle, |block| Ok(block.descriptor()))?;
        self.with_block_mut(dst_handle, |block| block.copy_from_parts(size_bytes, src))
    }

    /// Capacity in bytes of the buffer a handle resolves to.
    pub fn size_of(&self, handle: Handle) -> Result<i64, MemError> {
        self.with_block(handle, |block| {
            if block.is_free() {
                Err(MemError::NotAllocated)
            } else {
                Ok(block.size())
            }
        })
    }

    /// The device reference behind a handle, for handing to `attach` on
    /// a peer registry. The caller must keep the owning handle alive.
    pub fn data_ref(&self, handle: Handle) -> Result<DeviceRef, MemError> {
        self.with_block(handle, |block| {
            block.data_ref().ok_or(MemError::NotAllocated)
        })
    }
}

impl std::fmt::Debug for MemoryRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryRegistry")
            .field("capacity", &self.slots.len())
            .field("next_probe", &self.next_probe)
            .field("total_bytes_used", &self.total_bytes_used)
            .field("linked", &self.linked.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::HostMemory;

    fn registry(capacity: usize) -> (Arc<HostMemory>, MemoryRegistry) {
        let svc = Arc::new(HostMemory::new());
        let reg = MemoryRegistry::with_capacity(svc.clone(), capacity);
        (svc, reg)
    }

    #[test]
    fn test_handles_start_at_one() {
        let (_svc, mut reg) = registry(8);
        let h = reg.allocate(0, 16, None, None).unwrap();
        assert_eq!(h, 1);
        let h2 = reg.allocate(0, 16, None, None).unwrap();
        assert_eq!(h2, 2);
    }

    #[test]
    fn test_handle_zero_rejected_everywhere() {
        let (_svc, mut reg) = registry(8);
        let mut buf = [0u8; 4];
        assert_eq!(reg.free(0), Err(MemError::OutOfRange));
        assert_eq!(reg.read(0, 4, &mut buf), Err(MemError::OutOfRange));
        assert_eq!(reg.write(0, 4, &buf, None), Err(MemError::OutOfRange));
        assert_eq!(reg.write_at(0, 4, &buf, 0), Err(MemError::OutOfRange));
        assert_eq!(reg.fill(0, 1), Err(MemError::OutOfRange));
        assert_eq!(reg.size_of(0), Err(MemError::OutOfRange));
    }

    #[test]
    fn test_handle_range_limits() {
        let (_svc, mut reg) = registry(8);
        // 2*capacity - 1 is the last representable handle
        assert_eq!(reg.free(16), Err(MemError::OutOfRange));
        assert_eq!(reg.free(-3), Err(MemError::OutOfRange));
        // High range without a link fails OutOfRange
        assert_eq!(reg.free(8), Err(MemError::OutOfRange));
        assert_eq!(reg.free(15), Err(MemError::OutOfRange));
    }

    #[test]
    fn test_free_idempotent() {
        let (svc, mut reg) = registry(8);
        let h = reg.allocate(0, 16, None, None).unwrap();
        assert_eq!(svc.live_allocations(), 1);
        reg.free(h).unwrap();
        assert_eq!(svc.live_allocations(), 0);
        // Second free and never-allocated slots are no-op successes
        reg.free(h).unwrap();
        reg.free(5).unwrap();
        assert_eq!(svc.live_allocations(), 0);
    }

    #[test]
    fn test_exhaustion_and_recovery() {
        let (_svc, mut reg) = registry(8);
        let handles: Vec<Handle> = (0..7)
            .map(|_| reg.allocate(0, 8, None, None).unwrap())
            .collect();
        assert_eq!(
            reg.allocate(0, 8, None, None),
            Err(MemError::ResourceExhausted)
        );

        reg.free(handles[3]).unwrap();
        let h = reg.allocate(0, 8, None, None).unwrap();
        assert_eq!(h, handles[3]);
    }

    #[test]
    fn test_probe_wraps_and_reuses_slots() {
        let (_svc, mut reg) = registry(4);
        let h1 = reg.allocate(0, 8, None, None).unwrap();
        let _h2 = reg.allocate(0, 8, None, None).unwrap();
        let _h3 = reg.allocate(0, 8, None, None).unwrap();
        reg.free(h1).unwrap();
        // The cursor wrapped past the last slot back to 1
        let h4 = reg.allocate(0, 8, None, None).unwrap();
        assert_eq!(h4, 1);
    }

    #[test]
    fn test_total_used_accounting() {
        let (_svc, mut reg) = registry(8);
        assert_eq!(reg.total_used(), 0);
        let h1 = reg.allocate(0, 100, None, None).unwrap();
        let h2 = reg.allocate(0, 28, None, None).unwrap();
        assert_eq!(reg.total_used(), 128);

        reg.free(h1).unwrap();
        assert_eq!(reg.total_used(), 28);
        reg.free(h1).unwrap();
        assert_eq!(reg.total_used(), 28);
        reg.free(h2).unwrap();
        assert_eq!(reg.total_used(), 0);
    }

    #[test]
    fn test_attach_not_counted() {
        let (_svc, mut reg) = registry(8);
        let h = reg.allocate(0, 64, None, None).unwrap();
        let external = reg.data_ref(h).unwrap();

        let borrowed = reg.attach(0, external, 64).unwrap();
        assert_eq!(reg.total_used(), 64);
        reg.free(borrowed).unwrap();
        assert_eq!(reg.total_used(), 64);
    }

    #[test]
    fn test_delegation_matches_direct_access() {
        let svc = Arc::new(HostMemory::new());
        let peer = MemoryRegistry::with_capacity(svc.clone(), 8).into_shared();
        let mut reg = MemoryRegistry::with_capacity(svc.clone(), 8);
        reg.link(peer.clone());

        let direct = peer.lock().allocate(0, 16, None, None).unwrap();
        let delegated = direct + 8;

        reg.write(delegated, 16, &[0x3Cu8; 16], None).unwrap();

        let mut via_peer = [0u8; 16];
        peer.lock().read(direct, 16, &mut via_peer).unwrap();
        assert_eq!(via_peer, [0x3Cu8; 16]);

        let mut via_reg = [0u8; 16];
        reg.read(delegated, 16, &mut via_reg).unwrap();
        assert_eq!(via_reg, via_peer);

        assert_eq!(reg.size_of(delegated), Ok(16));

        // Delegated free empties the peer's slot, not the local one
        reg.free(delegated).unwrap();
        assert_eq!(peer.lock().total_used(), 0);
        assert_eq!(
            peer.lock().read(direct, 16, &mut via_peer),
            Err(MemError::NotAllocated)
        );
    }

    #[test]
    fn test_delegated_accounting_stays_remote() {
        let svc = Arc::new(HostMemory::new());
        let peer = MemoryRegistry::with_capacity(svc.clone(), 8).into_shared();
        let mut reg = MemoryRegistry::with_capacity(svc.clone(), 8);
        reg.link(peer.clone());

        let direct = peer.lock().allocate(0, 256, None, None).unwrap();
        assert_eq!(reg.total_used(), 0);
        assert_eq!(peer.lock().total_used(), 256);

        reg.free(direct + 8).unwrap();
        assert_eq!(peer.lock().total_used(), 0);
        assert_eq!(reg.total_used(), 0);
    }

    #[test]
    fn test_copy_across_registries() {
        let svc = Arc::new(HostMemory::new());
        let peer = MemoryRegistry::with_capacity(svc.clone(), 8).into_shared();
        let mut reg = MemoryRegistry::with_capacity(svc.clone(), 8);
        reg.link(peer.clone());

        let remote = peer.lock().allocate(0, 16, Some(&[0x9Du8; 16]), None).unwrap();
        let local = reg.allocate(0, 16, None, None).unwrap();

        reg.copy(local, remote + 8, 16).unwrap();

        let mut out = [0u8; 16];
        reg.read(local, 16, &mut out).unwrap();
        assert_eq!(out, [0x9Du8; 16]);
    }

    #[test]
    fn test_allocation_failure_leaves_slot_reusable() {
        let (svc, mut reg) = registry(8);
        svc.fail_next_alloc(2);
        assert!(matches!(
            reg.allocate(0, 16, None, None),
            Err(MemError::AllocationFailed(_))
        ));
        assert_eq!(reg.total_used(), 0);
        // The probed slot stayed free
        let h = reg.allocate(0, 16, None, None).unwrap();
        assert_eq!(h, 1);
    }
}
