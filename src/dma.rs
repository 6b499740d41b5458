// Amazon ENA/EFA Command Queue Core
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! DMA-coherent memory.
//!
//! The core never maps memory itself; it asks a [`DmaAllocator`] for
//! zeroed, device-visible regions and wraps them in [`DmaBuffer`], which
//! returns the region to its allocator on drop.
//!
//! # Safety
//!
//! Regions are shared with the device, which writes them concurrently with
//! the host. All host accesses therefore go through volatile reads/writes at
//! explicit offsets; no Rust reference to the region contents is ever handed
//! out.

use crate::error::{ComError, ComResult};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// A device-visible memory region.
#[derive(Debug)]
pub struct DmaRegion {
    /// Host virtual address.
    pub vaddr: NonNull<u8>,
    /// Address the device uses for the same memory.
    pub dma_addr: u64,
    /// Length in bytes.
    pub len: usize,
}

// SAFETY: a region is plain memory; synchronisation is the owner's job.
unsafe impl Send for DmaRegion {}

/// Allocator for DMA-coherent memory.
pub trait DmaAllocator: Send + Sync {
    /// Allocate `size` zeroed bytes.
    fn alloc(&self, size: usize) -> ComResult<DmaRegion>;

    /// Return a region obtained from `alloc`.
    ///
    /// # Safety
    ///
    /// The device must no longer access the region.
    unsafe fn free(&self, region: DmaRegion);
}

/// Owned DMA region returned to its allocator on drop.
pub struct DmaBuffer {
    region: DmaRegion,
    allocator: Arc<dyn DmaAllocator>,
}

// SAFETY: all accesses are volatile and bounds-checked; concurrent mutation
// is serialised by the rings that own the buffer.
unsafe impl Send for DmaBuffer {}
unsafe impl Sync for DmaBuffer {}

impl DmaBuffer {
    /// Allocate a zeroed buffer.
    pub fn new(allocator: &Arc<dyn DmaAllocator>, size: usize) -> ComResult<Self> {
        let region = allocator.alloc(size)?;
        Ok(Self {
            region,
            allocator: Arc::clone(allocator),
        })
    }

    /// Allocate, retrying once on failure.
    ///
    /// Used for queue memory, where a single transient allocation failure
    /// should not abort queue creation.
    pub fn new_with_retry(allocator: &Arc<dyn DmaAllocator>, size: usize) -> ComResult<Self> {
        match Self::new(allocator, size) {
            Ok(buffer) => Ok(buffer),
            Err(first) => {
                log::warn!("DMA allocation of {} bytes failed ({}), retrying", size, first);
                Self::new(allocator, size).inspect_err(|e| {
                    log::error!("DMA allocation of {} bytes failed: {}", size, e);
                })
            }
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.region.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline]
    pub fn dma_addr(&self) -> u64 {
        self.region.dma_addr
    }

    #[inline]
    pub fn as_ptr(&self) -> *mut u8 {
        self.region.vaddr.as_ptr()
    }

    #[inline]
    fn check(&self, offset: usize, len: usize) {
        assert!(
            offset.checked_add(len).is_some_and(|end| end <= self.len()),
            "DMA access out of bounds: offset {} len {} size {}",
            offset,
            len,
            self.len()
        );
    }

    /// Volatile read of a `T` at `offset`.
    #[inline]
    pub fn read<T: bytemuck::Pod>(&self, offset: usize) -> T {
        self.check(offset, std::mem::size_of::<T>());
        // SAFETY: bounds checked; `T: Pod` accepts any bit pattern.
        unsafe { std::ptr::read_volatile(self.as_ptr().add(offset) as *const T) }
    }

    /// Volatile write of a `T` at `offset`.
    #[inline]
    pub fn write<T: bytemuck::Pod>(&self, offset: usize, value: T) {
        self.check(offset, std::mem::size_of::<T>());
        // SAFETY: bounds checked.
        unsafe { std::ptr::write_volatile(self.as_ptr().add(offset) as *mut T, value) }
    }

    /// Volatile read of one byte.
    #[inline]
    pub fn read_u8(&self, offset: usize) -> u8 {
        self.read::<u8>(offset)
    }

    /// Copy `data` into the buffer at `offset`.
    pub fn write_bytes(&self, offset: usize, data: &[u8]) {
        self.check(offset, data.len());
        for (i, byte) in data.iter().enumerate() {
            // SAFETY: bounds checked above.
            unsafe { std::ptr::write_volatile(self.as_ptr().add(offset + i), *byte) }
        }
    }

    /// Copy `out.len()` bytes from `offset` into `out`.
    pub fn read_bytes(&self, offset: usize, out: &mut [u8]) {
        self.check(offset, out.len());
        for (i, byte) in out.iter_mut().enumerate() {
            // SAFETY: bounds checked above.
            *byte = unsafe { std::ptr::read_volatile(self.as_ptr().add(offset + i)) };
        }
    }

    /// Zero the whole buffer.
    pub fn zero(&self) {
        for i in 0..self.len() {
            // SAFETY: `i < len`.
            unsafe { std::ptr::write_volatile(self.as_ptr().add(i), 0) }
        }
    }
}

impl std::fmt::Debug for DmaBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DmaBuffer")
            .field("dma_addr", &format_args!("{:#x}", self.dma_addr()))
            .field("len", &self.len())
            .finish()
    }
}

impl Drop for DmaBuffer {
    fn drop(&mut self) {
        let region = DmaRegion {
            vaddr: self.region.vaddr,
            dma_addr: self.region.dma_addr,
            len: self.region.len,
        };
        // SAFETY: the owning ring drops its buffers only after the device
        // has been told to stop using them.
        unsafe { self.allocator.free(region) };
    }
}

/// Host-memory allocator where the DMA address equals the virtual address.
///
/// Suitable for IOMMU identity mappings and for the software device model.
/// Tracks live allocations so leaks are observable.
#[derive(Debug, Default)]
pub struct HostDmaAllocator {
    live_regions: AtomicUsize,
    live_bytes: AtomicUsize,
    fail_next: AtomicUsize,
}

impl HostDmaAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of regions currently allocated.
    pub fn live_regions(&self) -> usize {
        self.live_regions.load(Ordering::Acquire)
    }

    /// Bytes currently allocated.
    pub fn live_bytes(&self) -> usize {
        self.live_bytes.load(Ordering::Acquire)
    }

    /// Make the next `count` allocations fail.
    pub fn fail_next(&self, count: usize) {
        self.fail_next.store(count, Ordering::Release);
    }

    fn take_failure(&self) -> bool {
        self.fail_next
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok()
    }

    #[cfg(target_os = "linux")]
    fn map(size: usize) -> Option<NonNull<u8>> {
        // SAFETY: anonymous private mapping, no file descriptor involved.
        let addr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if addr == libc::MAP_FAILED {
            return None;
        }
        NonNull::new(addr as *mut u8)
    }

    #[cfg(target_os = "linux")]
    unsafe fn unmap(ptr: NonNull<u8>, size: usize) {
        libc::munmap(ptr.as_ptr() as *mut libc::c_void, size);
    }

    #[cfg(not(target_os = "linux"))]
    fn layout(size: usize) -> Option<std::alloc::Layout> {
        std::alloc::Layout::from_size_align(size, 4096).ok()
    }

    #[cfg(not(target_os = "linux"))]
    fn map(size: usize) -> Option<NonNull<u8>> {
        let layout = Self::layout(size)?;
        // SAFETY: layout has non-zero size.
        NonNull::new(unsafe { std::alloc::alloc_zeroed(layout) })
    }

    #[cfg(not(target_os = "linux"))]
    unsafe fn unmap(ptr: NonNull<u8>, size: usize) {
        if let Some(layout) = Self::layout(size) {
            std::alloc::dealloc(ptr.as_ptr(), layout);
        }
    }
}

impl DmaAllocator for HostDmaAllocator {
    fn alloc(&self, size: usize) -> ComResult<DmaRegion> {
        if size == 0 {
            return Err(ComError::InvalidParameter("zero-sized DMA allocation".into()));
        }
        if self.take_failure() {
            return Err(ComError::OutOfMemory { size });
        }
        let vaddr = Self::map(size).ok_or(ComError::OutOfMemory { size })?;
        self.live_regions.fetch_add(1, Ordering::AcqRel);
        self.live_bytes.fetch_add(size, Ordering::AcqRel);
        Ok(DmaRegion {
            vaddr,
            dma_addr: vaddr.as_ptr() as u64,
            len: size,
        })
    }

    unsafe fn free(&self, region: DmaRegion) {
        Self::unmap(region.vaddr, region.len);
        self.live_regions.fetch_sub(1, Ordering::AcqRel);
        self.live_bytes.fetch_sub(region.len, Ordering::AcqRel);
    }
}
