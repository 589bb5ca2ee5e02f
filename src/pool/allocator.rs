//! Memory providers backing a [`BufferPool`](super::BufferPool).

use std::alloc::{self, Layout};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use crate::errors::{Error, Result};

pub fn page_size() -> usize {
    // SAFETY: sysconf has no preconditions.
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size <= 0 { 4096 } else { size as usize }
}

/// One provider allocation. Freed when dropped.
pub struct MemoryChunk {
    base: NonNull<u8>,
    layout: Layout,
    logical_base: Option<u64>,
}

// SAFETY: the chunk exclusively owns its allocation.
unsafe impl Send for MemoryChunk {}
unsafe impl Sync for MemoryChunk {}

impl MemoryChunk {
    fn allocate(size: usize, alignment: usize, logical_base: Option<u64>) -> Result<Self> {
        if size == 0 {
            return Err(Error::InvalidParameter("empty memory chunk"));
        }
        let layout = Layout::from_size_align(size, alignment)
            .map_err(|_| Error::InvalidParameter("invalid chunk layout"))?;
        // SAFETY: layout has a non-zero size.
        let base = unsafe { alloc::alloc_zeroed(layout) };
        let base = NonNull::new(base).ok_or(Error::InsufficientResources("chunk allocation"))?;
        Ok(Self {
            base,
            layout,
            logical_base,
        })
    }

    pub fn base(&self) -> NonNull<u8> {
        self.base
    }

    pub fn size(&self) -> usize {
        self.layout.size()
    }

    pub fn logical_base(&self) -> Option<u64> {
        self.logical_base
    }

    pub(crate) fn contains(&self, address: usize) -> bool {
        let base = self.base.as_ptr() as usize;
        address >= base && address < base + self.size()
    }
}

impl Drop for MemoryChunk {
    fn drop(&mut self) {
        // SAFETY: allocated in `allocate` with this exact layout.
        unsafe { alloc::dealloc(self.base.as_ptr(), self.layout) }
    }
}

impl std::fmt::Debug for MemoryChunk {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryChunk")
            .field("base", &self.base)
            .field("size", &self.size())
            .field("logical_base", &self.logical_base)
            .finish()
    }
}

pub trait BufferVectorAllocator: Send + Sync {
    /// Largest chunk this provider is willing to hand out.
    fn max_chunk_size(&self) -> usize;

    fn is_dma_capable(&self) -> bool;

    fn allocate_chunk(&self, size: usize, alignment: usize) -> Result<MemoryChunk>;
}

/// Plain page-aligned heap memory, not addressable by a device.
#[derive(Debug)]
pub struct NonPagedAllocator {
    max_chunk_size: usize,
}

impl NonPagedAllocator {
    pub fn new(max_chunk_size: usize) -> Self {
        Self { max_chunk_size }
    }
}

impl Default for NonPagedAllocator {
    fn default() -> Self {
        Self::new(4 * 1024 * 1024)
    }
}

impl BufferVectorAllocator for NonPagedAllocator {
    fn max_chunk_size(&self) -> usize {
        self.max_chunk_size
    }

    fn is_dma_capable(&self) -> bool {
        false
    }

    fn allocate_chunk(&self, size: usize, alignment: usize) -> Result<MemoryChunk> {
        MemoryChunk::allocate(size, alignment.max(page_size()), None)
    }
}

/// Heap memory with device logical addresses drawn from an IOVA window
/// `[window_base, max_logical_address]`.
#[derive(Debug)]
pub struct DmaAllocator {
    max_chunk_size: usize,
    max_logical_address: u64,
    next_logical: AtomicU64,
}

impl DmaAllocator {
    pub const DEFAULT_WINDOW_BASE: u64 = 0x1000_0000;

    pub fn new(max_chunk_size: usize, max_logical_address: u64) -> Self {
        Self::with_window_base(max_chunk_size, max_logical_address, Self::DEFAULT_WINDOW_BASE)
    }

    pub fn with_window_base(
        max_chunk_size: usize,
        max_logical_address: u64,
        window_base: u64,
    ) -> Self {
        Self {
            max_chunk_size,
            max_logical_address,
            next_logical: AtomicU64::new(window_base),
        }
    }

    fn reserve_logical(&self, size: usize, alignment: usize) -> Result<u64> {
        let size = size as u64;
        let alignment = alignment as u64;
        let mut current = self.next_logical.load(Ordering::Relaxed);
        loop {
            let start = (current + alignment - 1) & !(alignment - 1);
            let end = start
                .checked_add(size)
                .ok_or(Error::InsufficientResources("logical address space"))?;
            if end - 1 > self.max_logical_address {
                return Err(Error::InsufficientResources("logical address space"));
            }
            match self.next_logical.compare_exchange_weak(
                current,
                end,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return Ok(start),
                Err(actual) => current = actual,
            }
        }
    }
}

impl BufferVectorAllocator for DmaAllocator {
    fn max_chunk_size(&self) -> usize {
        self.max_chunk_size
    }

    fn is_dma_capable(&self) -> bool {
        true
    }

    fn allocate_chunk(&self, size: usize, alignment: usize) -> Result<MemoryChunk> {
        let alignment = alignment.max(page_size());
        let logical = self.reserve_logical(size, alignment)?;
        MemoryChunk::allocate(size, alignment, Some(logical))
    }
}

/// Wraps another provider and refuses chunks above `largest_chunk` or past
/// a total byte budget. Used to exercise negotiation paths.
pub struct ConstrainedAllocator<A> {
    inner: A,
    largest_chunk: usize,
    remaining: AtomicUsize,
}

impl<A: BufferVectorAllocator> ConstrainedAllocator<A> {
    pub fn new(inner: A, largest_chunk: usize, budget: usize) -> Self {
        Self {
            inner,
            largest_chunk,
            remaining: AtomicUsize::new(budget),
        }
    }
}

impl<A: BufferVectorAllocator> BufferVectorAllocator for ConstrainedAllocator<A> {
    fn max_chunk_size(&self) -> usize {
        self.inner.max_chunk_size()
    }

    fn is_dma_capable(&self) -> bool {
        self.inner.is_dma_capable()
    }

    fn allocate_chunk(&self, size: usize, alignment: usize) -> Result<MemoryChunk> {
        if size > self.largest_chunk {
            return Err(Error::InsufficientResources("chunk larger than provider allows"));
        }
        self.remaining
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |left| {
                left.checked_sub(size)
            })
            .map_err(|_| Error::InsufficientResources("provider budget exhausted"))?;
        self.inner.allocate_chunk(size, alignment)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dma_chunks_get_disjoint_logical_ranges() {
        let allocator = DmaAllocator::new(1 << 16, u32::MAX as u64);
        let a = allocator.allocate_chunk(8192, 64).unwrap();
        let b = allocator.allocate_chunk(8192, 64).unwrap();
        let (a, b) = (a.logical_base().unwrap(), b.logical_base().unwrap());
        assert!(b >= a + 8192);
        assert_eq!(a % page_size() as u64, 0);
    }

    #[test]
    fn dma_window_exhaustion_is_recoverable() {
        let allocator = DmaAllocator::with_window_base(1 << 16, 0x1_ffff, 0x1_0000);
        assert!(allocator.allocate_chunk(0x1_0000, 4096).is_ok());
        let err = allocator.allocate_chunk(4096, 4096).unwrap_err();
        assert!(err.is_resource_exhaustion());
    }

    #[test]
    fn constrained_allocator_enforces_limits() {
        let allocator = ConstrainedAllocator::new(NonPagedAllocator::default(), 8192, 12288);
        assert!(allocator.allocate_chunk(16384, 64).is_err());
        assert!(allocator.allocate_chunk(8192, 64).is_ok());
        assert!(allocator.allocate_chunk(8192, 64).is_err());
        assert!(allocator.allocate_chunk(4096, 64).is_ok());
    }
}
