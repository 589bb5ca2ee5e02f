//! Fixed-size buffers carved out of provider memory chunks.
//!
//! Chunks are stitched into one logical extent; buffer `i` of the pool sits
//! at a fixed offset in that extent. Allocation state is a bitmap scanned
//! first-fit from a rotating hint under a dedicated lock. Each buffer also
//! carries a reference count so a receive buffer can be shared between the
//! ring and the OS; it returns to the bitmap when the count reaches zero.

pub mod allocator;
mod dispatch;

use std::ptr::NonNull;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use log::{debug, warn};
use parking_lot::Mutex;

use crate::errors::{Error, Result};
use crate::util::{align_up, unlikely};

pub use allocator::{
    BufferVectorAllocator, ConstrainedAllocator, DmaAllocator, MemoryChunk, NonPagedAllocator,
};
pub use dispatch::{DmaLimits, PoolConfig, PoolDispatch, PoolHandle, SerializationMode, create_pool};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BufferDescriptor {
    pub index: u32,
    pub virtual_address: NonNull<u8>,
    pub logical_address: Option<u64>,
    /// Offset of the buffer inside the pool's logical extent.
    pub offset: u64,
    pub size: u32,
}

// SAFETY: a descriptor is an address triple; access goes through the pool.
unsafe impl Send for BufferDescriptor {}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PoolGrant {
    pub buffer_count: u32,
    pub buffer_size: usize,
    pub chunk_size: usize,
}

struct Chunk {
    memory: MemoryChunk,
    first_buffer: u32,
    buffer_count: u32,
    extent_offset: u64,
}

#[derive(Clone, Copy, Debug, Default)]
struct Geometry {
    buffer_size: usize,
    stride: usize,
    alignment: usize,
    alignment_offset: usize,
}

struct Bitmap {
    words: Vec<u64>,
    len: usize,
    free: usize,
    hint: usize,
}

impl Bitmap {
    fn new() -> Self {
        Self {
            words: Vec::new(),
            len: 0,
            free: 0,
            hint: 0,
        }
    }

    fn grow(&mut self, additional: usize) {
        self.len += additional;
        self.free += additional;
        self.words.resize(self.len.div_ceil(64), 0);
    }

    fn allocate(&mut self) -> Option<usize> {
        if self.free == 0 {
            return None;
        }
        let nwords = self.words.len();
        for step in 0..nwords {
            let w = (self.hint + step) % nwords;
            let mut candidates = !self.words[w];
            if w == nwords - 1 && self.len % 64 != 0 {
                candidates &= (1u64 << (self.len % 64)) - 1;
            }
            if candidates != 0 {
                let bit = candidates.trailing_zeros() as usize;
                self.words[w] |= 1 << bit;
                self.free -= 1;
                self.hint = w;
                return Some(w * 64 + bit);
            }
        }
        None
    }

    fn release(&mut self, index: usize) {
        let (w, bit) = (index / 64, index % 64);
        if unlikely(self.words[w] & (1 << bit) == 0) {
            panic!("buffer {index} freed twice");
        }
        self.words[w] &= !(1 << bit);
        self.free += 1;
    }
}

pub struct BufferPool {
    allocator: Arc<dyn BufferVectorAllocator>,
    chunks: Vec<Chunk>,
    /// Chunk indices sorted by base address.
    by_address: Vec<usize>,
    geometry: Geometry,
    bitmap: Mutex<Bitmap>,
    refcounts: Vec<AtomicU32>,
}

// SAFETY: chunk memory is only reached through buffer indices whose
// ownership is tracked by the bitmap and reference counts.
unsafe impl Send for BufferPool {}
unsafe impl Sync for BufferPool {}

impl BufferPool {
    pub fn new(allocator: Arc<dyn BufferVectorAllocator>) -> Self {
        Self {
            allocator,
            chunks: Vec::new(),
            by_address: Vec::new(),
            geometry: Geometry::default(),
            bitmap: Mutex::new(Bitmap::new()),
            refcounts: Vec::new(),
        }
    }

    /// Sets the buffer geometry and allocates up to `pool_size` buffers.
    ///
    /// Every buffer address is congruent to `alignment_offset` modulo
    /// `alignment`. The chunk size starts at the provider maximum and is
    /// halved whenever the provider refuses a chunk; the pool is granted
    /// whatever was obtained once the chunk size can no longer hold a
    /// buffer.
    pub fn initialize(
        &mut self,
        pool_size: u32,
        requested_buffer_size: usize,
        alignment_offset: usize,
        alignment: usize,
    ) -> Result<PoolGrant> {
        if pool_size == 0 || requested_buffer_size == 0 {
            return Err(Error::InvalidParameter("empty pool"));
        }
        if !alignment.is_power_of_two() {
            return Err(Error::InvalidParameter("buffer alignment is not a power of two"));
        }
        if alignment_offset >= alignment {
            return Err(Error::InvalidParameter("alignment offset not below alignment"));
        }
        if !self.chunks.is_empty() {
            return Err(Error::InvalidState("pool already initialized"));
        }

        let stride = align_up(requested_buffer_size + alignment_offset, alignment);
        self.geometry = Geometry {
            buffer_size: requested_buffer_size,
            stride,
            alignment,
            alignment_offset,
        };

        let round_down = |bytes: usize| bytes / stride * stride;
        let wanted = stride * pool_size as usize;
        let mut chunk_size = round_down(self.allocator.max_chunk_size().min(wanted));
        let mut min_chunk_size = chunk_size;
        let mut chunks = Vec::new();
        let mut obtained = 0usize;

        while obtained < wanted && chunk_size >= stride {
            let size = chunk_size.min(round_down(wanted - obtained).max(stride));
            match self.allocator.allocate_chunk(size, alignment) {
                Ok(chunk) => {
                    obtained += size;
                    min_chunk_size = min_chunk_size.min(size);
                    chunks.push(chunk);
                }
                Err(err) => {
                    debug!("chunk of {size} bytes refused ({err}), halving");
                    chunk_size = round_down(chunk_size / 2);
                }
            }
        }

        if chunks.is_empty() {
            return Err(Error::InsufficientResources("no chunk size satisfies the pool"));
        }
        self.add_memory_chunks(chunks)?;

        let grant = PoolGrant {
            buffer_count: self.capacity(),
            buffer_size: requested_buffer_size,
            chunk_size: min_chunk_size,
        };
        if grant.buffer_count < pool_size {
            warn!(
                "buffer pool granted {} of {} buffers",
                grant.buffer_count, pool_size
            );
        }
        Ok(grant)
    }

    /// Appends provider chunks to the logical extent.
    pub fn add_memory_chunks(&mut self, chunks: Vec<MemoryChunk>) -> Result<()> {
        let Geometry {
            stride, alignment, ..
        } = self.geometry;
        if stride == 0 {
            return Err(Error::InvalidState("pool geometry not set"));
        }
        for chunk in &chunks {
            if chunk.size() % stride != 0 {
                return Err(Error::InvalidParameter(
                    "chunk size is not a multiple of the buffer stride",
                ));
            }
            if chunk.base().as_ptr() as usize % alignment != 0 {
                return Err(Error::InvalidParameter("chunk base is misaligned"));
            }
        }

        let mut extent_offset = self
            .chunks
            .last()
            .map(|c| c.extent_offset + c.memory.size() as u64)
            .unwrap_or(0);
        let mut added = 0usize;
        for memory in chunks {
            let buffer_count = (memory.size() / stride) as u32;
            let size = memory.size() as u64;
            self.chunks.push(Chunk {
                memory,
                first_buffer: self.refcounts.len() as u32 + added as u32,
                buffer_count,
                extent_offset,
            });
            extent_offset += size;
            added += buffer_count as usize;
        }
        self.refcounts
            .extend((0..added).map(|_| AtomicU32::new(0)));
        self.bitmap.get_mut().grow(added);

        let chunks = &self.chunks;
        self.by_address = (0..chunks.len()).collect();
        self.by_address
            .sort_by_key(|&i| chunks[i].memory.base().as_ptr() as usize);
        Ok(())
    }

    pub fn capacity(&self) -> u32 {
        self.refcounts.len() as u32
    }

    pub fn buffer_size(&self) -> usize {
        self.geometry.buffer_size
    }

    pub fn is_dma_capable(&self) -> bool {
        self.allocator.is_dma_capable()
    }

    pub fn free_count(&self) -> usize {
        self.bitmap.lock().free
    }

    pub fn in_use(&self) -> usize {
        self.capacity() as usize - self.free_count()
    }

    fn chunk_of(&self, index: u32) -> &Chunk {
        let position = self
            .chunks
            .partition_point(|c| c.first_buffer + c.buffer_count <= index);
        &self.chunks[position]
    }

    pub fn descriptor(&self, index: u32) -> BufferDescriptor {
        assert!(index < self.capacity(), "buffer index {index} out of range");
        let chunk = self.chunk_of(index);
        let within = (index - chunk.first_buffer) as usize * self.geometry.stride
            + self.geometry.alignment_offset;
        // SAFETY: `within` is inside the chunk because index < buffer_count.
        let virtual_address = unsafe {
            NonNull::new_unchecked(chunk.memory.base().as_ptr().add(within))
        };
        BufferDescriptor {
            index,
            virtual_address,
            logical_address: chunk.memory.logical_base().map(|b| b + within as u64),
            offset: chunk.extent_offset + within as u64,
            size: self.geometry.buffer_size as u32,
        }
    }

    /// Finds the buffer containing `address`.
    pub fn index_of(&self, address: usize) -> Option<u32> {
        let position = self
            .by_address
            .partition_point(|&i| self.chunks[i].memory.base().as_ptr() as usize <= address);
        let chunk = &self.chunks[*self.by_address.get(position.checked_sub(1)?)?];
        if !chunk.memory.contains(address) {
            return None;
        }
        let within = address - chunk.memory.base().as_ptr() as usize;
        Some(chunk.first_buffer + (within / self.geometry.stride) as u32)
    }

    pub fn allocate(&self) -> Result<BufferDescriptor> {
        let index = self
            .bitmap
            .lock()
            .allocate()
            .ok_or(Error::InsufficientResources("buffer pool exhausted"))?;
        let previous = self.refcounts[index].swap(1, Ordering::AcqRel);
        debug_assert_eq!(previous, 0);
        Ok(self.descriptor(index as u32))
    }

    pub fn add_ref(&self, index: u32) {
        let previous = self.refcounts[index as usize].fetch_add(1, Ordering::AcqRel);
        assert!(previous > 0, "add_ref on free buffer {index}");
    }

    /// Drops one reference; the buffer returns to the pool at zero.
    pub fn deref(&self, index: u32) {
        let previous = self.refcounts[index as usize].fetch_sub(1, Ordering::AcqRel);
        if unlikely(previous == 0) {
            panic!("buffer {index} freed twice");
        }
        if previous == 1 {
            self.bitmap.lock().release(index as usize);
        }
    }

    pub fn free_index(&self, index: u32) {
        self.deref(index)
    }

    pub fn free(&self, virtual_address: NonNull<u8>) {
        let index = self
            .index_of(virtual_address.as_ptr() as usize)
            .unwrap_or_else(|| panic!("{virtual_address:p} does not belong to this pool"));
        self.deref(index)
    }

    pub fn ref_count(&self, index: u32) -> u32 {
        self.refcounts[index as usize].load(Ordering::Acquire)
    }

    pub fn enumerate(&self, mut f: impl FnMut(BufferDescriptor)) {
        for index in 0..self.capacity() {
            f(self.descriptor(index))
        }
    }

    /// Raw view of the buffer's bytes.
    ///
    /// # Safety
    ///
    /// The caller must hold a reference on the buffer and must not create
    /// overlapping mutable views.
    pub unsafe fn buffer(&self, index: u32) -> *mut [u8] {
        let descriptor = self.descriptor(index);
        std::ptr::slice_from_raw_parts_mut(
            descriptor.virtual_address.as_ptr(),
            descriptor.size as usize,
        )
    }

    #[cfg(test)]
    fn bitmap_snapshot(&self) -> Vec<u64> {
        self.bitmap.lock().words.clone()
    }
}

impl Drop for BufferPool {
    fn drop(&mut self) {
        let in_use = self.in_use();
        if in_use > 0 {
            warn!("buffer pool destroyed with {in_use} buffers in use");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn pool(count: u32, size: usize, max_chunk: usize) -> BufferPool {
        let mut pool = BufferPool::new(Arc::new(NonPagedAllocator::new(max_chunk)));
        pool.initialize(count, size, 0, 64).unwrap();
        pool
    }

    #[test]
    fn allocate_then_free_restores_bitmap() {
        let pool = pool(100, 2048, 16 * 2048);
        let held = pool.allocate().unwrap();
        let before = pool.bitmap_snapshot();
        let buffer = pool.allocate().unwrap();
        pool.free(buffer.virtual_address);
        assert_eq!(pool.bitmap_snapshot(), before);
        pool.free_index(held.index);
        assert_eq!(pool.free_count(), 100);
    }

    #[test]
    fn exhaustion_is_recoverable() {
        let pool = pool(3, 512, 1 << 20);
        let buffers: Vec<_> = (0..3).map(|_| pool.allocate().unwrap()).collect();
        let err = pool.allocate().unwrap_err();
        assert!(err.is_resource_exhaustion());
        pool.free_index(buffers[1].index);
        assert_eq!(pool.allocate().unwrap().index, buffers[1].index);
    }

    #[test]
    fn chunks_form_one_extent() {
        let pool = pool(10, 1000, 4 * 1024);
        assert_eq!(pool.capacity(), 10);
        let mut offsets = Vec::new();
        pool.enumerate(|d| {
            assert_eq!(d.virtual_address.as_ptr() as usize % 64, 0);
            assert_eq!(pool.index_of(d.virtual_address.as_ptr() as usize), Some(d.index));
            assert_eq!(pool.index_of(d.virtual_address.as_ptr() as usize + 999), Some(d.index));
            offsets.push(d.offset);
        });
        assert!(offsets.windows(2).all(|w| w[1] == w[0] + 1024));
    }

    #[test]
    fn alignment_offset_shifts_every_buffer() {
        let mut pool = BufferPool::new(Arc::new(NonPagedAllocator::default()));
        pool.initialize(4, 100, 2, 16).unwrap();
        pool.enumerate(|d| assert_eq!(d.virtual_address.as_ptr() as usize % 16, 2));
    }

    #[test]
    fn negotiation_halves_chunk_size() {
        let allocator = ConstrainedAllocator::new(NonPagedAllocator::new(1 << 20), 8192, 1 << 20);
        let mut pool = BufferPool::new(Arc::new(allocator));
        let grant = pool.initialize(16, 2048, 0, 2048).unwrap();
        assert_eq!(grant.buffer_count, 16);
        assert!(grant.chunk_size <= 8192);
    }

    #[test]
    fn negotiation_grants_partial_pool() {
        let allocator = ConstrainedAllocator::new(NonPagedAllocator::new(1 << 20), 4096, 8192);
        let mut pool = BufferPool::new(Arc::new(allocator));
        let grant = pool.initialize(8, 2048, 0, 2048).unwrap();
        assert_eq!(grant.buffer_count, 4);
    }

    #[test]
    fn negotiation_fails_when_nothing_fits() {
        let allocator = ConstrainedAllocator::new(NonPagedAllocator::new(1 << 20), 1024, 1 << 20);
        let mut pool = BufferPool::new(Arc::new(allocator));
        let err = pool.initialize(8, 2048, 0, 64).unwrap_err();
        assert_eq!(err, Error::InsufficientResources("no chunk size satisfies the pool"));
    }

    #[test]
    fn rejects_bad_geometry() {
        let mut pool = BufferPool::new(Arc::new(NonPagedAllocator::default()));
        assert!(matches!(
            pool.initialize(8, 2048, 0, 48),
            Err(Error::InvalidParameter(_))
        ));
        pool.initialize(8, 2048, 0, 64).unwrap();
        let odd = NonPagedAllocator::default().allocate_chunk(3000, 64).unwrap();
        assert!(matches!(
            pool.add_memory_chunks(vec![odd]),
            Err(Error::InvalidParameter(_))
        ));
    }

    #[test]
    fn reference_counts_delay_release() {
        let pool = pool(2, 256, 1 << 20);
        let d = pool.allocate().unwrap();
        pool.add_ref(d.index);
        pool.deref(d.index);
        assert_eq!(pool.free_count(), 1);
        pool.deref(d.index);
        assert_eq!(pool.free_count(), 2);
    }

    #[test]
    #[should_panic]
    fn double_free_is_fatal() {
        let pool = pool(2, 256, 1 << 20);
        let d = pool.allocate().unwrap();
        pool.free_index(d.index);
        pool.free_index(d.index);
    }

    #[test]
    fn dma_pool_reports_logical_addresses() {
        let mut pool = BufferPool::new(Arc::new(DmaAllocator::new(1 << 16, u64::MAX)));
        pool.initialize(4, 2048, 0, 2048).unwrap();
        let a = pool.allocate().unwrap();
        let b = pool.allocate().unwrap();
        let (la, lb) = (a.logical_address.unwrap(), b.logical_address.unwrap());
        assert_eq!(lb.abs_diff(la), 2048);
    }

    #[test]
    fn concurrent_allocations_are_unique() {
        let pool = Arc::new(pool(4 * 64, 128, 1 << 20));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let pool = pool.clone();
                std::thread::spawn(move || {
                    (0..64)
                        .map(|_| pool.allocate().unwrap().index)
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        let mut seen = HashSet::new();
        for handle in handles {
            for index in handle.join().unwrap() {
                assert!(seen.insert(index), "index {index} handed out twice");
            }
        }
        assert_eq!(pool.free_count(), 0);
    }
}
