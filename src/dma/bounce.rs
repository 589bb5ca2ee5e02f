//! Copying payload into device-reachable pool buffers.

use std::ptr::NonNull;

use arrayvec::ArrayVec;
use log::{error, trace};

use crate::errors::{Error, Result};
use crate::nbl::NetBuffer;
use crate::pool::PoolHandle;

/// Bounce buffers one packet may use.
pub const MAX_BOUNCE_BUFFERS: usize = 16;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BounceBuffer {
    pub index: u32,
    pub virtual_address: NonNull<u8>,
    pub logical_address: Option<u64>,
    pub length: u32,
}

/// The bounce buffers backing one packet. Must be handed back with
/// [`BounceBufferPool::free_bounce_buffers`].
#[derive(Debug, Default)]
pub struct BouncedBuffers {
    buffers: ArrayVec<BounceBuffer, MAX_BOUNCE_BUFFERS>,
}

// SAFETY: the addresses point into pool memory this value holds references on.
unsafe impl Send for BouncedBuffers {}

impl BouncedBuffers {
    pub fn buffers(&self) -> &[BounceBuffer] {
        &self.buffers
    }

    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }
}

impl Drop for BouncedBuffers {
    fn drop(&mut self) {
        if !self.buffers.is_empty() {
            error!("leaked {} bounce buffers", self.buffers.len());
        }
    }
}

pub struct BounceBufferPool {
    pool: PoolHandle,
}

impl BounceBufferPool {
    pub fn new(pool: PoolHandle) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PoolHandle {
        &self.pool
    }

    /// Buffers needed to bounce `length` bytes.
    pub fn buffers_for(&self, length: usize) -> usize {
        length.div_ceil(self.pool.buffer_size()).max(1)
    }

    /// Copies the data window of `buffer` into freshly allocated pool
    /// buffers. On failure nothing stays allocated.
    pub fn bounce_net_buffer(&self, buffer: &NetBuffer) -> Result<BouncedBuffers> {
        let needed = self.buffers_for(buffer.data_length());
        if needed > MAX_BOUNCE_BUFFERS {
            return Err(Error::InvalidParameter("packet too large to bounce"));
        }
        let mut bounced = BouncedBuffers::default();
        let mut data = buffer.segments().flat_map(|s| s.bytes().iter().copied());
        let mut left = buffer.data_length();
        for _ in 0..needed {
            let descriptor = match self.pool.allocate() {
                Ok(descriptor) => descriptor,
                Err(err) => {
                    self.free_bounce_buffers(bounced);
                    return Err(err);
                }
            };
            let length = left.min(descriptor.size as usize);
            // SAFETY: freshly allocated, so this is the only reference.
            let target = unsafe { &mut *self.pool.buffer(descriptor.index) };
            for (dst, src) in target[..length].iter_mut().zip(&mut data) {
                *dst = src;
            }
            left -= length;
            bounced.buffers.push(BounceBuffer {
                index: descriptor.index,
                virtual_address: descriptor.virtual_address,
                logical_address: descriptor.logical_address,
                length: length as u32,
            });
        }
        trace!("bounced {} bytes into {} buffers", buffer.data_length(), needed);
        Ok(bounced)
    }

    pub fn free_bounce_buffers(&self, mut bounced: BouncedBuffers) {
        for buffer in bounced.buffers.drain(..) {
            self.pool.free_index(buffer.index);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::{DmaLimits, PoolConfig, create_pool};

    fn bounce_pool(count: u32, size: usize) -> BounceBufferPool {
        let config = PoolConfig {
            buffer_count: count,
            buffer_size: size,
            dma: Some(DmaLimits {
                max_logical_address: u32::MAX as u64,
                max_chunk_size: 1 << 16,
            }),
            ..Default::default()
        };
        BounceBufferPool::new(create_pool(&config).unwrap().0)
    }

    #[test]
    fn bounce_copies_payload() {
        let pool = bounce_pool(8, 256);
        let payload: Vec<u8> = (0..600).map(|i| i as u8).collect();
        let buffer = NetBuffer::from_pieces(&payload, 77);
        let bounced = pool.bounce_net_buffer(&buffer).unwrap();
        assert_eq!(bounced.len(), 3);
        let mut copied = Vec::new();
        for b in bounced.buffers() {
            assert!(b.logical_address.is_some());
            // SAFETY: the bounce buffers are held until freed below.
            let bytes = unsafe { &*pool.pool().buffer(b.index) };
            copied.extend_from_slice(&bytes[..b.length as usize]);
        }
        assert_eq!(copied, payload);
        pool.free_bounce_buffers(bounced);
        assert_eq!(pool.pool().in_use(), 0);
    }

    #[test]
    fn exhaustion_leaves_nothing_allocated() {
        let pool = bounce_pool(2, 256);
        let buffer = NetBuffer::from_bytes(&[0; 700]);
        let err = pool.bounce_net_buffer(&buffer).unwrap_err();
        assert!(err.is_resource_exhaustion());
        assert_eq!(pool.pool().in_use(), 0);
    }
}
