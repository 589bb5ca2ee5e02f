use std::sync::Arc;

use log::info;

use crate::errors::{Error, Result};

use super::{BufferDescriptor, BufferPool, BufferVectorAllocator, DmaAllocator, NonPagedAllocator};

pub type PoolHandle = triomphe::Arc<BufferPool>;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SerializationMode {
    #[default]
    Concurrent,
    Serialized,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DmaLimits {
    pub max_logical_address: u64,
    pub max_chunk_size: usize,
}

#[derive(Clone, Debug)]
pub struct PoolConfig {
    pub buffer_count: u32,
    pub buffer_size: usize,
    pub alignment: usize,
    pub alignment_offset: usize,
    /// Recorded only; memory is not bound to the node.
    pub numa_node: Option<u32>,
    pub dma: Option<DmaLimits>,
    pub serialization: SerializationMode,
    pub max_chunk_size: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            buffer_count: 1024,
            buffer_size: 2048,
            alignment: 64,
            alignment_offset: 0,
            numa_node: None,
            dma: None,
            serialization: SerializationMode::Concurrent,
            max_chunk_size: 4 * 1024 * 1024,
        }
    }
}

/// Entry points handed to the OS stack alongside a pool.
#[derive(Clone, Copy)]
pub struct PoolDispatch {
    pub destroy: fn(PoolHandle),
    pub enumerate: fn(&PoolHandle, &mut dyn FnMut(BufferDescriptor)),
    pub allocate: fn(&PoolHandle) -> Result<BufferDescriptor>,
    pub free: fn(&PoolHandle, u32),
}

impl PoolDispatch {
    pub fn new() -> Self {
        Self {
            destroy: destroy_pool,
            enumerate: |pool, f| pool.enumerate(f),
            allocate: |pool| pool.allocate(),
            free: |pool, index| pool.free_index(index),
        }
    }
}

impl Default for PoolDispatch {
    fn default() -> Self {
        Self::new()
    }
}

fn destroy_pool(pool: PoolHandle) {
    let in_use = pool.in_use();
    assert!(in_use == 0, "pool destroyed with {in_use} buffers outstanding");
    drop(pool);
}

/// Builds and fills a pool according to `config`.
pub fn create_pool(config: &PoolConfig) -> Result<(PoolHandle, PoolDispatch)> {
    if config.serialization == SerializationMode::Serialized {
        return Err(Error::NotSupported("serialized buffer pools"));
    }
    let allocator: Arc<dyn BufferVectorAllocator> = match config.dma {
        Some(limits) => Arc::new(DmaAllocator::new(
            limits.max_chunk_size,
            limits.max_logical_address,
        )),
        None => Arc::new(NonPagedAllocator::new(config.max_chunk_size)),
    };
    let mut pool = BufferPool::new(allocator);
    let grant = pool.initialize(
        config.buffer_count,
        config.buffer_size,
        config.alignment_offset,
        config.alignment,
    )?;
    info!(
        "buffer pool: {} x {} bytes, chunk {} bytes{}",
        grant.buffer_count,
        grant.buffer_size,
        grant.chunk_size,
        if config.dma.is_some() { ", dma" } else { "" }
    );
    Ok((triomphe::Arc::new(pool), PoolDispatch::new()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serialized_pools_are_unsupported() {
        let config = PoolConfig {
            serialization: SerializationMode::Serialized,
            ..Default::default()
        };
        assert!(matches!(create_pool(&config), Err(Error::NotSupported(_))));
    }

    #[test]
    fn dispatch_round_trips_buffers() {
        let config = PoolConfig {
            buffer_count: 8,
            ..Default::default()
        };
        let (pool, dispatch) = create_pool(&config).unwrap();
        let buffer = (dispatch.allocate)(&pool).unwrap();
        let mut seen = 0;
        (dispatch.enumerate)(&pool, &mut |_| seen += 1);
        assert_eq!(seen, 8);
        (dispatch.free)(&pool, buffer.index);
        (dispatch.destroy)(pool);
    }

    #[test]
    #[should_panic]
    fn destroy_with_outstanding_buffers_is_fatal() {
        let config = PoolConfig {
            buffer_count: 2,
            ..Default::default()
        };
        let (pool, dispatch) = create_pool(&config).unwrap();
        let _buffer = (dispatch.allocate)(&pool).unwrap();
        (dispatch.destroy)(pool);
    }
}
