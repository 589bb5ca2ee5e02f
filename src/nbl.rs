//! OS-side packet representation: chains of buffer lists.
//!
//! A [`NetBufferList`] groups one or more [`NetBuffer`]s (one frame each)
//! with the out-of-band offload information the stack attached. Each
//! `NetBuffer` is a data window over a chain of memory descriptors
//! ([`Mdl`]).

use std::collections::VecDeque;

use crate::offload::{
    HeaderScratch, Ieee8021QInfo, LsoInfo, RscInfo, RxChecksumInfo, TxChecksumInfo, UsoInfo,
};
use crate::pool::PoolHandle;
use crate::ring::element::Layer2Type;

enum MdlMemory {
    Owned(Box<[u8]>),
    /// One reference on a pool buffer, dropped with the descriptor.
    Pooled { pool: PoolHandle, index: u32 },
}

/// One contiguous piece of a frame.
pub struct Mdl {
    memory: MdlMemory,
    byte_offset: usize,
    byte_count: usize,
    physical_address: Option<u64>,
}

impl Mdl {
    pub fn new(bytes: impl Into<Box<[u8]>>) -> Self {
        let bytes = bytes.into();
        let byte_count = bytes.len();
        Self {
            memory: MdlMemory::Owned(bytes),
            byte_offset: 0,
            byte_count,
            physical_address: None,
        }
    }

    /// Describes `byte_count` bytes at `byte_offset` of a pool buffer. The
    /// caller hands over one reference on the buffer.
    pub fn pooled(pool: PoolHandle, index: u32, byte_offset: usize, byte_count: usize) -> Self {
        assert!(
            byte_offset + byte_count <= pool.buffer_size(),
            "descriptor exceeds its pool buffer"
        );
        Self {
            memory: MdlMemory::Pooled { pool, index },
            byte_offset,
            byte_count,
            physical_address: None,
        }
    }

    /// Pins the bus address the memory is reachable at.
    pub fn with_physical_address(mut self, physical_address: u64) -> Self {
        self.physical_address = Some(physical_address);
        self
    }

    pub fn len(&self) -> usize {
        self.byte_count
    }

    pub fn is_empty(&self) -> bool {
        self.byte_count == 0
    }

    pub fn bytes(&self) -> &[u8] {
        match &self.memory {
            MdlMemory::Owned(bytes) => &bytes[self.byte_offset..self.byte_offset + self.byte_count],
            MdlMemory::Pooled { pool, index } => {
                // SAFETY: this descriptor holds a reference on the buffer and
                // the range was checked against the buffer size.
                let buffer = unsafe { &*pool.buffer(*index) };
                &buffer[self.byte_offset..self.byte_offset + self.byte_count]
            }
        }
    }

    pub fn virtual_address(&self) -> usize {
        self.bytes().as_ptr() as usize
    }

    /// Address a device would use, when one is known.
    pub fn logical_address(&self) -> Option<u64> {
        if let Some(address) = self.physical_address {
            return Some(address);
        }
        match &self.memory {
            MdlMemory::Owned(_) => None,
            MdlMemory::Pooled { pool, index } => pool
                .descriptor(*index)
                .logical_address
                .map(|base| base + self.byte_offset as u64),
        }
    }

    pub fn pool_index(&self) -> Option<u32> {
        match &self.memory {
            MdlMemory::Owned(_) => None,
            MdlMemory::Pooled { index, .. } => Some(*index),
        }
    }
}

impl Drop for Mdl {
    fn drop(&mut self) {
        if let MdlMemory::Pooled { pool, index } = &self.memory {
            pool.deref(*index);
        }
    }
}

impl std::fmt::Debug for Mdl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mdl")
            .field("pool_index", &self.pool_index())
            .field("byte_offset", &self.byte_offset)
            .field("byte_count", &self.byte_count)
            .finish()
    }
}

/// A piece of a buffer's data window.
#[derive(Clone, Copy, Debug)]
pub struct Segment<'a> {
    pub mdl: &'a Mdl,
    /// Offset of the piece inside `mdl`.
    pub offset: usize,
    pub len: usize,
}

impl<'a> Segment<'a> {
    pub fn bytes(&self) -> &'a [u8] {
        &self.mdl.bytes()[self.offset..self.offset + self.len]
    }
}

/// One frame: a data window over a chain of descriptors.
#[derive(Debug)]
pub struct NetBuffer {
    mdls: Vec<Mdl>,
    data_offset: usize,
    data_length: usize,
}

impl NetBuffer {
    pub fn new(mdls: Vec<Mdl>) -> Self {
        let data_length = mdls.iter().map(Mdl::len).sum();
        Self {
            mdls,
            data_offset: 0,
            data_length,
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self::new(vec![Mdl::new(bytes.to_vec())])
    }

    /// Splits `bytes` across descriptors of at most `piece` bytes.
    pub fn from_pieces(bytes: &[u8], piece: usize) -> Self {
        Self::new(bytes.chunks(piece.max(1)).map(|c| Mdl::new(c.to_vec())).collect())
    }

    /// Skips `offset` leading bytes of the descriptor chain.
    pub fn with_data_offset(mut self, offset: usize) -> Self {
        let offset = offset.min(self.data_offset + self.data_length);
        self.data_length -= offset - self.data_offset;
        self.data_offset = offset;
        self
    }

    pub fn data_length(&self) -> usize {
        self.data_length
    }

    pub fn mdls(&self) -> &[Mdl] {
        &self.mdls
    }

    pub fn segments(&self) -> impl Iterator<Item = Segment<'_>> + '_ {
        let mut skip = self.data_offset;
        let mut left = self.data_length;
        self.mdls.iter().filter_map(move |mdl| {
            if skip >= mdl.len() {
                skip -= mdl.len();
                return None;
            }
            if left == 0 {
                return None;
            }
            let offset = skip;
            let len = (mdl.len() - offset).min(left);
            skip = 0;
            left -= len;
            Some(Segment { mdl, offset, len })
        })
    }

    pub fn segment_count(&self) -> usize {
        self.segments().count()
    }

    /// Copies the data window into `dst`, returning the bytes written.
    pub fn copy_to(&self, dst: &mut [u8]) -> usize {
        let mut written = 0;
        for segment in self.segments() {
            if written == dst.len() {
                break;
            }
            let n = segment.len.min(dst.len() - written);
            dst[written..written + n].copy_from_slice(&segment.bytes()[..n]);
            written += n;
        }
        written
    }

    /// Copies the leading bytes of the frame, up to the scratch capacity.
    pub fn gather_headers(&self, scratch: &mut HeaderScratch) {
        scratch.clear();
        for segment in self.segments() {
            let room = scratch.remaining_capacity();
            if room == 0 {
                break;
            }
            let bytes = segment.bytes();
            let _ = scratch.try_extend_from_slice(&bytes[..bytes.len().min(room)]);
        }
    }

    pub fn to_vec(&self) -> Vec<u8> {
        let mut bytes = vec![0; self.data_length];
        self.copy_to(&mut bytes);
        bytes
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum CompletionStatus {
    #[default]
    Success,
    /// Datapath not running.
    Paused,
    Aborted,
    InvalidPacket,
    Resources,
}

/// Hint for the receiver of a chain about the caller's context.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExecutionLevel {
    Passive,
    Dispatch,
}

/// Out-of-band information attached to a buffer list.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct NblInfo {
    pub frame_type: Layer2Type,
    pub tx_checksum: TxChecksumInfo,
    pub rx_checksum: RxChecksumInfo,
    pub lso: LsoInfo,
    pub uso: UsoInfo,
    pub rsc: RscInfo,
    pub ieee8021q: Ieee8021QInfo,
}

#[derive(Debug)]
pub struct NetBufferList {
    pub buffers: Vec<NetBuffer>,
    pub info: NblInfo,
    pub status: CompletionStatus,
    /// Receive queue that indicated the list.
    pub source_queue: Option<u32>,
    /// Opaque value for the stack's own bookkeeping.
    pub cookie: u64,
}

impl NetBufferList {
    pub fn new(buffers: Vec<NetBuffer>) -> Self {
        Self {
            buffers,
            info: NblInfo {
                frame_type: Layer2Type::Ethernet,
                ..Default::default()
            },
            status: CompletionStatus::Success,
            source_queue: None,
            cookie: 0,
        }
    }

    pub fn single(buffer: NetBuffer) -> Self {
        Self::new(vec![buffer])
    }

    pub fn with_info(mut self, info: NblInfo) -> Self {
        self.info = info;
        self
    }
}

/// Counted FIFO of buffer lists crossing the OS boundary.
#[derive(Debug, Default)]
pub struct NblChain {
    lists: VecDeque<NetBufferList>,
}

impl NblChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.lists.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lists.is_empty()
    }

    pub fn push_back(&mut self, list: NetBufferList) {
        self.lists.push_back(list);
    }

    pub fn push_front(&mut self, list: NetBufferList) {
        self.lists.push_front(list);
    }

    pub fn pop_front(&mut self) -> Option<NetBufferList> {
        self.lists.pop_front()
    }

    pub fn append(&mut self, other: &mut NblChain) {
        self.lists.append(&mut other.lists);
    }

    pub fn iter(&self) -> impl Iterator<Item = &NetBufferList> {
        self.lists.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut NetBufferList> {
        self.lists.iter_mut()
    }

    pub fn set_status(&mut self, status: CompletionStatus) {
        for list in &mut self.lists {
            list.status = status;
        }
    }
}

impl FromIterator<NetBufferList> for NblChain {
    fn from_iter<I: IntoIterator<Item = NetBufferList>>(iter: I) -> Self {
        Self {
            lists: iter.into_iter().collect(),
        }
    }
}

impl Extend<NetBufferList> for NblChain {
    fn extend<I: IntoIterator<Item = NetBufferList>>(&mut self, iter: I) {
        self.lists.extend(iter);
    }
}

impl IntoIterator for NblChain {
    type Item = NetBufferList;
    type IntoIter = std::collections::vec_deque::IntoIter<NetBufferList>;

    fn into_iter(self) -> Self::IntoIter {
        self.lists.into_iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::{PoolConfig, create_pool};

    #[test]
    fn data_window_spans_descriptors() {
        let bytes: Vec<u8> = (0..100).collect();
        let buffer = NetBuffer::from_pieces(&bytes, 30).with_data_offset(35);
        assert_eq!(buffer.data_length(), 65);
        let pieces: Vec<(usize, usize)> = buffer.segments().map(|s| (s.offset, s.len)).collect();
        assert_eq!(pieces, vec![(5, 25), (0, 30), (0, 10)]);
        assert_eq!(buffer.to_vec(), bytes[35..]);
    }

    #[test]
    fn header_gather_is_bounded() {
        let bytes = vec![7u8; 1000];
        let buffer = NetBuffer::from_pieces(&bytes, 100);
        let mut scratch = HeaderScratch::new();
        buffer.gather_headers(&mut scratch);
        assert_eq!(scratch.len(), crate::offload::MAX_HEADER_BYTES);
    }

    #[test]
    fn pooled_descriptor_releases_reference() {
        let config = PoolConfig {
            buffer_count: 2,
            ..Default::default()
        };
        let (pool, _) = create_pool(&config).unwrap();
        let buffer = pool.allocate().unwrap();
        // SAFETY: the buffer is allocated and not shared yet.
        unsafe { (&mut *pool.buffer(buffer.index))[..4].copy_from_slice(b"abcd") };
        pool.add_ref(buffer.index);
        let mdl = Mdl::pooled(pool.clone(), buffer.index, 1, 3);
        assert_eq!(mdl.bytes(), b"bcd");
        drop(mdl);
        assert_eq!(pool.ref_count(buffer.index), 1);
        pool.free_index(buffer.index);
        assert_eq!(pool.in_use(), 0);
    }

    #[test]
    fn chain_keeps_order_and_count() {
        let mut chain: NblChain = (0..3)
            .map(|i| {
                let mut list = NetBufferList::single(NetBuffer::from_bytes(&[i]));
                list.cookie = i as u64;
                list
            })
            .collect();
        chain.set_status(CompletionStatus::Paused);
        assert_eq!(chain.len(), 3);
        let cookies: Vec<u64> = chain.iter().map(|l| l.cookie).collect();
        assert_eq!(cookies, vec![0, 1, 2]);
        assert!(chain.iter().all(|l| l.status == CompletionStatus::Paused));
    }
}
