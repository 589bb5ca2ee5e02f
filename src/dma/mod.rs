//! Mapping buffer memory for device access.

mod bounce;

use std::mem::ManuallyDrop;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use arrayvec::ArrayVec;
use log::trace;

use crate::errors::{DmaFailure, Error, Result};
use crate::nbl::NetBuffer;

pub use bounce::{BounceBuffer, BounceBufferPool, BouncedBuffers};

/// Upper bound on elements in one scatter-gather list.
pub const MAX_SCATTER_GATHER_ELEMENTS: usize = 32;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ScatterGatherElement {
    pub address: u64,
    pub length: u32,
}

#[derive(Debug, Default)]
pub struct ScatterGatherList {
    elements: ArrayVec<ScatterGatherElement, MAX_SCATTER_GATHER_ELEMENTS>,
}

impl ScatterGatherList {
    pub fn elements(&self) -> &[ScatterGatherElement] {
        &self.elements
    }

    pub fn len(&self) -> usize {
        self.elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }
}

pub trait DmaAdapter: Send + Sync {
    /// Maps the data window of `buffer`, one element per segment.
    fn build_scatter_gather(&self, buffer: &NetBuffer) -> Result<ScatterGatherList>;

    fn put_scatter_gather(&self, list: ScatterGatherList);
}

/// Identity-mapped DMA with the restrictions of a real bus.
#[derive(Debug)]
pub struct SimulatedDmaAdapter {
    max_segments: usize,
    max_physical_address: u64,
    allow_direct: bool,
    outstanding: AtomicUsize,
}

impl SimulatedDmaAdapter {
    pub fn new(max_segments: usize, max_physical_address: u64, allow_direct: bool) -> Self {
        Self {
            max_segments: max_segments.min(MAX_SCATTER_GATHER_ELEMENTS),
            max_physical_address,
            allow_direct,
            outstanding: AtomicUsize::new(0),
        }
    }

    /// Lists built and not yet put back.
    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Acquire)
    }
}

impl DmaAdapter for SimulatedDmaAdapter {
    fn build_scatter_gather(&self, buffer: &NetBuffer) -> Result<ScatterGatherList> {
        if !self.allow_direct {
            return Err(Error::DmaMappingFailed(DmaFailure::DirectMappingForbidden));
        }
        let mut list = ScatterGatherList::default();
        for segment in buffer.segments() {
            if list.len() == self.max_segments {
                return Err(Error::DmaMappingFailed(DmaFailure::TooManySegments));
            }
            let base = segment
                .mdl
                .logical_address()
                .unwrap_or(segment.mdl.virtual_address() as u64);
            let address = base + segment.offset as u64;
            let last = address + segment.len.max(1) as u64 - 1;
            if last > self.max_physical_address {
                return Err(Error::DmaMappingFailed(DmaFailure::AddressOutOfRange));
            }
            list.elements.push(ScatterGatherElement {
                address,
                length: segment.len as u32,
            });
        }
        self.outstanding.fetch_add(1, Ordering::AcqRel);
        trace!("mapped {} segments", list.len());
        Ok(list)
    }

    fn put_scatter_gather(&self, _list: ScatterGatherList) {
        let previous = self.outstanding.fetch_sub(1, Ordering::AcqRel);
        assert!(previous > 0, "scatter-gather list returned twice");
    }
}

/// Returns its list to the adapter when dropped, unless released.
pub struct ScatterGatherGuard {
    list: ManuallyDrop<ScatterGatherList>,
    adapter: Arc<dyn DmaAdapter>,
}

impl ScatterGatherGuard {
    pub fn map(adapter: &Arc<dyn DmaAdapter>, buffer: &NetBuffer) -> Result<Self> {
        let list = adapter.build_scatter_gather(buffer)?;
        Ok(Self {
            list: ManuallyDrop::new(list),
            adapter: adapter.clone(),
        })
    }

    pub fn list(&self) -> &ScatterGatherList {
        &self.list
    }

    /// Takes the list out; the caller now owes the adapter a
    /// `put_scatter_gather`.
    pub fn release(self) -> ScatterGatherList {
        let mut me = ManuallyDrop::new(self);
        // SAFETY: `me` is never dropped, so each field is moved out once.
        unsafe {
            let list = ManuallyDrop::take(&mut me.list);
            std::ptr::drop_in_place(&mut me.adapter);
            list
        }
    }
}

impl Drop for ScatterGatherGuard {
    fn drop(&mut self) {
        // SAFETY: `list` is only taken here or in `release`, which forgets
        // the guard.
        let list = unsafe { ManuallyDrop::take(&mut self.list) };
        self.adapter.put_scatter_gather(list);
    }
}

impl std::fmt::Debug for ScatterGatherGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScatterGatherGuard")
            .field("list", &*self.list)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nbl::Mdl;

    fn adapter(max_segments: usize, max_address: u64, allow: bool) -> Arc<SimulatedDmaAdapter> {
        Arc::new(SimulatedDmaAdapter::new(max_segments, max_address, allow))
    }

    #[test]
    fn guard_returns_list_on_drop() {
        let sim = adapter(4, u64::MAX, true);
        let dyn_adapter: Arc<dyn DmaAdapter> = sim.clone();
        let buffer = NetBuffer::from_pieces(&[1u8; 300], 100);
        {
            let guard = ScatterGatherGuard::map(&dyn_adapter, &buffer).unwrap();
            assert_eq!(guard.list().len(), 3);
            assert_eq!(sim.outstanding(), 1);
        }
        assert_eq!(sim.outstanding(), 0);
    }

    #[test]
    fn released_list_is_not_returned() {
        let sim = adapter(4, u64::MAX, true);
        let dyn_adapter: Arc<dyn DmaAdapter> = sim.clone();
        let buffer = NetBuffer::from_bytes(&[0; 64]);
        let list = ScatterGatherGuard::map(&dyn_adapter, &buffer)
            .unwrap()
            .release();
        assert_eq!(sim.outstanding(), 1);
        dyn_adapter.put_scatter_gather(list);
        assert_eq!(sim.outstanding(), 0);
    }

    #[test]
    fn mapping_failures_are_typed() {
        let buffer = NetBuffer::from_pieces(&[0; 400], 100);
        let few: Arc<dyn DmaAdapter> = adapter(2, u64::MAX, true);
        assert_eq!(
            few.build_scatter_gather(&buffer).unwrap_err(),
            Error::DmaMappingFailed(DmaFailure::TooManySegments)
        );
        let forbidden: Arc<dyn DmaAdapter> = adapter(8, u64::MAX, false);
        assert_eq!(
            forbidden.build_scatter_gather(&buffer).unwrap_err(),
            Error::DmaMappingFailed(DmaFailure::DirectMappingForbidden)
        );
        let high = NetBuffer::new(vec![
            Mdl::new(vec![0u8; 64]).with_physical_address(0x1_0000_0000),
        ]);
        let low: Arc<dyn DmaAdapter> = adapter(8, u32::MAX as u64, true);
        let err = low.build_scatter_gather(&high).unwrap_err();
        assert_eq!(err, Error::DmaMappingFailed(DmaFailure::AddressOutOfRange));
        assert!(err.is_resource_exhaustion());
    }
}
