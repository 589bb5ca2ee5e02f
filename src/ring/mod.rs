//! Fixed-capacity, fixed-stride rings shared with the device.
//!
//! A ring is a single zeroed allocation: a [`RingHeader`] followed by
//! `NumberOfElements × ElementStride` bytes of slots. Each slot starts with a
//! base element ([`NetPacket`] or [`NetFragment`]) followed by the packed
//! extensions.
//!
//! At any instant three regions partition the ring:
//!
//! ```text
//!   [drain, begin)  returned by the device, not yet drained by software
//!   [begin, end)    owned by the device
//!   [end, drain-1)  available to software
//! ```
//!
//! One slot is always sacrificed to tell full from empty, so the counts sum
//! to `NumberOfElements - 1`. Software owns `end` and `drain`, the device
//! owns `begin`; every cursor has exactly one writer.

mod collection;
pub mod element;
pub mod extension;

use std::alloc::{self, Layout};
use std::marker::PhantomData;
use std::ptr::NonNull;

use static_assertions::const_assert_eq;

use crate::errors::{Error, Result};
use crate::util::{align_up, unlikely};

pub use collection::RingCollection;
pub use element::{NetFragment, NetPacket, RingElement, RingExtension};
pub use extension::{Extension, ExtensionKind, ExtensionLayout, ExtensionRegistry};


const RING_ALLOCATION_ALIGNMENT: usize = 64;

#[inline]
pub fn increment(index: u32, mask: u32) -> u32 {
    index.wrapping_add(1) & mask
}

#[inline]
pub fn decrement(index: u32, mask: u32) -> u32 {
    index.wrapping_sub(1) & mask
}

/// Number of steps from `a` forward to `b`.
#[inline]
pub fn distance(a: u32, b: u32, mask: u32) -> u32 {
    b.wrapping_sub(a) & mask
}

#[repr(C)]
#[derive(Debug)]
pub struct RingHeader {
    pub element_stride: u32,
    pub number_of_elements: u32,
    pub element_index_mask: u32,
    pub begin_index: u32,
    pub end_index: u32,
    /// Next slot software drains; reserved to the translator.
    pub os_reserved_drain_index: u32,
}

const_assert_eq!(std::mem::size_of::<RingHeader>(), 24);

pub struct NetRing<E: RingElement> {
    base: NonNull<u8>,
    layout: Layout,
    elements_offset: usize,
    extensions: ExtensionLayout,
    _marker: PhantomData<E>,
}

// SAFETY: the ring exclusively owns its allocation; elements are plain data.
unsafe impl<E: RingElement + Send> Send for NetRing<E> {}

impl<E: RingElement> NetRing<E> {
    pub fn new(number_of_elements: u32, extensions: ExtensionLayout) -> Result<Self> {
        if number_of_elements < 2 || !number_of_elements.is_power_of_two() {
            return Err(Error::InvalidParameter(
                "ring element count must be a power of two",
            ));
        }
        if extensions.base_offset() < std::mem::size_of::<E>() {
            return Err(Error::InvalidParameter(
                "extensions overlap the base element",
            ));
        }

        let element_alignment = extensions
            .max_alignment()
            .max(std::mem::align_of::<E>());
        let stride = align_up(
            extensions.base_offset() + extensions.size(),
            element_alignment,
        );
        let elements_offset = align_up(std::mem::size_of::<RingHeader>(), element_alignment);
        let total = stride
            .checked_mul(number_of_elements as usize)
            .and_then(|bytes| bytes.checked_add(elements_offset))
            .ok_or(Error::InvalidParameter("ring too large"))?;
        let layout = Layout::from_size_align(total, RING_ALLOCATION_ALIGNMENT.max(element_alignment))
            .map_err(|_| Error::InvalidParameter("invalid ring layout"))?;
        let stride =
            u32::try_from(stride).map_err(|_| Error::InvalidParameter("ring stride too large"))?;

        // SAFETY: layout has a non-zero size.
        let base = unsafe { alloc::alloc_zeroed(layout) };
        let base = NonNull::new(base).ok_or(Error::InsufficientResources("ring allocation"))?;

        let mut ring = Self {
            base,
            layout,
            elements_offset,
            extensions,
            _marker: PhantomData,
        };
        let header = ring.header_mut();
        header.element_stride = stride;
        header.number_of_elements = number_of_elements;
        header.element_index_mask = number_of_elements - 1;
        Ok(ring)
    }

    pub fn header(&self) -> &RingHeader {
        // SAFETY: the header lives at offset 0 of our allocation, which is
        // aligned to at least 64 and was zero-initialized.
        unsafe { &*self.base.as_ptr().cast::<RingHeader>() }
    }

    fn header_mut(&mut self) -> &mut RingHeader {
        // SAFETY: see `header`; `&mut self` guarantees exclusivity.
        unsafe { &mut *self.base.as_ptr().cast::<RingHeader>() }
    }

    pub fn count(&self) -> u32 {
        self.header().number_of_elements
    }

    pub fn mask(&self) -> u32 {
        self.header().element_index_mask
    }

    pub fn stride(&self) -> usize {
        self.header().element_stride as usize
    }

    pub fn begin_index(&self) -> u32 {
        self.header().begin_index
    }

    pub fn end_index(&self) -> u32 {
        self.header().end_index
    }

    pub fn drain_index(&self) -> u32 {
        self.header().os_reserved_drain_index
    }

    pub fn extensions(&self) -> &ExtensionLayout {
        &self.extensions
    }

    fn slot_ptr(&self, index: u32) -> *mut u8 {
        let slot = (index & self.mask()) as usize;
        // SAFETY: slot < number_of_elements, so the offset stays inside the
        // allocation.
        unsafe {
            self.base
                .as_ptr()
                .add(self.elements_offset + slot * self.stride())
        }
    }

    pub fn element(&self, index: u32) -> &E {
        // SAFETY: every slot starts with a zero-initialized `E` at an offset
        // aligned for it.
        unsafe { &*self.slot_ptr(index).cast::<E>() }
    }

    pub fn element_mut(&mut self, index: u32) -> &mut E {
        // SAFETY: see `element`.
        unsafe { &mut *self.slot_ptr(index).cast::<E>() }
    }

    fn extension_ptr<X: RingExtension>(&self, index: u32, extension: Extension<X>) -> *mut X {
        let offset = extension.offset();
        assert!(
            offset + std::mem::size_of::<X>() <= self.stride()
                && offset % std::mem::align_of::<X>() == 0,
            "extension handle does not belong to this ring"
        );
        // SAFETY: bounds and alignment checked above.
        unsafe { self.slot_ptr(index).add(offset).cast::<X>() }
    }

    pub fn extension<X: RingExtension>(&self, index: u32, extension: Extension<X>) -> &X {
        // SAFETY: in bounds, aligned, zero is a valid `X`.
        unsafe { &*self.extension_ptr(index, extension) }
    }

    pub fn extension_mut<X: RingExtension>(
        &mut self,
        index: u32,
        extension: Extension<X>,
    ) -> &mut X {
        // SAFETY: see `extension`; `&mut self` guarantees exclusivity.
        unsafe { &mut *self.extension_ptr(index, extension) }
    }

    pub fn available(&self) -> RingRange {
        let header = self.header();
        RingRange::new(
            header.end_index,
            decrement(header.os_reserved_drain_index, header.element_index_mask),
            header.element_index_mask,
        )
    }

    pub fn returned(&self) -> RingRange {
        let header = self.header();
        RingRange::new(
            header.os_reserved_drain_index,
            header.begin_index,
            header.element_index_mask,
        )
    }

    pub fn owned_by_device(&self) -> RingRange {
        let header = self.header();
        RingRange::new(
            header.begin_index,
            header.end_index,
            header.element_index_mask,
        )
    }

    pub fn any_returned(&self) -> bool {
        self.header().os_reserved_drain_index != self.header().begin_index
    }

    /// Slot software may fill next, if any.
    pub fn next_to_give_to_device(&self) -> Option<u32> {
        if self.available().is_empty() {
            None
        } else {
            Some(self.end_index())
        }
    }

    pub fn give_to_device(&mut self) {
        assert!(
            !self.available().is_empty(),
            "give_to_device with no available slot"
        );
        let header = self.header_mut();
        header.end_index = increment(header.end_index, header.element_index_mask);
    }

    /// Next slot the device has returned, advancing the drain cursor.
    pub fn take_from_device(&mut self) -> Option<u32> {
        if !self.any_returned() {
            return None;
        }
        let header = self.header_mut();
        let index = header.os_reserved_drain_index;
        header.os_reserved_drain_index = increment(index, header.element_index_mask);
        Some(index)
    }

    /// Device side: return every slot before `new_begin`.
    pub fn complete_to(&mut self, new_begin: u32) {
        let header = self.header_mut();
        let mask = header.element_index_mask;
        let new_begin = new_begin & mask;
        if unlikely(
            distance(header.begin_index, new_begin, mask)
                > distance(header.begin_index, header.end_index, mask),
        ) {
            panic!("device returned slots it does not own");
        }
        header.begin_index = new_begin;
    }

    /// Device side: return the next `n` owned slots.
    pub fn complete(&mut self, n: u32) {
        let target = self.begin_index().wrapping_add(n);
        assert!(n <= self.owned_by_device().count(), "device returned slots it does not own");
        self.complete_to(target);
    }
}

impl<E: RingElement> Drop for NetRing<E> {
    fn drop(&mut self) {
        // SAFETY: allocated in `new` with this exact layout.
        unsafe { alloc::dealloc(self.base.as_ptr(), self.layout) }
    }
}

impl<E: RingElement> std::fmt::Debug for NetRing<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetRing")
            .field("header", self.header())
            .finish()
    }
}

/// Half-open range of ring indices with wraparound.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RingRange {
    begin: u32,
    end: u32,
    mask: u32,
}

impl RingRange {
    pub fn new(begin: u32, end: u32, mask: u32) -> Self {
        Self {
            begin: begin & mask,
            end: end & mask,
            mask,
        }
    }

    pub fn begin(&self) -> u32 {
        self.begin
    }

    pub fn end(&self) -> u32 {
        self.end
    }

    pub fn count(&self) -> u32 {
        distance(self.begin, self.end, self.mask)
    }

    pub fn is_empty(&self) -> bool {
        self.begin == self.end
    }

    pub fn iter(&self) -> RingRangeIter {
        RingRangeIter {
            next: self.begin,
            end: self.end,
            mask: self.mask,
        }
    }
}

impl IntoIterator for RingRange {
    type Item = u32;
    type IntoIter = RingRangeIter;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

pub struct RingRangeIter {
    next: u32,
    end: u32,
    mask: u32,
}

impl Iterator for RingRangeIter {
    type Item = u32;

    fn next(&mut self) -> Option<u32> {
        if self.next == self.end {
            return None;
        }
        let index = self.next;
        self.next = increment(index, self.mask);
        Some(index)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = distance(self.next, self.end, self.mask) as usize;
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for RingRangeIter {}

/// Out-of-band per-slot state, indexed like the ring it shadows.
pub struct RingContext<T> {
    slots: Box<[T]>,
    mask: u32,
}

impl<T: Default> RingContext<T> {
    pub fn new(number_of_elements: u32) -> Self {
        debug_assert!(number_of_elements.is_power_of_two());
        let slots = (0..number_of_elements).map(|_| T::default()).collect();
        Self {
            slots,
            mask: number_of_elements - 1,
        }
    }

    /// Moves the slot's context out, leaving the default behind.
    pub fn take(&mut self, index: u32) -> T {
        std::mem::take(self.get_mut(index))
    }
}

impl<T> RingContext<T> {
    pub fn get(&self, index: u32) -> &T {
        &self.slots[(index & self.mask) as usize]
    }

    pub fn get_mut(&mut self, index: u32) -> &mut T {
        &mut self.slots[(index & self.mask) as usize]
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut T> {
        self.slots.iter_mut()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ring::element::{NetPacketGso, NetPacketTxChecksum};
    use rand::Rng;

    fn packet_ring(count: u32) -> NetRing<NetPacket> {
        let layout = ExtensionLayout::empty(
            ExtensionKind::Packet,
            std::mem::size_of::<NetPacket>(),
        );
        NetRing::new(count, layout).unwrap()
    }

    fn assert_partition(ring: &NetRing<NetPacket>) {
        let total = ring.available().count()
            + ring.returned().count()
            + ring.owned_by_device().count();
        assert_eq!(total, ring.count() - 1);
    }

    #[test]
    fn rejects_non_power_of_two() {
        let layout = ExtensionLayout::empty(ExtensionKind::Packet, 16);
        assert!(NetRing::<NetPacket>::new(12, layout.clone()).is_err());
        assert!(NetRing::<NetPacket>::new(0, layout).is_err());
    }

    #[test]
    fn give_five_return_three() {
        let mut ring = packet_ring(16);
        assert_eq!(ring.mask(), 0xF);
        for _ in 0..5 {
            assert!(ring.next_to_give_to_device().is_some());
            ring.give_to_device();
        }
        assert_eq!(ring.end_index(), 5);
        ring.complete(3);

        assert!(ring.any_returned());
        assert_eq!(ring.returned().count(), 3);
        assert_eq!(ring.available().count(), 16 - 1 - 5);
        assert_eq!(ring.owned_by_device().count(), 2);
        assert_partition(&ring);

        let drained: Vec<u32> = std::iter::from_fn(|| ring.take_from_device()).collect();
        assert_eq!(drained, vec![0, 1, 2]);
        assert!(!ring.any_returned());
        assert_eq!(ring.available().count(), 13);
    }

    #[test]
    fn full_ring_has_no_next_slot() {
        let mut ring = packet_ring(4);
        for _ in 0..3 {
            ring.give_to_device();
        }
        assert_eq!(ring.next_to_give_to_device(), None);
        assert_partition(&ring);
    }

    #[test]
    #[should_panic]
    fn give_on_full_ring_is_fatal() {
        let mut ring = packet_ring(4);
        for _ in 0..4 {
            ring.give_to_device();
        }
    }

    #[test]
    #[should_panic]
    fn device_cannot_return_unowned_slots() {
        let mut ring = packet_ring(8);
        ring.give_to_device();
        ring.complete(2);
    }

    #[test]
    fn regions_partition_under_random_traffic() {
        let mut rng = rand::rng();
        for shift in 1..8 {
            let mut ring = packet_ring(1 << shift);
            for _ in 0..2_000 {
                match rng.random_range(0..3) {
                    0 => {
                        if ring.next_to_give_to_device().is_some() {
                            ring.give_to_device();
                        }
                    }
                    1 => {
                        let owned = ring.owned_by_device().count();
                        if owned > 0 {
                            ring.complete(rng.random_range(1..=owned));
                        }
                    }
                    _ => {
                        ring.take_from_device();
                    }
                }
                assert_partition(&ring);
            }
        }
    }

    #[test]
    fn wraps_around() {
        let mut ring = packet_ring(4);
        for round in 0..10u32 {
            ring.give_to_device();
            ring.give_to_device();
            ring.complete(2);
            assert_eq!(ring.take_from_device(), Some((round * 2) & 3));
            assert_eq!(ring.take_from_device(), Some((round * 2 + 1) & 3));
            assert_eq!(ring.take_from_device(), None);
        }
        assert_eq!(distance(3, 1, 3), 2);
        assert_eq!(decrement(0, 3), 3);
    }

    #[test]
    fn extension_offsets_are_stable_across_slots() {
        let mut registry = ExtensionRegistry::new();
        registry.register_type::<NetPacketGso>().unwrap();
        registry.register_type::<NetPacketTxChecksum>().unwrap();
        let layout = registry.pack(ExtensionKind::Packet, std::mem::size_of::<NetPacket>());
        let mut ring = NetRing::<NetPacket>::new(8, layout).unwrap();
        let gso = ring.extensions().get::<NetPacketGso>().unwrap();

        for i in 0..8 {
            ring.extension_mut(i, gso).tcp_mss = 1000 + i;
            ring.element_mut(i).fragment_count = i as u16;
        }
        for i in 0..8 {
            assert_eq!(ring.extension(i, gso).tcp_mss, 1000 + i);
            assert_eq!(ring.element(i).fragment_count, i as u16);
        }
        assert_eq!(ring.stride() % 8, 0);
    }

    #[test]
    fn context_follows_ring_index() {
        let mut context: RingContext<Option<u32>> = RingContext::new(8);
        *context.get_mut(9) = Some(7);
        assert_eq!(*context.get(1), Some(7));
        assert_eq!(context.take(1), Some(7));
        assert_eq!(*context.get(1), None);
    }
}
