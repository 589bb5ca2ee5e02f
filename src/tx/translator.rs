//! Transmit translation: buffer lists in, ring packets out.
//!
//! Each `NetBuffer` becomes one ring packet. The list being posted is the
//! translation unit; it stays in the arena until every one of its packets
//! has come back from the device, and is then completed to the stack.

use std::sync::Arc;
use std::thread;

use log::{debug, trace, warn};

use crate::arena::{Arena, Key};
use crate::device::{MappingRequirement, PacketQueue, TxCapabilities};
use crate::dma::{BounceBufferPool, BouncedBuffers, DmaAdapter, ScatterGatherGuard};
use crate::errors::{Error, Result};
use crate::exec::EcWorker;
use crate::util::{likely, unlikely};
use crate::nbl::{CompletionStatus, ExecutionLevel, NblChain, NblInfo, NetBuffer, NetBufferList};
use crate::offload::{
    HeaderScratch, parse_layout, translate_tx_ieee8021q, translate_tx_packet_checksum,
    translate_tx_packet_large_send,
};
use crate::os::OsNetStack;
use crate::queue_control::QueueState;
use crate::ring::element::{
    Layer2Type, NetFragment, NetFragmentLogicalAddress, NetFragmentVirtualAddress, NetPacketGso,
    NetPacketIeee8021Q, NetPacketLayout, NetPacketTxChecksum,
};
use crate::ring::{Extension, ExtensionRegistry, NetRing, RingCollection, RingContext};

use super::TxQueueShared;

/// Extensions a transmit ring carries for a device with `capabilities`.
pub(crate) fn tx_extensions(capabilities: &TxCapabilities) -> Result<ExtensionRegistry> {
    let mut registry = ExtensionRegistry::new();
    registry.register_type::<NetFragmentVirtualAddress>()?;
    if capabilities.mapping_requirement == MappingRequirement::DmaMapped {
        registry.register_type::<NetFragmentLogicalAddress>()?;
    }
    if capabilities.checksum {
        registry.register_type::<NetPacketTxChecksum>()?;
    }
    if capabilities.max_offload_size > 0 {
        registry.register_type::<NetPacketGso>()?;
    }
    if capabilities.ieee8021q {
        registry.register_type::<NetPacketIeee8021Q>()?;
    }
    Ok(registry)
}

struct TxExtensions {
    virtual_address: Extension<NetFragmentVirtualAddress>,
    logical_address: Option<Extension<NetFragmentLogicalAddress>>,
    checksum: Option<Extension<NetPacketTxChecksum>>,
    gso: Option<Extension<NetPacketGso>>,
    ieee8021q: Option<Extension<NetPacketIeee8021Q>>,
}

impl TxExtensions {
    fn resolve(rings: &RingCollection) -> Result<Self> {
        Ok(Self {
            virtual_address: rings
                .fragment_extension()
                .ok_or(Error::InvalidState("fragment ring lacks virtual addresses"))?,
            logical_address: rings.fragment_extension(),
            checksum: rings.packet_extension(),
            gso: rings.packet_extension(),
            ieee8021q: rings.packet_extension(),
        })
    }

    /// Names an offload `info` asks for that no extension can express.
    fn missing_offload(&self, info: &NblInfo) -> Option<&'static str> {
        if self.checksum.is_none() && info.tx_checksum.is_requested() {
            Some("checksum offload")
        } else if self.gso.is_none() && (info.lso.is_requested() || info.uso.is_requested()) {
            Some("segmentation offload")
        } else if self.ieee8021q.is_none() && info.ieee8021q.is_tagged() {
            Some("802.1Q tagging")
        } else {
            None
        }
    }
}

/// Resources a ring packet holds until the device returns it.
#[derive(Default)]
struct TxPacketContext {
    owner: Option<Key>,
    mapping: Option<ScatterGatherGuard>,
    bounce: Option<BouncedBuffers>,
}

struct InFlight {
    list: NetBufferList,
    next_buffer: usize,
    /// Packets given to the device and not yet reaped.
    outstanding: usize,
}

impl InFlight {
    fn posted_all(&self) -> bool {
        self.next_buffer == self.list.buffers.len()
    }

    fn fail(&mut self, status: CompletionStatus) {
        if self.list.status == CompletionStatus::Success {
            self.list.status = status;
        }
    }
}

enum Mapping {
    /// Fragments point at the stack's own memory.
    Direct,
    Dma(ScatterGatherGuard),
    Bounce(BouncedBuffers),
}

struct Prepared {
    layout: NetPacketLayout,
    checksum: NetPacketTxChecksum,
    gso: NetPacketGso,
    ieee8021q: NetPacketIeee8021Q,
    mapping: Mapping,
    fragment_count: usize,
}

enum Outcome {
    Ready(Prepared),
    Drop(CompletionStatus),
    Defer,
}

enum Post {
    Posted,
    Deferred,
}

/// Everything needed to turn one buffer into a packet, apart from the rings.
struct TxMapper {
    capabilities: TxCapabilities,
    extensions: TxExtensions,
    dma: Option<Arc<dyn DmaAdapter>>,
    bounce: Option<BounceBufferPool>,
    scratch: HeaderScratch,
}

impl TxMapper {
    fn prepare(&mut self, list: &NetBufferList, buffer: &NetBuffer, idle: bool) -> Outcome {
        let frame_type = match list.info.frame_type {
            Layer2Type::Unspecified => self.capabilities.layer2_type,
            frame_type => frame_type,
        };
        buffer.gather_headers(&mut self.scratch);
        let mut layout = NetPacketLayout::default();
        if unlikely(!parse_layout(frame_type, &self.scratch, &mut layout)) {
            trace!("tx: headers do not parse");
            return Outcome::Drop(CompletionStatus::InvalidPacket);
        }
        if let Some(offload) = self.extensions.missing_offload(&list.info) {
            debug!("tx: {offload} requested but the ring does not carry it, sending without");
        }

        let checksum = if self.extensions.checksum.is_some() {
            translate_tx_packet_checksum(&layout, &list.info.tx_checksum)
        } else {
            NetPacketTxChecksum::default()
        };
        let gso = if self.extensions.gso.is_some() {
            match translate_tx_packet_large_send(
                &layout,
                &list.info.lso,
                &list.info.uso,
                buffer.data_length(),
                self.capabilities.max_offload_size,
            ) {
                Ok(gso) => gso,
                Err(err) => {
                    debug!("tx: segmentation request rejected: {err}");
                    return Outcome::Drop(CompletionStatus::InvalidPacket);
                }
            }
        } else {
            NetPacketGso::default()
        };
        let ieee8021q = if self.extensions.ieee8021q.is_some() {
            match translate_tx_ieee8021q(&list.info.ieee8021q) {
                Ok(tag) => tag,
                Err(err) => {
                    debug!("tx: 802.1Q tag rejected: {err}");
                    return Outcome::Drop(CompletionStatus::InvalidPacket);
                }
            }
        } else {
            NetPacketIeee8021Q::default()
        };

        let max_fragments = self.capabilities.max_fragments_per_packet as usize;
        let mapping = match self.map(buffer, max_fragments) {
            Some(mapping) => mapping,
            None => match self.bounce(buffer, max_fragments, idle) {
                Ok(mapping) => mapping,
                Err(outcome) => return outcome,
            },
        };
        let fragment_count = match &mapping {
            Mapping::Direct => buffer.segment_count(),
            Mapping::Dma(guard) => guard.list().len(),
            Mapping::Bounce(bounced) => bounced.len(),
        };
        Outcome::Ready(Prepared {
            layout,
            checksum,
            gso,
            ieee8021q,
            mapping,
            fragment_count,
        })
    }

    /// Maps without copying, if the device can take the buffer as it is.
    fn map(&self, buffer: &NetBuffer, max_fragments: usize) -> Option<Mapping> {
        match self.capabilities.mapping_requirement {
            MappingRequirement::None => {
                (buffer.segment_count() <= max_fragments).then_some(Mapping::Direct)
            }
            MappingRequirement::DmaMapped => {
                let adapter = self.dma.as_ref()?;
                match ScatterGatherGuard::map(adapter, buffer) {
                    Ok(guard) if guard.list().len() <= max_fragments => Some(Mapping::Dma(guard)),
                    Ok(_) => None,
                    Err(err) => {
                        trace!("tx: direct mapping failed: {err}");
                        None
                    }
                }
            }
        }
    }

    fn bounce(
        &self,
        buffer: &NetBuffer,
        max_fragments: usize,
        idle: bool,
    ) -> std::result::Result<Mapping, Outcome> {
        let Some(pool) = &self.bounce else {
            return Err(Outcome::Drop(CompletionStatus::Resources));
        };
        if pool.buffers_for(buffer.data_length()) > max_fragments {
            return Err(Outcome::Drop(CompletionStatus::InvalidPacket));
        }
        match pool.bounce_net_buffer(buffer) {
            Ok(bounced) => Ok(Mapping::Bounce(bounced)),
            Err(err) if err.is_resource_exhaustion() => {
                if idle {
                    // Nothing in flight can give buffers back.
                    warn!("tx: bounce pool too small for a {} byte packet", buffer.data_length());
                    Err(Outcome::Drop(CompletionStatus::Resources))
                } else {
                    Err(Outcome::Defer)
                }
            }
            Err(_) => Err(Outcome::Drop(CompletionStatus::InvalidPacket)),
        }
    }

    fn release(&self, mapping: Mapping) {
        match mapping {
            Mapping::Direct | Mapping::Dma(_) => {}
            Mapping::Bounce(bounced) => self.free_bounce(bounced),
        }
    }

    fn free_bounce(&self, bounced: BouncedBuffers) {
        match &self.bounce {
            Some(pool) => pool.free_bounce_buffers(bounced),
            None => panic!("bounce buffers without a bounce pool"),
        }
    }
}

/// Writes one fragment at the fragment ring's `end` and gives it.
fn give_fragment(
    fragments: &mut NetRing<NetFragment>,
    extensions: &TxExtensions,
    virtual_address: u64,
    logical_address: Option<u64>,
    length: u64,
) {
    let index = fragments.end_index();
    *fragments.element_mut(index) = NetFragment {
        valid_length: length,
        capacity: length,
        offset: 0,
    };
    fragments
        .extension_mut(index, extensions.virtual_address)
        .virtual_address = virtual_address;
    if let Some(extension) = extensions.logical_address {
        fragments.extension_mut(index, extension).logical_address = logical_address.unwrap_or(0);
    }
    fragments.give_to_device();
}

fn give_fragments(
    fragments: &mut NetRing<NetFragment>,
    extensions: &TxExtensions,
    buffer: &NetBuffer,
    mapping: &Mapping,
) {
    match mapping {
        Mapping::Direct => {
            for segment in buffer.segments() {
                let virtual_address = (segment.mdl.virtual_address() + segment.offset) as u64;
                let logical_address = segment
                    .mdl
                    .logical_address()
                    .map(|base| base + segment.offset as u64);
                give_fragment(
                    fragments,
                    extensions,
                    virtual_address,
                    logical_address,
                    segment.len as u64,
                );
            }
        }
        Mapping::Dma(guard) => {
            for (segment, element) in buffer.segments().zip(guard.list().elements()) {
                let virtual_address = (segment.mdl.virtual_address() + segment.offset) as u64;
                give_fragment(
                    fragments,
                    extensions,
                    virtual_address,
                    Some(element.address),
                    element.length as u64,
                );
            }
        }
        Mapping::Bounce(bounced) => {
            for bounce in bounced.buffers() {
                give_fragment(
                    fragments,
                    extensions,
                    bounce.virtual_address.as_ptr() as u64,
                    bounce.logical_address,
                    bounce.length as u64,
                );
            }
        }
    }
}

pub(crate) struct TxTranslator {
    queue_id: u32,
    shared: Arc<TxQueueShared>,
    device: Box<dyn PacketQueue>,
    stack: Arc<dyn OsNetStack>,
    rings: RingCollection,
    mapper: TxMapper,
    contexts: RingContext<TxPacketContext>,
    in_flight: Arena<InFlight>,
    /// Lists pulled from the shared queue, not yet started.
    pending: NblChain,
    current: Option<Key>,
    completed: NblChain,
    device_armed: bool,
}

impl TxTranslator {
    pub(crate) fn new(
        queue_id: u32,
        shared: Arc<TxQueueShared>,
        device: Box<dyn PacketQueue>,
        stack: Arc<dyn OsNetStack>,
        rings: RingCollection,
        capabilities: TxCapabilities,
        bounce: Option<BounceBufferPool>,
    ) -> Result<Self> {
        if capabilities.mapping_requirement == MappingRequirement::DmaMapped
            && capabilities.dma_adapter.is_none()
            && bounce.is_none()
        {
            return Err(Error::InvalidParameter(
                "DMA mapped device without an adapter or bounce buffers",
            ));
        }
        if capabilities.max_fragments_per_packet == 0
            || capabilities.max_fragments_per_packet as u32 >= rings.fragments.count()
        {
            return Err(Error::InvalidParameter(
                "fragment ring too small for one packet",
            ));
        }
        let extensions = TxExtensions::resolve(&rings)?;
        let contexts = RingContext::new(rings.packets.count());
        let in_flight = Arena::with_capacity(rings.packets.count() as usize);
        Ok(Self {
            queue_id,
            shared,
            device,
            stack,
            rings,
            mapper: TxMapper {
                dma: capabilities.dma_adapter.clone(),
                capabilities,
                extensions,
                bounce,
                scratch: HeaderScratch::new(),
            },
            contexts,
            in_flight,
            pending: NblChain::new(),
            current: None,
            completed: NblChain::new(),
            device_armed: false,
        })
    }

    /// Body of the queue's execution context, once `wait_for_start` has
    /// returned `started`.
    pub(crate) fn run(mut self, worker: EcWorker, started: bool) {
        if started {
            self.shared.status.set(QueueState::Started);
            debug!("tx{}: started", self.queue_id);
            while !worker.is_stopping() {
                if self.poll() {
                    continue;
                }
                if self.arm() {
                    worker.wait_for_signal();
                }
                self.disarm();
            }
        }
        self.cancel();
    }

    /// One round of work. Returns whether anything moved.
    pub(crate) fn poll(&mut self) -> bool {
        let mut progress = self.reap();
        progress |= self.pull();
        self.device.advance(&mut self.rings);
        progress |= self.reap();
        self.flush();
        progress
    }

    fn idle(&self) -> bool {
        self.rings.packets.owned_by_device().is_empty() && !self.rings.packets.any_returned()
    }

    /// Posts buffers until the lists run out or something must wait.
    fn pull(&mut self) -> bool {
        let mut progress = false;
        loop {
            let key = match self.current {
                Some(key) => key,
                None => {
                    if self.pending.is_empty() {
                        let mut fifo = self.shared.fifo.lock();
                        self.pending.append(&mut fifo.chain);
                    }
                    let Some(list) = self.pending.pop_front() else {
                        break;
                    };
                    progress = true;
                    if list.buffers.is_empty() {
                        self.completed.push_back(list);
                        continue;
                    }
                    let key = self.in_flight.insert(InFlight {
                        list,
                        next_buffer: 0,
                        outstanding: 0,
                    });
                    self.current = Some(key);
                    key
                }
            };
            match self.post_buffer(key) {
                Post::Deferred => {
                    self.shared.stats.deferred();
                    break;
                }
                Post::Posted => {
                    progress = true;
                    if self.in_flight.get(key).is_some_and(InFlight::posted_all) {
                        self.current = None;
                        self.maybe_complete(key);
                    }
                }
            }
        }
        progress
    }

    fn post_buffer(&mut self, key: Key) -> Post {
        let Some(packet_index) = self.rings.packets.next_to_give_to_device() else {
            return Post::Deferred;
        };
        let idle = self.idle();
        let Some(entry) = self.in_flight.get(key) else {
            panic!("tx{}: translation unit vanished", self.queue_id);
        };
        let buffer = &entry.list.buffers[entry.next_buffer];
        let length = buffer.data_length();

        let outcome = self.mapper.prepare(&entry.list, buffer, idle);
        let (context, status) = match outcome {
            Outcome::Defer => return Post::Deferred,
            Outcome::Drop(status) => {
                let packet = self.rings.packets.element_mut(packet_index);
                packet.fragment_index = self.rings.fragments.end_index();
                packet.fragment_count = 0;
                packet.ignore = true;
                packet.layout = NetPacketLayout::default();
                (TxPacketContext::default(), Some(status))
            }
            Outcome::Ready(prepared) => {
                if prepared.fragment_count as u32 > self.rings.fragments.available().count() {
                    self.mapper.release(prepared.mapping);
                    return Post::Deferred;
                }
                let first_fragment = self.rings.fragments.end_index();
                give_fragments(
                    &mut self.rings.fragments,
                    &self.mapper.extensions,
                    buffer,
                    &prepared.mapping,
                );
                self.write_packet(packet_index, first_fragment, &prepared);
                let context = match prepared.mapping {
                    Mapping::Direct => TxPacketContext::default(),
                    Mapping::Dma(guard) => TxPacketContext {
                        mapping: Some(guard),
                        ..Default::default()
                    },
                    Mapping::Bounce(bounced) => {
                        self.shared.stats.bounced();
                        TxPacketContext {
                            bounce: Some(bounced),
                            ..Default::default()
                        }
                    }
                };
                (context, None)
            }
        };

        self.rings.packets.give_to_device();
        *self.contexts.get_mut(packet_index) = TxPacketContext {
            owner: Some(key),
            ..context
        };
        let Some(entry) = self.in_flight.get_mut(key) else {
            panic!("tx{}: translation unit vanished", self.queue_id);
        };
        entry.next_buffer += 1;
        entry.outstanding += 1;
        match status {
            None => self.shared.stats.packet(length),
            Some(status) => {
                entry.fail(status);
                if status == CompletionStatus::InvalidPacket {
                    self.shared.stats.invalid();
                } else {
                    self.shared.stats.dropped();
                }
            }
        }
        Post::Posted
    }

    fn write_packet(&mut self, index: u32, first_fragment: u32, prepared: &Prepared) {
        let extensions = &self.mapper.extensions;
        let packets = &mut self.rings.packets;
        if let Some(extension) = extensions.checksum {
            *packets.extension_mut(index, extension) = prepared.checksum;
        }
        if let Some(extension) = extensions.gso {
            *packets.extension_mut(index, extension) = prepared.gso;
        }
        if let Some(extension) = extensions.ieee8021q {
            *packets.extension_mut(index, extension) = prepared.ieee8021q;
        }
        let packet = packets.element_mut(index);
        packet.fragment_index = first_fragment;
        packet.fragment_count = prepared.fragment_count as u16;
        packet.ignore = false;
        packet.scratch = false;
        packet.layout = prepared.layout;
    }

    /// Takes back what the device returned and releases its resources.
    fn reap(&mut self) -> bool {
        let mut progress = false;
        while let Some(index) = self.rings.packets.take_from_device() {
            progress = true;
            let packet = *self.rings.packets.element(index);
            let fragment_count = packet.fragment_count;
            for _ in 0..fragment_count {
                if unlikely(self.rings.fragments.take_from_device().is_none()) {
                    panic!("tx{}: packet returned before its fragments", self.queue_id);
                }
            }
            let context = self.contexts.take(index);
            drop(context.mapping);
            if let Some(bounced) = context.bounce {
                self.mapper.free_bounce(bounced);
            }
            if let Some(key) = context.owner {
                if let Some(entry) = self.in_flight.get_mut(key) {
                    entry.outstanding -= 1;
                    // Cancelled packets come back unsent.
                    if packet.ignore {
                        entry.fail(CompletionStatus::Paused);
                    }
                }
                self.maybe_complete(key);
            }
        }
        progress
    }

    fn maybe_complete(&mut self, key: Key) {
        if self.current == Some(key) {
            return;
        }
        let done = self
            .in_flight
            .get(key)
            .is_some_and(|entry| entry.outstanding == 0 && entry.posted_all());
        if done {
            if let Some(entry) = self.in_flight.remove(key) {
                self.completed.push_back(entry.list);
            }
        }
    }

    fn flush(&mut self) {
        if likely(self.completed.is_empty()) {
            return;
        }
        let chain = std::mem::take(&mut self.completed);
        trace!("tx{}: completing {} lists", self.queue_id, chain.len());
        self.stack.complete_send(chain, ExecutionLevel::Passive);
    }

    /// Asks both sides to signal new work. Returns `false` if work showed up
    /// while arming, in which case the caller polls again.
    fn arm(&mut self) -> bool {
        let blocked = self.current.is_some() || !self.pending.is_empty();
        {
            let mut fifo = self.shared.fifo.lock();
            if !blocked && !fifo.chain.is_empty() {
                return false;
            }
            fifo.armed = true;
        }
        self.device.set_notification_enabled(true);
        self.device_armed = true;
        self.device.advance(&mut self.rings);
        if self.rings.packets.any_returned() {
            return false;
        }
        blocked || self.shared.fifo.lock().chain.is_empty()
    }

    fn disarm(&mut self) {
        self.shared.fifo.lock().armed = false;
        if self.device_armed {
            self.device.set_notification_enabled(false);
            self.device_armed = false;
        }
    }

    /// Runs on the worker after it leaves its loop.
    fn cancel(&mut self) {
        debug!("tx{}: cancelling", self.queue_id);
        self.disarm();
        self.shared.fifo.lock().accepting = false;
        self.device.cancel(&mut self.rings);
        loop {
            self.reap();
            if self.idle() {
                break;
            }
            self.device.advance(&mut self.rings);
            thread::yield_now();
        }
        while self.rings.fragments.take_from_device().is_some() {}

        let mut aborted = std::mem::take(&mut self.pending);
        aborted.append(&mut self.shared.fifo.lock().chain);
        self.current = None;
        for mut entry in self.in_flight.drain() {
            debug_assert_eq!(entry.outstanding, 0);
            entry.fail(CompletionStatus::Paused);
            self.completed.push_back(entry.list);
        }
        if !aborted.is_empty() {
            debug!("tx{}: pausing {} queued lists", self.queue_id, aborted.len());
            aborted.set_status(CompletionStatus::Paused);
            self.completed.append(&mut aborted);
        }
        self.flush();
        self.shared.status.set(QueueState::Stopped);
        debug!("tx{}: stopped", self.queue_id);
    }
}
