//! Receive translation: pool buffers posted to the rings, filled packets
//! indicated to the stack as buffer lists.

use std::sync::Arc;
use std::thread;

use log::{debug, trace};

use crate::device::{MappingRequirement, PacketQueue, RxCapabilities};
use crate::errors::{Error, Result};
use crate::exec::EcWorker;
use crate::util::{likely, unlikely};
use crate::nbl::{ExecutionLevel, Mdl, NblChain, NblInfo, NetBuffer, NetBufferList};
use crate::offload::{
    HeaderScratch, parse_layout, translate_rx_ieee8021q, translate_rx_packet_checksum,
    translate_rx_packet_rsc,
};
use crate::os::OsNetStack;
use crate::pool::PoolHandle;
use crate::queue_control::QueueState;
use crate::ring::element::{
    Layer2Type, NetFragment, NetFragmentLogicalAddress, NetFragmentVirtualAddress,
    NetPacketIeee8021Q, NetPacketLayout, NetPacketRsc, NetPacketRxChecksum,
};
use crate::ring::{Extension, ExtensionRegistry, RingCollection, RingContext};

use super::RxQueueShared;

/// Extensions a receive ring carries for a device with `capabilities`.
pub(crate) fn rx_extensions(capabilities: &RxCapabilities) -> Result<ExtensionRegistry> {
    let mut registry = ExtensionRegistry::new();
    registry.register_type::<NetFragmentVirtualAddress>()?;
    if capabilities.mapping_requirement == MappingRequirement::DmaMapped {
        registry.register_type::<NetFragmentLogicalAddress>()?;
    }
    if capabilities.checksum {
        registry.register_type::<NetPacketRxChecksum>()?;
    }
    if capabilities.rsc {
        registry.register_type::<NetPacketRsc>()?;
    }
    if capabilities.ieee8021q {
        registry.register_type::<NetPacketIeee8021Q>()?;
    }
    Ok(registry)
}

struct RxExtensions {
    virtual_address: Extension<NetFragmentVirtualAddress>,
    logical_address: Option<Extension<NetFragmentLogicalAddress>>,
    checksum: Option<Extension<NetPacketRxChecksum>>,
    rsc: Option<Extension<NetPacketRsc>>,
    ieee8021q: Option<Extension<NetPacketIeee8021Q>>,
}

pub(crate) struct RxTranslator {
    queue_id: u32,
    shared: Arc<RxQueueShared>,
    device: Box<dyn PacketQueue>,
    stack: Arc<dyn OsNetStack>,
    rings: RingCollection,
    extensions: RxExtensions,
    layer2_type: Layer2Type,
    pool: PoolHandle,
    /// Pool buffer posted in each fragment slot.
    fragment_buffers: RingContext<Option<u32>>,
    scratch: HeaderScratch,
    indications: NblChain,
    device_armed: bool,
}

impl RxTranslator {
    pub(crate) fn new(
        queue_id: u32,
        shared: Arc<RxQueueShared>,
        device: Box<dyn PacketQueue>,
        stack: Arc<dyn OsNetStack>,
        rings: RingCollection,
        capabilities: &RxCapabilities,
        pool: PoolHandle,
    ) -> Result<Self> {
        let extensions = RxExtensions {
            virtual_address: rings
                .fragment_extension()
                .ok_or(Error::InvalidState("fragment ring lacks virtual addresses"))?,
            logical_address: rings.fragment_extension(),
            checksum: rings.packet_extension(),
            rsc: rings.packet_extension(),
            ieee8021q: rings.packet_extension(),
        };
        if extensions.logical_address.is_some() && !pool.is_dma_capable() {
            return Err(Error::InvalidParameter(
                "DMA mapped device needs a DMA capable pool",
            ));
        }
        let fragment_buffers = RingContext::new(rings.fragments.count());
        Ok(Self {
            queue_id,
            shared,
            device,
            stack,
            rings,
            extensions,
            layer2_type: capabilities.layer2_type,
            pool,
            fragment_buffers,
            scratch: HeaderScratch::new(),
            indications: NblChain::new(),
            device_armed: false,
        })
    }

    /// Body of the queue's execution context, once `wait_for_start` has
    /// returned `started`.
    pub(crate) fn run(mut self, worker: EcWorker, started: bool) {
        if started {
            self.shared.status.set(QueueState::Started);
            debug!("rx{}: started", self.queue_id);
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

    pub(crate) fn poll(&mut self) -> bool {
        let mut progress = self.post();
        self.device.advance(&mut self.rings);
        progress |= self.drain();
        self.indicate();
        progress
    }

    /// Fills free fragment slots with pool buffers and hands every free
    /// packet slot to the device.
    fn post(&mut self) -> bool {
        let mut progress = false;
        let capacity = self.pool.buffer_size() as u64;
        while let Some(index) = self.rings.fragments.next_to_give_to_device() {
            let Ok(descriptor) = self.pool.allocate() else {
                trace!("rx{}: pool exhausted", self.queue_id);
                break;
            };
            *self.rings.fragments.element_mut(index) = NetFragment {
                valid_length: 0,
                capacity,
                offset: 0,
            };
            self.rings
                .fragments
                .extension_mut(index, self.extensions.virtual_address)
                .virtual_address = descriptor.virtual_address.as_ptr() as u64;
            if let Some(extension) = self.extensions.logical_address {
                self.rings
                    .fragments
                    .extension_mut(index, extension)
                    .logical_address = descriptor.logical_address.unwrap_or(0);
            }
            *self.fragment_buffers.get_mut(index) = Some(descriptor.index);
            self.rings.fragments.give_to_device();
            progress = true;
        }
        while let Some(index) = self.rings.packets.next_to_give_to_device() {
            let packet = self.rings.packets.element_mut(index);
            packet.fragment_count = 0;
            packet.ignore = false;
            packet.layout = NetPacketLayout::default();
            self.rings.packets.give_to_device();
            progress = true;
        }
        progress
    }

    fn take_fragment_buffer(&mut self, index: u32) -> u32 {
        match self.fragment_buffers.take(index) {
            Some(buffer) => buffer,
            None => panic!("rx{}: fragment {index} returned without a buffer", self.queue_id),
        }
    }

    /// Turns returned packets into buffer lists.
    fn drain(&mut self) -> bool {
        let mut progress = false;
        while let Some(index) = self.rings.packets.take_from_device() {
            progress = true;
            let packet = *self.rings.packets.element(index);
            let mut mdls = Vec::with_capacity(packet.fragment_count as usize);
            for _ in 0..packet.fragment_count {
                let Some(fragment_index) = self.rings.fragments.take_from_device() else {
                    panic!("rx{}: packet returned before its fragments", self.queue_id);
                };
                let buffer = self.take_fragment_buffer(fragment_index);
                let fragment = *self.rings.fragments.element(fragment_index);
                if likely(!packet.ignore && fragment.valid_length > 0) {
                    self.pool.add_ref(buffer);
                    mdls.push(Mdl::pooled(
                        self.pool.clone(),
                        buffer,
                        fragment.offset as usize,
                        fragment.valid_length as usize,
                    ));
                }
                // The ring's own reference.
                self.pool.deref(buffer);
            }
            if unlikely(packet.ignore || mdls.is_empty()) {
                self.shared.stats.dropped();
                continue;
            }
            if let Some(list) = self.translate(index, packet.layout, NetBuffer::new(mdls)) {
                self.indications.push_back(list);
            }
        }
        progress
    }

    fn translate(
        &mut self,
        index: u32,
        mut layout: NetPacketLayout,
        buffer: NetBuffer,
    ) -> Option<NetBufferList> {
        if layout.layer2_type == Layer2Type::Unspecified {
            buffer.gather_headers(&mut self.scratch);
            parse_layout(self.layer2_type, &self.scratch, &mut layout);
        }
        let mut info = NblInfo {
            frame_type: self.layer2_type,
            ..Default::default()
        };
        if let Some(extension) = self.extensions.checksum {
            let checksum = self.rings.packets.extension(index, extension);
            match translate_rx_packet_checksum(&layout, checksum) {
                Some(rx_checksum) => info.rx_checksum = rx_checksum,
                None => {
                    trace!("rx{}: bad frame check sequence", self.queue_id);
                    self.shared.stats.invalid();
                    return None;
                }
            }
        }
        if let Some(extension) = self.extensions.rsc {
            info.rsc = translate_rx_packet_rsc(self.rings.packets.extension(index, extension));
        }
        if let Some(extension) = self.extensions.ieee8021q {
            info.ieee8021q =
                translate_rx_ieee8021q(self.rings.packets.extension(index, extension));
        }
        self.shared.stats.packet(buffer.data_length());
        let mut list = NetBufferList::single(buffer).with_info(info);
        list.source_queue = Some(self.queue_id);
        Some(list)
    }

    fn indicate(&mut self) {
        if likely(self.indications.is_empty()) {
            return;
        }
        let chain = std::mem::take(&mut self.indications);
        self.shared.returns.lock().outstanding += chain.len();
        trace!("rx{}: indicating {} lists", self.queue_id, chain.len());
        self.stack.indicate_receive(chain, ExecutionLevel::Passive);
    }

    /// Whether posting could make progress right now.
    fn can_post(&self) -> bool {
        self.rings.packets.next_to_give_to_device().is_some()
            || (self.rings.fragments.next_to_give_to_device().is_some()
                && self.pool.free_count() > 0)
    }

    fn arm(&mut self) -> bool {
        {
            let mut returns = self.shared.returns.lock();
            if self.can_post() {
                return false;
            }
            returns.armed = true;
        }
        self.device.set_notification_enabled(true);
        self.device_armed = true;
        self.device.advance(&mut self.rings);
        !self.rings.packets.any_returned() && !self.can_post()
    }

    fn disarm(&mut self) {
        self.shared.returns.lock().armed = false;
        if self.device_armed {
            self.device.set_notification_enabled(false);
            self.device_armed = false;
        }
    }

    fn cancel(&mut self) {
        debug!("rx{}: cancelling", self.queue_id);
        self.disarm();
        self.device.cancel(&mut self.rings);
        loop {
            self.drain();
            if self.rings.packets.owned_by_device().is_empty()
                && self.rings.fragments.owned_by_device().is_empty()
            {
                break;
            }
            self.device.advance(&mut self.rings);
            thread::yield_now();
        }
        while let Some(index) = self.rings.fragments.take_from_device() {
            let buffer = self.take_fragment_buffer(index);
            self.pool.deref(buffer);
        }
        self.indicate();

        let mut returns = self.shared.returns.lock();
        if returns.outstanding > 0 {
            debug!(
                "rx{}: waiting for {} indicated lists",
                self.queue_id, returns.outstanding
            );
        }
        while returns.outstanding > 0 {
            self.shared.returned.wait(&mut returns);
        }
        drop(returns);
        self.shared.status.set(QueueState::Stopped);
        debug!("rx{}: stopped", self.queue_id);
    }
}
