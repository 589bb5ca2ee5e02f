//! A simulated device that wires every transmit queue back to a receive
//! queue.
//!
//! Transmit queue `i` delivers into receive queue `i % n` through a bounded
//! single-producer ring. Checksum and segmentation requests survive the trip
//! as receive metadata, the way a device that checks and coalesces would
//! report them.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering, fence};

use log::{debug, trace};
use parking_lot::Mutex;
use ringbuf::traits::{Consumer as RbConsumer, Producer as RbProducer, Split};
use ringbuf::{HeapCons, HeapProd, HeapRb};

use crate::device::{
    DeviceCapabilities, NetDevice, PacketQueue, QueueSetup, RxCapabilities, TxCapabilities,
};
use crate::errors::{Error, Result};
use crate::exec::QueueNotifier;
use crate::ring::{RingCollection, RingExtension};
use crate::ring::element::{
    ChecksumAction, ChecksumEvaluation, NetFragmentVirtualAddress, NetPacketGso,
    NetPacketIeee8021Q, NetPacketLayout, NetPacketRsc, NetPacketRxChecksum, NetPacketTxChecksum,
};

/// Frames each wire holds before transmit stalls.
pub const DEFAULT_WIRE_CAPACITY: usize = 1024;

#[derive(Debug)]
struct Frame {
    bytes: Vec<u8>,
    layout: NetPacketLayout,
    checksum: NetPacketTxChecksum,
    gso: NetPacketGso,
    ieee8021q: NetPacketIeee8021Q,
}

impl Frame {
    fn rx_checksum(&self) -> NetPacketRxChecksum {
        let evaluate = |action| match action {
            ChecksumAction::Required => ChecksumEvaluation::Valid,
            ChecksumAction::Passthrough => ChecksumEvaluation::NotChecked,
        };
        NetPacketRxChecksum::new(
            ChecksumEvaluation::Valid,
            evaluate(self.checksum.layer3),
            evaluate(self.checksum.layer4),
        )
    }

    /// Segments the device would have cut the frame into.
    fn rsc(&self) -> NetPacketRsc {
        let mss = self.gso.tcp_mss.max(self.gso.udp_mss) as usize;
        if mss == 0 {
            return NetPacketRsc::default();
        }
        let payload = self
            .bytes
            .len()
            .saturating_sub(self.layout.total_header_length());
        NetPacketRsc {
            coalesced_segment_count: payload.div_ceil(mss).max(1) as u16,
            ..Default::default()
        }
    }
}

struct RxPort {
    producer: Mutex<HeapProd<Frame>>,
    notify_enabled: AtomicBool,
    notifier: QueueNotifier,
    /// Transmit queues stalled on a full wire.
    space_waiters: Mutex<Vec<QueueNotifier>>,
}

impl RxPort {
    fn wake_receiver(&self) {
        fence(Ordering::SeqCst);
        if self.notify_enabled.load(Ordering::SeqCst) {
            self.notifier.notify();
        }
    }

    fn wake_senders(&self) {
        let waiters = std::mem::take(&mut *self.space_waiters.lock());
        for waiter in waiters {
            waiter.notify();
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LoopbackStats {
    pub frames: u64,
    pub bytes: u64,
    /// Frames sent with no receive queue open.
    pub unrouted: u64,
}

#[derive(Default)]
struct LoopbackShared {
    ports: Mutex<Vec<Option<Arc<RxPort>>>>,
    frames: AtomicU64,
    bytes: AtomicU64,
    unrouted: AtomicU64,
}

impl LoopbackShared {
    fn port_for(&self, tx_queue: u32) -> Option<Arc<RxPort>> {
        let ports = self.ports.lock();
        let open: Vec<&Arc<RxPort>> = ports.iter().flatten().collect();
        if open.is_empty() {
            return None;
        }
        Some(open[tx_queue as usize % open.len()].clone())
    }
}

pub struct LoopbackDevice {
    capabilities: DeviceCapabilities,
    wire_capacity: usize,
    shared: Arc<LoopbackShared>,
}

impl LoopbackDevice {
    pub fn new(capabilities: DeviceCapabilities) -> Self {
        Self::with_wire_capacity(capabilities, DEFAULT_WIRE_CAPACITY)
    }

    pub fn with_wire_capacity(capabilities: DeviceCapabilities, wire_capacity: usize) -> Self {
        Self {
            capabilities,
            wire_capacity: wire_capacity.max(1),
            shared: Arc::new(LoopbackShared::default()),
        }
    }

    /// Capabilities of a loopback that offloads everything it can.
    pub fn offload_capabilities(queues: u32) -> DeviceCapabilities {
        DeviceCapabilities {
            tx: TxCapabilities {
                max_queues: queues,
                checksum: true,
                max_offload_size: 64 * 1024,
                ieee8021q: true,
                ..Default::default()
            },
            rx: RxCapabilities {
                max_queues: queues,
                checksum: true,
                rsc: true,
                ieee8021q: true,
                ..Default::default()
            },
        }
    }

    pub fn stats(&self) -> LoopbackStats {
        LoopbackStats {
            frames: self.shared.frames.load(Ordering::Relaxed),
            bytes: self.shared.bytes.load(Ordering::Relaxed),
            unrouted: self.shared.unrouted.load(Ordering::Relaxed),
        }
    }
}

impl NetDevice for LoopbackDevice {
    fn capabilities(&self) -> DeviceCapabilities {
        self.capabilities.clone()
    }

    fn create_tx_queue(&self, setup: QueueSetup) -> Result<Box<dyn PacketQueue>> {
        if setup.queue_id >= self.capabilities.tx.max_queues {
            return Err(Error::InvalidParameter("transmit queue id out of range"));
        }
        debug!("loopback: tx{} opened", setup.queue_id);
        Ok(Box::new(LoopbackTxQueue {
            queue_id: setup.queue_id,
            shared: self.shared.clone(),
            notifier: setup.notifier,
            notify: false,
            stalled_on: None,
        }))
    }

    fn create_rx_queue(&self, setup: QueueSetup) -> Result<Box<dyn PacketQueue>> {
        let queue_id = setup.queue_id as usize;
        if setup.queue_id >= self.capabilities.rx.max_queues {
            return Err(Error::InvalidParameter("receive queue id out of range"));
        }
        let (producer, consumer) = HeapRb::<Frame>::new(self.wire_capacity).split();
        let port = Arc::new(RxPort {
            producer: Mutex::new(producer),
            notify_enabled: AtomicBool::new(false),
            notifier: setup.notifier,
            space_waiters: Mutex::new(Vec::new()),
        });
        {
            let mut ports = self.shared.ports.lock();
            if ports.len() <= queue_id {
                ports.resize(queue_id + 1, None);
            }
            ports[queue_id] = Some(port.clone());
        }
        debug!("loopback: rx{queue_id} opened");
        Ok(Box::new(LoopbackRxQueue {
            queue_id: setup.queue_id,
            shared: self.shared.clone(),
            port,
            consumer,
            pending: None,
        }))
    }
}

fn packet_extension<X: RingExtension + Default>(rings: &RingCollection, index: u32) -> X {
    rings
        .packet_extension::<X>()
        .map(|extension| *rings.packets.extension(index, extension))
        .unwrap_or_default()
}

struct LoopbackTxQueue {
    queue_id: u32,
    shared: Arc<LoopbackShared>,
    notifier: QueueNotifier,
    notify: bool,
    stalled_on: Option<Arc<RxPort>>,
}

impl LoopbackTxQueue {
    /// Asks the receiver to signal once it has drained the wire.
    fn wait_for_space(&self) {
        if let Some(port) = &self.stalled_on {
            port.space_waiters.lock().push(self.notifier.clone());
        }
    }

    fn read_frame(rings: &RingCollection, index: u32) -> Frame {
        let packet = rings.packets.element(index);
        let mut bytes = Vec::new();
        if let Some(va) = rings.fragment_extension::<NetFragmentVirtualAddress>() {
            for fragment_index in rings.packet_fragments(index) {
                let fragment = rings.fragments.element(fragment_index);
                let address = rings.fragments.extension(fragment_index, va).virtual_address;
                // SAFETY: the translator keeps every fragment it gave mapped
                // until the device returns the packet.
                let data = unsafe {
                    std::slice::from_raw_parts(
                        (address + fragment.offset) as *const u8,
                        fragment.valid_length as usize,
                    )
                };
                bytes.extend_from_slice(data);
            }
        }
        Frame {
            bytes,
            layout: packet.layout,
            checksum: packet_extension(rings, index),
            gso: packet_extension(rings, index),
            ieee8021q: packet_extension(rings, index),
        }
    }
}

impl PacketQueue for LoopbackTxQueue {
    fn advance(&mut self, rings: &mut RingCollection) {
        let owned = rings.packets.owned_by_device();
        if owned.is_empty() {
            self.stalled_on = None;
            return;
        }
        let port = self.shared.port_for(self.queue_id);
        let mut sent = 0;
        let mut fragment_end = rings.fragments.begin_index();
        let mut delivered = false;
        {
            let mut producer = port.as_ref().map(|p| p.producer.lock());
            for index in owned {
                let packet = *rings.packets.element(index);
                if !packet.ignore {
                    match producer.as_mut() {
                        Some(producer) => {
                            let frame = Self::read_frame(rings, index);
                            let length = frame.bytes.len() as u64;
                            if producer.try_push(frame).is_err() {
                                break;
                            }
                            self.shared.frames.fetch_add(1, Ordering::Relaxed);
                            self.shared.bytes.fetch_add(length, Ordering::Relaxed);
                            delivered = true;
                        }
                        None => {
                            self.shared.unrouted.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                }
                if packet.fragment_count > 0 {
                    fragment_end = packet.fragment_index + packet.fragment_count as u32;
                }
                sent += 1;
            }
        }
        if sent > 0 {
            rings.fragments.complete_to(fragment_end);
            rings.packets.complete(sent);
            trace!("loopback: tx{} sent {sent}", self.queue_id);
        }
        match port {
            Some(port) => {
                if delivered {
                    port.wake_receiver();
                }
                self.stalled_on = (!rings.packets.owned_by_device().is_empty()).then_some(port);
            }
            None => self.stalled_on = None,
        }
        if self.notify {
            self.wait_for_space();
        }
    }

    fn set_notification_enabled(&mut self, enabled: bool) {
        self.notify = enabled;
        if enabled {
            self.wait_for_space();
        }
    }

    fn cancel(&mut self, rings: &mut RingCollection) {
        let owned = rings.packets.owned_by_device();
        for index in owned {
            let packet = rings.packets.element_mut(index);
            packet.ignore = true;
        }
        rings.packets.complete(owned.count());
        rings.fragments.complete(rings.fragments.owned_by_device().count());
        self.stalled_on = None;
        debug!("loopback: tx{} cancelled", self.queue_id);
    }
}

struct LoopbackRxQueue {
    queue_id: u32,
    shared: Arc<LoopbackShared>,
    port: Arc<RxPort>,
    consumer: HeapCons<Frame>,
    /// Popped from the wire, waiting for ring space.
    pending: Option<Frame>,
}

impl LoopbackRxQueue {
    /// Writes `frame` into the next owned packet. Hands the frame back if
    /// the rings lack room.
    fn receive(&self, rings: &mut RingCollection, frame: Frame) -> std::result::Result<(), Frame> {
        if rings.packets.owned_by_device().is_empty() {
            return Err(frame);
        }
        let Some(va) = rings.fragment_extension::<NetFragmentVirtualAddress>() else {
            return Err(frame);
        };
        let owned_fragments = rings.fragments.owned_by_device();
        let first = rings.fragments.begin_index();
        let capacity = rings.fragments.element(first).capacity.max(1) as usize;
        let needed = frame.bytes.len().div_ceil(capacity).max(1);
        if needed > owned_fragments.count() as usize {
            return Err(frame);
        }

        let mut chunks = frame.bytes.chunks(capacity);
        for fragment_index in owned_fragments.iter().take(needed) {
            let chunk = chunks.next().unwrap_or(&[]);
            let address = rings.fragments.extension(fragment_index, va).virtual_address;
            // SAFETY: the fragment's buffer is posted to the device and holds
            // `capacity` bytes.
            unsafe {
                std::ptr::copy_nonoverlapping(chunk.as_ptr(), address as *mut u8, chunk.len());
            }
            let fragment = rings.fragments.element_mut(fragment_index);
            fragment.valid_length = chunk.len() as u64;
            fragment.offset = 0;
        }

        let index = rings.packets.begin_index();
        if let Some(extension) = rings.packet_extension::<NetPacketRxChecksum>() {
            *rings.packets.extension_mut(index, extension) = frame.rx_checksum();
        }
        if let Some(extension) = rings.packet_extension::<NetPacketRsc>() {
            *rings.packets.extension_mut(index, extension) = frame.rsc();
        }
        if let Some(extension) = rings.packet_extension::<NetPacketIeee8021Q>() {
            *rings.packets.extension_mut(index, extension) = frame.ieee8021q;
        }
        let packet = rings.packets.element_mut(index);
        packet.fragment_index = first;
        packet.fragment_count = needed as u16;
        packet.ignore = false;
        packet.layout = NetPacketLayout::default();

        rings.fragments.complete(needed as u32);
        rings.packets.complete(1);
        Ok(())
    }
}

impl PacketQueue for LoopbackRxQueue {
    fn advance(&mut self, rings: &mut RingCollection) {
        let mut received = 0;
        loop {
            let Some(frame) = self.pending.take().or_else(|| self.consumer.try_pop()) else {
                break;
            };
            if let Err(frame) = self.receive(rings, frame) {
                self.pending = Some(frame);
                break;
            }
            received += 1;
        }
        if received > 0 {
            trace!("loopback: rx{} received {received}", self.queue_id);
            self.port.wake_senders();
        }
    }

    fn set_notification_enabled(&mut self, enabled: bool) {
        self.port.notify_enabled.store(enabled, Ordering::SeqCst);
        fence(Ordering::SeqCst);
    }

    fn cancel(&mut self, rings: &mut RingCollection) {
        let owned = rings.packets.owned_by_device();
        for index in owned {
            let packet = rings.packets.element_mut(index);
            packet.ignore = true;
            packet.fragment_count = 0;
        }
        rings.packets.complete(owned.count());
        rings.fragments.complete(rings.fragments.owned_by_device().count());
        self.pending = None;
        self.port.wake_senders();
        debug!("loopback: rx{} cancelled", self.queue_id);
    }
}

impl Drop for LoopbackRxQueue {
    fn drop(&mut self) {
        let mut ports = self.shared.ports.lock();
        if let Some(slot) = ports.get_mut(self.queue_id as usize) {
            if slot.as_ref().is_some_and(|p| Arc::ptr_eq(p, &self.port)) {
                *slot = None;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::ExecutionContext;
    use crate::ring::element::NetFragment;
    use crate::rx::rx_extensions;
    use crate::tx::tx_extensions;

    fn idle_context() -> ExecutionContext {
        ExecutionContext::initialize("loopback-test", |worker| {
            worker.wait_for_start();
        })
        .unwrap()
    }

    fn setup(queue_id: u32, ec: &ExecutionContext) -> QueueSetup {
        QueueSetup {
            queue_id,
            notifier: ec.notifier(),
        }
    }

    fn give_tx(rings: &mut RingCollection, data: &[u8], checksum: NetPacketTxChecksum) {
        let va = rings.fragment_extension::<NetFragmentVirtualAddress>().unwrap();
        let fragment_index = rings.fragments.next_to_give_to_device().unwrap();
        *rings.fragments.element_mut(fragment_index) = NetFragment {
            valid_length: data.len() as u64,
            capacity: data.len() as u64,
            offset: 0,
        };
        rings.fragments.extension_mut(fragment_index, va).virtual_address = data.as_ptr() as u64;
        rings.fragments.give_to_device();

        let index = rings.packets.next_to_give_to_device().unwrap();
        let tx_checksum = rings.packet_extension::<NetPacketTxChecksum>().unwrap();
        *rings.packets.extension_mut(index, tx_checksum) = checksum;
        let packet = rings.packets.element_mut(index);
        packet.fragment_index = fragment_index;
        packet.fragment_count = 1;
        packet.ignore = false;
        rings.packets.give_to_device();
    }

    fn post_rx(rings: &mut RingCollection, buffers: &mut [Vec<u8>]) {
        let va = rings.fragment_extension::<NetFragmentVirtualAddress>().unwrap();
        for buffer in buffers.iter_mut() {
            let index = rings.fragments.next_to_give_to_device().unwrap();
            *rings.fragments.element_mut(index) = NetFragment {
                valid_length: 0,
                capacity: buffer.len() as u64,
                offset: 0,
            };
            rings.fragments.extension_mut(index, va).virtual_address = buffer.as_mut_ptr() as u64;
            rings.fragments.give_to_device();
        }
        while rings.packets.next_to_give_to_device().is_some() {
            rings.packets.give_to_device();
        }
    }

    #[test]
    fn frame_crosses_with_checksum_verdict() {
        let capabilities = LoopbackDevice::offload_capabilities(1);
        let device = LoopbackDevice::new(capabilities.clone());
        let ec = idle_context();
        let mut tx = device.create_tx_queue(setup(0, &ec)).unwrap();
        let mut rx = device.create_rx_queue(setup(0, &ec)).unwrap();
        let mut tx_rings =
            RingCollection::new(8, 8, &tx_extensions(&capabilities.tx).unwrap()).unwrap();
        let mut rx_rings =
            RingCollection::new(8, 8, &rx_extensions(&capabilities.rx).unwrap()).unwrap();

        let data: Vec<u8> = (0..100u8).collect();
        give_tx(
            &mut tx_rings,
            &data,
            NetPacketTxChecksum {
                layer4: ChecksumAction::Required,
                ..Default::default()
            },
        );
        tx.advance(&mut tx_rings);
        assert_eq!(tx_rings.packets.take_from_device(), Some(0));
        assert_eq!(tx_rings.fragments.take_from_device(), Some(0));
        assert_eq!(device.stats().frames, 1);

        let mut buffers = vec![vec![0u8; 64]; 4];
        post_rx(&mut rx_rings, &mut buffers);
        rx.advance(&mut rx_rings);
        let index = rx_rings.packets.take_from_device().unwrap();
        let packet = *rx_rings.packets.element(index);
        assert_eq!(packet.fragment_count, 2);
        assert_eq!(rx_rings.fragments.element(0).valid_length, 64);
        assert_eq!(rx_rings.fragments.element(1).valid_length, 36);
        assert_eq!(&buffers[0][..], &data[..64]);
        assert_eq!(&buffers[1][..36], &data[64..]);

        let rx_checksum = rx_rings.packet_extension::<NetPacketRxChecksum>().unwrap();
        let verdict = *rx_rings.packets.extension(index, rx_checksum);
        assert_eq!(verdict.layer4, ChecksumEvaluation::Valid);
        assert_eq!(verdict.layer3, ChecksumEvaluation::NotChecked);
    }

    #[test]
    fn full_wire_holds_packets_back() {
        let capabilities = LoopbackDevice::offload_capabilities(1);
        let device = LoopbackDevice::with_wire_capacity(capabilities.clone(), 1);
        let ec = idle_context();
        let mut tx = device.create_tx_queue(setup(0, &ec)).unwrap();
        let mut rx = device.create_rx_queue(setup(0, &ec)).unwrap();
        let mut tx_rings =
            RingCollection::new(8, 8, &tx_extensions(&capabilities.tx).unwrap()).unwrap();
        let mut rx_rings =
            RingCollection::new(8, 8, &rx_extensions(&capabilities.rx).unwrap()).unwrap();

        let data = [7u8; 32];
        give_tx(&mut tx_rings, &data, NetPacketTxChecksum::default());
        give_tx(&mut tx_rings, &data, NetPacketTxChecksum::default());
        tx.advance(&mut tx_rings);
        assert_eq!(tx_rings.packets.returned().count(), 1);
        assert_eq!(tx_rings.packets.owned_by_device().count(), 1);

        let mut buffers = vec![vec![0u8; 64]; 4];
        post_rx(&mut rx_rings, &mut buffers);
        rx.advance(&mut rx_rings);
        tx.advance(&mut tx_rings);
        assert_eq!(tx_rings.packets.returned().count(), 2);
        assert_eq!(tx_rings.fragments.returned().count(), 2);
    }

    #[test]
    fn send_without_receiver_is_unrouted() {
        let capabilities = LoopbackDevice::offload_capabilities(1);
        let device = LoopbackDevice::new(capabilities.clone());
        let ec = idle_context();
        let mut tx = device.create_tx_queue(setup(0, &ec)).unwrap();
        let mut tx_rings =
            RingCollection::new(8, 8, &tx_extensions(&capabilities.tx).unwrap()).unwrap();
        let data = [1u8; 16];
        give_tx(&mut tx_rings, &data, NetPacketTxChecksum::default());
        tx.advance(&mut tx_rings);
        assert_eq!(tx_rings.packets.returned().count(), 1);
        assert_eq!(device.stats().unrouted, 1);
    }

    #[test]
    fn cancel_returns_posted_packets_ignored() {
        let capabilities = LoopbackDevice::offload_capabilities(1);
        let device = LoopbackDevice::new(capabilities.clone());
        let ec = idle_context();
        let mut rx = device.create_rx_queue(setup(0, &ec)).unwrap();
        let mut rx_rings =
            RingCollection::new(4, 8, &rx_extensions(&capabilities.rx).unwrap()).unwrap();
        let mut buffers = vec![vec![0u8; 64]; 2];
        post_rx(&mut rx_rings, &mut buffers);

        rx.cancel(&mut rx_rings);
        assert!(rx_rings.packets.owned_by_device().is_empty());
        assert!(rx_rings.fragments.owned_by_device().is_empty());
        while let Some(index) = rx_rings.packets.take_from_device() {
            let packet = rx_rings.packets.element(index);
            assert!(packet.ignore);
            assert_eq!(packet.fragment_count, 0);
        }
    }

    #[test]
    fn queue_ids_beyond_capabilities_are_rejected() {
        let device = LoopbackDevice::new(LoopbackDevice::offload_capabilities(2));
        let ec = idle_context();
        assert!(device.create_tx_queue(setup(2, &ec)).is_err());
        assert!(device.create_rx_queue(setup(5, &ec)).is_err());
    }
}
