//! The adapter driver as the translator sees it.

use std::sync::Arc;

use crate::dma::DmaAdapter;
use crate::errors::Result;
use crate::exec::QueueNotifier;
use crate::ring::RingCollection;
use crate::ring::element::Layer2Type;

/// How fragment memory must be described to the device.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum MappingRequirement {
    /// Virtual addresses are enough.
    #[default]
    None,
    /// Every fragment needs a logical address the device can reach.
    DmaMapped,
}

#[derive(Clone)]
pub struct TxCapabilities {
    pub max_queues: u32,
    pub packet_ring_size: u32,
    pub fragment_ring_size: u32,
    pub max_fragments_per_packet: u16,
    pub mapping_requirement: MappingRequirement,
    /// Required when `mapping_requirement` is `DmaMapped`.
    pub dma_adapter: Option<Arc<dyn DmaAdapter>>,
    /// Highest bus address the device can reach; bounds the bounce pool.
    pub max_physical_address: u64,
    pub layer2_type: Layer2Type,
    pub checksum: bool,
    /// Zero disables large send and UDP segmentation.
    pub max_offload_size: usize,
    pub ieee8021q: bool,
}

impl Default for TxCapabilities {
    fn default() -> Self {
        Self {
            max_queues: 1,
            packet_ring_size: 256,
            fragment_ring_size: 512,
            max_fragments_per_packet: 8,
            mapping_requirement: MappingRequirement::None,
            dma_adapter: None,
            max_physical_address: u64::MAX,
            layer2_type: Layer2Type::Ethernet,
            checksum: false,
            max_offload_size: 0,
            ieee8021q: false,
        }
    }
}

impl std::fmt::Debug for TxCapabilities {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TxCapabilities")
            .field("max_queues", &self.max_queues)
            .field("packet_ring_size", &self.packet_ring_size)
            .field("fragment_ring_size", &self.fragment_ring_size)
            .field("max_fragments_per_packet", &self.max_fragments_per_packet)
            .field("mapping_requirement", &self.mapping_requirement)
            .field("checksum", &self.checksum)
            .field("max_offload_size", &self.max_offload_size)
            .field("ieee8021q", &self.ieee8021q)
            .finish_non_exhaustive()
    }
}

#[derive(Clone, Debug)]
pub struct RxCapabilities {
    pub max_queues: u32,
    pub packet_ring_size: u32,
    pub fragment_ring_size: u32,
    pub buffer_size: usize,
    pub buffer_alignment: usize,
    pub mapping_requirement: MappingRequirement,
    pub max_physical_address: u64,
    pub layer2_type: Layer2Type,
    pub checksum: bool,
    pub rsc: bool,
    pub ieee8021q: bool,
}

impl Default for RxCapabilities {
    fn default() -> Self {
        Self {
            max_queues: 1,
            packet_ring_size: 256,
            fragment_ring_size: 256,
            buffer_size: 2048,
            buffer_alignment: 64,
            mapping_requirement: MappingRequirement::None,
            max_physical_address: u64::MAX,
            layer2_type: Layer2Type::Ethernet,
            checksum: false,
            rsc: false,
            ieee8021q: false,
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct DeviceCapabilities {
    pub tx: TxCapabilities,
    pub rx: RxCapabilities,
}

/// What a device queue gets when it is created.
#[derive(Clone, Debug)]
pub struct QueueSetup {
    pub queue_id: u32,
    /// Wakes the queue's worker, e.g. on asynchronous completions.
    pub notifier: QueueNotifier,
}

/// One device queue, driven from its execution context only.
///
/// A device returns a packet by moving the `begin` cursor of the packet
/// ring, and must have returned the packet's fragments by then.
pub trait PacketQueue: Send {
    /// Consumes what software gave and returns what is done.
    fn advance(&mut self, rings: &mut RingCollection);

    /// With notifications enabled the device signals its notifier once more
    /// work is ready for [`advance`](Self::advance).
    fn set_notification_enabled(&mut self, enabled: bool);

    /// Returns everything the device owns, unsent or unfilled packets marked
    /// `ignore`.
    fn cancel(&mut self, rings: &mut RingCollection);
}

pub trait NetDevice: Send + Sync {
    fn capabilities(&self) -> DeviceCapabilities;

    fn create_tx_queue(&self, setup: QueueSetup) -> Result<Box<dyn PacketQueue>>;

    fn create_rx_queue(&self, setup: QueueSetup) -> Result<Box<dyn PacketQueue>>;
}
