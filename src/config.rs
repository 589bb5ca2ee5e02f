use eui48::MacAddress;

/// Ring sizes; `None` takes what the device advertises.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RingConfig {
    pub packet_count: Option<u32>,
    pub fragment_count: Option<u32>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RxConfig {
    /// Buffers per receive queue.
    pub buffer_count: u32,
    /// Overrides the device buffer size.
    pub buffer_size: Option<usize>,
}

impl Default for RxConfig {
    fn default() -> Self {
        Self {
            buffer_count: 512,
            buffer_size: None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BounceConfig {
    pub enabled: bool,
    /// Buffers per transmit queue.
    pub buffer_count: u32,
    pub buffer_size: usize,
}

impl Default for BounceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            buffer_count: 256,
            buffer_size: 2048,
        }
    }
}

/// Demux keys applied in order; an empty config means one transmit queue.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TxScalingConfig {
    pub user_priority: bool,
    pub peers: Vec<MacAddress>,
    pub wmm: bool,
}

impl TxScalingConfig {
    pub fn is_empty(&self) -> bool {
        !self.user_priority && self.peers.is_empty() && !self.wmm
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DatapathConfig {
    pub tx_ring: RingConfig,
    pub rx_ring: RingConfig,
    pub rx: RxConfig,
    pub bounce: BounceConfig,
    pub tx_scaling: TxScalingConfig,
    /// `None` opens every receive queue the device offers.
    pub rx_queue_count: Option<u32>,
}

impl DatapathConfig {
    /// Resolves a requested ring size against the device's.
    pub(crate) fn ring_size(requested: Option<u32>, device: u32) -> u32 {
        requested.unwrap_or(device).max(2).next_power_of_two()
    }
}
