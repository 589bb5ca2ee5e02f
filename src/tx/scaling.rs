//! Spreading transmit traffic over queues.
//!
//! Each demux key maps a buffer list to a value in `0..range`. Keys compose
//! in order into one queue index, `index = index * range + value`, so the
//! queue count is the product of the ranges. A value equal to the range
//! means the list fits no queue.

use eui48::MacAddress;

use crate::config::TxScalingConfig;
use crate::nbl::NetBufferList;
use crate::ring::element::Layer2Type;

pub trait Demux: Send + Sync {
    fn range(&self) -> u32;

    /// `range()` when the list fits no queue.
    fn value(&self, list: &NetBufferList) -> u32;
}

/// By 802.1p user priority.
#[derive(Debug, Default)]
pub struct UserPriorityDemux;

impl Demux for UserPriorityDemux {
    fn range(&self) -> u32 {
        8
    }

    fn value(&self, list: &NetBufferList) -> u32 {
        list.info.ieee8021q.user_priority as u32 & 7
    }
}

/// By destination peer. Group addresses share the last value.
#[derive(Debug)]
pub struct PeerAddressDemux {
    peers: Vec<MacAddress>,
}

impl PeerAddressDemux {
    pub fn new(peers: Vec<MacAddress>) -> Self {
        Self { peers }
    }

    fn destination(list: &NetBufferList) -> Option<MacAddress> {
        let buffer = list.buffers.first()?;
        let mut header = [0u8; 10];
        let copied = buffer.copy_to(&mut header);
        let at = match list.info.frame_type {
            Layer2Type::Ethernet => 0,
            Layer2Type::Ieee80211 => 4,
            _ => return None,
        };
        if copied < at + 6 {
            return None;
        }
        let mut address = [0u8; 6];
        address.copy_from_slice(&header[at..at + 6]);
        Some(MacAddress::new(address))
    }
}

impl Demux for PeerAddressDemux {
    fn range(&self) -> u32 {
        self.peers.len() as u32 + 1
    }

    fn value(&self, list: &NetBufferList) -> u32 {
        let Some(destination) = Self::destination(list) else {
            return self.range();
        };
        if destination.is_broadcast() || destination.is_multicast() {
            return self.peers.len() as u32;
        }
        self.peers
            .iter()
            .position(|p| *p == destination)
            .map_or(self.range(), |i| i as u32)
    }
}

/// By WMM access category: best effort, background, video, voice.
#[derive(Debug, Default)]
pub struct WmmDemux;

impl Demux for WmmDemux {
    fn range(&self) -> u32 {
        4
    }

    fn value(&self, list: &NetBufferList) -> u32 {
        match list.info.ieee8021q.user_priority & 7 {
            0 | 3 => 0,
            1 | 2 => 1,
            4 | 5 => 2,
            _ => 3,
        }
    }
}

pub struct TxScaling {
    keys: Vec<Box<dyn Demux>>,
}

impl TxScaling {
    pub fn new(keys: Vec<Box<dyn Demux>>) -> Self {
        Self { keys }
    }

    pub fn from_config(config: &TxScalingConfig) -> Self {
        let mut keys: Vec<Box<dyn Demux>> = Vec::new();
        if config.user_priority {
            keys.push(Box::new(UserPriorityDemux));
        }
        if !config.peers.is_empty() {
            keys.push(Box::new(PeerAddressDemux::new(config.peers.clone())));
        }
        if config.wmm {
            keys.push(Box::new(WmmDemux));
        }
        Self::new(keys)
    }

    pub fn queue_count(&self) -> u32 {
        self.keys.iter().map(|k| k.range()).product()
    }

    /// Queue for `list`, or `None` when some key rejects it.
    pub fn queue_for(&self, list: &NetBufferList) -> Option<u32> {
        let mut index = 0;
        for key in &self.keys {
            let value = key.value(list);
            if value >= key.range() {
                return None;
            }
            index = index * key.range() + value;
        }
        Some(index)
    }
}

impl std::fmt::Debug for TxScaling {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TxScaling")
            .field("queue_count", &self.queue_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nbl::{NblInfo, NetBuffer};
    use crate::offload::Ieee8021QInfo;

    const PEERS: [[u8; 6]; 4] = [
        [2, 0, 0, 0, 0, 1],
        [2, 0, 0, 0, 0, 2],
        [2, 0, 0, 0, 0, 3],
        [2, 0, 0, 0, 0, 4],
    ];

    fn frame_to(destination: [u8; 6], priority: u8) -> NetBufferList {
        let mut bytes = destination.to_vec();
        bytes.extend_from_slice(&[2, 0, 0, 0, 0, 9, 0x08, 0x00]);
        bytes.resize(64, 0);
        let info = NblInfo {
            frame_type: Layer2Type::Ethernet,
            ieee8021q: Ieee8021QInfo {
                user_priority: priority,
                vlan_id: 0,
            },
            ..Default::default()
        };
        NetBufferList::single(NetBuffer::from_bytes(&bytes)).with_info(info)
    }

    fn priority_and_peer() -> TxScaling {
        TxScaling::from_config(&TxScalingConfig {
            user_priority: true,
            peers: PEERS.iter().map(|p| MacAddress::new(*p)).collect(),
            wmm: false,
        })
    }

    #[test]
    fn keys_compose_in_order() {
        let scaling = priority_and_peer();
        assert_eq!(scaling.queue_count(), 8 * 5);
        assert_eq!(scaling.queue_for(&frame_to(PEERS[2], 3)), Some(3 * 5 + 2));
        assert_eq!(scaling.queue_for(&frame_to(PEERS[0], 0)), Some(0));
    }

    #[test]
    fn group_addresses_use_the_last_value() {
        let scaling = priority_and_peer();
        assert_eq!(scaling.queue_for(&frame_to([0xff; 6], 1)), Some(5 + 4));
        assert_eq!(
            scaling.queue_for(&frame_to([0x01, 0, 0x5e, 0, 0, 1], 0)),
            Some(4)
        );
    }

    #[test]
    fn unknown_peer_is_rejected() {
        let scaling = priority_and_peer();
        assert_eq!(scaling.queue_for(&frame_to([2, 0, 0, 0, 0, 7], 0)), None);
    }

    #[test]
    fn wmm_access_categories() {
        let wmm = WmmDemux;
        let categories: Vec<u32> = (0..8).map(|p| wmm.value(&frame_to(PEERS[0], p))).collect();
        assert_eq!(categories, vec![0, 1, 1, 0, 2, 2, 3, 3]);
    }

    #[test]
    fn no_keys_means_one_queue() {
        let scaling = TxScaling::from_config(&TxScalingConfig::default());
        assert_eq!(scaling.queue_count(), 1);
        assert_eq!(scaling.queue_for(&frame_to(PEERS[1], 6)), Some(0));
    }
}
