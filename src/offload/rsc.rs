use crate::ring::element::NetPacketRsc;

/// Receive segment coalescing result reported to the OS.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RscInfo {
    pub coalesced_segment_count: u16,
    pub duplicate_ack_count: u16,
    /// Microseconds between the first and last coalesced segment.
    pub timestamp_delta: u32,
}

impl RscInfo {
    pub fn is_coalesced(&self) -> bool {
        self.coalesced_segment_count > 0
    }
}

/// A packet that was not coalesced reports nothing, whatever else the
/// device left in the record.
pub fn translate_rx_packet_rsc(rsc: &NetPacketRsc) -> RscInfo {
    if rsc.coalesced_segment_count == 0 {
        return RscInfo::default();
    }
    RscInfo {
        coalesced_segment_count: rsc.coalesced_segment_count,
        duplicate_ack_count: rsc.duplicate_ack_count,
        timestamp_delta: rsc.timestamp_delta,
    }
}

pub fn rsc_to_packet(info: &RscInfo) -> NetPacketRsc {
    NetPacketRsc {
        coalesced_segment_count: info.coalesced_segment_count,
        duplicate_ack_count: info.duplicate_ack_count,
        timestamp_delta: info.timestamp_delta,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn coalesced_packets_round_trip() {
        let info = RscInfo {
            coalesced_segment_count: 12,
            duplicate_ack_count: 1,
            timestamp_delta: 40,
        };
        assert_eq!(translate_rx_packet_rsc(&rsc_to_packet(&info)), info);
    }

    #[test]
    fn stale_fields_are_ignored_without_coalescing() {
        let rsc = NetPacketRsc {
            coalesced_segment_count: 0,
            duplicate_ack_count: 3,
            timestamp_delta: 7,
        };
        assert!(!translate_rx_packet_rsc(&rsc).is_coalesced());
        assert_eq!(translate_rx_packet_rsc(&rsc), RscInfo::default());
    }
}
