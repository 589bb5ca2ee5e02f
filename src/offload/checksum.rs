use crate::ring::element::{
    ChecksumAction, ChecksumEvaluation, Layer4Type, NetPacketLayout, NetPacketRxChecksum,
    NetPacketTxChecksum,
};

/// Per-packet transmit checksum request as the OS stack states it.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TxChecksumInfo {
    pub is_ipv4: bool,
    pub is_ipv6: bool,
    pub ip_header_checksum: bool,
    pub tcp_checksum: bool,
    pub udp_checksum: bool,
    pub tcp_header_offset: u16,
}

impl TxChecksumInfo {
    pub fn is_requested(&self) -> bool {
        self.ip_header_checksum || self.tcp_checksum || self.udp_checksum
    }
}

/// Per-packet receive checksum verdict as the OS stack expects it.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RxChecksumInfo {
    pub ip_checksum_succeeded: bool,
    pub ip_checksum_failed: bool,
    pub tcp_checksum_succeeded: bool,
    pub tcp_checksum_failed: bool,
    pub udp_checksum_succeeded: bool,
    pub udp_checksum_failed: bool,
}

fn action(required: bool) -> ChecksumAction {
    if required {
        ChecksumAction::Required
    } else {
        ChecksumAction::Passthrough
    }
}

pub fn translate_tx_packet_checksum(
    layout: &NetPacketLayout,
    info: &TxChecksumInfo,
) -> NetPacketTxChecksum {
    let layer4 = match layout.layer4_type {
        Layer4Type::Tcp => info.tcp_checksum,
        Layer4Type::Udp => info.udp_checksum,
        _ => false,
    };
    NetPacketTxChecksum {
        layer3: action(info.ip_header_checksum && layout.layer3_type.is_ipv4()),
        layer4: action(layer4),
    }
}

/// Rebuilds the OS request a ring checksum record stands for.
pub fn tx_checksum_info_from_packet(
    layout: &NetPacketLayout,
    checksum: &NetPacketTxChecksum,
) -> TxChecksumInfo {
    let layer4 = checksum.layer4 == ChecksumAction::Required;
    let tcp_checksum = layer4 && layout.layer4_type == Layer4Type::Tcp;
    TxChecksumInfo {
        is_ipv4: layout.layer3_type.is_ipv4(),
        is_ipv6: layout.layer3_type.is_ipv6(),
        ip_header_checksum: checksum.layer3 == ChecksumAction::Required,
        tcp_checksum,
        udp_checksum: layer4 && layout.layer4_type == Layer4Type::Udp,
        tcp_header_offset: if tcp_checksum {
            layout.layer4_offset() as u16
        } else {
            0
        },
    }
}

/// Returns `None` when the device flagged the layer 2 checksum as bad; such
/// frames are dropped rather than indicated.
pub fn translate_rx_packet_checksum(
    layout: &NetPacketLayout,
    checksum: &NetPacketRxChecksum,
) -> Option<RxChecksumInfo> {
    if checksum.layer2 == ChecksumEvaluation::Invalid {
        return None;
    }
    let mut info = RxChecksumInfo::default();
    if layout.layer3_type.is_ipv4() {
        info.ip_checksum_succeeded = checksum.layer3 == ChecksumEvaluation::Valid;
        info.ip_checksum_failed = checksum.layer3 == ChecksumEvaluation::Invalid;
    }
    let (succeeded, failed) = match layout.layer4_type {
        Layer4Type::Tcp => (&mut info.tcp_checksum_succeeded, &mut info.tcp_checksum_failed),
        Layer4Type::Udp => (&mut info.udp_checksum_succeeded, &mut info.udp_checksum_failed),
        _ => return Some(info),
    };
    *succeeded = checksum.layer4 == ChecksumEvaluation::Valid;
    *failed = checksum.layer4 == ChecksumEvaluation::Invalid;
    Some(info)
}

fn evaluation(succeeded: bool, failed: bool) -> ChecksumEvaluation {
    match (succeeded, failed) {
        (_, true) => ChecksumEvaluation::Invalid,
        (true, false) => ChecksumEvaluation::Valid,
        (false, false) => ChecksumEvaluation::NotChecked,
    }
}

pub fn rx_checksum_to_packet(layout: &NetPacketLayout, info: &RxChecksumInfo) -> NetPacketRxChecksum {
    let layer3 = if layout.layer3_type.is_ipv4() {
        evaluation(info.ip_checksum_succeeded, info.ip_checksum_failed)
    } else {
        ChecksumEvaluation::NotChecked
    };
    let layer4 = match layout.layer4_type {
        Layer4Type::Tcp => evaluation(info.tcp_checksum_succeeded, info.tcp_checksum_failed),
        Layer4Type::Udp => evaluation(info.udp_checksum_succeeded, info.udp_checksum_failed),
        _ => ChecksumEvaluation::NotChecked,
    };
    NetPacketRxChecksum::new(ChecksumEvaluation::NotChecked, layer3, layer4)
}
