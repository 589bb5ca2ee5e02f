//! Large send (TCP) and UDP segmentation requests.

use crate::errors::{Error, Result};
use crate::ring::element::{Layer4Type, NetPacketGso, NetPacketLayout};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IpVersion {
    V4,
    V6,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum LsoInfo {
    #[default]
    None,
    /// IPv4 only.
    V1 { mss: u32, tcp_header_offset: u16 },
    V2 {
        mss: u32,
        tcp_header_offset: u16,
        ip_version: IpVersion,
    },
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct UsoInfo {
    /// Zero means no segmentation.
    pub mss: u32,
    pub udp_header_offset: u16,
}

impl LsoInfo {
    pub fn is_requested(&self) -> bool {
        *self != LsoInfo::None
    }
}

impl UsoInfo {
    pub fn is_requested(&self) -> bool {
        self.mss != 0
    }
}

fn check_header_offset(layout: &NetPacketLayout, offset: u16) -> Result<()> {
    if offset as usize != layout.layer4_offset() {
        return Err(Error::MalformedPacket("segmentation header offset mismatch"));
    }
    Ok(())
}

/// Maps the OS segmentation request onto the ring's GSO record.
///
/// `packet_length` is the total frame length and must not exceed
/// `max_offload_size`.
pub fn translate_tx_packet_large_send(
    layout: &NetPacketLayout,
    lso: &LsoInfo,
    uso: &UsoInfo,
    packet_length: usize,
    max_offload_size: usize,
) -> Result<NetPacketGso> {
    let lso_request = match *lso {
        LsoInfo::None => None,
        LsoInfo::V1 {
            mss,
            tcp_header_offset,
        } => Some((mss, tcp_header_offset, None)),
        LsoInfo::V2 {
            mss,
            tcp_header_offset,
            ip_version,
        } => Some((mss, tcp_header_offset, Some(ip_version))),
    };
    if lso_request.is_some() && uso.is_requested() {
        return Err(Error::InvalidParameter("both LSO and USO requested"));
    }
    if (lso_request.is_some() || uso.is_requested()) && packet_length > max_offload_size {
        return Err(Error::InvalidParameter("packet exceeds maximum offload size"));
    }

    let Some((mss, offset, ip_version)) = lso_request else {
        if !uso.is_requested() {
            return Ok(NetPacketGso::default());
        }
        if layout.layer4_type != Layer4Type::Udp {
            return Err(Error::MalformedPacket("USO on a non-UDP packet"));
        }
        check_header_offset(layout, uso.udp_header_offset)?;
        return Ok(NetPacketGso {
            tcp_mss: 0,
            udp_mss: uso.mss,
        });
    };

    match ip_version {
        None if !layout.layer3_type.is_ipv4() => {
            return Err(Error::MalformedPacket("LSO v1 on a non-IPv4 packet"));
        }
        Some(IpVersion::V4) if !layout.layer3_type.is_ipv4() => {
            return Err(Error::MalformedPacket("LSO v2 IP version mismatch"));
        }
        Some(IpVersion::V6) if !layout.layer3_type.is_ipv6() => {
            return Err(Error::MalformedPacket("LSO v2 IP version mismatch"));
        }
        _ => {}
    }
    if mss == 0 {
        return Err(Error::InvalidParameter("zero MSS"));
    }
    if layout.layer4_type != Layer4Type::Tcp {
        return Err(Error::MalformedPacket("LSO on a non-TCP packet"));
    }
    check_header_offset(layout, offset)?;
    Ok(NetPacketGso {
        tcp_mss: mss,
        udp_mss: 0,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ring::element::Layer3Type;

    fn layout(layer3_type: Layer3Type, layer4_type: Layer4Type) -> NetPacketLayout {
        let mut layout = NetPacketLayout::default();
        layout.layer2_header_length = 14;
        layout.layer3_type = layer3_type;
        layout.layer3_header_length = 20;
        layout.layer4_type = layer4_type;
        layout.layer4_header_length = 20;
        layout
    }

    #[test]
    fn lso_v2_maps_mss() {
        let layout = layout(Layer3Type::Ipv6NoExtensions, Layer4Type::Tcp);
        let lso = LsoInfo::V2 {
            mss: 1440,
            tcp_header_offset: 34,
            ip_version: IpVersion::V6,
        };
        let gso =
            translate_tx_packet_large_send(&layout, &lso, &UsoInfo::default(), 30_000, 65_536)
                .unwrap();
        assert_eq!(gso, NetPacketGso { tcp_mss: 1440, udp_mss: 0 });
    }

    #[test]
    fn lso_v1_requires_ipv4() {
        let lso = LsoInfo::V1 {
            mss: 1460,
            tcp_header_offset: 34,
        };
        let v4 = layout(Layer3Type::Ipv4NoOptions, Layer4Type::Tcp);
        let v6 = layout(Layer3Type::Ipv6NoExtensions, Layer4Type::Tcp);
        let none = UsoInfo::default();
        assert!(translate_tx_packet_large_send(&v4, &lso, &none, 9000, 65_536).is_ok());
        assert!(matches!(
            translate_tx_packet_large_send(&v6, &lso, &none, 9000, 65_536),
            Err(Error::MalformedPacket(_))
        ));
    }

    #[test]
    fn lso_v2_checks_ip_version() {
        let v4 = layout(Layer3Type::Ipv4NoOptions, Layer4Type::Tcp);
        let none = UsoInfo::default();
        let claims_v6 = LsoInfo::V2 {
            mss: 1440,
            tcp_header_offset: 34,
            ip_version: IpVersion::V6,
        };
        assert!(claims_v6.is_requested());
        assert_eq!(
            translate_tx_packet_large_send(&v4, &claims_v6, &none, 9000, 65_536),
            Err(Error::MalformedPacket("LSO v2 IP version mismatch"))
        );
        let claims_v4 = LsoInfo::V2 {
            mss: 1440,
            tcp_header_offset: 34,
            ip_version: IpVersion::V4,
        };
        assert!(translate_tx_packet_large_send(&v4, &claims_v4, &none, 9000, 65_536).is_ok());
        assert!(!LsoInfo::None.is_requested());
    }

    #[test]
    fn uso_maps_udp_mss() {
        let layout = layout(Layer3Type::Ipv4NoOptions, Layer4Type::Udp);
        let uso = UsoInfo {
            mss: 1472,
            udp_header_offset: 34,
        };
        let gso = translate_tx_packet_large_send(&layout, &LsoInfo::None, &uso, 20_000, 65_536)
            .unwrap();
        assert_eq!(gso.udp_mss, 1472);
        assert_eq!(gso.tcp_mss, 0);
    }

    #[test]
    fn rejects_inconsistent_requests() {
        let tcp = layout(Layer3Type::Ipv4NoOptions, Layer4Type::Tcp);
        let lso = LsoInfo::V1 {
            mss: 1460,
            tcp_header_offset: 34,
        };
        let uso = UsoInfo {
            mss: 1000,
            udp_header_offset: 34,
        };
        let none = UsoInfo::default();
        assert!(translate_tx_packet_large_send(&tcp, &lso, &uso, 9000, 65_536).is_err());
        assert!(translate_tx_packet_large_send(&tcp, &lso, &none, 70_000, 65_536).is_err());
        let skewed = LsoInfo::V1 {
            mss: 1460,
            tcp_header_offset: 38,
        };
        assert!(translate_tx_packet_large_send(&tcp, &skewed, &none, 9000, 65_536).is_err());
        assert!(translate_tx_packet_large_send(&tcp, &LsoInfo::None, &uso, 9000, 65_536).is_err());
    }

    #[test]
    fn no_request_is_no_segmentation() {
        let tcp = layout(Layer3Type::Ipv4NoOptions, Layer4Type::Tcp);
        let gso =
            translate_tx_packet_large_send(&tcp, &LsoInfo::None, &UsoInfo::default(), 100_000, 0)
                .unwrap();
        assert_eq!(gso, NetPacketGso::default());
    }
}
