//! Header layout parsers.
//!
//! Each parser reads the bytes at the offset implied by the layers already
//! parsed, and either fills in its own layer or returns `false` leaving the
//! layout untouched. Truncated headers always fail; an unrecognized upper
//! protocol just ends the walk.

use arrayvec::ArrayVec;

use crate::ring::element::{Layer2Type, Layer3Type, Layer4Type, NetPacketLayout};

/// Enough for Ethernet with two tags and SNAP, IPv6 with a few extension
/// headers and a TCP header with options.
pub const MAX_HEADER_BYTES: usize = 256;

pub type HeaderScratch = ArrayVec<u8, MAX_HEADER_BYTES>;

const ETHERNET_HEADER: usize = 14;
const VLAN_TAG: usize = 4;
const LLC_HEADER: usize = 3;
const SNAP_HEADER: usize = 5;
const MAX_VLAN_TAGS: usize = 2;

const ETHERTYPE_IPV4: u16 = 0x0800;
const ETHERTYPE_IPV6: u16 = 0x86dd;
const ETHERTYPE_VLAN: u16 = 0x8100;
const ETHERTYPE_QINQ: u16 = 0x88a8;
const ETHERNET_MAX_LENGTH_FIELD: u16 = 1500;
const ETHERNET_MIN_TYPE: u16 = 0x0600;

const IEEE80211_HEADER: usize = 24;
const IEEE80211_ADDRESS: usize = 6;
const IEEE80211_QOS_CONTROL: usize = 2;
const IEEE80211_HT_CONTROL: usize = 4;

const IPV4_MIN_HEADER: usize = 20;
const IPV6_HEADER: usize = 40;
const IPV6_FRAGMENT_HEADER: usize = 8;
const MAX_IPV6_EXTENSIONS: usize = 8;

const IPPROTO_HOPOPTS: u8 = 0;
const IPPROTO_TCP: u8 = 6;
const IPPROTO_UDP: u8 = 17;
const IPPROTO_ROUTING: u8 = 43;
const IPPROTO_FRAGMENT: u8 = 44;
const IPPROTO_AH: u8 = 51;
const IPPROTO_DSTOPTS: u8 = 60;

const TCP_MIN_HEADER: usize = 20;
const UDP_HEADER: usize = 8;

fn be16(bytes: &[u8], at: usize) -> u16 {
    u16::from_be_bytes([bytes[at], bytes[at + 1]])
}

fn layer3_hint(ethertype: u16) -> Layer3Type {
    match ethertype {
        ETHERTYPE_IPV4 => Layer3Type::Ipv4UnspecifiedOptions,
        ETHERTYPE_IPV6 => Layer3Type::Ipv6UnspecifiedExtensions,
        _ => Layer3Type::Unspecified,
    }
}

/// LLC, optionally followed by SNAP. Returns the header length and the
/// encapsulated ethertype if there is one.
fn parse_llc(bytes: &[u8]) -> Option<(usize, Option<u16>)> {
    if bytes.len() < LLC_HEADER {
        return None;
    }
    if bytes[0] == 0xaa && bytes[1] == 0xaa && bytes[2] == 0x03 {
        if bytes.len() < LLC_HEADER + SNAP_HEADER {
            return None;
        }
        return Some((LLC_HEADER + SNAP_HEADER, Some(be16(bytes, LLC_HEADER + 3))));
    }
    Some((LLC_HEADER, None))
}

fn parse_ethernet(frame: &[u8]) -> Option<(usize, Layer3Type)> {
    if frame.len() < ETHERNET_HEADER {
        return None;
    }
    let mut length = ETHERNET_HEADER;
    let mut ethertype = be16(frame, 12);
    let mut tags = 0;
    while matches!(ethertype, ETHERTYPE_VLAN | ETHERTYPE_QINQ) {
        tags += 1;
        if tags > MAX_VLAN_TAGS || frame.len() < length + VLAN_TAG {
            return None;
        }
        ethertype = be16(frame, length + 2);
        length += VLAN_TAG;
    }

    if ethertype <= ETHERNET_MAX_LENGTH_FIELD {
        let (llc, encapsulated) = parse_llc(&frame[length..])?;
        let hint = encapsulated.map(layer3_hint).unwrap_or_default();
        return Some((length + llc, hint));
    }
    if ethertype < ETHERNET_MIN_TYPE {
        return Some((length, Layer3Type::Unspecified));
    }
    Some((length, layer3_hint(ethertype)))
}

fn parse_ieee80211(frame: &[u8]) -> Option<(usize, Layer3Type)> {
    if frame.len() < IEEE80211_HEADER {
        return None;
    }
    let (fc0, fc1) = (frame[0], frame[1]);
    let frame_type = (fc0 >> 2) & 0x3;
    let subtype = fc0 >> 4;
    if frame_type != 2 {
        return None;
    }
    let qos = subtype & 0x8 != 0;
    let null_data = subtype & 0x4 != 0;
    let four_address = fc1 & 0x3 == 0x3;
    let protected = fc1 & 0x40 != 0;
    let order = fc1 & 0x80 != 0;

    let mut length = IEEE80211_HEADER;
    if four_address {
        length += IEEE80211_ADDRESS;
    }
    if qos {
        length += IEEE80211_QOS_CONTROL;
        if order {
            length += IEEE80211_HT_CONTROL;
        }
    }
    if frame.len() < length {
        return None;
    }
    if null_data || protected {
        return Some((length, Layer3Type::Unspecified));
    }
    let (llc, encapsulated) = parse_llc(&frame[length..])?;
    Some((length + llc, encapsulated.map(layer3_hint).unwrap_or_default()))
}

/// Fills the layer 2 fields and a layer 3 hint.
pub fn parse_layer2(layer2_type: Layer2Type, frame: &[u8], layout: &mut NetPacketLayout) -> bool {
    let parsed = match layer2_type {
        Layer2Type::Ethernet => parse_ethernet(frame),
        Layer2Type::Ieee80211 => parse_ieee80211(frame),
        Layer2Type::Null => match frame.first().map(|b| b >> 4) {
            Some(4) => Some((0, Layer3Type::Ipv4UnspecifiedOptions)),
            Some(6) => Some((0, Layer3Type::Ipv6UnspecifiedExtensions)),
            _ => None,
        },
        Layer2Type::Unspecified => None,
    };
    let Some((length, layer3_type)) = parsed else {
        return false;
    };
    let Ok(length) = u8::try_from(length) else {
        return false;
    };
    layout.layer2_type = layer2_type;
    layout.layer2_header_length = length;
    layout.layer3_type = layer3_type;
    true
}

fn parse_ipv4(bytes: &[u8]) -> Option<(u16, Layer3Type, Layer4Type)> {
    if bytes.len() < IPV4_MIN_HEADER || bytes[0] >> 4 != 4 {
        return None;
    }
    let header_length = (bytes[0] & 0xf) as usize * 4;
    if header_length < IPV4_MIN_HEADER || bytes.len() < header_length {
        return None;
    }
    let flags_fragment = be16(bytes, 6);
    let more_fragments = flags_fragment & 0x2000 != 0;
    let fragment_offset = flags_fragment & 0x1fff;
    let layer3_type = if header_length == IPV4_MIN_HEADER {
        Layer3Type::Ipv4NoOptions
    } else {
        Layer3Type::Ipv4WithOptions
    };
    let layer4_type = if more_fragments || fragment_offset != 0 {
        Layer4Type::IpFragment
    } else {
        layer4_hint(bytes[9])
    };
    Some((header_length as u16, layer3_type, layer4_type))
}

fn parse_ipv6(bytes: &[u8]) -> Option<(u16, Layer3Type, Layer4Type)> {
    if bytes.len() < IPV6_HEADER || bytes[0] >> 4 != 6 {
        return None;
    }
    let mut next_header = bytes[6];
    let mut length = IPV6_HEADER;
    let mut extensions = 0;
    let mut fragment = false;
    loop {
        let extension_length = match next_header {
            IPPROTO_HOPOPTS | IPPROTO_ROUTING | IPPROTO_DSTOPTS => {
                let length_byte = *bytes.get(length + 1)?;
                (length_byte as usize + 1) * 8
            }
            IPPROTO_AH => {
                let length_byte = *bytes.get(length + 1)?;
                (length_byte as usize + 2) * 4
            }
            IPPROTO_FRAGMENT => {
                if bytes.len() < length + IPV6_FRAGMENT_HEADER {
                    return None;
                }
                let offset_flags = be16(bytes, length + 2);
                if offset_flags >> 3 != 0 || offset_flags & 0x1 != 0 {
                    fragment = true;
                }
                IPV6_FRAGMENT_HEADER
            }
            _ => break,
        };
        extensions += 1;
        if extensions > MAX_IPV6_EXTENSIONS || bytes.len() < length + extension_length {
            return None;
        }
        next_header = bytes[length];
        length += extension_length;
    }
    let length = u16::try_from(length).ok()?;
    let layer3_type = if extensions == 0 {
        Layer3Type::Ipv6NoExtensions
    } else {
        Layer3Type::Ipv6WithExtensions
    };
    let layer4_type = if fragment {
        Layer4Type::IpFragment
    } else {
        layer4_hint(next_header)
    };
    Some((length, layer3_type, layer4_type))
}

fn layer4_hint(protocol: u8) -> Layer4Type {
    match protocol {
        IPPROTO_TCP => Layer4Type::Tcp,
        IPPROTO_UDP => Layer4Type::Udp,
        _ => Layer4Type::IpNotFragment,
    }
}

/// Fills the layer 3 fields and a layer 4 hint. Needs a layer 3 hint from
/// [`parse_layer2`].
pub fn parse_layer3(frame: &[u8], layout: &mut NetPacketLayout) -> bool {
    let Some(bytes) = frame.get(layout.layer2_header_length as usize..) else {
        return false;
    };
    let parsed = if layout.layer3_type.is_ipv4() {
        parse_ipv4(bytes)
    } else if layout.layer3_type.is_ipv6() {
        parse_ipv6(bytes)
    } else {
        None
    };
    let Some((length, layer3_type, layer4_type)) = parsed else {
        return false;
    };
    layout.layer3_type = layer3_type;
    layout.layer3_header_length = length;
    layout.layer4_type = layer4_type;
    true
}

/// Fills the layer 4 header length for TCP and UDP.
pub fn parse_layer4(frame: &[u8], layout: &mut NetPacketLayout) -> bool {
    let Some(bytes) = frame.get(layout.layer4_offset()..) else {
        return false;
    };
    let length = match layout.layer4_type {
        Layer4Type::Tcp => {
            if bytes.len() < TCP_MIN_HEADER {
                return false;
            }
            let length = (bytes[12] >> 4) as usize * 4;
            if length < TCP_MIN_HEADER || bytes.len() < length {
                return false;
            }
            length
        }
        Layer4Type::Udp => {
            if bytes.len() < UDP_HEADER {
                return false;
            }
            UDP_HEADER
        }
        _ => return false,
    };
    layout.layer4_header_length = length as u8;
    true
}

/// Parses as deep as the headers go. On failure `layout` is not modified.
pub fn parse_layout(layer2_type: Layer2Type, frame: &[u8], layout: &mut NetPacketLayout) -> bool {
    let mut scratch = NetPacketLayout::default();
    if !parse_layer2(layer2_type, frame, &mut scratch) {
        return false;
    }
    if scratch.layer3_type != Layer3Type::Unspecified && !parse_layer3(frame, &mut scratch) {
        return false;
    }
    if matches!(scratch.layer4_type, Layer4Type::Tcp | Layer4Type::Udp)
        && !parse_layer4(frame, &mut scratch)
    {
        return false;
    }
    *layout = scratch;
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use etherparse::PacketBuilder;

    const SRC: [u8; 6] = [0x02, 0, 0, 0, 0, 1];
    const DST: [u8; 6] = [0x02, 0, 0, 0, 0, 2];

    fn tcp_v4(payload: &[u8]) -> Vec<u8> {
        let builder = PacketBuilder::ethernet2(SRC, DST)
            .ipv4([10, 0, 0, 1], [10, 0, 0, 2], 64)
            .tcp(1234, 80, 1, 4096);
        let mut frame = Vec::with_capacity(builder.size(payload.len()));
        builder.write(&mut frame, payload).unwrap();
        frame
    }

    fn udp_v6(payload: &[u8]) -> Vec<u8> {
        let builder = PacketBuilder::ethernet2(SRC, DST)
            .ipv6([1; 16], [2; 16], 64)
            .udp(5353, 5353);
        let mut frame = Vec::with_capacity(builder.size(payload.len()));
        builder.write(&mut frame, payload).unwrap();
        frame
    }

    fn parse(layer2_type: Layer2Type, frame: &[u8]) -> Option<NetPacketLayout> {
        let mut layout = NetPacketLayout::default();
        parse_layout(layer2_type, frame, &mut layout).then_some(layout)
    }

    #[test]
    fn ethernet_ipv4_tcp() {
        let layout = parse(Layer2Type::Ethernet, &tcp_v4(b"hello")).unwrap();
        assert_eq!(layout.layer2_type, Layer2Type::Ethernet);
        assert_eq!(layout.layer2_header_length, 14);
        assert_eq!(layout.layer3_type, Layer3Type::Ipv4NoOptions);
        assert_eq!(layout.layer3_header_length, 20);
        assert_eq!(layout.layer4_type, Layer4Type::Tcp);
        assert_eq!(layout.layer4_header_length, 20);
        assert_eq!(layout.total_header_length(), 54);
    }

    #[test]
    fn ethernet_ipv6_udp() {
        let layout = parse(Layer2Type::Ethernet, &udp_v6(&[0; 32])).unwrap();
        assert_eq!(layout.layer3_type, Layer3Type::Ipv6NoExtensions);
        assert_eq!(layout.layer3_header_length, 40);
        assert_eq!(layout.layer4_type, Layer4Type::Udp);
        assert_eq!(layout.layer4_header_length, 8);
    }

    #[test]
    fn vlan_tags_extend_layer2() {
        let mut frame = tcp_v4(b"x");
        frame.splice(12..12, [0x88, 0xa8, 0x00, 0x0a, 0x81, 0x00, 0x20, 0x05]);
        let layout = parse(Layer2Type::Ethernet, &frame).unwrap();
        assert_eq!(layout.layer2_header_length, 22);
        assert_eq!(layout.layer4_type, Layer4Type::Tcp);
    }

    #[test]
    fn ipv4_options_and_fragments() {
        let mut frame = tcp_v4(b"payload");
        frame.splice(34..34, [0x01, 0x01, 0x01, 0x01]);
        frame[14] = 0x46;
        let layout = parse(Layer2Type::Ethernet, &frame).unwrap();
        assert_eq!(layout.layer3_type, Layer3Type::Ipv4WithOptions);
        assert_eq!(layout.layer3_header_length, 24);
        assert_eq!(layout.layer4_type, Layer4Type::Tcp);

        frame[20] = 0x00;
        frame[21] = 0x10;
        let layout = parse(Layer2Type::Ethernet, &frame).unwrap();
        assert_eq!(layout.layer4_type, Layer4Type::IpFragment);
        assert_eq!(layout.layer4_header_length, 0);
    }

    #[test]
    fn ipv6_extension_headers() {
        let mut frame = udp_v6(b"abc");
        // hop-by-hop (8 bytes) then fragment header with offset 0, more set
        frame[14 + 6] = IPPROTO_HOPOPTS;
        let extensions = [
            IPPROTO_FRAGMENT, 0, 1, 4, 1, 0, 0, 0, //
            IPPROTO_UDP, 0, 0x00, 0x01, 0, 0, 0, 1,
        ];
        frame.splice(54..54, extensions);
        let layout = parse(Layer2Type::Ethernet, &frame).unwrap();
        assert_eq!(layout.layer3_type, Layer3Type::Ipv6WithExtensions);
        assert_eq!(layout.layer3_header_length, 56);
        assert_eq!(layout.layer4_type, Layer4Type::IpFragment);
    }

    #[test]
    fn llc_snap_encapsulation() {
        let inner = tcp_v4(b"snap");
        let mut frame = inner[..12].to_vec();
        let body = &inner[14..];
        frame.extend_from_slice(&((body.len() + 8) as u16).to_be_bytes());
        frame.extend_from_slice(&[0xaa, 0xaa, 0x03, 0, 0, 0, 0x08, 0x00]);
        frame.extend_from_slice(body);
        let layout = parse(Layer2Type::Ethernet, &frame).unwrap();
        assert_eq!(layout.layer2_header_length, 22);
        assert_eq!(layout.layer3_type, Layer3Type::Ipv4NoOptions);
    }

    #[test]
    fn ieee80211_qos_data() {
        let inner = tcp_v4(b"wifi");
        let mut frame = vec![0x88, 0x01, 0, 0];
        frame.extend_from_slice(&[0; 18]);
        frame.extend_from_slice(&[0, 0]);
        frame.extend_from_slice(&[0, 0]);
        frame.extend_from_slice(&[0xaa, 0xaa, 0x03, 0, 0, 0, 0x08, 0x00]);
        frame.extend_from_slice(&inner[14..]);
        let layout = parse(Layer2Type::Ieee80211, &frame).unwrap();
        assert_eq!(layout.layer2_type, Layer2Type::Ieee80211);
        assert_eq!(layout.layer2_header_length, 34);
        assert_eq!(layout.layer4_type, Layer4Type::Tcp);

        let mut management = frame.clone();
        management[0] = 0x80;
        assert!(parse(Layer2Type::Ieee80211, &management).is_none());
    }

    #[test]
    fn unknown_ethertype_stops_at_layer2() {
        let mut frame = tcp_v4(b"");
        frame[12] = 0x88;
        frame[13] = 0xcc;
        let layout = parse(Layer2Type::Ethernet, &frame).unwrap();
        assert_eq!(layout.layer3_type, Layer3Type::Unspecified);
        assert_eq!(layout.layer4_type, Layer4Type::Unspecified);
    }

    #[test]
    fn truncation_never_writes() {
        let sentinel = {
            let mut layout = NetPacketLayout::default();
            layout.layer2_header_length = 99;
            layout.layer3_header_length = 999;
            layout
        };
        for frame in [tcp_v4(b""), udp_v6(b"")] {
            for cut in 0..frame.len() {
                let mut layout = sentinel;
                assert!(
                    !parse_layout(Layer2Type::Ethernet, &frame[..cut], &mut layout),
                    "truncated at {cut} parsed"
                );
                assert_eq!(layout, sentinel);
            }
            let mut layout = sentinel;
            assert!(parse_layout(Layer2Type::Ethernet, &frame, &mut layout));
        }
    }

    #[test]
    fn random_bytes_do_not_panic() {
        use rand::Rng;
        let mut rng = rand::rng();
        for _ in 0..2000 {
            let len = rng.random_range(0..128usize);
            let bytes: Vec<u8> = (0..len).map(|_| rng.random()).collect();
            let mut layout = NetPacketLayout::default();
            let _ = parse_layout(Layer2Type::Ethernet, &bytes, &mut layout);
            let _ = parse_layout(Layer2Type::Ieee80211, &bytes, &mut layout);
            let _ = parse_layout(Layer2Type::Null, &bytes, &mut layout);
        }
    }
}
