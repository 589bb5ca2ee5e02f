//! Fixed-layout ring elements and the per-slot extension records.
//!
//! Every type here is `repr(C)` and valid for the all-zero bit pattern,
//! because ring memory is handed out zeroed and shared with the device.

use static_assertions::const_assert_eq;

use super::extension::{ExtensionKind, ExtensionSpec};

/// Base record at the start of every slot of a ring.
///
/// # Safety
///
/// The all-zero bit pattern must be a valid value of the type.
pub unsafe trait RingElement: Sized + 'static {}

/// Side record attached to every slot of a ring.
///
/// # Safety
///
/// The all-zero bit pattern must be a valid value of the type.
pub unsafe trait RingExtension: Copy + 'static {
    const NAME: &'static str;
    const VERSION: u32;
    const KIND: ExtensionKind;

    fn spec() -> ExtensionSpec {
        ExtensionSpec {
            name: Self::NAME,
            version: Self::VERSION,
            size: std::mem::size_of::<Self>(),
            alignment: std::mem::align_of::<Self>(),
            kind: Self::KIND,
        }
    }
}

#[repr(u8)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Layer2Type {
    #[default]
    Unspecified = 0,
    Null = 1,
    Ethernet = 2,
    Ieee80211 = 3,
}

#[repr(u8)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Layer3Type {
    #[default]
    Unspecified = 0,
    Ipv4UnspecifiedOptions = 1,
    Ipv4WithOptions = 2,
    Ipv4NoOptions = 3,
    Ipv6UnspecifiedExtensions = 4,
    Ipv6WithExtensions = 5,
    Ipv6NoExtensions = 6,
}

impl Layer3Type {
    pub fn is_ipv4(self) -> bool {
        matches!(
            self,
            Layer3Type::Ipv4UnspecifiedOptions
                | Layer3Type::Ipv4WithOptions
                | Layer3Type::Ipv4NoOptions
        )
    }

    pub fn is_ipv6(self) -> bool {
        matches!(
            self,
            Layer3Type::Ipv6UnspecifiedExtensions
                | Layer3Type::Ipv6WithExtensions
                | Layer3Type::Ipv6NoExtensions
        )
    }
}

#[repr(u8)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Layer4Type {
    #[default]
    Unspecified = 0,
    Tcp = 1,
    Udp = 2,
    IpFragment = 3,
    IpNotFragment = 4,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct NetPacketLayout {
    pub layer2_type: Layer2Type,
    pub layer3_type: Layer3Type,
    pub layer4_type: Layer4Type,
    pub layer2_header_length: u8,
    pub layer3_header_length: u16,
    pub layer4_header_length: u8,
    _reserved: u8,
}

impl NetPacketLayout {
    /// Offset of the layer 4 header from the start of the frame.
    pub fn layer4_offset(&self) -> usize {
        self.layer2_header_length as usize + self.layer3_header_length as usize
    }

    pub fn total_header_length(&self) -> usize {
        self.layer4_offset() + self.layer4_header_length as usize
    }
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct NetPacket {
    pub fragment_index: u32,
    pub fragment_count: u16,
    /// Device must not transmit (Tx) / translator must drop (Rx).
    pub ignore: bool,
    pub scratch: bool,
    pub layout: NetPacketLayout,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct NetFragment {
    pub valid_length: u64,
    pub capacity: u64,
    pub offset: u64,
}

const_assert_eq!(std::mem::size_of::<NetPacketLayout>(), 8);
const_assert_eq!(std::mem::size_of::<NetPacket>(), 16);
const_assert_eq!(std::mem::size_of::<NetFragment>(), 24);

unsafe impl RingElement for NetPacket {}
unsafe impl RingElement for NetFragment {}

/// Transmit checksum request for one layer.
#[repr(u8)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ChecksumAction {
    #[default]
    Passthrough = 0,
    Required = 2,
}

/// Receive checksum verdict for one layer.
#[repr(u8)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ChecksumEvaluation {
    #[default]
    NotChecked = 0,
    Invalid = 1,
    Valid = 2,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct NetPacketTxChecksum {
    pub layer3: ChecksumAction,
    pub layer4: ChecksumAction,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct NetPacketRxChecksum {
    pub layer2: ChecksumEvaluation,
    pub layer3: ChecksumEvaluation,
    pub layer4: ChecksumEvaluation,
    _reserved: u8,
}

impl NetPacketRxChecksum {
    pub fn new(
        layer2: ChecksumEvaluation,
        layer3: ChecksumEvaluation,
        layer4: ChecksumEvaluation,
    ) -> Self {
        Self {
            layer2,
            layer3,
            layer4,
            _reserved: 0,
        }
    }
}

/// Segmentation request: a non-zero MSS asks the device to segment.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct NetPacketGso {
    pub tcp_mss: u32,
    pub udp_mss: u32,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct NetPacketRsc {
    pub coalesced_segment_count: u16,
    pub duplicate_ack_count: u16,
    pub timestamp_delta: u32,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct NetPacketIeee8021Q {
    pub priority: u8,
    pub tagged: bool,
    pub vlan_id: u16,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct NetFragmentVirtualAddress {
    pub virtual_address: u64,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct NetFragmentLogicalAddress {
    pub logical_address: u64,
}

pub const PACKET_TX_CHECKSUM: &str = "packet.checksum.tx";
pub const PACKET_RX_CHECKSUM: &str = "packet.checksum.rx";
pub const PACKET_GSO: &str = "packet.gso";
pub const PACKET_RSC: &str = "packet.rsc";
pub const PACKET_IEEE8021Q: &str = "packet.ieee8021q";
pub const FRAGMENT_VIRTUAL_ADDRESS: &str = "fragment.virtual_address";
pub const FRAGMENT_LOGICAL_ADDRESS: &str = "fragment.logical_address";

macro_rules! ring_extension {
    ($ty:ty, $name:expr, $kind:ident) => {
        unsafe impl RingExtension for $ty {
            const NAME: &'static str = $name;
            const VERSION: u32 = 1;
            const KIND: ExtensionKind = ExtensionKind::$kind;
        }
    };
}

ring_extension!(NetPacketTxChecksum, PACKET_TX_CHECKSUM, Packet);
ring_extension!(NetPacketRxChecksum, PACKET_RX_CHECKSUM, Packet);
ring_extension!(NetPacketGso, PACKET_GSO, Packet);
ring_extension!(NetPacketRsc, PACKET_RSC, Packet);
ring_extension!(NetPacketIeee8021Q, PACKET_IEEE8021Q, Packet);
ring_extension!(NetFragmentVirtualAddress, FRAGMENT_VIRTUAL_ADDRESS, Fragment);
ring_extension!(NetFragmentLogicalAddress, FRAGMENT_LOGICAL_ADDRESS, Fragment);
