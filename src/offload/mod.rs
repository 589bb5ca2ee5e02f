//! Stateless translators between OS offload descriptors and ring extensions.

pub mod checksum;
pub mod ieee8021q;
pub mod layout;
pub mod lso;
pub mod rsc;

pub use checksum::{
    RxChecksumInfo, TxChecksumInfo, rx_checksum_to_packet, translate_rx_packet_checksum,
    translate_tx_packet_checksum, tx_checksum_info_from_packet,
};
pub use ieee8021q::{Ieee8021QInfo, translate_rx_ieee8021q, translate_tx_ieee8021q};
pub use layout::{HeaderScratch, MAX_HEADER_BYTES, parse_layout};
pub use lso::{IpVersion, LsoInfo, UsoInfo, translate_tx_packet_large_send};
pub use rsc::{RscInfo, rsc_to_packet, translate_rx_packet_rsc};
