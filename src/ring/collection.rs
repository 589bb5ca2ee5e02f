use crate::errors::Result;

use super::element::{NetFragment, NetPacket, RingExtension};
use super::extension::{Extension, ExtensionKind, ExtensionRegistry};
use super::{NetRing, increment};

/// The rings one queue exchanges with its device.
pub struct RingCollection {
    pub packets: NetRing<NetPacket>,
    pub fragments: NetRing<NetFragment>,
}

impl RingCollection {
    pub fn new(
        packet_count: u32,
        fragment_count: u32,
        registry: &ExtensionRegistry,
    ) -> Result<Self> {
        let packet_layout = registry.pack(ExtensionKind::Packet, std::mem::size_of::<NetPacket>());
        let fragment_layout =
            registry.pack(ExtensionKind::Fragment, std::mem::size_of::<NetFragment>());
        Ok(Self {
            packets: NetRing::new(packet_count, packet_layout)?,
            fragments: NetRing::new(fragment_count, fragment_layout)?,
        })
    }

    pub fn packet_extension<X: RingExtension>(&self) -> Option<Extension<X>> {
        self.packets.extensions().get::<X>()
    }

    pub fn fragment_extension<X: RingExtension>(&self) -> Option<Extension<X>> {
        self.fragments.extensions().get::<X>()
    }

    /// Fragment ring indices used by the packet at `packet_index`.
    pub fn packet_fragments(&self, packet_index: u32) -> impl Iterator<Item = u32> + use<> {
        let packet = self.packets.element(packet_index);
        let mask = self.fragments.mask();
        let first = packet.fragment_index & mask;
        let count = packet.fragment_count as usize;
        std::iter::successors(Some(first), move |&i| Some(increment(i, mask))).take(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ring::element::{NetFragmentVirtualAddress, NetPacketGso};

    #[test]
    fn packet_fragments_wrap() {
        let mut registry = ExtensionRegistry::new();
        registry.register_type::<NetPacketGso>().unwrap();
        registry.register_type::<NetFragmentVirtualAddress>().unwrap();
        let mut rings = RingCollection::new(8, 4, &registry).unwrap();
        assert!(rings.packet_extension::<NetPacketGso>().is_some());
        assert!(rings.fragment_extension::<NetFragmentVirtualAddress>().is_some());
        assert!(rings.fragment_extension::<NetPacketGso>().is_none());

        let packet = rings.packets.element_mut(0);
        packet.fragment_index = 3;
        packet.fragment_count = 3;
        let fragments: Vec<u32> = rings.packet_fragments(0).collect();
        assert_eq!(fragments, vec![3, 0, 1]);
    }
}
