use crate::errors::{Error, Result};
use crate::ring::element::NetPacketIeee8021Q;

const MAX_PRIORITY: u8 = 7;
const MAX_VLAN_ID: u16 = 0x0fff;

/// 802.1Q tag information carried out of band with a packet.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Ieee8021QInfo {
    pub user_priority: u8,
    pub vlan_id: u16,
}

impl Ieee8021QInfo {
    pub fn is_tagged(&self) -> bool {
        self.user_priority != 0 || self.vlan_id != 0
    }
}

pub fn translate_tx_ieee8021q(info: &Ieee8021QInfo) -> Result<NetPacketIeee8021Q> {
    if info.user_priority > MAX_PRIORITY {
        return Err(Error::InvalidParameter("802.1Q priority above 7"));
    }
    if info.vlan_id > MAX_VLAN_ID {
        return Err(Error::InvalidParameter("802.1Q VLAN id above 4095"));
    }
    Ok(NetPacketIeee8021Q {
        priority: info.user_priority,
        tagged: info.is_tagged(),
        vlan_id: info.vlan_id,
    })
}

pub fn translate_rx_ieee8021q(tag: &NetPacketIeee8021Q) -> Ieee8021QInfo {
    if !tag.tagged {
        return Ieee8021QInfo::default();
    }
    Ieee8021QInfo {
        user_priority: tag.priority & MAX_PRIORITY,
        vlan_id: tag.vlan_id & MAX_VLAN_ID,
    }
}
