//! Advertisement filtering.
//!
//! Filtering runs in the radio callback path, before a frame is reacted to
//! or forwarded to the host. Only advertising-channel traffic is filtered;
//! once a connection is being followed, every data channel packet matters.
//!
//! The address policy is either a single-MAC allow list or IRK-based RPA
//! resolution; the two are mutually exclusive, so configuring one replaces
//! the other.

use crate::link::advertising::{Header, PduType};
use crate::radio::Frame;
use crate::rpa::RpaResolver;

/// Which advertiser addresses pass the filter.
pub enum AddressPolicy {
    /// No address filtering.
    AllowAll,
    /// Allow a single device address (over-the-air byte order).
    Mac([u8; 6]),
    /// Allow addresses resolvable with the given IRK.
    Rpa(RpaResolver),
}

/// Filter state for advertising-channel frames.
pub struct FrameFilter {
    min_rssi: i8,
    policy: AddressPolicy,
}

impl FrameFilter {
    pub fn new() -> Self {
        FrameFilter {
            min_rssi: i8::min_value(),
            policy: AddressPolicy::AllowAll,
        }
    }

    /// Sets the minimum accepted RSSI.
    pub fn set_min_rssi(&mut self, rssi: i8) {
        self.min_rssi = rssi;
    }

    /// Restricts to a single advertiser MAC, or lifts the address filter.
    pub fn set_mac(&mut self, mac: Option<[u8; 6]>) {
        self.policy = match mac {
            Some(mac) => AddressPolicy::Mac(mac),
            None => AddressPolicy::AllowAll,
        };
    }

    /// Restricts to RPAs resolvable with `irk`, or lifts the address
    /// filter.
    pub fn set_irk(&mut self, irk: Option<[u8; 16]>) {
        self.policy = match irk {
            Some(irk) => AddressPolicy::Rpa(RpaResolver::new(&irk)),
            None => AddressPolicy::AllowAll,
        };
    }

    /// Returns whether an advertising-channel frame passes the filter.
    pub fn accepts_adv(&mut self, frame: &Frame<'_>) -> bool {
        if frame.rssi < self.min_rssi {
            return false;
        }
        if let AddressPolicy::AllowAll = self.policy {
            return true;
        }
        self.address_check(frame.data)
    }

    /// Per-PDU-type advertiser address extraction and matching.
    fn address_check(&mut self, pdu: &[u8]) -> bool {
        if pdu.len() < 2 {
            return false;
        }

        let offset = match Header::parse(pdu).pdu_type() {
            PduType::AdvInd
            | PduType::AdvDirectInd
            | PduType::AdvNonconnInd
            | PduType::AdvScanInd
            | PduType::ScanRsp => 2,
            // ScanA/InitA comes first in these, AdvA follows
            PduType::ScanReq | PduType::ConnectInd => 8,
            // only an AuxPtr on the primary channel, AdvA is in the aux PDU
            PduType::AdvExtInd => return true,
            _ => return false,
        };

        let mac: [u8; 6] = match pdu.get(offset..offset + 6) {
            Some(raw) => {
                let mut mac = [0; 6];
                mac.copy_from_slice(raw);
                mac
            }
            None => return false,
        };

        match &mut self.policy {
            AddressPolicy::AllowAll => true,
            AddressPolicy::Mac(targ) => mac == *targ,
            AddressPolicy::Rpa(resolver) => resolver.matches(&mac),
        }
    }
}

impl Default for FrameFilter {
    fn default() -> Self {
        FrameFilter::new()
    }
}
