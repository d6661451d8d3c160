//! LL Control PDU payloads (Link Layer Control Protocol).
//!
//! A control PDU body is a 1-byte opcode followed by fixed-layout `CtrData`.
//! The sniffer decodes only the opcodes that change the parameters it has
//! to track to keep following a connection; everything else passes through
//! to the host unparsed.

use crate::bytes::DecodeAs;
use crate::link::channel_map::ChannelMap;
use crate::phy::Phy;
use zerocopy::{AsBytes, FromBytes, Unaligned};

enum_with_unknown! {
    /// LL Control PDU opcodes.
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub enum ControlOpcode(u8) {
        ConnectionUpdateInd = 0x00,
        ChannelMapInd = 0x01,
        TerminateInd = 0x02,
        EncReq = 0x03,
        EncRsp = 0x04,
        StartEncReq = 0x05,
        StartEncRsp = 0x06,
        UnknownRsp = 0x07,
        FeatureReq = 0x08,
        FeatureRsp = 0x09,
        PauseEncReq = 0x0A,
        PauseEncRsp = 0x0B,
        VersionInd = 0x0C,
        RejectInd = 0x0D,
        PeripheralFeatureReq = 0x0E,
        ConnectionParamReq = 0x0F,
        ConnectionParamRsp = 0x10,
        RejectExtInd = 0x11,
        PingReq = 0x12,
        PingRsp = 0x13,
        LengthReq = 0x14,
        LengthRsp = 0x15,
        PhyReq = 0x16,
        PhyRsp = 0x17,
        PhyUpdateInd = 0x18,
    }
}

/// `LL_CONNECTION_UPDATE_IND` - new connection parameters at an instant.
#[derive(Debug, Copy, Clone, FromBytes, AsBytes, Unaligned)]
#[repr(C, packed)]
pub struct ConnectionUpdateInd {
    win_size: u8,
    win_offset: u16,
    interval: u16,
    latency: u16,
    timeout: u16,
    instant: u16,
}

impl ConnectionUpdateInd {
    /// Decodes the `CtrData` following the opcode byte.
    pub fn decode(ctr_data: &[u8]) -> Option<&Self> {
        ctr_data.decode_as()
    }

    /// New transmit window offset in 1.25 ms units.
    pub fn win_offset(&self) -> u16 {
        self.win_offset
    }

    /// New connection interval in 1.25 ms units.
    pub fn interval(&self) -> u16 {
        self.interval
    }

    /// New peripheral latency in connection events.
    pub fn latency(&self) -> u16 {
        self.latency
    }

    /// New supervision timeout in 10 ms units.
    pub fn timeout(&self) -> u16 {
        self.timeout
    }

    /// Connection event count at which the new parameters apply.
    pub fn instant(&self) -> u16 {
        self.instant
    }
}

/// `LL_CHANNEL_MAP_IND` - new channel map at an instant.
#[derive(Debug, Copy, Clone, FromBytes, AsBytes, Unaligned)]
#[repr(C, packed)]
pub struct ChannelMapInd {
    map: [u8; 5],
    instant: u16,
}

impl ChannelMapInd {
    /// Decodes the `CtrData` following the opcode byte.
    pub fn decode(ctr_data: &[u8]) -> Option<&Self> {
        ctr_data.decode_as()
    }

    pub fn channel_map(&self) -> ChannelMap {
        ChannelMap::from_raw(self.map)
    }

    pub fn instant(&self) -> u16 {
        self.instant
    }
}

/// `LL_PHY_UPDATE_IND` - PHY switch at an instant.
#[derive(Debug, Copy, Clone, FromBytes, AsBytes, Unaligned)]
#[repr(C, packed)]
pub struct PhyUpdateInd {
    c_to_p_phy: u8,
    p_to_c_phy: u8,
    instant: u16,
}

impl PhyUpdateInd {
    /// Decodes the `CtrData` following the opcode byte.
    pub fn decode(ctr_data: &[u8]) -> Option<&Self> {
        ctr_data.decode_as()
    }

    /// The PHY both directions will use.
    ///
    /// Asymmetric PHYs are not tracked; the central-to-peripheral choice
    /// wins and unknown bit patterns keep the given fallback.
    pub fn phy_or(&self, current: Phy) -> Phy {
        match self.c_to_p_phy & 0x7 {
            0x1 => Phy::M1,
            0x2 => Phy::M2,
            0x4 => Phy::CodedS8,
            _ => current,
        }
    }

    pub fn instant(&self) -> u16 {
        self.instant
    }
}
