//! Advertising channel PDUs.
//!
//! Every advertising channel PDU starts with a 16-bit header:
//!
//! ```notrust
//! LSB                                                                     MSB
//! +------------+------------+---------+---------+--------------+------------+
//! |  PDU Type  |  RFU/ChSel |  TxAdd  |  RxAdd  |         Length            |
//! |  (4 bits)  |  (2 bits)  | (1 bit) | (1 bit) |        (8 bits)           |
//! +------------+------------+---------+---------+--------------+------------+
//! ```
//!
//! Bit 5 of the first byte doubles as the `ChSel` flag on connectable PDUs:
//! a device that sets it supports channel selection algorithm #2.
//!
//! `ADV_EXT_IND` and the `AUX_*` PDUs share the Common Extended Advertising
//! Payload, parsed by [`ExtHeader::parse`].

use crate::bytes::{ByteReader, DecodeAs};
use crate::phy::Phy;
use crate::time::Duration;
use core::convert::TryInto;
use zerocopy::{AsBytes, FromBytes, Unaligned};

enum_with_unknown! {
    /// Advertising channel PDU types.
    ///
    /// The same 4-bit codes are reused on secondary channels: `0x3` is
    /// `AUX_SCAN_REQ`, `0x5` is `AUX_CONNECT_REQ`, `0x7` covers all
    /// `AUX_ADV_IND`-family PDUs, and `0x8` is `AUX_CONNECT_RSP`.
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub enum PduType(u8) {
        AdvInd = 0x0,
        AdvDirectInd = 0x1,
        AdvNonconnInd = 0x2,
        ScanReq = 0x3,
        ScanRsp = 0x4,
        ConnectInd = 0x5,
        AdvScanInd = 0x6,
        AdvExtInd = 0x7,
        AuxConnectRsp = 0x8,
    }
}

impl PduType {
    /// Returns whether this is one of the four legacy advertisement PDUs
    /// (the ones an advertiser cycles over the primary channels).
    pub fn is_legacy_adv(self) -> bool {
        matches!(
            self,
            PduType::AdvInd | PduType::AdvDirectInd | PduType::AdvNonconnInd | PduType::AdvScanInd
        )
    }

    /// Returns whether a legacy advertisement of this type can be answered
    /// with a `CONNECT_IND`.
    pub fn is_connectable(self) -> bool {
        matches!(self, PduType::AdvInd | PduType::AdvDirectInd)
    }
}

/// 16-bit advertising channel PDU header.
#[derive(Copy, Clone)]
pub struct Header(u16);

impl Header {
    /// Parses a header from the first 2 bytes of a PDU.
    ///
    /// # Panics
    ///
    /// Panics when `raw` contains fewer than 2 bytes.
    pub fn parse(raw: &[u8]) -> Self {
        Header(u16::from_le_bytes([raw[0], raw[1]]))
    }

    /// Returns the PDU type code from the 4 least significant bits.
    pub fn pdu_type(&self) -> PduType {
        PduType::from((self.0 & 0xF) as u8)
    }

    /// Returns the raw first header byte, as cached for later CSA#2 checks.
    pub fn raw_byte0(&self) -> u8 {
        self.0 as u8
    }

    /// Returns the `ChSel` bit (CSA#2 support on connectable PDUs).
    pub fn chsel(&self) -> bool {
        self.0 & 0x20 != 0
    }

    /// Returns the `TxAdd` bit (sender address is random).
    pub fn txadd(&self) -> bool {
        self.0 & 0x40 != 0
    }

    /// Returns the `RxAdd` bit (receiver address is random).
    pub fn rxadd(&self) -> bool {
        self.0 & 0x80 != 0
    }

    /// Returns the payload length in octets.
    pub fn payload_length(&self) -> u8 {
        (self.0 >> 8) as u8
    }
}

impl core::fmt::Debug for Header {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Header")
            .field("type", &self.pdu_type())
            .field("ChSel", &self.chsel())
            .field("TxAdd", &self.txadd())
            .field("RxAdd", &self.rxadd())
            .field("len", &self.payload_length())
            .finish()
    }
}

/// `LLData` carried in `CONNECT_IND` and `AUX_CONNECT_REQ` PDUs (22 bytes,
/// following InitA and AdvA).
#[derive(Debug, Copy, Clone, FromBytes, AsBytes, Unaligned)]
#[repr(C, packed)]
pub struct ConnectIndLlData {
    access_address: u32,
    crc_init: [u8; 3],
    win_size: u8,
    win_offset: u16,
    interval: u16,
    latency: u16,
    timeout: u16,
    chan_map: [u8; 5],
    hop_sca: u8,
}

impl ConnectIndLlData {
    /// Decodes `LLData` from the start of a byte slice.
    pub fn decode(bytes: &[u8]) -> Option<&Self> {
        bytes.decode_as()
    }

    /// The Access Address of the new connection.
    pub fn access_address(&self) -> u32 {
        self.access_address
    }

    /// 24-bit CRC initialization value.
    pub fn crc_init(&self) -> u32 {
        u32::from_le_bytes([self.crc_init[0], self.crc_init[1], self.crc_init[2], 0])
    }

    /// Transmit window offset from the end of the transmit window delay, in
    /// 1.25 ms units.
    pub fn win_offset(&self) -> u16 {
        self.win_offset
    }

    /// Connection interval in 1.25 ms units.
    pub fn interval(&self) -> u16 {
        self.interval
    }

    /// Peripheral latency in connection events.
    pub fn latency(&self) -> u16 {
        self.latency
    }

    /// Supervision timeout in 10 ms units.
    pub fn timeout(&self) -> u16 {
        self.timeout
    }

    /// Raw channel map bytes.
    pub fn chan_map(&self) -> [u8; 5] {
        self.chan_map
    }

    /// CSA#1 hop increment (5..=16 per spec, though the field holds 5 bits).
    pub fn hop(&self) -> u8 {
        self.hop_sca & 0x1F
    }
}

bitflags! {
    /// Flag byte of the Common Extended Advertising Payload header.
    pub struct ExtHeaderFlags: u8 {
        const ADV_A     = 0x01;
        const TARGET_A  = 0x02;
        const CTE_INFO  = 0x04;
        const ADI       = 0x08;
        const AUX_PTR   = 0x10;
        const SYNC_INFO = 0x20;
        const TX_POWER  = 0x40;
    }
}

/// Decoded `AuxPtr` field: where and when the auxiliary PDU will appear.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct AuxPtr {
    /// Secondary channel index (0..=36).
    pub chan: u8,
    /// PHY of the auxiliary PDU.
    pub phy: Phy,
    /// Offset from the start of this PDU to the auxiliary PDU, in units of
    /// either 30 µs or 300 µs.
    offset: u16,
    offset_unit_large: bool,
}

impl AuxPtr {
    fn parse(raw: &[u8]) -> Self {
        let offset = u16::from(raw[1]) | (u16::from(raw[2] & 0x1F) << 8);
        let phy_code = raw[2] >> 5;
        AuxPtr {
            chan: raw[0] & 0x3F,
            // 0/1/2 are defined; anything else snaps to the most likely PHY
            phy: if phy_code < 3 {
                Phy::from(phy_code)
            } else {
                Phy::M2
            },
            offset,
            offset_unit_large: raw[0] & 0x80 != 0,
        }
    }

    /// Time from the start of the referencing PDU to the aux PDU.
    pub fn aux_offset(&self) -> Duration {
        let unit = if self.offset_unit_large { 300 } else { 30 };
        Duration::from_micros(u32::from(self.offset) * unit)
    }
}

/// Parsed Common Extended Advertising Payload.
///
/// Field presence is governed by [`ExtHeaderFlags`]; the parse order is
/// fixed by the spec and any length inconsistency aborts the parse.
#[derive(Debug, Copy, Clone, Default)]
pub struct ExtHeader<'a> {
    /// AdvMode bits: 0 = non-connectable, 1 = connectable, 2 = scannable.
    pub adv_mode: u8,
    pub adv_a: Option<&'a [u8; 6]>,
    pub target_a: Option<&'a [u8; 6]>,
    pub cte_info: Option<u8>,
    pub adi: Option<u16>,
    pub aux_ptr: Option<AuxPtr>,
    pub sync_info: Option<&'a [u8; 18]>,
    pub tx_power: Option<i8>,
    pub acad: &'a [u8],
    pub adv_data: &'a [u8],
}

impl<'a> ExtHeader<'a> {
    /// Parses the PDU body (everything after the 2-byte PDU header) of an
    /// `ADV_EXT_IND` / `AUX_ADV_IND`-family PDU.
    pub fn parse(body: &'a [u8]) -> Option<Self> {
        let first = *body.first()?;
        let hdr_len = usize::from(first & 0x3F);
        if body.len() < hdr_len + 1 {
            return None;
        }

        let mut hdr = ExtHeader {
            adv_mode: first >> 6,
            acad: &[],
            adv_data: &[],
            ..ExtHeader::default()
        };

        // The extended header (flags plus fields) is only present when its
        // length field covers more than the flag byte.
        if hdr_len > 1 {
            let flags = ExtHeaderFlags::from_bits_truncate(body[1]);
            let mut r = ByteReader::new(&body[2..]);

            if flags.contains(ExtHeaderFlags::ADV_A) {
                hdr.adv_a = Some(r.read_slice(6).ok()?.try_into().ok()?);
            }
            if flags.contains(ExtHeaderFlags::TARGET_A) {
                hdr.target_a = Some(r.read_slice(6).ok()?.try_into().ok()?);
            }
            if flags.contains(ExtHeaderFlags::CTE_INFO) {
                hdr.cte_info = Some(r.read_u8().ok()?);
            }
            if flags.contains(ExtHeaderFlags::ADI) {
                hdr.adi = Some(r.read_u16_le().ok()?);
            }
            if flags.contains(ExtHeaderFlags::AUX_PTR) {
                hdr.aux_ptr = Some(AuxPtr::parse(r.read_slice(3).ok()?));
            }
            if flags.contains(ExtHeaderFlags::SYNC_INFO) {
                hdr.sync_info = Some(r.read_slice(18).ok()?.try_into().ok()?);
            }
            if flags.contains(ExtHeaderFlags::TX_POWER) {
                hdr.tx_power = Some(r.read_u8().ok()? as i8);
            }

            // Body index just past the defined fields. Whatever remains of
            // the declared extended header is ACAD; the rest is AdvData.
            let pos = body.len() - r.bytes_left();
            if pos - 1 < hdr_len {
                hdr.acad = r.read_slice(hdr_len - (pos - 1)).ok()?;
            }
            hdr.adv_data = r.read_rest();
        }

        Some(hdr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_fields() {
        // ADV_IND, ChSel + TxAdd set, length 9
        let h = Header::parse(&[0x60, 0x09]);
        assert_eq!(h.pdu_type(), PduType::AdvInd);
        assert!(h.chsel());
        assert!(h.txadd());
        assert!(!h.rxadd());
        assert_eq!(h.payload_length(), 9);
        assert!(h.pdu_type().is_legacy_adv());
        assert!(h.pdu_type().is_connectable());
    }

    #[test]
    fn lldata_decode() {
        let mut raw = [0u8; 22];
        raw[0..4].copy_from_slice(&0x1234_5678u32.to_le_bytes()); // AA
        raw[4..7].copy_from_slice(&[0xCC, 0xBB, 0xAA]); // CRCInit
        raw[7] = 2; // WinSize
        raw[8..10].copy_from_slice(&5u16.to_le_bytes()); // WinOffset
        raw[10..12].copy_from_slice(&24u16.to_le_bytes()); // Interval
        raw[12..14].copy_from_slice(&1u16.to_le_bytes()); // Latency
        raw[14..16].copy_from_slice(&72u16.to_le_bytes()); // Timeout
        raw[16..21].copy_from_slice(&[0xFF, 0xFF, 0xFF, 0xFF, 0x1F]); // ChM
        raw[21] = 0xA7; // SCA | Hop = 7

        let lldata = ConnectIndLlData::decode(&raw).unwrap();
        assert_eq!(lldata.access_address(), 0x1234_5678);
        assert_eq!(lldata.crc_init(), 0xAABBCC);
        assert_eq!(lldata.win_offset(), 5);
        assert_eq!(lldata.interval(), 24);
        assert_eq!(lldata.latency(), 1);
        assert_eq!(lldata.timeout(), 72);
        assert_eq!(lldata.hop(), 7);

        assert!(ConnectIndLlData::decode(&raw[..21]).is_none());
    }

    #[test]
    fn ext_header_with_aux_ptr() {
        // ADV_EXT_IND body: ext hdr len 6, AdvMode 0; flags = ADI | AUX_PTR;
        // ADI = 0x1234; AuxPtr = chan 2, large units, offset 0x123, PHY 2M.
        let body = [
            0x06,
            (ExtHeaderFlags::ADI | ExtHeaderFlags::AUX_PTR).bits(),
            0x34,
            0x12,
            0x82,
            0x23,
            0x21,
            0xAA,
            0xBB,
            0xCC,
        ];
        let hdr = ExtHeader::parse(&body).unwrap();
        assert_eq!(hdr.adv_mode, 0);
        assert_eq!(hdr.adi, Some(0x1234));
        assert!(hdr.adv_a.is_none());
        let aux = hdr.aux_ptr.unwrap();
        assert_eq!(aux.chan, 2);
        assert_eq!(aux.phy, Phy::M2);
        assert_eq!(aux.aux_offset(), Duration::from_micros(0x123 * 300));
        // Bytes past the extended header are ACAD here (none) then AdvData.
        assert_eq!(hdr.adv_data, &[0xAA, 0xBB, 0xCC]);
    }

    #[test]
    fn ext_header_acad_split() {
        // ext hdr len 4: flags + CTEInfo + 2 bytes ACAD, then AdvData.
        let body = [0x04, ExtHeaderFlags::CTE_INFO.bits(), 0x55, 0x01, 0x02, 0xDD];
        let hdr = ExtHeader::parse(&body).unwrap();
        assert_eq!(hdr.cte_info, Some(0x55));
        assert_eq!(hdr.acad, &[0x01, 0x02]);
        assert_eq!(hdr.adv_data, &[0xDD]);
    }

    #[test]
    fn ext_header_inconsistent_len_rejected() {
        // Declared ext header length exceeds the body.
        assert!(ExtHeader::parse(&[0x20, 0x00, 0x01]).is_none());
        // Flags demand more fields than the body holds.
        let body = [
            0x07,
            (ExtHeaderFlags::ADV_A | ExtHeaderFlags::ADI).bits(),
            1,
            2,
            3,
            4,
            5,
            6,
        ];
        assert!(ExtHeader::parse(&body).is_none());
        assert!(ExtHeader::parse(&[]).is_none());
    }

    #[test]
    fn ext_header_minimal() {
        // Just the length/mode byte, connectable AdvMode.
        let hdr = ExtHeader::parse(&[0x40]).unwrap();
        assert_eq!(hdr.adv_mode, 1);
        assert!(hdr.aux_ptr.is_none());
        assert!(hdr.adv_data.is_empty());
    }
}
