//! Data channel PDU structures.
//!
//! Layout of the 16-bit data channel header:
//!
//! ```notrust
//! LSB                                                                MSB
//! +----------+---------+---------+---------+------------+--------------+
//! |   LLID   |  NESN   |   SN    |   MD    |     -      |    Length    |
//! | (2 bits) | (1 bit) | (1 bit) | (1 bit) |  (3 bits)  |   (8 bits)   |
//! +----------+---------+---------+---------+------------+--------------+
//! ```
//!
//! The sniffer only interprets `LLID`, `MD` and `Length`: `MD` drives the
//! early close of connection events (both sides done transmitting), and
//! only LL Control PDUs (`LLID = 0b11`) influence connection tracking.

use byteorder::{ByteOrder, LittleEndian};
use core::fmt;

/// 16-bit data channel PDU header.
#[derive(Copy, Clone)]
pub struct Header(u16);

impl Header {
    /// Parses a header from raw bytes.
    ///
    /// # Panics
    ///
    /// Panics when `raw` contains fewer than 2 bytes.
    pub fn parse(raw: &[u8]) -> Self {
        Header(LittleEndian::read_u16(raw))
    }

    /// Returns the `LLID` field (PDU class).
    pub fn llid(&self) -> Llid {
        match self.0 & 0b11 {
            0b00 => Llid::Reserved,
            0b01 => Llid::DataCont,
            0b10 => Llid::DataStart,
            0b11 => Llid::Control,
            _ => unreachable!(),
        }
    }

    /// Returns whether the `MD` (More Data) field is set.
    pub fn md(&self) -> bool {
        self.0 & 0b1_0000 != 0
    }

    /// Returns the length of the payload (and MIC, if present) in octets.
    pub fn payload_length(&self) -> u8 {
        (self.0 >> 8) as u8
    }
}

impl fmt::Debug for Header {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Header")
            .field("LLID", &self.llid())
            .field("MD", &self.md())
            .field("Length", &self.payload_length())
            .finish()
    }
}

/// Values of the LLID field in [`Header`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Llid {
    /// Reserved for future use.
    Reserved = 0b00,

    /// Continuation of L2CAP message, or empty PDU.
    DataCont = 0b01,

    /// Start of L2CAP message.
    DataStart = 0b10,

    /// LL control PDU.
    Control = 0b11,
}
