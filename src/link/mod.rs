//! Link-layer packet structures.
//!
//! The radio hardware already deals with preamble, access address and CRC,
//! so the sniffer core only ever sees PDUs: a 2-byte header followed by the
//! body. This module provides the decoding for both PDU classes
//! (advertising channel and data channel), the LL Control PDU payloads, and
//! the two channel selection algorithms.
//!
//! Refer to the *Link Layer Specification* of the Bluetooth Core
//! Specification for the packet formats; the field layouts are documented
//! on the individual types.

pub mod advertising;
pub mod channel_map;
pub mod csa2;
pub mod data;
mod device_address;
pub mod filter;
pub mod llcp;

pub use self::device_address::*;
