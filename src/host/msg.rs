//! Outbound message serialization and the host-link sender.
//!
//! Every frame drained from the packet ring becomes one message; the
//! out-of-band channels map to their own message types, everything else is
//! a captured BLE frame:
//!
//! ```notrust
//! BLEFRAME: type(1) timestamp(4 LE) len|crcErr<<14|dir<<15 (2 LE)
//!           eventCtr(2 LE) rssi(1) channel|phy<<6 (1) payload
//! ```

use super::wire::{HostIo, Messenger, MESSAGE_MAX};
use crate::bytes::ByteWriter;
use crate::queue::{FrameBuf, PacketConsumer};
use crate::radio::{MSGCHAN_DEBUG, MSGCHAN_MARKER, MSGCHAN_MEASURE, MSGCHAN_STATE};
use crate::Error;

/// Message types sent to the host (first byte of every outbound message).
pub const MESSAGE_BLEFRAME: u8 = 0x10;
pub const MESSAGE_DEBUG: u8 = 0x11;
pub const MESSAGE_MARKER: u8 = 0x12;
pub const MESSAGE_STATE: u8 = 0x13;
pub const MESSAGE_MEASURE: u8 = 0x14;

/// Serializes one captured frame into `out`, returning the message length.
///
/// Returns 0 when the frame cannot fit (it is then dropped; oversized
/// frames cannot reach the ring in the first place).
pub fn serialize(frame: &FrameBuf, out: &mut [u8]) -> usize {
    let mut w = ByteWriter::new(out);
    match try_serialize(frame, &mut w) {
        Ok(()) => w.bytes_written(),
        Err(_) => 0,
    }
}

fn try_serialize(frame: &FrameBuf, w: &mut ByteWriter<'_>) -> Result<(), Error> {
    match frame.channel {
        MSGCHAN_DEBUG => {
            w.write_u8(MESSAGE_DEBUG)?;
            w.write_slice(frame.data())?;
        }
        MSGCHAN_MARKER => {
            w.write_u8(MESSAGE_MARKER)?;
            w.write_u32_le(frame.timestamp.ticks())?;
            w.write_slice(frame.data())?;
        }
        MSGCHAN_STATE => {
            w.write_u8(MESSAGE_STATE)?;
            w.write_u8(*frame.data().first().ok_or(Error::InvalidLength)?)?;
        }
        MSGCHAN_MEASURE => {
            w.write_u8(MESSAGE_MEASURE)?;
            w.write_slice(frame.data())?;
        }
        _ => {
            w.write_u8(MESSAGE_BLEFRAME)?;
            w.write_u32_le(frame.timestamp.ticks())?;
            let len_flags = frame.data().len() as u16
                | (u16::from(frame.crc_error) << 14)
                | (frame.direction.bit() << 15);
            w.write_u16_le(len_flags)?;
            w.write_u16_le(frame.event_ctr)?;
            w.write_u8(frame.rssi as u8)?;
            w.write_u8(frame.channel | (frame.phy.bits() << 6))?;
            w.write_slice(frame.data())?;
        }
    }
    Ok(())
}

/// The host-link sender: drains the packet ring into the messenger.
///
/// Runs on its own task; the platform wakes it whenever the radio side
/// signals a produced packet.
pub struct HostLink<'a, IO: HostIo> {
    packets: PacketConsumer<'a>,
    messenger: Messenger<IO>,
}

impl<'a, IO: HostIo> HostLink<'a, IO> {
    pub fn new(packets: PacketConsumer<'a>, messenger: Messenger<IO>) -> Self {
        HostLink { packets, messenger }
    }

    /// Serializes and sends the oldest pending frame.
    ///
    /// Returns `false` when the ring was empty; the caller then blocks on
    /// the packet-available notification.
    pub fn pump(&mut self) -> bool {
        let mut buf = [0u8; MESSAGE_MAX];
        let len = match self.packets.consume(|frame| serialize(frame, &mut buf)) {
            Some(len) => len,
            None => return false,
        };
        if len > 0 {
            self.messenger.send(&buf[..len]);
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::phy::Phy;
    use crate::queue::PacketRing;
    use crate::radio::{Direction, Frame};
    use crate::time::Instant;

    fn serialize_frame(frame: &Frame<'_>) -> std::vec::Vec<u8> {
        let mut ring = PacketRing::new();
        let (mut p, mut c) = ring.split();
        assert!(p.produce(frame));
        let mut out = std::vec::Vec::new();
        c.consume(|slot| {
            let mut buf = [0u8; MESSAGE_MAX];
            let len = serialize(slot, &mut buf);
            out.extend_from_slice(&buf[..len]);
        })
        .unwrap();
        out
    }

    #[test]
    fn ble_frame_layout() {
        let payload = [0x01, 0x02, 0x03];
        let frame = Frame {
            timestamp: Instant::from_ticks(0x1122_3344),
            crc_error: false,
            direction: Direction::PeripheralToCentral,
            event_ctr: 0x0506,
            rssi: -70,
            channel: 17,
            phy: Phy::M2,
            data: &payload,
        };
        let msg = serialize_frame(&frame);

        assert_eq!(msg[0], MESSAGE_BLEFRAME);
        assert_eq!(&msg[1..5], &0x1122_3344u32.to_le_bytes());
        // length 3, direction bit set
        assert_eq!(&msg[5..7], &(3u16 | 0x8000).to_le_bytes());
        assert_eq!(&msg[7..9], &0x0506u16.to_le_bytes());
        assert_eq!(msg[9] as i8, -70);
        assert_eq!(msg[10], 17 | (1 << 6));
        assert_eq!(&msg[11..], &payload);
    }

    #[test]
    fn crc_error_flag() {
        let frame = Frame {
            timestamp: Instant::from_ticks(0),
            crc_error: true,
            direction: Direction::CentralToPeripheral,
            event_ctr: 0,
            rssi: 0,
            channel: 37,
            phy: Phy::M1,
            data: &[0xFF],
        };
        let msg = serialize_frame(&frame);
        assert_eq!(&msg[5..7], &(1u16 | 0x4000).to_le_bytes());
    }

    #[test]
    fn state_message() {
        let frame = Frame {
            timestamp: Instant::from_ticks(0),
            crc_error: false,
            direction: Direction::CentralToPeripheral,
            event_ctr: 0,
            rssi: 0,
            channel: MSGCHAN_STATE,
            phy: Phy::M1,
            data: &[3],
        };
        assert_eq!(serialize_frame(&frame), &[MESSAGE_STATE, 3]);
    }

    #[test]
    fn marker_carries_timestamp_then_payload() {
        let frame = Frame {
            timestamp: Instant::from_ticks(0xAABBCCDD),
            crc_error: false,
            direction: Direction::CentralToPeripheral,
            event_ctr: 0,
            rssi: 0,
            channel: MSGCHAN_MARKER,
            phy: Phy::M1,
            data: &[0x42],
        };
        let msg = serialize_frame(&frame);
        assert_eq!(msg[0], MESSAGE_MARKER);
        assert_eq!(&msg[1..5], &0xAABBCCDDu32.to_le_bytes());
        assert_eq!(&msg[5..], &[0x42]);
    }

    #[test]
    fn debug_and_measure_pass_payload_through() {
        for (chan, ty) in &[(MSGCHAN_DEBUG, MESSAGE_DEBUG), (MSGCHAN_MEASURE, MESSAGE_MEASURE)] {
            let frame = Frame {
                timestamp: Instant::from_ticks(0),
                crc_error: false,
                direction: Direction::CentralToPeripheral,
                event_ctr: 0,
                rssi: 0,
                channel: *chan,
                phy: Phy::M1,
                data: b"hi",
            };
            let msg = serialize_frame(&frame);
            assert_eq!(msg[0], *ty);
            assert_eq!(&msg[1..], b"hi");
        }
    }
}
