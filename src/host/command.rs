//! Inbound command parsing and dispatch.
//!
//! Every decoded host message is `word_count(1) opcode(1) args...`. Each
//! opcode validates its exact length (and value ranges) before anything is
//! touched; a malformed command is simply ignored, which is all the
//! feedback the host gets per the protocol.

use crate::phy::Phy;
use crate::queue::TxProducer;
use byteorder::{ByteOrder, LittleEndian};
use core::convert::TryInto;
use heapless::consts::*;
use heapless::Vec;

pub const COMMAND_SETCHANAAPHY: u8 = 0x10;
pub const COMMAND_PAUSEDONE: u8 = 0x11;
pub const COMMAND_RSSIFILT: u8 = 0x12;
pub const COMMAND_MACFILT: u8 = 0x13;
pub const COMMAND_ADVHOP: u8 = 0x14;
pub const COMMAND_FOLLOW: u8 = 0x15;
pub const COMMAND_AUXADV: u8 = 0x16;
pub const COMMAND_RESET: u8 = 0x17;
pub const COMMAND_MARKER: u8 = 0x18;
pub const COMMAND_TRANSMIT: u8 = 0x19;
pub const COMMAND_CONNECT: u8 = 0x1A;
pub const COMMAND_SETADDR: u8 = 0x1B;
pub const COMMAND_ADVERTISE: u8 = 0x1C;
pub const COMMAND_ADVINTRVL: u8 = 0x1D;
pub const COMMAND_SETIRK: u8 = 0x1E;
pub const COMMAND_INSTAHOP: u8 = 0x1F;
pub const COMMAND_SETMAP: u8 = 0x20;
pub const COMMAND_INTVL_PRELOAD: u8 = 0x21;
pub const COMMAND_SCAN: u8 = 0x22;
pub const COMMAND_PHY_PRELOAD: u8 = 0x23;
pub const COMMAND_VERSION: u8 = 0x24;
pub const COMMAND_ADV_EXT: u8 = 0x25;
pub const COMMAND_CRC_VALID: u8 = 0x26;
pub const COMMAND_TX_POWER: u8 = 0x27;

/// Why a command was rejected.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CommandError {
    /// Payload length does not match the opcode.
    Length,
    /// A field value is out of range.
    Value,
    /// Unknown opcode.
    Unknown,
}

/// A validated host command.
#[derive(Debug, Clone, PartialEq)]
pub enum Command<'a> {
    SetChanAaPhy {
        chan: u8,
        aa: u32,
        phy: Phy,
        crc_init: u32,
    },
    PauseDone(bool),
    RssiFilter(i8),
    MacFilter(Option<[u8; 6]>),
    AdvHop,
    Follow(bool),
    AuxAdv(bool),
    Reset,
    Marker(&'a [u8]),
    Transmit {
        event_ctr: u16,
        llid: u8,
        data: &'a [u8],
    },
    Connect {
        peer_random: bool,
        peer: [u8; 6],
        ll_data: [u8; 22],
    },
    SetAddr {
        random: bool,
        mac: [u8; 6],
    },
    Advertise {
        adv_data: &'a [u8],
        scan_rsp_data: &'a [u8],
    },
    AdvInterval(u16),
    SetIrk(Option<[u8; 16]>),
    InstaHop(bool),
    SetMap(u64),
    IntervalPreload(Vec<(u16, u16), U4>),
    Scan,
    PhyPreload {
        ignore: bool,
        phy: Phy,
    },
    Version,
    AdvertiseExt {
        connectable: bool,
        primary_phy: Phy,
        secondary_phy: Phy,
        adi: u16,
        adv_data: &'a [u8],
    },
    CrcValid(bool),
    TxPower(i8),
}

/// Parses a decoded host message (`msg[0]` word count, `msg[1]` opcode).
pub fn parse(msg: &[u8]) -> Result<Command<'_>, CommandError> {
    if msg.len() < 2 {
        return Err(CommandError::Length);
    }

    let args = &msg[2..];
    match msg[1] {
        COMMAND_SETCHANAAPHY => {
            expect_len(msg, 12)?;
            if args[0] > 39 || args[5] > 3 {
                return Err(CommandError::Value);
            }
            Ok(Command::SetChanAaPhy {
                chan: args[0],
                aa: LittleEndian::read_u32(&args[1..5]),
                phy: Phy::from(args[5]),
                crc_init: LittleEndian::read_u32(&args[6..10]),
            })
        }
        COMMAND_PAUSEDONE => {
            expect_len(msg, 3)?;
            Ok(Command::PauseDone(args[0] != 0))
        }
        COMMAND_RSSIFILT => {
            expect_len(msg, 3)?;
            Ok(Command::RssiFilter(args[0] as i8))
        }
        COMMAND_MACFILT => match msg.len() {
            8 => Ok(Command::MacFilter(Some(args[..6].try_into().unwrap()))),
            2 => Ok(Command::MacFilter(None)),
            _ => Err(CommandError::Length),
        },
        COMMAND_ADVHOP => {
            expect_len(msg, 2)?;
            Ok(Command::AdvHop)
        }
        COMMAND_FOLLOW => {
            expect_len(msg, 3)?;
            Ok(Command::Follow(args[0] != 0))
        }
        COMMAND_AUXADV => {
            expect_len(msg, 3)?;
            Ok(Command::AuxAdv(args[0] != 0))
        }
        COMMAND_RESET => {
            expect_len(msg, 2)?;
            Ok(Command::Reset)
        }
        COMMAND_MARKER => Ok(Command::Marker(args)),
        COMMAND_TRANSMIT => {
            // eventCtr(2) llid(1) len(1) payload
            if msg.len() < 6 {
                return Err(CommandError::Length);
            }
            if msg.len() != usize::from(args[3]) + 6 {
                return Err(CommandError::Length);
            }
            Ok(Command::Transmit {
                event_ctr: LittleEndian::read_u16(&args[..2]),
                llid: args[2],
                data: &args[4..],
            })
        }
        COMMAND_CONNECT => {
            expect_len(msg, 31)?;
            Ok(Command::Connect {
                peer_random: args[0] != 0,
                peer: args[1..7].try_into().unwrap(),
                ll_data: args[7..29].try_into().unwrap(),
            })
        }
        COMMAND_SETADDR => {
            expect_len(msg, 9)?;
            Ok(Command::SetAddr {
                random: args[0] != 0,
                mac: args[1..7].try_into().unwrap(),
            })
        }
        COMMAND_ADVERTISE => {
            expect_len(msg, 66)?;
            let adv_len = usize::from(args[0]);
            let sr_len = usize::from(args[32]);
            if adv_len > 31 || sr_len > 31 {
                return Err(CommandError::Value);
            }
            Ok(Command::Advertise {
                adv_data: &args[1..1 + adv_len],
                scan_rsp_data: &args[33..33 + sr_len],
            })
        }
        COMMAND_ADVINTRVL => {
            expect_len(msg, 4)?;
            let ms = LittleEndian::read_u16(args);
            if ms < 20 {
                return Err(CommandError::Value);
            }
            Ok(Command::AdvInterval(ms))
        }
        COMMAND_SETIRK => match msg.len() {
            18 => Ok(Command::SetIrk(Some(args[..16].try_into().unwrap()))),
            2 => Ok(Command::SetIrk(None)),
            _ => Err(CommandError::Length),
        },
        COMMAND_INSTAHOP => {
            expect_len(msg, 3)?;
            Ok(Command::InstaHop(args[0] != 0))
        }
        COMMAND_SETMAP => {
            expect_len(msg, 7)?;
            let mut raw = [0u8; 8];
            raw[..5].copy_from_slice(&args[..5]);
            Ok(Command::SetMap(u64::from_le_bytes(raw)))
        }
        COMMAND_INTVL_PRELOAD => {
            // 0 to 4 pairs of (Interval, DeltaInstant)
            if msg.len() < 2 || msg.len() > 18 {
                return Err(CommandError::Length);
            }
            let mut pairs = Vec::new();
            for chunk in args.chunks_exact(4) {
                let interval = LittleEndian::read_u16(&chunk[..2]);
                let delta = LittleEndian::read_u16(&chunk[2..4]);
                pairs.push((interval, delta)).ok();
            }
            Ok(Command::IntervalPreload(pairs))
        }
        COMMAND_SCAN => {
            expect_len(msg, 2)?;
            Ok(Command::Scan)
        }
        COMMAND_PHY_PRELOAD => {
            expect_len(msg, 4)?;
            if args[1] > 3 {
                return Err(CommandError::Value);
            }
            Ok(Command::PhyPreload {
                ignore: args[0] != 0,
                phy: Phy::from(args[1]),
            })
        }
        COMMAND_VERSION => {
            expect_len(msg, 2)?;
            Ok(Command::Version)
        }
        COMMAND_ADV_EXT => {
            // mode(1) primaryPhy(1) secondaryPhy(1) adi(2) advLen(1) advData
            if msg.len() < 8 {
                return Err(CommandError::Length);
            }
            let adv_len = usize::from(args[5]);
            if msg.len() != 8 + adv_len {
                return Err(CommandError::Length);
            }
            if args[1] > 3 || args[2] > 3 || adv_len > 254 {
                return Err(CommandError::Value);
            }
            Ok(Command::AdvertiseExt {
                connectable: args[0] == 1,
                primary_phy: Phy::from(args[1]),
                secondary_phy: Phy::from(args[2]),
                adi: LittleEndian::read_u16(&args[3..5]),
                adv_data: &args[6..6 + adv_len],
            })
        }
        COMMAND_CRC_VALID => {
            expect_len(msg, 3)?;
            Ok(Command::CrcValid(args[0] != 0))
        }
        COMMAND_TX_POWER => {
            expect_len(msg, 3)?;
            Ok(Command::TxPower(args[0] as i8))
        }
        _ => Err(CommandError::Unknown),
    }
}

fn expect_len(msg: &[u8], len: usize) -> Result<(), CommandError> {
    if msg.len() == len {
        Ok(())
    } else {
        Err(CommandError::Length)
    }
}

/// The command handler: parses messages and services the ones it can on
/// its own task.
///
/// `Transmit` is consumed directly here, since this side owns the TX ring
/// producer; every other command is returned for the caller to hand to the
/// radio core (and to apply the resulting [`CommandEffect`]).
///
/// [`CommandEffect`]: crate::sniffer::CommandEffect
pub struct CommandHandler<'a> {
    tx: TxProducer<'a>,
}

impl<'a> CommandHandler<'a> {
    pub fn new(tx: TxProducer<'a>) -> Self {
        CommandHandler { tx }
    }

    /// Parses one message; enqueues `Transmit` locally and returns any
    /// other command for the radio core.
    pub fn dispatch<'m>(&mut self, msg: &'m [u8]) -> Result<Option<Command<'m>>, CommandError> {
        let cmd = parse(msg)?;
        if let Command::Transmit {
            event_ctr,
            llid,
            data,
        } = cmd
        {
            // a full ring silently drops the PDU
            let _ = self.tx.insert(llid, data, event_ctr);
            return Ok(None);
        }
        Ok(Some(cmd))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(opcode: u8, args: &[u8]) -> std::vec::Vec<u8> {
        let mut v = std::vec::Vec::new();
        v.push(((args.len() + 2 + 2) / 3) as u8);
        v.push(opcode);
        v.extend_from_slice(args);
        v
    }

    #[test]
    fn set_chan_aa_phy() {
        let mut args = std::vec![38u8];
        args.extend_from_slice(&0x1234_5678u32.to_le_bytes());
        args.push(1); // 2M
        args.extend_from_slice(&0x00AA_BBCCu32.to_le_bytes());
        match parse(&msg(COMMAND_SETCHANAAPHY, &args)).unwrap() {
            Command::SetChanAaPhy {
                chan,
                aa,
                phy,
                crc_init,
            } => {
                assert_eq!(chan, 38);
                assert_eq!(aa, 0x1234_5678);
                assert_eq!(phy, Phy::M2);
                assert_eq!(crc_init, 0x00AA_BBCC);
            }
            other => panic!("parsed {:?}", other),
        }

        // channel out of range
        let mut bad = args.clone();
        bad[0] = 40;
        assert_eq!(
            parse(&msg(COMMAND_SETCHANAAPHY, &bad)),
            Err(CommandError::Value)
        );
        // short payload
        assert_eq!(
            parse(&msg(COMMAND_SETCHANAAPHY, &args[..8])),
            Err(CommandError::Length)
        );
    }

    #[test]
    fn mac_filter_enable_disable() {
        let mac = [1, 2, 3, 4, 5, 6];
        match parse(&msg(COMMAND_MACFILT, &mac)).unwrap() {
            Command::MacFilter(Some(got)) => assert_eq!(got, mac),
            other => panic!("parsed {:?}", other),
        }
        match parse(&msg(COMMAND_MACFILT, &[])).unwrap() {
            Command::MacFilter(None) => {}
            other => panic!("parsed {:?}", other),
        }
        assert_eq!(
            parse(&msg(COMMAND_MACFILT, &[1, 2, 3])),
            Err(CommandError::Length)
        );
    }

    #[test]
    fn transmit_length_must_match() {
        // eventCtr=5, llid=3, len=2, payload [0xAB, 0xCD]
        let args = [5, 0, 3, 2, 0xAB, 0xCD];
        match parse(&msg(COMMAND_TRANSMIT, &args)).unwrap() {
            Command::Transmit {
                event_ctr,
                llid,
                data,
            } => {
                assert_eq!(event_ctr, 5);
                assert_eq!(llid, 3);
                assert_eq!(data, &[0xAB, 0xCD]);
            }
            other => panic!("parsed {:?}", other),
        }

        let bad = [5, 0, 3, 9, 0xAB, 0xCD]; // claims 9 payload bytes
        assert_eq!(parse(&msg(COMMAND_TRANSMIT, &bad)), Err(CommandError::Length));
    }

    #[test]
    fn interval_preload_pairs() {
        let mut args = std::vec::Vec::new();
        for &(i, d) in &[(24u16, 7u16), (48, 9)] {
            args.extend_from_slice(&i.to_le_bytes());
            args.extend_from_slice(&d.to_le_bytes());
        }
        match parse(&msg(COMMAND_INTVL_PRELOAD, &args)).unwrap() {
            Command::IntervalPreload(pairs) => {
                assert_eq!(pairs.len(), 2);
                assert_eq!(pairs[0], (24, 7));
                assert_eq!(pairs[1], (48, 9));
            }
            other => panic!("parsed {:?}", other),
        }

        // five pairs exceed the message bound
        let too_long = [0u8; 20];
        assert_eq!(
            parse(&msg(COMMAND_INTVL_PRELOAD, &too_long)),
            Err(CommandError::Length)
        );
    }

    #[test]
    fn advertise_bounds() {
        let mut args = std::vec![0u8; 64];
        args[0] = 3;
        args[1..4].copy_from_slice(&[0xA, 0xB, 0xC]);
        args[32] = 2;
        args[33..35].copy_from_slice(&[0xD, 0xE]);
        match parse(&msg(COMMAND_ADVERTISE, &args)).unwrap() {
            Command::Advertise {
                adv_data,
                scan_rsp_data,
            } => {
                assert_eq!(adv_data, &[0xA, 0xB, 0xC]);
                assert_eq!(scan_rsp_data, &[0xD, 0xE]);
            }
            other => panic!("parsed {:?}", other),
        }

        args[0] = 32; // oversize adv data
        assert_eq!(parse(&msg(COMMAND_ADVERTISE, &args)), Err(CommandError::Value));
    }

    #[test]
    fn adv_interval_minimum() {
        assert_eq!(
            parse(&msg(COMMAND_ADVINTRVL, &19u16.to_le_bytes())),
            Err(CommandError::Value)
        );
        match parse(&msg(COMMAND_ADVINTRVL, &100u16.to_le_bytes())).unwrap() {
            Command::AdvInterval(100) => {}
            other => panic!("parsed {:?}", other),
        }
    }

    #[test]
    fn unknown_and_short() {
        assert_eq!(parse(&[1]), Err(CommandError::Length));
        assert_eq!(parse(&msg(0x7F, &[])), Err(CommandError::Unknown));
    }

    #[test]
    fn transmit_goes_to_tx_ring() {
        use crate::queue::TxRing;

        let mut ring = TxRing::new();
        let (p, mut c) = ring.split();
        let mut handler = CommandHandler::new(p);

        let args = [0, 0, 3, 2, 0x0C, 0x01];
        let request = msg(COMMAND_TRANSMIT, &args);
        let out = handler.dispatch(&request).unwrap();
        assert!(out.is_none());

        let grant = c.take();
        assert_eq!(grant.len(), 1);
        let slot = grant.get(0).unwrap();
        assert_eq!(slot.llid, 3);
        assert_eq!(slot.payload, &[0x0C, 0x01]);
    }

    #[test]
    fn non_transmit_passes_through() {
        use crate::queue::TxRing;

        let mut ring = TxRing::new();
        let (p, _c) = ring.split();
        let mut handler = CommandHandler::new(p);

        match handler.dispatch(&msg(COMMAND_SCAN, &[])).unwrap() {
            Some(Command::Scan) => {}
            other => panic!("dispatched {:?}", other),
        }
    }
}
