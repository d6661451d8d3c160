//! Lock-free SPSC rings connecting the three tasks.
//!
//! Two rings cross task boundaries:
//!
//! * [`PacketRing`]: radio callback context produces captured frames, the
//!   host-link sender consumes and serializes them. A full ring drops the
//!   new frame; sniffing must never block on the UART.
//! * [`TxRing`]: the command handler enqueues PDUs to transmit, the radio
//!   task exposes the pending range to the radio for one connection event
//!   and retires entries the radio reports as sent.
//!
//! Both use free-running head/tail counters with power-of-two masking and
//! release/acquire ordering, and both leave one of their 8 slots unused so
//! that full and empty are distinguishable. No compare-and-swap is needed
//! (plain loads and stores only), which keeps them usable on cores without
//! CAS.

use crate::phy::Phy;
use crate::radio::{Direction, Frame, MAX_FRAME_DATA};
use crate::time::Instant;
use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicUsize, Ordering};

/// Number of slots in the packet ring (one is always left unused).
pub const PACKET_SLOTS: usize = 8;
const PACKET_MASK: usize = PACKET_SLOTS - 1;

/// Number of slots in the TX ring (one is always left unused).
pub const TX_SLOTS: usize = 8;
const TX_MASK: usize = TX_SLOTS - 1;

/// Maximum PDU body accepted by [`TxProducer::insert`].
pub const TX_MAX_PAYLOAD: usize = 255;

// LLID byte + payload + 2-byte event counter stuffed after it
const TX_ENTRY_DATA: usize = 1 + TX_MAX_PAYLOAD + 2;

/// An owned copy of a [`Frame`], as stored in packet ring slots.
pub struct FrameBuf {
    pub timestamp: Instant,
    pub crc_error: bool,
    pub direction: Direction,
    pub event_ctr: u16,
    pub rssi: i8,
    pub channel: u8,
    pub phy: Phy,
    len: u16,
    data: [u8; MAX_FRAME_DATA],
}

impl FrameBuf {
    const EMPTY: FrameBuf = FrameBuf {
        timestamp: Instant::from_ticks(0),
        crc_error: false,
        direction: Direction::CentralToPeripheral,
        event_ctr: 0,
        rssi: 0,
        channel: 0,
        phy: Phy::M1,
        len: 0,
        data: [0; MAX_FRAME_DATA],
    };

    fn copy_from(&mut self, frame: &Frame<'_>) {
        let len = frame.data.len().min(MAX_FRAME_DATA);
        self.timestamp = frame.timestamp;
        self.crc_error = frame.crc_error;
        self.direction = frame.direction;
        self.event_ctr = frame.event_ctr;
        self.rssi = frame.rssi;
        self.channel = frame.channel;
        self.phy = frame.phy;
        self.len = len as u16;
        self.data[..len].copy_from_slice(&frame.data[..len]);
    }

    /// The PDU bytes carried by this frame.
    pub fn data(&self) -> &[u8] {
        &self.data[..usize::from(self.len)]
    }
}

/// SPSC ring of captured frames.
///
/// Split it once into its producing and consuming halves; the halves may
/// then live on different tasks.
pub struct PacketRing {
    slots: [UnsafeCell<FrameBuf>; PACKET_SLOTS],
    /// Written only by the producer.
    head: AtomicUsize,
    /// Written only by the consumer.
    tail: AtomicUsize,
}

// The split-once discipline plus release/acquire on head/tail confines each
// slot to exactly one side at a time.
unsafe impl Sync for PacketRing {}

impl PacketRing {
    pub const fn new() -> Self {
        const SLOT: UnsafeCell<FrameBuf> = UnsafeCell::new(FrameBuf::EMPTY);
        PacketRing {
            slots: [SLOT; PACKET_SLOTS],
            head: AtomicUsize::new(0),
            tail: AtomicUsize::new(0),
        }
    }

    /// Splits the ring into its producing and consuming ends.
    pub fn split(&mut self) -> (PacketProducer<'_>, PacketConsumer<'_>) {
        (PacketProducer { ring: self }, PacketConsumer { ring: self })
    }
}

/// Producing half of a [`PacketRing`]; lives with the radio callback.
pub struct PacketProducer<'a> {
    ring: &'a PacketRing,
}

impl<'a> PacketProducer<'a> {
    /// Copies `frame` into the ring.
    ///
    /// Returns `false` (dropping the frame) when the ring is full; the
    /// consumer is never blocked on and never notices the loss.
    pub fn produce(&mut self, frame: &Frame<'_>) -> bool {
        let head = self.ring.head.load(Ordering::Relaxed);
        let tail = self.ring.tail.load(Ordering::Acquire);
        if head.wrapping_sub(tail) & PACKET_MASK == PACKET_MASK {
            return false;
        }

        // Sole producer: the slot at `head` is not visible to the consumer
        // until the store below.
        unsafe {
            (*self.ring.slots[head & PACKET_MASK].get()).copy_from(frame);
        }
        self.ring.head.store(head.wrapping_add(1), Ordering::Release);
        true
    }
}

/// Consuming half of a [`PacketRing`]; lives with the host-link sender.
pub struct PacketConsumer<'a> {
    ring: &'a PacketRing,
}

impl<'a> PacketConsumer<'a> {
    /// Returns whether a frame is ready to be consumed.
    pub fn has_data(&self) -> bool {
        self.ring.head.load(Ordering::Acquire) != self.ring.tail.load(Ordering::Relaxed)
    }

    /// Passes the oldest frame to `f` and releases its slot afterwards.
    ///
    /// Returns `None` when the ring is empty. Pair with the platform's
    /// packet-available notification to avoid busy polling.
    pub fn consume<R>(&mut self, f: impl FnOnce(&FrameBuf) -> R) -> Option<R> {
        let tail = self.ring.tail.load(Ordering::Relaxed);
        let head = self.ring.head.load(Ordering::Acquire);
        if head == tail {
            return None;
        }

        // Sole consumer: the producer does not touch the slot at `tail`
        // until the store below.
        let result = f(unsafe { &*self.ring.slots[tail & PACKET_MASK].get() });
        self.ring.tail.store(tail.wrapping_add(1), Ordering::Release);
        Some(result)
    }
}

struct TxEntry {
    /// LLID byte plus payload (the trailing event counter not included).
    len: u16,
    data: [u8; TX_ENTRY_DATA],
}

impl TxEntry {
    const EMPTY: TxEntry = TxEntry {
        len: 0,
        data: [0; TX_ENTRY_DATA],
    };
}

/// Fixed-slot transmit ring.
///
/// The producer is the command handler; the consumer is the radio task,
/// which hands the pending range to the radio hardware for a connection
/// event via [`TxConsumer::take`] and retires sent entries with
/// [`TxConsumer::flush`].
pub struct TxRing {
    slots: [UnsafeCell<TxEntry>; TX_SLOTS],
    /// Written only by the producer.
    head: AtomicUsize,
    /// Written only by the consumer.
    tail: AtomicUsize,
}

// Same discipline as `PacketRing`.
unsafe impl Sync for TxRing {}

impl TxRing {
    pub const fn new() -> Self {
        const SLOT: UnsafeCell<TxEntry> = UnsafeCell::new(TxEntry::EMPTY);
        TxRing {
            slots: [SLOT; TX_SLOTS],
            head: AtomicUsize::new(0),
            tail: AtomicUsize::new(0),
        }
    }

    /// Splits the ring into its producing and consuming ends.
    pub fn split(&mut self) -> (TxProducer<'_>, TxConsumer<'_>) {
        (TxProducer { ring: self }, TxConsumer { ring: self })
    }
}

/// Producing half of a [`TxRing`]; lives with the command handler.
pub struct TxProducer<'a> {
    ring: &'a TxRing,
}

impl<'a> TxProducer<'a> {
    /// Enqueues one PDU: the LLID, the payload, and the connection event
    /// counter it is intended for (0 = whichever event comes next).
    ///
    /// Returns `false` when the ring is full or the payload is oversized.
    pub fn insert(&mut self, llid: u8, payload: &[u8], event_ctr: u16) -> bool {
        if payload.len() > TX_MAX_PAYLOAD {
            return false;
        }

        let head = self.ring.head.load(Ordering::Relaxed);
        let tail = self.ring.tail.load(Ordering::Acquire);
        if head.wrapping_sub(tail) & TX_MASK == TX_MASK {
            return false;
        }

        unsafe {
            let entry = &mut *self.ring.slots[head & TX_MASK].get();
            // header bits other than LLID are managed by the radio
            entry.data[0] = llid & 0x3;
            entry.data[1..1 + payload.len()].copy_from_slice(payload);
            // stuff the event counter after the body; the radio ignores it
            entry.data[1 + payload.len()..3 + payload.len()]
                .copy_from_slice(&event_ctr.to_le_bytes());
            entry.len = 1 + payload.len() as u16;
        }
        self.ring.head.store(head.wrapping_add(1), Ordering::Release);
        true
    }
}

/// Consuming half of a [`TxRing`]; lives with the radio task.
pub struct TxConsumer<'a> {
    ring: &'a TxRing,
}

impl<'a> TxConsumer<'a> {
    /// Snapshots the pending range `[tail, head)` for the radio.
    ///
    /// Entries inserted after the snapshot are not part of the grant and
    /// will be picked up by the next event.
    pub fn take(&mut self) -> TxGrant<'a> {
        TxGrant {
            ring: self.ring,
            tail: self.ring.tail.load(Ordering::Relaxed),
            head: self.ring.head.load(Ordering::Acquire),
        }
    }

    /// Retires the first `n` pending entries after the radio reported them
    /// as transmitted. Clamped to the pending count.
    pub fn flush(&mut self, n: u32) {
        let tail = self.ring.tail.load(Ordering::Relaxed);
        let head = self.ring.head.load(Ordering::Acquire);
        let pending = head.wrapping_sub(tail) & TX_MASK;
        let n = (n as usize).min(pending);
        self.ring.tail.store(tail.wrapping_add(n), Ordering::Release);
    }

    /// Discards everything in the ring (new roles start with a clean
    /// transmit queue).
    pub fn drain(&mut self) {
        let head = self.ring.head.load(Ordering::Acquire);
        self.ring.tail.store(head, Ordering::Release);
    }
}

/// Immutable view of the pending TX entries, as handed to the radio for
/// one connection event.
#[derive(Copy, Clone)]
pub struct TxGrant<'a> {
    ring: &'a TxRing,
    tail: usize,
    head: usize,
}

impl<'a> TxGrant<'a> {
    /// Number of pending entries in the grant.
    pub fn len(&self) -> usize {
        self.head.wrapping_sub(self.tail) & TX_MASK
    }

    /// A copy of this grant covering no entries; used to run a connection
    /// event without transmitting any queued PDUs.
    pub fn emptied(&self) -> TxGrant<'a> {
        TxGrant {
            ring: self.ring,
            tail: self.tail,
            head: self.tail,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the `i`th pending entry (0 = oldest).
    pub fn get(&self, i: usize) -> Option<TxSlotView<'a>> {
        if i >= self.len() {
            return None;
        }

        // Entries in the granted range are not written by the producer
        // until they have been flushed.
        let entry = unsafe { &*self.ring.slots[(self.tail + i) & TX_MASK].get() };
        let len = usize::from(entry.len);
        Some(TxSlotView {
            llid: entry.data[0],
            payload: &entry.data[1..len],
            event_ctr: u16::from_le_bytes([entry.data[len], entry.data[len + 1]]),
        })
    }

    /// Iterates over the pending entries, oldest first.
    pub fn iter(&self) -> impl Iterator<Item = TxSlotView<'a>> + '_ {
        (0..self.len()).filter_map(move |i| self.get(i))
    }
}

/// One entry of a [`TxGrant`].
#[derive(Copy, Clone)]
pub struct TxSlotView<'a> {
    pub llid: u8,
    pub payload: &'a [u8],
    /// Event counter the command handler stamped on the entry (0 = none).
    pub event_ctr: u16,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(data: &[u8], channel: u8) -> Frame<'_> {
        Frame {
            timestamp: Instant::from_ticks(1234),
            crc_error: false,
            direction: Direction::PeripheralToCentral,
            event_ctr: 7,
            rssi: -42,
            channel,
            phy: Phy::M2,
            data,
        }
    }

    #[test]
    fn packet_ring_fifo() {
        let mut ring = PacketRing::new();
        let (mut p, mut c) = ring.split();

        assert!(!c.has_data());
        for i in 0..3u8 {
            assert!(p.produce(&frame(&[i], 37)));
        }
        for i in 0..3u8 {
            let got = c.consume(|slot| (slot.data()[0], slot.rssi, slot.channel));
            assert_eq!(got, Some((i, -42, 37)));
        }
        assert_eq!(c.consume(|_| ()), None);
    }

    #[test]
    fn packet_ring_drops_when_full() {
        let mut ring = PacketRing::new();
        let (mut p, mut c) = ring.split();

        for i in 0..PACKET_SLOTS as u8 - 1 {
            assert!(p.produce(&frame(&[i], 0)));
        }
        // 8th frame has nowhere to go
        assert!(!p.produce(&frame(&[0xFF], 0)));

        // consumer sees exactly the 7 accepted frames, in order
        for i in 0..PACKET_SLOTS as u8 - 1 {
            assert_eq!(c.consume(|slot| slot.data()[0]), Some(i));
        }
        assert!(!c.has_data());

        // and the ring keeps working afterwards
        assert!(p.produce(&frame(&[0xAB], 0)));
        assert_eq!(c.consume(|slot| slot.data()[0]), Some(0xAB));
    }

    #[test]
    fn packet_ring_wraps() {
        let mut ring = PacketRing::new();
        let (mut p, mut c) = ring.split();

        for round in 0..40u8 {
            assert!(p.produce(&frame(&[round], 12)));
            assert_eq!(c.consume(|slot| slot.data()[0]), Some(round));
        }
    }

    #[test]
    fn tx_ring_insert_take_flush() {
        let mut ring = TxRing::new();
        let (mut p, mut c) = ring.split();

        assert!(p.insert(0x3, &[0x01, 0x17], 5));
        assert!(p.insert(0x1, &[], 0));

        let grant = c.take();
        assert_eq!(grant.len(), 2);
        let first = grant.get(0).unwrap();
        assert_eq!(first.llid, 0x3);
        assert_eq!(first.payload, &[0x01, 0x17]);
        assert_eq!(first.event_ctr, 5);
        let second = grant.get(1).unwrap();
        assert_eq!(second.llid, 0x1);
        assert!(second.payload.is_empty());
        assert_eq!(second.event_ctr, 0);
        assert!(grant.get(2).is_none());

        // radio sent only the first entry
        c.flush(1);
        let grant = c.take();
        assert_eq!(grant.len(), 1);
        assert_eq!(grant.get(0).unwrap().llid, 0x1);

        // over-flushing is clamped
        c.flush(10);
        assert!(c.take().is_empty());
    }

    #[test]
    fn tx_ring_full_and_oversize() {
        let mut ring = TxRing::new();
        let (mut p, mut c) = ring.split();

        for _ in 0..TX_SLOTS - 1 {
            assert!(p.insert(0x2, &[0xAA], 0));
        }
        assert!(!p.insert(0x2, &[0xBB], 0));

        let too_big = [0u8; TX_MAX_PAYLOAD + 1];
        assert!(!p.insert(0x2, &too_big, 0));

        c.drain();
        assert!(p.insert(0x2, &[0xCC], 0));
        assert_eq!(c.take().len(), 1);
    }

    #[test]
    fn grant_is_stable_across_inserts() {
        let mut ring = TxRing::new();
        let (mut p, mut c) = ring.split();

        assert!(p.insert(0x3, &[1], 0));
        let grant = c.take();
        assert!(p.insert(0x3, &[2], 0));

        // the grant still covers only the snapshot
        assert_eq!(grant.len(), 1);
        assert_eq!(grant.get(0).unwrap().payload, &[1]);
        // a fresh snapshot sees both
        assert_eq!(c.take().len(), 2);
    }
}
