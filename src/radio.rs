//! Radio driver interface.
//!
//! The core does not talk to radio hardware directly. Instead, the platform
//! implements [`RadioDriver`]: a set of blocking radio operations that
//! deliver every received packet to a [`FrameSink`] and obey the
//! [`FrameCmd`] the sink returns. The commands map onto the two one-shot
//! delay timers (hop trigger and stop trigger) and the immediate-stop
//! primitive that a real radio wrapper provides.
//!
//! A radio operation returns either when its end time is reached, when the
//! link-layer sequencing for the event completes, or when an asynchronous
//! stop (issued by the command handler or a delay trigger) aborts it.

use crate::link::DeviceAddress;
use crate::phy::Phy;
use crate::time::{Duration, Instant};

/// Channel numbers 40 and up mark out-of-band messages travelling through
/// the packet ring instead of real BLE frames.
pub const MSGCHAN_DEBUG: u8 = 40;
/// Marker message carrying the radio time at which it was generated.
pub const MSGCHAN_MARKER: u8 = 41;
/// Sniffer state transition notification.
pub const MSGCHAN_STATE: u8 = 42;
/// Inferred connection parameter measurement.
pub const MSGCHAN_MEASURE: u8 = 43;

/// Largest PDU (2-byte header + body) carried in a frame.
pub const MAX_FRAME_DATA: usize = 260;

/// Direction of a data channel packet.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Direction {
    /// Central to peripheral (master to slave).
    CentralToPeripheral = 0,
    /// Peripheral to central (slave to master).
    PeripheralToCentral = 1,
}

impl Direction {
    /// The single-bit encoding used in the host frame header.
    pub fn bit(self) -> u16 {
        self as u16
    }

    /// Returns the opposite direction.
    pub fn flipped(self) -> Direction {
        match self {
            Direction::CentralToPeripheral => Direction::PeripheralToCentral,
            Direction::PeripheralToCentral => Direction::CentralToPeripheral,
        }
    }
}

impl Default for Direction {
    fn default() -> Self {
        Direction::CentralToPeripheral
    }
}

/// A received (or locally transmitted) packet, as handed to the sniffer
/// core by the radio driver.
///
/// `data` holds the complete PDU: the 2-byte link-layer header followed by
/// the body. `channel` is the BLE channel index for real packets and one of
/// the `MSGCHAN_*` values for out-of-band messages.
#[derive(Debug, Copy, Clone)]
pub struct Frame<'a> {
    pub timestamp: Instant,
    pub crc_error: bool,
    pub direction: Direction,
    pub event_ctr: u16,
    pub rssi: i8,
    pub channel: u8,
    pub phy: Phy,
    pub data: &'a [u8],
}

/// Reaction returned by a [`FrameSink`] for each delivered frame.
///
/// The driver must act on it before delivering the next frame, since hop
/// and stop timing is counted from the moment the packet was processed.
#[must_use]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum FrameCmd {
    /// Nothing to do, keep receiving.
    Continue,

    /// Arm the delayed-hop trigger: advance a chained primary-channel
    /// receive from channel 37 to 38 after the given delay (immediately if
    /// zero). Only meaningful during [`RadioDriver::recv_adv3`].
    TrigHop(Duration),

    /// Push an already-armed hop trigger further into the future by the
    /// given amount. Ignored when no hop is pending.
    PostponeHop(Duration),

    /// Arm the delayed-stop trigger: abort the ongoing operation after the
    /// given delay. Re-arming may only move the stop earlier, never later.
    TrigStop(Duration),

    /// Abort the ongoing operation now.
    Stop,

    /// Reset data-channel sequence numbers, then abort the ongoing
    /// operation. Issued when a connection request converts the advertiser
    /// role into a peripheral connection.
    ResetSeqAndStop,
}

/// Receiver of frames delivered from radio callback context.
///
/// Implemented by the sniffer core; the driver calls it for every packet
/// that passes hardware-level filtering (access address match and, when
/// enabled, CRC validation).
pub trait FrameSink {
    fn on_frame(&mut self, frame: &Frame<'_>) -> FrameCmd;
}

/// Errors reported by radio operations.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum RadioError {
    /// The operation ended without the expected packet exchange (missed
    /// connection event, no advertisement caught). Treated as a missed
    /// event, never as fatal.
    NoLink,

    /// The operation was aborted by an asynchronous stop.
    Stopped,
}

/// How a connection event ended.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum EventStatus {
    /// At least one packet was exchanged.
    Received,
    /// Nothing was received during the event window.
    NoLink,
    /// The event was cut short by an asynchronous stop.
    Stopped,
}

/// Result of a central or peripheral connection event.
#[derive(Debug, Copy, Clone)]
pub struct ConnEventOutcome {
    /// Number of TX queue entries the radio reported as sent.
    pub num_sent: u32,
    pub status: EventStatus,
}

/// A single-channel receive window.
#[derive(Debug, Copy, Clone)]
pub struct RxWindow {
    pub phy: Phy,
    pub chan: u8,
    pub access_address: u32,
    pub crc_init: u32,
    /// Absolute end of the window; `None` receives until stopped.
    pub end: Option<Instant>,
    pub validate_crc: bool,
}

/// Timing and addressing for one connection event.
#[derive(Debug, Copy, Clone)]
pub struct ConnEventWindow {
    pub phy: Phy,
    pub chan: u8,
    pub access_address: u32,
    pub crc_init: u32,
    /// Anchor time at which the central starts transmitting; `None` lets
    /// the radio start immediately (peripheral role).
    pub start: Option<Instant>,
    /// Absolute end of the event window.
    pub end: Instant,
}

/// Parameters for legacy advertising on the three primary channels.
#[derive(Debug, Copy, Clone)]
pub struct AdvertParams<'a> {
    pub advertiser: DeviceAddress,
    pub adv_data: &'a [u8],
    pub scan_rsp_data: &'a [u8],
    pub connectable: bool,
}

/// Parameters for one round of extended advertising: ADV_EXT_IND on the
/// primary channels pointing at an AUX_ADV_IND on a secondary channel.
#[derive(Debug, Copy, Clone)]
pub struct ExtAdvertParams<'a> {
    pub advertiser: DeviceAddress,
    pub adv_data: &'a [u8],
    pub connectable: bool,
    pub primary_phy: Phy,
    pub secondary_phy: Phy,
    pub secondary_chan: u8,
    /// Advertising Data Info (DID/SID) carried in the ADI field.
    pub adi: u16,
}

/// Outcome of a successful initiation: the connection request was
/// transmitted and the data channel parameters are in effect.
#[derive(Debug, Copy, Clone)]
pub struct InitiatedConn {
    /// Timestamp of the transmitted CONNECT_IND / AUX_CONNECT_REQ.
    pub conn_time: Instant,
    /// PHY the connection was established on.
    pub phy: Phy,
    /// Whether channel selection algorithm #2 is in effect.
    pub used_csa2: bool,
    /// Whether the connection was made through a secondary channel
    /// (AUX_CONNECT_REQ rather than CONNECT_IND).
    pub via_aux: bool,
}

/// Blocking radio operations provided by the platform.
///
/// All operations deliver received frames to `sink` and must apply the
/// returned [`FrameCmd`] before resuming reception.
pub trait RadioDriver {
    /// Receives frames in the given window.
    fn recv_frames(&mut self, window: &RxWindow, sink: &mut dyn FrameSink);

    /// Receives advertisements on channel 37, hops to 38 when the hop
    /// trigger fires, to 39 after a further `delay1`, and ends `delay2`
    /// after arriving on 39.
    fn recv_adv3(
        &mut self,
        delay1: Duration,
        delay2: Duration,
        validate_crc: bool,
        sink: &mut dyn FrameSink,
    );

    /// Actively scans for extended and legacy advertising until stopped.
    fn scan(&mut self, phy: Phy, chan: u8, scanner: DeviceAddress, sink: &mut dyn FrameSink);

    /// Actively scans for legacy advertising only, until stopped.
    fn scan_legacy(&mut self, chan: u8, scanner: DeviceAddress, sink: &mut dyn FrameSink);

    /// Waits for a connectable advertisement from `peer` and transmits a
    /// connection request carrying `ll_data` (the 22-byte LLData payload).
    fn initiate(
        &mut self,
        phy: Phy,
        chan: u8,
        initiator: DeviceAddress,
        peer: DeviceAddress,
        ll_data: &[u8; 22],
        sink: &mut dyn FrameSink,
    ) -> Result<InitiatedConn, RadioError>;

    /// Runs one connection event in the central role, transmitting pending
    /// entries from `tx`.
    fn central(
        &mut self,
        window: &ConnEventWindow,
        tx: &crate::queue::TxGrant<'_>,
        sink: &mut dyn FrameSink,
    ) -> ConnEventOutcome;

    /// Runs one connection event in the peripheral role.
    fn peripheral(
        &mut self,
        window: &ConnEventWindow,
        tx: &crate::queue::TxGrant<'_>,
        sink: &mut dyn FrameSink,
    ) -> ConnEventOutcome;

    /// Sends one advertising event (one PDU on each primary channel) and
    /// answers scan requests; returns after the event unless a connection
    /// request arrived first.
    fn advertise3(&mut self, params: &AdvertParams<'_>, sink: &mut dyn FrameSink);

    /// Sends one extended advertising event.
    fn advertise_ext3(&mut self, params: &ExtAdvertParams<'_>, sink: &mut dyn FrameSink);

    /// Resets data-channel sequence numbers ahead of a new central or
    /// peripheral connection.
    fn reset_seq_stat(&mut self);

    /// Arms the delayed-stop trigger from task context. Re-arming may only
    /// move a pending stop earlier, never later.
    fn schedule_stop(&mut self, after: Duration);

    /// Sets the transmit power in dBm.
    fn set_tx_power(&mut self, dbm: i8);
}
