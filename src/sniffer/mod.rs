//! The sniffer radio core: top-level state machine and connection tracking.
//!
//! [`RadioCore`] owns all radio-facing state. Its [`step`] method runs one
//! iteration of the main loop (one radio operation, dispatched on the
//! current [`SnifferState`]), and its [`FrameSink`] implementation is the
//! reactive path invoked from radio callback context for every received
//! packet: filtering, protocol tracking, and forwarding into the packet
//! ring towards the host.
//!
//! Connection following works by reproducing the peer's channel-hopping
//! schedule. A `CONNECT_IND` seeds the hop parameters; afterwards the
//! per-event housekeeping advances the unmapped channel, applies pending
//! parameter changes at their instants, and compensates for the central's
//! clock drift using the measured anchor offsets. When the link is
//! encrypted, parameter-change PDUs can no longer be read, so their
//! meaning is *guessed from their length* and scheduled a safe number of
//! events into the future; the inference machinery then measures what
//! actually changed.
//!
//! [`step`]: RadioCore::step
//! [`FrameSink`]: crate::radio::FrameSink

pub mod adv_cache;
pub mod aux_sched;
pub mod conf_queue;

use crate::config::Config;
use crate::host::command::Command;
use crate::link::advertising::{self, ConnectIndLlData, ExtHeader, PduType};
use crate::link::channel_map::{ChannelMap, Csa1Map};
use crate::link::csa2::Csa2;
use crate::link::data::{self, Llid};
use crate::link::filter::FrameFilter;
use crate::link::llcp::{self, ControlOpcode};
use crate::link::{AddressKind, DeviceAddress};
use crate::phy::{Phy, ADVERTISING_ADDRESS, CRC_PRESET};
use crate::queue::{PacketProducer, TxConsumer, TxGrant};
use crate::radio::{
    AdvertParams, ConnEventWindow, Direction, EventStatus, ExtAdvertParams, Frame, FrameCmd,
    FrameSink, RadioDriver, RxWindow, MSGCHAN_DEBUG, MSGCHAN_MARKER, MSGCHAN_MEASURE, MSGCHAN_STATE,
};
use crate::time::{Duration, Instant, Timer};
use crate::utils::{median, Hex, HexSlice};
use crate::Error;
use core::fmt::Write;
use heapless::consts::*;
use heapless::Vec;

use self::adv_cache::AdvHeaderCache;
use self::aux_sched::AuxAdvScheduler;
use self::conf_queue::ConfQueue;

/// Worst-case latency from arming the hop trigger to the radio actually
/// listening on the next advertising channel, in microseconds. Measured at
/// 240-300 µs on real hardware.
const HOP_TUNE_LISTEN_LATENCY: Duration = Duration::from_micros(300);

/// Target offset before the anchor point at which to start listening on the
/// next data channel (0.5 ms).
const AO_TARG: Duration = Duration::from_ticks(2000);

/// How far ahead of the announced aux packet start the radio should be
/// tuned and listening.
const AUX_OFF_TARG: Duration = Duration::from_micros(500);

/// Receive windows shorter than this are skipped; the radio can stall on an
/// end time that has already passed.
const LISTEN_TICKS_MIN: Duration = Duration::from_ticks(2000);

/// Give up interval/WinOffset inference after this many events without an
/// observed change and assume the parameters stayed the same.
const DELTA_INSTANT_TIMEOUT: u16 = 12;

/// Instant offsets for parameter changes inferred from encrypted PDU sizes.
/// Real instants are usually 6-10 events out; these land safely late.
const ENC_PHY_UPDATE_DELTA: u16 = 7;
const ENC_CHAN_MAP_DELTA: u16 = 9;
const ENC_CONN_UPDATE_DELTA: u16 = 6;

/// Placeholder interval (in 1.25 ms units) assumed for an encrypted
/// connection update until the real interval has been measured.
const ENC_PLACEHOLDER_INTERVAL: u16 = 240;

/// Maximum number of preloaded `(Interval, DeltaInstant)` pairs.
pub const MAX_PARAM_PAIRS: usize = 4;

const INTERVAL_SAMPLES: usize = 3;
const ANCHOR_SAMPLES: usize = 4;

/// Measurement message type codes (first byte of a `MEASURE` payload).
pub const MEASTYPE_INTERVAL: u8 = 0;
pub const MEASTYPE_CHANMAP: u8 = 1;
pub const MEASTYPE_ADVHOP: u8 = 2;
pub const MEASTYPE_WINOFFSET: u8 = 3;
pub const MEASTYPE_DELTAINSTANT: u8 = 4;
pub const MEASTYPE_VERSION: u8 = 5;

/// Firmware version reported by [`RadioCore::report_version`].
const VERSION: [u8; 4] = [1, 0, 0, 0]; // major, minor, revision, API level

/// Top-level sniffer states.
///
/// The discriminants are the values carried in `STATE` messages to the
/// host.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SnifferState {
    /// Sit on one channel with a fixed access address.
    Static = 0,
    /// Measure the advertiser's 37/38/39 hop interval.
    AdvertSeek = 1,
    /// Hop along with the advertiser.
    AdvertHop = 2,
    /// Passively follow a data connection.
    Data = 3,
    /// Radio idle after a followed connection ended.
    Paused = 4,
    /// Actively establishing a connection.
    Initiating = 5,
    /// Connected in the central role.
    Central = 6,
    /// Connected in the peripheral role.
    Peripheral = 7,
    /// Legacy advertising.
    Advertising = 8,
    /// Active scanning.
    Scanning = 9,
    /// Extended advertising.
    AdvertisingExt = 10,
}

impl SnifferState {
    /// Whether data channel PDUs are expected in this state.
    pub fn is_data_state(self) -> bool {
        matches!(
            self,
            SnifferState::Data | SnifferState::Central | SnifferState::Peripheral
        )
    }
}

/// Radio configuration for one stretch of a followed connection.
///
/// The three `*_certain` flags drive speculative inference: when a
/// parameter change happens under encryption its new value cannot be read,
/// so the corresponding flag is cleared and the value is measured from
/// packet timing over the following events.
#[derive(Debug, Copy, Clone)]
pub struct RadioConfig {
    pub chan_map: ChannelMap,
    pub hop_interval: Duration,
    /// WinOffset of a pending connection update, in 1.25 ms units.
    pub offset: u16,
    pub slave_latency: u16,
    pub conn_timeout: Duration,
    pub phy: Phy,
    pub interval_certain: bool,
    pub chan_map_certain: bool,
    pub win_offset_certain: bool,
}

impl Default for RadioConfig {
    fn default() -> Self {
        RadioConfig {
            chan_map: ChannelMap::with_all_channels(),
            hop_interval: Duration::ZERO,
            offset: 0,
            slave_latency: 0,
            conn_timeout: Duration::ZERO,
            phy: Phy::M1,
            interval_certain: true,
            chan_map_certain: true,
            win_offset_certain: true,
        }
    }
}

/// What the caller has to do after handing a command to the core.
#[must_use]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CommandEffect {
    /// Nothing; the command is fully handled.
    None,
    /// Abort the ongoing radio operation so the main loop re-dispatches.
    StopRadio,
    /// Forward the new transmit power to the radio driver.
    SetTxPower(i8),
    /// Reset the whole device.
    SystemReset,
}

/// The sniffer core.
///
/// Owns the connection-tracking state, the small schedulers, the packet
/// ring producer and the TX ring consumer. The main radio task repeatedly
/// calls [`RadioCore::step`]; the command task funnels parsed commands into
/// [`RadioCore::handle_command`] under a short lock.
pub struct RadioCore<'a, C: Config> {
    timer: C::Timer,
    packets: PacketProducer<'a>,
    tx: TxConsumer<'a>,
    filter: FrameFilter,

    state: SnifferState,
    sniff_done_state: SnifferState,

    // static-channel listening parameters
    stat_chan: u8,
    stat_phy: Phy,
    stat_crc_init: u32,

    // connection state
    rconf: RadioConfig,
    access_address: u32,
    crc_init: u32,
    cur_unmapped: u8,
    hop_increment: u8,
    conn_event_count: u32,
    next_hop_time: Instant,
    conn_timeout_time: Instant,
    empty_hops: u16,
    use_csa2: bool,
    ll_encryption: bool,
    csa1: Csa1Map,
    csa2: Csa2,

    // advertisement hopping
    fast_adv_hop: bool,
    got_legacy_38: bool,
    got_legacy_39: bool,
    got_aux_conn_req: bool,
    last_adv_timestamp: Instant,
    scan_rsp_len: u16,
    postponed: bool,
    adv_hop_enabled: bool,
    aux_adv_enabled: bool,

    // anchor tracking and clock drift compensation
    first_packet: bool,
    anchor_offsets: [u32; ANCHOR_SAMPLES],
    ao_idx: usize,
    last_anchor_ticks: Instant,

    // encrypted interval/WinOffset inference
    interval_ticks: [u32; INTERVAL_SAMPLES],
    it_idx: u32,
    chan_map_test_mask: u64,
    conn_update_instant: u16,
    prev_interval: u16,
    time_delta: u16,

    // preloaded meanings for encrypted parameter changes
    param_pairs: Vec<(u16, u16), U4>,
    preloaded_param_idx: usize,
    ignore_enc_phy_change: bool,
    preloaded_phy: Phy,

    // policy switches
    follow_connections: bool,
    insta_hop: bool,
    validate_crc: bool,

    // per-event bookkeeping
    more_data: u8,
    pkt_dir: Direction,

    // our own identity and peer for active roles
    our_addr: DeviceAddress,
    peer_addr: DeviceAddress,
    conn_req_lldata: [u8; 22],

    // advertising payloads for the advertiser roles
    adv_data: [u8; 254],
    adv_len: u8,
    scan_rsp_data: [u8; 31],
    scan_rsp_data_len: u8,
    adv_interval_ms: u16,
    ext_adv_connectable: bool,
    primary_adv_phy: Phy,
    secondary_adv_phy: Phy,
    secondary_adv_chan: u8,
    adi: u16,

    aux_sched: AuxAdvScheduler,
    conf_queue: ConfQueue,
    adv_cache: AdvHeaderCache,
}

impl<'a, C: Config> RadioCore<'a, C> {
    /// Creates the core in the `Static` state, listening for advertisements
    /// on channel 37.
    pub fn new(timer: C::Timer, packets: PacketProducer<'a>, tx: TxConsumer<'a>) -> Self {
        RadioCore {
            timer,
            packets,
            tx,
            filter: FrameFilter::new(),

            state: SnifferState::Static,
            sniff_done_state: SnifferState::Static,

            stat_chan: 37,
            stat_phy: Phy::M1,
            stat_crc_init: CRC_PRESET,

            rconf: RadioConfig::default(),
            access_address: ADVERTISING_ADDRESS,
            crc_init: CRC_PRESET,
            cur_unmapped: 0,
            hop_increment: 0,
            conn_event_count: 0,
            next_hop_time: Instant::from_ticks(0),
            conn_timeout_time: Instant::from_ticks(0),
            empty_hops: 0,
            use_csa2: false,
            ll_encryption: false,
            csa1: Csa1Map::default(),
            csa2: Csa2::default(),

            fast_adv_hop: false,
            got_legacy_38: false,
            got_legacy_39: false,
            got_aux_conn_req: false,
            last_adv_timestamp: Instant::from_ticks(0),
            scan_rsp_len: 26,
            postponed: false,
            adv_hop_enabled: false,
            aux_adv_enabled: false,

            first_packet: false,
            anchor_offsets: [0; ANCHOR_SAMPLES],
            ao_idx: 0,
            last_anchor_ticks: Instant::from_ticks(0),

            interval_ticks: [0; INTERVAL_SAMPLES],
            it_idx: 0,
            chan_map_test_mask: 0,
            conn_update_instant: 0,
            prev_interval: 0,
            time_delta: 0,

            param_pairs: Vec::new(),
            preloaded_param_idx: 0,
            ignore_enc_phy_change: false,
            preloaded_phy: Phy::M2,

            follow_connections: true,
            insta_hop: true,
            validate_crc: true,

            more_data: 0,
            pkt_dir: Direction::CentralToPeripheral,

            our_addr: DeviceAddress::default(),
            peer_addr: DeviceAddress::default(),
            conn_req_lldata: [0; 22],

            adv_data: [0; 254],
            adv_len: 0,
            scan_rsp_data: [0; 31],
            scan_rsp_data_len: 0,
            adv_interval_ms: 100,
            ext_adv_connectable: false,
            primary_adv_phy: Phy::M1,
            secondary_adv_phy: Phy::M2,
            secondary_adv_chan: 0,
            adi: 0,

            aux_sched: AuxAdvScheduler::new(),
            conf_queue: ConfQueue::new(),
            adv_cache: AdvHeaderCache::new(),
        }
    }

    /// Returns a reference to the timer instance used by the core.
    pub fn timer(&mut self) -> &mut C::Timer {
        &mut self.timer
    }

    /// The current top-level state.
    pub fn state(&self) -> SnifferState {
        self.state
    }

    /// The access address currently listened for.
    pub fn access_address(&self) -> u32 {
        self.access_address
    }

    /// Whether the tracked connection uses channel selection algorithm #2.
    pub fn uses_csa2(&self) -> bool {
        self.use_csa2
    }

    /// The radio configuration of the tracked connection.
    pub fn conf(&self) -> &RadioConfig {
        &self.rconf
    }

    /// Absolute radio time of the next connection event's listen deadline.
    pub fn next_hop_time(&self) -> Instant {
        self.next_hop_time
    }

    /// Connection event counter of the tracked connection.
    pub fn conn_event_count(&self) -> u32 {
        self.conn_event_count
    }

    /// The data channel the next connection event takes place on.
    pub fn current_channel(&self) -> u8 {
        if self.use_csa2 {
            self.csa2.channel(self.conn_event_count as u16)
        } else {
            self.csa1.channel(self.cur_unmapped)
        }
    }

    // ------------------------------------------------------------------
    // Main loop
    // ------------------------------------------------------------------

    /// Runs one iteration of the state-machine main loop: a single radio
    /// operation plus its follow-up housekeeping.
    pub fn step(&mut self, radio: &mut C::Radio) {
        self.pkt_dir = Direction::CentralToPeripheral;
        self.got_aux_conn_req = false;

        match self.state {
            SnifferState::Static => self.step_static(radio),
            SnifferState::AdvertSeek => self.step_advert_seek(radio),
            SnifferState::AdvertHop => self.step_advert_hop(radio),
            SnifferState::Data => self.step_data(radio),
            SnifferState::Paused => self.timer.sleep(Duration::from_millis(1)),
            SnifferState::Initiating => self.step_initiating(radio),
            SnifferState::Central => self.step_central(radio),
            SnifferState::Peripheral => self.step_peripheral(radio),
            SnifferState::Advertising => self.step_advertising(radio),
            SnifferState::Scanning => self.step_scanning(radio),
            SnifferState::AdvertisingExt => self.step_advertising_ext(radio),
        }
    }

    fn step_static(&mut self, radio: &mut C::Radio) {
        if self.aux_adv_enabled {
            let now = self.timer.now();
            let w = self.aux_sched.next(now);
            if (w.until - LISTEN_TICKS_MIN).is_before(now) {
                // pointless to listen for a tiny period, and an end time in
                // the past can stall the radio
                return;
            }
            let (phy, chan, aa) = match w.target {
                Some((chan, phy)) => (phy, chan, ADVERTISING_ADDRESS),
                None => (self.stat_phy, self.stat_chan, self.access_address),
            };
            let window = RxWindow {
                phy,
                chan,
                access_address: aa,
                crc_init: self.stat_crc_init,
                end: Some(w.until),
                validate_crc: self.validate_crc,
            };
            radio.recv_frames(&window, self);
        } else {
            // receive forever (until stopped)
            let window = RxWindow {
                phy: self.stat_phy,
                chan: self.stat_chan,
                access_address: self.access_address,
                crc_init: self.stat_crc_init,
                end: None,
                validate_crc: self.validate_crc,
            };
            radio.recv_frames(&window, self);
        }
    }

    fn step_advert_seek(&mut self, radio: &mut C::Radio) {
        self.got_legacy_38 = false;
        self.got_legacy_39 = false;

        // If no legacy advertisements show up for 3 seconds and extended
        // advertising is of interest, give up seeking and hop with an
        // assumed interval; the hop can be corrected later.
        if self.aux_adv_enabled {
            radio.schedule_stop(Duration::from_millis(3000));
        }

        // Jump straight from 37 to 39 on later rounds to catch very fast
        // hoppers.
        let delay1 = if self.conn_event_count == 0 || self.fast_adv_hop {
            Duration::ZERO
        } else {
            Duration::from_micros(450)
        };
        radio.recv_adv3(delay1, Duration::from_millis(22), self.validate_crc, self);

        // break out early if we were cancelled
        if self.state != SnifferState::AdvertSeek {
            return;
        }

        if !self.got_legacy_38 && !self.got_legacy_39 && self.aux_adv_enabled {
            self.rconf.hop_interval = Duration::from_micros(688);
            self.dprint(format_args!("No legacy ads, hopping with assumed interval"));
            self.transition(SnifferState::AdvertHop);
            return;
        }

        // it might be hopping too fast to catch the advertisement on 38
        if !self.got_legacy_38 && !self.got_legacy_39 && !self.fast_adv_hop {
            self.fast_adv_hop = true;
        }

        // assume that in 5 advertiser hops, at least one is without scans
        if self.conn_event_count >= 5 {
            let hop_us = self.rconf.hop_interval.micros();
            self.report_adv_hop(hop_us);
            self.transition(SnifferState::AdvertHop);
        }
    }

    fn step_advert_hop(&mut self, radio: &mut C::Radio) {
        self.postponed = false;

        let delay1 = self.rconf.hop_interval - Duration::from_ticks(60);
        let delay2 = self.rconf.hop_interval + Duration::from_ticks(5000);

        if self.aux_adv_enabled {
            let now = self.timer.now();
            let w = self.aux_sched.next(now);
            if (w.until - LISTEN_TICKS_MIN).is_before(now) {
                return;
            }
            if let Some((chan, phy)) = w.target {
                let window = RxWindow {
                    phy,
                    chan,
                    access_address: ADVERTISING_ADDRESS,
                    crc_init: CRC_PRESET,
                    end: Some(w.until),
                    validate_crc: self.validate_crc,
                };
                radio.recv_frames(&window, self);
            } else {
                // the chained primary receive has to yield eventually so
                // the scheduler gets another look
                radio.schedule_stop(Duration::from_ticks(w.until.ticks_since(now)));
                radio.recv_adv3(delay1, delay2, self.validate_crc, self);
            }
        } else {
            radio.recv_adv3(delay1, delay2, self.validate_crc, self);
        }
    }

    fn step_data(&mut self, radio: &mut C::Radio) {
        // When WinOffset is unknown the event might start up to one whole
        // interval late, so the window is extended accordingly.
        let extension = if self.rconf.win_offset_certain {
            Duration::ZERO
        } else {
            self.rconf.hop_interval
        };
        self.first_packet = true;
        self.more_data = 0x3;

        let window = RxWindow {
            phy: self.rconf.phy,
            chan: self.current_channel(),
            access_address: self.access_address,
            crc_init: self.crc_init,
            end: Some(self.next_hop_time + extension),
            validate_crc: self.validate_crc,
        };
        radio.recv_frames(&window, self);

        let got_data = !self.first_packet;
        self.after_conn_event(true, got_data);
    }

    fn step_initiating(&mut self, radio: &mut C::Radio) {
        self.pkt_dir = Direction::PeripheralToCentral;
        let (phy, chan) = (self.stat_phy, self.stat_chan);
        let (our, peer) = (self.our_addr, self.peer_addr);
        let ll_data = self.conn_req_lldata;

        let result = radio.initiate(phy, chan, our, peer, &ll_data, self);

        if self.state != SnifferState::Initiating {
            return; // initiating was cancelled
        }
        match result {
            Ok(conn) => {
                self.use_csa2 = conn.used_csa2;
                self.handle_conn_req(conn.phy, Instant::from_ticks(0), &ll_data, conn.via_aux);
                self.next_hop_time = conn.conn_time - AO_TARG + self.rconf.hop_interval;
                radio.reset_seq_stat();
                self.transition(SnifferState::Central);
            }
            Err(_) => self.handle_conn_finished(),
        }
    }

    fn step_central(&mut self, radio: &mut C::Radio) {
        let grant = self.tx.take();
        // no anchor offset bookkeeping needed, we set the anchor ourselves
        self.first_packet = false;
        self.pkt_dir = Direction::PeripheralToCentral;

        let chan = self.current_channel();
        let cur_hop_time = self.next_hop_time - self.rconf.hop_interval + AO_TARG;

        let mut outcome;
        if self.rconf.win_offset_certain {
            let window = ConnEventWindow {
                phy: self.rconf.phy,
                chan,
                access_address: self.access_address,
                crc_init: self.crc_init,
                start: Some(cur_hop_time),
                end: self.next_hop_time,
            };
            outcome = radio.central(&window, &grant, self);
        } else {
            // Sweep WinOffset one event at a time, transmitting nothing but
            // empty PDUs, until the peripheral answers; that event fixes
            // the real WinOffset.
            let empty = grant.emptied();
            let max_offset = self.rconf.hop_interval.ticks() / 5000;
            let mut win_offset = 0u32;
            outcome = crate::radio::ConnEventOutcome {
                num_sent: 0,
                status: EventStatus::NoLink,
            };
            while win_offset <= max_offset && self.state == SnifferState::Central {
                let shift = Duration::from_ticks(win_offset * 5000);
                let window = ConnEventWindow {
                    phy: self.rconf.phy,
                    chan,
                    access_address: self.access_address,
                    crc_init: self.crc_init,
                    start: Some(cur_hop_time + shift),
                    end: self.next_hop_time + shift,
                };
                outcome = radio.central(&window, &empty, self);
                match outcome.status {
                    EventStatus::Received => {
                        self.rconf.win_offset_certain = true;
                        self.report_win_offset(win_offset as u16);
                        self.next_hop_time = self.next_hop_time + shift;
                        break;
                    }
                    EventStatus::Stopped => break,
                    EventStatus::NoLink => win_offset += 1,
                }
            }
            if win_offset > max_offset {
                self.dprint(format_args!("Central failed to measure WinOffset"));
            }
        }

        if outcome.status == EventStatus::Stopped || self.state != SnifferState::Central {
            // quickly break out due to cancellation
            self.tx.flush(outcome.num_sent);
            return;
        }
        self.react_to_transmitted(&grant, outcome.num_sent);
        self.tx.flush(outcome.num_sent);

        // sleep until shortly before the next anchor point
        let remaining = self.next_hop_time.delta(self.timer.now());
        if remaining > 2000 {
            self.timer.sleep(Duration::from_ticks(remaining as u32));
        }

        self.after_conn_event(false, outcome.status == EventStatus::Received);
    }

    fn step_peripheral(&mut self, radio: &mut C::Radio) {
        let grant = self.tx.take();
        let extension = if self.rconf.win_offset_certain {
            Duration::ZERO
        } else {
            self.rconf.hop_interval
        };
        // for anchor offset calculations
        self.first_packet = true;

        let window = ConnEventWindow {
            phy: self.rconf.phy,
            chan: self.current_channel(),
            access_address: self.access_address,
            crc_init: self.crc_init,
            start: None,
            end: self.next_hop_time + extension,
        };
        let outcome = radio.peripheral(&window, &grant, self);

        if outcome.status == EventStatus::Stopped || self.state != SnifferState::Peripheral {
            self.tx.flush(outcome.num_sent);
            return;
        }
        self.react_to_transmitted(&grant, outcome.num_sent);
        self.tx.flush(outcome.num_sent);

        let remaining = self.next_hop_time.delta(self.timer.now());
        if remaining > 2000 && !(self.ll_encryption && self.insta_hop) {
            self.timer.sleep(Duration::from_ticks(remaining as u32));
        }

        self.after_conn_event(true, outcome.status == EventStatus::Received);
    }

    fn step_advertising(&mut self, radio: &mut C::Radio) {
        // slightly "randomize" advertisement timing as per spec
        let sleep_ms = u32::from(self.adv_interval_ms) + (self.timer.now().ticks() & 0x7);
        let adv_data = self.adv_data;
        let scan_rsp = self.scan_rsp_data;
        let params = AdvertParams {
            advertiser: self.our_addr,
            adv_data: &adv_data[..usize::from(self.adv_len)],
            scan_rsp_data: &scan_rsp[..usize::from(self.scan_rsp_data_len)],
            connectable: true,
        };
        radio.advertise3(&params, self);

        // don't sleep if a connection was just established
        if self.state == SnifferState::Advertising {
            self.timer.sleep(Duration::from_millis(sleep_ms));
        }
    }

    fn step_scanning(&mut self, radio: &mut C::Radio) {
        // scan forever (until stopped)
        if self.aux_adv_enabled {
            radio.scan(self.stat_phy, self.stat_chan, self.our_addr, self);
        } else {
            radio.scan_legacy(self.stat_chan, self.our_addr, self);
        }
    }

    fn step_advertising_ext(&mut self, radio: &mut C::Radio) {
        let sleep_ms = u32::from(self.adv_interval_ms) + (self.timer.now().ticks() & 0x7);
        let adv_data = self.adv_data;
        let params = ExtAdvertParams {
            advertiser: self.our_addr,
            adv_data: &adv_data[..usize::from(self.adv_len)],
            connectable: self.ext_adv_connectable,
            primary_phy: self.primary_adv_phy,
            secondary_phy: self.secondary_adv_phy,
            secondary_chan: self.secondary_adv_chan,
            adi: self.adi,
        };
        radio.advertise_ext3(&params, self);
        self.secondary_adv_chan = (self.secondary_adv_chan + 1) % 37;

        if self.state == SnifferState::AdvertisingExt {
            self.timer.sleep(Duration::from_millis(sleep_ms));
        }
    }

    // ------------------------------------------------------------------
    // Reactive path
    // ------------------------------------------------------------------

    fn react(&mut self, frame: &Frame<'_>) -> FrameCmd {
        if !self.state.is_data_state() || frame.channel >= 37 {
            self.react_to_adv_pdu(frame)
        } else {
            self.react_to_data_pdu(frame, false)
        }
    }

    fn react_to_adv_pdu(&mut self, frame: &Frame<'_>) -> FrameCmd {
        // advertisements must have a header at least
        if frame.data.len() < 2 {
            return FrameCmd::Continue;
        }
        let header = advertising::Header::parse(frame.data);
        let pdu_type = header.pdu_type();
        let adv_len = usize::from(header.payload_length());

        // make sure length is coherent
        if frame.data.len() - 2 < adv_len {
            return FrameCmd::Continue;
        }

        let mut cmd = FrameCmd::Continue;

        /* ADV_EXT_IND is excluded from hop tracking: connection
         * establishment happens on the aux channel, and devices doing both
         * legacy and extended advertising hop the two sets independently,
         * so only legacy ads may drive the 37/38/39 hop timing. */
        if pdu_type.is_legacy_adv() {
            if self.state == SnifferState::AdvertSeek {
                cmd = self.seek_track_advert(frame);
            } else if self.state == SnifferState::AdvertHop && frame.channel == 37 {
                cmd = self.schedule_advert_hop(frame, pdu_type);
            }
        }

        if pdu_type == PduType::ScanRsp {
            self.scan_rsp_len = frame.data.len() as u16;
        }

        /* The advertiser stays on the channel to answer a scan request, so
         * the hop to 38 must stretch to cover SCAN_REQ + T_IFS + SCAN_RSP.
         * Computed from the sniffed frame length (header included, no CRC),
         * hopping slightly early to leave tuning slack:
         * 176 + 150 + (8 + scanRspLen)*8 - 80 - 40 = 270 + scanRspLen*8 µs.
         */
        if pdu_type == PduType::ScanReq
            && frame.channel == 37
            && self.state == SnifferState::AdvertHop
            && !self.postponed
        {
            self.postponed = true;
            return FrameCmd::PostponeHop(Duration::from_micros(
                270 + u32::from(self.scan_rsp_len) * 8,
            ));
        }

        // Cache connectable advertisement headers so the CSA#2 support bit
        // can be checked when a CONNECT_IND arrives later.
        if pdu_type == PduType::AdvInd || pdu_type == PduType::AdvDirectInd {
            if let Some(mac) = adv_a(frame.data, 2) {
                self.adv_cache.store(&mac, frame.data[0]);
            }
            return cmd;
        }

        // react to extended adverts, but don't get distracted while seeking
        if pdu_type == PduType::AdvExtInd
            && self.aux_adv_enabled
            && self.state != SnifferState::AdvertSeek
        {
            return self.react_to_adv_ext_pdu(frame, adv_len);
        }

        // CONNECT_IND on 37-39, or AUX_CONNECT_REQ on a secondary channel
        if pdu_type == PduType::ConnectInd && self.follow_connections {
            let is_aux_req = frame.channel < 37;

            if adv_len != 34 {
                return cmd;
            }

            if self.state == SnifferState::Advertising {
                self.use_csa2 = header.chsel();
            } else {
                // AUX_CONNECT_REQ always uses CSA#2 (ChSel is RFU there);
                // for legacy, both initiator and advertiser must support it
                self.use_csa2 = is_aux_req;
                if !is_aux_req && header.chsel() {
                    if let Some(mac) = adv_a(frame.data, 8) {
                        if let Some(adv_hdr) = self.adv_cache.fetch(&mac) {
                            if adv_hdr & 0x20 != 0 {
                                self.use_csa2 = true;
                            }
                        }
                    }
                }
            }

            // use_csa2 needs to be set before this
            self.handle_conn_req(frame.phy, frame.timestamp, &frame.data[14..36], is_aux_req);

            if self.state == SnifferState::Advertising
                || self.state == SnifferState::AdvertisingExt
            {
                self.transition(SnifferState::Peripheral);
                return FrameCmd::ResetSeqAndStop;
            } else if is_aux_req {
                // hold off until the matching AUX_CONNECT_RSP confirms
                self.got_aux_conn_req = true;
                return cmd;
            } else {
                self.transition(SnifferState::Data);
                return FrameCmd::Stop;
            }
        }

        // got_aux_conn_req is only ever set on a secondary channel with
        // connection following enabled
        if self.got_aux_conn_req && pdu_type == PduType::AuxConnectRsp {
            self.transition(SnifferState::Data);
            return FrameCmd::Stop;
        }

        cmd
    }

    /// Advertiser hop-interval tracking in the `AdvertSeek` state.
    fn seek_track_advert(&mut self, frame: &Frame<'_>) -> FrameCmd {
        if frame.channel == 37 {
            // record the anchor and hop to the next channel right away
            self.last_adv_timestamp = frame.timestamp;
            return FrameCmd::TrigHop(Duration::ZERO);
        }

        if (frame.channel == 38 && !self.got_legacy_38)
            || (frame.channel == 39 && !self.got_legacy_39)
        {
            let mut hop_ticks = frame.timestamp.ticks_since(self.last_adv_timestamp);
            self.last_adv_timestamp = frame.timestamp;
            self.conn_event_count += 1;

            if frame.channel == 38 {
                self.got_legacy_38 = true;
            } else {
                self.got_legacy_39 = true;
                // two hops if 38 was skipped
                if !self.got_legacy_38 {
                    hop_ticks >>= 1;
                }
            }

            // track the minimum observed interval; scans stretch it
            if hop_ticks < self.rconf.hop_interval.ticks() {
                self.rconf.hop_interval = Duration::from_ticks(hop_ticks);
                if hop_ticks.wrapping_sub(frame.data.len() as u32 * 32) < 380 * 4 {
                    self.fast_adv_hop = true;
                }
            }
        }
        FrameCmd::Continue
    }

    /// Schedules the 37 -> 38 hop after an anchor advertisement on 37.
    ///
    /// Timestamps mark the start of the packet and the ad lasts about
    /// `(len + 8) * 8` µs (preamble, AA and CRC included). When following
    /// connections, the radio must be retuned to 38 in time for a
    /// CONNECT_IND there, which starts `ad duration + hop interval + T_IFS`
    /// after the 37 timestamp; the hop is capped at 510 µs past the ad end
    /// so a SCAN_REQ on 37 can still postpone it reliably. When only
    /// advertisements matter, hopping just in time for the ad on 38 is
    /// enough.
    fn schedule_advert_hop(&mut self, frame: &Frame<'_>, pdu_type: PduType) -> FrameCmd {
        let targ_hop_time = if !self.follow_connections || pdu_type == PduType::AdvNonconnInd {
            frame.timestamp + self.rconf.hop_interval - HOP_TUNE_LISTEN_LATENCY
        } else {
            let mut hop_delay = self.rconf.hop_interval.ticks() as i32
                + (Duration::T_IFS.ticks() as i32 - HOP_TUNE_LISTEN_LATENCY.ticks() as i32);
            if hop_delay > 510 * 4 {
                hop_delay = 510 * 4;
            }
            let ad_end = frame.timestamp + Duration::from_ticks((frame.data.len() as u32 + 8) * 32);
            ad_end + Duration::from_ticks(hop_delay as u32)
        };

        let remaining = targ_hop_time.delta(self.timer.now());
        let delay = if remaining < 0 {
            Duration::ZERO
        } else {
            Duration::from_ticks(remaining as u32)
        };
        FrameCmd::TrigHop(delay)
    }

    /// Handles `ADV_EXT_IND`: schedule a secondary-channel window for the
    /// announced auxiliary PDU.
    fn react_to_adv_ext_pdu(&mut self, frame: &Frame<'_>, adv_len: usize) -> FrameCmd {
        let ext = match ExtHeader::parse(&frame.data[2..2 + adv_len]) {
            Some(ext) => ext,
            None => return FrameCmd::Continue,
        };

        let aux = match ext.aux_ptr {
            Some(aux) if self.state != SnifferState::Scanning => aux,
            _ => return FrameCmd::Continue,
        };

        // be tuned and listening a bit before the announced start
        let mut offset = aux.aux_offset();
        offset = if offset < AUX_OFF_TARG {
            Duration::ZERO
        } else {
            offset - AUX_OFF_TARG
        };
        let start = frame.timestamp + offset;

        /* Stay long enough to catch the start of an AUX_CONNECT_RSP or
         * AUX_SCAN_RSP after the longest possible AUX_ADV_IND and the
         * corresponding request:
         *   1M:    2128 + 150 + 360 + 150 + 64   ~ 2852 µs
         *   2M:    1064 + 150 + 180 + 150 + 32   ~ 1576 µs
         *   coded: 17040 + 150 + 2896 + 150 + 392 ~ 20628 µs (S=8)
         */
        let listen = match aux.phy {
            Phy::M1 => Duration::from_micros(3000),
            Phy::M2 => Duration::from_micros(1800),
            _ => Duration::from_micros(21000),
        };
        let _ = self
            .aux_sched
            .insert(aux.chan, aux.phy, start, AUX_OFF_TARG + listen);

        // have the main loop re-evaluate the schedule within 5 ms, or
        // sooner if the aux packet is nearly due
        let to_start = start.delta(self.timer.now());
        let to_start = if to_start < 0 { 0 } else { to_start as u32 };
        if to_start < 5000 * 4 {
            FrameCmd::TrigStop(Duration::from_ticks(to_start))
        } else {
            FrameCmd::TrigStop(Duration::from_millis(5))
        }
    }

    fn react_to_data_pdu(&mut self, frame: &Frame<'_>, transmit: bool) -> FrameCmd {
        /* Clock synchronization: the first packet of each connection event
         * is the anchor point. Only packets we received can be anchors; in
         * the passive and peripheral roles the first packet is always the
         * central's. */
        if self.first_packet && !transmit {
            self.anchor_offsets[self.ao_idx] = frame
                .timestamp
                .ticks()
                .wrapping_add(self.rconf.hop_interval.ticks())
                .wrapping_sub(self.next_hop_time.ticks());
            self.ao_idx = (self.ao_idx + 1) & (ANCHOR_SAMPLES - 1);
            self.first_packet = false;

            if self.insta_hop {
                let delta_ticks = frame.timestamp.ticks_since(self.last_anchor_ticks);
                if !self.rconf.win_offset_certain {
                    self.time_delta = ((delta_ticks + 2500) / 5000) as u16;
                } else if !self.rconf.interval_certain {
                    if (self.it_idx as usize) < INTERVAL_SAMPLES {
                        self.interval_ticks[self.it_idx as usize] = delta_ticks;
                    }
                    self.it_idx = self.it_idx.wrapping_add(1);
                }
            }
            self.last_anchor_ticks = frame.timestamp;
        }

        let dir = if self.state == SnifferState::Data {
            self.pkt_dir = self.pkt_dir.flipped();
            self.pkt_dir
        } else {
            frame.direction
        };

        // data channel PDUs should at least have a 2 byte header
        if frame.data.len() < 2 {
            return FrameCmd::Continue;
        }
        let header = data::Header::parse(frame.data);
        let dat_len = usize::from(header.payload_length());

        let mut cmd = FrameCmd::Continue;

        if !header.md() {
            self.more_data &= !(1 << dir.bit());
        }
        // once both sides are done transmitting, an encrypted event holds
        // nothing more of interest: hop eagerly
        if self.ll_encryption
            && self.insta_hop
            && self.more_data == 0
            && self.state == SnifferState::Data
        {
            cmd = FrameCmd::Stop;
        }

        // only LL control PDUs matter for connection tracking
        if header.llid() != Llid::Control {
            return cmd;
        }

        // make sure length is coherent
        if frame.data.len() - 2 != dat_len {
            return cmd;
        }
        let opcode = match frame.data.get(2) {
            Some(op) => *op,
            None => return cmd,
        };

        let last = *self.conf_queue.latest().unwrap_or(&self.rconf);

        /* Without the key, an encrypted LL control opcode is unreadable,
         * so the PDU's meaning is guessed from its size (CtrData + 4 byte
         * MIC) and the change is scheduled safely late. */
        if self.ll_encryption {
            if dat_len == 9 && !self.ignore_enc_phy_change && last.phy != self.preloaded_phy {
                // 1 opcode + 4 CtrData + 4 MIC: LL_PHY_UPDATE_IND
                // (on 5.2+ it could also be a power control response; the
                // preload command exists to override this guess)
                let mut next = last;
                next.offset = 0;
                next.phy = self.preloaded_phy;
                self.conf_queue
                    .enqueue(frame.event_ctr.wrapping_add(ENC_PHY_UPDATE_DELTA), &next);
            } else if dat_len == 12 && self.state != SnifferState::Central && last.interval_certain
            {
                // 1 opcode + 7 CtrData + 4 MIC: LL_CHANNEL_MAP_IND.
                // Switch to a full map late and re-infer which channels
                // remain; as a central the map cannot be measured reliably
                // because peripheral latency may be non-zero.
                let mut next = last;
                next.chan_map = ChannelMap::with_all_channels();
                next.chan_map_certain = false;
                next.offset = 0;
                next.interval_certain = true; // interval test would conflict
                next.win_offset_certain = true;
                next.slave_latency = 10; // tolerate a sparse map
                self.conf_queue
                    .enqueue(frame.event_ctr.wrapping_add(ENC_CHAN_MAP_DELTA), &next);
            } else if dat_len == 16 {
                // 1 opcode + 11 CtrData + 4 MIC: LL_CONNECTION_UPDATE_IND
                if !self.param_pairs.is_empty() {
                    let idx = self.preloaded_param_idx.min(self.param_pairs.len() - 1);
                    if self.preloaded_param_idx < self.param_pairs.len() - 1 {
                        self.preloaded_param_idx += 1;
                    }
                    let (interval, delta_instant) = self.param_pairs[idx];

                    let mut next = last;
                    next.chan_map_certain = true; // map test would conflict
                    next.offset = 0;
                    next.hop_interval = Duration::from_units_1_25ms(interval);
                    next.interval_certain = true;
                    next.win_offset_certain = false; // still to be measured
                    self.conf_queue
                        .enqueue(frame.event_ctr.wrapping_add(delta_instant), &next);
                } else if self.state != SnifferState::Central && self.insta_hop {
                    // No preload: assume a long placeholder interval and
                    // let the inference path measure the real one. An
                    // overlong interval is harmless with insta-hop.
                    let mut next = last;
                    next.chan_map_certain = true;
                    next.offset = 0;
                    next.hop_interval = Duration::from_units_1_25ms(ENC_PLACEHOLDER_INTERVAL);
                    next.interval_certain = false;
                    next.win_offset_certain = false;
                    self.conf_queue
                        .enqueue(frame.event_ctr.wrapping_add(ENC_CONN_UPDATE_DELTA), &next);
                }
                self.conn_update_instant = frame.event_ctr;
                self.prev_interval = ((last.hop_interval.ticks() + 2500) / 5000) as u16;
            }
            return cmd;
        }

        match ControlOpcode::from(opcode) {
            ControlOpcode::ConnectionUpdateInd => {
                if dat_len != 12 {
                    return cmd;
                }
                if let Some(upd) = llcp::ConnectionUpdateInd::decode(&frame.data[3..]) {
                    let mut next = last;
                    next.offset = upd.win_offset();
                    next.hop_interval = Duration::from_units_1_25ms(upd.interval());
                    next.interval_certain = true;
                    next.win_offset_certain = true;
                    next.slave_latency = upd.latency();
                    next.conn_timeout = Duration::from_units_10ms(upd.timeout());
                    self.conf_queue.enqueue(upd.instant(), &next);

                    // a preloaded update expected under encryption might
                    // arrive before encryption starts; move to the next one
                    if !self.param_pairs.is_empty()
                        && self.preloaded_param_idx < self.param_pairs.len() - 1
                    {
                        self.preloaded_param_idx += 1;
                    }
                }
            }
            ControlOpcode::ChannelMapInd => {
                if dat_len != 8 {
                    return cmd;
                }
                if let Some(ind) = llcp::ChannelMapInd::decode(&frame.data[3..]) {
                    let mut next = last;
                    next.chan_map = ind.channel_map();
                    next.chan_map_certain = true;
                    next.offset = 0;
                    self.conf_queue.enqueue(ind.instant(), &next);
                }
            }
            ControlOpcode::TerminateInd => {
                if dat_len != 2 {
                    return cmd;
                }
                self.handle_conn_finished();
                cmd = FrameCmd::Stop;
            }
            ControlOpcode::StartEncReq => {
                self.ll_encryption = true;
            }
            ControlOpcode::PhyUpdateInd => {
                if dat_len != 5 {
                    return cmd;
                }
                if let Some(upd) = llcp::PhyUpdateInd::decode(&frame.data[3..]) {
                    let mut next = last;
                    next.offset = 0;
                    // asymmetric PHYs are not handled, assume both match
                    next.phy = upd.phy_or(last.phy);
                    self.conf_queue.enqueue(upd.instant(), &next);
                }
            }
            _ => {}
        }

        cmd
    }

    /// Re-runs connection tracking over the LL control PDUs we transmitted
    /// ourselves in the central or peripheral role, so that parameter
    /// changes we initiated are followed just like observed ones.
    fn react_to_transmitted(&mut self, grant: &TxGrant<'_>, num_sent: u32) {
        let now = self.timer.now();
        let chan = self.current_channel();
        let phy = self.rconf.phy;
        let dir = if self.state == SnifferState::Central {
            Direction::CentralToPeripheral
        } else {
            Direction::PeripheralToCentral
        };

        for slot in grant.iter().take(num_sent as usize) {
            // control PDUs are all well under this size
            if slot.payload.is_empty() || slot.payload.len() > 38 {
                continue;
            }
            if slot.llid & 0x3 != 0x3 {
                continue;
            }

            let mut body = [0u8; 40];
            body[0] = slot.llid;
            body[1] = slot.payload.len() as u8;
            body[2..2 + slot.payload.len()].copy_from_slice(slot.payload);

            let event_ctr = if slot.event_ctr != 0 {
                slot.event_ctr
            } else {
                self.conn_event_count as u16
            };

            let frame = Frame {
                timestamp: now,
                crc_error: false,
                direction: dir,
                event_ctr,
                rssi: 0,
                channel: chan,
                phy,
                data: &body[..2 + slot.payload.len()],
            };
            let _ = self.react_to_data_pdu(&frame, true);
        }
    }

    // ------------------------------------------------------------------
    // Connection housekeeping
    // ------------------------------------------------------------------

    /// Channel-hop housekeeping after every connection event.
    fn after_conn_event(&mut self, peripheral: bool, got_data: bool) {
        let now = self.timer.now();
        if got_data {
            self.conn_timeout_time = now + self.rconf.conn_timeout;
            self.empty_hops = 0;
        } else {
            self.empty_hops = self.empty_hops.saturating_add(1);
            if self.conn_timeout_time.is_before(now) {
                self.handle_conn_finished();
                return;
            }
            if u32::from(self.empty_hops) > u32::from(self.rconf.slave_latency) + 3 {
                self.handle_conn_finished();
                return;
            }
        }

        // Passive channel-map inference: a missed anchor on an untested
        // channel rules that channel out.
        if !self.rconf.chan_map_certain && peripheral {
            let chan = self.current_channel();
            let chan_bit = 1u64 << chan;
            if self.first_packet && self.chan_map_test_mask & chan_bit == 0 {
                self.rconf.chan_map = self.rconf.chan_map.without(chan);
                self.compute_maps();
            }
            self.chan_map_test_mask |= chan_bit;
            if self.chan_map_test_mask == 0x1F_FFFF_FFFF {
                self.rconf.chan_map_certain = true;
                self.report_chan_map(self.rconf.chan_map.to_bits());
            }
        }

        if peripheral && self.insta_hop {
            if self.first_packet && self.rconf.interval_certain {
                // no anchor this event; keep last_anchor_ticks moving so
                // the next time delta stays meaningful
                self.last_anchor_ticks = self.last_anchor_ticks + self.rconf.hop_interval;
            } else if !self.first_packet && !self.rconf.win_offset_certain {
                // time_delta is valid here: an anchor was received while
                // WinOffset is still being measured
                if self.rconf.interval_certain {
                    // one-shot WinOffset calculation
                    let win_offset = self.time_delta.wrapping_sub(self.prev_interval);
                    self.next_hop_time =
                        self.next_hop_time + Duration::from_units_1_25ms(win_offset);
                    self.rconf.win_offset_certain = true;
                    self.report_win_offset(win_offset);
                } else {
                    let delta_instant =
                        (self.conn_event_count as u16).wrapping_sub(self.conn_update_instant);
                    if self.time_delta != self.prev_interval {
                        let win_offset = self.time_delta.wrapping_sub(self.prev_interval);
                        self.rconf.win_offset_certain = true;
                        // no point touching next_hop_time, interval unknown
                        self.report_win_offset(win_offset);
                        self.report_delta_instant(delta_instant);
                    } else if delta_instant > DELTA_INSTANT_TIMEOUT {
                        // took too long to observe a change, assume none
                        self.rconf.win_offset_certain = true;
                        self.rconf.interval_certain = true;
                        self.rconf.hop_interval = Duration::from_units_1_25ms(self.prev_interval);
                        self.next_hop_time = self.last_anchor_ticks + self.rconf.hop_interval;
                        self.report_win_offset(0);
                        self.report_delta_instant(0);
                        self.report_interval(self.prev_interval);
                    }
                }
            } else if !self.rconf.interval_certain
                && self.rconf.win_offset_certain
                && self.it_idx != u32::MAX
                && self.it_idx as usize >= INTERVAL_SAMPLES
            {
                // enough samples to take the median hop interval
                let mut samples = self.interval_ticks;
                let med = median(&mut samples);
                // snap to the nearest multiple of 1.25 ms
                let interval = (med + 2500) / 5000;
                self.rconf.hop_interval = Duration::from_ticks(interval * 5000);
                self.rconf.interval_certain = true;
                self.report_interval(interval as u16);

                // the drift compensator only works once the interval is
                // right; reset it so we don't walk off the connection
                self.anchor_offsets = [AO_TARG.ticks(); ANCHOR_SAMPLES];
                self.next_hop_time = self.last_anchor_ticks + self.rconf.hop_interval;
            }
        }

        // the last connection event is now done
        self.cur_unmapped = (self.cur_unmapped + self.hop_increment) % 37;
        self.conn_event_count = self.conn_event_count.wrapping_add(1);
        if let Some(next) = self.conf_queue.dequeue(self.conn_event_count as u16) {
            self.rconf = next;
            self.next_hop_time = self.next_hop_time + Duration::from_units_1_25ms(next.offset);
            self.compute_maps();

            if self.insta_hop && !self.rconf.interval_certain {
                self.it_idx = u32::MAX;
            }
            if !self.rconf.chan_map_certain {
                self.chan_map_test_mask = 0;
            }
        }

        // the peripheral adjusts for the central's clock drift
        if peripheral
            && self.rconf.interval_certain
            && self.conn_event_count & (ANCHOR_SAMPLES as u32 - 1) == 0
        {
            let mut offsets = self.anchor_offsets;
            let med = median(&mut offsets);
            self.next_hop_time =
                self.next_hop_time + Duration::from_ticks(med.wrapping_sub(AO_TARG.ticks()));
        }

        self.next_hop_time = self.next_hop_time + self.rconf.hop_interval;
    }

    /// Initializes connection state from the `LLData` of a `CONNECT_IND` or
    /// `AUX_CONNECT_REQ`. `use_csa2` must already be decided.
    fn handle_conn_req(&mut self, phy: Phy, conn_time: Instant, ll_data: &[u8], is_aux_req: bool) {
        let lldata = match ConnectIndLlData::decode(ll_data) {
            Some(lldata) => lldata,
            None => return,
        };

        self.access_address = lldata.access_address();
        self.hop_increment = lldata.hop();
        self.crc_init = lldata.crc_init();
        self.ll_encryption = false;
        info!(
            "conn request: aa={:?} hop={} interval={}",
            Hex(self.access_address),
            self.hop_increment,
            lldata.interval()
        );

        // the first data channel is the one at the hop increment
        self.cur_unmapped = self.hop_increment;

        self.rconf.chan_map = ChannelMap::from_raw(lldata.chan_map());
        self.rconf.chan_map_certain = true;
        self.compute_maps();

        /* transmitWindowDelay is 1.25 ms after a CONNECT_IND, 2.5 ms after
         * an AUX_CONNECT_REQ (1M/2M), 3.75 ms for coded; minus the usual
         * early-arrival margin. */
        let window_delay = if !is_aux_req {
            Duration::from_units_1_25ms(1)
        } else if phy.is_coded() {
            Duration::from_units_1_25ms(3)
        } else {
            Duration::from_units_1_25ms(2)
        } - AO_TARG;

        self.next_hop_time =
            conn_time + window_delay + Duration::from_units_1_25ms(lldata.win_offset());
        self.rconf.hop_interval = Duration::from_units_1_25ms(lldata.interval());
        self.next_hop_time += self.rconf.hop_interval;
        self.rconf.interval_certain = true;
        self.rconf.win_offset_certain = true;
        self.rconf.phy = phy;
        self.rconf.slave_latency = lldata.latency();
        self.rconf.conn_timeout = Duration::from_units_10ms(lldata.timeout());

        // six connection events from start until the link may be declared
        // dead, as allowed by the spec
        self.conn_timeout_time =
            self.next_hop_time + Duration::from_ticks(self.rconf.hop_interval.ticks() * 6);

        self.conn_event_count = 0;
        self.empty_hops = 0;
        self.preloaded_param_idx = 0;
        self.conf_queue.reset();
    }

    fn handle_conn_finished(&mut self) {
        self.transition(self.sniff_done_state);
        self.access_address = ADVERTISING_ADDRESS;
        self.aux_sched.reset();
        if self.state != SnifferState::Paused && self.adv_hop_enabled {
            self.adv_hop_seek_mode();
        }
    }

    fn compute_maps(&mut self) {
        if self.use_csa2 {
            self.csa2 = Csa2::new(self.access_address, &self.rconf.chan_map);
        } else if let Some(map) = Csa1Map::new(&self.rconf.chan_map) {
            self.csa1 = map;
        }
    }

    // ------------------------------------------------------------------
    // Host commands
    // ------------------------------------------------------------------

    /// Applies a parsed host command.
    ///
    /// `Transmit` is handled by the command handler itself (it owns the TX
    /// ring producer) and `Reset`/`TxPower` need the platform; everything
    /// else mutates the core directly.
    pub fn handle_command(&mut self, cmd: &Command<'_>) -> CommandEffect {
        match cmd {
            Command::SetChanAaPhy {
                chan,
                aa,
                phy,
                crc_init,
            } => {
                if *chan > 39 {
                    return CommandEffect::None;
                }
                self.stat_phy = *phy;
                self.stat_chan = *chan;
                self.stat_crc_init = *crc_init & 0xFF_FFFF;
                self.transition(SnifferState::Static);
                self.access_address = *aa;
                self.adv_hop_enabled = false;
                self.aux_sched.reset();
                CommandEffect::StopRadio
            }
            Command::PauseDone(pause) => {
                self.sniff_done_state = if *pause {
                    SnifferState::Paused
                } else {
                    SnifferState::Static
                };
                CommandEffect::None
            }
            Command::RssiFilter(min) => {
                self.filter.set_min_rssi(*min);
                CommandEffect::None
            }
            Command::MacFilter(mac) => {
                self.filter.set_mac(*mac);
                CommandEffect::None
            }
            Command::AdvHop => {
                self.adv_hop_seek_mode();
                CommandEffect::StopRadio
            }
            Command::Follow(follow) => {
                self.follow_connections = *follow;
                CommandEffect::None
            }
            Command::AuxAdv(enable) => {
                self.aux_adv_enabled = *enable;
                self.aux_sched.reset();
                CommandEffect::None
            }
            Command::Reset => CommandEffect::SystemReset,
            Command::Marker(data) => {
                self.send_marker(data);
                CommandEffect::None
            }
            Command::Transmit { .. } => CommandEffect::None,
            Command::Connect {
                peer_random,
                peer,
                ll_data,
            } => {
                let kind = if *peer_random {
                    AddressKind::Random
                } else {
                    AddressKind::Public
                };
                self.peer_addr = DeviceAddress::new(*peer, kind);
                self.conn_req_lldata = *ll_data;
                self.tx.drain();
                self.transition(SnifferState::Initiating);
                CommandEffect::StopRadio
            }
            Command::SetAddr { random, mac } => {
                let kind = if *random {
                    AddressKind::Random
                } else {
                    AddressKind::Public
                };
                self.our_addr = DeviceAddress::new(*mac, kind);
                CommandEffect::None
            }
            Command::Advertise {
                adv_data,
                scan_rsp_data,
            } => {
                self.adv_len = adv_data.len() as u8;
                self.adv_data[..adv_data.len()].copy_from_slice(adv_data);
                self.scan_rsp_data_len = scan_rsp_data.len() as u8;
                self.scan_rsp_data[..scan_rsp_data.len()].copy_from_slice(scan_rsp_data);
                self.tx.drain();
                self.transition(SnifferState::Advertising);
                CommandEffect::StopRadio
            }
            Command::AdvInterval(ms) => {
                self.adv_interval_ms = *ms;
                CommandEffect::None
            }
            Command::SetIrk(irk) => {
                self.filter.set_irk(*irk);
                CommandEffect::None
            }
            Command::InstaHop(enable) => {
                self.insta_hop = *enable;
                CommandEffect::None
            }
            Command::SetMap(map) => {
                self.set_chan_map(*map);
                CommandEffect::None
            }
            Command::IntervalPreload(pairs) => {
                if self.preload_conn_param_updates(pairs).is_err() {
                    self.dprint(format_args!("Invalid interval preload"));
                }
                CommandEffect::None
            }
            Command::Scan => {
                self.transition(SnifferState::Scanning);
                CommandEffect::StopRadio
            }
            Command::PhyPreload { ignore, phy } => {
                self.ignore_enc_phy_change = *ignore;
                self.preloaded_phy = *phy;
                CommandEffect::None
            }
            Command::Version => {
                self.report_version();
                CommandEffect::None
            }
            Command::AdvertiseExt {
                connectable,
                primary_phy,
                secondary_phy,
                adi,
                adv_data,
            } => {
                self.ext_adv_connectable = *connectable;
                self.primary_adv_phy = *primary_phy;
                self.secondary_adv_phy = *secondary_phy;
                self.secondary_adv_chan = 0;
                self.adi = *adi;
                self.adv_len = adv_data.len() as u8;
                self.adv_data[..adv_data.len()].copy_from_slice(adv_data);
                self.tx.drain();
                self.transition(SnifferState::AdvertisingExt);
                CommandEffect::StopRadio
            }
            Command::CrcValid(validate) => {
                self.validate_crc = *validate;
                CommandEffect::None
            }
            Command::TxPower(dbm) => CommandEffect::SetTxPower(*dbm),
        }
    }

    /// Enters the mode that hops the primary channels along with a target
    /// advertiser. Most devices send one ad on 37, one on 38, one on 39 and
    /// repeat; hopping along vastly improves the odds of catching the
    /// CONNECT_IND. Only works usefully with MAC filtering active.
    pub fn adv_hop_seek_mode(&mut self) {
        self.rconf.hop_interval = Duration::from_millis(10);
        self.conn_event_count = 0;
        self.fast_adv_hop = false;
        self.transition(SnifferState::AdvertSeek);
        self.adv_hop_enabled = true;
        self.scan_rsp_len = 26;
    }

    /// Queues a manual channel-map override for the current connection.
    fn set_chan_map(&mut self, map: u64) {
        // meaningless outside of a connection
        if !self.state.is_data_state() {
            return;
        }

        let last = *self.conf_queue.latest().unwrap_or(&self.rconf);
        let mut next = last;
        next.chan_map = ChannelMap::from_bits(map & 0x1F_FFFF_FFFF);
        next.chan_map_certain = true;
        next.offset = 0;
        self.conf_queue
            .enqueue((self.conn_event_count as u16).wrapping_add(1), &next);
    }

    /// Preloads the meaning of upcoming encrypted connection updates as
    /// `(Interval, DeltaInstant)` pairs.
    fn preload_conn_param_updates(&mut self, pairs: &Vec<(u16, u16), U4>) -> Result<(), Error> {
        for &(interval, delta_instant) in pairs.iter() {
            if !(6..=3200).contains(&interval) {
                return Err(Error::InvalidValue);
            }
            if !(6..=0x7FFF).contains(&delta_instant) {
                return Err(Error::InvalidValue);
            }
        }
        self.param_pairs = pairs.clone();
        self.preloaded_param_idx = 0;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Out-of-band messages to the host
    // ------------------------------------------------------------------

    fn transition(&mut self, new_state: SnifferState) {
        self.state = new_state;
        trace!("state -> {:?}", new_state);
        self.oob_frame(MSGCHAN_STATE, Instant::from_ticks(0), &[new_state as u8]);
    }

    /// Echoes a marker with the current radio time, so the host can zero
    /// its clock after a batch of configuration commands.
    fn send_marker(&mut self, data: &[u8]) {
        let now = self.timer.now();
        self.oob_frame(MSGCHAN_MARKER, now, data);
    }

    /// Reports the firmware version as a measurement.
    pub fn report_version(&mut self) {
        let mut buf = [0u8; 5];
        buf[0] = MEASTYPE_VERSION;
        buf[1..5].copy_from_slice(&VERSION);
        self.oob_frame(MSGCHAN_MEASURE, Instant::from_ticks(0), &buf);
    }

    fn report_interval(&mut self, interval: u16) {
        let mut buf = [0u8; 3];
        buf[0] = MEASTYPE_INTERVAL;
        buf[1..3].copy_from_slice(&interval.to_le_bytes());
        self.oob_frame(MSGCHAN_MEASURE, Instant::from_ticks(0), &buf);
    }

    fn report_chan_map(&mut self, map: u64) {
        let mut buf = [0u8; 6];
        buf[0] = MEASTYPE_CHANMAP;
        buf[1..6].copy_from_slice(&map.to_le_bytes()[..5]);
        self.oob_frame(MSGCHAN_MEASURE, Instant::from_ticks(0), &buf);
    }

    fn report_adv_hop(&mut self, hop_us: u32) {
        let mut buf = [0u8; 5];
        buf[0] = MEASTYPE_ADVHOP;
        buf[1..5].copy_from_slice(&hop_us.to_le_bytes());
        self.oob_frame(MSGCHAN_MEASURE, Instant::from_ticks(0), &buf);
    }

    fn report_win_offset(&mut self, offset: u16) {
        let mut buf = [0u8; 3];
        buf[0] = MEASTYPE_WINOFFSET;
        buf[1..3].copy_from_slice(&offset.to_le_bytes());
        self.oob_frame(MSGCHAN_MEASURE, Instant::from_ticks(0), &buf);
    }

    fn report_delta_instant(&mut self, delta: u16) {
        let mut buf = [0u8; 3];
        buf[0] = MEASTYPE_DELTAINSTANT;
        buf[1..3].copy_from_slice(&delta.to_le_bytes());
        self.oob_frame(MSGCHAN_MEASURE, Instant::from_ticks(0), &buf);
    }

    /// Formats a debug message into a `DEBUG` out-of-band frame.
    fn dprint(&mut self, args: core::fmt::Arguments<'_>) {
        debug!("{}", args);
        let mut buf: heapless::String<U128> = heapless::String::new();
        let _ = write!(&mut buf, "{}", args);
        self.oob_frame(MSGCHAN_DEBUG, Instant::from_ticks(0), buf.as_bytes());
    }

    fn oob_frame(&mut self, channel: u8, timestamp: Instant, data: &[u8]) {
        let frame = Frame {
            timestamp,
            crc_error: false,
            direction: Direction::CentralToPeripheral,
            event_ctr: 0,
            rssi: 0,
            channel,
            phy: Phy::M1,
            data,
        };
        // dropped silently if the host link is hopelessly behind
        let _ = self.packets.produce(&frame);
    }
}

impl<'a, C: Config> FrameSink for RadioCore<'a, C> {
    /// The per-packet pipeline running in radio callback context: filter,
    /// react, forward to the host.
    fn on_frame(&mut self, frame: &Frame<'_>) -> FrameCmd {
        let mut cmd = FrameCmd::Continue;
        let mut f = *frame;

        if f.channel < 40 {
            // it only makes sense to filter advertisements
            if f.channel >= 37 && !self.filter.accepts_adv(&f) {
                return cmd;
            }

            f.event_ctr = self.conn_event_count as u16;
            if self.state == SnifferState::Data && f.channel < 37 {
                f.direction = self.pkt_dir;
            }

            // always react, regardless of ring state
            cmd = self.react(&f);
            trace!("ch{}<- {:?}", f.channel, HexSlice(f.data));
        }

        // discard the packet if the ring is full
        let _ = self.packets.produce(&f);
        cmd
    }
}

/// Extracts the 6-byte AdvA field starting at `offset` of a PDU.
fn adv_a(pdu: &[u8], offset: usize) -> Option<[u8; 6]> {
    let raw = pdu.get(offset..offset + 6)?;
    let mut mac = [0; 6];
    mac.copy_from_slice(raw);
    Some(mac)
}
