//! An embedded BLE link-layer sniffer core.
//!
//! This crate is the firmware heart of a passive (and optionally active)
//! BLE sniffer: the radio state machine that chases advertisements across
//! the primary channels, follows frequency-hopping data connections as a
//! silent third party, schedules secondary-channel windows for extended
//! advertising, and keeps following even when a connection updates its
//! parameters under encryption by inferring the new values from packet
//! sizes and timing.
//!
//! # Using the core
//!
//! The crate is runtime- and hardware-agnostic; the platform provides a few
//! services through traits and runs three tasks around the core:
//!
//! * The **radio task** owns a [`sniffer::RadioCore`] and calls
//!   [`step`](sniffer::RadioCore::step) in a loop. The [`config::Config`]
//!   type bundle supplies the radio-clock [`time::Timer`] and the blocking
//!   [`radio::RadioDriver`] operations; the driver delivers every received
//!   packet back into the core's [`radio::FrameSink`] implementation.
//! * The **host-link task** drains captured frames from the
//!   [`queue::PacketRing`] through a [`host::msg::HostLink`], which
//!   base64-frames them over the platform's UART ([`host::HostIo`]).
//! * The **command task** reads lines from the same UART, parses them with
//!   [`host::command::CommandHandler`], and applies the resulting commands
//!   to the core under a brief lock.
//!
//! Everything is statically allocated; the two rings are the only points
//! where the tasks touch shared memory.

#![no_std]

#[cfg(test)]
#[macro_use]
extern crate std;

#[macro_use]
extern crate bitflags;

#[macro_use]
mod log;
#[macro_use]
mod utils;

pub mod bytes;
pub mod config;
mod error;
pub mod host;
pub mod link;
pub mod phy;
pub mod queue;
pub mod radio;
pub mod rpa;
pub mod sniffer;
pub mod time;

pub use self::error::Error;
