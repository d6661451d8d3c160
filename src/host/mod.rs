//! Host link: base64 line framing, command parsing, and outbound message
//! serialization.
//!
//! The host talks to the sniffer over a UART carrying base64-encoded binary
//! messages, one per CRLF-terminated line. The UART byte primitives
//! themselves are platform code behind the [`wire::HostIo`] trait; the
//! framing, the command set and the message layouts live here.

pub mod base64;
pub mod command;
pub mod msg;
pub mod wire;

pub use self::wire::{FramingError, HostIo, Messenger, MESSAGE_MAX};
