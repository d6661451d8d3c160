//! Line framing for the host link.
//!
//! Each message is one line: base64 of the binary payload, terminated by
//! CRLF. The first payload byte is a word count (`(len + 2) / 3`), so the
//! receiver knows after the first 4 base64 characters how many more to
//! expect. Any framing violation drains the input to the next CRLF and
//! reports an error; the stream stays usable.

use super::base64;
use crate::time::Duration;

/// Maximum decoded message length in bytes.
pub const MESSAGE_MAX: usize = 300;

// base64 of a maximum message plus CRLF
const B64_BUF: usize = (MESSAGE_MAX * 4) / 3 + 2;

/// Host-link framing failures (all recovered by draining to CRLF).
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum FramingError {
    /// Fewer bytes arrived than the word count promised.
    Truncated,
    /// A character outside the base64 alphabet (or a length that is not a
    /// multiple of 4) was received.
    Base64,
    /// The word count announces a message larger than [`MESSAGE_MAX`].
    Oversize,
    /// The line did not end in CRLF where expected.
    MissingTerminator,
}

/// Byte-level UART access provided by the platform.
pub trait HostIo {
    /// Blocking read of exactly `buf.len()` bytes.
    fn read(&mut self, buf: &mut [u8]);

    /// Reads up to `buf.len()` bytes, giving up after `timeout`. Returns
    /// the number of bytes read.
    fn read_timeout(&mut self, buf: &mut [u8], timeout: Duration) -> usize;

    /// Writes from `buf`, returning how many bytes were accepted (at least
    /// one; short writes happen when transmit queues fill up).
    fn write(&mut self, buf: &[u8]) -> usize;
}

/// Base64 line messenger over a [`HostIo`].
pub struct Messenger<IO: HostIo> {
    io: IO,
}

impl<IO: HostIo> Messenger<IO> {
    pub fn new(io: IO) -> Self {
        Messenger { io }
    }

    /// Receives one message into `dst`, returning its decoded length.
    ///
    /// `dst` must hold at least [`MESSAGE_MAX`] bytes.
    pub fn recv(&mut self, dst: &mut [u8]) -> Result<usize, FramingError> {
        let mut b64 = [0u8; B64_BUF];

        // The first 4 base64 characters decode to 3 bytes, the first of
        // which is the word count; 2 extra bytes may already be the CRLF.
        self.io.read(&mut b64[..1]);
        let got = self.io.read_timeout(&mut b64[1..6], Duration::from_millis(5));
        if got < 5 {
            return self.fail(FramingError::Truncated);
        }

        let mut first = [0u8; 3];
        if base64::decode(&mut first, &b64[..4]).is_err() {
            return self.fail(FramingError::Base64);
        }

        let word_cnt = usize::from(first[0]);
        if word_cnt * 3 > MESSAGE_MAX {
            // too big, or a sync problem
            return self.fail(FramingError::Oversize);
        }

        if word_cnt > 1 {
            let to_read = (word_cnt - 1) * 4;
            let got = self
                .io
                .read_timeout(&mut b64[6..6 + to_read], Duration::from_millis(20));
            if got < to_read {
                // message came too slowly, treat as truncated
                return self.fail(FramingError::Truncated);
            }
        }

        let last = word_cnt * 4;
        if b64[last] != b'\r' || b64[last + 1] != b'\n' {
            return self.fail(FramingError::MissingTerminator);
        }

        match base64::decode(dst, &b64[..last]) {
            Ok(len) => Ok(len),
            Err(_) => self.fail(FramingError::Base64),
        }
    }

    /// Sends one message as a base64 line.
    pub fn send(&mut self, payload: &[u8]) {
        debug_assert!(payload.len() <= MESSAGE_MAX);
        let mut b64 = [0u8; B64_BUF];

        let n = base64::encode(&mut b64, payload);
        b64[n] = b'\r';
        b64[n + 1] = b'\n';

        let mut sent = 0;
        while sent < n + 2 {
            sent += self.io.write(&b64[sent..n + 2]);
        }
    }

    /// Error recovery: skip input until the next CRLF so the next line
    /// starts clean.
    fn fail(&mut self, err: FramingError) -> Result<usize, FramingError> {
        error!("host link framing error: {:?}", err);
        let mut b = [0u8; 1];
        'outer: loop {
            self.io.read(&mut b);
            while b[0] == b'\r' {
                self.io.read(&mut b);
                if b[0] == b'\n' {
                    break 'outer;
                }
            }
        }
        Err(err)
    }
}
