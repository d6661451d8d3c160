//! Queue of pending radio configuration changes.
//!
//! Parameter-change PDUs (connection update, channel map, PHY update) name
//! a future *instant*, the connection event count at which they apply. The
//! reactive path enqueues the prepared [`RadioConfig`] here, and the hop
//! housekeeping dequeues it when the event counter reaches the instant.
//!
//! Entries are enqueued from radio callback context and dequeued by the
//! radio task at event boundaries; the ring therefore keeps its head and
//! tail as plain counters that each side only writes from one context.

use super::RadioConfig;

const SLOTS: usize = 8;
const MASK: u32 = SLOTS as u32 - 1;

/// Ring of pending configuration changes keyed by instant.
///
/// Holds up to 7 entries; enqueueing into a full queue silently drops the
/// change (the connection is lost either way if that many updates are in
/// flight at once).
pub struct ConfQueue {
    instants: [u16; SLOTS],
    configs: [RadioConfig; SLOTS],
    head: u32,
    tail: u32,
}

impl ConfQueue {
    pub fn new() -> Self {
        ConfQueue {
            instants: [0; SLOTS],
            configs: [RadioConfig::default(); SLOTS],
            head: 0,
            tail: 0,
        }
    }

    /// Empties the queue.
    pub fn reset(&mut self) {
        self.head = 0;
        self.tail = 0;
    }

    fn len(&self) -> u32 {
        self.head.wrapping_sub(self.tail)
    }

    /// Returns whether no changes are pending.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Enqueues a configuration to apply at `instant`.
    pub fn enqueue(&mut self, instant: u16, conf: &RadioConfig) {
        if self.len() >= MASK {
            warn!("config queue full, dropping change at instant {}", instant);
            return;
        }

        let idx = (self.head & MASK) as usize;
        self.instants[idx] = instant;
        self.configs[idx] = *conf;
        self.head = self.head.wrapping_add(1);
    }

    /// Dequeues the pending change for event counter `cur`, if due.
    ///
    /// An entry is *due* when its instant equals `cur` or lies in the past
    /// half of the 16-bit counter circle. Due-but-stale entries (instant
    /// already passed) are consumed and discarded without being returned,
    /// so a missed instant is never applied late.
    pub fn dequeue(&mut self, cur: u16) -> Option<RadioConfig> {
        while !self.is_empty() {
            let idx = (self.tail & MASK) as usize;
            let instant = self.instants[idx];

            if instant == cur {
                let conf = self.configs[idx];
                self.tail = self.tail.wrapping_add(1);
                return Some(conf);
            }

            if instant.wrapping_sub(cur) >= 0x8000 {
                // stale: consume and skip
                self.tail = self.tail.wrapping_add(1);
                continue;
            }

            // future entry: wait
            return None;
        }
        None
    }

    /// Returns the most recently enqueued configuration.
    ///
    /// A new change inherits its unchanged fields from here, so that two
    /// queued updates compose instead of the second one resurrecting
    /// already-superseded parameters.
    pub fn latest(&self) -> Option<&RadioConfig> {
        if self.is_empty() {
            return None;
        }
        let idx = (self.head.wrapping_sub(1) & MASK) as usize;
        Some(&self.configs[idx])
    }
}

impl Default for ConfQueue {
    fn default() -> Self {
        ConfQueue::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::Duration;

    fn conf(interval_units: u16) -> RadioConfig {
        RadioConfig {
            hop_interval: Duration::from_units_1_25ms(interval_units),
            ..RadioConfig::default()
        }
    }

    #[test]
    fn dequeue_on_exact_instant() {
        let mut q = ConfQueue::new();
        q.enqueue(100, &conf(24));

        assert!(q.dequeue(99).is_none());
        let got = q.dequeue(100).unwrap();
        assert_eq!(got.hop_interval, Duration::from_units_1_25ms(24));
        assert!(q.dequeue(100).is_none());
    }

    #[test]
    fn stale_instant_is_discarded_without_apply() {
        let mut q = ConfQueue::new();
        q.enqueue(100, &conf(24));

        // one past the instant: consumed, never handed out
        assert!(q.dequeue(101).is_none());
        assert!(q.is_empty());
        assert!(q.dequeue(100).is_none());
    }

    #[test]
    fn past_half_window() {
        let mut q = ConfQueue::new();
        // 0x8000 behind is the farthest "past"
        q.enqueue(0x8000u16.wrapping_add(5), &conf(6));
        assert!(q.dequeue(5).is_none());
        assert!(q.is_empty());

        // 0x7FFF ahead is still "future"
        q.enqueue(5u16.wrapping_add(0x7FFF), &conf(6));
        assert!(q.dequeue(5).is_none());
        assert!(!q.is_empty());
    }

    #[test]
    fn stale_entries_flush_until_match() {
        let mut q = ConfQueue::new();
        q.enqueue(10, &conf(6));
        q.enqueue(20, &conf(7));
        q.enqueue(30, &conf(8));

        // at event 30 the first two are stale, the third applies
        let got = q.dequeue(30).unwrap();
        assert_eq!(got.hop_interval, Duration::from_units_1_25ms(8));
        assert!(q.is_empty());
    }

    #[test]
    fn full_queue_drops_enqueue() {
        let mut q = ConfQueue::new();
        for i in 0..7u16 {
            q.enqueue(i, &conf(i + 6));
        }
        // 8th is silently dropped
        q.enqueue(7, &conf(99));

        for i in 0..7u16 {
            assert_eq!(
                q.dequeue(i).unwrap().hop_interval,
                Duration::from_units_1_25ms(i + 6)
            );
        }
        assert!(q.dequeue(7).is_none());
    }

    #[test]
    fn latest_is_most_recent_enqueue() {
        let mut q = ConfQueue::new();
        assert!(q.latest().is_none());
        q.enqueue(10, &conf(6));
        q.enqueue(20, &conf(9));
        assert_eq!(
            q.latest().unwrap().hop_interval,
            Duration::from_units_1_25ms(9)
        );

        // reset forgets everything
        q.reset();
        assert!(q.latest().is_none());
    }
}
