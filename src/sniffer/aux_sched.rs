//! Scheduler for secondary-channel receive windows.
//!
//! Every `ADV_EXT_IND` with an AuxPtr yields a window during which the
//! radio should sit on the announced secondary channel. Windows arrive from
//! radio callback context and are consumed by the main radio loop, which
//! asks [`AuxAdvScheduler::next`] where to listen now (or how long until
//! something is scheduled).
//!
//! The schedule is a small array sorted by start time. Windows for the same
//! `(channel, PHY)` are merged on insert so that a flood of advertisements
//! pointing at the same aux channel occupies a single entry.

use crate::phy::Phy;
use crate::time::{Duration, Instant};

/// Maximum number of scheduled windows.
pub const MAX_AUX_EVENTS: usize = 8;

#[derive(Debug, Copy, Clone)]
struct AuxEvent {
    chan: u8,
    phy: Phy,
    start: Instant,
    duration: Duration,
}

impl AuxEvent {
    fn end(&self) -> Instant {
        self.start + self.duration
    }
}

/// What [`AuxAdvScheduler::next`] told the caller to do.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct NextWindow {
    /// Radio time until which the answer stays valid.
    pub until: Instant,
    /// Channel and PHY to receive on, or `None` when nothing is scheduled
    /// right now (`until` is then the start of the earliest future window).
    pub target: Option<(u8, Phy)>,
}

/// Time-sorted schedule of pending secondary-channel receive windows.
pub struct AuxAdvScheduler {
    events: [AuxEvent; MAX_AUX_EVENTS],
    len: usize,
}

impl AuxAdvScheduler {
    pub fn new() -> Self {
        AuxAdvScheduler {
            events: [AuxEvent {
                chan: 0,
                phy: Phy::M1,
                start: Instant::from_ticks(0),
                duration: Duration::ZERO,
            }; MAX_AUX_EVENTS],
            len: 0,
        }
    }

    /// Forgets all scheduled windows.
    pub fn reset(&mut self) {
        self.len = 0;
    }

    /// Schedules a receive window, keeping the list sorted by start time
    /// and merging overlap with an existing window on the same
    /// `(chan, phy)`.
    ///
    /// Returns `false` when a distinct window had to be added but the
    /// schedule is full; the caller drops the window silently.
    pub fn insert(&mut self, chan: u8, phy: Phy, start: Instant, duration: Duration) -> bool {
        let event = AuxEvent {
            chan,
            phy,
            start,
            duration,
        };

        for i in 0..self.len {
            if self.events[i].chan == chan && self.events[i].phy == phy {
                match self.merge(i, &event) {
                    Merge::Done => return true,
                    Merge::Distinct => {}
                }
            }

            if self.len == MAX_AUX_EVENTS {
                return false;
            }

            if event.start.is_before(self.events[i].start) {
                // found the spot to insert
                self.events.copy_within(i..self.len, i + 1);
                self.events[i] = event;
                self.len += 1;
                return true;
            }
        }

        if self.len == MAX_AUX_EVENTS {
            return false;
        }
        self.events[self.len] = event;
        self.len += 1;
        true
    }

    /// Overlap handling against the colocated event at `i`.
    fn merge(&mut self, i: usize, event: &AuxEvent) -> Merge {
        // Shift both intervals by a common offset so that all four
        // boundaries are finite-positive in the compared subrange; this
        // makes plain unsigned comparisons below wrap-safe.
        let start_a_raw = self.events[i].start.ticks();
        let start_b_raw = event.start.ticks();
        let offset = if start_b_raw.wrapping_sub(start_a_raw) >= 0x8000_0000 {
            start_b_raw // b before a, across the wrap
        } else if start_a_raw.wrapping_sub(start_b_raw) >= 0x8000_0000 {
            start_a_raw
        } else if start_a_raw > start_b_raw {
            start_b_raw
        } else {
            start_a_raw
        };

        let start_a = start_a_raw.wrapping_sub(offset);
        let end_a = start_a.wrapping_add(self.events[i].duration.ticks());
        let start_b = start_b_raw.wrapping_sub(offset);
        let end_b = start_b.wrapping_add(event.duration.ticks());

        if start_b < start_a {
            if end_b < start_a {
                // ends before the existing window starts
                Merge::Distinct
            } else if end_b < end_a {
                // stretch the existing window backwards
                self.events[i].duration += Duration::from_ticks(start_a - start_b);
                self.events[i].start = event.start;
                self.resort();
                Merge::Done
            } else {
                // the new window covers the old one entirely
                self.events[i] = *event;
                self.resort();
                Merge::Done
            }
        } else if start_b < end_a {
            if end_b < end_a {
                // fully subsumed
                Merge::Done
            } else {
                // stretch the existing window forward
                self.events[i].duration += Duration::from_ticks(end_b - end_a);
                Merge::Done
            }
        } else {
            // starts after the existing window ends
            Merge::Distinct
        }
    }

    /// Restores start-time ordering after a merge moved a start backwards.
    fn resort(&mut self) {
        for i in 1..self.len {
            let mut j = i;
            while j > 0 && self.events[j].start.is_before(self.events[j - 1].start) {
                self.events.swap(j, j - 1);
                j -= 1;
            }
        }
    }

    /// Drops windows that ended strictly before `now`. A window ending
    /// exactly at `now` remains.
    fn clear_past(&mut self, now: Instant) {
        let mut i = 0;
        while i < self.len {
            if self.events[i].end().is_before(now) {
                self.events.copy_within(i + 1..self.len, i);
                self.len -= 1;
            } else {
                i += 1;
            }
        }
    }

    /// Returns where the radio should listen right now.
    ///
    /// When a window is ongoing, chained overlapping ongoing windows are
    /// walked and the most recently started one wins; its validity is
    /// clipped where the next window's start precedes its end.
    pub fn next(&mut self, now: Instant) -> NextWindow {
        self.clear_past(now);

        if self.len == 0 {
            return NextWindow {
                until: now + Duration::from_ticks(0x7FFF_FFFF),
                target: None,
            };
        }

        let delta = self.events[0].start.delta(now);
        if delta <= 0 {
            let mut use_idx = 0;
            for i in 1..self.len {
                if self.events[i].start.is_at_or_before(now) {
                    use_idx = i;
                } else {
                    break;
                }
            }

            let mut until = self.events[use_idx].end();
            if self.len > use_idx + 1 {
                let next_start = self.events[use_idx + 1].start;
                if next_start.is_before(until) {
                    until = next_start;
                }
            }

            NextWindow {
                until,
                target: Some((self.events[use_idx].chan, self.events[use_idx].phy)),
            }
        } else {
            NextWindow {
                until: now + Duration::from_ticks(delta as u32),
                target: None,
            }
        }
    }
}

enum Merge {
    /// The event was absorbed into an existing entry (or subsumed).
    Done,
    /// No overlap; the event still needs its own slot.
    Distinct,
}

impl Default for AuxAdvScheduler {
    fn default() -> Self {
        AuxAdvScheduler::new()
    }
}
