//! Stack configuration trait.

use crate::radio::RadioDriver;
use crate::time::Timer;

/// Trait for sniffer stack configurations.
///
/// This bundles the platform-specific types the core needs: the radio-clock
/// time source and the radio driver. Every application defines one type
/// implementing this trait and supplies it to [`crate::sniffer::RadioCore`].
pub trait Config {
    /// A time source backed by the radio's 4 MHz clock.
    type Timer: Timer;

    /// The blocking radio operations of the platform.
    type Radio: RadioDriver;
}
