// SPDX-License-Identifier: BSD-3-Clause

//! Fixed-point packet timestamps.
//!
//! Timestamps are 64-bit fixed point values: the upper 32 bits count whole
//! seconds, the lower 32 bits are a binary fraction of a second. This gives
//! sub-microsecond resolution while keeping arithmetic (interval alignment,
//! deltas) integer-only.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// A 32.32 fixed-point timestamp.
#[derive(
    Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Timestamp(u64);

impl Timestamp {
    /// The zero timestamp.
    pub const ZERO: Timestamp = Timestamp(0);

    /// Builds a timestamp from whole seconds and microseconds.
    #[must_use]
    pub const fn new(sec: u32, usec: u32) -> Self {
        Timestamp(((sec as u64) << 32) + (((usec as u64) << 32) / 1_000_000))
    }

    /// Builds a timestamp from whole seconds.
    #[must_use]
    pub const fn from_secs(sec: u32) -> Self {
        Timestamp((sec as u64) << 32)
    }

    /// Reinterprets a raw 64-bit fixed point value.
    #[must_use]
    pub const fn from_bits(bits: u64) -> Self {
        Timestamp(bits)
    }

    /// Returns the raw 64-bit fixed point value.
    #[must_use]
    pub const fn as_bits(self) -> u64 {
        self.0
    }

    /// Whole seconds part.
    #[must_use]
    pub const fn sec(self) -> u32 {
        (self.0 >> 32) as u32
    }

    /// Fractional part expressed in microseconds.
    #[must_use]
    pub const fn usec(self) -> u32 {
        (((self.0 & 0xffff_ffff) * 1_000_000) >> 32) as u32
    }

    /// Rounds down to a multiple of `ivl`.
    ///
    /// Used to align flush boundaries: records of one measurement interval
    /// all carry the interval's start time.
    #[must_use]
    pub const fn align_to(self, ivl: Timestamp) -> Timestamp {
        if ivl.0 == 0 {
            return self;
        }
        Timestamp(self.0 - self.0 % ivl.0)
    }

    /// Saturating difference `self - earlier`.
    #[must_use]
    pub const fn delta(self, earlier: Timestamp) -> Timestamp {
        Timestamp(self.0.saturating_sub(earlier.0))
    }

    /// Adds an interval, saturating at the maximum representable time.
    #[must_use]
    pub const fn advance(self, ivl: Timestamp) -> Timestamp {
        Timestamp(self.0.saturating_add(ivl.0))
    }

    /// Converts a wall-clock duration into a timestamp delta.
    #[must_use]
    pub fn from_duration(d: Duration) -> Self {
        Timestamp::new(d.as_secs() as u32, d.subsec_micros())
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:06}", self.sec(), self.usec())
    }
}

#[cfg(test)]
mod tests {
    #![allow(missing_docs, clippy::unwrap_used)]
    use super::Timestamp;

    #[test]
    fn sec_usec_roundtrip() {
        let ts = Timestamp::new(1234, 567_890);
        assert_eq!(ts.sec(), 1234);
        // one unit of rounding error is acceptable from the 32-bit fraction
        assert!(ts.usec().abs_diff(567_890) <= 1, "usec = {}", ts.usec());
    }

    #[test]
    fn ordering_follows_time() {
        assert!(Timestamp::new(1, 999_999) < Timestamp::from_secs(2));
        assert!(Timestamp::new(2, 1) > Timestamp::from_secs(2));
    }

    #[test]
    fn align_to_interval_start() {
        let ivl = Timestamp::from_secs(1);
        assert_eq!(Timestamp::new(5, 700_000).align_to(ivl), Timestamp::from_secs(5));
        assert_eq!(Timestamp::from_secs(5).align_to(ivl), Timestamp::from_secs(5));
        // zero interval leaves the timestamp untouched
        assert_eq!(Timestamp::new(5, 1).align_to(Timestamp::ZERO), Timestamp::new(5, 1));
    }

    #[test]
    fn display_is_sec_dot_usec() {
        assert_eq!(Timestamp::new(3, 250_000).to_string(), "3.250000");
    }
}
