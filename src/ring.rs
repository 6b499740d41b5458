// Amazon ENA/EFA Command Queue Core
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! Phase-bit ring cursor.
//!
//! Every ring in the protocol (admin SQ/CQ, AENQ, I/O SQ/CQ) tracks a
//! free-running 16-bit counter and a phase bit that flips each time the
//! masked index wraps back to slot 0. The cursor owns that invariant.

/// Head or tail of a power-of-two ring with phase tracking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingCursor {
    counter: u16,
    mask: u16,
    phase: bool,
    wrapped: bool,
}

impl RingCursor {
    /// New cursor at slot 0 with phase 1.
    ///
    /// # Panics
    ///
    /// Panics if `depth` is not a power of two.
    pub fn new(depth: u16) -> Self {
        Self::with_counter(depth, 0)
    }

    /// New cursor with phase 1 whose counter starts at `counter`.
    ///
    /// The AENQ head starts at `depth` so that its first doorbell frees the
    /// whole ring.
    pub fn with_counter(depth: u16, counter: u16) -> Self {
        assert!(depth.is_power_of_two(), "ring depth must be a power of two");
        Self {
            counter,
            mask: depth - 1,
            phase: true,
            wrapped: false,
        }
    }

    /// Ring depth.
    #[inline]
    pub fn depth(&self) -> u16 {
        self.mask.wrapping_add(1)
    }

    /// Free-running counter, the value written to doorbells.
    #[inline]
    pub fn counter(&self) -> u16 {
        self.counter
    }

    /// Masked slot index.
    #[inline]
    pub fn index(&self) -> u16 {
        self.counter & self.mask
    }

    /// Phase expected (consumer) or stamped (producer) at the current slot.
    #[inline]
    pub fn current_phase(&self) -> u8 {
        self.phase as u8
    }

    /// True if the last `advance` wrapped to slot 0.
    #[inline]
    pub fn is_wrapped(&self) -> bool {
        self.wrapped
    }

    /// Move one slot forward, flipping the phase on wraparound.
    /// Returns whether the ring wrapped.
    #[inline]
    pub fn advance(&mut self) -> bool {
        self.counter = self.counter.wrapping_add(1);
        self.wrapped = self.index() == 0;
        if self.wrapped {
            self.phase = !self.phase;
        }
        self.wrapped
    }

    /// Move `count` slots forward.
    pub fn advance_by(&mut self, count: u16) {
        for _ in 0..count {
            self.advance();
        }
    }

    /// Number of slots between `earlier` and this cursor.
    #[inline]
    pub fn distance_from(&self, earlier: u16) -> u16 {
        self.counter.wrapping_sub(earlier)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_phase_flips_every_depth_entries() {
        let depth = 8u16;
        let mut cursor = RingCursor::new(depth);
        assert_eq!(cursor.current_phase(), 1);
        let mut flips = 0;
        for i in 1..=(3 * depth as u32) {
            let wrapped = cursor.advance();
            if wrapped {
                flips += 1;
                assert_eq!(i % depth as u32, 0);
            }
        }
        assert_eq!(flips, 3);
        assert_eq!(cursor.current_phase(), 0);
        assert_eq!(cursor.index(), 0);
    }

    #[test]
    fn test_with_counter_matches_producer() {
        let depth = 16;
        let mut producer = RingCursor::new(depth);
        let mut consumer = RingCursor::with_counter(depth, depth);
        for _ in 0..40 {
            assert_eq!(producer.index(), consumer.index());
            assert_eq!(producer.current_phase(), consumer.current_phase());
            producer.advance();
            consumer.advance();
        }
        assert_eq!(consumer.distance_from(producer.counter()), depth);
    }

    #[test]
    fn test_counter_wraps_u16() {
        let mut cursor = RingCursor::with_counter(32, u16::MAX);
        assert_eq!(cursor.index(), 31);
        assert!(cursor.advance());
        assert_eq!(cursor.counter(), 0);
        assert_eq!(cursor.index(), 0);
    }

    #[test]
    #[should_panic]
    fn test_rejects_non_power_of_two() {
        let _ = RingCursor::new(12);
    }

    proptest! {
        #[test]
        fn prop_phase_is_lap_parity(shift in 0u32..10, steps in 0u32..5000) {
            let depth = 1u16 << shift;
            let mut cursor = RingCursor::new(depth);
            for _ in 0..steps {
                cursor.advance();
            }
            let laps = steps / depth as u32;
            prop_assert_eq!(cursor.current_phase() as u32, 1 - (laps % 2));
            prop_assert_eq!(cursor.index() as u32, steps % depth as u32);
        }
    }
}
