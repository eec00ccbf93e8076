//! Needle position tracking
//!
//! Positions are needle indices on the ring, `0..needle_count`. Clockwise
//! motion increases the index, counter-clockwise decreases it.

use knitkit_core::Direction;

/// Tracks which needle sits at the working position
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NeedleTracker {
    current: u32,
    needle_count: u32,
    steps_per_needle: u64,
}

impl NeedleTracker {
    /// Tracker at needle 0. A zero needle count is treated as 1.
    pub fn new(needle_count: u32, steps_per_needle: u64) -> Self {
        Self {
            current: 0,
            needle_count: needle_count.max(1),
            steps_per_needle,
        }
    }

    /// Current needle index
    pub fn position(&self) -> u32 {
        self.current
    }

    /// Needles on the ring
    pub fn needle_count(&self) -> u32 {
        self.needle_count
    }

    /// Stepper steps per needle
    pub fn steps_per_needle(&self) -> u64 {
        self.steps_per_needle
    }

    /// Shortest move to `target` as `(steps, direction)`.
    ///
    /// Ties go clockwise; an already-reached target yields zero steps.
    pub fn steps_to_needle(&self, target: u32) -> (u64, Direction) {
        let (needles, direction) = self.needles_to(target);
        (u64::from(needles) * self.steps_per_needle, direction)
    }

    /// Shortest move to `target` in needles
    pub fn needles_to(&self, target: u32) -> (u32, Direction) {
        let n = self.needle_count;
        let target = target % n;
        let cw = (target + n - self.current) % n;
        let ccw = (self.current + n - target) % n;
        if cw <= ccw {
            (cw, Direction::Cw)
        } else {
            (ccw, Direction::Ccw)
        }
    }

    /// Record a completed move of `needles` in `direction`
    pub fn apply_delta(&mut self, needles: u64, direction: Direction) {
        let n = u64::from(self.needle_count);
        let delta = needles % n;
        let current = u64::from(self.current);
        let next = match direction {
            Direction::Cw => (current + delta) % n,
            Direction::Ccw => (current + n - delta) % n,
        };
        self.current = next as u32;
    }

    /// Set the position to needle 0 without moving
    pub fn reset(&mut self) {
        self.current = 0;
    }

    /// Adopt a sensor tally as the position
    pub fn sync_from_count(&mut self, count: u64) {
        self.current = (count % u64::from(self.needle_count)) as u32;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shortest_path_homing() {
        let mut tracker = NeedleTracker::new(48, 1000);
        tracker.sync_from_count(40);
        assert_eq!(tracker.needles_to(4), (12, Direction::Cw));
        assert_eq!(tracker.steps_to_needle(4), (12_000, Direction::Cw));
    }

    #[test]
    fn test_counter_clockwise_and_ties() {
        let mut tracker = NeedleTracker::new(48, 10);
        tracker.sync_from_count(10);
        assert_eq!(tracker.needles_to(4), (6, Direction::Ccw));
        assert_eq!(tracker.needles_to(34), (24, Direction::Cw));
        assert_eq!(tracker.needles_to(10), (0, Direction::Cw));
        assert_eq!(tracker.needles_to(58), (0, Direction::Cw));
    }

    #[test]
    fn test_apply_delta_sign_convention() {
        let mut tracker = NeedleTracker::new(48, 1);
        tracker.apply_delta(5, Direction::Cw);
        assert_eq!(tracker.position(), 5);
        tracker.apply_delta(7, Direction::Ccw);
        assert_eq!(tracker.position(), 46);
        tracker.apply_delta(96 + 2, Direction::Cw);
        assert_eq!(tracker.position(), 0);
        tracker.apply_delta(49, Direction::Ccw);
        assert_eq!(tracker.position(), 47);
    }

    #[test]
    fn test_reset_and_sync() {
        let mut tracker = NeedleTracker::new(48, 1);
        tracker.apply_delta(20, Direction::Cw);
        tracker.reset();
        assert_eq!(tracker.position(), 0);
        tracker.sync_from_count(100);
        assert_eq!(tracker.position(), 4);
    }
}
