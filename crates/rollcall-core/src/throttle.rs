//! Frame throttling: process one of every N frames.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThrottleDecision {
    Process,
    Skip,
}

/// Counts incoming frames and passes every `every`-th one.
#[derive(Debug, Clone)]
pub struct FrameThrottle {
    every: u32,
    counter: u64,
}

impl FrameThrottle {
    /// `every` is clamped to at least 1 (process everything).
    pub fn new(every: u32) -> Self {
        Self {
            every: every.max(1),
            counter: 0,
        }
    }

    /// Decide for a 1-based frame counter without touching state.
    pub fn decide(&self, frame: u64) -> ThrottleDecision {
        if frame % u64::from(self.every) == 0 {
            ThrottleDecision::Process
        } else {
            ThrottleDecision::Skip
        }
    }

    /// Advance to the next frame and decide for it.
    pub fn next(&mut self) -> ThrottleDecision {
        self.counter += 1;
        self.decide(self.counter)
    }

    pub fn every(&self) -> u32 {
        self.every
    }

    pub fn set_every(&mut self, every: u32) {
        self.every = every.max(1);
    }

    /// Frames seen so far.
    pub fn frames_seen(&self) -> u64 {
        self.counter
    }
}

impl Default for FrameThrottle {
    fn default() -> Self {
        Self::new(2)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn processed(throttle: &mut FrameThrottle, count: u64) -> u64 {
        (0..count)
            .filter(|_| throttle.next() == ThrottleDecision::Process)
            .count() as u64
    }

    #[test]
    fn test_default_processes_every_second_frame() {
        let mut t = FrameThrottle::default();
        let decisions: Vec<_> = (0..4).map(|_| t.next()).collect();
        assert_eq!(
            decisions,
            vec![
                ThrottleDecision::Skip,
                ThrottleDecision::Process,
                ThrottleDecision::Skip,
                ThrottleDecision::Process,
            ]
        );
    }

    #[test]
    fn test_processed_count_is_floor_count_over_n() {
        for n in 1..=7u32 {
            for count in [0u64, 1, 5, 13, 100] {
                let mut t = FrameThrottle::new(n);
                assert_eq!(processed(&mut t, count), count / u64::from(n), "n={n} count={count}");
            }
        }
    }

    #[test]
    fn test_zero_clamped_to_one() {
        let mut t = FrameThrottle::new(0);
        assert_eq!(t.every(), 1);
        assert_eq!(processed(&mut t, 10), 10);
    }

    #[test]
    fn test_decide_is_pure() {
        let t = FrameThrottle::new(3);
        assert_eq!(t.decide(3), t.decide(3));
        assert_eq!(t.frames_seen(), 0);
    }

    #[test]
    fn test_set_every_applies_to_following_frames() {
        let mut t = FrameThrottle::new(2);
        assert_eq!(t.next(), ThrottleDecision::Skip);
        t.set_every(1);
        assert_eq!(t.next(), ThrottleDecision::Process);
        assert_eq!(t.frames_seen(), 2);
    }
}
