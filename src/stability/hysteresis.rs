use std::collections::VecDeque;

/// Thresholds used by the asymmetric mode. Leaving a healthy channel takes
/// sustained failure (fewer than 2 of W healthy); re-entering takes a strong
/// majority (at least 4 of W healthy).
pub const ASYMMETRIC_STAY_HEALTHY_MIN: usize = 2;
pub const ASYMMETRIC_BECOME_HEALTHY_MIN: usize = 4;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HysteresisMode {
    /// Healthy iff at least `threshold` of the window entries are healthy.
    Symmetric { threshold: usize },
    /// Direction-dependent thresholds; see the module constants.
    Asymmetric,
}

/// Sliding window over the most recent known observations of one channel.
///
/// Unknown observations are never recorded; the caller bypasses the window
/// entirely on monitoring failures.
#[derive(Debug)]
pub struct HysteresisWindow {
    entries: VecDeque<bool>,
    capacity: usize,
    mode: HysteresisMode,
}

impl HysteresisWindow {
    pub fn new(capacity: usize, mode: HysteresisMode) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
            mode,
        }
    }

    pub fn record(&mut self, healthy: bool) {
        self.entries.push_back(healthy);
        while self.entries.len() > self.capacity {
            self.entries.pop_front();
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn healthy_count(&self) -> usize {
        self.entries.iter().filter(|healthy| **healthy).count()
    }

    /// Full window means smoothing applies; until then classification falls
    /// back to the raw observation (warm-up).
    pub fn is_warm(&self) -> bool {
        self.entries.len() >= self.capacity
    }

    /// Smooths the latest raw observation. `committed_side_healthy` tells the
    /// asymmetric mode which direction the channel currently leans in the
    /// committed state.
    pub fn classify(&self, raw: bool, committed_side_healthy: bool) -> bool {
        if !self.is_warm() {
            return raw;
        }
        let healthy = self.healthy_count();
        match self.mode {
            HysteresisMode::Symmetric { threshold } => healthy >= threshold,
            HysteresisMode::Asymmetric => {
                if committed_side_healthy {
                    healthy >= ASYMMETRIC_STAY_HEALTHY_MIN
                } else {
                    healthy >= ASYMMETRIC_BECOME_HEALTHY_MIN
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn window(mode: HysteresisMode, observations: &[bool]) -> HysteresisWindow {
        let mut window = HysteresisWindow::new(5, mode);
        for healthy in observations {
            window.record(*healthy);
        }
        window
    }

    #[test]
    fn warm_up_uses_raw_observation() {
        let window = window(HysteresisMode::Symmetric { threshold: 3 }, &[true, true]);
        assert!(!window.is_warm());
        assert!(window.classify(true, true));
        assert!(!window.classify(false, true));
    }

    #[test]
    fn symmetric_majority_absorbs_single_blip() {
        let window = window(
            HysteresisMode::Symmetric { threshold: 3 },
            &[true, true, true, false, true],
        );
        assert!(window.classify(true, true));
    }

    #[test]
    fn symmetric_flips_below_threshold() {
        let window = window(
            HysteresisMode::Symmetric { threshold: 3 },
            &[true, false, false, false, true],
        );
        assert!(!window.classify(true, true));
    }

    #[test]
    fn window_drops_oldest_entries() {
        let mut window = window(
            HysteresisMode::Symmetric { threshold: 3 },
            &[false, false, false, false, false],
        );
        for _ in 0..3 {
            window.record(true);
        }
        assert_eq!(window.len(), 5);
        assert_eq!(window.healthy_count(), 3);
        assert!(window.classify(true, true));
    }

    #[test]
    fn asymmetric_holds_healthy_through_three_failures() {
        let window = window(
            HysteresisMode::Asymmetric,
            &[true, false, false, false, true],
        );
        assert!(window.classify(false, true));
    }

    #[test]
    fn asymmetric_flips_unhealthy_below_two() {
        let window = window(
            HysteresisMode::Asymmetric,
            &[false, false, false, false, true],
        );
        assert!(!window.classify(false, true));
    }

    #[test]
    fn asymmetric_requires_strong_majority_to_recover() {
        let three_of_five = window(
            HysteresisMode::Asymmetric,
            &[true, true, true, false, false],
        );
        assert!(!three_of_five.classify(true, false));

        let four_of_five = window(
            HysteresisMode::Asymmetric,
            &[true, true, true, true, false],
        );
        assert!(four_of_five.classify(true, false));
    }
}
