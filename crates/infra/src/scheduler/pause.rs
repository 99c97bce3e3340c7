use std::time::Duration;

/// Exponential idle backoff for a polling loop.
///
/// Starts at `min`, doubles with every consecutive empty iteration up to
/// `max`, and drops back to `min` as soon as an iteration finds work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pause {
    min: Duration,
    max: Duration,
    current: Duration,
}

impl Pause {
    pub fn new(min: Duration, max: Duration) -> Self {
        let min = min.min(max);
        Self {
            min,
            max,
            current: min,
        }
    }

    /// The pause to take now; the following one will be twice as long.
    pub fn next(&mut self) -> Duration {
        let pause = self.current;
        self.current = self.current.saturating_mul(2).min(self.max);
        pause
    }

    pub fn reset(&mut self) {
        self.current = self.min;
    }

    pub fn current(&self) -> Duration {
        self.current
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn secs(pause: &mut Pause) -> Vec<u64> {
        (0..6).map(|_| pause.next().as_secs()).collect()
    }

    #[test]
    fn doubles_up_to_the_cap() {
        let mut job_loop = Pause::new(Duration::from_secs(1), Duration::from_secs(5));
        assert_eq!(secs(&mut job_loop), vec![1, 2, 4, 5, 5, 5]);

        let mut task_loop = Pause::new(Duration::from_secs(1), Duration::from_secs(30));
        assert_eq!(secs(&mut task_loop), vec![1, 2, 4, 8, 16, 30]);
    }

    #[test]
    fn reset_returns_to_the_minimum() {
        let mut pause = Pause::new(Duration::from_secs(1), Duration::from_secs(5));
        pause.next();
        pause.next();
        pause.reset();
        assert_eq!(pause.next(), Duration::from_secs(1));
    }

    #[test]
    fn minimum_above_maximum_is_clamped() {
        let mut pause = Pause::new(Duration::from_secs(10), Duration::from_secs(2));
        assert_eq!(pause.next(), Duration::from_secs(2));
        assert_eq!(pause.current(), Duration::from_secs(2));
    }

    proptest! {
        #[test]
        fn pauses_stay_within_bounds_and_never_shrink(
            min_ms in 1u64..2_000,
            max_ms in 1u64..60_000,
            steps in 1usize..40,
        ) {
            let mut pause = Pause::new(Duration::from_millis(min_ms), Duration::from_millis(max_ms));
            let floor = Duration::from_millis(min_ms.min(max_ms));
            let cap = Duration::from_millis(max_ms);
            let mut previous = Duration::ZERO;
            for _ in 0..steps {
                let next = pause.next();
                prop_assert!(next >= floor && next <= cap);
                prop_assert!(next >= previous);
                previous = next;
            }
        }
    }
}
