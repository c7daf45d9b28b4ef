use std::time::Duration;

/// Exponential backoff with a cap. Not jittered; callers are per-key serial.
#[derive(Debug, Clone)]
pub(crate) struct Backoff {
    initial: Duration,
    multiplier: u32,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub(crate) fn new(initial_ms: u64, multiplier: u32, max_ms: u64) -> Self {
        let initial = Duration::from_millis(initial_ms);
        Self {
            initial,
            multiplier: multiplier.max(1),
            max: Duration::from_millis(max_ms),
            current: initial,
        }
    }

    /// The delay to apply now; the next one grows by the multiplier.
    pub(crate) fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * self.multiplier).min(self.max);
        delay
    }

    pub(crate) fn reset(&mut self) {
        self.current = self.initial;
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_grows_to_cap() {
        let mut backoff = Backoff::new(100, 3, 500);
        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
        assert_eq!(backoff.next_delay(), Duration::from_millis(300));
        assert_eq!(backoff.next_delay(), Duration::from_millis(500));
        assert_eq!(backoff.next_delay(), Duration::from_millis(500));
    }

    #[test]
    fn test_reset() {
        let mut backoff = Backoff::new(100, 2, 1000);
        backoff.next_delay();
        backoff.next_delay();
        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
    }
}
