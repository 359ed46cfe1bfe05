//! Fibonacci retry delays for the client-side event pollers.

use std::time::Duration;

/// Yields delays following the Fibonacci sequence, in multiples of a base
/// unit: 0, 1, 1, 2, 3, 5, ...
///
/// Saturates instead of overflowing, so an endpoint that stays down for a
/// long time simply keeps the maximum delay.
pub(crate) struct FibonacciBackoff {
    unit: Duration,
    current: u64,
    next: u64,
}

impl FibonacciBackoff {
    pub(crate) const fn new(unit: Duration) -> Self {
        Self {
            unit,
            current: 0,
            next: 1,
        }
    }

    /// Delay to apply before the next attempt, advancing the sequence.
    pub(crate) fn next_delay(&mut self) -> Duration {
        let step = self.current;
        self.current = self.next;
        self.next = step.saturating_add(self.next);
        let factor = u32::try_from(step).unwrap_or(u32::MAX);
        self.unit.saturating_mul(factor)
    }

    /// Restart the sequence after a successful attempt.
    pub(crate) const fn reset(&mut self) {
        self.current = 0;
        self.next = 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fibonacci_sequence() {
        let mut backoff = FibonacciBackoff::new(Duration::from_secs(1));
        let delays: Vec<u64> = (0..6).map(|_| backoff.next_delay().as_secs()).collect();
        assert_eq!(delays, [0, 1, 1, 2, 3, 5]);
    }

    #[test]
    fn test_reset_restarts_sequence() {
        let mut backoff = FibonacciBackoff::new(Duration::from_secs(1));
        for _ in 0..4 {
            backoff.next_delay();
        }
        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::ZERO);
        assert_eq!(backoff.next_delay(), Duration::from_secs(1));
    }
}
