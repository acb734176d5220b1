use std::time::Duration;

use backon::BackoffBuilder;

/// Fibonacci-shaped backoff: `B, 2B, 3B, 5B, 8B, ...`, capped at a ceiling.
///
/// `max_attempts` counts the first call, so at most `max_attempts - 1` delays are produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FibonacciBackoff {
    pub(crate) base: Duration,
    pub(crate) ceiling: Duration,
    pub(crate) max_attempts: usize,
}

impl FibonacciBackoff {
    #[must_use]
    pub fn new(base: Duration, ceiling: Duration, max_attempts: usize) -> Self {
        Self { base, ceiling, max_attempts }
    }
}

impl BackoffBuilder for FibonacciBackoff {
    type Backoff = FibonacciDelays;

    fn build(self) -> Self::Backoff {
        FibonacciDelays {
            previous: self.base,
            current: self.base,
            ceiling: self.ceiling,
            remaining: self.max_attempts.saturating_sub(1),
        }
    }
}

/// Iterator over the delays of a [`FibonacciBackoff`].
#[derive(Debug, Clone)]
pub struct FibonacciDelays {
    previous: Duration,
    current: Duration,
    ceiling: Duration,
    remaining: usize,
}

impl Iterator for FibonacciDelays {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;

        let delay = self.current.min(self.ceiling);
        let next = self.previous.saturating_add(self.current);
        self.previous = self.current;
        self.current = next;
        Some(delay)
    }
}
