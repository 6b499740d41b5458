// Amazon ENA/EFA Command Queue Core
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! Exponential backoff and the polling retry combinator.

use crate::error::{ComError, ComResult};
use std::time::{Duration, Instant};

/// Bounded exponential backoff: `min * 2^exp`, exponent capped, result
/// clamped to `[min, max]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    min_delay: Duration,
    max_delay: Duration,
    max_exp: u32,
}

impl Backoff {
    pub const fn new(min_delay: Duration, max_delay: Duration, max_exp: u32) -> Self {
        Self {
            min_delay,
            max_delay,
            max_exp,
        }
    }

    /// Delay for the given attempt number.
    pub fn delay(&self, exp: u32) -> Duration {
        let exp = exp.min(self.max_exp).min(31);
        let delay = self.min_delay.saturating_mul(1u32 << exp);
        delay.clamp(self.min_delay, self.max_delay.max(self.min_delay))
    }

    /// Sleep for the delay of the given attempt number.
    pub fn sleep(&self, exp: u32) {
        std::thread::sleep(self.delay(exp));
    }
}

/// Repeatedly run `probe` until it yields a value, sleeping with `backoff`
/// between attempts.
///
/// The probe's own errors are returned immediately. When `timeout` elapses
/// without a value the result is `ComError::Timeout`.
pub fn poll_until<T>(
    backoff: &Backoff,
    timeout: Duration,
    mut probe: impl FnMut() -> ComResult<Option<T>>,
) -> ComResult<T> {
    let deadline = Instant::now().checked_add(timeout);
    let mut exp = 0u32;
    loop {
        if let Some(value) = probe()? {
            return Ok(value);
        }
        if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
            return Err(ComError::Timeout);
        }
        backoff.sleep(exp);
        exp = exp.saturating_add(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn admin_backoff() -> Backoff {
        Backoff::new(Duration::from_micros(100), Duration::from_micros(5000), 16)
    }

    #[test]
    fn test_delay_doubles_and_clamps() {
        let backoff = admin_backoff();
        assert_eq!(backoff.delay(0), Duration::from_micros(100));
        assert_eq!(backoff.delay(1), Duration::from_micros(200));
        assert_eq!(backoff.delay(5), Duration::from_micros(3200));
        assert_eq!(backoff.delay(6), Duration::from_micros(5000));
        assert_eq!(backoff.delay(1000), Duration::from_micros(5000));
    }

    #[test]
    fn test_exponent_cap() {
        let backoff = Backoff::new(Duration::from_nanos(1), Duration::from_secs(1), 3);
        assert_eq!(backoff.delay(3), Duration::from_nanos(8));
        assert_eq!(backoff.delay(10), Duration::from_nanos(8));
    }

    #[test]
    fn test_poll_until_ready() {
        let backoff = Backoff::new(Duration::from_micros(1), Duration::from_micros(10), 4);
        let mut attempts = 0;
        let value = poll_until(&backoff, Duration::from_secs(1), || {
            attempts += 1;
            Ok((attempts == 3).then_some(attempts))
        })
        .unwrap();
        assert_eq!(value, 3);
    }

    #[test]
    fn test_poll_until_timeout() {
        let backoff = Backoff::new(Duration::from_micros(1), Duration::from_micros(10), 4);
        let result: ComResult<()> = poll_until(&backoff, Duration::from_millis(5), || Ok(None));
        assert!(matches!(result, Err(ComError::Timeout)));
    }

    #[test]
    fn test_poll_until_probe_error() {
        let backoff = admin_backoff();
        let result: ComResult<()> =
            poll_until(&backoff, Duration::from_secs(1), || Err(ComError::NotRunning));
        assert!(matches!(result, Err(ComError::NotRunning)));
    }
}
