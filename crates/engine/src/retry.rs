//! Retry backoff policies.

use std::time::Duration;

/// Backoff policy consulted between attempts of the same executor.
///
/// A policy is a pure function of the attempt number; it holds no mutable
/// state and is safe to share across concurrently failing tasks.
#[derive(Debug, Clone)]
pub enum RetryPolicy {
    /// Same delay before every retry.
    Constant {
        /// Delay applied before each retry
        delay: Duration,
    },

    /// Exponentially growing delay, capped at `max`.
    Exponential {
        /// Delay before the first retry
        initial: Duration,
        /// Upper bound on the computed delay
        max: Duration,
        /// Growth factor per attempt
        factor: f64,
        /// Multiply by a uniform factor in `[0.5, 1.5)` to spread out
        /// retries when many tasks fail at once
        jitter: bool,
    },
}

impl RetryPolicy {
    /// Constant-delay policy.
    pub fn constant(delay: Duration) -> Self {
        Self::Constant { delay }
    }

    /// Exponential backoff without jitter.
    pub fn exponential(initial: Duration, max: Duration, factor: f64) -> Self {
        Self::Exponential {
            initial,
            max,
            factor,
            jitter: false,
        }
    }

    /// Enable jitter on an exponential policy. No-op for constant delay.
    pub fn with_jitter(mut self) -> Self {
        if let Self::Exponential { jitter, .. } = &mut self {
            *jitter = true;
        }
        self
    }

    /// Delay before the next retry, given the 1-based count of attempts
    /// already made.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        match *self {
            Self::Constant { delay } => delay,
            Self::Exponential {
                initial,
                max,
                factor,
                jitter,
            } => {
                let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
                let raw = initial.as_secs_f64() * factor.powi(exponent);
                let mut delay = raw.min(max.as_secs_f64());
                if jitter {
                    delay *= 0.5 + rand::random::<f64>();
                }
                Duration::from_secs_f64(delay)
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::Exponential {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(30),
            factor: 2.0,
            jitter: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constant_ignores_attempt_number() {
        let policy = RetryPolicy::constant(Duration::from_secs(5));
        assert_eq!(policy.delay_for(1), Duration::from_secs(5));
        assert_eq!(policy.delay_for(10), Duration::from_secs(5));
    }

    #[test]
    fn exponential_doubles_then_caps() {
        let policy = RetryPolicy::exponential(
            Duration::from_secs(1),
            Duration::from_secs(30),
            2.0,
        );
        assert_eq!(policy.delay_for(1), Duration::from_secs(1));
        assert_eq!(policy.delay_for(2), Duration::from_secs(2));
        assert_eq!(policy.delay_for(3), Duration::from_secs(4));
        assert_eq!(policy.delay_for(6), Duration::from_secs(30));
        assert_eq!(policy.delay_for(32), Duration::from_secs(30));
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let policy = RetryPolicy::exponential(
            Duration::from_secs(4),
            Duration::from_secs(60),
            2.0,
        )
        .with_jitter();

        for _ in 0..200 {
            let delay = policy.delay_for(1).as_secs_f64();
            assert!((2.0..6.0).contains(&delay), "delay {delay} out of jitter bounds");
        }
    }

    #[test]
    fn default_is_jittered_exponential() {
        match RetryPolicy::default() {
            RetryPolicy::Exponential {
                initial,
                max,
                factor,
                jitter,
            } => {
                assert_eq!(initial, Duration::from_secs(1));
                assert_eq!(max, Duration::from_secs(30));
                assert_eq!(factor, 2.0);
                assert!(jitter);
            }
            other => panic!("unexpected default policy: {other:?}"),
        }
    }
}
