//! Upload retry policies.
//!
//! A policy maps the number of failed attempts so far to either the delay
//! before the next attempt or `None` when the batch should be given up.

use rand::Rng;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq)]
pub enum RetryPolicy {
    /// Never retry; the first transient failure is terminal.
    None,
    /// Wait `delay` between attempts, at most `max_retries` times.
    Fixed { delay: Duration, max_retries: u32 },
    /// Double the delay from `base` up to `max_backoff`, at most `max_retries` times.
    /// With `jitter` the delay is drawn uniformly from `[d/2, d]`.
    Exponential {
        base: Duration,
        max_backoff: Duration,
        max_retries: u32,
        jitter: bool,
    },
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy::Exponential {
            base: Duration::from_millis(500),
            max_backoff: Duration::from_millis(4000),
            max_retries: 3,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Delay before the next attempt after `failures` consecutive failures
    /// (1 after the first failed attempt).
    pub fn next_delay(&self, failures: u32) -> Option<Duration> {
        if failures == 0 {
            return Some(Duration::ZERO);
        }
        match self {
            RetryPolicy::None => None,
            RetryPolicy::Fixed { delay, max_retries } => {
                (failures <= *max_retries).then_some(*delay)
            }
            RetryPolicy::Exponential {
                base,
                max_backoff,
                max_retries,
                jitter,
            } => {
                if failures > *max_retries {
                    return None;
                }
                let factor = 2u32.saturating_pow(failures - 1);
                let delay = base.saturating_mul(factor).min(*max_backoff);
                if *jitter && !delay.is_zero() {
                    let half = delay / 2;
                    Some(rand::thread_rng().gen_range(half..=delay))
                } else {
                    Some(delay)
                }
            }
        }
    }

    /// Upper bound on retries after the first attempt.
    pub fn max_retries(&self) -> u32 {
        match self {
            RetryPolicy::None => 0,
            RetryPolicy::Fixed { max_retries, .. } | RetryPolicy::Exponential { max_retries, .. } => {
                *max_retries
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_none_gives_up_immediately() {
        assert_eq!(RetryPolicy::None.next_delay(1), None);
        assert_eq!(RetryPolicy::None.max_retries(), 0);
    }

    #[test]
    fn test_fixed_policy() {
        let p = RetryPolicy::Fixed {
            delay: Duration::from_millis(250),
            max_retries: 2,
        };
        assert_eq!(p.next_delay(1), Some(Duration::from_millis(250)));
        assert_eq!(p.next_delay(2), Some(Duration::from_millis(250)));
        assert_eq!(p.next_delay(3), None);
    }

    #[test]
    fn test_exponential_doubles_and_caps() {
        let p = RetryPolicy::Exponential {
            base: Duration::from_secs(1),
            max_backoff: Duration::from_secs(3),
            max_retries: 5,
            jitter: false,
        };
        assert_eq!(p.next_delay(1), Some(Duration::from_secs(1)));
        assert_eq!(p.next_delay(2), Some(Duration::from_secs(2)));
        assert_eq!(p.next_delay(3), Some(Duration::from_secs(3)));
        assert_eq!(p.next_delay(5), Some(Duration::from_secs(3)));
        assert_eq!(p.next_delay(6), None);
    }

    #[test]
    fn test_exponential_gives_up_after_max_retries() {
        let p = RetryPolicy::Exponential {
            base: Duration::from_secs(1),
            max_backoff: Duration::from_secs(60),
            max_retries: 3,
            jitter: false,
        };
        let delays: Vec<_> = (1..=4).map(|n| p.next_delay(n)).collect();
        assert_eq!(delays.iter().filter(|d| d.is_some()).count(), 3);
        assert_eq!(delays[3], None);
    }

    #[test]
    fn test_jitter_stays_in_range() {
        let p = RetryPolicy::Exponential {
            base: Duration::from_millis(800),
            max_backoff: Duration::from_secs(10),
            max_retries: 3,
            jitter: true,
        };
        for _ in 0..100 {
            let d = p.next_delay(2).unwrap_or_default();
            assert!(d >= Duration::from_millis(800) && d <= Duration::from_millis(1600));
        }
    }
}
