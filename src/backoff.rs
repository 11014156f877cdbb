//! Retry budget and backoff for transient failures.
//!
//! Only server errors (5xx) and transport failures are retried, and only through the scheduler:
//! a retried request keeps its place at the head of its lane and the lane stays parked until the
//! backoff elapses. Rate limits are never counted against this budget.
//!
//! Retry semantics: retry `0` is the initial attempt (no delay), the first retry is `1`.
//!
//! ```rust
//! use std::time::Duration;
//! use ratelane::{Backoff, Jitter, RetryPolicy};
//!
//! let policy = RetryPolicy::builder()
//!     .max_retries(2)
//!     .backoff(Backoff::exponential(Duration::from_millis(100)).with_max(Duration::from_secs(1)).unwrap())
//!     .jitter(Jitter::None)
//!     .build()
//!     .unwrap();
//! assert_eq!(policy.delay(1), Duration::from_millis(100));
//! assert_eq!(policy.delay(2), Duration::from_millis(200));
//! assert!(policy.allows(2));
//! assert!(!policy.allows(3));
//! ```

use rand::{rng, Rng};
use std::fmt;
use std::time::Duration;

/// Delay used when calculations overflow (1 day).
pub const MAX_BACKOFF: Duration = Duration::from_secs(24 * 60 * 60);

/// Errors returned by backoff configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackoffError {
    ConstantDoesNotSupportMax,
    MaxMustBePositive,
    MaxLessThanBase { base: Duration, max: Duration },
}

impl fmt::Display for BackoffError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackoffError::ConstantDoesNotSupportMax => {
                write!(f, "with_max is only valid for linear or exponential backoff")
            }
            BackoffError::MaxMustBePositive => write!(f, "max must be greater than zero"),
            BackoffError::MaxLessThanBase { base, max } => {
                write!(f, "max ({max:?}) must be >= base ({base:?})")
            }
        }
    }
}

impl std::error::Error for BackoffError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Curve {
    Constant,
    Linear,
    Exponential,
}

/// Un-jittered delay curve.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    curve: Curve,
    base: Duration,
    max: Option<Duration>,
}

impl Backoff {
    /// The same delay before every retry.
    pub fn constant(delay: Duration) -> Self {
        Self { curve: Curve::Constant, base: delay, max: None }
    }

    /// `base * retry`.
    pub fn linear(base: Duration) -> Self {
        Self { curve: Curve::Linear, base, max: None }
    }

    /// `base * 2^(retry - 1)`.
    pub fn exponential(base: Duration) -> Self {
        Self { curve: Curve::Exponential, base, max: None }
    }

    /// Cap a growing curve. Fails on constant curves, on a zero cap, or when `max < base`.
    pub fn with_max(mut self, max: Duration) -> Result<Self, BackoffError> {
        if max.is_zero() {
            return Err(BackoffError::MaxMustBePositive);
        }
        if self.curve == Curve::Constant {
            return Err(BackoffError::ConstantDoesNotSupportMax);
        }
        if max < self.base {
            return Err(BackoffError::MaxLessThanBase { base: self.base, max });
        }
        self.max = Some(max);
        Ok(self)
    }

    /// Delay before retry number `retry`. Retry `0` is the initial attempt and never waits.
    pub fn delay(&self, retry: u32) -> Duration {
        if retry == 0 {
            return Duration::ZERO;
        }
        let raw = match self.curve {
            Curve::Constant => self.base,
            Curve::Linear => self.base.checked_mul(retry).unwrap_or(MAX_BACKOFF),
            Curve::Exponential => {
                let multiplier = 2u128.saturating_pow(retry - 1);
                let nanos = self.base.as_nanos().saturating_mul(multiplier);
                Duration::from_nanos(nanos.min(MAX_BACKOFF.as_nanos()) as u64)
            }
        };
        self.max.map_or(raw, |max| raw.min(max)).min(MAX_BACKOFF)
    }
}

/// Randomization applied on top of a [`Backoff`] so retrying lanes do not wake in lockstep.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Jitter {
    /// Exact backoff delay.
    None,
    /// Uniform in `[0, delay]`.
    #[default]
    Full,
    /// Uniform in `[delay / 2, delay]`.
    Equal,
}

impl Jitter {
    /// Apply jitter using the thread-local RNG.
    pub fn apply(&self, delay: Duration) -> Duration {
        self.apply_with_rng(delay, &mut rng())
    }

    /// Apply jitter with a caller supplied RNG.
    pub fn apply_with_rng<R: Rng>(&self, delay: Duration, rng: &mut R) -> Duration {
        let millis: u64 = delay.as_millis().try_into().unwrap_or(u64::MAX);
        match self {
            Jitter::None => delay,
            _ if millis == 0 => Duration::ZERO,
            Jitter::Full => Duration::from_millis(rng.random_range(0..=millis)),
            Jitter::Equal => Duration::from_millis(rng.random_range(millis / 2..=millis)),
        }
    }
}

/// Errors returned by [`RetryPolicyBuilder::build`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BuildError {
    #[error("invalid backoff: {0}")]
    Backoff(#[from] BackoffError),
}

/// How often, and how patiently, transient failures are retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    max_retries: u32,
    backoff: Backoff,
    jitter: Jitter,
}

impl RetryPolicy {
    /// Default budget: three retries.
    pub const DEFAULT_MAX_RETRIES: u32 = 3;

    /// Start a builder seeded with the defaults.
    pub fn builder() -> RetryPolicyBuilder {
        RetryPolicyBuilder::new()
    }

    /// Never retry.
    pub fn none() -> Self {
        Self { max_retries: 0, ..Self::default() }
    }

    /// Same policy with a different retry budget.
    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    /// Retries allowed after the initial attempt.
    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Whether retry number `retry` is still within budget.
    pub fn allows(&self, retry: u32) -> bool {
        retry <= self.max_retries
    }

    /// Jittered delay before retry number `retry`.
    pub fn delay(&self, retry: u32) -> Duration {
        self.jitter.apply(self.backoff.delay(retry))
    }

    /// Backoff curve.
    pub fn backoff(&self) -> Backoff {
        self.backoff
    }

    /// Jitter strategy.
    pub fn jitter(&self) -> Jitter {
        self.jitter
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: Self::DEFAULT_MAX_RETRIES,
            backoff: Backoff {
                curve: Curve::Exponential,
                base: Duration::from_millis(500),
                max: Some(Duration::from_secs(30)),
            },
            jitter: Jitter::Full,
        }
    }
}

/// Builder for [`RetryPolicy`].
#[derive(Debug, Clone)]
pub struct RetryPolicyBuilder {
    policy: RetryPolicy,
    max: Option<Duration>,
}

impl RetryPolicyBuilder {
    /// Builder seeded with [`RetryPolicy::default`].
    pub fn new() -> Self {
        Self { policy: RetryPolicy::default(), max: None }
    }

    /// Retries allowed after the initial attempt. `0` disables retrying.
    pub fn max_retries(mut self, retries: u32) -> Self {
        self.policy.max_retries = retries;
        self
    }

    /// Delay curve.
    pub fn backoff(mut self, backoff: Backoff) -> Self {
        self.policy.backoff = backoff;
        self
    }

    /// Cap applied to the curve at build time.
    pub fn max_delay(mut self, max: Duration) -> Self {
        self.max = Some(max);
        self
    }

    /// Jitter strategy.
    pub fn jitter(mut self, jitter: Jitter) -> Self {
        self.policy.jitter = jitter;
        self
    }

    /// Validate and build.
    pub fn build(self) -> Result<RetryPolicy, BuildError> {
        let mut policy = self.policy;
        if let Some(max) = self.max {
            policy.backoff = policy.backoff.with_max(max)?;
        }
        Ok(policy)
    }
}

impl Default for RetryPolicyBuilder {
    fn default() -> Self {
        Self::new()
    }
}
