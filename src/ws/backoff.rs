#![expect(
    clippy::module_name_repetitions,
    reason = "The policy type is named after the strategy it implements"
)]

//! Reconnect delay calculation.

use std::time::Duration;

use super::config::ReconnectConfig;

/// Fraction of the computed delay used as the jitter spread in either direction.
const JITTER_FACTOR: f64 = 0.25;

/// Exponential backoff with an upper bound and optional symmetric jitter.
///
/// The policy never tracks the attempt count itself; callers pass it in. The only state
/// it keeps is the most recently computed delay, which [`BackoffPolicy::reset`] clears.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    initial_delay: Duration,
    max_delay: Duration,
    multiplier: f64,
    jitter: bool,
    last_delay: Option<Duration>,
}

impl BackoffPolicy {
    #[must_use]
    pub fn new(config: &ReconnectConfig) -> Self {
        Self {
            initial_delay: config.initial_delay,
            max_delay: config.max_delay,
            multiplier: config.backoff_multiplier,
            jitter: config.jitter,
            last_delay: None,
        }
    }

    /// Delay to wait before the reconnection attempt following `attempt` failures.
    ///
    /// `min(initial * multiplier^attempt, max)`, then shifted by a uniform offset in
    /// `[-25%, +25%]` when jitter is enabled. Never negative.
    pub fn next_delay(&mut self, attempt: u32) -> Duration {
        let base = self.base_delay_millis(attempt);
        let millis = if self.jitter {
            Self::apply_jitter(base, &mut rand::rng())
        } else {
            base
        };

        let delay = Self::to_duration(millis);
        self.last_delay = Some(delay);
        delay
    }

    /// Whether another attempt is allowed after `attempt` attempts.
    #[must_use]
    #[expect(
        clippy::unused_self,
        reason = "Retry budget belongs to the policy even though it needs no policy state"
    )]
    pub const fn should_retry(&self, attempt: u32, max_attempts: u32) -> bool {
        attempt < max_attempts
    }

    /// The delay most recently returned by [`BackoffPolicy::next_delay`].
    #[must_use]
    pub const fn last_delay(&self) -> Option<Duration> {
        self.last_delay
    }

    pub fn reset(&mut self) {
        self.last_delay = None;
    }

    #[expect(
        clippy::cast_precision_loss,
        clippy::float_arithmetic,
        reason = "Delays are milliseconds well within f64's exact integer range"
    )]
    fn base_delay_millis(&self, attempt: u32) -> f64 {
        let initial = self.initial_delay.as_millis() as f64;
        let max = self.max_delay.as_millis() as f64;
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let raw = initial * self.multiplier.powi(exponent);

        if raw.is_finite() { raw.min(max) } else { max }
    }

    #[expect(
        clippy::float_arithmetic,
        reason = "Jitter is a fractional offset of the base delay"
    )]
    fn apply_jitter<R: rand::Rng + ?Sized>(base: f64, rng: &mut R) -> f64 {
        let spread = base * JITTER_FACTOR;
        if spread <= 0.0 {
            return base;
        }
        let offset = rng.random_range(-spread..=spread);
        (base + offset).max(0.0)
    }

    #[expect(
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        reason = "Value is clamped to be finite and non-negative before conversion"
    )]
    fn to_duration(millis: f64) -> Duration {
        if millis.is_finite() && millis > 0.0 {
            Duration::from_millis(millis.round() as u64)
        } else {
            Duration::ZERO
        }
    }
}
