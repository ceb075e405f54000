use std::{borrow::Cow, time::Duration};

use super::LoaderSettings;

pub enum RetryAction {
    /// The store is over its throughput budget; retry the same document after the
    /// suggested delay, if the store gave one.
    Throttled(Option<Duration>),
    /// Indicate that this write should not be retried, with a reason
    DontRetry(Cow<'static, str>),
}

/// Decides which store errors are throttling responses.
///
/// Anything classified as [`RetryAction::DontRetry`] ends the whole run.
///
/// # Example
/// ```rust
/// use std::{io, time::Duration};
/// use adaptive_bulk_loader::adaptive_concurrency::retries::{RetryAction, RetryLogic};
///
/// #[derive(Clone)]
/// struct BusyIsThrottled;
///
/// impl RetryLogic for BusyIsThrottled {
///     type Error = io::Error;
///
///     fn retry_action(&self, error: &Self::Error) -> RetryAction {
///         match error.kind() {
///             io::ErrorKind::WouldBlock => RetryAction::Throttled(Some(Duration::from_millis(100))),
///             _ => RetryAction::DontRetry(error.to_string().into()),
///         }
///     }
/// }
/// ```
pub trait RetryLogic: Clone + Send + Sync + 'static {
    /// The type of errors produced by the store
    type Error: std::error::Error + Send + Sync + 'static;

    /// Classifies a failed upsert.
    fn retry_action(&self, error: &Self::Error) -> RetryAction;
}

impl RetryAction {
    pub const fn is_throttled(&self) -> bool {
        matches!(self, RetryAction::Throttled(_))
    }

    pub const fn is_not_retryable(&self) -> bool {
        matches!(self, RetryAction::DontRetry(_))
    }
}

/// The jitter mode to use for retry backoff behavior.
#[derive(Clone, Copy, Debug, Default)]
pub enum JitterMode {
    /// No jitter.
    None,

    /// Full jitter.
    ///
    /// The random delay is anywhere from 0 up to the maximum current delay calculated by the backoff
    /// strategy.
    #[default]
    Full,
}

/// Delay before re-sending a throttled document.
///
/// A delay suggested by the store is honoured exactly. Throttling responses that
/// carry no suggestion fall back to an exponential backoff capped at
/// `max_retry_wait`; the fallback restarts once a document goes through.
#[derive(Clone, Debug)]
pub struct ThrottleBackoff {
    fallback: ExponentialBackoff,
    jitter_mode: JitterMode,
}

impl ThrottleBackoff {
    pub fn new(initial: Duration, max_delay: Duration, jitter_mode: JitterMode) -> Self {
        let initial_ms = u64::try_from(initial.as_millis()).unwrap_or(u64::MAX).max(1);
        Self {
            fallback: ExponentialBackoff::from_millis(2)
                .factor((initial_ms / 2).max(1))
                .max_delay(max_delay),
            jitter_mode,
        }
    }

    pub fn from_settings(settings: &LoaderSettings) -> Self {
        Self::new(
            settings.fallback_backoff(),
            settings.max_retry_wait(),
            JitterMode::Full,
        )
    }

    pub fn next_delay(&mut self, suggested: Option<Duration>) -> Duration {
        if let Some(delay) = suggested {
            return delay;
        }
        let base = self.fallback.next().unwrap_or(Duration::ZERO);
        match self.jitter_mode {
            JitterMode::None => base,
            JitterMode::Full => add_full_jitter(base),
        }
    }

    pub fn reset(&mut self) {
        self.fallback.reset();
    }
}

fn add_full_jitter(d: Duration) -> Duration {
    let millis = u64::try_from(d.as_millis()).unwrap_or(u64::MAX);
    if millis == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(rand::random_range(1..=millis))
}

// `tokio-retry` crate
// MIT License
// Copyright (c) 2017 Sam Rijs
//
/// A retry strategy driven by exponential back-off.
///
/// The power corresponds to the number of past attempts.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    current: u64,
    base: u64,
    factor: u64,
    max_delay: Option<Duration>,
}

impl ExponentialBackoff {
    /// Constructs a new exponential back-off strategy,
    /// given a base duration in milliseconds.
    ///
    /// The resulting duration is calculated by taking the base to the `n`-th power,
    /// where `n` denotes the number of past attempts.
    pub const fn from_millis(base: u64) -> ExponentialBackoff {
        ExponentialBackoff {
            current: base,
            base,
            factor: 1u64,
            max_delay: None,
        }
    }

    /// A multiplicative factor that will be applied to the retry delay.
    ///
    /// For example, using a factor of `1000` will make each delay in units of seconds.
    ///
    /// Default factor is `1`.
    pub const fn factor(mut self, factor: u64) -> ExponentialBackoff {
        self.factor = factor;
        self
    }

    /// Apply a maximum delay. No retry delay will be longer than this `Duration`.
    pub const fn max_delay(mut self, duration: Duration) -> ExponentialBackoff {
        self.max_delay = Some(duration);
        self
    }

    /// Resets the exponential back-off strategy to its initial state.
    pub fn reset(&mut self) {
        self.current = self.base;
    }
}

impl Iterator for ExponentialBackoff {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        // set delay duration by applying factor
        let duration = if let Some(duration) = self.current.checked_mul(self.factor) {
            Duration::from_millis(duration)
        } else {
            Duration::from_millis(u64::MAX)
        };

        // check if we reached max delay
        if let Some(ref max_delay) = self.max_delay {
            if duration > *max_delay {
                return Some(*max_delay);
            }
        }

        if let Some(next) = self.current.checked_mul(self.base) {
            self.current = next;
        } else {
            self.current = u64::MAX;
        }

        Some(duration)
    }
}
