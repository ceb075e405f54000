//! Limit the number of batches being loaded concurrently.

pub mod internal_event;
pub mod retries;
mod semaphore;
pub mod window;

use std::time::Duration;

use bon::Builder;

/// The smallest ceiling the window accepts; lower requests are raised to it.
pub const MIN_LOADERS: usize = 3;

/// Configuration of the loader and its concurrency window.
///
/// These parameters typically do not require changes from the default. The defaults
/// were picked for a 400 RU/s collection, where six loaders keep the request-unit
/// budget busy without drowning the account in throttling responses.
///
/// | Parameter | Default | Description |
/// |-----------|---------|-------------|
/// | `max_loaders` | 6 | Initial ceiling of concurrently loading batches (raised to at least 3) |
/// | `batch_size` | 25 | Documents per batch. Keep small so the tail of the load finishes quickly |
/// | `progress_every` | 100 | Successful upserts between two progress lines |
/// | `recover_after` | none | Grow the window by one after this many consecutive successes |
/// | `max_document_retries` | none | Give up on a document after this many throttled attempts |
/// | `fallback_backoff` | 1s | First delay when the store throttles without a suggestion |
/// | `max_retry_wait` | 120s | Upper bound of the fallback backoff |
///
/// # Example
///
/// ```rust
/// use adaptive_bulk_loader::adaptive_concurrency::LoaderSettings;
///
/// let settings = LoaderSettings::builder()
///     .max_loaders(10)
///     .batch_size(20)
///     .build();
/// assert_eq!(settings.floor(), 5);
/// ```
#[derive(Clone, Copy, Debug, Builder)]
pub struct LoaderSettings {
    /// Ceiling of the concurrency window when the run starts.
    ///
    /// The window only ever shrinks from here unless `recover_after` is set.
    #[builder(default = default_max_loaders())]
    pub(crate) max_loaders: usize,

    /// Number of documents grouped into one batch.
    ///
    /// A worker uploads its batch one document at a time, so large batches make the
    /// last few workers of a run take a long time.
    #[builder(default = default_batch_size())]
    pub(crate) batch_size: usize,

    /// Successful upserts between two progress milestones.
    #[builder(default = default_progress_every())]
    pub(crate) progress_every: u64,

    /// Consecutive successful upserts after which a shrunk window grows back by one.
    ///
    /// Unset by default: shrinking is a one-way valve for the whole run.
    pub(crate) recover_after: Option<u64>,

    /// Throttled attempts allowed per document before the run is aborted.
    ///
    /// Unset by default: a throttled document is retried until it succeeds.
    pub(crate) max_document_retries: Option<usize>,

    /// First backoff used when the store throttles without suggesting a delay.
    #[builder(default = default_fallback_backoff())]
    pub(crate) fallback_backoff: Duration,

    /// Longest single backoff used when the store does not suggest a delay.
    #[builder(default = default_max_retry_wait())]
    pub(crate) max_retry_wait: Duration,
}

const fn default_max_loaders() -> usize {
    6
}

// keep this small or the last loaders take a long time
const fn default_batch_size() -> usize {
    25
}

const fn default_progress_every() -> u64 {
    100
}

const fn default_fallback_backoff() -> Duration {
    Duration::from_secs(1)
}

const fn default_max_retry_wait() -> Duration {
    Duration::from_secs(120)
}

impl Default for LoaderSettings {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl LoaderSettings {
    /// The effective initial ceiling, never below [`MIN_LOADERS`].
    pub fn max_loaders(&self) -> usize {
        self.max_loaders.max(MIN_LOADERS)
    }

    /// The lowest value the ceiling can be shrunk to.
    ///
    /// Half the ceiling for large windows, otherwise [`MIN_LOADERS`].
    pub fn floor(&self) -> usize {
        floor_for(self.max_loaders())
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size.max(1)
    }

    pub fn progress_every(&self) -> u64 {
        self.progress_every.max(1)
    }

    pub fn recover_after(&self) -> Option<u64> {
        self.recover_after.filter(|n| *n > 0)
    }

    pub fn max_document_retries(&self) -> Option<usize> {
        self.max_document_retries
    }

    pub fn fallback_backoff(&self) -> Duration {
        self.fallback_backoff
    }

    pub fn max_retry_wait(&self) -> Duration {
        self.max_retry_wait
    }
}

pub(crate) const fn floor_for(max_loaders: usize) -> usize {
    if max_loaders > 7 {
        max_loaders / 2
    } else {
        MIN_LOADERS
    }
}

pub(crate) fn instant_now() -> tokio::time::Instant {
    tokio::time::Instant::now()
}
