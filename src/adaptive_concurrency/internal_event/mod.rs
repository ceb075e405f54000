//! Metrics and structured log lines emitted by the window and the loader.
//!
//! Every event is a plain struct; emitting it records its metrics and writes
//! its log line in one place so call sites stay short.

mod adaptive_concurrency;
mod loader;

pub use adaptive_concurrency::{ConcurrencyLimitChanged, InFlightChanged};
pub use loader::{
    BatchCompleted, BatchDispatched, DocumentDropped, DocumentUpserted, LoadProgress,
    UpsertThrottled,
};

pub trait InternalEvent: Sized {
    fn emit(self);
}
