//! Bulk loader for rate-limited document stores.
//!
//! Documents are read from loosely formatted JSON array files, grouped into
//! batches, and handed to short-lived worker tasks. The number of workers
//! running at once is bounded by a [`ConcurrencyWindow`] whose ceiling is
//! lowered every time the store answers with a throttling response.
//!
//! # Pipeline
//!
//! 1. [`loader::reader::BatchReader`] turns a file into a lazy sequence of batches
//! 2. the dispatcher waits for a slot in the window and spawns a worker per batch
//! 3. each worker upserts its documents in order, retrying throttled writes
//! 4. [`loader::progress::LoadCounters`] tracks loaded documents and retries
//!
//! # Basic Usage
//! ```no_run
//! use adaptive_bulk_loader::adaptive_concurrency::LoaderSettings;
//! use adaptive_bulk_loader::loader::{BulkLoader, LoadTarget};
//! use adaptive_bulk_loader::store::CollectionRef;
//! use adaptive_bulk_loader::store::cosmos::{ConnectionPolicy, CosmosRetryLogic, CosmosStore};
//!
//! # async fn run() -> Result<(), adaptive_bulk_loader::Error> {
//! let settings = LoaderSettings::builder().max_loaders(6).build();
//! let policy = ConnectionPolicy::for_loaders(settings.max_loaders());
//! let store = CosmosStore::connect("myaccount", "bWFzdGVyLWtleQ==", "imdb", policy).await?;
//!
//! let targets = vec![LoadTarget::new("data/movies.json", CollectionRef::new("imdb", "movies"))];
//! let summary = BulkLoader::new(store, CosmosRetryLogic, settings).run(&targets).await?;
//! println!("{summary}");
//! # Ok(())
//! # }
//! ```
//!
//! # Metrics
//! Emits metrics via the `InternalEvent` trait
pub mod adaptive_concurrency;
pub mod config;
pub mod loader;
pub mod store;
#[cfg(test)]
pub(crate) mod test_utils;

#[macro_use]
extern crate tracing;

pub use adaptive_concurrency::window::ConcurrencyWindow;

pub type Error = Box<dyn std::error::Error + Send + Sync + 'static>;
