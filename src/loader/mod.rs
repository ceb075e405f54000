//! Streams input files into the document store through the concurrency window.

mod dispatcher;
pub mod progress;
pub mod reader;
mod worker;

use std::{borrow::Cow, fmt, io, path::PathBuf, pin::pin, sync::Arc, time::Duration};

use futures::TryStreamExt;
use snafu::Snafu;
use tokio::task::JoinError;

use crate::{
    adaptive_concurrency::{LoaderSettings, retries::RetryLogic, window::ConcurrencyWindow},
    store::{CollectionRef, DocumentStore},
};
use dispatcher::Dispatcher;
use progress::{LoadCounters, format_elapsed};
use reader::BatchReader;
use worker::BatchWorker;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum LoadError {
    #[snafu(display("Failed to open {}: {}", path.display(), source))]
    OpenInput { path: PathBuf, source: io::Error },

    #[snafu(display("Failed to read {}: {}", path.display(), source))]
    ReadInput { path: PathBuf, source: io::Error },

    /// The store rejected a document with an error that is not throttling.
    #[snafu(display("Upsert into {} failed: {}", collection, reason))]
    Upsert {
        collection: String,
        reason: Cow<'static, str>,
        source: crate::Error,
    },

    #[snafu(display(
        "Gave up on a document in {} after {} throttled attempts",
        collection,
        attempts
    ))]
    RetriesExhausted {
        collection: String,
        attempts: usize,
        source: crate::Error,
    },

    #[snafu(display("Batch worker failed to complete: {}", source))]
    WorkerPanicked { source: JoinError },
}

/// One input file and the collection its documents go to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LoadTarget {
    pub path: PathBuf,
    pub collection: CollectionRef,
}

impl LoadTarget {
    pub fn new(path: impl Into<PathBuf>, collection: CollectionRef) -> Self {
        Self {
            path: path.into(),
            collection,
        }
    }
}

/// Totals of a completed run.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct LoadSummary {
    pub documents_loaded: u64,
    pub retries: u64,
    pub elapsed: Duration,
    /// Ceiling of the concurrency window when the run ended.
    pub final_concurrency_limit: usize,
}

impl LoadSummary {
    pub fn rate(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            self.documents_loaded as f64 / secs
        } else {
            0.0
        }
    }
}

impl fmt::Display for LoadSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Documents Loaded: {}", self.documents_loaded)?;
        writeln!(f, "    Elapsed Time: {}", format_elapsed(self.elapsed))?;
        writeln!(f, "     rows/second: {:.2}", self.rate())?;
        write!(f, "         Retries: {}", self.retries)
    }
}

/// Loads a sequence of files into a [`DocumentStore`].
///
/// Files are read one after another, but the batches of the next file start as
/// soon as the window has room, while the previous file's batches are still in
/// flight. Each run gets a fresh window and fresh counters.
pub struct BulkLoader<S, L> {
    store: Arc<S>,
    logic: L,
    settings: LoaderSettings,
}

impl<S, L> BulkLoader<S, L>
where
    S: DocumentStore,
    L: RetryLogic<Error = S::Error>,
{
    pub fn new(store: S, logic: L, settings: LoaderSettings) -> Self {
        Self {
            store: Arc::new(store),
            logic,
            settings,
        }
    }

    /// Loads every target in order and waits for all batches to complete.
    ///
    /// The first fatal error aborts the workers still running and is returned;
    /// documents already upserted stay in the store.
    pub async fn run(&self, targets: &[LoadTarget]) -> Result<LoadSummary, LoadError> {
        let window = ConcurrencyWindow::from_settings(&self.settings);
        let counters = Arc::new(LoadCounters::new(self.settings.progress_every()));
        let worker = BatchWorker::new(
            Arc::clone(&self.store),
            self.logic.clone(),
            Arc::clone(&window),
            Arc::clone(&counters),
            self.settings,
        );
        let mut dispatcher = Dispatcher::new(worker, Arc::clone(&window));

        for target in targets {
            info!(
                path = %target.path.display(),
                collection = %target.collection,
                "Loading file."
            );
            let reader = BatchReader::open(
                &target.path,
                Arc::new(target.collection.clone()),
                self.settings.batch_size(),
            )
            .await?;
            let mut batches = pin!(reader.into_stream());
            while let Some(batch) = batches.try_next().await? {
                dispatcher.submit(batch).await?;
            }
        }
        debug!(
            outstanding = dispatcher.outstanding(),
            "All batches dispatched; waiting for workers."
        );
        dispatcher.finish().await?;

        let snapshot = counters.snapshot();
        info!(
            loaded = snapshot.loaded,
            retries = snapshot.retries,
            concurrency_limit = window.current(),
            initial_limit = window.ceiling(),
            "Load finished."
        );
        Ok(LoadSummary {
            documents_loaded: snapshot.loaded,
            retries: snapshot.retries,
            elapsed: snapshot.elapsed,
            final_concurrency_limit: window.current(),
        })
    }
}
