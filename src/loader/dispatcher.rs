use std::sync::Arc;

use snafu::ResultExt;
use tokio::task::{AbortHandle, JoinError, JoinSet};

use super::{LoadError, WorkerPanickedSnafu, reader::Batch, worker::BatchWorker};
use crate::{
    adaptive_concurrency::{
        internal_event::{BatchDispatched, InternalEvent},
        retries::RetryLogic,
        window::ConcurrencyWindow,
    },
    store::DocumentStore,
};

/// Hands batches to fresh worker tasks, never more than the window admits.
pub(super) struct Dispatcher<S, L> {
    worker: BatchWorker<S, L>,
    window: Arc<ConcurrencyWindow>,
    workers: JoinSet<Result<(), LoadError>>,
}

impl<S, L> Dispatcher<S, L>
where
    S: DocumentStore,
    L: RetryLogic<Error = S::Error>,
{
    pub(super) fn new(worker: BatchWorker<S, L>, window: Arc<ConcurrencyWindow>) -> Self {
        Self {
            worker,
            window,
            workers: JoinSet::new(),
        }
    }

    /// Waits for a slot and starts a worker for `batch`.
    ///
    /// Workers that finish in the meantime are collected; if one of them failed,
    /// every other worker is aborted and its error returned instead.
    pub(super) async fn submit(&mut self, batch: Batch) -> Result<AbortHandle, LoadError> {
        let permit = loop {
            let joined = tokio::select! {
                biased;
                Some(joined) = self.workers.join_next() => joined,
                permit = self.window.admit() => break permit,
            };
            self.settle(joined).await?;
        };
        while let Some(joined) = self.workers.try_join_next() {
            self.settle(joined).await?;
        }

        BatchDispatched {
            collection: batch.collection.collection(),
            sequence: batch.sequence,
            size: batch.len(),
            concurrency_limit: self.window.current(),
        }
        .emit();
        Ok(self.workers.spawn(self.worker.clone().run(batch, permit)))
    }

    /// Waits for every outstanding worker.
    pub(super) async fn finish(mut self) -> Result<(), LoadError> {
        while let Some(joined) = self.workers.join_next().await {
            self.settle(joined).await?;
        }
        Ok(())
    }

    pub(super) fn outstanding(&self) -> usize {
        self.workers.len()
    }

    async fn settle(
        &mut self,
        joined: Result<Result<(), LoadError>, JoinError>,
    ) -> Result<(), LoadError> {
        let result = match joined {
            Ok(result) => result,
            Err(error) if error.is_cancelled() => Ok(()),
            Err(error) => Err(error).context(WorkerPanickedSnafu),
        };
        if let Err(error) = &result {
            error!(%error, outstanding = self.workers.len(), "Aborting load.");
            self.workers.shutdown().await;
        }
        result
    }
}
