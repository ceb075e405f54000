use std::sync::Arc;

use snafu::IntoError;

use super::{LoadError, RetriesExhaustedSnafu, UpsertSnafu, progress::LoadCounters, reader::Batch};
use crate::{
    adaptive_concurrency::{
        LoaderSettings, instant_now,
        internal_event::{
            BatchCompleted, DocumentUpserted, InternalEvent, LoadProgress, UpsertThrottled,
        },
        retries::{RetryAction, RetryLogic, ThrottleBackoff},
        window::{AdmissionPermit, ConcurrencyWindow},
    },
    store::DocumentStore,
};

/// Uploads one batch, one document at a time.
///
/// A throttled document is re-sent until the store accepts it. The first
/// throttle a worker sees while the window is above its floor shrinks the
/// window, and the worker hands back its slot and queues for a new one before
/// sending again.
pub(super) struct BatchWorker<S, L> {
    store: Arc<S>,
    logic: L,
    window: Arc<ConcurrencyWindow>,
    counters: Arc<LoadCounters>,
    settings: LoaderSettings,
}

impl<S, L: Clone> Clone for BatchWorker<S, L> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            logic: self.logic.clone(),
            window: Arc::clone(&self.window),
            counters: Arc::clone(&self.counters),
            settings: self.settings,
        }
    }
}

impl<S, L> BatchWorker<S, L>
where
    S: DocumentStore,
    L: RetryLogic<Error = S::Error>,
{
    pub(super) fn new(
        store: Arc<S>,
        logic: L,
        window: Arc<ConcurrencyWindow>,
        counters: Arc<LoadCounters>,
        settings: LoaderSettings,
    ) -> Self {
        Self {
            store,
            logic,
            window,
            counters,
            settings,
        }
    }

    /// Runs the batch to completion while holding `permit`.
    pub(super) async fn run(
        self,
        batch: Batch,
        mut permit: AdmissionPermit,
    ) -> Result<(), LoadError> {
        let started = instant_now();
        let collection = batch.collection.to_string();
        let mut backoff = ThrottleBackoff::from_settings(&self.settings);

        for document in &batch.documents {
            let mut attempt = 0;
            loop {
                attempt += 1;
                let error = match self.store.upsert(&batch.collection, document).await {
                    Ok(()) => break,
                    Err(error) => error,
                };

                let suggested = match self.logic.retry_action(&error) {
                    RetryAction::Throttled(suggested) => suggested,
                    RetryAction::DontRetry(reason) => {
                        return Err(UpsertSnafu {
                            collection: &collection,
                            reason,
                        }
                        .into_error(error.into()));
                    }
                };
                if self
                    .settings
                    .max_document_retries()
                    .is_some_and(|max| attempt > max)
                {
                    return Err(RetriesExhaustedSnafu {
                        collection: &collection,
                        attempts: attempt,
                    }
                    .into_error(error.into()));
                }
                self.counters.record_retry();

                let shrunk_to = (self.window.current() > self.window.floor()
                    && self.window.shrink())
                .then(|| self.window.current());
                let delay = backoff.next_delay(suggested);
                UpsertThrottled {
                    collection: &collection,
                    attempt,
                    retry_after: delay,
                    shrunk_to,
                }
                .emit();

                if shrunk_to.is_some() {
                    drop(permit);
                    permit = self.window.admit().await;
                }
                tokio::time::sleep(delay).await;
            }

            backoff.reset();
            self.window.record_success();
            DocumentUpserted.emit();
            if let Some(milestone) = self.counters.record_success() {
                LoadProgress {
                    loaded: milestone.loaded,
                    concurrency_limit: self.window.current(),
                    since_last: milestone.since_last,
                    elapsed: milestone.elapsed,
                }
                .emit();
            }
        }

        BatchCompleted {
            collection: &collection,
            sequence: batch.sequence,
            size: batch.len(),
            elapsed: instant_now().duration_since(started),
        }
        .emit();
        drop(permit);
        Ok(())
    }
}
