//! In-memory store whose responses are scripted per document id.

use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::{
        Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use snafu::Snafu;
use tokio::time::Instant;

use crate::{
    adaptive_concurrency::retries::{RetryAction, RetryLogic},
    store::{CollectionRef, Document, DocumentStore},
};

#[derive(Debug, Snafu)]
pub(crate) enum ScriptedError {
    #[snafu(display("Throttled, retry after {:?}", retry_after))]
    Throttled { retry_after: Option<Duration> },

    #[snafu(display("Rejected document {}", id))]
    Rejected { id: String },
}

#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct ScriptedRetryLogic;

impl RetryLogic for ScriptedRetryLogic {
    type Error = ScriptedError;

    fn retry_action(&self, error: &Self::Error) -> RetryAction {
        match error {
            ScriptedError::Throttled { retry_after } => RetryAction::Throttled(*retry_after),
            ScriptedError::Rejected { .. } => RetryAction::DontRetry(error.to_string().into()),
        }
    }
}

#[derive(Clone, Debug)]
pub(crate) struct Call {
    pub id: String,
    pub at: Instant,
}

#[derive(Default)]
pub(crate) struct ScriptedStore {
    delay: Option<Duration>,
    throttles: Mutex<HashMap<String, VecDeque<Option<Duration>>>>,
    rejected: HashSet<String>,
    calls: Mutex<Vec<Call>>,
    upserted: Mutex<Vec<(String, String)>>,
    concurrent: AtomicUsize,
    max_concurrent: AtomicUsize,
}

impl ScriptedStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every upsert takes `delay` before it answers.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Throttles the document once per entry, suggesting that entry's delay.
    pub fn throttle(self, id: &str, delays: impl IntoIterator<Item = Duration>) -> Self {
        self.push_throttles(id, delays.into_iter().map(Some))
    }

    /// Throttles the document `times` times without suggesting a delay.
    pub fn throttle_without_delay(self, id: &str, times: usize) -> Self {
        self.push_throttles(id, std::iter::repeat_n(None, times))
    }

    /// Rejects the document with a non-retryable error.
    pub fn fail(mut self, id: &str) -> Self {
        self.rejected.insert(id.to_string());
        self
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn attempts_for(&self, id: &str) -> usize {
        self.calls.lock().unwrap().iter().filter(|c| c.id == id).count()
    }

    /// Ids of accepted documents in acceptance order.
    pub fn upserted_ids(&self) -> Vec<String> {
        self.upserted
            .lock()
            .unwrap()
            .iter()
            .map(|(_, id)| id.clone())
            .collect()
    }

    pub fn collection_of(&self, id: &str) -> Option<String> {
        self.upserted
            .lock()
            .unwrap()
            .iter()
            .find(|(_, upserted)| upserted == id)
            .map(|(collection, _)| collection.clone())
    }

    /// Highest number of upserts observed in progress at once.
    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent.load(Ordering::SeqCst)
    }

    pub fn reset_concurrency(&self) {
        self.max_concurrent
            .store(self.concurrent.load(Ordering::SeqCst), Ordering::SeqCst);
    }

    fn push_throttles(self, id: &str, responses: impl Iterator<Item = Option<Duration>>) -> Self {
        self.throttles
            .lock()
            .unwrap()
            .entry(id.to_string())
            .or_default()
            .extend(responses);
        self
    }

    fn respond(&self, id: &str) -> Result<(), ScriptedError> {
        if self.rejected.contains(id) {
            return RejectedSnafu { id }.fail();
        }
        let throttle = self
            .throttles
            .lock()
            .unwrap()
            .get_mut(id)
            .and_then(VecDeque::pop_front);
        match throttle {
            Some(retry_after) => ThrottledSnafu { retry_after }.fail(),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl DocumentStore for ScriptedStore {
    type Error = ScriptedError;

    async fn upsert(
        &self,
        collection: &CollectionRef,
        document: &Document,
    ) -> Result<(), ScriptedError> {
        let id = document["id"].as_str().unwrap_or_default().to_string();
        self.calls.lock().unwrap().push(Call {
            id: id.clone(),
            at: Instant::now(),
        });

        let concurrent = self.concurrent.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_concurrent.fetch_max(concurrent, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.concurrent.fetch_sub(1, Ordering::SeqCst);

        self.respond(&id)?;
        self.upserted
            .lock()
            .unwrap()
            .push((collection.collection().to_string(), id));
        Ok(())
    }
}
