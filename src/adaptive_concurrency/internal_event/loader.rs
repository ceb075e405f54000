use std::time::Duration;

use metrics::{counter, histogram};

use super::InternalEvent;

#[derive(Debug)]
pub struct BatchDispatched<'a> {
    pub collection: &'a str,
    pub sequence: usize,
    pub size: usize,
    pub concurrency_limit: usize,
}

impl InternalEvent for BatchDispatched<'_> {
    fn emit(self) {
        counter!("bulk_loader_batches_dispatched_total").increment(1);
        histogram!("bulk_loader_batch_size").record(self.size as f64);
        debug!(
            collection = self.collection,
            sequence = self.sequence,
            size = self.size,
            concurrency_limit = self.concurrency_limit,
            "Batch dispatched."
        );
    }
}

#[derive(Debug)]
pub struct BatchCompleted<'a> {
    pub collection: &'a str,
    pub sequence: usize,
    pub size: usize,
    pub elapsed: Duration,
}

impl InternalEvent for BatchCompleted<'_> {
    fn emit(self) {
        counter!("bulk_loader_batches_completed_total").increment(1);
        histogram!("bulk_loader_batch_duration_seconds").record(self.elapsed);
        debug!(
            collection = self.collection,
            sequence = self.sequence,
            size = self.size,
            elapsed_ms = self.elapsed.as_millis(),
            "Batch completed."
        );
    }
}

#[derive(Clone, Copy, Debug)]
pub struct DocumentUpserted;

impl InternalEvent for DocumentUpserted {
    fn emit(self) {
        counter!("bulk_loader_documents_loaded_total").increment(1);
    }
}

#[derive(Debug)]
pub struct DocumentDropped<'a> {
    pub line_number: usize,
    pub error: &'a serde_json::Error,
}

impl InternalEvent for DocumentDropped<'_> {
    fn emit(self) {
        counter!("bulk_loader_documents_dropped_total").increment(1);
        debug!(
            line_number = self.line_number,
            error = %self.error,
            "Dropping line that looked like a document but did not decode."
        );
    }
}

#[derive(Debug)]
pub struct UpsertThrottled<'a> {
    pub collection: &'a str,
    pub attempt: usize,
    pub retry_after: Duration,
    pub shrunk_to: Option<usize>,
}

impl InternalEvent for UpsertThrottled<'_> {
    fn emit(self) {
        counter!("bulk_loader_throttled_total").increment(1);
        histogram!("bulk_loader_retry_after_seconds").record(self.retry_after);
        warn!(
            target: "bulk_loader::throttle",
            collection = self.collection,
            attempt = self.attempt,
            retry_after_ms = self.retry_after.as_millis(),
            shrunk_to = ?self.shrunk_to,
            "Upsert throttled; retrying the same document."
        );
    }
}

#[derive(Clone, Copy, Debug)]
pub struct LoadProgress {
    pub loaded: u64,
    pub concurrency_limit: usize,
    pub since_last: Duration,
    pub elapsed: Duration,
}

impl InternalEvent for LoadProgress {
    fn emit(self) {
        info!(
            target: "bulk_loader::progress",
            loaded = self.loaded,
            concurrency_limit = self.concurrency_limit,
            "{}\t{}\t{:.2}\t{}",
            self.loaded,
            self.concurrency_limit,
            self.since_last.as_secs_f64(),
            crate::loader::progress::format_elapsed(self.elapsed),
        );
    }
}
