use metrics::{gauge, histogram};

use super::InternalEvent;

#[derive(Clone, Copy, Debug)]
pub struct ConcurrencyLimitChanged {
    pub limit: usize,
    pub floor: usize,
}

impl InternalEvent for ConcurrencyLimitChanged {
    fn emit(self) {
        gauge!("adaptive_concurrency_limit").set(self.limit as f64);
        gauge!("adaptive_concurrency_floor").set(self.floor as f64);
        info!(
            target: "bulk_loader::throttle",
            concurrency_limit = self.limit,
            floor = self.floor,
            "Limit Adjusted"
        );
    }
}

#[derive(Clone, Copy, Debug)]
pub struct InFlightChanged {
    pub in_flight: usize,
}

impl InternalEvent for InFlightChanged {
    fn emit(self) {
        // Histogram rather than gauge: every value between two scrapes is useful
        // when diagnosing a stalled window.
        histogram!("adaptive_concurrency_in_flight").record(self.in_flight as f64);
        trace!(target: "bulk_loader::throttle", in_flight = self.in_flight, "In-flight Updated");
    }
}
