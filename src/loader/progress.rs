use std::{sync::Mutex, time::Duration};

use tokio::time::Instant;

use crate::adaptive_concurrency::instant_now;

/// Process-wide load counters.
///
/// Every update goes through one lock, held only for the read-modify-write, so a
/// progress milestone is decided atomically with the increment that reached it.
#[derive(Debug)]
pub struct LoadCounters {
    started: Instant,
    progress_every: u64,
    state: Mutex<CounterState>,
}

#[derive(Debug)]
struct CounterState {
    loaded: u64,
    retries: u64,
    last_milestone: Instant,
}

/// Reached every `progress_every` successful upserts.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Milestone {
    pub loaded: u64,
    pub since_last: Duration,
    pub elapsed: Duration,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CounterSnapshot {
    pub loaded: u64,
    pub retries: u64,
    pub elapsed: Duration,
}

impl LoadCounters {
    pub fn new(progress_every: u64) -> Self {
        let now = instant_now();
        Self {
            started: now,
            progress_every: progress_every.max(1),
            state: Mutex::new(CounterState {
                loaded: 0,
                retries: 0,
                last_milestone: now,
            }),
        }
    }

    pub fn record_success(&self) -> Option<Milestone> {
        let now = instant_now();
        let mut state = self.state.lock().expect("Load counters mutex is poisoned");
        state.loaded += 1;
        if state.loaded % self.progress_every != 0 {
            return None;
        }
        let since_last = now.duration_since(state.last_milestone);
        state.last_milestone = now;
        Some(Milestone {
            loaded: state.loaded,
            since_last,
            elapsed: now.duration_since(self.started),
        })
    }

    pub fn record_retry(&self) {
        self.state
            .lock()
            .expect("Load counters mutex is poisoned")
            .retries += 1;
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        let state = self.state.lock().expect("Load counters mutex is poisoned");
        CounterSnapshot {
            loaded: state.loaded,
            retries: state.retries,
            elapsed: instant_now().duration_since(self.started),
        }
    }
}

/// Formats as `mm:ss`, with an `hh:` prefix once the run passes an hour.
pub fn format_elapsed(elapsed: Duration) -> String {
    let total = elapsed.as_secs();
    let (hours, minutes, seconds) = (total / 3600, (total / 60) % 60, total % 60);
    if hours > 0 {
        format!("{hours:02}:{minutes:02}:{seconds:02}")
    } else {
        format!("{minutes:02}:{seconds:02}")
    }
}
