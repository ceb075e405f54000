use std::sync::{
    Arc, Mutex,
    atomic::{AtomicUsize, Ordering},
};

use tokio::sync::OwnedSemaphorePermit;

use super::{
    LoaderSettings, floor_for,
    internal_event::{ConcurrencyLimitChanged, InFlightChanged, InternalEvent},
    semaphore::ShrinkableSemaphore,
};

/// Admission gate bounding how many batches are loaded at the same time.
///
/// The ceiling starts at `max_loaders` and is lowered by one for every throttling
/// response a worker observes, never below the floor. Lowering the ceiling while
/// every slot is taken does not interrupt anyone: the next released slot is
/// retired instead of being handed out, so admission waits out the excess.
pub struct ConcurrencyWindow {
    semaphore: Arc<ShrinkableSemaphore>,
    state: Mutex<WindowState>,
    in_flight: AtomicUsize,
    ceiling: usize,
    floor: usize,
    recover_after: Option<u64>,
}

#[derive(Debug)]
struct WindowState {
    current_max: usize,
    successes_since_change: u64,
}

/// A slot in the window. Dropping it releases the slot.
#[derive(Debug)]
#[must_use = "dropping the permit releases the slot immediately"]
pub struct AdmissionPermit {
    _permit: OwnedSemaphorePermit,
    window: Arc<ConcurrencyWindow>,
}

impl ConcurrencyWindow {
    /// A one-way window starting at `max_loaders` (raised to at least 3).
    pub fn new(max_loaders: usize) -> Arc<Self> {
        Self::from_settings(&LoaderSettings::builder().max_loaders(max_loaders).build())
    }

    pub fn from_settings(settings: &LoaderSettings) -> Arc<Self> {
        let ceiling = settings.max_loaders();
        let floor = floor_for(ceiling);
        ConcurrencyLimitChanged {
            limit: ceiling,
            floor,
        }
        .emit();

        Arc::new(Self {
            semaphore: Arc::new(ShrinkableSemaphore::new(ceiling)),
            state: Mutex::new(WindowState {
                current_max: ceiling,
                successes_since_change: 0,
            }),
            in_flight: AtomicUsize::new(0),
            ceiling,
            floor,
            recover_after: settings.recover_after(),
        })
    }

    /// Takes a slot if one is free right now.
    pub fn try_admit(self: &Arc<Self>) -> Option<AdmissionPermit> {
        let permit = self.semaphore.try_acquire()?;
        Some(self.track(permit))
    }

    /// Waits until a slot is free and takes it.
    ///
    /// Waiters are served in arrival order.
    pub async fn admit(self: &Arc<Self>) -> AdmissionPermit {
        let permit = Arc::clone(&self.semaphore).acquire().await;
        self.track(permit)
    }

    /// Lowers the ceiling by one.
    ///
    /// Returns `false` without changing anything when the ceiling already sits at
    /// the floor.
    pub fn shrink(&self) -> bool {
        let mut state = self.lock_state();
        if state.current_max <= self.floor {
            return false;
        }
        state.current_max -= 1;
        state.successes_since_change = 0;
        self.semaphore.forget_permits(1);
        let limit = state.current_max;
        drop(state);

        ConcurrencyLimitChanged {
            limit,
            floor: self.floor,
        }
        .emit();
        true
    }

    /// Records a successful upsert. With recovery enabled, enough consecutive
    /// successes raise the ceiling by one, up to its initial value.
    pub fn record_success(&self) {
        let Some(recover_after) = self.recover_after else {
            return;
        };
        let mut state = self.lock_state();
        if state.current_max >= self.ceiling {
            return;
        }
        state.successes_since_change += 1;
        if state.successes_since_change < recover_after {
            return;
        }
        state.current_max += 1;
        state.successes_since_change = 0;
        self.semaphore.add_permits(1);
        let limit = state.current_max;
        drop(state);

        ConcurrencyLimitChanged {
            limit,
            floor: self.floor,
        }
        .emit();
    }

    /// Current ceiling.
    pub fn current(&self) -> usize {
        self.lock_state().current_max
    }

    pub fn floor(&self) -> usize {
        self.floor
    }

    /// Ceiling at the start of the run.
    pub fn ceiling(&self) -> usize {
        self.ceiling
    }

    /// Slots currently held.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    fn track(self: &Arc<Self>, permit: OwnedSemaphorePermit) -> AdmissionPermit {
        let in_flight = self.in_flight.fetch_add(1, Ordering::AcqRel) + 1;
        InFlightChanged { in_flight }.emit();
        AdmissionPermit {
            _permit: permit,
            window: Arc::clone(self),
        }
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, WindowState> {
        self.state.lock().expect("Concurrency window mutex is poisoned")
    }
}

impl Drop for AdmissionPermit {
    fn drop(&mut self) {
        let in_flight = self.window.in_flight.fetch_sub(1, Ordering::AcqRel) - 1;
        InFlightChanged { in_flight }.emit();
    }
}

impl std::fmt::Debug for ConcurrencyWindow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConcurrencyWindow")
            .field("current_max", &self.current())
            .field("floor", &self.floor)
            .field("ceiling", &self.ceiling)
            .field("in_flight", &self.in_flight())
            .finish()
    }
}
