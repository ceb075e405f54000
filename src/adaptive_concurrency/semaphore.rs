// A semaphore whose permit count can be lowered while permits are held.
//
// `tokio::sync::Semaphore` can only forget permits it currently owns. When every
// permit is checked out, the forget is recorded as debt and paid by the next
// permit any acquirer receives.

use std::{
    future::Future,
    mem::replace,
    pin::Pin,
    sync::{Arc, Mutex},
    task::{Context, Poll, ready},
};

use pin_project::pin_project;
use tokio::sync::{AcquireError, OwnedSemaphorePermit, Semaphore};

pub(super) struct ShrinkableSemaphore {
    semaphore: Arc<Semaphore>,
    to_forget: Mutex<usize>,
}

impl ShrinkableSemaphore {
    pub(super) fn new(size: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(size)),
            to_forget: Mutex::new(0),
        }
    }

    pub(super) fn acquire(
        self: Arc<Self>,
    ) -> impl Future<Output = OwnedSemaphorePermit> + Send + 'static {
        MaybeForgetFuture {
            future: Box::pin(Arc::clone(&self.semaphore).acquire_owned()),
            master: self,
        }
    }

    pub(super) fn try_acquire(&self) -> Option<OwnedSemaphorePermit> {
        let mut to_forget = self.to_forget.lock().expect("Shrinkable semaphore mutex is poisoned");
        while *to_forget > 0 {
            let permit = Arc::clone(&self.semaphore).try_acquire_owned().ok()?;
            permit.forget();
            *to_forget -= 1;
        }
        Arc::clone(&self.semaphore).try_acquire_owned().ok()
    }

    pub(super) fn forget_permits(&self, count: usize) {
        // Permits that are checked out cannot be forgotten yet; record them as debt.
        let mut to_forget = self.to_forget.lock().expect("Shrinkable semaphore mutex is poisoned");
        for _ in 0..count {
            match Arc::clone(&self.semaphore).try_acquire_owned() {
                Ok(permit) => permit.forget(),
                Err(_) => *to_forget += 1,
            }
        }
    }

    pub(super) fn add_permits(&self, count: usize) {
        let mut to_forget = self.to_forget.lock().expect("Shrinkable semaphore mutex is poisoned");
        if count > *to_forget {
            self.semaphore.add_permits(count - *to_forget);
            *to_forget = 0;
        } else {
            *to_forget -= count;
        }
    }
}

type AcquireFuture =
    Pin<Box<dyn Future<Output = Result<OwnedSemaphorePermit, AcquireError>> + Send + 'static>>;

#[pin_project]
struct MaybeForgetFuture {
    master: Arc<ShrinkableSemaphore>,
    future: AcquireFuture,
}

impl Future for MaybeForgetFuture {
    type Output = OwnedSemaphorePermit;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();
        let master = Arc::clone(this.master);
        let mut to_forget = master
            .to_forget
            .lock()
            .expect("Shrinkable semaphore mutex is poisoned");
        while *to_forget > 0 {
            let permit = ready!(this.future.as_mut().poll(cx))
                .expect("Shrinkable semaphore is never closed");
            permit.forget();
            *to_forget -= 1;
            let future = Arc::clone(&master.semaphore).acquire_owned();
            drop(replace(this.future, Box::pin(future)));
        }
        this.future
            .as_mut()
            .poll(cx)
            .map(|result| result.expect("Shrinkable semaphore is never closed"))
    }
}
