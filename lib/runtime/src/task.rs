use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, Weak};
use std::task::{Context, Poll, Wake, Waker};

use crate::executor::SimulatorInner;

/// One scheduled unit of execution inside a simulator.
///
/// Waking a task re-admits it to its simulator's ready queue; the run loop
/// takes the future out while polling so a task woken mid-poll is simply
/// re-queued.
pub(crate) struct Task {
    id: u64,
    simulator: Weak<Mutex<SimulatorInner>>,
    future: Mutex<Option<Pin<Box<dyn Future<Output = ()> + Send>>>>,
}

impl Task {
    pub(crate) fn new(
        id: u64,
        simulator: Weak<Mutex<SimulatorInner>>,
        future: Pin<Box<dyn Future<Output = ()> + Send>>,
    ) -> Self {
        Self {
            id,
            simulator,
            future: Mutex::new(Some(future)),
        }
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn take_future(&self) -> Option<Pin<Box<dyn Future<Output = ()> + Send>>> {
        self.future.lock().unwrap().take()
    }

    pub(crate) fn put_future(&self, future: Pin<Box<dyn Future<Output = ()> + Send>>) {
        *self.future.lock().unwrap() = Some(future);
    }
}

impl Wake for Task {
    fn wake(self: Arc<Self>) {
        let Some(simulator) = self.simulator.upgrade() else {
            return;
        };
        let mut inner = simulator.lock().unwrap();
        inner.ready.push_back(self.clone());
    }
}

struct SlotState<T> {
    result: Option<T>,
    done: bool,
    waiters: Vec<Waker>,
}

/// Observer of a spawned task's completion.
///
/// A handle may be cloned and held by any number of waiters; every waiter is
/// resumed with the stored result once the task finishes. `done` transitions
/// false to true exactly once and the result is immutable afterwards.
pub struct TaskHandle<T> {
    slot: Arc<Mutex<SlotState<T>>>,
}

impl<T> Clone for TaskHandle<T> {
    fn clone(&self) -> Self {
        Self {
            slot: self.slot.clone(),
        }
    }
}

impl<T> TaskHandle<T> {
    pub(crate) fn new() -> Self {
        Self {
            slot: Arc::new(Mutex::new(SlotState {
                result: None,
                done: false,
                waiters: Vec::new(),
            })),
        }
    }

    pub(crate) fn complete(&self, value: T) {
        let waiters = {
            let mut state = self.slot.lock().unwrap();
            assert!(!state.done, "task completed twice");
            state.result = Some(value);
            state.done = true;
            std::mem::take(&mut state.waiters)
        };
        for waker in waiters {
            waker.wake();
        }
    }

    /// Whether the task has finished.
    pub fn done(&self) -> bool {
        self.slot.lock().unwrap().done
    }

    /// The task's result; `None` until the task finishes.
    pub fn result(&self) -> Option<T>
    where
        T: Clone,
    {
        self.slot.lock().unwrap().result.clone()
    }

    /// Take the result when done, or park the caller's waker.
    pub(crate) fn observe(&self, cx: &mut Context<'_>) -> Option<T>
    where
        T: Clone,
    {
        let mut state = self.slot.lock().unwrap();
        if state.done {
            state.result.clone()
        } else {
            state.waiters.push(cx.waker().clone());
            None
        }
    }
}

impl<T: Clone> Future for TaskHandle<T> {
    type Output = T;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match self.observe(cx) {
            Some(value) => Poll::Ready(value),
            None => Poll::Pending,
        }
    }
}
