use std::cell::Cell;
use std::collections::{BTreeMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, Waker};

use crate::task::{Task, TaskHandle};
use crate::{Deadline, Duration, Instant};

/// Tie-break priority for events firing at the same instant. Lower fires first.
pub const DEFAULT_PRIORITY: u32 = 10;

/// Key of a pending wake-up event.
///
/// Events are totally ordered by (instant, priority, registration sequence),
/// so same-instant wake-ups fire by priority and ties stay FIFO.
#[derive(PartialEq, Eq, PartialOrd, Ord, Clone, Copy, Debug)]
struct EventKey {
    fire_at: Instant,
    priority: u32,
    seq: u64,
}

/// A timed suspension of the current task.
///
/// The wake-up always travels through the simulator's event queue, even for
/// zero cycles, so that resumption happens in a fresh scheduling round of the
/// same instant.
pub struct Delay {
    sim: Simulator,
    fire_at: Instant,
    priority: u32,
    key: Option<EventKey>,
}

impl Future for Delay {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let mut inner = this.sim.0.lock().unwrap();

        match this.key {
            Some(key) => {
                if inner.now >= this.fire_at {
                    // To prevent mistaken elapse into the past.
                    debug_assert_eq!(inner.now, this.fire_at);
                    inner.events.remove(&key);
                    this.key = None;
                    Poll::Ready(())
                } else {
                    // Re-polled before firing; refresh the stored waker.
                    inner.events.insert(key, cx.waker().clone());
                    Poll::Pending
                }
            }
            None => {
                let key = EventKey {
                    fire_at: this.fire_at,
                    priority: this.priority,
                    seq: inner.next_seq(),
                };
                inner.events.insert(key, cx.waker().clone());
                this.key = Some(key);
                Poll::Pending
            }
        }
    }
}

impl Drop for Delay {
    fn drop(&mut self) {
        if let Some(key) = self.key {
            let mut inner = self.sim.0.lock().unwrap();
            inner.events.remove(&key);
        }
    }
}

/// Re-admits the current task at the back of the ready queue without moving
/// virtual time, opening a new zero-time scheduling round.
pub struct YieldNow {
    yielded: bool,
}

pub fn yield_now() -> YieldNow {
    YieldNow { yielded: false }
}

impl Future for YieldNow {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if self.yielded {
            Poll::Ready(())
        } else {
            self.get_mut().yielded = true;
            cx.waker().wake_by_ref();
            Poll::Pending
        }
    }
}

pub(crate) struct SimulatorInner {
    now: Instant,
    pub(crate) ready: VecDeque<Arc<Task>>,
    events: BTreeMap<EventKey, Waker>,
    seq: u64,
    next_task_id: u64,
}

impl SimulatorInner {
    fn next_seq(&mut self) -> u64 {
        self.seq += 1;
        self.seq
    }
}

/// A virtual-time discrete-event scheduler for cooperative hardware models.
#[derive(Clone)]
pub struct Simulator(pub(crate) Arc<Mutex<SimulatorInner>>);

thread_local! {
    static CURRENT: Cell<Option<Simulator>> = const { Cell::new(None) };
}

impl Default for Simulator {
    fn default() -> Self {
        Self::new()
    }
}

impl Simulator {
    /// Create a new simulator at `Instant::INIT`.
    pub fn new() -> Self {
        Self(Arc::new(Mutex::new(SimulatorInner {
            now: Instant::INIT,
            ready: VecDeque::new(),
            events: BTreeMap::new(),
            seq: 0,
            next_task_id: 0,
        })))
    }

    /// Obtain the simulator associated with the currently running task.
    pub fn current() -> Self {
        CURRENT.with(|x| {
            let v = x.take();
            x.set(v.clone());
            v.unwrap()
        })
    }

    /// Return the simulation instant this simulator is at.
    pub fn now(&self) -> Instant {
        self.0.lock().unwrap().now
    }

    /// A suspension of `cycles` cycles with the default tie-break priority.
    pub fn delay(&self, cycles: u64) -> Delay {
        self.delay_with_priority(cycles, DEFAULT_PRIORITY)
    }

    /// A suspension of `cycles` cycles with an explicit tie-break priority.
    /// Among events firing at the same instant, lower priority values resume
    /// first.
    pub fn delay_with_priority(&self, cycles: u64, priority: u32) -> Delay {
        Delay {
            sim: self.clone(),
            fire_at: self.now() + Duration::from_cycles(cycles),
            priority,
            key: None,
        }
    }

    /// A suspension resolved at an absolute instant or after a duration.
    pub fn resolve_at(&self, fire_at: impl Deadline) -> Delay {
        Delay {
            sim: self.clone(),
            fire_at: fire_at.to_instant(self.now()),
            priority: DEFAULT_PRIORITY,
            key: None,
        }
    }

    /// Start a new task at the current instant.
    ///
    /// The task is admitted to the ready queue immediately; the returned
    /// handle observes its completion and carries its result to any number of
    /// waiters.
    pub fn spawn<F>(&self, future: F) -> TaskHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let handle = TaskHandle::new();
        let completion = handle.clone();
        let wrapped = async move {
            completion.complete(future.await);
        };

        let mut inner = self.0.lock().unwrap();
        let id = inner.next_task_id;
        inner.next_task_id += 1;
        log::trace!("task {id} spawned at t={:?}", inner.now);
        let task = Arc::new(Task::new(id, Arc::downgrade(&self.0), Box::pin(wrapped)));
        inner.ready.push_back(task);
        handle
    }

    /// Run until no work remains.
    pub async fn run(&self) {
        self.run_until(Instant::ETERNITY).await;
    }

    /// Run until no work remains or the next event would fire past `deadline`.
    ///
    /// A paused run leaves all pending events in place and can be resumed by
    /// calling `run_until` again with a later deadline.
    pub async fn run_until(&self, deadline: Instant) {
        let mut guard = self.0.lock().unwrap();
        log::debug!("simulation running from t={:?}", guard.now);

        loop {
            // Scheduling rounds: settle every task admitted for the current
            // instant, including tasks the settling itself wakes up.
            while let Some(task) = guard.ready.pop_front() {
                drop(guard);
                self.poll_task(&task).await;
                guard = self.0.lock().unwrap();
            }

            let Some((&key, _)) = guard.events.first_key_value() else {
                log::debug!("simulation finished at t={:?}, no pending events", guard.now);
                return;
            };
            if key.fire_at > deadline {
                log::debug!(
                    "simulation paused at t={:?}, next event at t={:?}",
                    guard.now,
                    key.fire_at
                );
                return;
            }

            // Time never goes backwards.
            assert!(key.fire_at >= guard.now);
            guard.now = key.fire_at;

            // Fire every event of this exact instant together, in priority
            // then registration order.
            while let Some((&k, _)) = guard.events.first_key_value() {
                if k.fire_at > guard.now {
                    break;
                }
                let waker = guard.events.remove(&k).unwrap();
                drop(guard);
                waker.wake();
                guard = self.0.lock().unwrap();
            }
        }
    }

    async fn poll_task(&self, task: &Arc<Task>) {
        // A task woken several times sits in the ready queue more than once;
        // only the first pop finds its future.
        let Some(mut future) = task.take_future() else {
            return;
        };
        let waker = Waker::from(task.clone());
        let mut cx = Context::from_waker(&waker);

        let poll = tokio::task::unconstrained(std::future::poll_fn(|_| {
            CURRENT.with(|current| {
                assert!(current.replace(Some(self.clone())).is_none());
                let ret = future.as_mut().poll(&mut cx);
                current.set(None);
                Poll::Ready(ret)
            })
        }))
        .await;

        if poll.is_pending() {
            task.put_future(future);
        } else {
            log::trace!("task {} finished at t={:?}", task.id(), self.now());
        }
    }
}
