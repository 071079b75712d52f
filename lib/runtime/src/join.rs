use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use crate::task::TaskHandle;

/// Fan-in wait over several task handles.
///
/// Resolves to the children's results in handle order, independent of the
/// order the children finish in. `remaining` decreases by exactly one per
/// child completion; a barrier over zero handles resolves on its first poll,
/// before virtual time moves.
pub struct JoinBarrier<T> {
    children: Vec<TaskHandle<T>>,
    results: Vec<Option<T>>,
    remaining: usize,
}

/// Wait for every handle in `handles` and collect their results in order.
pub fn join_all<T>(handles: Vec<TaskHandle<T>>) -> JoinBarrier<T> {
    let remaining = handles.len();
    let results = (0..remaining).map(|_| None).collect();
    JoinBarrier {
        children: handles,
        results,
        remaining,
    }
}

// `JoinBarrier` never pin-projects to its fields (it is driven through
// `get_mut`), so it is safe to treat as unconditionally `Unpin`.
impl<T> Unpin for JoinBarrier<T> {}

impl<T: Clone> Future for JoinBarrier<T> {
    type Output = Vec<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        for (i, child) in this.children.iter().enumerate() {
            if this.results[i].is_some() {
                continue;
            }
            if let Some(value) = child.observe(cx) {
                this.results[i] = Some(value);
                this.remaining -= 1;
            }
        }

        if this.remaining == 0 {
            Poll::Ready(this.results.iter_mut().map(|r| r.take().unwrap()).collect())
        } else {
            Poll::Pending
        }
    }
}
