//! Cooperative task primitives.
//!
//! - [`TaskHandle`] - channel-backed future for work built on another thread
//! - [`WorkerPool`] - long-lived worker threads resolving [`TaskHandle`]s
//! - [`poll_once`] - non-blocking single poll with a noop waker

mod task;
mod worker_pool;

pub use task::{TaskCompleter, TaskHandle};
pub use worker_pool::{default_thread_count, WorkerPool};

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll, RawWaker, RawWakerVTable, Waker};

fn noop_waker() -> Waker {
    fn noop(_: *const ()) {}
    fn clone(p: *const ()) -> RawWaker {
        RawWaker::new(p, &VTABLE)
    }
    static VTABLE: RawWakerVTable = RawWakerVTable::new(clone, noop, noop, noop);
    // SAFETY: every vtable entry ignores the data pointer.
    unsafe { Waker::from_raw(RawWaker::new(std::ptr::null(), &VTABLE)) }
}

/// Poll a future exactly once without registering for wake-ups.
///
/// Callers are expected to poll again on their next tick.
pub fn poll_once<F: Future + Unpin>(future: &mut F) -> Poll<F::Output> {
    let waker = noop_waker();
    let mut cx = Context::from_waker(&waker);
    Pin::new(future).poll(&mut cx)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn poll_once_on_pending_and_ready() {
        let (mut handle, completer) = TaskHandle::<&str>::pending();
        assert!(poll_once(&mut handle).is_pending());
        completer.complete("done");
        assert_eq!(poll_once(&mut handle), Poll::Ready(Some("done")));
    }
}
