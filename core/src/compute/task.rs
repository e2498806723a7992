use std::future::Future;
use std::pin::Pin;
use std::sync::mpsc;
use std::task::{Context, Poll};

/// Handle to the result of work running somewhere else.
///
/// Render stages and GPU payloads are built on worker threads while the
/// submission thread keeps consuming earlier work. The submission side only
/// ever needs to ask "is it done yet?" without blocking, so the result is
/// delivered over a channel and checked with [`try_take`](Self::try_take)
/// or by polling the handle as a [`Future`] with a noop waker.
///
/// # Example
///
/// ```
/// use umbra_core::compute::TaskHandle;
///
/// let (mut handle, completer) = TaskHandle::<u32>::pending();
/// assert!(!handle.is_ready());
/// completer.complete(7);
/// assert_eq!(handle.wait(), Some(7));
/// ```
pub struct TaskHandle<T> {
    receiver: mpsc::Receiver<T>,
    taken: Option<T>,
}

/// Sending half of a [`TaskHandle`].
pub struct TaskCompleter<T> {
    sender: mpsc::Sender<T>,
}

impl<T> TaskCompleter<T> {
    /// Deliver the result. Later calls are ignored by the handle.
    pub fn complete(self, value: T) {
        // The handle may already be gone (pipeline terminated).
        let _ = self.sender.send(value);
    }
}

impl<T: Send + 'static> TaskHandle<T> {
    /// Run `work` on a new worker thread.
    pub fn spawn<F>(name: &str, work: F) -> Self
    where
        F: FnOnce() -> T + Send + 'static,
    {
        let (handle, completer) = Self::pending();
        let thread_name = name.to_string();
        let spawned = std::thread::Builder::new()
            .name(thread_name.clone())
            .spawn(move || {
                crate::set_thread_name!("stage builder");
                completer.complete(work());
            });
        if let Err(err) = spawned {
            log::warn!("failed to spawn worker '{thread_name}': {err}");
        }
        handle
    }
}

impl<T> TaskHandle<T> {
    /// Create a handle together with the completer that resolves it.
    pub fn pending() -> (Self, TaskCompleter<T>) {
        let (sender, receiver) = mpsc::channel();
        (
            Self {
                receiver,
                taken: None,
            },
            TaskCompleter { sender },
        )
    }

    /// A handle that is already resolved.
    pub fn ready(value: T) -> Self {
        let (handle, completer) = Self::pending();
        completer.complete(value);
        handle
    }

    fn fetch(&mut self) -> bool {
        if self.taken.is_none() {
            self.taken = self.receiver.try_recv().ok();
        }
        self.taken.is_some()
    }

    /// Non-blocking readiness check. Does not consume the value.
    pub fn is_ready(&mut self) -> bool {
        self.fetch()
    }

    /// Returns `true` if the producer went away without delivering a value.
    pub fn is_abandoned(&mut self) -> bool {
        !self.fetch() && matches!(self.receiver.try_recv(), Err(mpsc::TryRecvError::Disconnected))
    }

    /// Take the result if it is available, without blocking.
    pub fn try_take(&mut self) -> Option<T> {
        self.fetch();
        self.taken.take()
    }

    /// Blocks until the result arrives.
    ///
    /// Returns `None` if the producer was dropped without completing.
    pub fn wait(mut self) -> Option<T> {
        match self.taken.take() {
            Some(value) => Some(value),
            None => self.receiver.recv().ok(),
        }
    }
}

impl<T> Unpin for TaskHandle<T> {}

impl<T> Future for TaskHandle<T> {
    type Output = Option<T>;

    fn poll(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Option<T>> {
        if let Some(value) = self.taken.take() {
            return Poll::Ready(Some(value));
        }
        match self.receiver.try_recv() {
            Ok(val) => Poll::Ready(Some(val)),
            Err(mpsc::TryRecvError::Empty) => Poll::Pending,
            Err(mpsc::TryRecvError::Disconnected) => Poll::Ready(None),
        }
    }
}
