use std::thread::JoinHandle;

use crossbeam_channel::{unbounded, Sender};

use super::TaskHandle;

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Long-lived worker threads fed from one shared job queue.
///
/// Unlike [`TaskHandle::spawn`], which starts a thread per task, the pool
/// keeps its threads for its whole lifetime, so building a few render
/// stages per frame costs a channel send instead of a thread start.
///
/// Dropping the pool lets queued jobs finish and joins the workers.
///
/// # Example
///
/// ```
/// use umbra_core::compute::WorkerPool;
///
/// let pool = WorkerPool::new("example", 2);
/// let handle = pool.spawn(|| 6 * 7);
/// assert_eq!(handle.wait(), Some(42));
/// ```
pub struct WorkerPool {
    sender: Option<Sender<Job>>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Start `num_threads` workers (at least one) named `"{name} {index}"`.
    pub fn new(name: &str, num_threads: usize) -> Self {
        let (sender, receiver) = unbounded::<Job>();
        let workers = (0..num_threads.max(1))
            .filter_map(|index| {
                let receiver = receiver.clone();
                let spawned = std::thread::Builder::new()
                    .name(format!("{name} {index}"))
                    .spawn(move || {
                        crate::set_thread_name!("umbra worker");
                        for job in receiver {
                            job();
                        }
                    });
                match spawned {
                    Ok(handle) => Some(handle),
                    Err(err) => {
                        log::warn!("failed to spawn worker '{name} {index}': {err}");
                        None
                    }
                }
            })
            .collect::<Vec<_>>();
        log::debug!("Worker pool '{name}' started {} threads", workers.len());
        Self {
            sender: Some(sender),
            workers,
        }
    }

    /// A pool sized to the number of available CPU cores.
    pub fn default_threads(name: &str) -> Self {
        Self::new(name, default_thread_count())
    }

    /// Number of running workers.
    pub fn num_threads(&self) -> usize {
        self.workers.len()
    }

    /// Queue `work` and return a handle to its result.
    ///
    /// Runs `work` on the calling thread if no worker could be started.
    pub fn spawn<T, F>(&self, work: F) -> TaskHandle<T>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let (handle, completer) = TaskHandle::pending();
        let job: Job = Box::new(move || completer.complete(work()));
        match &self.sender {
            Some(sender) => {
                if let Err(err) = sender.send(job) {
                    (err.into_inner())();
                }
            }
            None => job(),
        }
        handle
    }
}

/// Available parallelism, at least one.
pub fn default_thread_count() -> usize {
    std::thread::available_parallelism().map_or(1, |n| n.get())
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        // Closing the queue ends every worker loop once it is drained.
        self.sender.take();
        let current = std::thread::current().id();
        for worker in self.workers.drain(..) {
            // The last owner may be a job running on one of the workers.
            if worker.thread().id() != current {
                let _ = worker.join();
            }
        }
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("num_threads", &self.workers.len())
            .finish()
    }
}
