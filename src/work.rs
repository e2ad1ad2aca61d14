// Background work queue for blocking jobs (log writes, entity teardown).
//
// Jobs run one at a time on a dedicated thread so the connection loops never
// wait on disk. Every job gets a cancellation token it is expected to poll.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

type Job = Box<dyn FnOnce(&CancellationToken) + Send + 'static>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Pending,
    Running,
    Finished,
    /// Cancelled before it started.
    Skipped,
}

struct TaskShared {
    token: CancellationToken,
    status: Mutex<TaskStatus>,
    done: Condvar,
}

impl TaskShared {
    fn set(&self, status: TaskStatus) {
        *self.status.lock() = status;
        if matches!(status, TaskStatus::Finished | TaskStatus::Skipped) {
            self.done.notify_all();
        }
    }
}

/// Handle to a submitted job.
#[derive(Clone)]
pub struct TaskHandle {
    shared: Arc<TaskShared>,
}

impl TaskHandle {
    /// Requests cooperative cancellation. A job that has not started yet is skipped.
    pub fn cancel(&self) {
        self.shared.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.shared.token.is_cancelled()
    }

    pub fn status(&self) -> TaskStatus {
        *self.shared.status.lock()
    }

    pub fn is_finished(&self) -> bool {
        matches!(self.status(), TaskStatus::Finished | TaskStatus::Skipped)
    }

    /// Waits up to `timeout` for the job to end. Returns false on timeout.
    pub fn join(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut status = self.shared.status.lock();
        loop {
            match *status {
                TaskStatus::Finished | TaskStatus::Skipped => return true,
                // Will be skipped by the worker; nothing left to wait for.
                TaskStatus::Pending if self.shared.token.is_cancelled() => return true,
                _ => {}
            }
            if self.shared.done.wait_until(&mut status, deadline).timed_out() {
                return matches!(*status, TaskStatus::Finished | TaskStatus::Skipped);
            }
        }
    }
}

struct Submission {
    job: Job,
    shared: Arc<TaskShared>,
}

pub struct WorkQueue {
    sender: Mutex<Option<mpsc::UnboundedSender<Submission>>>,
    worker: Mutex<Option<thread::JoinHandle<()>>>,
}

impl WorkQueue {
    pub fn new(name: &str) -> std::io::Result<Self> {
        let (sender, receiver) = mpsc::unbounded_channel();
        let worker = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || run_worker(receiver))?;
        Ok(Self {
            sender: Mutex::new(Some(sender)),
            worker: Mutex::new(Some(worker)),
        })
    }

    pub fn submit<F>(&self, job: F) -> TaskHandle
    where
        F: FnOnce(&CancellationToken) + Send + 'static,
    {
        let shared = Arc::new(TaskShared {
            token: CancellationToken::new(),
            status: Mutex::new(TaskStatus::Pending),
            done: Condvar::new(),
        });
        let handle = TaskHandle {
            shared: Arc::clone(&shared),
        };
        let submission = Submission {
            job: Box::new(job),
            shared,
        };
        let rejected = match self.sender.lock().as_ref() {
            Some(sender) => sender.send(submission).err().map(|e| e.0),
            None => Some(submission),
        };
        if let Some(submission) = rejected {
            warn!("Work queue is shut down, job dropped");
            submission.shared.token.cancel();
            submission.shared.set(TaskStatus::Skipped);
        }
        handle
    }

    /// Waits until every job submitted so far has ended.
    pub fn flush(&self, timeout: Duration) -> bool {
        self.submit(|_| {}).join(timeout)
    }

    /// Stops accepting jobs and waits for the queued ones to drain.
    pub fn shutdown(&self) {
        self.sender.lock().take();
        if let Some(worker) = self.worker.lock().take() {
            if worker.join().is_err() {
                error!("Work queue thread panicked");
            }
        }
    }
}

impl Drop for WorkQueue {
    fn drop(&mut self) {
        // The worker exits on its own once the channel closes.
        self.sender.lock().take();
    }
}

fn run_worker(mut receiver: mpsc::UnboundedReceiver<Submission>) {
    while let Some(Submission { job, shared }) = receiver.blocking_recv() {
        if shared.token.is_cancelled() {
            shared.set(TaskStatus::Skipped);
            continue;
        }
        shared.set(TaskStatus::Running);
        let token = shared.token.clone();
        if panic::catch_unwind(AssertUnwindSafe(|| job(&token))).is_err() {
            error!("Background job panicked");
        }
        shared.set(TaskStatus::Finished);
    }
    debug!("Work queue drained");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_jobs_run_in_order() {
        let queue = WorkQueue::new("test-work").unwrap();
        let log = Arc::new(Mutex::new(Vec::new()));
        for i in 0..5 {
            let log = Arc::clone(&log);
            queue.submit(move |_| log.lock().push(i));
        }
        assert!(queue.flush(Duration::from_secs(5)));
        assert_eq!(*log.lock(), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_cancelled_pending_job_is_skipped() {
        let queue = WorkQueue::new("test-work").unwrap();
        let gate = Arc::new((std::sync::Mutex::new(false), std::sync::Condvar::new()));
        let blocker = {
            let gate = Arc::clone(&gate);
            queue.submit(move |_| {
                let (lock, cvar) = &*gate;
                let mut open = lock.lock().unwrap();
                while !*open {
                    open = cvar.wait(open).unwrap();
                }
            })
        };
        let ran = Arc::new(AtomicUsize::new(0));
        let victim = {
            let ran = Arc::clone(&ran);
            queue.submit(move |_| {
                ran.fetch_add(1, Ordering::SeqCst);
            })
        };
        victim.cancel();
        assert!(victim.join(Duration::from_millis(10)));

        *gate.0.lock().unwrap() = true;
        gate.1.notify_all();
        assert!(blocker.join(Duration::from_secs(5)));
        assert!(queue.flush(Duration::from_secs(5)));
        assert_eq!(ran.load(Ordering::SeqCst), 0);
        assert_eq!(victim.status(), TaskStatus::Skipped);
    }

    #[test]
    fn test_running_job_observes_cancellation() {
        let queue = WorkQueue::new("test-work").unwrap();
        let handle = queue.submit(|token| {
            let start = Instant::now();
            while !token.is_cancelled() && start.elapsed() < Duration::from_secs(5) {
                thread::sleep(Duration::from_millis(1));
            }
        });
        while handle.status() == TaskStatus::Pending {
            thread::sleep(Duration::from_millis(1));
        }
        handle.cancel();
        assert!(handle.join(Duration::from_secs(1)));
    }

    #[test]
    fn test_panicking_job_does_not_kill_worker() {
        let queue = WorkQueue::new("test-work").unwrap();
        queue.submit(|_| panic!("boom"));
        let ran = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&ran);
        queue.submit(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert!(queue.flush(Duration::from_secs(5)));
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_submit_after_shutdown() {
        let queue = WorkQueue::new("test-work").unwrap();
        queue.shutdown();
        let handle = queue.submit(|_| {});
        assert_eq!(handle.status(), TaskStatus::Skipped);
    }
}
