//! The engine's event loop: one worker thread running posted jobs in due
//! order. Every reconciliation step happens on this thread, so passes
//! triggered by different sources never run concurrently.

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{select, unbounded, Receiver, Sender};
use parking_lot::{Condvar, Mutex};
use tracing::{debug, warn};

type Job = Box<dyn FnOnce() + Send>;

const IDLE_WAIT: Duration = Duration::from_secs(3600);

struct Timed {
    due: Instant,
    seq: u64,
    job: Job,
}

impl PartialEq for Timed {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.seq == other.seq
    }
}

impl Eq for Timed {}

impl PartialOrd for Timed {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Timed {
    // reversed: the heap pops the earliest due job first
    fn cmp(&self, other: &Self) -> CmpOrdering {
        (other.due, other.seq).cmp(&(self.due, self.seq))
    }
}

#[derive(Default)]
struct Shared {
    pending: AtomicUsize,
    seq: AtomicU64,
    idle: Mutex<()>,
    settled: Condvar,
}

/// Cloneable posting side of a [`Scheduler`].
#[derive(Clone)]
pub struct SchedulerHandle {
    jobs: Sender<Timed>,
    shared: Arc<Shared>,
}

impl SchedulerHandle {
    pub fn post<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.post_after(Duration::ZERO, job);
    }

    pub fn post_after<F>(&self, delay: Duration, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.shared.pending.fetch_add(1, Ordering::SeqCst);
        let timed = Timed {
            due: Instant::now() + delay,
            seq: self.shared.seq.fetch_add(1, Ordering::Relaxed),
            job: Box::new(job),
        };
        if self.jobs.send(timed).is_err() {
            debug!("scheduler stopped, dropping job");
            self.shared.finish_one();
        }
    }

    /// Jobs posted but not yet finished, including delayed ones.
    pub fn pending(&self) -> usize {
        self.shared.pending.load(Ordering::SeqCst)
    }

    /// Blocks until no job is pending. Returns `false` on timeout.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut guard = self.shared.idle.lock();
        while self.pending() > 0 {
            if self.shared.settled.wait_until(&mut guard, deadline).timed_out() {
                return self.pending() == 0;
            }
        }
        true
    }
}

impl Shared {
    fn finish_one(&self) {
        if self.pending.fetch_sub(1, Ordering::SeqCst) == 1 {
            let _guard = self.idle.lock();
            self.settled.notify_all();
        }
    }
}

pub struct Scheduler {
    handle: SchedulerHandle,
    stop: Sender<()>,
    worker: Mutex<Option<thread::JoinHandle<()>>>,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler {
    pub fn new() -> Self {
        let (job_tx, job_rx) = unbounded();
        let (stop_tx, stop_rx) = unbounded();
        let shared = Arc::new(Shared::default());
        let worker_shared = shared.clone();
        let worker = thread::spawn(move || run(worker_shared, job_rx, stop_rx));
        Self {
            handle: SchedulerHandle {
                jobs: job_tx,
                shared,
            },
            stop: stop_tx,
            worker: Mutex::new(Some(worker)),
        }
    }

    pub fn handle(&self) -> SchedulerHandle {
        self.handle.clone()
    }

    /// Stops the worker. Jobs not yet due are dropped.
    pub fn shutdown(&self) {
        if let Some(worker) = self.worker.lock().take() {
            let _ = self.stop.send(());
            let _ = worker.join();
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run(shared: Arc<Shared>, jobs: Receiver<Timed>, stop: Receiver<()>) {
    let mut queue: BinaryHeap<Timed> = BinaryHeap::new();
    loop {
        let wait = queue
            .peek()
            .map(|next| next.due.saturating_duration_since(Instant::now()))
            .unwrap_or(IDLE_WAIT);
        select! {
            recv(stop) -> _ => break,
            recv(jobs) -> msg => match msg {
                Ok(timed) => queue.push(timed),
                Err(_) => break,
            },
            default(wait) => {}
        }

        while queue
            .peek()
            .map(|next| next.due <= Instant::now())
            .unwrap_or(false)
        {
            let Some(timed) = queue.pop() else { break };
            if catch_unwind(AssertUnwindSafe(timed.job)).is_err() {
                warn!("scheduled job panicked");
            }
            shared.finish_one();
        }
    }

    let dropped = queue.len();
    if dropped > 0 {
        debug!(dropped, "scheduler stopped with jobs queued");
    }
    for _ in 0..dropped {
        shared.finish_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn runs_jobs_in_due_order() {
        let scheduler = Scheduler::new();
        let handle = scheduler.handle();
        let seen = Arc::new(Mutex::new(Vec::new()));
        for (delay, label) in [(40, "late"), (0, "first"), (0, "second"), (15, "middle")] {
            let seen = seen.clone();
            handle.post_after(Duration::from_millis(delay), move || seen.lock().push(label));
        }
        assert!(handle.wait_idle(Duration::from_secs(2)));
        assert_eq!(*seen.lock(), vec!["first", "second", "middle", "late"]);
    }

    #[test]
    fn jobs_posted_from_jobs_keep_the_loop_busy() {
        let scheduler = Scheduler::new();
        let handle = scheduler.handle();
        let count = Arc::new(AtomicUsize::new(0));
        let inner_handle = handle.clone();
        let inner_count = count.clone();
        handle.post(move || {
            inner_count.fetch_add(1, Ordering::SeqCst);
            let again = inner_count.clone();
            inner_handle.post_after(Duration::from_millis(10), move || {
                again.fetch_add(1, Ordering::SeqCst);
            });
        });
        assert!(handle.wait_idle(Duration::from_secs(2)));
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn panicking_job_does_not_stop_the_worker() {
        let scheduler = Scheduler::new();
        let handle = scheduler.handle();
        let ran = Arc::new(AtomicUsize::new(0));
        handle.post(|| panic!("boom"));
        let flag = ran.clone();
        handle.post(move || {
            flag.fetch_add(1, Ordering::SeqCst);
        });
        assert!(handle.wait_idle(Duration::from_secs(2)));
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn shutdown_drops_future_jobs() {
        let scheduler = Scheduler::new();
        let handle = scheduler.handle();
        handle.post_after(Duration::from_secs(60), || {});
        assert_eq!(handle.pending(), 1);
        scheduler.shutdown();
        assert_eq!(handle.pending(), 0);
        handle.post(|| {});
        assert_eq!(handle.pending(), 0);
    }
}
