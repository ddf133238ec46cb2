//! FIFO job scheduler.
//!
//! A single worker thread executes submitted jobs in arrival order. Jobs
//! receive a context carrying the scheduler's cancellation token and a
//! handle for re-scheduling; on stop, the token is set, queued jobs are
//! drained with the canceled context so they can exit cleanly, and the
//! worker is joined.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, Sender, TryRecvError};
use std::sync::{mpsc, Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// A unit of deferred work.
pub type Job = Box<dyn FnOnce(&JobContext) + Send + 'static>;

/// A shared flag set when the owner wants dependent work to stop.
#[derive(Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_canceled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Context handed to each job when it runs.
pub struct JobContext {
    /// Set once the scheduler is stopping. Jobs observing it must exit
    /// without further backend mutation.
    pub canceled: CancelToken,
    handle: SchedulerHandle,
}

impl JobContext {
    /// The scheduler the job is running on, for re-scheduling.
    pub fn handle(&self) -> &SchedulerHandle {
        &self.handle
    }
}

/// A cloneable handle for submitting jobs.
#[derive(Clone)]
pub struct SchedulerHandle {
    tx: Sender<Job>,
    token: CancelToken,
}

impl SchedulerHandle {
    /// Appends a job to the queue. Returns false if the scheduler has
    /// stopped and the job was dropped.
    pub fn schedule(&self, job: Job) -> bool {
        if self.token.is_canceled() {
            return false;
        }
        self.tx.send(job).is_ok()
    }

    pub fn is_stopped(&self) -> bool {
        self.token.is_canceled()
    }
}

/// The FIFO scheduler. Owns the worker thread.
pub struct FifoScheduler {
    handle: SchedulerHandle,
    worker: Option<JoinHandle<()>>,
}

impl FifoScheduler {
    pub fn new() -> Self {
        let (tx, rx): (Sender<Job>, Receiver<Job>) = mpsc::channel();
        let token = CancelToken::new();
        let handle = SchedulerHandle {
            tx,
            token: token.clone(),
        };

        let ctx = JobContext {
            canceled: token,
            handle: handle.clone(),
        };
        let worker = thread::spawn(move || Self::run(rx, ctx));

        Self {
            handle,
            worker: Some(worker),
        }
    }

    fn run(rx: Receiver<Job>, ctx: JobContext) {
        while let Ok(job) = rx.recv() {
            job(&ctx);
            if ctx.canceled.is_canceled() {
                // Drain what is already queued under the canceled context,
                // then exit. Re-submissions are rejected at this point.
                loop {
                    match rx.try_recv() {
                        Ok(job) => job(&ctx),
                        Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
                    }
                }
                break;
            }
        }
        tracing::debug!("scheduler worker exited");
    }

    pub fn handle(&self) -> SchedulerHandle {
        self.handle.clone()
    }

    /// Same contract as [`SchedulerHandle::schedule`].
    pub fn schedule(&self, job: Job) -> bool {
        self.handle.schedule(job)
    }

    pub fn is_stopped(&self) -> bool {
        self.handle.is_stopped()
    }

    /// Signals cancellation, drains or abandons queued jobs, and blocks
    /// until the worker exits.
    pub fn stop(mut self) {
        self.handle.token.cancel();
        // Wake the worker if it is blocked on an empty queue.
        let _ = self.handle.tx.send(Box::new(|_| {}));
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

impl Default for FifoScheduler {
    fn default() -> Self {
        Self::new()
    }
}

/// A completion signal that can be waited on. The scheduler's rendition of
/// a closable done channel: cloned freely, notified once, never reset.
#[derive(Clone, Default)]
pub struct Notify(Arc<NotifyState>);

#[derive(Default)]
struct NotifyState {
    done: Mutex<bool>,
    cv: Condvar,
}

impl Notify {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn notify(&self) {
        let mut done = self.0.done.lock().unwrap();
        *done = true;
        self.0.cv.notify_all();
    }

    pub fn is_notified(&self) -> bool {
        *self.0.done.lock().unwrap()
    }

    /// Blocks until notified.
    pub fn wait(&self) {
        let mut done = self.0.done.lock().unwrap();
        while !*done {
            done = self.0.cv.wait(done).unwrap();
        }
    }

    /// Blocks until notified or the timeout elapses. Returns whether the
    /// notification arrived.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = std::time::Instant::now() + timeout;
        let mut done = self.0.done.lock().unwrap();
        while !*done {
            let now = std::time::Instant::now();
            if now >= deadline {
                return false;
            }
            let (guard, result) = self.0.cv.wait_timeout(done, deadline - now).unwrap();
            done = guard;
            if result.timed_out() && !*done {
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_jobs_run_in_fifo_order() {
        let sched = FifoScheduler::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        let done = Notify::new();

        for i in 0..10 {
            let order = Arc::clone(&order);
            let done = done.clone();
            sched.schedule(Box::new(move |_| {
                order.lock().unwrap().push(i);
                if i == 9 {
                    done.notify();
                }
            }));
        }

        done.wait();
        assert_eq!(*order.lock().unwrap(), (0..10).collect::<Vec<_>>());
        sched.stop();
    }

    #[test]
    fn test_stop_drains_queue_with_canceled_context() {
        let sched = FifoScheduler::new();
        let handle = sched.handle();
        let gate = Notify::new();
        let saw_canceled = Arc::new(Mutex::new(None));

        // The first job blocks the worker until the gate opens.
        let job_gate = gate.clone();
        sched.schedule(Box::new(move |_| job_gate.wait()));

        // The second job is queued behind it and will be drained on stop.
        let saw = Arc::clone(&saw_canceled);
        sched.schedule(Box::new(move |ctx| {
            *saw.lock().unwrap() = Some(ctx.canceled.is_canceled());
        }));

        let stopper = thread::spawn(move || sched.stop());
        while !handle.is_stopped() {
            thread::yield_now();
        }
        gate.notify();
        stopper.join().unwrap();

        assert_eq!(*saw_canceled.lock().unwrap(), Some(true));
        assert!(!handle.schedule(Box::new(|_| {})));
    }

    #[test]
    fn test_job_reschedules_itself() {
        let sched = FifoScheduler::new();
        let count = Arc::new(Mutex::new(0));
        let done = Notify::new();

        fn step(count: Arc<Mutex<i32>>, done: Notify) -> Job {
            Box::new(move |ctx| {
                let mut n = count.lock().unwrap();
                *n += 1;
                if *n < 3 {
                    drop(n);
                    ctx.handle().schedule(step(count.clone(), done.clone()));
                } else {
                    done.notify();
                }
            })
        }

        sched.schedule(step(Arc::clone(&count), done.clone()));
        done.wait();
        assert_eq!(*count.lock().unwrap(), 3);
        sched.stop();
    }

    #[test]
    fn test_notify_wait_timeout() {
        let n = Notify::new();
        assert!(!n.wait_timeout(Duration::from_millis(10)));
        n.notify();
        assert!(n.wait_timeout(Duration::from_millis(10)));
        assert!(n.is_notified());
    }
}
