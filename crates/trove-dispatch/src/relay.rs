//! Relays move callback invocations into the caller's scheduling context.
//!
//! An operation started with `IDLE_RELAY` never calls back from the stack
//! that produced a result. Each chunk is posted to a [`Relay`] instead and
//! delivered when the relay runs the job. [`MainLoop`] is an explicit idle
//! queue the caller drains itself; [`RuntimeRelay`] runs jobs in order on a
//! single tokio task.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tokio::runtime::Handle;
use tokio::sync::mpsc;

/// A deferred callback invocation.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Somewhere to run deferred jobs, in posting order.
pub trait Relay: Send + Sync {
    fn post(&self, job: Job);
}

// ---------------------------------------------------------------------------
// MainLoop
// ---------------------------------------------------------------------------

#[derive(Default)]
struct Queue {
    jobs: Mutex<VecDeque<Job>>,
    ready: Condvar,
}

/// An idle queue drained by its owner.
///
/// Jobs run on whichever thread calls [`MainLoop::iterate`],
/// [`MainLoop::dispatch_pending`] or [`MainLoop::run_until`], never on the
/// thread that posted them.
#[derive(Clone, Default)]
pub struct MainLoop {
    queue: Arc<Queue>,
}

impl MainLoop {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of queued jobs.
    pub fn pending(&self) -> usize {
        self.queue.jobs.lock().len()
    }

    /// Run one queued job. Returns `false` if the queue was empty.
    pub fn iterate(&self) -> bool {
        // Pop first: a job may post more jobs.
        let job = self.queue.jobs.lock().pop_front();
        match job {
            Some(job) => {
                job();
                true
            }
            None => false,
        }
    }

    /// Run jobs until the queue is empty; returns how many ran.
    pub fn dispatch_pending(&self) -> usize {
        let mut ran = 0;
        while self.iterate() {
            ran += 1;
        }
        ran
    }

    /// Run jobs, waiting for new ones, until `done` returns true or
    /// `timeout` elapses. Returns the final value of `done`.
    pub fn run_until(&self, timeout: Duration, mut done: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            self.dispatch_pending();
            if done() {
                return true;
            }
            let mut jobs = self.queue.jobs.lock();
            if jobs.is_empty() {
                let timed_out = self.queue.ready.wait_until(&mut jobs, deadline).timed_out();
                if timed_out && jobs.is_empty() {
                    drop(jobs);
                    return done();
                }
            }
        }
    }
}

impl Relay for MainLoop {
    fn post(&self, job: Job) {
        self.queue.jobs.lock().push_back(job);
        self.queue.ready.notify_all();
    }
}

impl fmt::Debug for MainLoop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MainLoop")
            .field("pending", &self.pending())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// RuntimeRelay
// ---------------------------------------------------------------------------

/// Runs jobs in posting order on one task of a tokio runtime.
#[derive(Clone)]
pub struct RuntimeRelay {
    tx: mpsc::UnboundedSender<Job>,
}

impl RuntimeRelay {
    pub fn new(handle: &Handle) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Job>();
        handle.spawn(async move {
            while let Some(job) = rx.recv().await {
                job();
            }
            tracing::debug!("runtime relay stopped");
        });
        Self { tx }
    }
}

impl Relay for RuntimeRelay {
    fn post(&self, job: Job) {
        if self.tx.send(job).is_err() {
            tracing::warn!("runtime relay is gone; dropping callback");
        }
    }
}

impl fmt::Debug for RuntimeRelay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RuntimeRelay").finish_non_exhaustive()
    }
}
