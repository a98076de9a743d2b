//! A pool of workers running jobs that declare what they touch.

use std::collections::VecDeque;
use std::fmt::{self, Debug, Formatter};
use std::num::NonZeroUsize;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::{Condvar, Mutex};
use rustc_hash::FxHashSet;
use slab::Slab;
use tracing::{debug, error, trace};

use crate::context::ContextId;
use crate::error::panic_message;
use crate::ir::ModuleName;

/// What a job touches while it runs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Footprint {
    /// Whether the job writes compiled state and needs the compilation lock.
    pub compilation: bool,
    pub modules: FxHashSet<ModuleName>,
    pub context: Option<ContextId>,
}

impl Footprint {
    /// A job compiling the given modules.
    pub fn compilation(modules: impl IntoIterator<Item = ModuleName>) -> Self {
        Self { compilation: true, modules: modules.into_iter().collect(), context: None }
    }

    /// A job executing a context that reads the given modules.
    pub fn execution(context: ContextId, modules: impl IntoIterator<Item = ModuleName>) -> Self {
        Self { compilation: false, modules: modules.into_iter().collect(), context: Some(context) }
    }

    /// Whether two jobs with these footprints must not run at the same time.
    ///
    /// Compilations exclude each other, a compilation excludes everything
    /// reading its modules, and a context runs one job at a time.
    pub fn overlaps(&self, other: &Self) -> bool {
        if self.compilation && other.compilation {
            return true;
        }
        if (self.compilation || other.compilation)
            && !self.modules.is_disjoint(&other.modules)
        {
            return true;
        }
        self.context.is_some() && self.context == other.context
    }
}

/// A unit of work for a [`Scheduler`] with environment `E`.
pub trait Job<E>: Send + Sync {
    /// A short name for logging.
    fn name(&self) -> &'static str;

    fn footprint(&self) -> &Footprint;

    /// Whether the two jobs must not run at the same time.
    fn conflicts_with(&self, other: &dyn Job<E>) -> bool {
        self.footprint().overlaps(other.footprint())
    }

    /// Whether the submitter waits for the job to finish.
    fn is_synchronous(&self) -> bool {
        false
    }

    /// Whether the job may be dropped while it is still queued.
    fn is_cancellable(&self) -> bool {
        true
    }

    fn run(&self, env: &E);
}

/// How a job ended.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum JobStatus {
    Completed,
    /// Removed from the queue before it started.
    Cancelled,
    /// The job panicked with this message.
    Panicked(String),
}

#[derive(Default)]
struct Slot {
    status: Mutex<Option<JobStatus>>,
    done: Condvar,
}

impl Slot {
    fn finish(&self, status: JobStatus) {
        *self.status.lock() = Some(status);
        self.done.notify_all();
    }
}

/// Observes the completion of a submitted job.
#[derive(Clone)]
pub struct JobHandle {
    name: &'static str,
    slot: Arc<Slot>,
}

impl Debug for JobHandle {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.debug_struct("JobHandle")
            .field("name", &self.name)
            .field("status", &self.status())
            .finish()
    }
}

impl JobHandle {
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Block until the job finished or was cancelled.
    pub fn wait(&self) -> JobStatus {
        let mut status = self.slot.status.lock();
        loop {
            if let Some(status) = &*status {
                return status.clone();
            }
            self.slot.done.wait(&mut status);
        }
    }

    /// The status if the job already ended.
    pub fn status(&self) -> Option<JobStatus> {
        self.slot.status.lock().clone()
    }
}

struct Entry<E> {
    job: Arc<dyn Job<E>>,
    slot: Arc<Slot>,
}

struct Queue<E> {
    pending: VecDeque<Entry<E>>,
    running: Slab<Arc<dyn Job<E>>>,
    shutdown: bool,
}

impl<E> Queue<E> {
    /// The position of the first queued job that conflicts neither with a
    /// running job nor with a job queued before it.
    fn next_runnable(&self) -> Option<usize> {
        self.pending.iter().enumerate().position(|(i, entry)| {
            let job = entry.job.as_ref();
            let blocked_by_running =
                self.running.iter().any(|(_, running)| job.conflicts_with(running.as_ref()));
            let blocked_by_earlier =
                self.pending.iter().take(i).any(|earlier| job.conflicts_with(earlier.job.as_ref()));
            !blocked_by_running && !blocked_by_earlier
        })
    }

    fn is_idle(&self) -> bool {
        self.pending.is_empty() && self.running.is_empty()
    }
}

struct Shared<E> {
    env: E,
    queue: Mutex<Queue<E>>,
    changed: Condvar,
}

/// Runs jobs on a fixed pool of worker threads.
///
/// Jobs start in submission order, except that a job that conflicts with a
/// running or an earlier queued job waits and later jobs may overtake it.
pub struct Scheduler<E: Send + Sync + 'static> {
    shared: Arc<Shared<E>>,
    workers: Vec<JoinHandle<()>>,
}

impl<E: Send + Sync + 'static> Scheduler<E> {
    pub fn new(workers: NonZeroUsize, env: E) -> Self {
        let shared = Arc::new(Shared {
            env,
            queue: Mutex::new(Queue {
                pending: VecDeque::new(),
                running: Slab::new(),
                shutdown: false,
            }),
            changed: Condvar::new(),
        });

        let workers = (0..workers.get())
            .map(|i| {
                let shared = shared.clone();
                thread::Builder::new()
                    .name(format!("retrace-worker-{i}"))
                    .spawn(move || work(&shared))
                    .expect("failed to spawn worker thread")
            })
            .collect();

        Self { shared, workers }
    }

    /// The environment jobs run in.
    pub fn env(&self) -> &E {
        &self.shared.env
    }

    /// Queue a job.
    pub fn submit(&self, job: impl Job<E> + 'static) -> JobHandle {
        let name = job.name();
        let slot = Arc::new(Slot::default());
        let mut queue = self.shared.queue.lock();
        queue.pending.push_back(Entry { job: Arc::new(job), slot: slot.clone() });
        debug!(job = name, queued = queue.pending.len(), "job submitted");
        drop(queue);
        self.shared.changed.notify_all();
        JobHandle { name, slot }
    }

    /// Remove queued cancellable jobs matching the predicate. Running jobs
    /// always complete.
    pub fn cancel(&self, predicate: impl Fn(&dyn Job<E>) -> bool) -> usize {
        let mut queue = self.shared.queue.lock();
        let mut cancelled = vec![];
        queue.pending.retain(|entry| {
            let cancel = entry.job.is_cancellable() && predicate(entry.job.as_ref());
            if cancel {
                cancelled.push(entry.slot.clone());
            }
            !cancel
        });
        drop(queue);

        for slot in &cancelled {
            slot.finish(JobStatus::Cancelled);
        }
        if !cancelled.is_empty() {
            debug!(cancelled = cancelled.len(), "jobs cancelled");
            self.shared.changed.notify_all();
        }
        cancelled.len()
    }

    /// Block until no job is queued or running.
    pub fn wait_idle(&self) {
        let mut queue = self.shared.queue.lock();
        while !queue.is_idle() {
            self.shared.changed.wait(&mut queue);
        }
    }

    pub fn queued(&self) -> usize {
        self.shared.queue.lock().pending.len()
    }

    pub fn running(&self) -> usize {
        self.shared.queue.lock().running.len()
    }
}

impl<E: Send + Sync + 'static> Drop for Scheduler<E> {
    fn drop(&mut self) {
        let pending = {
            let mut queue = self.shared.queue.lock();
            queue.shutdown = true;
            std::mem::take(&mut queue.pending)
        };
        self.shared.changed.notify_all();
        for entry in pending {
            entry.slot.finish(JobStatus::Cancelled);
        }

        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                error!("worker thread panicked");
            }
        }
        debug!("scheduler shut down");
    }
}

/// The loop of a worker thread.
fn work<E>(shared: &Shared<E>) {
    loop {
        let (key, entry) = {
            let mut queue = shared.queue.lock();
            loop {
                if queue.shutdown {
                    return;
                }
                if let Some(entry) =
                    queue.next_runnable().and_then(|i| queue.pending.remove(i))
                {
                    let key = queue.running.insert(entry.job.clone());
                    break (key, entry);
                }
                shared.changed.wait(&mut queue);
            }
        };

        let name = entry.job.name();
        trace!(job = name, "job started");
        let status = match catch_unwind(AssertUnwindSafe(|| entry.job.run(&shared.env))) {
            Ok(()) => JobStatus::Completed,
            Err(payload) => {
                let message = panic_message(&*payload);
                error!(job = name, %message, "job panicked");
                JobStatus::Panicked(message)
            }
        };
        trace!(job = name, ?status, "job finished");

        shared.queue.lock().running.remove(key);
        entry.slot.finish(status);
        shared.changed.notify_all();
    }
}
