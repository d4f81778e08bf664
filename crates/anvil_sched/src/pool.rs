//! The fixed-size worker pool.
//!
//! Workers drain one shared LIFO ready queue, so execution makes
//! depth-first progress through dependency chains. Each batch owns a
//! private done-channel; the thread that submitted the batch collects
//! completions from that channel only. When the submitting thread is
//! itself a pool worker (a task called [`Pool::map`] from inside another
//! task), it services one job from the shared queue while waiting instead
//! of parking — that re-entrant drain is what lets arbitrarily nested
//! scheduling run on a pool of any size, including one.

use std::cell::Cell;
use std::fmt::Debug;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{mpsc, Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

use tracing::{debug, warn};

use anvil_common::BuildError;

use crate::error::SchedError;
use crate::graph::TaskGraph;

thread_local! {
    /// Set on pool worker threads. A coordinator that sees this flag pumps
    /// the shared queue while waiting on its batch.
    static IS_WORKER: Cell<bool> = const { Cell::new(false) };
}

/// How long a pumping coordinator waits on its done-channel before
/// re-checking the shared queue.
const PUMP_WAIT: Duration = Duration::from_millis(1);

type Job = Box<dyn FnOnce() + Send + 'static>;

enum QueueItem {
    Job(Job),
    Shutdown,
}

/// The shared ready queue. LIFO: jobs push and pop at the back.
struct Shared {
    queue: Mutex<Vec<QueueItem>>,
    available: Condvar,
}

impl Shared {
    fn push_job(&self, job: Job) {
        self.lock_queue().push(QueueItem::Job(job));
        self.available.notify_one();
    }

    /// Queues one shutdown sentinel per worker, at the front so remaining
    /// jobs drain first.
    fn push_shutdown(&self, count: usize) {
        {
            let mut queue = self.lock_queue();
            for _ in 0..count {
                queue.insert(0, QueueItem::Shutdown);
            }
        }
        self.available.notify_all();
    }

    fn pop_blocking(&self) -> QueueItem {
        let mut queue = self.lock_queue();
        loop {
            if let Some(item) = queue.pop() {
                return item;
            }
            queue = self
                .available
                .wait(queue)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Non-blocking pop. Never consumes a shutdown sentinel; those are for
    /// the worker loops only.
    fn try_pop_job(&self) -> Option<Job> {
        let mut queue = self.lock_queue();
        match queue.last() {
            Some(QueueItem::Job(_)) => match queue.pop() {
                Some(QueueItem::Job(job)) => Some(job),
                _ => None,
            },
            _ => None,
        }
    }

    fn lock_queue(&self) -> MutexGuard<'_, Vec<QueueItem>> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A fixed-size pool of worker threads executing scheduled tasks.
pub struct Pool {
    shared: Arc<Shared>,
    workers: Vec<thread::JoinHandle<()>>,
}

impl Pool {
    /// Spawns a pool with `threads` workers (at least one).
    pub fn new(threads: usize) -> Self {
        let shared = Arc::new(Shared {
            queue: Mutex::new(Vec::new()),
            available: Condvar::new(),
        });
        let workers = (0..threads.max(1))
            .map(|_| {
                let shared = shared.clone();
                thread::spawn(move || worker_loop(shared))
            })
            .collect();
        Self { shared, workers }
    }

    /// Drains remaining work cooperatively and joins every worker. No task
    /// is force-killed.
    pub fn shutdown(mut self) {
        self.shutdown_inner();
    }

    /// Runs `f(item)` concurrently for every item; results come back in
    /// input order regardless of completion order.
    ///
    /// The first failing task aborts the whole batch: its error is
    /// returned, tasks that had not started are skipped, and other batches
    /// on the pool are unaffected.
    pub fn map<T, R, F>(&self, f: F, items: Vec<T>) -> Result<Vec<R>, SchedError>
    where
        T: Debug + Send + Sync + 'static,
        R: Send + 'static,
        F: Fn(&T) -> Result<R, BuildError> + Send + Sync + 'static,
    {
        let n = items.len();
        self.run_batch(f, items, TaskGraph::new(vec![Vec::new(); n]))
    }

    /// Two-phase scheduling: `discover(item)` runs concurrently for every
    /// item and names the items it depends on (targets not in `items` are
    /// silently ignored); then `f(item)` runs respecting those edges.
    ///
    /// Output order is the deterministic depth-first postorder over `items`
    /// in their original order — a dependency's result always precedes its
    /// dependents', stably across runs. A cyclic graph errors before any
    /// `f` runs, naming every cyclic group.
    pub fn map_with_dependencies<T, R, D, F>(
        &self,
        discover: D,
        f: F,
        items: Vec<T>,
    ) -> Result<Vec<R>, SchedError>
    where
        T: Clone + PartialEq + Debug + Send + Sync + 'static,
        R: Send + 'static,
        D: Fn(&T) -> Result<Vec<T>, BuildError> + Send + Sync + 'static,
        F: Fn(&T) -> Result<R, BuildError> + Send + Sync + 'static,
    {
        let discovered = self.map(discover, items.clone())?;
        let graph = TaskGraph::new(TaskGraph::resolve(&items, &discovered));
        graph.check_acyclic(&items)?;
        let order = graph.postorder();

        let results = self.run_batch(f, items, graph)?;

        let mut slots: Vec<Option<R>> = results.into_iter().map(Some).collect();
        let mut out = Vec::with_capacity(slots.len());
        for idx in order {
            if let Some(result) = slots[idx].take() {
                out.push(result);
            }
        }
        if out.len() != slots.len() {
            return Err(SchedError::Internal(
                "postorder did not cover every task".to_string(),
            ));
        }
        Ok(out)
    }

    /// Submits one batch and collects its completions, pumping the shared
    /// queue if the calling thread is a pool worker.
    fn run_batch<T, R, F>(
        &self,
        f: F,
        items: Vec<T>,
        graph: TaskGraph,
    ) -> Result<Vec<R>, SchedError>
    where
        T: Debug + Send + Sync + 'static,
        R: Send + 'static,
        F: Fn(&T) -> Result<R, BuildError> + Send + Sync + 'static,
    {
        let n = items.len();
        if n == 0 {
            return Ok(Vec::new());
        }

        let (done_tx, done_rx) = mpsc::channel();
        let pending: Vec<usize> = (0..n).map(|i| graph.deps(i).len()).collect();
        let ready: Vec<usize> = (0..n).filter(|&i| pending[i] == 0).collect();

        let batch = Arc::new(Batch {
            shared: self.shared.clone(),
            items,
            graph,
            f,
            core: Mutex::new(BatchCore {
                pending,
                failed: false,
            }),
            done_tx,
        });

        debug!(tasks = n, ready = ready.len(), "starting batch");
        for idx in ready {
            Batch::spawn(batch.clone(), idx);
        }

        let pumping = IS_WORKER.with(|w| w.get());
        let mut results: Vec<Option<R>> = (0..n).map(|_| None).collect();
        let mut completed = 0;

        while completed < n {
            let msg = if pumping {
                match done_rx.try_recv() {
                    Ok(msg) => Some(msg),
                    Err(mpsc::TryRecvError::Empty) => {
                        // Service the shared queue instead of parking, so
                        // nested batches progress even on one worker.
                        if let Some(job) = batch.shared.try_pop_job() {
                            job();
                            None
                        } else {
                            match done_rx.recv_timeout(PUMP_WAIT) {
                                Ok(msg) => Some(msg),
                                Err(mpsc::RecvTimeoutError::Timeout) => None,
                                Err(mpsc::RecvTimeoutError::Disconnected) => {
                                    return Err(lost_channel())
                                }
                            }
                        }
                    }
                    Err(mpsc::TryRecvError::Disconnected) => return Err(lost_channel()),
                }
            } else {
                match done_rx.recv() {
                    Ok(msg) => Some(msg),
                    Err(_) => return Err(lost_channel()),
                }
            };

            match msg {
                Some(TaskMsg::Done(idx, value)) => {
                    results[idx] = Some(value);
                    completed += 1;
                }
                Some(TaskMsg::Failed(idx, err)) => {
                    warn!(task = idx, error = %err, "task failed; aborting batch");
                    return Err(SchedError::Task {
                        item: format!("{:?}", batch.items[idx]),
                        source: err,
                    });
                }
                Some(TaskMsg::Panicked(_, payload)) => {
                    // A panic is a programming error; propagate it to the
                    // submitter as if the task had run on this thread.
                    panic::resume_unwind(payload);
                }
                None => {}
            }
        }

        let mut out = Vec::with_capacity(n);
        for slot in results {
            match slot {
                Some(value) => out.push(value),
                None => return Err(SchedError::Internal("missing task result".to_string())),
            }
        }
        Ok(out)
    }

    fn shutdown_inner(&mut self) {
        if self.workers.is_empty() {
            return;
        }
        self.shared.push_shutdown(self.workers.len());
        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                warn!("worker thread panicked during shutdown");
            }
        }
    }
}

impl Default for Pool {
    /// A fully serial pool (one worker).
    fn default() -> Self {
        Self::new(1)
    }
}

impl Drop for Pool {
    fn drop(&mut self) {
        self.shutdown_inner();
    }
}

fn worker_loop(shared: Arc<Shared>) {
    IS_WORKER.with(|w| w.set(true));
    loop {
        match shared.pop_blocking() {
            QueueItem::Job(job) => job(),
            QueueItem::Shutdown => break,
        }
    }
}

fn lost_channel() -> SchedError {
    SchedError::Internal("batch completion channel closed".to_string())
}

enum TaskMsg<R> {
    Done(usize, R),
    Failed(usize, BuildError),
    Panicked(usize, Box<dyn std::any::Any + Send>),
}

/// Mutable per-batch scheduling state.
struct BatchCore {
    /// Unfinished dependency count per task; a task becomes runnable when
    /// its count reaches zero. Monotonic: counts only ever decrease.
    pending: Vec<usize>,
    /// Set on the first failure; queued tasks of a failed batch skip
    /// execution.
    failed: bool,
}

/// One `map`/`map_with_dependencies` invocation: its items, its task graph,
/// and its private completion channel.
struct Batch<T, R, F> {
    shared: Arc<Shared>,
    items: Vec<T>,
    graph: TaskGraph,
    f: F,
    core: Mutex<BatchCore>,
    done_tx: mpsc::Sender<TaskMsg<R>>,
}

impl<T, R, F> Batch<T, R, F>
where
    T: Debug + Send + Sync + 'static,
    R: Send + 'static,
    F: Fn(&T) -> Result<R, BuildError> + Send + Sync + 'static,
{
    /// Queues one runnable task on the shared ready queue.
    fn spawn(this: Arc<Self>, idx: usize) {
        let shared = this.shared.clone();
        shared.push_job(Box::new(move || this.run_task(idx)));
    }

    fn run_task(self: Arc<Self>, idx: usize) {
        if self.lock_core().failed {
            debug!(task = idx, "batch already failed; skipping task");
            return;
        }

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| (self.f)(&self.items[idx])));
        match outcome {
            Ok(Ok(value)) => {
                Self::finish(&self, idx);
                // The submitter may already have returned (sibling failure);
                // a closed channel is fine.
                let _ = self.done_tx.send(TaskMsg::Done(idx, value));
            }
            Ok(Err(err)) => {
                self.lock_core().failed = true;
                let _ = self.done_tx.send(TaskMsg::Failed(idx, err));
            }
            Err(payload) => {
                self.lock_core().failed = true;
                let _ = self.done_tx.send(TaskMsg::Panicked(idx, payload));
            }
        }
    }

    /// Marks `idx` done and queues every dependent whose dependencies are
    /// now all finished.
    fn finish(this: &Arc<Self>, idx: usize) {
        let ready: Vec<usize> = {
            let mut core = this.lock_core();
            let mut ready = Vec::new();
            for &dependent in this.graph.dependents(idx) {
                core.pending[dependent] -= 1;
                if core.pending[dependent] == 0 {
                    ready.push(dependent);
                }
            }
            ready
        };
        for dependent in ready {
            Self::spawn(this.clone(), dependent);
        }
    }

    fn lock_core(&self) -> MutexGuard<'_, BatchCore> {
        self.core.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
