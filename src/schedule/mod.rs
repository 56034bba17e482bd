//! Task-graph scheduling over a fixed worker pool.
//!
//! Work is described declaratively: a closure plus the completion
//! handles it depends on. [`TaskPool::spawn`] returns immediately with
//! a [`TaskHandle`]; the closure runs once every dependency has
//! completed. "Waiting" means depending on a handle; workers are never
//! blocked on one another. [`TaskHandle::wait`] blocks the *calling*
//! thread and exists for frame boundaries and tests only.
//!
//! Cancellation and timeouts are deliberately absent: once spawned, a
//! task runs to completion.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::{Condvar, Mutex};

type Job = Box<dyn FnOnce() + Send + 'static>;

struct WaitState {
    done: bool,
    dependents: Vec<Arc<TaskState>>,
}

struct TaskState {
    /// Unmet dependencies plus one arming bias that is removed after
    /// registration, so the task cannot fire mid-setup.
    pending: AtomicUsize,
    done: AtomicBool,
    job: Mutex<Option<Job>>,
    /// Queue to run the job on; `None` for join nodes, which complete
    /// inline on whichever thread resolves their last dependency.
    queue: Option<Sender<Arc<TaskState>>>,
    waiters: Mutex<WaitState>,
    done_cv: Condvar,
}

impl TaskState {
    fn new(dep_count: usize, job: Option<Job>, queue: Option<Sender<Arc<TaskState>>>) -> Arc<Self> {
        Arc::new(Self {
            pending: AtomicUsize::new(dep_count + 1),
            done: AtomicBool::new(false),
            job: Mutex::new(job),
            queue,
            waiters: Mutex::new(WaitState {
                done: false,
                dependents: Vec::new(),
            }),
            done_cv: Condvar::new(),
        })
    }

    /// Registers `child` to be notified on completion. Returns false if
    /// this task already completed, in which case the caller resolves
    /// the dependency itself.
    fn register(&self, child: &Arc<TaskState>) -> bool {
        let mut waiters = self.waiters.lock();
        if waiters.done {
            return false;
        }
        waiters.dependents.push(Arc::clone(child));
        true
    }

    /// Resolves one dependency; fires the task when the count hits zero.
    fn resolve_dependency(this: &Arc<TaskState>) {
        if this.pending.fetch_sub(1, Ordering::AcqRel) != 1 {
            return;
        }
        match &this.queue {
            Some(queue) => {
                // Pool gone before all tasks ran; nothing to run on.
                // Completion still propagates so waiters are not stuck.
                if queue.send(Arc::clone(this)).is_err() {
                    TaskState::finish(this);
                }
            }
            None => TaskState::finish(this),
        }
    }

    /// Marks the task complete and cascades to dependents.
    fn finish(this: &Arc<TaskState>) {
        let dependents = {
            let mut waiters = this.waiters.lock();
            waiters.done = true;
            this.done.store(true, Ordering::Release);
            std::mem::take(&mut waiters.dependents)
        };
        this.done_cv.notify_all();
        for dependent in &dependents {
            TaskState::resolve_dependency(dependent);
        }
    }

    fn wait(&self) {
        let mut waiters = self.waiters.lock();
        while !waiters.done {
            self.done_cv.wait(&mut waiters);
        }
    }
}

/// Completion token for a unit of scheduled work.
///
/// Cheap to clone and combine; the default handle is already complete.
#[derive(Clone, Default)]
pub struct TaskHandle {
    state: Option<Arc<TaskState>>,
}

impl TaskHandle {
    /// A handle that is complete from the start.
    #[inline]
    pub fn ready() -> Self {
        Self { state: None }
    }

    #[inline]
    pub fn is_complete(&self) -> bool {
        match &self.state {
            None => true,
            Some(state) => state.done.load(Ordering::Acquire),
        }
    }

    /// Blocks the calling thread until the handle completes. Frame
    /// boundaries and tests only. Never call from inside a task.
    pub fn wait(&self) {
        if let Some(state) = &self.state {
            state.wait();
        }
    }

    /// Merges handles into one that completes when all inputs have.
    pub fn combine(handles: &[TaskHandle]) -> TaskHandle {
        let live: Vec<&Arc<TaskState>> = handles
            .iter()
            .filter(|h| !h.is_complete())
            .filter_map(|h| h.state.as_ref())
            .collect();
        match live.len() {
            0 => TaskHandle::ready(),
            1 => TaskHandle {
                state: Some(Arc::clone(live[0])),
            },
            _ => {
                let join = TaskState::new(live.len(), None, None);
                for dep in live {
                    if !dep.register(&join) {
                        TaskState::resolve_dependency(&join);
                    }
                }
                TaskState::resolve_dependency(&join);
                TaskHandle { state: Some(join) }
            }
        }
    }
}

impl core::fmt::Debug for TaskHandle {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("TaskHandle")
            .field("complete", &self.is_complete())
            .finish()
    }
}

/// Fixed pool of worker threads executing a task dependency graph.
pub struct TaskPool {
    queue: Option<Sender<Arc<TaskState>>>,
    workers: Vec<JoinHandle<()>>,
}

impl TaskPool {
    pub fn new(threads: usize) -> Self {
        assert!(threads >= 1, "pool needs at least one worker");
        let (tx, rx) = unbounded::<Arc<TaskState>>();
        let workers = (0..threads)
            .map(|index| {
                let rx: Receiver<Arc<TaskState>> = rx.clone();
                std::thread::Builder::new()
                    .name(format!("evstream-worker-{index}"))
                    .spawn(move || {
                        tracing::debug!(worker = index, "worker started");
                        for task in rx.iter() {
                            let job = task.job.lock().take();
                            if let Some(job) = job {
                                job();
                            }
                            TaskState::finish(&task);
                        }
                        tracing::debug!(worker = index, "worker stopped");
                    })
                    .expect("failed to spawn worker thread")
            })
            .collect();
        Self {
            queue: Some(tx),
            workers,
        }
    }

    #[inline]
    pub fn thread_count(&self) -> usize {
        self.workers.len()
    }

    /// Schedules `job` to run once every handle in `deps` completes.
    pub fn spawn<F>(&self, deps: &[TaskHandle], job: F) -> TaskHandle
    where
        F: FnOnce() + Send + 'static,
    {
        let queue = self
            .queue
            .as_ref()
            .expect("queue lives until the pool drops")
            .clone();
        let live: Vec<&Arc<TaskState>> = deps
            .iter()
            .filter(|h| !h.is_complete())
            .filter_map(|h| h.state.as_ref())
            .collect();
        let task = TaskState::new(live.len(), Some(Box::new(job)), Some(queue));
        for dep in live {
            if !dep.register(&task) {
                TaskState::resolve_dependency(&task);
            }
        }
        TaskState::resolve_dependency(&task);
        TaskHandle { state: Some(task) }
    }
}

impl Drop for TaskPool {
    fn drop(&mut self) {
        // Workers drain the queue and exit once every sender is gone;
        // senders held by in-flight tasks drop as those tasks finish.
        self.queue.take();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}
