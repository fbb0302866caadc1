use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};

use tokio::sync::Semaphore;
use tracing::{debug, warn};

use super::SyncContext;
use super::task::{SyncTask, TaskKind};

/// What currently owns a local path inside the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Occupant {
    /// A task is sitting in the queue for this path.
    Queued(TaskKind),
    /// An executing task claimed the path across its own lifetime.
    Held(TaskKind),
    /// The path is off limits for the rest of the run.
    Blacklisted,
}

struct PoolState {
    queue: VecDeque<SyncTask>,
    occupants: HashMap<PathBuf, Occupant>,
}

/// FIFO work queue with at most one queued or blacklisted task per local
/// path. Workers block on the semaphore; every queued task owns one permit.
pub struct TaskPool {
    state: Mutex<PoolState>,
    ready: Semaphore,
    closed: AtomicBool,
    active: AtomicUsize,
}

impl TaskPool {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(PoolState {
                queue: VecDeque::new(),
                occupants: HashMap::new(),
            }),
            ready: Semaphore::new(0),
            closed: AtomicBool::new(false),
            active: AtomicUsize::new(0),
        }
    }

    /// Enqueues a task unless its path is already taken or the pool has been
    /// drained. Returns whether the task was accepted.
    pub fn add(&self, task: SyncTask) -> bool {
        if self.closed.load(Ordering::SeqCst) {
            return false;
        }
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(occupant) = state.occupants.get(task.local_path()) {
            debug!(task = %task, ?occupant, "task rejected, path taken");
            return false;
        }
        state
            .occupants
            .insert(task.local_path().to_path_buf(), Occupant::Queued(task.kind()));
        state.queue.push_back(task);
        drop(state);
        self.ready.add_permits(1);
        true
    }

    /// Waits for the next task. The popped task's path is released right
    /// away; executors that need exclusivity past this point re-claim it with
    /// [`TaskPool::occupy`]. Returns `None` on shutdown wakeups and when a
    /// permit outlived its task (queue and permits drift after
    /// [`TaskPool::remove_subtree`]).
    pub async fn pop(&self) -> Option<SyncTask> {
        let permit = match self.ready.acquire().await {
            Ok(permit) => permit,
            Err(_) => return None,
        };
        permit.forget();
        if self.closed.load(Ordering::SeqCst) {
            return None;
        }
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let task = state.queue.pop_front()?;
        state.occupants.remove(task.local_path());
        self.active.fetch_add(1, Ordering::SeqCst);
        Some(task)
    }

    /// Claims a path across task boundaries. `Some(kind)` marks it held by an
    /// executing task; `None` blacklists it for the rest of the run, which
    /// also replaces the caller's own hold. Returns false if the claim lost.
    pub fn occupy(&self, path: &Path, kind: Option<TaskKind>) -> bool {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        match kind {
            Some(kind) => {
                if state.occupants.contains_key(path) {
                    return false;
                }
                state.occupants.insert(path.to_path_buf(), Occupant::Held(kind));
                true
            }
            None => match state.occupants.get(path) {
                Some(Occupant::Queued(_)) => false,
                _ => {
                    state.occupants.insert(path.to_path_buf(), Occupant::Blacklisted);
                    true
                }
            },
        }
    }

    /// Drops a hold or blacklist entry. Queued entries stay put; they go away
    /// when their task is popped or removed.
    pub fn release(&self, path: &Path) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if matches!(
            state.occupants.get(path),
            Some(Occupant::Held(_) | Occupant::Blacklisted)
        ) {
            state.occupants.remove(path);
        }
    }

    pub fn is_blacklisted(&self, path: &Path) -> bool {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        matches!(state.occupants.get(path), Some(Occupant::Blacklisted))
    }

    /// Kind of the task queued for `path`, if any. Held and blacklisted
    /// entries do not count.
    pub fn pending_kind(&self, path: &Path) -> Option<TaskKind> {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        match state.occupants.get(path) {
            Some(Occupant::Queued(kind)) => Some(*kind),
            _ => None,
        }
    }

    /// Cancels every queued task whose path is `parent` or nested under it.
    /// Permits of the removed tasks are reclaimed so workers do not wake for
    /// work that no longer exists.
    pub fn remove_subtree(&self, parent: &Path) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let mut kept = VecDeque::with_capacity(state.queue.len());
        let mut removed = 0usize;
        while let Some(task) = state.queue.pop_front() {
            if task.local_path().starts_with(parent) {
                state.occupants.remove(task.local_path());
                debug!(task = %task, "removed queued task under replaced subtree");
                removed += 1;
            } else {
                kept.push_back(task);
            }
        }
        state.queue = kept;
        for _ in 0..removed {
            if let Ok(permit) = self.ready.try_acquire() {
                permit.forget();
            }
        }
    }

    /// Shutdown signal: wakes exactly `n` blocked workers so each exits its
    /// wait once. In-flight tasks finish, new adds are refused.
    pub fn drain(&self, n: usize) {
        self.closed.store(true, Ordering::SeqCst);
        self.ready.add_permits(n);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Number of tasks waiting in the queue.
    pub fn outstanding(&self) -> usize {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.queue.len()
    }

    /// Number of tasks popped but not yet finished.
    pub fn active_count(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    pub fn task_done(&self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Default for TaskPool {
    fn default() -> Self {
        Self::new()
    }
}

/// One worker: pop, execute, report, repeat until the pool drains.
pub async fn worker_loop(ctx: std::sync::Arc<SyncContext>) {
    loop {
        let Some(task) = ctx.pool.pop().await else {
            if ctx.pool.is_closed() {
                break;
            }
            continue;
        };
        debug!(task = %task, "executing task");
        if let Err(err) = task.execute(&ctx).await {
            warn!(error = %err, "task failed");
        }
        ctx.pool.task_done();
    }
    debug!("worker stopped");
}
