//! Asynchronous task execution.
//!
//! A [`Task`] publishes its outcome into a shared [`Future`]; an
//! [`Executor`] spawns tasks and owns their handles; a [`Completer`]
//! additionally hands back futures in completion order. Cancellation is
//! cooperative: a canceled task stops at its next suspension point and
//! resolves its future as canceled.

use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{mpsc, Notify};

use hycast_core::{Error, Result};

// ── Future ───────────────────────────────────────────────────────────────────

enum Outcome<T> {
    Value(T),
    Error(Error),
    Canceled,
}

struct FutureState<T> {
    outcome: Mutex<Option<Outcome<T>>>,
    done: AtomicBool,
    canceled: AtomicBool,
    done_notify: Notify,
    cancel_requested: AtomicBool,
    cancel_notify: Notify,
}

impl<T> FutureState<T> {
    fn resolve(&self, outcome: Outcome<T>) {
        if matches!(outcome, Outcome::Canceled) {
            self.canceled.store(true, Ordering::Release);
        }
        *self.outcome.lock() = Some(outcome);
        self.done.store(true, Ordering::Release);
        self.done_notify.notify_waiters();
    }
}

/// The eventual result of a task. Cheap to clone; clones share the same
/// outcome. Two futures are equal iff they came from the same task.
pub struct Future<T> {
    state: Arc<FutureState<T>>,
}

impl<T> std::fmt::Debug for Future<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Future").finish_non_exhaustive()
    }
}

impl<T> Clone for Future<T> {
    fn clone(&self) -> Self {
        Future {
            state: self.state.clone(),
        }
    }
}

impl<T> PartialEq for Future<T> {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.state, &other.state)
    }
}

impl<T> Eq for Future<T> {}

impl<T> Future<T> {
    fn new() -> Self {
        Future {
            state: Arc::new(FutureState {
                outcome: Mutex::new(None),
                done: AtomicBool::new(false),
                canceled: AtomicBool::new(false),
                done_notify: Notify::new(),
                cancel_requested: AtomicBool::new(false),
                cancel_notify: Notify::new(),
            }),
        }
    }

    /// Asks the task to stop. Takes effect at the task's next suspension
    /// point; a task that has already resolved is unaffected.
    pub fn cancel(&self) {
        self.state.cancel_requested.store(true, Ordering::Release);
        self.state.cancel_notify.notify_one();
    }

    pub fn is_done(&self) -> bool {
        self.state.done.load(Ordering::Acquire)
    }

    /// True once the task resolved as canceled.
    pub fn was_canceled(&self) -> bool {
        self.state.canceled.load(Ordering::Acquire)
    }

    /// Waits for the task to resolve.
    pub async fn wait(&self) {
        loop {
            if self.is_done() {
                return;
            }
            let notified = self.state.done_notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_done() {
                return;
            }
            notified.await;
        }
    }

    /// Waits for the task and takes its result. A stored error is
    /// re-raised; a canceled task raises a logic error. The result can be
    /// taken once; later calls raise a logic error.
    pub async fn result(&self) -> Result<T> {
        self.wait().await;
        let outcome = self.state.outcome.lock().take();
        match outcome {
            Some(Outcome::Value(v)) => Ok(v),
            Some(Outcome::Error(e)) => Err(e),
            Some(Outcome::Canceled) => {
                // Keep the marker so was_canceled() stays true.
                *self.state.outcome.lock() = Some(Outcome::Canceled);
                Err(Error::logic("task was canceled"))
            }
            None => Err(Error::logic("result was already retrieved")),
        }
    }
}

// ── Task ─────────────────────────────────────────────────────────────────────

/// A unit of work paired with the future it publishes into.
pub struct Task<T> {
    work: Pin<Box<dyn std::future::Future<Output = Result<T>> + Send>>,
    future: Future<T>,
}

impl<T: Send + 'static> Task<T> {
    pub fn new<F>(work: F) -> Self
    where
        F: std::future::Future<Output = Result<T>> + Send + 'static,
    {
        Task {
            work: Box::pin(work),
            future: Future::new(),
        }
    }

    pub fn future(&self) -> Future<T> {
        self.future.clone()
    }

    /// Runs the work to completion, racing it against cancellation, and
    /// publishes the outcome.
    pub async fn run(self) {
        let Task { work, future } = self;
        let state = &future.state;
        if state.cancel_requested.load(Ordering::Acquire) {
            state.resolve(Outcome::Canceled);
            return;
        }
        tokio::select! {
            _ = state.cancel_notify.notified() => state.resolve(Outcome::Canceled),
            result = work => state.resolve(match result {
                Ok(value) => Outcome::Value(value),
                Err(err) => Outcome::Error(err),
            }),
        }
    }
}

// ── Executor ─────────────────────────────────────────────────────────────────

struct Submitted<T> {
    future: Future<T>,
    handle: tokio::task::JoinHandle<()>,
}

struct ExecutorInner<T> {
    shutdown: AtomicBool,
    tasks: Mutex<Vec<Submitted<T>>>,
}

impl<T> Drop for ExecutorInner<T> {
    fn drop(&mut self) {
        for task in self.tasks.get_mut().drain(..) {
            task.future.cancel();
            task.handle.abort();
        }
    }
}

/// Spawns submitted work and owns the spawned tasks. Cheap to clone;
/// clones share the same task set.
pub struct Executor<T> {
    inner: Arc<ExecutorInner<T>>,
}

impl<T> Clone for Executor<T> {
    fn clone(&self) -> Self {
        Executor {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Send + 'static> Default for Executor<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Send + 'static> Executor<T> {
    pub fn new() -> Self {
        Executor {
            inner: Arc::new(ExecutorInner {
                shutdown: AtomicBool::new(false),
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Submits work for execution. Fails once the executor is shut down.
    pub fn submit<F>(&self, work: F) -> Result<Future<T>>
    where
        F: std::future::Future<Output = Result<T>> + Send + 'static,
    {
        if self.inner.shutdown.load(Ordering::Acquire) {
            return Err(Error::logic("executor is shut down"));
        }
        let task = Task::new(work);
        let future = task.future();
        let handle = tokio::spawn(task.run());
        self.inner.tasks.lock().push(Submitted {
            future: future.clone(),
            handle,
        });
        Ok(future)
    }

    /// Refuses further submissions; optionally cancels running tasks.
    pub fn shutdown(&self, may_interrupt: bool) {
        self.inner.shutdown.store(true, Ordering::Release);
        if may_interrupt {
            for task in self.inner.tasks.lock().iter() {
                task.future.cancel();
            }
        }
    }

    /// Waits until every submitted task has resolved. Must be preceded by
    /// [`Executor::shutdown`].
    pub async fn await_termination(&self) -> Result<()> {
        if !self.inner.shutdown.load(Ordering::Acquire) {
            return Err(Error::logic("await_termination without shutdown"));
        }
        let tasks: Vec<_> = self.inner.tasks.lock().drain(..).collect();
        for task in tasks {
            let _ = task.handle.await;
        }
        Ok(())
    }
}

// ── Completer ────────────────────────────────────────────────────────────────

/// An executor whose completed futures can be consumed in completion
/// order. Every submission appears in [`Completer::next`] exactly once,
/// including canceled ones.
pub struct Completer<T> {
    tx: mpsc::UnboundedSender<Future<T>>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Future<T>>>,
    tasks: Mutex<Vec<Submitted<T>>>,
}

impl<T: Send + 'static> Default for Completer<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Send + 'static> Completer<T> {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Completer {
            tx,
            rx: tokio::sync::Mutex::new(rx),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Submits work; its future will surface from [`Completer::next`]
    /// once resolved.
    pub fn submit<F>(&self, work: F) -> Future<T>
    where
        F: std::future::Future<Output = Result<T>> + Send + 'static,
    {
        let task = Task::new(work);
        let future = task.future();
        let tx = self.tx.clone();
        let completed = future.clone();
        let handle = tokio::spawn(async move {
            task.run().await;
            let _ = tx.send(completed);
        });
        self.tasks.lock().push(Submitted {
            future: future.clone(),
            handle,
        });
        future
    }

    /// Returns the next resolved future, in completion order. Waits if
    /// none has resolved yet.
    pub async fn next(&self) -> Future<T> {
        self.rx
            .lock()
            .await
            .recv()
            .await
            .expect("completer holds a sender; the channel cannot close")
    }
}

impl<T> Drop for Completer<T> {
    fn drop(&mut self) {
        for task in self.tasks.get_mut().drain(..) {
            task.future.cancel();
            task.handle.abort();
        }
    }
}
