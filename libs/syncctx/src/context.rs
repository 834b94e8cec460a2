// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The single-logical-thread execution context.
//!
//! An [`ExecutionContext`] owns a [`WorkQueue`] and one dedicated worker thread that pops
//! items off the queue and runs them to completion, one at a time, in the order they were
//! enqueued. Code running on the worker can discover the context it runs on through
//! [`ExecutionContext::current`], which is how awaiters capture "where to resume" when they
//! are created.

use crate::error::{Closed, StartError, panic_message};
use crate::work_item::{Delivery, WorkItem};
use crate::work_queue::WorkQueue;
use core::cell::RefCell;
use core::marker::PhantomData;
use core::sync::atomic::{AtomicU64, Ordering};
use core::{fmt, mem};
use parking_lot::Mutex;
use static_assertions::assert_impl_all;
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};

std::thread_local! {
    static CURRENT: RefCell<Option<ContextHandle>> = RefCell::new(None);
}

/// Opaque identifier of an [`ExecutionContext`], unique for the lifetime of the process.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq)]
pub struct ContextId(u64);

#[derive(Debug, Clone)]
pub struct Builder {
    name: String,
    stack_size: Option<usize>,
    catch_panics: bool,
}

/// A cooperative, single-logical-thread executor.
///
/// At most one callback enqueued on a given context runs at any instant. Work is admitted
/// through [`post`](Self::post) (fire and forget) or [`send`](Self::send) (block until done)
/// and executed on a dedicated worker spawned by [`start`](Self::start).
///
/// Dropping the context stops it and waits for the worker to drain the queue.
pub struct ExecutionContext {
    handle: ContextHandle,
    config: Builder,
    worker: Mutex<WorkerState>,
}

/// A cheap, cloneable reference to an [`ExecutionContext`] that can be sent to other threads
/// and used to enqueue work.
#[derive(Clone)]
pub struct ContextHandle {
    shared: Arc<Shared>,
}
assert_impl_all!(ContextHandle: Send, Sync);

struct Shared {
    id: ContextId,
    name: String,
    queue: WorkQueue,
    worker_thread: Mutex<Option<ThreadId>>,
}

#[derive(Debug)]
enum WorkerState {
    Idle,
    Running(JoinHandle<()>),
    Finished,
}

/// Restores the previous ambient context when dropped, see [`ContextHandle::enter`].
#[must_use = "dropping the guard immediately leaves the context again"]
pub struct EnterGuard {
    prev: Option<ContextHandle>,
    // the guard manipulates thread-local state and must be dropped on the thread it was created on
    _not_send: PhantomData<*const ()>,
}

// === impl ContextId ===

impl ContextId {
    fn next() -> Self {
        static NEXT_ID: AtomicU64 = AtomicU64::new(1);
        Self(NEXT_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

// === impl Builder ===

impl Default for Builder {
    fn default() -> Self {
        Self::new()
    }
}

impl Builder {
    pub fn new() -> Self {
        Self {
            name: String::from("syncctx-worker"),
            stack_size: None,
            catch_panics: true,
        }
    }

    /// Override the name of the worker thread, this also shows up in the worker's span.
    ///
    /// By default, workers are named `"syncctx-worker"`.
    #[must_use]
    pub fn name(mut self, name: &str) -> Self {
        self.name = String::from(name);
        self
    }

    /// Override the stack size of the worker thread.
    ///
    /// By default, the platform's default thread stack size is used.
    #[must_use]
    pub fn stack_size(mut self, stack_size: usize) -> Self {
        self.stack_size = Some(stack_size);
        self
    }

    /// Whether panics escaping a posted callback are caught (and logged) by the worker.
    ///
    /// When disabled, a panicking callback unwinds through and terminates the worker thread.
    /// By default, panics are caught.
    #[must_use]
    pub fn catch_panics(mut self, catch_panics: bool) -> Self {
        self.catch_panics = catch_panics;
        self
    }

    pub fn build(self) -> ExecutionContext {
        let shared = Shared {
            id: ContextId::next(),
            name: self.name.clone(),
            queue: WorkQueue::new(),
            worker_thread: Mutex::new(None),
        };

        ExecutionContext {
            handle: ContextHandle {
                shared: Arc::new(shared),
            },
            config: self,
            worker: Mutex::new(WorkerState::Idle),
        }
    }
}

// === impl ExecutionContext ===

impl Default for ExecutionContext {
    fn default() -> Self {
        Self::new()
    }
}

impl ExecutionContext {
    /// Creates an idle context with the default configuration.
    ///
    /// The context accepts work right away, but nothing runs until [`start`](Self::start) is
    /// called.
    pub fn new() -> Self {
        Builder::new().build()
    }

    pub fn builder() -> Builder {
        Builder::new()
    }

    /// Returns the context the calling thread is associated with, if any.
    ///
    /// This is set on a context's worker thread for as long as its loop runs, and on any
    /// thread that [entered](ContextHandle::enter) a context.
    pub fn current() -> Option<ContextHandle> {
        CURRENT.with(|current| current.borrow().clone())
    }

    #[inline]
    pub fn handle(&self) -> &ContextHandle {
        &self.handle
    }

    #[inline]
    pub fn id(&self) -> ContextId {
        self.handle.id()
    }

    /// See [`ContextHandle::post`].
    ///
    /// # Errors
    ///
    /// Returns [`Closed`] if the context was stopped.
    #[inline]
    pub fn post<F, A>(&self, callback: F, argument: A) -> Result<(), Closed>
    where
        F: FnOnce(A) + Send + 'static,
        A: Send + 'static,
    {
        self.handle.post(callback, argument)
    }

    /// See [`ContextHandle::send`].
    ///
    /// # Errors
    ///
    /// Returns [`Closed`] if the context was stopped before the callback could run.
    ///
    /// # Panics
    ///
    /// Resumes the callback's panic on the calling thread.
    #[inline]
    pub fn send<F, A>(&self, callback: F, argument: A) -> Result<(), Closed>
    where
        F: FnOnce(A) + Send + 'static,
        A: Send + 'static,
    {
        self.handle.send(callback, argument)
    }

    /// Spawns the worker thread.
    ///
    /// The worker installs this context as the [current](Self::current) context of its thread
    /// and then processes items until it encounters the stop sentinel.
    ///
    /// # Errors
    ///
    /// Returns [`StartError::AlreadyStarted`] if called more than once, or
    /// [`StartError::Spawn`] if the thread could not be spawned.
    pub fn start(&self) -> Result<(), StartError> {
        let mut worker = self.worker.lock();
        if !matches!(*worker, WorkerState::Idle) {
            return Err(StartError::AlreadyStarted);
        }

        let handle = self.handle.clone();
        let catch_panics = self.config.catch_panics;

        let mut builder = thread::Builder::new().name(self.config.name.clone());
        if let Some(stack_size) = self.config.stack_size {
            builder = builder.stack_size(stack_size);
        }
        let join = builder.spawn(move || run(handle, catch_panics))?;

        tracing::debug!(
            context.id = %self.id(),
            context.name = %self.config.name,
            "started execution context"
        );
        *worker = WorkerState::Running(join);

        Ok(())
    }

    /// Enqueues the stop sentinel.
    ///
    /// Items enqueued before the sentinel still run, afterwards the worker exits its loop and
    /// further `post`/`send` calls are rejected with [`Closed`].
    ///
    /// # Errors
    ///
    /// Returns [`Closed`] if the context was already stopped.
    pub fn stop(&self) -> Result<(), Closed> {
        tracing::debug!(context.id = %self.id(), "stopping execution context");
        self.handle.shared.queue.close()
    }

    /// Blocks until the worker thread has exited.
    ///
    /// This is a no-op if the context was never started, or when called from the worker
    /// thread itself.
    pub fn join(&self) {
        if self.handle.is_worker_thread() {
            tracing::warn!(context.id = %self.id(), "refusing to join the worker from itself");
            return;
        }

        let mut worker = self.worker.lock();
        match mem::replace(&mut *worker, WorkerState::Finished) {
            WorkerState::Running(join) => {
                if join.join().is_err() {
                    tracing::error!(context.id = %self.id(), "worker thread panicked");
                }
            }
            other => *worker = other,
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(*self.worker.lock(), WorkerState::Running(_))
    }
}

impl Drop for ExecutionContext {
    fn drop(&mut self) {
        // the only error is "already stopped", which is what we want anyway
        let _ = self.stop();

        if matches!(*self.worker.lock(), WorkerState::Idle) {
            // nobody will ever run these, release any blocked senders
            while let Some(item) = self.handle.shared.queue.try_pop() {
                drop(item);
            }
        }

        self.join();
    }
}

impl fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("handle", &self.handle)
            .field("config", &self.config)
            .field("worker", &self.worker)
            .finish()
    }
}

fn run(handle: ContextHandle, catch_panics: bool) {
    *handle.shared.worker_thread.lock() = Some(thread::current().id());
    let _enter = handle.enter();
    let _close = CloseOnUnwind(&handle.shared.queue);

    let _span = tracing::debug_span!(
        "execution context",
        context.id = %handle.id(),
        context.name = %handle.name()
    )
    .entered();

    let mut processed: u64 = 0;
    loop {
        let item = handle.shared.queue.pop_blocking();

        if !item.is_run_item() {
            tracing::debug!(processed, "stop sentinel received, shutting down");
            break;
        }

        tracing::trace!(?item, "running work item");
        if let Err(payload) = item.invoke(catch_panics) {
            tracing::error!(
                panic = panic_message(payload.as_ref()).unwrap_or("<non-string payload>"),
                "posted callback panicked"
            );
        }
        processed += 1;
    }
}

/// Closes and drains the queue if the worker thread unwinds, so a dead worker rejects new
/// items and releases every blocked sender with [`Closed`].
struct CloseOnUnwind<'a>(&'a WorkQueue);

impl Drop for CloseOnUnwind<'_> {
    fn drop(&mut self) {
        if !thread::panicking() {
            return;
        }

        // `stop` may have closed the queue already, the backlog still needs draining
        let _ = self.0.close();
        let mut dropped: usize = 0;
        while let Some(item) = self.0.try_pop() {
            dropped += usize::from(item.is_run_item());
            drop(item);
        }
        tracing::error!(dropped, "worker thread panicked, closed its queue");
    }
}

// === impl ContextHandle ===

impl ContextHandle {
    #[inline]
    pub fn id(&self) -> ContextId {
        self.shared.id
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Enqueues `callback(argument)` and returns immediately.
    ///
    /// Items posted from the same thread run in the order they were posted, no order is
    /// promised relative to items posted concurrently from other threads.
    ///
    /// # Errors
    ///
    /// Returns [`Closed`] if the context was stopped.
    pub fn post<F, A>(&self, callback: F, argument: A) -> Result<(), Closed>
    where
        F: FnOnce(A) + Send + 'static,
        A: Send + 'static,
    {
        tracing::trace!(context.id = %self.id(), "post");
        self.shared.queue.push(WorkItem::new(callback, argument))
    }

    /// Enqueues `callback(argument)` and blocks until the worker has invoked it.
    ///
    /// Calling this from the context's own worker thread can never make progress (the worker
    /// would wait on itself). Debug builds catch this with an assertion.
    ///
    /// # Errors
    ///
    /// Returns [`Closed`] if the context was stopped before the callback could run.
    ///
    /// # Panics
    ///
    /// If the callback panics on the worker, the panic is resumed on the calling thread.
    pub fn send<F, A>(&self, callback: F, argument: A) -> Result<(), Closed>
    where
        F: FnOnce(A) + Send + 'static,
        A: Send + 'static,
    {
        debug_assert!(
            !self.is_worker_thread(),
            "`send` called from the worker thread of context {}, this would deadlock",
            self.id()
        );
        tracing::trace!(context.id = %self.id(), "send");

        let (item, signal) = WorkItem::with_signal(callback, argument);
        self.shared.queue.push(item)?;

        match signal.wait() {
            Delivery::Completed => Ok(()),
            Delivery::Panicked(payload) => std::panic::resume_unwind(payload),
            Delivery::Dropped => Err(Closed(())),
        }
    }

    /// Returns `true` if this context is the calling thread's [current] context.
    ///
    /// [current]: ExecutionContext::current
    pub fn is_current(&self) -> bool {
        CURRENT.with(|current| {
            current
                .borrow()
                .as_ref()
                .is_some_and(|current| current.id() == self.id())
        })
    }

    /// Returns `true` if called from this context's worker thread.
    pub fn is_worker_thread(&self) -> bool {
        *self.shared.worker_thread.lock() == Some(thread::current().id())
    }

    /// Number of items waiting in the queue.
    pub fn pending(&self) -> usize {
        self.shared.queue.len()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.queue.is_closed()
    }

    /// Makes this context the calling thread's [current] context until the guard is dropped.
    ///
    /// This bridges threads that were not spawned by the context (e.g. a test's main thread)
    /// into it, so awaiters created there capture this context.
    ///
    /// [current]: ExecutionContext::current
    pub fn enter(&self) -> EnterGuard {
        let prev = CURRENT.with(|current| current.borrow_mut().replace(self.clone()));
        EnterGuard {
            prev,
            _not_send: PhantomData,
        }
    }
}

impl fmt::Debug for ContextHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContextHandle")
            .field("id", &self.shared.id)
            .field("name", &self.shared.name)
            .field("pending", &self.shared.queue.len())
            .finish_non_exhaustive()
    }
}

impl PartialEq for ContextHandle {
    fn eq(&self, other: &Self) -> bool {
        self.id() == other.id()
    }
}

impl Eq for ContextHandle {}

// === impl EnterGuard ===

impl Drop for EnterGuard {
    fn drop(&mut self) {
        let prev = self.prev.take();
        CURRENT.with(|current| *current.borrow_mut() = prev);
    }
}

impl fmt::Debug for EnterGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EnterGuard")
            .field("prev", &self.prev)
            .finish_non_exhaustive()
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use crate::test_util::trace_init;
    use core::sync::atomic::{AtomicBool, AtomicUsize};
    use std::panic::AssertUnwindSafe;
    use std::sync::mpsc;

    type Log = Arc<Mutex<String>>;

    fn append(log: &Log, s: &str) {
        log.lock().push_str(s);
    }

    #[test]
    fn fifo_when_posted_before_start() {
        let _trace = trace_init();
        let ctx = ExecutionContext::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        for n in 0..64 {
            ctx.post(
                |(log, n): (Arc<Mutex<Vec<usize>>>, usize)| log.lock().push(n),
                (log.clone(), n),
            )
            .unwrap();
        }

        ctx.start().unwrap();
        ctx.stop().unwrap();
        ctx.join();

        assert_eq!(*log.lock(), (0..64).collect::<Vec<_>>());
    }

    #[test]
    fn reentrant_post_keeps_order() {
        let _trace = trace_init();
        let ctx = ExecutionContext::new();
        ctx.start().unwrap();

        let log: Log = Arc::new(Mutex::new(String::new()));
        let (tx, rx) = mpsc::channel();

        ctx.post(
            |(log, tx): (Log, mpsc::Sender<()>)| {
                append(&log, "A");
                let current = ExecutionContext::current().expect("worker has a current context");
                current
                    .post(
                        |(log, tx): (Log, mpsc::Sender<()>)| {
                            append(&log, "B");
                            tx.send(()).unwrap();
                        },
                        (log.clone(), tx),
                    )
                    .unwrap();
            },
            (log.clone(), tx),
        )
        .unwrap();

        rx.recv().unwrap();
        assert_eq!(&*log.lock(), "AB");
    }

    #[test]
    fn send_returns_after_callback_ran() {
        let _trace = trace_init();
        let ctx = ExecutionContext::new();
        ctx.start().unwrap();

        for _ in 0..100 {
            let flag = Arc::new(AtomicBool::new(false));
            ctx.send(
                |flag: Arc<AtomicBool>| {
                    // make the race window as wide as possible
                    thread::yield_now();
                    flag.store(true, Ordering::Relaxed);
                },
                flag.clone(),
            )
            .unwrap();
            assert!(flag.load(Ordering::Relaxed));
        }
    }

    #[test]
    fn worker_is_the_current_context() {
        let _trace = trace_init();
        let ctx = ExecutionContext::builder().name("current-test").build();
        ctx.start().unwrap();

        assert!(ExecutionContext::current().is_none());
        assert!(!ctx.handle().is_current());

        let id = ctx.id();
        let observed = Arc::new(Mutex::new(None));
        ctx.send(
            move |observed: Arc<Mutex<Option<(ContextId, Option<String>)>>>| {
                let current = ExecutionContext::current().map(|c| c.id());
                let name = thread::current().name().map(String::from);
                *observed.lock() = current.map(|c| (c, name));
            },
            observed.clone(),
        )
        .unwrap();

        assert_eq!(
            *observed.lock(),
            Some((id, Some(String::from("current-test"))))
        );
    }

    #[test]
    fn enter_restores_previous() {
        let a = ExecutionContext::new();
        let b = ExecutionContext::new();

        let guard_a = a.handle().enter();
        assert!(a.handle().is_current());
        {
            let _guard_b = b.handle().enter();
            assert!(b.handle().is_current());
            assert!(!a.handle().is_current());
        }
        assert!(a.handle().is_current());
        drop(guard_a);
        assert!(ExecutionContext::current().is_none());
    }

    #[test]
    fn start_twice_is_rejected() {
        let ctx = ExecutionContext::new();
        ctx.start().unwrap();
        assert!(matches!(ctx.start(), Err(StartError::AlreadyStarted)));
    }

    #[test]
    fn post_after_stop_is_rejected() {
        let ctx = ExecutionContext::new();
        ctx.start().unwrap();
        ctx.stop().unwrap();

        assert_eq!(ctx.post(|()| {}, ()), Err(Closed(())));
        assert_eq!(ctx.send(|()| {}, ()), Err(Closed(())));
        assert_eq!(ctx.stop(), Err(Closed(())));

        ctx.join();
        assert!(!ctx.is_running());
    }

    #[test]
    fn stop_drains_prior_items() {
        let ctx = ExecutionContext::new();
        let ran = Arc::new(AtomicUsize::new(0));

        for _ in 0..10 {
            ctx.post(
                |ran: Arc<AtomicUsize>| {
                    ran.fetch_add(1, Ordering::Relaxed);
                },
                ran.clone(),
            )
            .unwrap();
        }
        ctx.stop().unwrap();
        ctx.start().unwrap();
        ctx.join();

        assert_eq!(ran.load(Ordering::Relaxed), 10);
    }

    #[test]
    fn panicking_post_does_not_kill_the_worker() {
        let _trace = trace_init();
        let ctx = ExecutionContext::new();
        ctx.start().unwrap();

        ctx.post(|()| panic!("posted callback went wrong"), ()).unwrap();

        let flag = Arc::new(AtomicBool::new(false));
        ctx.send(|flag: Arc<AtomicBool>| flag.store(true, Ordering::Relaxed), flag.clone())
            .unwrap();
        assert!(flag.load(Ordering::Relaxed));
    }

    #[test]
    fn uncaught_panic_closes_the_context() {
        let _trace = trace_init();
        let ctx = ExecutionContext::builder()
            .name("uncaught")
            .catch_panics(false)
            .build();
        let handle = ctx.handle().clone();
        ctx.start().unwrap();

        let (gate_tx, gate_rx) = mpsc::channel::<()>();
        ctx.post(
            move |()| {
                gate_rx.recv().unwrap();
                panic!("worker went down");
            },
            (),
        )
        .unwrap();
        while handle.pending() != 0 {
            thread::yield_now();
        }

        // queued behind the panicking callback, never invoked
        let sender = {
            let handle = handle.clone();
            thread::spawn(move || handle.send(|()| {}, ()))
        };
        while handle.pending() == 0 {
            thread::yield_now();
        }
        gate_tx.send(()).unwrap();

        assert_eq!(sender.join().unwrap(), Err(Closed(())));
        assert!(handle.is_closed());
        assert_eq!(handle.pending(), 0);
        assert_eq!(handle.post(|()| {}, ()), Err(Closed(())));
        assert_eq!(handle.send(|()| {}, ()), Err(Closed(())));
    }

    #[test]
    fn send_resumes_panic_on_sender() {
        let ctx = ExecutionContext::new();
        ctx.start().unwrap();

        let handle = ctx.handle().clone();
        let res = std::panic::catch_unwind(AssertUnwindSafe(move || {
            let _ = handle.send(|()| panic!("send went wrong"), ());
        }));
        let payload = res.unwrap_err();
        assert_eq!(payload.downcast_ref::<&str>(), Some(&"send went wrong"));

        // and the worker is still alive
        ctx.send(|()| {}, ()).unwrap();
    }

    #[test]
    fn dropping_idle_context_releases_senders() {
        let ctx = ExecutionContext::new();
        let handle = ctx.handle().clone();

        let sender = thread::spawn(move || handle.send(|()| {}, ()));
        while ctx.handle().pending() == 0 {
            thread::yield_now();
        }
        drop(ctx);

        assert_eq!(sender.join().unwrap(), Err(Closed(())));
    }
}
