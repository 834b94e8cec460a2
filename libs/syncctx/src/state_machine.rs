// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Hand-built resumable state machines.
//!
//! A [`StateMachine`] replaces sequential code with discrete steps, split at the points where
//! it awaits something. The [`Driver`] owns the machine and runs it forward from its current
//! [`State`] until it either finishes or hits an awaiter that hasn't completed yet. In the
//! latter case it registers itself as that awaiter's continuation and returns, freeing the
//! thread it was running on.
//!
//! An awaiter that is *already* complete when polled does not suspend the machine, the
//! driver falls through to the next step synchronously without a trip through any queue.

use crate::awaiter::Notify;
use crate::completion::{Completion, CompletionSource};
use core::any::type_name;
use core::fmt;
use core::sync::atomic::{AtomicUsize, Ordering};
use parking_lot::Mutex;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

/// Where a state machine resumes.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum State {
    /// Nothing ran yet.
    Start,
    /// The awaiter of suspend point `n` (in source order, counting from zero) has completed.
    Resumed(usize),
    /// The machine has produced its result. No further steps run.
    Done,
}

/// What a step ended with.
pub enum Step<T> {
    /// Suspend until the given awaiter completes.
    Await(Arc<dyn Notify>),
    /// The machine finished with a value.
    Done(T),
}

/// A resumable computation.
///
/// `step` runs the block of code belonging to `state` and returns either the next awaiter
/// or the final output. Errors and panics raised by a step end the machine and are routed
/// to its [`Completion`], they never unwind into whatever thread resumed the machine.
pub trait StateMachine: Send + 'static {
    type Output: Send + 'static;

    /// # Errors
    ///
    /// Any error returned here completes the machine with
    /// [`CompletionError::Failed`](crate::CompletionError::Failed).
    fn step(&mut self, state: State) -> anyhow::Result<Step<Self::Output>>;
}

/// Drives a [`StateMachine`] through its states.
pub struct Driver<M: StateMachine> {
    inner: Arc<Inner<M>>,
}

struct Inner<M: StateMachine> {
    /// `None` once the machine finished, so its resources are released early.
    machine: Mutex<Option<M>>,
    source: CompletionSource<M::Output>,
    /// Encoded [`State`], readable while the machine is running.
    state: AtomicUsize,
    resume_count: AtomicUsize,
}

const STATE_START: usize = 0;
const STATE_DONE: usize = usize::MAX;

impl State {
    fn encode(self) -> usize {
        match self {
            State::Start => STATE_START,
            State::Resumed(n) => n + 1,
            State::Done => STATE_DONE,
        }
    }

    fn decode(raw: usize) -> Self {
        match raw {
            STATE_START => State::Start,
            STATE_DONE => State::Done,
            n => State::Resumed(n - 1),
        }
    }

    /// The state after suspending in `self`.
    fn next(self) -> Self {
        match self {
            State::Start => State::Resumed(0),
            State::Resumed(n) => State::Resumed(n + 1),
            State::Done => State::Done,
        }
    }
}

// === impl Step ===

impl<T> Step<T> {
    /// Suspends on a clone of `awaiter`, so the machine can keep its own handle to read the
    /// result from once resumed.
    pub fn await_on<N: Notify + 'static>(awaiter: &Arc<N>) -> Self {
        Step::Await(awaiter.clone())
    }
}

impl<T> fmt::Debug for Step<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Step::Await(notify) => f
                .debug_tuple("Await")
                .field(&format_args!("completed: {}", notify.is_completed()))
                .finish(),
            Step::Done(_) => f.write_str("Done(..)"),
        }
    }
}

// === impl Driver ===

impl<M: StateMachine> Driver<M> {
    /// Wraps `machine` without running it.
    pub fn new(machine: M) -> Self {
        Self {
            inner: Arc::new(Inner {
                machine: Mutex::new(Some(machine)),
                source: CompletionSource::new(),
                state: AtomicUsize::new(STATE_START),
                resume_count: AtomicUsize::new(0),
            }),
        }
    }

    /// Runs `machine` up to its first incomplete awaiter and returns the handle to its result.
    pub fn start(machine: M) -> Completion<M::Output> {
        let driver = Self::new(machine);
        let completion = driver.completion();
        driver.resume();
        completion
    }

    pub fn completion(&self) -> Completion<M::Output> {
        self.inner.source.completion()
    }

    /// Runs the machine forward from its current state.
    ///
    /// Call this once to start a machine created through [`Driver::new`], afterwards it is
    /// only called by the continuations the driver registers itself.
    ///
    /// # Panics
    ///
    /// Panics if another `resume` of the same machine is running concurrently.
    pub fn resume(&self) {
        self.inner.resume();
    }

    /// The state the machine will resume in.
    pub fn state(&self) -> State {
        self.inner.state()
    }

    /// Number of times `resume` was entered, the initial start included.
    pub fn resume_count(&self) -> usize {
        self.inner.resume_count.load(Ordering::Relaxed)
    }
}

impl<M: StateMachine> Clone for Driver<M> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<M: StateMachine> fmt::Debug for Driver<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Driver")
            .field("machine", &type_name::<M>())
            .field("state", &self.state())
            .field("resume_count", &self.resume_count())
            .finish_non_exhaustive()
    }
}

impl<M: StateMachine> Inner<M> {
    fn state(&self) -> State {
        State::decode(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: State) {
        self.state.store(state.encode(), Ordering::Release);
    }

    fn resume(self: &Arc<Self>) {
        let Some(mut slot) = self.machine.try_lock() else {
            panic!(
                "state machine `{}` resumed while another resume is running",
                type_name::<M>()
            );
        };
        self.resume_count.fetch_add(1, Ordering::Relaxed);

        let _span = tracing::trace_span!("resume", machine = type_name::<M>()).entered();

        let Some(machine) = slot.as_mut() else {
            tracing::warn!("resumed a state machine that already finished");
            return;
        };

        loop {
            let state = self.state();
            tracing::trace!(state = ?state, "step");

            let step = panic::catch_unwind(AssertUnwindSafe(|| machine.step(state)));
            let outcome = match step {
                Ok(Ok(Step::Await(awaiter))) => {
                    self.set_state(state.next());
                    if awaiter.is_completed() {
                        continue;
                    }

                    // the continuation may run inline, on this very thread
                    drop(slot);
                    let this = self.clone();
                    awaiter.on_completed(Box::new(move || this.resume()));
                    return;
                }
                Ok(Ok(Step::Done(value))) => Ok(value),
                Ok(Err(err)) => Err(Failure::Error(err)),
                Err(payload) => Err(Failure::Panic(payload)),
            };

            self.set_state(State::Done);
            // release the machine (and whatever it holds) before waking anyone
            *slot = None;
            drop(slot);

            match outcome {
                Ok(value) => self.source.set_result(value),
                Err(Failure::Error(err)) => {
                    tracing::debug!(error = %err, "state machine failed");
                    self.source.set_error(err);
                }
                Err(Failure::Panic(payload)) => {
                    tracing::debug!("state machine panicked");
                    self.source.set_panic(payload);
                }
            }
            return;
        }
    }
}

enum Failure {
    Error(anyhow::Error),
    Panic(crate::work_item::PanicPayload),
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use crate::awaiter::{Continuation, Notify};
    use core::sync::atomic::AtomicBool;
    use crate::test_util::trace_init;

    /// An awaiter that is complete from the start and panics if anyone registers on it.
    struct AlwaysReady;

    impl Notify for AlwaysReady {
        fn is_completed(&self) -> bool {
            true
        }

        fn on_completed(&self, _: Continuation) {
            panic!("on_completed must not be called on a completed awaiter");
        }
    }

    /// An awaiter completed by hand.
    #[derive(Default)]
    struct Trigger {
        fired: AtomicBool,
        continuation: Mutex<Option<Continuation>>,
    }

    impl Trigger {
        fn fire(&self) {
            self.fired.store(true, Ordering::Release);
            if let Some(continuation) = self.continuation.lock().take() {
                continuation();
            }
        }
    }

    impl Notify for Trigger {
        fn is_completed(&self) -> bool {
            self.fired.load(Ordering::Acquire)
        }

        fn on_completed(&self, continuation: Continuation) {
            let prev = self.continuation.lock().replace(continuation);
            assert!(prev.is_none());
        }
    }

    struct Steps<A> {
        awaiter: Arc<A>,
        log: Arc<Mutex<Vec<State>>>,
        suspend_points: usize,
    }

    impl<A: Notify + 'static> StateMachine for Steps<A> {
        type Output = usize;

        fn step(&mut self, state: State) -> anyhow::Result<Step<usize>> {
            self.log.lock().push(state);
            let done = match state {
                State::Start => 0,
                State::Resumed(n) => n + 1,
                State::Done => unreachable!(),
            };
            if done == self.suspend_points {
                Ok(Step::Done(done))
            } else {
                Ok(Step::await_on(&self.awaiter))
            }
        }
    }

    #[test]
    fn completed_awaiter_falls_through() {
        let _trace = trace_init();

        let log = Arc::new(Mutex::new(Vec::new()));
        let driver = Driver::new(Steps {
            awaiter: Arc::new(AlwaysReady),
            log: log.clone(),
            suspend_points: 3,
        });
        let completion = driver.completion();
        driver.resume();

        assert_eq!(completion.try_take().unwrap().unwrap(), 3);
        assert_eq!(driver.resume_count(), 1);
        assert_eq!(driver.state(), State::Done);
        assert_eq!(
            *log.lock(),
            [State::Start, State::Resumed(0), State::Resumed(1), State::Resumed(2)]
        );
    }

    #[test]
    fn suspends_and_resumes() {
        let _trace = trace_init();

        let trigger = Arc::new(Trigger::default());
        let log = Arc::new(Mutex::new(Vec::new()));
        let driver = Driver::new(Steps {
            awaiter: trigger.clone(),
            log: log.clone(),
            suspend_points: 1,
        });
        let completion = driver.completion();

        driver.resume();
        assert!(!completion.is_completed());
        assert_eq!(driver.state(), State::Resumed(0));
        assert_eq!(driver.resume_count(), 1);

        trigger.fire();
        assert_eq!(completion.wait().unwrap(), 1);
        assert_eq!(driver.resume_count(), 2);
        assert_eq!(*log.lock(), [State::Start, State::Resumed(0)]);
    }

    struct Failing {
        panic: bool,
    }

    impl StateMachine for Failing {
        type Output = ();

        fn step(&mut self, state: State) -> anyhow::Result<Step<()>> {
            assert_eq!(state, State::Start);
            if self.panic {
                panic!("step exploded");
            }
            anyhow::bail!("step failed")
        }
    }

    #[test]
    fn errors_and_panics_are_routed_to_the_completion() {
        let err = Driver::start(Failing { panic: false }).wait().unwrap_err();
        assert!(err.to_string().contains("step failed"));

        let err = Driver::start(Failing { panic: true }).wait().unwrap_err();
        assert!(err.is_panic());
        assert!(err.to_string().contains("step exploded"));
    }

    struct Reentrant {
        driver: Arc<Mutex<Option<Driver<Reentrant>>>>,
    }

    impl StateMachine for Reentrant {
        type Output = ();

        fn step(&mut self, _: State) -> anyhow::Result<Step<()>> {
            let driver = self.driver.lock().clone();
            if let Some(driver) = driver {
                driver.resume();
            }
            Ok(Step::Done(()))
        }
    }

    #[test]
    fn concurrent_resume_is_detected() {
        let slot = Arc::new(Mutex::new(None));
        let driver = Driver::new(Reentrant {
            driver: slot.clone(),
        });
        *slot.lock() = Some(driver.clone());

        driver.resume();
        let err = driver.completion().wait().unwrap_err();
        assert!(err.is_panic());
        assert!(err.to_string().contains("resumed while another resume is running"));
    }
}
