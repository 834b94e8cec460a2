// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Adapter for driving externally supplied work through a state machine.
//!
//! An event loop hands over an opaque `callback(argument)` that kicks off some work and
//! returns an [`Awaiter`] for it. [`dispatch`] runs it and tells the loop's [`DispatchHook`]
//! when the work is about to take a while and when it finished.

use crate::awaiter::Awaiter;
use crate::completion::Completion;
use crate::state_machine::{Driver, State, StateMachine, Step};
use core::fmt;
use std::sync::Arc;

/// Notifications an event loop receives about work dispatched through [`dispatch`].
pub trait DispatchHook: Send + Sync {
    /// The dispatched work did not complete synchronously and is about to suspend.
    fn will_suspend(&self);

    /// The dispatched work completed.
    fn did_complete(&self);
}

/// Invokes `callback(argument)` and drives the awaiter it returns to completion.
///
/// `hook.will_suspend()` is called once if the awaiter is not complete right away, and
/// `hook.did_complete()` once after it completed, whether that happened synchronously or
/// through a continuation. If the callback (or the awaiter's result) panics the panic is
/// delivered through the returned [`Completion`] and `did_complete` is never called.
pub fn dispatch<F, A, W>(
    hook: Arc<dyn DispatchHook>,
    callback: F,
    argument: A,
) -> Completion<W::Output>
where
    F: FnOnce(A) -> W + Send + 'static,
    A: Send + 'static,
    W: Awaiter + 'static,
    W::Output: Send + 'static,
{
    Driver::start(HandleEvent {
        hook,
        work: Some((callback, argument)),
        awaiter: None,
    })
}

/// The state machine behind [`dispatch`].
pub struct HandleEvent<F, A, W> {
    hook: Arc<dyn DispatchHook>,
    work: Option<(F, A)>,
    awaiter: Option<Arc<W>>,
}

impl<F, A, W> StateMachine for HandleEvent<F, A, W>
where
    F: FnOnce(A) -> W + Send + 'static,
    A: Send + 'static,
    W: Awaiter + 'static,
    W::Output: Send + 'static,
{
    type Output = W::Output;

    fn step(&mut self, state: State) -> anyhow::Result<Step<W::Output>> {
        match state {
            State::Start => {
                let Some((callback, argument)) = self.work.take() else {
                    anyhow::bail!("event was already dispatched");
                };

                let awaiter = Arc::new(callback(argument));
                if !awaiter.is_completed() {
                    tracing::trace!("dispatched work suspends");
                    self.hook.will_suspend();
                }

                let step = Step::await_on(&awaiter);
                self.awaiter = Some(awaiter);
                Ok(step)
            }
            State::Resumed(0) => {
                let Some(awaiter) = self.awaiter.take() else {
                    anyhow::bail!("resumed without an awaiter");
                };
                let output = awaiter.get_result();
                self.hook.did_complete();
                Ok(Step::Done(output))
            }
            state => anyhow::bail!("`HandleEvent` has no state {state:?}"),
        }
    }
}

impl<F, A, W> fmt::Debug for HandleEvent<F, A, W> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandleEvent")
            .field("dispatched", &self.work.is_none())
            .field("awaiting", &self.awaiter.is_some())
            .finish_non_exhaustive()
    }
}
