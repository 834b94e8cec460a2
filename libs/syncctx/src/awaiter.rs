// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The awaitable/awaiter protocol.
//!
//! Anything that can tell whether it is done, accept a continuation to run once it is, and
//! hand out its result can suspend a [state machine](crate::state_machine). The protocol is
//! split in two: [`Notify`] is the object safe half (completion polling and continuation
//! registration) that drivers need, [`Awaiter`] adds the typed result.
//!
//! Every awaiter in this crate follows the same scheduling policy: continuations run through
//! the [`Affinity`] captured when the awaiter was created. That is a `post` onto the captured
//! context, or an inline call on whatever thread completed the awaiter when no context was
//! captured. This also applies to continuations registered *after* completion, they are
//! posted, never run inline on the registering thread, unless there is no context. The one
//! exception is [`YieldNow`](crate::YieldNow) without a context, which hops to a fresh
//! thread instead of running inline.

use crate::context::{ContextHandle, ExecutionContext};
use core::fmt;

/// "The rest of the computation" after a suspend point.
pub type Continuation = Box<dyn FnOnce() + Send + 'static>;

/// Completion polling and continuation registration.
pub trait Notify: Send + Sync {
    /// Returns `true` once the awaited operation has completed.
    fn is_completed(&self) -> bool;

    /// Registers a continuation that is scheduled exactly once, after completion.
    ///
    /// May be called any number of times, before or after completion, each continuation
    /// passed is scheduled exactly once.
    fn on_completed(&self, continuation: Continuation);
}

pub trait Awaiter: Notify {
    type Output;

    /// Returns the result of the awaited operation, blocking the calling thread if the
    /// operation hasn't completed yet.
    fn get_result(&self) -> Self::Output;
}

/// A type that can be awaited by obtaining an [`Awaiter`] for it.
pub trait Awaitable {
    type Output;
    type Awaiter: Awaiter<Output = Self::Output>;

    fn get_awaiter(self) -> Self::Awaiter;
}

impl<A: Awaiter> Awaitable for A {
    type Output = A::Output;
    type Awaiter = A;

    fn get_awaiter(self) -> Self::Awaiter {
        self
    }
}

/// Where continuations go once an awaiter completes.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Affinity(Option<ContextHandle>);

// === impl Affinity ===

impl Affinity {
    /// Run continuations inline on the completing thread.
    pub const fn none() -> Self {
        Self(None)
    }

    /// Post continuations to the given context.
    pub fn to(context: ContextHandle) -> Self {
        Self(Some(context))
    }

    /// Captures the calling thread's [current context](ExecutionContext::current).
    pub fn capture() -> Self {
        Self(ExecutionContext::current())
    }

    pub fn context(&self) -> Option<&ContextHandle> {
        self.0.as_ref()
    }

    /// Schedules a continuation according to this affinity.
    ///
    /// If the captured context has been stopped in the meantime the continuation can never
    /// run, it is dropped and a warning is logged.
    pub fn schedule(&self, continuation: Continuation) {
        match &self.0 {
            Some(context) => {
                if context
                    .post(|continuation: Continuation| continuation(), continuation)
                    .is_err()
                {
                    tracing::warn!(
                        context.id = %context.id(),
                        "dropping continuation, its execution context is closed"
                    );
                }
            }
            None => continuation(),
        }
    }
}

impl From<ContextHandle> for Affinity {
    fn from(context: ContextHandle) -> Self {
        Self::to(context)
    }
}

impl From<Option<ContextHandle>> for Affinity {
    fn from(context: Option<ContextHandle>) -> Self {
        Self(context)
    }
}

impl fmt::Debug for Affinity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.0 {
            Some(context) => f.debug_tuple("Affinity").field(&context.id()).finish(),
            None => f.write_str("Affinity(inline)"),
        }
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use core::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::sync::mpsc;

    #[test]
    fn inline_without_context() {
        let ran = Arc::new(AtomicBool::new(false));
        let ran2 = ran.clone();
        Affinity::none().schedule(Box::new(move || ran2.store(true, Ordering::Relaxed)));
        assert!(ran.load(Ordering::Relaxed));
    }

    #[test]
    fn posts_to_context() {
        let ctx = ExecutionContext::new();
        ctx.start().unwrap();

        let (tx, rx) = mpsc::channel();
        let handle = ctx.handle().clone();
        Affinity::to(handle.clone()).schedule(Box::new(move || {
            tx.send(handle.is_current()).unwrap();
        }));

        assert!(rx.recv().unwrap());
    }

    #[test]
    fn capture_picks_up_entered_context() {
        let ctx = ExecutionContext::new();
        assert_eq!(Affinity::capture(), Affinity::none());

        let _enter = ctx.handle().enter();
        assert_eq!(Affinity::capture(), Affinity::to(ctx.handle().clone()));
    }

    #[test]
    fn closed_context_drops_continuation() {
        let ctx = ExecutionContext::new();
        ctx.stop().unwrap();

        let ran = Arc::new(AtomicBool::new(false));
        let ran2 = ran.clone();
        Affinity::to(ctx.handle().clone())
            .schedule(Box::new(move || ran2.store(true, Ordering::Relaxed)));

        assert!(!ran.load(Ordering::Relaxed));
    }
}
