// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! One-shot completion sources.
//!
//! A [`CompletionSource`] is the producing half: whoever owns it decides how the operation
//! ends (a value, an error, a panic or cancellation). The [`Completion`] is the consuming
//! half and can be awaited by state machines, polled, or waited on from blocking code.

use crate::awaiter::{Affinity, Awaitable, Awaiter, Continuation, Notify};
use crate::error::CompletionError;
use crate::sync::WaitList;
use crate::work_item::PanicPayload;
use core::{fmt, mem};
use parking_lot::Mutex;
use static_assertions::assert_impl_all;
use std::sync::Arc;

/// The producing half of a one-shot completion.
///
/// Dropping a source that was never completed cancels it, so waiters can't hang on a
/// producer that went away.
pub struct CompletionSource<T> {
    shared: Arc<Shared<T>>,
}

/// The consuming half of a one-shot completion.
///
/// Cloning is cheap, every clone observes the same outcome. The outcome itself can only be
/// taken out once, by any of the clones or their awaiters.
pub struct Completion<T> {
    shared: Arc<Shared<T>>,
}

/// [`Awaiter`] for a [`Completion`], created by [`Completion::awaiter_on`] or
/// [`Awaitable::get_awaiter`].
pub struct CompletionAwaiter<T> {
    shared: Arc<Shared<T>>,
    affinity: Affinity,
}

struct Shared<T> {
    outcome: Mutex<Outcome<T>>,
    /// Completed only after `outcome` was set, so observing completion implies a result.
    list: WaitList,
}

enum Outcome<T> {
    Pending,
    Ready(Result<T, CompletionError>),
    Taken,
}

assert_impl_all!(CompletionSource<()>: Send, Sync);
assert_impl_all!(Completion<()>: Send, Sync, Clone);
assert_impl_all!(CompletionAwaiter<()>: Send, Sync);

/// Creates a linked source and completion pair.
pub fn completion_source<T>() -> (CompletionSource<T>, Completion<T>) {
    let source = CompletionSource::new();
    let completion = source.completion();
    (source, completion)
}

// === impl Shared ===

impl<T> Shared<T> {
    fn try_complete(&self, result: Result<T, CompletionError>) -> bool {
        let mut outcome = self.outcome.lock();
        if !matches!(*outcome, Outcome::Pending) {
            return false;
        }
        *outcome = Outcome::Ready(result);
        drop(outcome);

        // each continuation carries the affinity of the awaiter that registered it
        for continuation in self.list.complete().into_iter().flatten() {
            continuation();
        }
        true
    }

    fn take(&self) -> Result<T, CompletionError> {
        self.list.wait();
        match self.try_take() {
            Some(result) => result,
            None => unreachable!("wait list completed before the outcome was set"),
        }
    }

    fn try_take(&self) -> Option<Result<T, CompletionError>> {
        let mut outcome = self.outcome.lock();
        match mem::replace(&mut *outcome, Outcome::Taken) {
            Outcome::Ready(result) => Some(result),
            Outcome::Pending => {
                *outcome = Outcome::Pending;
                None
            }
            Outcome::Taken => {
                drop(outcome);
                panic!("the result of this completion was already taken");
            }
        }
    }
}

// === impl CompletionSource ===

impl<T> CompletionSource<T> {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                outcome: Mutex::new(Outcome::Pending),
                list: WaitList::new(),
            }),
        }
    }

    /// Returns a handle observing this source.
    pub fn completion(&self) -> Completion<T> {
        Completion {
            shared: self.shared.clone(),
        }
    }

    pub fn is_completed(&self) -> bool {
        self.shared.list.is_completed()
    }

    /// Completes the source with a value.
    ///
    /// # Panics
    ///
    /// In debug builds, panics if the source was already completed. Release builds keep the
    /// first outcome.
    #[track_caller]
    pub fn set_result(&self, value: T) {
        let set = self.try_set_result(value);
        debug_assert!(set, "completion source was already completed");
    }

    /// Completes the source with an error.
    ///
    /// # Panics
    ///
    /// In debug builds, panics if the source was already completed.
    #[track_caller]
    pub fn set_error(&self, error: anyhow::Error) {
        let set = self.try_set_error(error);
        debug_assert!(set, "completion source was already completed");
    }

    /// Completes the source with a caught panic, to be resumed by whoever takes the result.
    ///
    /// # Panics
    ///
    /// In debug builds, panics if the source was already completed.
    #[track_caller]
    pub fn set_panic(&self, payload: PanicPayload) {
        let set = self.try_set_panic(payload);
        debug_assert!(set, "completion source was already completed");
    }

    /// Cancels the source.
    ///
    /// # Panics
    ///
    /// In debug builds, panics if the source was already completed.
    #[track_caller]
    pub fn set_cancelled(&self) {
        let set = self.try_set_cancelled();
        debug_assert!(set, "completion source was already completed");
    }

    /// Returns `false` (and drops `value`) if the source was already completed.
    pub fn try_set_result(&self, value: T) -> bool {
        self.shared.try_complete(Ok(value))
    }

    pub fn try_set_error(&self, error: anyhow::Error) -> bool {
        self.shared.try_complete(Err(CompletionError::Failed(error)))
    }

    pub fn try_set_panic(&self, payload: PanicPayload) -> bool {
        self.shared.try_complete(Err(CompletionError::Panic(payload)))
    }

    pub fn try_set_cancelled(&self) -> bool {
        self.shared.try_complete(Err(CompletionError::Cancelled))
    }
}

impl<T> Default for CompletionSource<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Drop for CompletionSource<T> {
    fn drop(&mut self) {
        if self.shared.try_complete(Err(CompletionError::Cancelled)) {
            tracing::trace!("completion source dropped before completing, cancelled");
        }
    }
}

impl<T> fmt::Debug for CompletionSource<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompletionSource")
            .field("completed", &self.is_completed())
            .finish_non_exhaustive()
    }
}

// === impl Completion ===

impl<T> Completion<T> {
    pub fn is_completed(&self) -> bool {
        self.shared.list.is_completed()
    }

    /// Blocks the calling thread until the source completes and takes the result.
    ///
    /// # Errors
    ///
    /// Returns the [`CompletionError`] the source was completed with.
    ///
    /// # Panics
    ///
    /// Panics if the result was already taken.
    pub fn wait(&self) -> Result<T, CompletionError> {
        self.shared.take()
    }

    /// Takes the result if the source has completed, without blocking.
    ///
    /// # Panics
    ///
    /// Panics if the result was already taken.
    pub fn try_take(&self) -> Option<Result<T, CompletionError>> {
        self.shared.try_take()
    }

    /// Returns an awaiter whose continuations are scheduled through `affinity`.
    pub fn awaiter_on(&self, affinity: Affinity) -> CompletionAwaiter<T> {
        CompletionAwaiter {
            shared: self.shared.clone(),
            affinity,
        }
    }
}

impl<T> Clone for Completion<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T: Send + 'static> Awaitable for Completion<T> {
    type Output = Result<T, CompletionError>;
    type Awaiter = CompletionAwaiter<T>;

    /// Captures the calling thread's current execution context as the continuation target.
    fn get_awaiter(self) -> Self::Awaiter {
        self.awaiter_on(Affinity::capture())
    }
}

impl<T> fmt::Debug for Completion<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Completion")
            .field("completed", &self.is_completed())
            .finish_non_exhaustive()
    }
}

// === impl CompletionAwaiter ===

impl<T: Send> Notify for CompletionAwaiter<T> {
    fn is_completed(&self) -> bool {
        self.shared.list.is_completed()
    }

    fn on_completed(&self, continuation: Continuation) {
        let affinity = self.affinity.clone();
        let scheduled = Box::new(move || affinity.schedule(continuation));
        if let Some(scheduled) = self.shared.list.register(scheduled) {
            scheduled();
        }
    }
}

impl<T: Send> Awaiter for CompletionAwaiter<T> {
    type Output = Result<T, CompletionError>;

    fn get_result(&self) -> Self::Output {
        self.shared.take()
    }
}

impl<T> fmt::Debug for CompletionAwaiter<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompletionAwaiter")
            .field("completed", &self.shared.list.is_completed())
            .field("affinity", &self.affinity)
            .finish_non_exhaustive()
    }
}
