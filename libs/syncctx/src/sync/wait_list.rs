// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::awaiter::Continuation;
use crate::loom::sync::atomic::{AtomicBool, Ordering};
use crate::loom::sync::{Condvar, Mutex};
use core::{fmt, mem};

/// A one-shot completion flag with a list of continuations waiting on it.
///
/// This is the registration half of every background-completed awaiter. Registration and
/// completion serialize on the same lock, so a continuation is either in the list when the
/// list is drained by [`complete`], or is handed straight back by [`register`] because the
/// list already completed. Never both, never neither.
///
/// A producer that goes away without completing the list should [`abandon`] it instead, which
/// drops every waiting continuation (and whatever they keep alive) without running it.
///
/// [`abandon`]: Self::abandon
/// [`complete`]: Self::complete
/// [`register`]: Self::register
pub struct WaitList {
    state: Mutex<State>,
    /// Mirrors `state` so that polling doesn't need the lock.
    completed: AtomicBool,
    cond: Condvar,
}

enum State {
    Waiting(Vec<Continuation>),
    Completed,
    Abandoned,
}

// === impl WaitList ===

impl WaitList {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::Waiting(Vec::new())),
            completed: AtomicBool::new(false),
            cond: Condvar::new(),
        }
    }

    #[inline]
    pub fn is_completed(&self) -> bool {
        self.completed.load(Ordering::Acquire)
    }

    /// Adds a continuation to the list.
    ///
    /// Returns the continuation back if the list already completed, the caller is then
    /// responsible for scheduling it. Continuations registered with an abandoned list are
    /// dropped.
    #[must_use = "a continuation handed back must be scheduled by the caller"]
    pub fn register(&self, continuation: Continuation) -> Option<Continuation> {
        let mut state = self.state.lock();
        match &mut *state {
            State::Waiting(list) => {
                list.push(continuation);
                None
            }
            State::Completed => Some(continuation),
            State::Abandoned => {
                drop(state);
                drop(continuation);
                None
            }
        }
    }

    /// Marks the list completed, returning every continuation registered so far.
    ///
    /// Only the first call returns `Some`, later calls and calls on an abandoned list are
    /// no-ops. This is what makes timers with at-least-once delivery safe to wire up directly.
    #[must_use = "drained continuations must be scheduled by the caller"]
    pub fn complete(&self) -> Option<Vec<Continuation>> {
        let mut state = self.state.lock();
        let State::Waiting(list) = &mut *state else {
            return None;
        };
        let list = mem::take(list);
        *state = State::Completed;
        self.completed.store(true, Ordering::Release);
        drop(state);

        self.cond.notify_all();
        tracing::trace!(continuations = list.len(), "wait list completed");
        Some(list)
    }

    /// Gives up on ever completing the list, dropping every waiting continuation.
    ///
    /// Does nothing if the list already completed or was abandoned before. Returns the number
    /// of continuations dropped.
    pub fn abandon(&self) -> usize {
        let mut state = self.state.lock();
        let State::Waiting(list) = &mut *state else {
            return 0;
        };
        let list = mem::take(list);
        *state = State::Abandoned;
        drop(state);

        self.cond.notify_all();
        let dropped = list.len();
        // continuations may own the last handle to something that takes this lock again
        drop(list);
        tracing::trace!(dropped, "wait list abandoned");
        dropped
    }

    pub fn is_abandoned(&self) -> bool {
        matches!(*self.state.lock(), State::Abandoned)
    }

    /// Blocks the calling thread until the list completes or is abandoned.
    pub fn wait(&self) {
        let mut state = self.state.lock();
        while matches!(*state, State::Waiting(_)) {
            state = self.cond.wait(state);
        }
    }

    /// Number of continuations currently waiting.
    pub fn len(&self) -> usize {
        match &*self.state.lock() {
            State::Waiting(list) => list.len(),
            State::Completed | State::Abandoned => 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for WaitList {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for WaitList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WaitList")
            .field("completed", &self.is_completed())
            .field("abandoned", &self.is_abandoned())
            .field("waiting", &self.len())
            .finish_non_exhaustive()
    }
}
