// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::awaiter::{Affinity, Awaiter, Continuation, Notify};
use crate::sync::WaitList;
use crate::time::Timer;
use core::fmt;
use core::time::Duration;
use static_assertions::assert_impl_all;
use std::sync::Arc;

/// An awaiter that completes once `duration` has elapsed on a [`Timer`].
///
/// Continuations are scheduled through the [`Affinity`] captured at construction, so a state
/// machine awaiting a `Delay` on an execution context resumes on that context's worker, not
/// on the timer thread.
///
/// If the timer drops the delay without ever firing it (a [`ThreadTimer`] being shut down,
/// say) the delay is abandoned: waiting continuations are dropped without running, so
/// whatever they keep alive is released.
///
/// [`ThreadTimer`]: crate::time::ThreadTimer
#[derive(Clone)]
pub struct Delay {
    inner: Arc<Inner>,
}

assert_impl_all!(Delay: Send, Sync, Clone);

struct Inner {
    list: WaitList,
    affinity: Affinity,
    duration: Duration,
}

/// The timer's half of a delay. Fires it when rung, abandons it when dropped unrung.
struct Alarm {
    inner: Option<Arc<Inner>>,
}

// === impl Delay ===

impl Delay {
    /// Arms a delay on `timer`, scheduling continuations through `affinity`.
    pub fn new(timer: &dyn Timer, duration: Duration, affinity: Affinity) -> Self {
        let inner = Arc::new(Inner {
            list: WaitList::new(),
            affinity,
            duration,
        });

        let alarm = Alarm {
            inner: Some(inner.clone()),
        };
        timer.schedule_once(duration, Box::new(move || alarm.ring()));

        Self { inner }
    }

    /// Arms a delay that resumes on the calling thread's current execution context.
    pub fn capture(timer: &dyn Timer, duration: Duration) -> Self {
        Self::new(timer, duration, Affinity::capture())
    }

    pub fn duration(&self) -> Duration {
        self.inner.duration
    }

    pub fn affinity(&self) -> &Affinity {
        &self.inner.affinity
    }

    /// Whether the timer dropped this delay without firing it. An abandoned delay never
    /// completes.
    pub fn is_abandoned(&self) -> bool {
        self.inner.list.is_abandoned()
    }

    #[cfg(test)]
    fn fire(&self) {
        self.inner.fire();
    }
}

impl Inner {
    /// Completes the wait list and schedules whatever was waiting on it. Firing more than
    /// once is harmless, only the first call observes any continuations.
    fn fire(&self) {
        let Some(continuations) = self.list.complete() else {
            tracing::trace!("delay fired again, ignoring");
            return;
        };

        tracing::trace!(
            duration = ?self.duration,
            continuations = continuations.len(),
            "delay elapsed"
        );
        for continuation in continuations {
            self.affinity.schedule(continuation);
        }
    }
}

// === impl Alarm ===

impl Alarm {
    fn ring(mut self) {
        if let Some(inner) = self.inner.take() {
            inner.fire();
        }
    }
}

impl Drop for Alarm {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.take() {
            let dropped = inner.list.abandon();
            tracing::debug!(
                duration = ?inner.duration,
                dropped,
                "timer dropped a delay before it fired"
            );
        }
    }
}

impl Notify for Delay {
    fn is_completed(&self) -> bool {
        self.inner.list.is_completed()
    }

    fn on_completed(&self, continuation: Continuation) {
        if let Some(continuation) = self.inner.list.register(continuation) {
            self.inner.affinity.schedule(continuation);
        }
    }
}

impl Awaiter for Delay {
    type Output = ();

    fn get_result(&self) {
        self.inner.list.wait();
    }
}

impl fmt::Debug for Delay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delay")
            .field("duration", &self.inner.duration)
            .field("affinity", &self.inner.affinity)
            .field("completed", &self.is_completed())
            .field("abandoned", &self.is_abandoned())
            .finish()
    }
}
