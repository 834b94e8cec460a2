// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::awaiter::Continuation;
use core::cmp;
use core::fmt;
use core::time::Duration;
use parking_lot::Mutex;
use std::collections::BinaryHeap;

/// One-shot deferred callbacks.
///
/// Implementations invoke `callback` once, at some point no earlier than `after` from now, on
/// a thread of their choosing. Callers must tolerate the callback running on any thread
/// (including the calling one).
pub trait Timer: Send + Sync {
    fn schedule_once(&self, after: Duration, callback: Continuation);
}

/// A scheduled callback, ordered so that `BinaryHeap` pops the earliest deadline first.
/// Ties are broken by insertion order.
struct Entry<T> {
    deadline: T,
    seq: u64,
    callback: Continuation,
}

impl<T: Ord> PartialEq for Entry<T> {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == cmp::Ordering::Equal
    }
}

impl<T: Ord> Eq for Entry<T> {}

impl<T: Ord> PartialOrd for Entry<T> {
    fn partial_cmp(&self, other: &Self) -> Option<cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl<T: Ord> Ord for Entry<T> {
    fn cmp(&self, other: &Self) -> cmp::Ordering {
        // reversed, BinaryHeap is a max-heap
        (&other.deadline, other.seq).cmp(&(&self.deadline, self.seq))
    }
}

/// Entries plus the sequence counter that keeps equal deadlines in FIFO order.
struct Schedule<T> {
    entries: BinaryHeap<Entry<T>>,
    next_seq: u64,
}

impl<T: Ord> Schedule<T> {
    const fn new() -> Self {
        Self {
            entries: BinaryHeap::new(),
            next_seq: 0,
        }
    }

    fn insert(&mut self, deadline: T, callback: Continuation) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.entries.push(Entry {
            deadline,
            seq,
            callback,
        });
    }

    fn next_deadline(&self) -> Option<&T> {
        self.entries.peek().map(|entry| &entry.deadline)
    }

    /// Pops the earliest entry if its deadline is at or before `now`.
    fn pop_due(&mut self, now: &T) -> Option<Continuation> {
        if self.next_deadline()? <= now {
            self.entries.pop().map(|entry| entry.callback)
        } else {
            None
        }
    }
}

// === impl ThreadTimer ===

pub use thread_timer::{ThreadTimer, ThreadTimerBuilder};

mod thread_timer {
    use super::{Schedule, Timer};
    use crate::awaiter::Continuation;
    use crate::error::panic_message;
    use parking_lot::{Condvar, Mutex};
    use std::sync::Arc;
    use std::thread::{self, JoinHandle};
    use core::fmt;
    use core::time::Duration;
    use std::io;
    use std::panic::{self, AssertUnwindSafe};
    use std::time::Instant;

    /// Stand-in deadline for delays too long to represent as an [`Instant`].
    const FAR_FUTURE: Duration = Duration::from_secs(60 * 60 * 24 * 365 * 30);

    /// A [`Timer`] backed by a single background thread.
    ///
    /// Callbacks run on the timer thread in deadline order. Dropping the timer stops the thread,
    /// callbacks that haven't fired yet are dropped without running.
    pub struct ThreadTimer {
        shared: Arc<Shared>,
        thread: Option<JoinHandle<()>>,
    }

    pub struct ThreadTimerBuilder {
        name: String,
    }

    struct Shared {
        state: Mutex<State>,
        cond: Condvar,
    }

    struct State {
        schedule: Schedule<Instant>,
        shutdown: bool,
    }

    impl ThreadTimerBuilder {
        /// Name of the timer thread, defaults to `"syncctx-timer"`.
        #[must_use]
        pub fn name(mut self, name: &str) -> Self {
            self.name = name.to_string();
            self
        }

        /// Spawns the timer thread.
        ///
        /// # Errors
        ///
        /// Returns an error if the OS fails to spawn the thread.
        pub fn build(self) -> io::Result<ThreadTimer> {
            let shared = Arc::new(Shared {
                state: Mutex::new(State {
                    schedule: Schedule::new(),
                    shutdown: false,
                }),
                cond: Condvar::new(),
            });

            let thread = thread::Builder::new().name(self.name).spawn({
                let shared = shared.clone();
                move || run(&shared)
            })?;

            Ok(ThreadTimer {
                shared,
                thread: Some(thread),
            })
        }
    }

    impl ThreadTimer {
        /// Spawns a timer with the default configuration.
        ///
        /// # Errors
        ///
        /// Returns an error if the OS fails to spawn the thread.
        pub fn new() -> io::Result<Self> {
            Self::builder().build()
        }

        pub fn builder() -> ThreadTimerBuilder {
            ThreadTimerBuilder {
                name: "syncctx-timer".to_string(),
            }
        }

        /// Number of callbacks that haven't fired yet.
        pub fn pending(&self) -> usize {
            self.shared.state.lock().schedule.entries.len()
        }
    }

    impl Timer for ThreadTimer {
        fn schedule_once(&self, after: Duration, callback: Continuation) {
            let now = Instant::now();
            let deadline = now.checked_add(after).unwrap_or_else(|| now + FAR_FUTURE);
            let mut state = self.shared.state.lock();
            state.schedule.insert(deadline, callback);
            drop(state);

            // the new entry may be earlier than what the thread is sleeping on
            self.shared.cond.notify_one();
        }
    }

    impl Drop for ThreadTimer {
        fn drop(&mut self) {
            self.shared.state.lock().shutdown = true;
            self.shared.cond.notify_one();

            if let Some(thread) = self.thread.take() {
                // a callback dropping the last handle to its own timer can't join itself
                if thread.thread().id() != thread::current().id() && thread.join().is_err() {
                    tracing::error!("timer thread panicked");
                }
            }
        }
    }

    impl fmt::Debug for ThreadTimer {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.debug_struct("ThreadTimer")
                .field("pending", &self.pending())
                .finish_non_exhaustive()
        }
    }

    fn run(shared: &Shared) {
        let _span = tracing::debug_span!("timer").entered();

        let mut state = shared.state.lock();
        loop {
            if state.shutdown {
                let dropped = state.schedule.entries.len();
                tracing::debug!(dropped, "timer shutting down");
                // drop pending callbacks outside the lock, their captures may take it again
                let schedule = core::mem::replace(&mut state.schedule, Schedule::new());
                drop(state);
                drop(schedule);
                return;
            }

            let now = Instant::now();
            if let Some(callback) = state.schedule.pop_due(&now) {
                drop(state);
                fire(callback);
                state = shared.state.lock();
                continue;
            }

            match state.schedule.next_deadline().copied() {
                Some(deadline) => {
                    shared.cond.wait_until(&mut state, deadline);
                }
                None => shared.cond.wait(&mut state),
            }
        }
    }

    fn fire(callback: Continuation) {
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(callback)) {
            tracing::error!(
                panic = panic_message(&*payload).unwrap_or("<non-string panic payload>"),
                "timer callback panicked"
            );
        }
    }
}

/// A [`Timer`] driven by hand.
///
/// Time only moves when [`advance`](Self::advance) is called, due callbacks then run on the
/// calling thread in deadline order. The clock saturates at [`Duration::MAX`].
pub struct ManualTimer {
    inner: Mutex<ManualState>,
}

struct ManualState {
    now: Duration,
    schedule: Schedule<Duration>,
}

// === impl ManualTimer ===

impl ManualTimer {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(ManualState {
                now: Duration::ZERO,
                schedule: Schedule::new(),
            }),
        }
    }

    /// Time elapsed since the timer was created.
    pub fn now(&self) -> Duration {
        self.inner.lock().now
    }

    /// Moves the clock forward by `by`, firing every callback that became due.
    ///
    /// Callbacks scheduled by fired callbacks run in the same call if they are due as well.
    /// Returns the number of callbacks fired.
    pub fn advance(&self, by: Duration) -> usize {
        let mut inner = self.inner.lock();
        inner.now = inner.now.saturating_add(by);
        let now = inner.now;
        drop(inner);

        let mut fired = 0;
        loop {
            let mut inner = self.inner.lock();
            let Some(callback) = inner.schedule.pop_due(&now) else {
                break;
            };
            drop(inner);

            callback();
            fired += 1;
        }
        fired
    }

    /// Fires everything that is scheduled, regardless of deadline.
    ///
    /// Returns the number of callbacks fired.
    pub fn fire_all(&self) -> usize {
        let mut fired = 0;
        loop {
            let mut inner = self.inner.lock();
            let Some(entry) = inner.schedule.entries.pop() else {
                break;
            };
            inner.now = cmp::max(inner.now, entry.deadline);
            drop(inner);

            (entry.callback)();
            fired += 1;
        }
        fired
    }

    /// Number of callbacks that haven't fired yet.
    pub fn pending(&self) -> usize {
        self.inner.lock().schedule.entries.len()
    }
}

impl Default for ManualTimer {
    fn default() -> Self {
        Self::new()
    }
}

impl Timer for ManualTimer {
    fn schedule_once(&self, after: Duration, callback: Continuation) {
        let mut inner = self.inner.lock();
        let deadline = inner.now.saturating_add(after);
        inner.schedule.insert(deadline, callback);
    }
}

impl fmt::Debug for ManualTimer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("ManualTimer")
            .field("now", &inner.now)
            .field("pending", &inner.schedule.entries.len())
            .finish()
    }
}
