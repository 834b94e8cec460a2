// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::loom::sync::{Condvar, Mutex};
use core::any::Any;
use core::{fmt, mem};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

pub(crate) type Callback = Box<dyn FnOnce() + Send + 'static>;

/// Payload of a panic caught on the worker thread.
pub type PanicPayload = Box<dyn Any + Send + 'static>;

/// A unit of work queued onto an [`ExecutionContext`][crate::ExecutionContext].
///
/// A run item pairs a callback with the argument it will be invoked with and, for items
/// enqueued by `send`, a [`Signal`] the sender blocks on. The distinguished [stop item]
/// carries no callback and tells the worker loop to exit.
///
/// [stop item]: WorkItem::stop
pub struct WorkItem {
    callback: Option<Callback>,
    signal: Option<Arc<Signal>>,
}

/// One-shot event a `send`ing thread blocks on until its item has been invoked.
pub struct Signal {
    delivery: Mutex<Option<Delivery>>,
    cond: Condvar,
}

/// What happened to a signalled [`WorkItem`].
pub enum Delivery {
    /// The callback ran to completion.
    Completed,
    /// The callback panicked, the payload is handed back to the sender.
    Panicked(PanicPayload),
    /// The item was dropped without ever being invoked (its context shut down first).
    Dropped,
}

// === impl WorkItem ===

impl WorkItem {
    pub fn new<F, A>(callback: F, argument: A) -> Self
    where
        F: FnOnce(A) + Send + 'static,
        A: Send + 'static,
    {
        Self {
            callback: Some(Box::new(move || callback(argument))),
            signal: None,
        }
    }

    /// Returns a run item together with the signal that is set once the item has been invoked.
    pub fn with_signal<F, A>(callback: F, argument: A) -> (Self, Arc<Signal>)
    where
        F: FnOnce(A) + Send + 'static,
        A: Send + 'static,
    {
        let signal = Arc::new(Signal::new());
        let item = Self {
            callback: Some(Box::new(move || callback(argument))),
            signal: Some(signal.clone()),
        };
        (item, signal)
    }

    /// The sentinel that stops the worker loop.
    #[must_use]
    pub const fn stop() -> Self {
        Self {
            callback: None,
            signal: None,
        }
    }

    #[inline]
    pub fn is_run_item(&self) -> bool {
        self.callback.is_some()
    }

    #[inline]
    pub fn has_signal(&self) -> bool {
        self.signal.is_some()
    }

    /// Invokes the callback, consuming the item.
    ///
    /// The signal (if any) is always set, even when the callback unwinds. If the item carries a
    /// signal, a caught panic is handed to the waiting sender and `Ok` is returned, otherwise
    /// the payload is returned to the caller.
    pub(crate) fn invoke(mut self, catch_panics: bool) -> Result<(), PanicPayload> {
        let Some(callback) = self.callback.take() else {
            return Ok(());
        };
        let signal = self.signal.take();

        let guard = SignalOnUnwind(signal.as_deref());
        let result = if catch_panics {
            panic::catch_unwind(AssertUnwindSafe(callback))
        } else {
            callback();
            Ok(())
        };
        mem::forget(guard);

        match (signal, result) {
            (Some(signal), Ok(())) => {
                signal.set(Delivery::Completed);
                Ok(())
            }
            (Some(signal), Err(payload)) => {
                signal.set(Delivery::Panicked(payload));
                Ok(())
            }
            (None, result) => result,
        }
    }
}

impl Drop for WorkItem {
    fn drop(&mut self) {
        if let Some(signal) = self.signal.take() {
            signal.set(Delivery::Dropped);
        }
    }
}

impl fmt::Debug for WorkItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkItem")
            .field("is_run_item", &self.is_run_item())
            .field("has_signal", &self.has_signal())
            .finish_non_exhaustive()
    }
}

/// Sets the signal if the callback unwinds through `invoke` without being caught, so the
/// sender doesn't block forever on a dead worker.
struct SignalOnUnwind<'a>(Option<&'a Signal>);

impl Drop for SignalOnUnwind<'_> {
    fn drop(&mut self) {
        if let Some(signal) = self.0 {
            signal.set(Delivery::Panicked(Box::new(
                "callback panicked on the worker thread",
            )));
        }
    }
}

// === impl Signal ===

impl Signal {
    fn new() -> Self {
        Self {
            delivery: Mutex::new(None),
            cond: Condvar::new(),
        }
    }

    /// First write wins.
    fn set(&self, delivery: Delivery) {
        let mut slot = self.delivery.lock();
        if slot.is_none() {
            *slot = Some(delivery);
        }
        drop(slot);
        self.cond.notify_all();
    }

    pub fn is_set(&self) -> bool {
        self.delivery.lock().is_some()
    }

    /// Blocks until the associated item has been invoked (or dropped).
    ///
    /// The delivery is handed out once, there is exactly one waiter per signal.
    pub fn wait(&self) -> Delivery {
        let mut slot = self.delivery.lock();
        loop {
            if let Some(delivery) = slot.take() {
                return delivery;
            }
            slot = self.cond.wait(slot);
        }
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Completed => f.write_str("Completed"),
            Self::Panicked(_) => f.write_str("Panicked(..)"),
            Self::Dropped => f.write_str("Dropped"),
        }
    }
}

impl fmt::Debug for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Signal")
            .field("is_set", &self.is_set())
            .finish_non_exhaustive()
    }
}
