// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::error::Closed;
use crate::loom::sync::{Condvar, Mutex};
use crate::work_item::WorkItem;
use std::collections::VecDeque;

/// Unbounded FIFO of [`WorkItem`]s with a blocking pop.
///
/// Every successful push wakes exactly one blocked popper, the condition variable is only ever
/// waited on while the queue is observed empty under the lock, so wakeups cannot be lost.
#[derive(Debug)]
pub struct WorkQueue {
    core: Mutex<Core>,
    not_empty: Condvar,
}

#[derive(Debug)]
struct Core {
    items: VecDeque<WorkItem>,
    /// Set once the stop sentinel has been pushed, no further items are accepted.
    closed: bool,
}

impl WorkQueue {
    pub fn new() -> Self {
        Self {
            core: Mutex::new(Core {
                items: VecDeque::new(),
                closed: false,
            }),
            not_empty: Condvar::new(),
        }
    }

    /// Appends an item to the back of the queue.
    ///
    /// # Errors
    ///
    /// Returns [`Closed`] if the queue was closed through [`WorkQueue::close`].
    pub fn push(&self, item: WorkItem) -> Result<(), Closed> {
        let mut core = self.core.lock();
        if core.closed {
            return Err(Closed(()));
        }
        core.items.push_back(item);
        drop(core);

        self.not_empty.notify_one();
        Ok(())
    }

    /// Enqueues the stop sentinel and closes the queue in one step.
    ///
    /// Items pushed before this call stay in the queue and are still handed out by
    /// [`pop_blocking`][Self::pop_blocking], the sentinel is always the last item.
    ///
    /// # Errors
    ///
    /// Returns [`Closed`] if the queue was already closed.
    pub fn close(&self) -> Result<(), Closed> {
        let mut core = self.core.lock();
        if core.closed {
            return Err(Closed(()));
        }
        core.closed = true;
        core.items.push_back(WorkItem::stop());
        drop(core);

        self.not_empty.notify_one();
        Ok(())
    }

    /// Removes the front item, blocking the calling thread while the queue is empty.
    pub fn pop_blocking(&self) -> WorkItem {
        let mut core = self.core.lock();
        while core.items.is_empty() {
            core = self.not_empty.wait(core);
        }

        match core.items.pop_front() {
            Some(item) => item,
            None => unreachable!("work queue was observed non-empty under the lock"),
        }
    }

    /// Removes the front item if there is one.
    pub fn try_pop(&self) -> Option<WorkItem> {
        self.core.lock().items.pop_front()
    }

    pub fn len(&self) -> usize {
        self.core.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.core.lock().items.is_empty()
    }

    pub fn is_closed(&self) -> bool {
        self.core.lock().closed
    }
}

impl Default for WorkQueue {
    fn default() -> Self {
        Self::new()
    }
}
