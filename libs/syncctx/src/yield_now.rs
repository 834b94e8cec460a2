// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::awaiter::{Affinity, Awaiter, Continuation, Notify};
use std::thread;

/// Returns an awaiter that gives up the current execution context once.
///
/// The continuation is posted to the back of the calling thread's current context, so
/// everything queued before it runs first.
pub fn yield_now() -> YieldNow {
    YieldNow::new(Affinity::capture())
}

/// An awaiter that is never complete when polled, forcing the awaiting state machine to
/// suspend and be resumed through the queue.
#[derive(Debug, Clone)]
pub struct YieldNow {
    affinity: Affinity,
}

impl YieldNow {
    pub fn new(affinity: Affinity) -> Self {
        Self { affinity }
    }

    pub fn affinity(&self) -> &Affinity {
        &self.affinity
    }
}

impl Notify for YieldNow {
    fn is_completed(&self) -> bool {
        false
    }

    fn on_completed(&self, continuation: Continuation) {
        if self.affinity.context().is_some() {
            self.affinity.schedule(continuation);
        } else {
            // no queue to yield to, running inline would not yield at all
            tracing::trace!("yielding to a background thread");
            drop(thread::spawn(continuation));
        }
    }
}

impl Awaiter for YieldNow {
    type Output = ();

    fn get_result(&self) {}
}
