// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use super::{RenderLog, upgrade};
use crate::awaiter::Awaiter;
use crate::completion::Completion;
use crate::state_machine::{Driver, State, StateMachine, Step};
use crate::yield_now::{YieldNow, yield_now};
use std::sync::{Arc, Weak};

/// Records `"before yield"`, yields the current execution context once, then records
/// `"after yield"`. Resolves to the length of the log.
///
/// Anything already queued on the context when the machine yields runs between the two
/// entries.
pub fn yield_then_render(log: &Arc<RenderLog>) -> Completion<usize> {
    Driver::start(YieldThenRender::new(log))
}

pub struct YieldThenRender {
    parent: Weak<RenderLog>,
    yielded: Option<Arc<YieldNow>>,
}

impl YieldThenRender {
    pub fn new(log: &Arc<RenderLog>) -> Self {
        Self {
            parent: Arc::downgrade(log),
            yielded: None,
        }
    }
}

impl StateMachine for YieldThenRender {
    type Output = usize;

    fn step(&mut self, state: State) -> anyhow::Result<Step<usize>> {
        match state {
            State::Start => {
                upgrade(&self.parent)?.record("before yield");

                let yielded = Arc::new(yield_now());
                let step = Step::await_on(&yielded);
                self.yielded = Some(yielded);
                Ok(step)
            }
            State::Resumed(0) => {
                if let Some(yielded) = self.yielded.take() {
                    yielded.get_result();
                }
                Ok(Step::Done(upgrade(&self.parent)?.record("after yield")))
            }
            state => anyhow::bail!("`YieldThenRender` has no state {state:?}"),
        }
    }
}
