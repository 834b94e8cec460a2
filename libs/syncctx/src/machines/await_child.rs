// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use super::{Counter, increment_twice, upgrade};
use crate::awaiter::{Awaitable, Awaiter};
use crate::completion::{Completion, CompletionAwaiter};
use crate::error::CompletionError;
use crate::state_machine::{Driver, State, StateMachine, Step};
use crate::time::Timer;
use core::time::Duration;
use anyhow::Context;
use std::sync::{Arc, Weak};

/// Runs [`increment_twice`] as a child state machine, awaits it and resolves to twice its
/// result.
///
/// A failing child fails this machine too, a panicking child is resumed as a panic of this
/// machine.
pub fn await_child(
    counter: &Arc<Counter>,
    timer: Arc<dyn Timer>,
    delay: Duration,
) -> Completion<u64> {
    Driver::start(AwaitChild::new(counter, timer, delay))
}

pub struct AwaitChild {
    parent: Weak<Counter>,
    timer: Option<Arc<dyn Timer>>,
    delay: Duration,
    child: Option<Arc<CompletionAwaiter<u64>>>,
}

impl AwaitChild {
    pub fn new(counter: &Arc<Counter>, timer: Arc<dyn Timer>, delay: Duration) -> Self {
        Self {
            parent: Arc::downgrade(counter),
            timer: Some(timer),
            delay,
            child: None,
        }
    }
}

impl StateMachine for AwaitChild {
    type Output = u64;

    fn step(&mut self, state: State) -> anyhow::Result<Step<u64>> {
        match state {
            State::Start => {
                let counter = upgrade(&self.parent)?;
                let timer = self.timer.take().context("`AwaitChild` started twice")?;
                let child = Arc::new(increment_twice(&counter, timer, self.delay).get_awaiter());
                let step = Step::await_on(&child);
                self.child = Some(child);
                Ok(step)
            }
            State::Resumed(0) => {
                let Some(child) = self.child.take() else {
                    anyhow::bail!("resumed without a child to await");
                };
                match child.get_result() {
                    Ok(value) => Ok(Step::Done(value * 2)),
                    Err(err) => Err(propagate(err)),
                }
            }
            state => anyhow::bail!("`AwaitChild` has no state {state:?}"),
        }
    }
}

fn propagate(err: CompletionError) -> anyhow::Error {
    match err {
        CompletionError::Failed(err) => err.context("child state machine failed"),
        CompletionError::Panic(payload) => std::panic::resume_unwind(payload),
        CompletionError::Cancelled => anyhow::anyhow!("child state machine was cancelled"),
    }
}
