// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use super::{Counter, upgrade};
use crate::awaiter::Awaiter;
use crate::completion::Completion;
use crate::state_machine::{Driver, State, StateMachine, Step};
use crate::time::{Delay, Timer};
use core::time::Duration;
use anyhow::Context;
use std::sync::{Arc, Weak};

/// Increments `counter`, waits for `delay` on `timer`, increments it again and returns the
/// final count.
///
/// The delay resumes on the calling thread's current execution context, when there is one.
/// The machine only holds on to `timer` until the delay is armed, if the timer is dropped
/// before it fires the completion resolves to [`Cancelled`].
///
/// [`Cancelled`]: crate::CompletionError::Cancelled
pub fn increment_twice(
    counter: &Arc<Counter>,
    timer: Arc<dyn Timer>,
    delay: Duration,
) -> Completion<u64> {
    Driver::start(IncrementTwice::new(counter, timer, delay))
}

pub struct IncrementTwice {
    parent: Weak<Counter>,
    timer: Option<Arc<dyn Timer>>,
    duration: Duration,
    delay: Option<Arc<Delay>>,
}

impl IncrementTwice {
    pub fn new(counter: &Arc<Counter>, timer: Arc<dyn Timer>, duration: Duration) -> Self {
        Self {
            parent: Arc::downgrade(counter),
            timer: Some(timer),
            duration,
            delay: None,
        }
    }
}

impl StateMachine for IncrementTwice {
    type Output = u64;

    fn step(&mut self, state: State) -> anyhow::Result<Step<u64>> {
        match state {
            State::Start => {
                upgrade(&self.parent)?.increment();

                let timer = self.timer.take().context("`IncrementTwice` started twice")?;
                let delay = Arc::new(Delay::capture(&*timer, self.duration));
                let step = Step::await_on(&delay);
                self.delay = Some(delay);
                Ok(step)
            }
            State::Resumed(0) => {
                if let Some(delay) = self.delay.take() {
                    delay.get_result();
                }
                Ok(Step::Done(upgrade(&self.parent)?.increment()))
            }
            state => anyhow::bail!("`IncrementTwice` has no state {state:?}"),
        }
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use crate::test_util::shared_timer;
    use crate::{CompletionError, ExecutionContext};
    use crate::time::ManualTimer;

    #[test]
    fn runs_both_halves() {
        let counter = Counter::new();
        let timer = Arc::new(ManualTimer::new());

        let completion = increment_twice(&counter, timer.clone(), Duration::from_millis(5));
        assert_eq!(counter.get(), 1);
        assert!(!completion.is_completed());

        timer.advance(Duration::from_millis(5));
        assert_eq!(completion.wait().unwrap(), 2);
        assert_eq!(counter.get(), 2);
    }

    #[test]
    fn dropped_parent_fails_the_machine() {
        let counter = Counter::new();
        let timer = Arc::new(ManualTimer::new());

        let completion = increment_twice(&counter, timer.clone(), Duration::ZERO);
        drop(counter);
        timer.fire_all();

        let err = completion.wait().unwrap_err();
        assert!(err.to_string().contains("parent was dropped"));
    }

    #[test]
    fn dropped_timer_cancels_the_machine() {
        let counter = Counter::new();
        let timer = Arc::new(ManualTimer::new());

        let completion = increment_twice(&counter, timer.clone(), Duration::from_millis(5));
        assert_eq!(counter.get(), 1);
        assert_eq!(timer.pending(), 1);

        // the delay's callback is the last thing keeping the suspended machine alive
        drop(timer);

        assert!(matches!(completion.wait(), Err(CompletionError::Cancelled)));
        assert_eq!(counter.get(), 1);
    }

    #[test]
    fn resumes_on_the_worker() {
        let ctx = ExecutionContext::builder().name("increment-twice").build();
        ctx.start().unwrap();
        let counter = Counter::new();
        let timer = shared_timer();

        let (tx, rx) = std::sync::mpsc::channel();
        ctx.post(
            move |(counter, timer): (Arc<Counter>, Arc<dyn Timer>)| {
                tx.send(increment_twice(&counter, timer, Duration::ZERO))
                    .unwrap();
            },
            (counter.clone(), timer),
        )
        .unwrap();

        let completion = rx.recv().unwrap();
        assert_eq!(completion.wait().unwrap(), 2);
    }
}
