// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, mpsc};
use syncctx::{
    Closed, DispatchHook, Driver, ExecutionContext, State, StateMachine, Step, dispatch,
    yield_now,
};

#[derive(Default)]
struct RecordingHook {
    events: Mutex<Vec<&'static str>>,
    completions: AtomicUsize,
}

impl DispatchHook for RecordingHook {
    fn will_suspend(&self) {
        self.events.lock().unwrap().push("will_suspend");
    }

    fn did_complete(&self) {
        self.events.lock().unwrap().push("did_complete");
        self.completions.fetch_add(1, Ordering::SeqCst);
    }
}

#[test]
fn dispatch_on_a_context_fires_each_hook_once() {
    let ctx = ExecutionContext::new();
    ctx.start().unwrap();
    let hook = Arc::new(RecordingHook::default());

    let (tx, rx) = mpsc::channel();
    ctx.post(
        move |hook: Arc<RecordingHook>| {
            let done = dispatch(hook, |()| yield_now(), ());
            tx.send(done).unwrap();
        },
        hook.clone(),
    )
    .unwrap();

    rx.recv().unwrap().wait().unwrap();
    assert_eq!(*hook.events.lock().unwrap(), ["will_suspend", "did_complete"]);
    assert_eq!(hook.completions.load(Ordering::SeqCst), 1);
}

#[test]
fn post_after_stop_is_rejected() {
    let ctx = ExecutionContext::new();
    ctx.start().unwrap();
    ctx.stop().unwrap();

    let err: Closed = ctx.post(|()| {}, ()).unwrap_err();
    assert_eq!(err.to_string(), "closed");
    assert!(ctx.send(|()| {}, ()).is_err());
    assert!(ctx.stop().is_err());
    ctx.join();
}

#[test]
fn send_propagates_callback_panic() {
    let ctx = ExecutionContext::new();
    ctx.start().unwrap();

    let res = panic::catch_unwind(AssertUnwindSafe(|| {
        ctx.send(|()| panic!("inside send"), ())
    }));
    let payload = res.unwrap_err();
    assert_eq!(payload.downcast_ref::<&str>(), Some(&"inside send"));

    // the worker survived
    let ran = Arc::new(AtomicUsize::new(0));
    ctx.send(
        |ran: Arc<AtomicUsize>| {
            ran.fetch_add(1, Ordering::SeqCst);
        },
        ran.clone(),
    )
    .unwrap();
    assert_eq!(ran.load(Ordering::SeqCst), 1);
}

struct PanicsAfterYield;

impl StateMachine for PanicsAfterYield {
    type Output = ();

    fn step(&mut self, state: State) -> anyhow::Result<Step<()>> {
        match state {
            State::Start => Ok(Step::Await(Arc::new(yield_now()))),
            _ => panic!("step panicked on the worker"),
        }
    }
}

#[test]
fn panic_in_a_step_surfaces_through_wait() {
    let ctx = ExecutionContext::new();
    ctx.start().unwrap();

    let (tx, rx) = mpsc::channel();
    ctx.post(
        move |()| tx.send(Driver::start(PanicsAfterYield)).unwrap(),
        (),
    )
    .unwrap();

    let err = rx.recv().unwrap().wait().unwrap_err();
    assert!(err.is_panic());
    assert!(err.to_string().contains("step panicked on the worker"));

    // and the worker keeps going
    ctx.send(|()| {}, ()).unwrap();
}
