//! A single-threaded cooperative execution context, and the machinery to suspend work on it.
//!
//! An [`ExecutionContext`] owns one worker thread that runs posted callbacks strictly in
//! enqueue order. Work that needs to wait on something (a [`Delay`], a [`yield_now`], another
//! machine's [`Completion`]) is written as a hand-built [`StateMachine`] which suspends by
//! registering a continuation with an [`Awaiter`] and returning. When the awaiter completes,
//! the continuation is posted back onto the context the awaiter captured, and the machine
//! picks up where it left off.
//!
//! [`Delay`]: time::Delay

mod awaiter;
mod completion;
mod context;
mod dispatch;
mod error;
mod loom;
pub mod machines;
mod state_machine;
pub mod sync;
#[cfg(all(test, not(loom)))]
mod test_util;
pub mod time;
mod work_item;
mod work_queue;
mod yield_now;

pub use awaiter::{Affinity, Awaitable, Awaiter, Continuation, Notify};
pub use completion::{Completion, CompletionAwaiter, CompletionSource, completion_source};
pub use context::{Builder, ContextHandle, ContextId, EnterGuard, ExecutionContext};
pub use dispatch::{DispatchHook, HandleEvent, dispatch};
pub use error::{Closed, CompletionError, StartError};
pub use state_machine::{Driver, State, StateMachine, Step};
pub use work_item::PanicPayload;
pub use yield_now::{YieldNow, yield_now};
