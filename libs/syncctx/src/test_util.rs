// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::time::{ThreadTimer, Timer};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::util::SubscriberInitExt;

/// Installs a test subscriber for the calling thread, filtered by `RUST_LOG`.
pub(crate) fn trace_init() -> tracing::subscriber::DefaultGuard {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_thread_names(true)
        .set_default()
}

/// A timer thread shared by every test in the process.
pub(crate) fn shared_timer() -> Arc<dyn Timer> {
    lazy_static::lazy_static! {
        static ref TIMER: Arc<ThreadTimer> =
            Arc::new(ThreadTimer::builder().name("test-timer").build().unwrap());
    }

    TIMER.clone()
}
