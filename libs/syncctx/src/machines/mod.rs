// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Representative state machines.
//!
//! Each of these is the hand-expanded form of a short sequential routine with one suspend
//! point. They hold their parent object through a [`Weak`] reference, the parent owns
//! its data while the machine only borrows it for as long as it runs.

mod await_child;
mod increment_twice;
mod yield_then_render;

pub use await_child::{AwaitChild, await_child};
pub use increment_twice::{IncrementTwice, increment_twice};
pub use yield_then_render::{YieldThenRender, yield_then_render};

use core::sync::atomic::{AtomicU64, Ordering};
use parking_lot::Mutex;
use std::sync::{Arc, Weak};

/// A shared counter mutated by [`IncrementTwice`].
#[derive(Debug, Default)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Adds one, returning the new value.
    pub fn increment(&self) -> u64 {
        self.value.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Acquire)
    }
}

/// An append-only record of what happened, in order.
#[derive(Debug, Default)]
pub struct RenderLog {
    entries: Mutex<Vec<String>>,
}

impl RenderLog {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Appends `entry`, returning the new length of the log.
    pub fn record(&self, entry: impl Into<String>) -> usize {
        let mut entries = self.entries.lock();
        entries.push(entry.into());
        entries.len()
    }

    pub fn entries(&self) -> Vec<String> {
        self.entries.lock().clone()
    }
}

fn upgrade<T>(parent: &Weak<T>) -> anyhow::Result<Arc<T>> {
    parent
        .upgrade()
        .ok_or_else(|| anyhow::anyhow!("parent was dropped while the state machine was running"))
}
