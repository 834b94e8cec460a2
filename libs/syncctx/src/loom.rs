// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use cfg_if::cfg_if;

cfg_if! {
    if #[cfg(loom)] {
        #[cfg(test)]
        pub(crate) use loom::{model, thread};

        // Only the queue and wait list internals run on these. Everything that is handed out
        // as `Arc<dyn _>` or downgraded to a `Weak` stays on `std::sync`.
        pub(crate) mod sync {
            #[cfg(test)]
            pub(crate) use loom::sync::Arc;
            pub(crate) use loom::sync::atomic;

            pub(crate) type MutexGuard<'a, T> = loom::sync::MutexGuard<'a, T>;

            /// `parking_lot` flavoured wrapper around loom's mutex.
            #[derive(Debug)]
            pub(crate) struct Mutex<T>(loom::sync::Mutex<T>);

            impl<T> Mutex<T> {
                pub(crate) fn new(data: T) -> Self {
                    Self(loom::sync::Mutex::new(data))
                }

                #[track_caller]
                pub(crate) fn lock(&self) -> MutexGuard<'_, T> {
                    self.0.lock().unwrap()
                }
            }

            #[derive(Debug)]
            pub(crate) struct Condvar(loom::sync::Condvar);

            impl Condvar {
                pub(crate) fn new() -> Self {
                    Self(loom::sync::Condvar::new())
                }

                #[track_caller]
                pub(crate) fn wait<'a, T>(&self, guard: MutexGuard<'a, T>) -> MutexGuard<'a, T> {
                    self.0.wait(guard).unwrap()
                }

                pub(crate) fn notify_one(&self) {
                    self.0.notify_one();
                }

                pub(crate) fn notify_all(&self) {
                    self.0.notify_all();
                }
            }
        }
    } else {
        #[cfg(test)]
        pub(crate) use std::thread;

        #[cfg(test)]
        #[inline(always)]
        pub(crate) fn model<R>(f: impl FnOnce() -> R) -> R {
            f()
        }

        pub(crate) mod sync {
            #[cfg(test)]
            pub(crate) use std::sync::Arc;
            pub(crate) use core::sync::atomic;
            pub(crate) use parking_lot::{Mutex, MutexGuard};

            /// `parking_lot::Condvar` with the by-value `wait` signature loom (and std) use, so
            /// callers can be written once for both.
            #[derive(Debug, Default)]
            pub(crate) struct Condvar(parking_lot::Condvar);

            impl Condvar {
                pub(crate) const fn new() -> Self {
                    Self(parking_lot::Condvar::new())
                }

                #[inline]
                pub(crate) fn wait<'a, T>(
                    &self,
                    mut guard: MutexGuard<'a, T>,
                ) -> MutexGuard<'a, T> {
                    self.0.wait(&mut guard);
                    guard
                }

                #[inline]
                pub(crate) fn notify_one(&self) {
                    self.0.notify_one();
                }

                #[inline]
                pub(crate) fn notify_all(&self) {
                    self.0.notify_all();
                }
            }
        }
    }
}
