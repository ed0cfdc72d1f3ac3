// Copyright The RQD Authors
// SPDX-License-Identifier: Apache-2.0

//! Cancellable periodic tasks on dedicated threads.
//!
//! A body that panics or takes long does not suppress the next tick;
//! cancellation is a first-class operation rather than "forget to
//! reschedule".

use parking_lot::{Condvar, Mutex};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{error, warn};

#[derive(Default)]
struct Cancel {
    cancelled: Mutex<bool>,
    condvar: Condvar,
}

/// Handle to a periodic task running on its own named thread.
pub struct PeriodicTask {
    name: String,
    cancel: Arc<Cancel>,
    handle: Option<JoinHandle<()>>,
}

impl PeriodicTask {
    /// Requests cancellation; the task stops before its next tick.
    pub fn cancel(&self) {
        let mut cancelled = self.cancel.cancelled.lock();
        *cancelled = true;
        let _ = self.cancel.condvar.notify_all();
    }

    /// Requests cancellation and waits for the task thread to finish.
    pub fn cancel_and_join(mut self) {
        self.cancel();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!(task = %self.name, "periodic task thread panicked at exit");
            }
        }
    }
}

impl Drop for PeriodicTask {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// Spawns `body` to run every `period` until cancelled. The first tick
/// happens one period after the spawn.
pub fn spawn_periodic<F>(name: &str, period: Duration, mut body: F) -> PeriodicTask
where
    F: FnMut() + Send + 'static,
{
    let cancel = Arc::new(Cancel::default());
    let cancel_for_thread = Arc::clone(&cancel);
    let task_name = name.to_owned();
    let thread_name = name.to_owned();
    let builder = std::thread::Builder::new().name(thread_name);
    let handle = builder
        .spawn(move || {
            loop {
                {
                    let mut cancelled = cancel_for_thread.cancelled.lock();
                    if !*cancelled {
                        let _ = cancel_for_thread
                            .condvar
                            .wait_for(&mut cancelled, period);
                    }
                    if *cancelled {
                        break;
                    }
                }
                if catch_unwind(AssertUnwindSafe(&mut body)).is_err() {
                    error!(task = %task_name, "periodic task body panicked; next tick unaffected");
                }
            }
        })
        .ok();
    if handle.is_none() {
        error!(task = %name, "failed to spawn periodic task thread");
    }
    PeriodicTask {
        name: name.to_owned(),
        cancel,
        handle,
    }
}
