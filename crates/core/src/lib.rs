// Copyright The RQD Authors
// SPDX-License-Identifier: Apache-2.0

//! RQD frame supervisor.
//!
//! The concurrent state machine at the heart of the render-host daemon:
//! admission of frame launches against the core ledger and host policy,
//! one attendant thread per running frame, the user-presence idle lock
//! wired to mass preemption, and the daemon's own lifecycle
//! (lock/unlock, shutdown/restart/reboot, now or when idle).
//!
//! Module map:
//! - [`ledger`]: centi-core accounting and the hyperthread pin pool
//! - [`cache`]: at-most-one running frame per frame id
//! - [`frame`]: the live frame record and its servant surface
//! - [`supervisor`]: admission, lifecycle, timers, bookkeeping
//! - [`logfile`]: frame log rotation and the banner format
//! - [`periodic`]: cancellable periodic tasks
//!
//! The attendant itself is internal; it is driven entirely through
//! [`supervisor::Supervisor::launch_frame`].

mod attendant;
pub mod cache;
pub mod error;
pub mod frame;
pub mod ledger;
pub mod logfile;
pub mod periodic;
pub mod supervisor;

pub use error::Error;
pub use frame::RunningFrame;
pub use supervisor::{ExitIntent, Supervisor};
