// Copyright The RQD Authors
// SPDX-License-Identifier: Apache-2.0

//! Outbound dispatcher client contract.
//!
//! The concrete RPC transport lives outside this workspace; the daemon only
//! depends on this trait. Status and completion reports are at-most-once:
//! callers log transport failures and continue, retries belong to the
//! dispatcher.

use crate::error::Error;
use crate::{BootReport, FrameCompleteReport, HostReport};
use tracing::debug;

/// Outbound calls from the daemon to the central dispatcher.
pub trait DispatcherClient: Send + Sync {
    /// Announces this host after the transport connects.
    fn report_startup(&self, report: BootReport) -> Result<(), Error>;

    /// Delivers a periodic or event-driven status report.
    fn report_status(&self, report: HostReport) -> Result<(), Error>;

    /// Delivers the final report for one admitted frame.
    fn report_frame_completion(&self, report: FrameCompleteReport) -> Result<(), Error>;
}

/// Dispatcher client that only logs reports.
///
/// Used when the daemon runs detached from a dispatcher, and as the fallback
/// wiring for the binary until a transport is attached.
#[derive(Debug, Default)]
pub struct LogOnlyDispatcher;

impl DispatcherClient for LogOnlyDispatcher {
    fn report_startup(&self, report: BootReport) -> Result<(), Error> {
        debug!(hostname = %report.host.hostname, total_cores = report.cores.total_cores,
               "startup report (no dispatcher attached)");
        Ok(())
    }

    fn report_status(&self, report: HostReport) -> Result<(), Error> {
        debug!(hostname = %report.host.hostname, frames = report.frames.len(),
               idle_cores = report.cores.idle_cores,
               "status report (no dispatcher attached)");
        Ok(())
    }

    fn report_frame_completion(&self, report: FrameCompleteReport) -> Result<(), Error> {
        debug!(frame_id = %report.frame.frame_id, exit_status = report.exit_status,
               exit_signal = report.exit_signal,
               "frame completion report (no dispatcher attached)");
        Ok(())
    }
}
