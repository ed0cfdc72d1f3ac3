// Copyright The RQD Authors
// SPDX-License-Identifier: Apache-2.0

//! Test doubles for the dispatcher client.

use crate::error::Error;
use crate::{BootReport, DispatcherClient, FrameCompleteReport, HostReport};
use parking_lot::Mutex;
use std::sync::Arc;

/// Dispatcher client that records every report for later assertions.
///
/// Clones share the same buffers.
#[derive(Debug, Clone, Default)]
pub struct CapturingDispatcher {
    inner: Arc<Captured>,
}

#[derive(Debug, Default)]
struct Captured {
    startups: Mutex<Vec<BootReport>>,
    statuses: Mutex<Vec<HostReport>>,
    completions: Mutex<Vec<FrameCompleteReport>>,
    fail_transport: Mutex<bool>,
}

impl CapturingDispatcher {
    /// Creates an empty capturing dispatcher.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent call return a transport error (reports are
    /// still captured, mirroring a send that was attempted).
    pub fn fail_transport(&self, fail: bool) {
        *self.inner.fail_transport.lock() = fail;
    }

    /// Startup reports captured so far.
    pub fn startups(&self) -> Vec<BootReport> {
        self.inner.startups.lock().clone()
    }

    /// Status reports captured so far.
    pub fn statuses(&self) -> Vec<HostReport> {
        self.inner.statuses.lock().clone()
    }

    /// Completion reports captured so far.
    pub fn completions(&self) -> Vec<FrameCompleteReport> {
        self.inner.completions.lock().clone()
    }

    fn outcome(&self) -> Result<(), Error> {
        if *self.inner.fail_transport.lock() {
            Err(Error::Transport {
                details: "injected transport failure".to_owned(),
            })
        } else {
            Ok(())
        }
    }
}

impl DispatcherClient for CapturingDispatcher {
    fn report_startup(&self, report: BootReport) -> Result<(), Error> {
        self.inner.startups.lock().push(report);
        self.outcome()
    }

    fn report_status(&self, report: HostReport) -> Result<(), Error> {
        self.inner.statuses.lock().push(report);
        self.outcome()
    }

    fn report_frame_completion(&self, report: FrameCompleteReport) -> Result<(), Error> {
        self.inner.completions.lock().push(report);
        self.outcome()
    }
}
