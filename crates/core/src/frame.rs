// Copyright The RQD Authors
// SPDX-License-Identifier: Apache-2.0

//! The live record of one frame, and its inbound servant surface.
//!
//! After admission the frame's attendant exclusively owns the mutable run
//! state; every other thread reads through [`RunningFrame::info`] snapshots,
//! which may observe partially-populated state (a started frame with no end
//! time yet). [`RunningFrame::kill`] is the servant's kill operation and may
//! race with the attendant removing the frame from the cache; both sides
//! tolerate that.

use crate::error::Error;
use parking_lot::Mutex;
use rqd_machine::ProcStats;
use rqd_machine::platform::{PlatformOps, SessionSignal};
use rqd_report::{FrameLaunch, RunningFrameInfo};
use std::sync::Arc;
use std::time::SystemTime;
use tracing::warn;

#[derive(Debug, Default)]
struct RunState {
    start_time: Option<SystemTime>,
    end_time: Option<SystemTime>,
    pid: Option<u32>,
    exit_status: Option<i32>,
    exit_signal: i32,
    max_rss_kb: u64,
    utime: f64,
    stime: f64,
    real_time: f64,
    kill_message: Option<String>,
}

/// One admitted frame: the immutable launch request plus mutable run state.
pub struct RunningFrame {
    launch: FrameLaunch,
    pin_set: Vec<usize>,
    platform: Arc<dyn PlatformOps>,
    state: Mutex<RunState>,
}

impl std::fmt::Debug for RunningFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunningFrame")
            .field("frame_id", &self.launch.frame_id)
            .field("pin_set", &self.pin_set)
            .finish_non_exhaustive()
    }
}

impl RunningFrame {
    /// Creates the record for an admitted launch.
    pub fn new(launch: FrameLaunch, pin_set: Vec<usize>, platform: Arc<dyn PlatformOps>) -> Self {
        Self {
            launch,
            pin_set,
            platform,
            state: Mutex::new(RunState::default()),
        }
    }

    /// The accepted launch request.
    pub fn launch(&self) -> &FrameLaunch {
        &self.launch
    }

    /// Unique frame id.
    pub fn frame_id(&self) -> &str {
        &self.launch.frame_id
    }

    /// Logical CPUs pinned to this frame; empty when unpinned.
    pub fn pin_set(&self) -> &[usize] {
        &self.pin_set
    }

    /// Pid of the subprocess, once spawned.
    pub fn pid(&self) -> Option<u32> {
        self.state.lock().pid
    }

    /// Records the subprocess start.
    pub fn mark_started(&self, pid: u32) {
        let mut state = self.state.lock();
        state.pid = Some(pid);
        state.start_time = Some(SystemTime::now());
    }

    /// Records the subprocess exit.
    pub fn mark_finished(&self, exit_status: i32, exit_signal: i32) {
        let mut state = self.state.lock();
        state.exit_status = Some(exit_status);
        state.exit_signal = exit_signal;
        state.end_time = Some(SystemTime::now());
    }

    /// Overrides the exit status, used for launch-failure sentinels.
    pub fn set_exit_status(&self, exit_status: i32) {
        let mut state = self.state.lock();
        state.exit_status = Some(exit_status);
        if state.end_time.is_none() {
            state.end_time = Some(SystemTime::now());
        }
    }

    /// Records wall/user/system times parsed from the time-wrapper output.
    pub fn set_times(&self, real_time: f64, utime: f64, stime: f64) {
        let mut state = self.state.lock();
        state.real_time = real_time;
        state.utime = utime;
        state.stime = stime;
    }

    /// Folds a sampler refresh into the run state. Resident set is tracked
    /// as a peak; cpu time only moves forward.
    pub fn update_sample(&self, stats: ProcStats) {
        let mut state = self.state.lock();
        state.max_rss_kb = state.max_rss_kb.max(stats.rss_kb);
        if stats.cpu_time_secs > state.utime {
            state.utime = stats.cpu_time_secs;
        }
    }

    /// Wall-clock run time in whole seconds; still ticking while running.
    pub fn run_time(&self) -> u64 {
        let state = self.state.lock();
        match state.start_time {
            Some(start) => {
                let end = state.end_time.unwrap_or_else(SystemTime::now);
                end.duration_since(start).unwrap_or_default().as_secs()
            }
            None => 0,
        }
    }

    /// Servant operation: terminates the frame's session. Idempotent, and
    /// a no-op before the subprocess exists.
    pub fn kill(&self, reason: &str) -> Result<(), Error> {
        let pid = {
            let mut state = self.state.lock();
            state.kill_message = Some(reason.to_owned());
            state.pid
        };
        warn!(frame_id = %self.launch.frame_id, reason, "killing frame");
        if let Some(pid) = pid {
            self.platform
                .signal_session(pid, SessionSignal::Terminate)
                .map_err(|e| Error::Internal {
                    message: e.to_string(),
                })?;
        }
        Ok(())
    }

    /// Servant operation: a point-in-time snapshot for reports and status
    /// queries.
    pub fn info(&self) -> RunningFrameInfo {
        let state = self.state.lock();
        RunningFrameInfo {
            frame_id: self.launch.frame_id.clone(),
            job_id: self.launch.job_id.clone(),
            job_name: self.launch.job_name.clone(),
            frame_name: self.launch.frame_name.clone(),
            uid: self.launch.uid,
            num_cores: self.launch.num_cores,
            pid: state.pid,
            start_time: state.start_time.map(epoch_secs),
            end_time: state.end_time.map(epoch_secs),
            run_time: match state.start_time {
                Some(start) => state
                    .end_time
                    .unwrap_or_else(SystemTime::now)
                    .duration_since(start)
                    .unwrap_or_default()
                    .as_secs(),
                None => 0,
            },
            max_rss: state.max_rss_kb,
            utime: state.utime,
            stime: state.stime,
            real_time: state.real_time,
            exit_status: state.exit_status,
            exit_signal: state.exit_signal,
            kill_message: state.kill_message.clone(),
            pin_set: self.pin_set.clone(),
        }
    }

    pub(crate) fn snapshot_times(&self) -> (Option<SystemTime>, Option<SystemTime>) {
        let state = self.state.lock();
        (state.start_time, state.end_time)
    }

    pub(crate) fn footer_fields(&self) -> (Option<i32>, i32, Option<String>, u64, f64, f64) {
        let state = self.state.lock();
        (
            state.exit_status,
            state.exit_signal,
            state.kill_message.clone(),
            state.max_rss_kb,
            state.utime,
            state.stime,
        )
    }
}

fn epoch_secs(time: SystemTime) -> u64 {
    time.duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
