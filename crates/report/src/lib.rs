// Copyright The RQD Authors
// SPDX-License-Identifier: Apache-2.0

//! Wire-facing data model shared between the daemon and the dispatcher.
//!
//! Inbound: [`FrameLaunch`], the dispatcher's request to run one frame on
//! this host. Outbound: [`BootReport`] at startup, [`HostReport`] on every
//! heartbeat and lock transition, and [`FrameCompleteReport`] exactly once
//! per admitted frame. The outbound side of the transport is abstracted by
//! [`DispatcherClient`].

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

pub mod client;
pub mod error;
#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use client::DispatcherClient;

/// Overall machine condition advertised to the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum HardwareState {
    /// Accepting work.
    #[default]
    Up,
    /// Shutting down; no new work.
    Down,
    /// Reboot requested or in progress.
    Rebooting,
    /// Pulled for maintenance.
    Repairing,
}

/// Core accounting snapshot, in centi-cores (100 = one physical core).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CoreDetail {
    /// Cores present on the host.
    pub total_cores: u32,
    /// Cores withheld from scheduling.
    pub locked_cores: u32,
    /// Cores free for booking.
    pub idle_cores: u32,
    /// Cores reserved by running frames.
    pub booked_cores: u32,
}

/// A request from the dispatcher to execute one frame on this host.
///
/// Immutable once accepted by the supervisor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameLaunch {
    /// Unique frame id; at most one frame per id runs on a host.
    pub frame_id: String,
    /// Id of the owning job.
    pub job_id: String,
    /// Human-readable job name; part of log paths.
    pub job_name: String,
    /// Human-readable frame name; part of log paths.
    pub frame_name: String,
    /// Production show the job belongs to.
    pub show: String,
    /// Shot within the show.
    pub shot: String,
    /// Name of the submitting end user.
    pub user_name: String,
    /// Numeric uid the subprocess runs under. Must be positive.
    pub uid: u32,
    /// Numeric gid the subprocess runs under.
    pub gid: u32,
    /// Command line to execute.
    pub command: String,
    /// Requested cores in centi-core units. Must be positive.
    pub num_cores: u32,
    /// Directory receiving the frame log.
    pub log_dir: PathBuf,
    /// Environment overlay applied on top of the host-provided base set.
    pub environment: HashMap<String, String>,
    /// Exempts this frame from idle-lock preemption.
    pub ignore_idle_lock: bool,
    /// Requests hyperthread pinning for the reservation.
    pub threadable: bool,
}

/// Snapshot of one running frame, as exposed to the dispatcher.
///
/// Fields may be partially populated while the frame is still starting or
/// finishing; consumers must tolerate e.g. `end_time` being absent while
/// `start_time` is set.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RunningFrameInfo {
    /// Unique frame id.
    pub frame_id: String,
    /// Id of the owning job.
    pub job_id: String,
    /// Job name.
    pub job_name: String,
    /// Frame name.
    pub frame_name: String,
    /// Uid the frame runs under.
    pub uid: u32,
    /// Reserved cores in centi-core units.
    pub num_cores: u32,
    /// OS pid of the subprocess, once spawned.
    pub pid: Option<u32>,
    /// Launch time, seconds since the epoch.
    pub start_time: Option<u64>,
    /// Completion time, seconds since the epoch.
    pub end_time: Option<u64>,
    /// Wall-clock run time in seconds.
    pub run_time: u64,
    /// Peak resident set observed, in KiB.
    pub max_rss: u64,
    /// Cumulative user CPU time in seconds.
    pub utime: f64,
    /// Cumulative system CPU time in seconds.
    pub stime: f64,
    /// Wall-clock time measured by the time wrapper, in seconds.
    pub real_time: f64,
    /// Exit status; `None` while running or when killed before exiting.
    pub exit_status: Option<i32>,
    /// Signal that terminated the frame, 0 otherwise.
    pub exit_signal: i32,
    /// Reason recorded by a kill request, if any.
    pub kill_message: Option<String>,
    /// Hyperthread CPU indices pinned to this frame; empty when unpinned.
    pub pin_set: Vec<usize>,
}

/// Static and sampled facts about the host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RenderHost {
    /// Host name.
    pub hostname: String,
    /// Machine condition.
    pub hardware_state: HardwareState,
    /// Whether the idle-lock controller is active on this host.
    pub nimby_enabled: bool,
    /// Whether the idle lock is currently held.
    pub nimby_locked: bool,
    /// Number of physical processors.
    pub num_procs: u32,
    /// Total memory in KiB.
    pub total_mem_kb: u64,
    /// Free memory in KiB.
    pub free_mem_kb: u64,
    /// One-minute load average scaled by 100.
    pub load: u32,
    /// Host boot time, seconds since the epoch.
    pub boot_time: u64,
}

/// First report after the transport connects.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BootReport {
    /// Host facts.
    pub host: RenderHost,
    /// Core accounting at boot.
    pub cores: CoreDetail,
}

/// Periodic status report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostReport {
    /// Host facts.
    pub host: RenderHost,
    /// Current core accounting.
    pub cores: CoreDetail,
    /// Snapshot of every running frame.
    pub frames: Vec<RunningFrameInfo>,
}

/// Report sent exactly once when an admitted frame finishes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameCompleteReport {
    /// Host facts at completion time.
    pub host: RenderHost,
    /// Final frame snapshot.
    pub frame: RunningFrameInfo,
    /// Exit status delivered to the dispatcher. May be a sentinel value
    /// (failed launch, idle-lock kill) rather than the child's real code.
    pub exit_status: i32,
    /// Terminating signal, 0 for a normal exit.
    pub exit_signal: i32,
    /// Wall-clock run time in seconds.
    pub run_time: u64,
}
