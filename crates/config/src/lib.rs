// Copyright The RQD Authors
// SPDX-License-Identifier: Apache-2.0

//! RQD daemon settings.
//!
//! All settings carry defaults, so an empty (or absent) settings file is a
//! valid configuration. The file format is YAML, organized in sections:
//!
//! ```yaml
//! dispatcher:
//!   endpoint: cuebot.example.com:8021
//! frames:
//!   max_log_files: 15
//! timers:
//!   ping_interval: 60s
//! ```

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub mod error;

use error::Error;

/// Top-level daemon settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    /// Outbound dispatcher connection settings.
    pub dispatcher: DispatcherSettings,
    /// Host/platform settings.
    pub machine: MachineSettings,
    /// Per-frame execution settings.
    pub frames: FrameSettings,
    /// Idle-lock (NIMBY) settings.
    pub nimby: NimbySettings,
    /// Periodic task intervals.
    pub timers: TimerSettings,
}

/// Where and how the daemon reports to the central dispatcher.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DispatcherSettings {
    /// Dispatcher endpoint, `host:port`.
    pub endpoint: String,
    /// Port advertised in frame log banners for per-frame callbacks.
    pub servant_port: u16,
}

impl Default for DispatcherSettings {
    fn default() -> Self {
        Self {
            endpoint: "localhost:8021".to_owned(),
            servant_port: 10021,
        }
    }
}

/// Host-level settings and platform overrides.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MachineSettings {
    /// Scratch root for job temp dirs, command files and stat files.
    /// Defaults to the OS temp dir when unset.
    pub temp_root: Option<PathBuf>,
    /// Force the desktop/workstation classification instead of probing.
    /// Desktop hosts run frames under `nice` and activate NIMBY at startup.
    pub desktop: Option<bool>,
    /// GPU memory hint exported to frames as `CUE_GPU_MEMORY`, in KiB.
    pub gpu_memory_kb: u64,
    /// Process exit code signaling the service manager to respawn the daemon.
    pub respawn_exit_code: i32,
    /// Command executed to reboot the host when a reboot was requested.
    pub reboot_command: Vec<String>,
}

impl Default for MachineSettings {
    fn default() -> Self {
        Self {
            temp_root: None,
            desktop: None,
            gpu_memory_kb: 0,
            respawn_exit_code: 88,
            reboot_command: vec![
                "/sbin/shutdown".to_owned(),
                "-r".to_owned(),
                "now".to_owned(),
            ],
        }
    }
}

/// Settings governing frame execution and frame logs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FrameSettings {
    /// Maximum number of rotated log files kept per frame (`.1` .. `.N`).
    pub max_log_files: u32,
    /// Exit status reported when the launch failed before a subprocess ran.
    pub exit_status_for_failed_launch: i32,
    /// Exit status reported for frames preempted by the idle lock.
    pub exit_status_for_idle_kill: i32,
    /// Pause before reporting a failed launch, damping re-booking loops.
    #[serde(with = "humantime_serde")]
    pub failed_launch_backoff: Duration,
    /// Network share receiving frame logs on Windows hosts.
    pub windows_log_root: PathBuf,
    /// Group id frames are launched under.
    pub launch_gid: u32,
}

impl Default for FrameSettings {
    fn default() -> Self {
        Self {
            max_log_files: 15,
            exit_status_for_failed_launch: 256,
            exit_status_for_idle_kill: 286,
            failed_launch_backoff: Duration::from_secs(10),
            windows_log_root: PathBuf::from("//intrender/render/logs"),
            launch_gid: 20,
        }
    }
}

/// Idle-lock (NIMBY) settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct NimbySettings {
    /// Tri-state startup override: unset follows the desktop classification,
    /// `true` forces activation, `false` disables it.
    pub startup: Option<bool>,
    /// Retention hint recorded with lock-audit rows.
    #[serde(with = "humantime_serde")]
    pub audit_ttl: Duration,
}

impl Default for NimbySettings {
    fn default() -> Self {
        Self {
            startup: None,
            // About six months.
            audit_ttl: Duration::from_secs(86_400 * 364 / 2),
        }
    }
}

/// Periodic task intervals and lifecycle delays.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TimerSettings {
    /// Heartbeat period for status reports to the dispatcher.
    #[serde(with = "humantime_serde")]
    pub ping_interval: Duration,
    /// Period of the resident-memory sampler.
    #[serde(with = "humantime_serde")]
    pub rss_update_interval: Duration,
    /// Pause between kill-all passes while waiting for frames to drain.
    #[serde(with = "humantime_serde")]
    pub kill_all_pass_delay: Duration,
    /// Delay between the cache draining and the daemon tearing itself down.
    #[serde(with = "humantime_serde")]
    pub shutdown_delay: Duration,
}

impl Default for TimerSettings {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_secs(60),
            rss_update_interval: Duration::from_secs(10),
            kill_all_pass_delay: Duration::from_secs(1),
            shutdown_delay: Duration::from_secs(1),
        }
    }
}

impl Settings {
    /// Loads settings from a YAML file, falling back to defaults when `path`
    /// is `None`.
    pub fn load(path: Option<&Path>) -> Result<Self, Error> {
        match path {
            Some(path) => Self::from_file(path),
            None => {
                let settings = Self::default();
                settings.validate()?;
                Ok(settings)
            }
        }
    }

    /// Loads and validates settings from a YAML file.
    pub fn from_file(path: &Path) -> Result<Self, Error> {
        let contents = std::fs::read_to_string(path).map_err(|source| Error::FileRead {
            path: path.to_path_buf(),
            source,
        })?;
        let settings: Self =
            serde_yaml::from_str(&contents).map_err(|e| Error::Deserialization {
                path: path.to_path_buf(),
                details: e.to_string(),
            })?;
        settings.validate()?;
        Ok(settings)
    }

    /// Rejects values the daemon cannot operate with.
    pub fn validate(&self) -> Result<(), Error> {
        if self.frames.max_log_files == 0 {
            return Err(Error::InvalidSetting {
                field: "frames.max_log_files",
                message: "at least one rotated log must be kept".to_owned(),
            });
        }
        if self.timers.ping_interval.is_zero() {
            return Err(Error::InvalidSetting {
                field: "timers.ping_interval",
                message: "must be non-zero".to_owned(),
            });
        }
        if self.timers.rss_update_interval.is_zero() {
            return Err(Error::InvalidSetting {
                field: "timers.rss_update_interval",
                message: "must be non-zero".to_owned(),
            });
        }
        if self.machine.respawn_exit_code == 0 {
            return Err(Error::InvalidSetting {
                field: "machine.respawn_exit_code",
                message: "exit code 0 is indistinguishable from a plain exit".to_owned(),
            });
        }
        if self.machine.reboot_command.is_empty() {
            return Err(Error::InvalidSetting {
                field: "machine.reboot_command",
                message: "must name an executable".to_owned(),
            });
        }
        Ok(())
    }
}
