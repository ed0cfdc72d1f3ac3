// Copyright The RQD Authors
// SPDX-License-Identifier: Apache-2.0

//! OS capability set used by the frame supervisor.
//!
//! Everything the daemon does differently per operating system goes through
//! [`PlatformOps`]: building the argv that wraps a frame command, decoding a
//! child's exit status, signaling a frame's process group, and probing CPU
//! topology and user-login state. One concrete variant per supported OS is
//! chosen at daemon construction by [`default_platform`].

use crate::error::Error;
use std::path::Path;
use std::process::ExitStatus;
use std::sync::Arc;

/// CPU layout probed at daemon start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoreTopology {
    /// Number of physical cores.
    pub physical_cores: u32,
    /// Logical CPU indices available for pinning.
    pub logical_cpus: Vec<usize>,
    /// Logical CPUs per physical core (1 when hyperthreading is off).
    pub threads_per_core: u32,
    /// Total capacity in centi-cores (`physical_cores * 100`).
    pub total_cores: u32,
}

impl CoreTopology {
    /// Builds a topology from physical/logical counts.
    pub fn new(physical_cores: u32, logical_count: u32) -> Self {
        let threads_per_core = (logical_count / physical_cores.max(1)).max(1);
        Self {
            physical_cores,
            logical_cpus: (0..logical_count as usize).collect(),
            threads_per_core,
            total_cores: physical_cores * 100,
        }
    }

    /// Whether the host exposes more than one hardware thread per core.
    pub fn hyperthreaded(&self) -> bool {
        self.threads_per_core > 1
    }
}

/// How a frame's session should be terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionSignal {
    /// Polite termination (SIGTERM on POSIX).
    Terminate,
    /// Forced kill (SIGKILL on POSIX).
    ForceKill,
}

/// Inputs for building the argv that wraps one frame command.
#[derive(Debug)]
pub struct SpawnSpec<'a> {
    /// Executable command file holding the frame's command line.
    pub command_file: &'a Path,
    /// Where the time-measurement wrapper should write its stats, when the
    /// platform supports one.
    pub stat_file: Option<&'a Path>,
    /// Run the frame at lowered priority (desktop hosts).
    pub nice: bool,
    /// Logical CPUs the frame is pinned to; empty when unpinned.
    pub pin_set: &'a [usize],
}

/// Per-OS operations needed by the frame supervisor.
pub trait PlatformOps: Send + Sync {
    /// Builds the full argv for spawning one frame. The first element is the
    /// program, the rest its arguments.
    fn build_spawn_argv(&self, spec: &SpawnSpec<'_>) -> Vec<String>;

    /// Decodes a child's exit into `(exit_status, exit_signal)`. A signal
    /// exit maps to `(1, signo)`; a normal exit to `(code, 0)`.
    fn parse_exit_status(&self, status: ExitStatus) -> (i32, i32);

    /// Signals the process group led by `pid`, reaching the frame and its
    /// descendants. Delivery to an already-gone group is not an error.
    fn signal_session(&self, pid: u32, signal: SessionSignal) -> Result<(), Error>;

    /// Probes the CPU topology.
    fn probe_topology(&self) -> Result<CoreTopology, Error>;

    /// Whether a human user holds a login session on this host.
    fn probe_user_logged_in(&self) -> bool;
}

/// Returns the platform variant for the build target.
pub fn default_platform() -> Arc<dyn PlatformOps> {
    #[cfg(target_os = "macos")]
    {
        Arc::new(PosixMac)
    }
    #[cfg(windows)]
    {
        Arc::new(Windows)
    }
    #[cfg(all(unix, not(target_os = "macos")))]
    {
        Arc::new(PosixLinux)
    }
}

#[cfg(unix)]
fn sysinfo_topology() -> Result<CoreTopology, Error> {
    let logical = std::thread::available_parallelism()
        .map_err(|e| Error::Topology {
            details: e.to_string(),
        })?
        .get() as u32;
    let physical = sysinfo::System::physical_core_count()
        .map(|n| n as u32)
        .unwrap_or(logical)
        .max(1);
    Ok(CoreTopology::new(physical, logical))
}

#[cfg(unix)]
fn posix_signal_session(pid: u32, signal: SessionSignal) -> Result<(), Error> {
    use nix::errno::Errno;
    use nix::sys::signal::{Signal, killpg};
    use nix::unistd::Pid;

    let signo = match signal {
        SessionSignal::Terminate => Signal::SIGTERM,
        SessionSignal::ForceKill => Signal::SIGKILL,
    };
    match killpg(Pid::from_raw(pid as i32), signo) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(errno) => Err(Error::Signal {
            pid,
            details: errno.to_string(),
        }),
    }
}

#[cfg(unix)]
fn posix_parse_exit_status(status: ExitStatus) -> (i32, i32) {
    use std::os::unix::process::ExitStatusExt;

    if let Some(signo) = status.signal() {
        (1, signo)
    } else {
        (status.code().unwrap_or(1), 0)
    }
}

#[cfg(unix)]
fn posix_user_logged_in() -> bool {
    // Login sessions are enumerated via who(1); a probe failure reads as
    // nobody logged in rather than blocking lifecycle operations.
    match std::process::Command::new("who").output() {
        Ok(output) if output.status.success() => String::from_utf8_lossy(&output.stdout)
            .lines()
            .any(|line| !line.trim().is_empty()),
        _ => false,
    }
}

/// Linux render node or workstation.
#[cfg(unix)]
#[derive(Debug, Default)]
pub struct PosixLinux;

#[cfg(unix)]
impl PlatformOps for PosixLinux {
    fn build_spawn_argv(&self, spec: &SpawnSpec<'_>) -> Vec<String> {
        let mut argv = Vec::new();
        if spec.nice {
            argv.push("/bin/nice".to_owned());
        }
        if let Some(stat_file) = spec.stat_file {
            argv.push("/usr/bin/time".to_owned());
            argv.push("-p".to_owned());
            argv.push("-o".to_owned());
            argv.push(stat_file.to_string_lossy().into_owned());
        }
        if !spec.pin_set.is_empty() {
            let cpu_list = spec
                .pin_set
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(",");
            argv.push("taskset".to_owned());
            argv.push("-c".to_owned());
            argv.push(cpu_list);
        }
        argv.push(spec.command_file.to_string_lossy().into_owned());
        argv
    }

    fn parse_exit_status(&self, status: ExitStatus) -> (i32, i32) {
        posix_parse_exit_status(status)
    }

    fn signal_session(&self, pid: u32, signal: SessionSignal) -> Result<(), Error> {
        posix_signal_session(pid, signal)
    }

    fn probe_topology(&self) -> Result<CoreTopology, Error> {
        sysinfo_topology()
    }

    fn probe_user_logged_in(&self) -> bool {
        posix_user_logged_in()
    }
}

/// macOS workstation. No time wrapper and no CPU pinning tooling; resource
/// figures for finished frames come from the sampler only.
#[cfg(unix)]
#[derive(Debug, Default)]
pub struct PosixMac;

#[cfg(unix)]
impl PlatformOps for PosixMac {
    fn build_spawn_argv(&self, spec: &SpawnSpec<'_>) -> Vec<String> {
        vec![spec.command_file.to_string_lossy().into_owned()]
    }

    fn parse_exit_status(&self, status: ExitStatus) -> (i32, i32) {
        posix_parse_exit_status(status)
    }

    fn signal_session(&self, pid: u32, signal: SessionSignal) -> Result<(), Error> {
        posix_signal_session(pid, signal)
    }

    fn probe_topology(&self) -> Result<CoreTopology, Error> {
        sysinfo_topology()
    }

    fn probe_user_logged_in(&self) -> bool {
        posix_user_logged_in()
    }
}

/// Windows render node.
#[cfg(windows)]
#[derive(Debug, Default)]
pub struct Windows;

#[cfg(windows)]
impl PlatformOps for Windows {
    fn build_spawn_argv(&self, spec: &SpawnSpec<'_>) -> Vec<String> {
        vec![spec.command_file.to_string_lossy().into_owned()]
    }

    fn parse_exit_status(&self, status: ExitStatus) -> (i32, i32) {
        // Windows has no signal concept; the raw code doubles as both.
        let code = status.code().unwrap_or(1);
        (code, code)
    }

    fn signal_session(&self, pid: u32, _signal: SessionSignal) -> Result<(), Error> {
        let status = std::process::Command::new("taskkill")
            .args(["/F", "/T", "/PID", &pid.to_string()])
            .status()
            .map_err(|e| Error::Signal {
                pid,
                details: e.to_string(),
            })?;
        // A missing process tree is not an error.
        let _ = status;
        Ok(())
    }

    fn probe_topology(&self) -> Result<CoreTopology, Error> {
        let logical = std::thread::available_parallelism()
            .map_err(|e| Error::Topology {
                details: e.to_string(),
            })?
            .get() as u32;
        let physical = sysinfo::System::physical_core_count()
            .map(|n| n as u32)
            .unwrap_or(logical)
            .max(1);
        Ok(CoreTopology::new(physical, logical))
    }

    fn probe_user_logged_in(&self) -> bool {
        matches!(
            std::process::Command::new("quser").output(),
            Ok(output) if output.status.success()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn topology_without_smt() {
        let topology = CoreTopology::new(4, 4);
        assert_eq!(topology.total_cores, 400);
        assert_eq!(topology.threads_per_core, 1);
        assert!(!topology.hyperthreaded());
    }

    #[test]
    fn topology_with_smt() {
        let topology = CoreTopology::new(4, 8);
        assert_eq!(topology.threads_per_core, 2);
        assert!(topology.hyperthreaded());
        assert_eq!(topology.logical_cpus.len(), 8);
    }

    #[cfg(unix)]
    #[test]
    fn linux_argv_wraps_with_time_nice_and_taskset() {
        let platform = PosixLinux;
        let argv = platform.build_spawn_argv(&SpawnSpec {
            command_file: Path::new("/tmp/rqd-cmd-f1"),
            stat_file: Some(Path::new("/tmp/rqd-stat-f1")),
            nice: true,
            pin_set: &[2, 3],
        });
        assert_eq!(
            argv,
            vec![
                "/bin/nice",
                "/usr/bin/time",
                "-p",
                "-o",
                "/tmp/rqd-stat-f1",
                "taskset",
                "-c",
                "2,3",
                "/tmp/rqd-cmd-f1",
            ]
        );
    }

    #[cfg(unix)]
    #[test]
    fn linux_argv_minimal_when_unpinned_server() {
        let platform = PosixLinux;
        let argv = platform.build_spawn_argv(&SpawnSpec {
            command_file: Path::new("/tmp/rqd-cmd-f2"),
            stat_file: None,
            nice: false,
            pin_set: &[],
        });
        assert_eq!(argv, vec!["/tmp/rqd-cmd-f2"]);
    }

    #[cfg(unix)]
    #[test]
    fn exit_status_of_true_decodes_clean() {
        let status = std::process::Command::new("true")
            .status()
            .expect("run true");
        let platform = PosixLinux;
        assert_eq!(platform.parse_exit_status(status), (0, 0));
    }

    #[cfg(unix)]
    #[test]
    fn exit_status_of_false_decodes_code() {
        let status = std::process::Command::new("false")
            .status()
            .expect("run false");
        let platform = PosixLinux;
        assert_eq!(platform.parse_exit_status(status), (1, 0));
    }

    #[cfg(unix)]
    #[test]
    fn signaling_a_dead_group_is_not_an_error() {
        let platform = PosixLinux;
        // Pid from a range no live process group should occupy.
        platform
            .signal_session(u32::MAX / 2, SessionSignal::Terminate)
            .expect("ESRCH is tolerated");
    }
}
