// Copyright The RQD Authors
// SPDX-License-Identifier: Apache-2.0

//! Host probing for the frame supervisor.
//!
//! [`Machine`] answers every question the supervisor asks about the host it
//! runs on: CPU topology, memory and load samples, desktop classification,
//! user-login state, and per-pid resource refreshes for running frames. The
//! OS-specific pieces are delegated to a [`platform::PlatformOps`] variant
//! chosen at construction.

use parking_lot::Mutex;
use rqd_config::{MachineSettings, Settings};
use rqd_report::{HardwareState, RenderHost};
use std::path::PathBuf;
use std::sync::Arc;
use sysinfo::{ProcessesToUpdate, System};
use tracing::{info, warn};

pub mod error;
pub mod platform;
#[cfg(any(test, feature = "testing"))]
pub mod testing;

use error::Error;
use platform::{CoreTopology, PlatformOps};

/// Point-in-time resource figures for one frame subprocess.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProcStats {
    /// Resident set in KiB.
    pub rss_kb: u64,
    /// Cumulative CPU time in seconds.
    pub cpu_time_secs: f64,
    /// Wall-clock run time in seconds.
    pub run_time_secs: u64,
}

/// Facts about the host this daemon runs on.
pub struct Machine {
    platform: Arc<dyn PlatformOps>,
    settings: MachineSettings,
    topology: CoreTopology,
    hostname: String,
    boot_time: u64,
    desktop: bool,
    system: Mutex<System>,
}

impl Machine {
    /// Probes the host and builds the machine facade.
    pub fn new(settings: &Settings, platform: Arc<dyn PlatformOps>) -> Result<Self, Error> {
        let topology = platform.probe_topology()?;
        let hostname = System::host_name().unwrap_or_else(|| "unknown".to_owned());
        let desktop = settings
            .machine
            .desktop
            .unwrap_or_else(|| std::env::var_os("DISPLAY").is_some());
        let mut system = System::new();
        system.refresh_memory();
        info!(
            hostname = %hostname,
            physical_cores = topology.physical_cores,
            logical_cpus = topology.logical_cpus.len(),
            desktop,
            "host probed"
        );
        Ok(Self {
            platform,
            settings: settings.machine.clone(),
            topology,
            hostname,
            boot_time: System::boot_time(),
            desktop,
            system: Mutex::new(system),
        })
    }

    /// The OS capability set this machine was built with.
    pub fn platform(&self) -> Arc<dyn PlatformOps> {
        Arc::clone(&self.platform)
    }

    /// CPU topology probed at construction.
    pub fn topology(&self) -> &CoreTopology {
        &self.topology
    }

    /// Host name advertised in reports and frame log banners.
    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    /// Whether this host is a workstation rather than a rack node. Desktop
    /// hosts run frames under `nice` and activate the idle lock at startup.
    pub fn is_desktop(&self) -> bool {
        self.desktop
    }

    /// Whether a human user holds a login session right now.
    pub fn is_user_logged_in(&self) -> bool {
        self.platform.probe_user_logged_in()
    }

    /// Scratch root for job temp dirs, command files and stat files.
    pub fn temp_root(&self) -> PathBuf {
        self.settings
            .temp_root
            .clone()
            .unwrap_or_else(std::env::temp_dir)
    }

    /// `PATH` exported to frame subprocesses.
    pub fn path_env(&self) -> String {
        std::env::var("PATH").unwrap_or_else(|_| "/bin:/usr/bin".to_owned())
    }

    /// Timezone exported to frame subprocesses.
    pub fn time_zone(&self) -> String {
        std::env::var("TZ").unwrap_or_else(|_| "UTC".to_owned())
    }

    /// GPU memory hint exported to frames, in KiB.
    pub fn gpu_memory_kb(&self) -> u64 {
        self.settings.gpu_memory_kb
    }

    /// Samples memory and load and assembles the host report block.
    pub fn render_host(
        &self,
        hardware_state: HardwareState,
        nimby_enabled: bool,
        nimby_locked: bool,
    ) -> RenderHost {
        let mut system = self.system.lock();
        system.refresh_memory();
        let load = System::load_average();
        RenderHost {
            hostname: self.hostname.clone(),
            hardware_state,
            nimby_enabled,
            nimby_locked,
            num_procs: self.topology.physical_cores,
            total_mem_kb: system.total_memory() / 1024,
            free_mem_kb: system.available_memory() / 1024,
            load: (load.one * 100.0) as u32,
            boot_time: self.boot_time,
        }
    }

    /// Refreshes resource figures for one frame subprocess. `None` when the
    /// process has already exited.
    pub fn proc_stats(&self, pid: u32) -> Option<ProcStats> {
        let mut system = self.system.lock();
        let sys_pid = sysinfo::Pid::from_u32(pid);
        let _ = system.refresh_processes(ProcessesToUpdate::Some(&[sys_pid]), true);
        let process = system.process(sys_pid)?;
        Some(ProcStats {
            rss_kb: process.memory() / 1024,
            cpu_time_secs: process.accumulated_cpu_time() as f64 / 1000.0,
            run_time_secs: process.run_time(),
        })
    }

    /// Starts the configured host reboot command.
    pub fn reboot(&self) -> Result<(), Error> {
        warn!(command = ?self.settings.reboot_command, "rebooting host by request");
        let mut command = std::process::Command::new(&self.settings.reboot_command[0]);
        let _child = command
            .args(&self.settings.reboot_command[1..])
            .spawn()
            .map_err(|source| Error::Reboot { source })?;
        Ok(())
    }
}
