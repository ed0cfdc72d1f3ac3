// Copyright The RQD Authors
// SPDX-License-Identifier: Apache-2.0

//! Platform test double.

use crate::error::Error;
use crate::platform::{CoreTopology, PlatformOps, SessionSignal, SpawnSpec};
use std::process::ExitStatus;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// A [`PlatformOps`] with a scripted topology and user-login state.
///
/// Frames are spawned bare (no time wrapper, no nice, no pinning tool), so
/// tests do not depend on host tooling; signaling and exit-status decoding
/// stay real so kill paths are exercised end to end.
#[derive(Debug)]
pub struct FakePlatform {
    topology: CoreTopology,
    user_logged_in: Arc<AtomicBool>,
}

impl FakePlatform {
    /// Creates a fake host with the given topology and nobody logged in.
    pub fn with_topology(topology: CoreTopology) -> Self {
        Self {
            topology,
            user_logged_in: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Scripts the user-login probe.
    pub fn set_user_logged_in(&self, logged_in: bool) {
        self.user_logged_in.store(logged_in, Ordering::SeqCst);
    }
}

impl PlatformOps for FakePlatform {
    fn build_spawn_argv(&self, spec: &SpawnSpec<'_>) -> Vec<String> {
        vec![spec.command_file.to_string_lossy().into_owned()]
    }

    fn parse_exit_status(&self, status: ExitStatus) -> (i32, i32) {
        #[cfg(unix)]
        {
            use std::os::unix::process::ExitStatusExt;
            if let Some(signo) = status.signal() {
                return (1, signo);
            }
        }
        (status.code().unwrap_or(1), 0)
    }

    fn signal_session(&self, pid: u32, signal: SessionSignal) -> Result<(), Error> {
        #[cfg(unix)]
        {
            use nix::errno::Errno;
            use nix::sys::signal::{Signal, killpg};
            use nix::unistd::Pid;

            let signo = match signal {
                SessionSignal::Terminate => Signal::SIGTERM,
                SessionSignal::ForceKill => Signal::SIGKILL,
            };
            return match killpg(Pid::from_raw(pid as i32), signo) {
                Ok(()) | Err(Errno::ESRCH) => Ok(()),
                Err(errno) => Err(Error::Signal {
                    pid,
                    details: errno.to_string(),
                }),
            };
        }
        #[cfg(not(unix))]
        {
            let _ = (pid, signal);
            Ok(())
        }
    }

    fn probe_topology(&self) -> Result<CoreTopology, Error> {
        Ok(self.topology.clone())
    }

    fn probe_user_logged_in(&self) -> bool {
        self.user_logged_in.load(Ordering::SeqCst)
    }
}
