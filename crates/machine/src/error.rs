// Copyright The RQD Authors
// SPDX-License-Identifier: Apache-2.0

//! Errors for the machine crate.

/// Errors that can occur while probing or acting on the host.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// CPU topology could not be determined.
    #[error("Failed to probe CPU topology: {details}")]
    Topology {
        /// A description of the probe failure.
        details: String,
    },

    /// Delivering a signal to a frame's session failed.
    #[error("Failed to signal session of pid {pid}: {details}")]
    Signal {
        /// Process-group leader pid.
        pid: u32,
        /// A description of the failure.
        details: String,
    },

    /// The host reboot command could not be started.
    #[error("Failed to run reboot command: {source}")]
    Reboot {
        /// Underlying IO error.
        #[source]
        source: std::io::Error,
    },
}
