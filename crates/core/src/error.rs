// Copyright The RQD Authors
// SPDX-License-Identifier: Apache-2.0

//! Boundary errors of the frame supervisor.
//!
//! These are the error kinds returned synchronously to RPC callers. Failures
//! inside a running attendant never surface here; they become a completion
//! report carrying a sentinel exit status.

/// Errors returned to the dispatcher or an operator.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The requested cores could not be reserved, or host policy refuses
    /// new work.
    #[error("Core reservation failure: {reason}")]
    CoreReservationFailure {
        /// Why the reservation was refused.
        reason: String,
    },

    /// The frame id is already running on this host.
    #[error("Frame {frame_id} is already running on this host")]
    DuplicateFrame {
        /// Offending frame id.
        frame_id: String,
    },

    /// The request named a uid the daemon refuses to run work as.
    #[error("Will not run frame as uid={uid}")]
    InvalidUser {
        /// Offending uid.
        uid: u32,
    },

    /// The host cannot honor the request right now (e.g. reboot while a
    /// user is logged in).
    #[error("Host busy: {reason}")]
    HostBusy {
        /// Why the host refused.
        reason: String,
    },

    /// No frame with the given id is running on this host.
    #[error("Frame {frame_id} is not running on this host")]
    FrameNotFound {
        /// Requested frame id.
        frame_id: String,
    },

    /// An unexpected daemon-side failure.
    #[error("Internal error: {message}")]
    Internal {
        /// A description of the failure.
        message: String,
    },
}
