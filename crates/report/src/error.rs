// Copyright The RQD Authors
// SPDX-License-Identifier: Apache-2.0

//! Errors for the report crate.

/// Errors produced by dispatcher client implementations.
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// The transport failed to deliver a report.
    #[error("Dispatcher transport error: {details}")]
    Transport {
        /// A description of the transport failure.
        details: String,
    },
}
