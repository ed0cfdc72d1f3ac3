// Copyright The RQD Authors
// SPDX-License-Identifier: Apache-2.0

//! Errors for the config crate.

use std::path::PathBuf;

/// Errors that can occur while loading or validating the daemon settings.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The settings file could not be read.
    #[error("Failed to read settings file `{path}`: {source}")]
    FileRead {
        /// Path of the settings file.
        path: PathBuf,
        /// Underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// The settings file could not be deserialized.
    #[error("YAML deserialization error in `{path}`: {details}")]
    Deserialization {
        /// Path of the settings file.
        path: PathBuf,
        /// A description of the error that occurred.
        details: String,
    },

    /// A setting carries a value the daemon cannot operate with.
    #[error("Invalid setting `{field}`: {message}")]
    InvalidSetting {
        /// Dotted path of the offending field.
        field: &'static str,
        /// Why the value is rejected.
        message: String,
    },
}
