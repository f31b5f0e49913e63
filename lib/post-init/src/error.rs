// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

use std::path::PathBuf;

use thiserror::Error;
use validator::ValidationErrors;

/// Errors that can occur while initializing a data directory
#[derive(Debug, Error)]
pub enum InitError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Configuration validation failed: {0}")]
    Validation(#[from] ValidationErrors),

    #[error(
        "config mismatch in {}: {param} expected {expected}, found {found}",
        data_dir.display()
    )]
    ConfigMismatch {
        param: &'static str,
        expected: String,
        found: String,
        data_dir: PathBuf,
    },

    #[error("metadata file is missing in {}", data_dir.display())]
    MetadataMissing { data_dir: PathBuf },

    #[error("metadata file {} is corrupt: {source}", path.display())]
    MetadataCorrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to encode metadata for {}: {source}", path.display())]
    MetadataEncode {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("already initializing")]
    AlreadyInitializing,

    #[error("cannot reset while initializing")]
    CannotResetWhileInitializing,

    #[error("initialization cancelled")]
    Cancelled,

    #[error("label file {file_index} ({}): {source}", path.display())]
    LabelFile {
        file_index: usize,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("IO error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("work oracle failed for positions {start}..={end}: {source}")]
    Oracle {
        start: u64,
        end: u64,
        #[source]
        source: anyhow::Error,
    },

    #[error("work oracle returned invalid output: {0}")]
    InvalidOracleOutput(String),

    #[error("no nonce found (searched up to position {last_position})")]
    NoNonceFound { last_position: u64 },

    #[error("partition failed: {0}")]
    PartitionFailed(String),
}

impl InitError {
    /// Whether this error is a cooperative stop rather than a failure.
    ///
    /// A cancelled run leaves the directory at a clean batch boundary and can
    /// be resumed by calling `initialize` again.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, InitError::Cancelled)
    }

    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        InitError::Io {
            path: path.into(),
            source,
        }
    }
}

impl From<String> for InitError {
    fn from(s: String) -> Self {
        InitError::InvalidConfig(s)
    }
}

pub type Result<T> = std::result::Result<T, InitError>;
