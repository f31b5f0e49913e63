// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! # post-init: Resumable Proof-of-Space Data Initialization
//!
//! post-init fills a data directory with label files derived from an identity
//! and a commitment, and searches for the best nonce along the way:
//! - Deterministic file layout from the configuration
//! - Crash-safe resumption at batch boundaries, verified against a metadata record
//! - Best-nonce retention, with an extended search past the written labels
//! - Concurrent partitioning across compute providers
//!
//! Label generation is delegated to a [`WorkOracle`] built by an
//! [`OracleFactory`]; [`CpuOracleFactory`] is a reference implementation.
//!
//! ## Example
//!
//! ```no_run
//! use post_init::{CpuOracleFactory, InitOpts, Initializer, InitializerConfig, Status};
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let opts = InitOpts::builder()
//!     .data_dir("/mnt/post")
//!     .num_units(4)
//!     .max_file_size("4GiB")
//!     .build()?;
//!
//! let config = InitializerConfig::builder()
//!     .init(opts)
//!     .node_id([0u8; 32])
//!     .commitment_atx_id([1u8; 32])
//!     .oracle_factory(Arc::new(CpuOracleFactory))
//!     .build()?;
//!
//! let init = Initializer::new(config).await?;
//! init.initialize(CancellationToken::new()).await?;
//!
//! assert_eq!(init.status(), Status::Completed);
//! println!("nonce: {:?}", init.nonce());
//! # Ok(())
//! # }
//! ```

mod config;
mod disk_state;
mod error;
mod initializer;
mod labels;
mod layout;
pub mod logging;
mod metadata;
mod nonce;
mod oracle;
mod partition;

pub use config::{
    BITS_PER_LABEL, BYTES_PER_LABEL, DEFAULT_COMPUTE_BATCH_SIZE, DEFAULT_LABELS_PER_UNIT,
    DEFAULT_MAX_FILE_SIZE, DEFAULT_MAX_NUM_UNITS, DEFAULT_MIN_NUM_UNITS, InitOpts,
    InitOptsBuilder, PostConfig, Settings, SizeInput,
};
pub use disk_state::{DiskState, LabelFile, label_file_name};
pub use error::{InitError, Result};
pub use initializer::{Initializer, InitializerConfig, InitializerConfigBuilder, Status};
pub use labels::LabelsWriter;
pub use layout::FilesLayout;
pub use metadata::{
    METADATA_FILE_NAME, PostMetadata, load as load_metadata, metadata_path, save as save_metadata,
    verify as verify_metadata,
};
pub use nonce::{Nonce, NonceSearch, NonceValue};
pub use oracle::{
    CpuOracle, CpuOracleFactory, DeviceClass, Difficulty, DifficultyFn, Id, OracleFactory,
    OracleParams, Positions, Provider, ProviderId, WorkOracle, commitment_bytes, pow_difficulty,
};
pub use partition::{DEFAULT_LAUNCH_DELAY, MultiProviderInitializer, partition_files};
