// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Protocol and per-run configuration.
//!
//! [`PostConfig`] carries the protocol parameters shared by every node, while
//! [`InitOpts`] describes a single data directory and how it is filled.
//! Both can be loaded together through [`Settings::figment`].

use std::path::PathBuf;

use bytesize::ByteSize;
use derive_builder::Builder;
use figment::{
    Figment, Provider,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use validator::{Validate, ValidationError};

use crate::error::{InitError, Result};
use crate::oracle::ProviderId;

pub const BITS_PER_LABEL: u64 = 128;
pub const BYTES_PER_LABEL: u64 = BITS_PER_LABEL / 8;

pub const DEFAULT_LABELS_PER_UNIT: u64 = 1 << 32;
pub const DEFAULT_MIN_NUM_UNITS: u32 = 4;
pub const DEFAULT_MAX_NUM_UNITS: u32 = u32::MAX;
pub const DEFAULT_MAX_FILE_SIZE: u64 = 4 << 30;
pub const DEFAULT_COMPUTE_BATCH_SIZE: u64 = 1 << 20;

/// Helper type for accepting both string sizes ("4GiB") and raw bytes (u64)
#[derive(Debug, Clone)]
pub enum SizeInput {
    Bytes(u64),
    Str(String),
}

impl SizeInput {
    /// Convert to bytes, parsing string if needed
    pub fn to_bytes(&self) -> std::result::Result<u64, String> {
        match self {
            Self::Bytes(b) => Ok(*b),
            Self::Str(s) => s
                .parse::<ByteSize>()
                .map(|bs| bs.as_u64())
                .map_err(|e| format!("invalid size format '{}': {}", s, e)),
        }
    }
}

impl From<u64> for SizeInput {
    fn from(v: u64) -> Self {
        Self::Bytes(v)
    }
}

impl From<&str> for SizeInput {
    fn from(v: &str) -> Self {
        Self::Str(v.to_string())
    }
}

impl From<String> for SizeInput {
    fn from(v: String) -> Self {
        Self::Str(v)
    }
}

/// Protocol-level parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
#[validate(schema(function = "validate_unit_bounds"))]
pub struct PostConfig {
    /// Number of labels making up one space unit
    #[validate(range(min = 1))]
    pub labels_per_unit: u64,

    /// Smallest number of units a node may commit
    #[validate(range(min = 1))]
    pub min_num_units: u32,

    /// Largest number of units a node may commit
    pub max_num_units: u32,
}

impl Default for PostConfig {
    fn default() -> Self {
        Self {
            labels_per_unit: DEFAULT_LABELS_PER_UNIT,
            min_num_units: DEFAULT_MIN_NUM_UNITS,
            max_num_units: DEFAULT_MAX_NUM_UNITS,
        }
    }
}

fn validate_unit_bounds(cfg: &PostConfig) -> std::result::Result<(), ValidationError> {
    if cfg.min_num_units > cfg.max_num_units {
        return Err(ValidationError::new("min_num_units_exceeds_max_num_units"));
    }
    Ok(())
}

/// Options for initializing one data directory.
#[derive(Debug, Clone, PartialEq, Eq, Builder, Serialize, Deserialize, Validate)]
#[builder(build_fn(validate = "Self::validate"))]
pub struct InitOpts {
    /// Directory holding the label files and the metadata record
    #[builder(setter(into))]
    pub data_dir: PathBuf,

    /// Number of space units to initialize
    #[validate(range(min = 1))]
    pub num_units: u32,

    /// Upper bound on the size of a single label file, in bytes
    #[validate(range(min = 16))]
    #[builder(private, default = "DEFAULT_MAX_FILE_SIZE", setter(name = "_max_file_size"))]
    pub max_file_size: u64,

    /// Compute provider used by the work oracle
    #[builder(default)]
    #[serde(default)]
    pub provider_id: ProviderId,

    /// Number of labels requested from the work oracle per batch
    #[validate(range(min = 1))]
    #[builder(default = "DEFAULT_COMPUTE_BATCH_SIZE")]
    pub compute_batch_size: u64,

    /// Index of the first file to initialize (inclusive)
    #[builder(default)]
    #[serde(default)]
    pub from_file_idx: usize,

    /// Index of the last file to initialize (inclusive). None = last file of the layout
    #[builder(default, setter(strip_option))]
    #[serde(default)]
    pub to_file_idx: Option<usize>,
}

impl Default for InitOpts {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("post_data"),
            num_units: DEFAULT_MIN_NUM_UNITS,
            max_file_size: DEFAULT_MAX_FILE_SIZE,
            provider_id: 0,
            compute_batch_size: DEFAULT_COMPUTE_BATCH_SIZE,
            from_file_idx: 0,
            to_file_idx: None,
        }
    }
}

impl InitOptsBuilder {
    /// Set the max file size (accepts "4GiB" or raw u64)
    pub fn max_file_size(&mut self, size: impl Into<SizeInput>) -> &mut Self {
        match size.into().to_bytes() {
            Ok(bytes) => {
                self.max_file_size = Some(bytes);
            }
            Err(e) => {
                tracing::warn!("Invalid max_file_size: {}", e);
                self.max_file_size = Some(0); // Will fail validation
            }
        }
        self
    }

    fn validate(&self) -> std::result::Result<(), String> {
        if let Some(size) = self.max_file_size
            && size < BYTES_PER_LABEL
        {
            return Err(format!(
                "max_file_size must hold at least one label ({} bytes), got {}",
                BYTES_PER_LABEL, size
            ));
        }

        if self.compute_batch_size == Some(0) {
            return Err("compute_batch_size must be greater than 0".into());
        }

        if self.num_units == Some(0) {
            return Err("num_units must be greater than 0".into());
        }

        if let (Some(from), Some(Some(to))) = (self.from_file_idx, self.to_file_idx)
            && from > to
        {
            return Err(format!(
                "from_file_idx ({}) must not exceed to_file_idx ({})",
                from, to
            ));
        }

        Ok(())
    }
}

impl InitOpts {
    /// Builder for InitOpts
    pub fn builder() -> InitOptsBuilder {
        InitOptsBuilder::default()
    }

    /// Number of labels that fit in one file without exceeding `max_file_size`.
    pub fn max_file_num_labels(&self) -> u64 {
        self.max_file_size / BYTES_PER_LABEL
    }

    /// Total number of labels this directory commits to.
    pub fn total_labels(&self, cfg: &PostConfig) -> u64 {
        u64::from(self.num_units).saturating_mul(cfg.labels_per_unit)
    }

    /// Total number of label files for the whole commitment.
    pub fn total_files(&self, cfg: &PostConfig) -> usize {
        let per_file = self.max_file_num_labels();
        if per_file == 0 {
            return 0;
        }
        self.total_labels(cfg).div_ceil(per_file) as usize
    }

    /// Validate these options together with the protocol config.
    pub fn validate_against(&self, cfg: &PostConfig) -> Result<()> {
        cfg.validate()?;
        self.validate()?;

        if self.num_units < cfg.min_num_units || self.num_units > cfg.max_num_units {
            return Err(InitError::InvalidConfig(format!(
                "num_units must be within [{}, {}], got {}",
                cfg.min_num_units, cfg.max_num_units, self.num_units
            )));
        }

        if u64::from(self.num_units)
            .checked_mul(cfg.labels_per_unit)
            .is_none()
        {
            return Err(InitError::InvalidConfig(format!(
                "num_units ({}) * labels_per_unit ({}) overflows",
                self.num_units, cfg.labels_per_unit
            )));
        }

        let total_files = self.total_files(cfg);
        let to = self.to_file_idx.unwrap_or(total_files.saturating_sub(1));
        if self.from_file_idx > to {
            return Err(InitError::InvalidConfig(format!(
                "from_file_idx ({}) must not exceed to_file_idx ({})",
                self.from_file_idx, to
            )));
        }
        if to >= total_files {
            return Err(InitError::InvalidConfig(format!(
                "to_file_idx ({}) must be below the total number of files ({})",
                to, total_files
            )));
        }

        Ok(())
    }
}

/// Top-level settings: protocol config plus init options.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, Validate)]
pub struct Settings {
    #[validate(nested)]
    #[serde(default)]
    pub post: PostConfig,

    #[validate(nested)]
    #[serde(default)]
    pub init: InitOpts,
}

impl Settings {
    /// Create a Figment configuration with all sources merged.
    ///
    /// Configuration sources in priority order (lowest to highest):
    /// 1. Code defaults
    /// 2. System config file at /etc/post-init/post-init.toml
    /// 3. TOML file from POST_INIT_CONFIG_PATH environment variable
    /// 4. Environment variables (POST_CONFIG_* and POST_INIT_* prefixed)
    pub fn figment() -> Figment {
        let config_path = std::env::var("POST_INIT_CONFIG_PATH").unwrap_or_default();

        Figment::new()
            .merge(Serialized::defaults(Settings::default()))
            .merge(Toml::file("/etc/post-init/post-init.toml"))
            .merge(Toml::file(&config_path))
            // Protocol config: POST_CONFIG_LABELS_PER_UNIT, POST_CONFIG_MIN_NUM_UNITS, ...
            .merge(
                Env::prefixed("POST_CONFIG_")
                    .map(|k| format!("post.{}", k.as_str().to_lowercase()).into()),
            )
            // Init options: POST_INIT_DATA_DIR, POST_INIT_NUM_UNITS, ...
            .merge(
                Env::prefixed("POST_INIT_")
                    .ignore(&["CONFIG_PATH"])
                    .map(|k| format!("init.{}", k.as_str().to_lowercase()).into()),
            )
    }

    /// Load settings from default figment (env and files).
    pub fn from_env() -> Result<Self> {
        Self::extract_from(Self::figment())
    }

    /// Build a figment from defaults, then merge a custom provider.
    pub fn figment_with<T: Provider>(extra: T) -> Figment {
        Self::figment().merge(extra)
    }

    /// Extract settings from any provider.
    pub fn extract_from<T: Provider>(provider: T) -> Result<Self> {
        let settings: Self = Figment::from(provider)
            .extract()
            .map_err(|e| InitError::InvalidConfig(e.to_string()))?;
        settings.validate()?;
        Ok(settings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn small_config() -> PostConfig {
        PostConfig {
            labels_per_unit: 64,
            min_num_units: 1,
            max_num_units: 8,
        }
    }

    #[test]
    fn test_size_input_from_str() {
        let input: SizeInput = "4GiB".into();
        assert_eq!(input.to_bytes().unwrap(), 4 << 30);

        let input: SizeInput = "512B".into();
        assert_eq!(input.to_bytes().unwrap(), 512);
    }

    #[test]
    fn test_builder_defaults() {
        let opts = InitOpts::builder()
            .data_dir("/tmp/post")
            .num_units(4)
            .build()
            .expect("failed to build opts");

        assert_eq!(opts.max_file_size, DEFAULT_MAX_FILE_SIZE);
        assert_eq!(opts.compute_batch_size, DEFAULT_COMPUTE_BATCH_SIZE);
        assert_eq!(opts.provider_id, 0);
        assert_eq!(opts.from_file_idx, 0);
        assert_eq!(opts.to_file_idx, None);
    }

    #[test]
    fn test_builder_with_string_size() {
        let opts = InitOpts::builder()
            .data_dir("/tmp/post")
            .num_units(4)
            .max_file_size("1KiB")
            .build()
            .expect("failed to build opts");

        assert_eq!(opts.max_file_size, 1024);
        assert_eq!(opts.max_file_num_labels(), 64);
    }

    #[test]
    fn test_builder_rejects_file_smaller_than_label() {
        let result = InitOpts::builder()
            .data_dir("/tmp/post")
            .num_units(4)
            .max_file_size(8u64)
            .build();

        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("at least one label"));
    }

    #[test]
    fn test_builder_rejects_inverted_file_range() {
        let result = InitOpts::builder()
            .data_dir("/tmp/post")
            .num_units(4)
            .from_file_idx(3)
            .to_file_idx(1)
            .build();

        assert!(result.is_err());
    }

    #[rstest]
    #[case(512, 2)]
    #[case(1024, 1)]
    #[case(16, 64)]
    #[case(1000, 2)]
    fn test_total_files(#[case] max_file_size: u64, #[case] expected: usize) {
        let opts = InitOpts::builder()
            .data_dir("/tmp/post")
            .num_units(1)
            .max_file_size(max_file_size)
            .build()
            .unwrap();

        assert_eq!(opts.total_files(&small_config()), expected);
    }

    #[rstest]
    #[case::too_few_units(0, None)]
    #[case::too_many_units(9, None)]
    #[case::to_beyond_layout(1, Some(2))]
    fn test_validate_against_rejects(#[case] num_units: u32, #[case] to: Option<usize>) {
        let opts = InitOpts {
            data_dir: PathBuf::from("/tmp/post"),
            num_units,
            max_file_size: 512,
            to_file_idx: to,
            ..Default::default()
        };

        assert!(opts.validate_against(&small_config()).is_err());
    }

    #[test]
    fn test_validate_against_accepts_partition_bounds() {
        let opts = InitOpts {
            data_dir: PathBuf::from("/tmp/post"),
            num_units: 1,
            max_file_size: 512,
            from_file_idx: 1,
            to_file_idx: Some(1),
            ..Default::default()
        };

        opts.validate_against(&small_config())
            .expect("partition bounds are within the layout");
    }

    #[test]
    fn test_post_config_rejects_inverted_unit_bounds() {
        let cfg = PostConfig {
            labels_per_unit: 64,
            min_num_units: 8,
            max_num_units: 2,
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_settings_from_env() {
        temp_env::with_vars(
            vec![
                ("POST_INIT_CONFIG_PATH", None),
                ("POST_CONFIG_LABELS_PER_UNIT", Some("1024")),
                ("POST_INIT_NUM_UNITS", Some("6")),
                ("POST_INIT_DATA_DIR", Some("/mnt/post")),
                ("POST_INIT_MAX_FILE_SIZE", None),
            ],
            || {
                let settings = Settings::from_env().expect("settings should load");
                assert_eq!(settings.post.labels_per_unit, 1024);
                assert_eq!(settings.init.num_units, 6);
                assert_eq!(settings.init.data_dir, PathBuf::from("/mnt/post"));
                assert_eq!(settings.init.max_file_size, DEFAULT_MAX_FILE_SIZE);
            },
        );
    }

    #[test]
    fn test_settings_from_toml_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("post-init.toml");
        std::fs::write(
            &path,
            r#"
            [post]
            labels_per_unit = 4096

            [init]
            num_units = 12
            max_file_size = 1048576
            "#,
        )
        .unwrap();

        temp_env::with_vars(
            vec![
                ("POST_INIT_CONFIG_PATH", Some(path.to_str().unwrap())),
                ("POST_CONFIG_LABELS_PER_UNIT", None),
                ("POST_INIT_NUM_UNITS", Some("16")),
                ("POST_INIT_MAX_FILE_SIZE", None),
            ],
            || {
                let settings = Settings::from_env().expect("settings should load");
                assert_eq!(settings.post.labels_per_unit, 4096);
                assert_eq!(settings.init.max_file_size, 1 << 20);
                // Env wins over the file
                assert_eq!(settings.init.num_units, 16);
            },
        );
    }

    #[test]
    fn test_settings_figment_with_overrides() {
        temp_env::with_vars_unset(
            vec!["POST_INIT_CONFIG_PATH", "POST_INIT_COMPUTE_BATCH_SIZE"],
            || {
                let settings = Settings::extract_from(Settings::figment_with((
                    "init.compute_batch_size",
                    256u64,
                )))
                .expect("settings should load");

                assert_eq!(settings.init.compute_batch_size, 256);
            },
        );
    }
}
