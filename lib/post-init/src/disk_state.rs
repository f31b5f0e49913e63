// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! On-disk progress, derived from label file sizes.

use std::path::{Path, PathBuf};

use crate::config::BYTES_PER_LABEL;
use crate::error::{InitError, Result};

const LABEL_FILE_PREFIX: &str = "postdata_";
const LABEL_FILE_SUFFIX: &str = ".bin";

pub fn label_file_name(file_index: usize) -> String {
    format!("{LABEL_FILE_PREFIX}{file_index}{LABEL_FILE_SUFFIX}")
}

/// Parse the index out of a label file name; None for any other file.
pub fn parse_label_file_name(name: &str) -> Option<usize> {
    let index = name
        .strip_prefix(LABEL_FILE_PREFIX)?
        .strip_suffix(LABEL_FILE_SUFFIX)?;
    if index.is_empty() || !index.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    index.parse().ok()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LabelFile {
    pub index: usize,
    pub len: u64,
}

/// Reads progress from the label files in a data directory.
///
/// Synchronous: it backs the sync [`crate::Initializer::status`] and only
/// lists the directory and stats its entries.
#[derive(Debug, Clone)]
pub struct DiskState {
    data_dir: PathBuf,
}

impl DiskState {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
        }
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// Label files currently on disk, sorted by index. A missing directory has none.
    pub fn label_files(&self) -> Result<Vec<LabelFile>> {
        let entries = match std::fs::read_dir(&self.data_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(InitError::io(&self.data_dir, e)),
        };

        let mut files = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| InitError::io(&self.data_dir, e))?;
            let Some(index) = entry.file_name().to_str().and_then(parse_label_file_name) else {
                continue;
            };
            let meta = entry
                .metadata()
                .map_err(|e| InitError::io(entry.path(), e))?;
            if !meta.is_file() {
                continue;
            }
            files.push(LabelFile {
                index,
                len: meta.len(),
            });
        }

        files.sort_by_key(|f| f.index);
        Ok(files)
    }

    /// Whole labels written across all label files.
    pub fn num_labels_written(&self) -> Result<u64> {
        Ok(self
            .label_files()?
            .iter()
            .map(|f| f.len / BYTES_PER_LABEL)
            .sum())
    }

    pub fn num_files_written(&self) -> Result<usize> {
        Ok(self.label_files()?.len())
    }
}
