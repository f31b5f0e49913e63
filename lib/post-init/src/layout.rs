// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

use std::ops::Range;

use crate::config::{InitOpts, PostConfig};

/// Partition of the label space into files.
///
/// Every file except the last holds `file_num_labels` labels; the last one
/// holds the remainder. `first_file_idx..end_file_idx` is the slice of files
/// assigned to this run, which is the whole layout unless the options carry
/// partition bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FilesLayout {
    pub num_files: usize,
    pub file_num_labels: u64,
    pub last_file_num_labels: u64,
    pub first_file_idx: usize,
    pub end_file_idx: usize,
}

impl FilesLayout {
    /// Derive the layout for the given configuration. Pure and deterministic.
    pub fn derive(cfg: &PostConfig, opts: &InitOpts) -> Self {
        let total_labels = opts.total_labels(cfg);
        let file_num_labels = opts.max_file_num_labels();

        if total_labels == 0 || file_num_labels == 0 {
            return Self {
                num_files: 0,
                file_num_labels,
                last_file_num_labels: 0,
                first_file_idx: 0,
                end_file_idx: 0,
            };
        }

        let num_files = total_labels.div_ceil(file_num_labels) as usize;
        let last_file_num_labels = total_labels - (num_files as u64 - 1) * file_num_labels;

        let end_file_idx = opts
            .to_file_idx
            .map_or(num_files, |to| to.saturating_add(1).min(num_files));
        let first_file_idx = opts.from_file_idx.min(end_file_idx);

        Self {
            num_files,
            file_num_labels,
            last_file_num_labels,
            first_file_idx,
            end_file_idx,
        }
    }

    /// Target label count of the file at `file_index`.
    pub fn labels_in_file(&self, file_index: usize) -> u64 {
        if file_index + 1 == self.num_files {
            self.last_file_num_labels
        } else {
            self.file_num_labels
        }
    }

    /// Position of the first label stored in the file at `file_index`.
    pub fn file_offset(&self, file_index: usize) -> u64 {
        file_index as u64 * self.file_num_labels
    }

    /// Files this run is responsible for.
    pub fn assigned_files(&self) -> Range<usize> {
        self.first_file_idx..self.end_file_idx
    }

    pub fn total_labels(&self) -> u64 {
        if self.num_files == 0 {
            return 0;
        }
        (self.num_files as u64 - 1) * self.file_num_labels + self.last_file_num_labels
    }
}
