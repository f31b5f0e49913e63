// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

use std::path::{Path, PathBuf};

use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncWriteExt, BufWriter};

use crate::config::BYTES_PER_LABEL;
use crate::disk_state::label_file_name;
use crate::error::{InitError, Result};

const WRITE_BUFFER_SIZE: usize = 8 << 20;

/// Appends labels to one label file.
///
/// Labels are buffered; [`LabelsWriter::flush`] pushes them to the file and
/// syncs it. The label count is read from the file size, so it only reflects
/// flushed labels.
pub struct LabelsWriter {
    file_index: usize,
    path: PathBuf,
    writer: BufWriter<File>,
}

impl LabelsWriter {
    /// Open (or create) the label file for `file_index` in `data_dir`.
    ///
    /// A torn trailing label left by a crash is cut off so appends stay
    /// aligned to label boundaries.
    pub async fn open(data_dir: &Path, file_index: usize) -> Result<Self> {
        tokio::fs::create_dir_all(data_dir)
            .await
            .map_err(|e| InitError::io(data_dir, e))?;

        let path = data_dir.join(label_file_name(file_index));
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|e| file_err(file_index, &path, e))?;

        let len = file
            .metadata()
            .await
            .map_err(|e| file_err(file_index, &path, e))?
            .len();
        let aligned = len - len % BYTES_PER_LABEL;
        if aligned != len {
            tracing::warn!(
                file_index,
                len,
                aligned,
                "label file has a partial trailing label, truncating"
            );
            file.set_len(aligned)
                .await
                .map_err(|e| file_err(file_index, &path, e))?;
        }

        Ok(Self {
            file_index,
            path,
            writer: BufWriter::with_capacity(WRITE_BUFFER_SIZE, file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Labels durably in the file (excludes anything still buffered).
    pub async fn num_labels_written(&self) -> Result<u64> {
        let len = self
            .writer
            .get_ref()
            .metadata()
            .await
            .map_err(|e| self.err(e))?
            .len();
        Ok(len / BYTES_PER_LABEL)
    }

    /// Append a batch of labels.
    pub async fn write(&mut self, labels: &[u8]) -> Result<()> {
        if labels.len() as u64 % BYTES_PER_LABEL != 0 {
            return Err(InitError::InvalidOracleOutput(format!(
                "batch of {} bytes is not a whole number of labels",
                labels.len()
            )));
        }
        self.writer
            .write_all(labels)
            .await
            .map_err(|e| self.err(e))
    }

    /// Push buffered labels to the file and sync its data.
    pub async fn flush(&mut self) -> Result<()> {
        self.writer.flush().await.map_err(|e| self.err(e))?;
        self.writer
            .get_ref()
            .sync_data()
            .await
            .map_err(|e| self.err(e))
    }

    /// Cut the file down to `num_labels` labels.
    pub async fn truncate(&mut self, num_labels: u64) -> Result<()> {
        self.flush().await?;
        let file = self.writer.get_ref();
        file.set_len(num_labels * BYTES_PER_LABEL)
            .await
            .map_err(|e| self.err(e))?;
        file.sync_all().await.map_err(|e| self.err(e))
    }

    fn err(&self, source: std::io::Error) -> InitError {
        file_err(self.file_index, &self.path, source)
    }
}

fn file_err(file_index: usize, path: &Path, source: std::io::Error) -> InitError {
    InitError::LabelFile {
        file_index,
        path: path.to_path_buf(),
        source,
    }
}
