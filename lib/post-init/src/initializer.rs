// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Initializer lifecycle.
//!
//! An [`Initializer`] owns one data directory (or one partition of it). It
//! validates and resumes on construction, fills the assigned label files in
//! ascending order on [`Initializer::initialize`], and keeps the best nonce
//! and the written-label count readable without taking the run lock.

use std::cmp::Ordering as CmpOrdering;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use derive_builder::Builder;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::{BYTES_PER_LABEL, InitOpts, PostConfig};
use crate::disk_state::{DiskState, label_file_name};
use crate::error::{InitError, Result};
use crate::labels::LabelsWriter;
use crate::layout::FilesLayout;
use crate::metadata::{self, PostMetadata};
use crate::nonce::{Nonce, NonceSearch, NonceValue, SearchPhase, candidate_value};
use crate::oracle::{
    DifficultyFn, Id, OracleFactory, OracleParams, WorkOracle, commitment_bytes, pow_difficulty,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Status {
    NotStarted,
    Started,
    Initializing,
    Completed,
    Error,
}

/// Everything needed to build an [`Initializer`].
#[derive(Clone, Builder)]
#[builder(pattern = "owned", build_fn(validate = "Self::validate"))]
pub struct InitializerConfig {
    /// Protocol parameters
    #[builder(default)]
    pub post: PostConfig,

    /// Data directory and run options
    pub init: InitOpts,

    pub node_id: Id,

    pub commitment_atx_id: Id,

    /// Builds the work oracle for the configured provider
    pub oracle_factory: Arc<dyn OracleFactory>,

    /// Overrides [`pow_difficulty`]
    #[builder(default, setter(strip_option))]
    pub difficulty_fn: Option<DifficultyFn>,
}

impl InitializerConfigBuilder {
    fn validate(&self) -> std::result::Result<(), String> {
        if let Some(init) = &self.init {
            let post = self.post.clone().unwrap_or_default();
            init.validate_against(&post).map_err(|e| e.to_string())?;
        }
        Ok(())
    }
}

impl InitializerConfig {
    pub fn builder() -> InitializerConfigBuilder {
        InitializerConfigBuilder::default()
    }
}

/// Progress a partition reports to the metadata owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ProgressUpdate {
    BetterNonce(Nonce),
    FileCompleted { file_index: usize, num_labels: u64 },
}

/// Where progress that must survive a crash goes.
enum MetadataSink {
    /// Save the metadata record directly.
    Direct,

    /// Report to the orchestrator, which owns the record.
    Owner(mpsc::UnboundedSender<ProgressUpdate>),
}

/// Exclusive run flag shared by `initialize` and `reset`. Never waits.
struct RunGuard<'a>(&'a AtomicBool);

impl<'a> RunGuard<'a> {
    fn try_acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct Initializer {
    cfg: PostConfig,
    opts: InitOpts,
    node_id: Id,
    commitment_atx_id: Id,
    commitment: Id,
    oracle_factory: Arc<dyn OracleFactory>,
    difficulty_fn: DifficultyFn,
    layout: FilesLayout,
    disk_state: DiskState,
    sink: MetadataSink,

    search: Mutex<NonceSearch>,
    num_labels_written: AtomicU64,
    running: AtomicBool,
}

impl Initializer {
    /// Validate the options, verify an existing directory against them and
    /// save the metadata record.
    pub async fn new(config: InitializerConfig) -> Result<Self> {
        let init = Self::build(config, MetadataSink::Direct).await?;
        init.save_metadata().await?;
        Ok(init)
    }

    /// A partition initializer. It never writes metadata and skips the
    /// extended nonce search; progress goes to `updates` instead.
    pub(crate) async fn for_partition(
        config: InitializerConfig,
        updates: mpsc::UnboundedSender<ProgressUpdate>,
    ) -> Result<Self> {
        Self::build(config, MetadataSink::Owner(updates)).await
    }

    async fn build(config: InitializerConfig, sink: MetadataSink) -> Result<Self> {
        let InitializerConfig {
            post: cfg,
            init: opts,
            node_id,
            commitment_atx_id,
            oracle_factory,
            difficulty_fn,
        } = config;

        opts.validate_against(&cfg)?;

        let disk_state = DiskState::new(&opts.data_dir);
        let num_labels_written = disk_state.num_labels_written()?;

        let search = if num_labels_written > 0 {
            let existing = metadata::load(&opts.data_dir).await?;
            metadata::verify(&existing, &node_id, &commitment_atx_id, &cfg, &opts)?;
            existing.search()
        } else {
            NonceSearch::default()
        };

        Ok(Self {
            layout: FilesLayout::derive(&cfg, &opts),
            commitment: commitment_bytes(&node_id, &commitment_atx_id),
            difficulty_fn: difficulty_fn.unwrap_or_else(|| Arc::new(pow_difficulty) as DifficultyFn),
            cfg,
            opts,
            node_id,
            commitment_atx_id,
            oracle_factory,
            disk_state,
            sink,
            search: Mutex::new(search),
            num_labels_written: AtomicU64::new(num_labels_written),
            running: AtomicBool::new(false),
        })
    }

    pub fn layout(&self) -> &FilesLayout {
        &self.layout
    }

    pub fn opts(&self) -> &InitOpts {
        &self.opts
    }

    /// Labels written so far, as seen by the last or current run.
    pub fn num_labels_written(&self) -> u64 {
        self.num_labels_written.load(Ordering::Relaxed)
    }

    /// Position of the retained nonce, if any.
    pub fn nonce(&self) -> Option<u64> {
        self.search.lock().best().map(|n| n.position)
    }

    pub fn status(&self) -> Status {
        if self.running.load(Ordering::Acquire) {
            return Status::Initializing;
        }

        let written = match self.disk_state.num_labels_written() {
            Ok(written) => written,
            Err(e) => {
                tracing::warn!(error = %e, "failed to inspect label files");
                return Status::Error;
            }
        };

        if written == self.layout.total_labels() && self.nonce().is_some() {
            Status::Completed
        } else if written > 0 {
            Status::Started
        } else {
            Status::NotStarted
        }
    }

    /// Fill the assigned label files and search for a nonce.
    ///
    /// Fails fast with [`InitError::AlreadyInitializing`] when another
    /// `initialize` or `reset` is running. Returns [`InitError::Cancelled`]
    /// when `cancel` fires; calling again resumes at the next batch.
    pub async fn initialize(&self, cancel: CancellationToken) -> Result<()> {
        let Some(_guard) = RunGuard::try_acquire(&self.running) else {
            return Err(InitError::AlreadyInitializing);
        };

        let layout = self.layout;
        let total_labels = layout.total_labels();
        tracing::info!(
            data_dir = %self.opts.data_dir.display(),
            num_units = self.opts.num_units,
            labels_per_unit = self.cfg.labels_per_unit,
            total_labels,
            provider_id = self.opts.provider_id,
            "starting initialization"
        );
        tracing::info!(
            num_files = layout.num_files,
            file_num_labels = layout.file_num_labels,
            last_file_num_labels = layout.last_file_num_labels,
            first_file_idx = layout.first_file_idx,
            end_file_idx = layout.end_file_idx,
            "files layout"
        );

        if matches!(self.sink, MetadataSink::Direct) {
            self.remove_redundant_files().await?;
        }
        self.refresh_progress()?;

        let oracle = self
            .oracle_factory
            .create(OracleParams {
                provider_id: self.opts.provider_id,
                commitment: self.commitment,
                difficulty: (self.difficulty_fn)(total_labels),
            })
            .map_err(|e| {
                InitError::InvalidConfig(format!(
                    "failed to create work oracle for provider {}: {e:#}",
                    self.opts.provider_id
                ))
            })?;

        let mut phase = SearchPhase::WritingFiles;
        loop {
            phase = match phase {
                SearchPhase::WritingFiles => {
                    for file_index in layout.assigned_files() {
                        self.init_file(oracle.as_ref(), file_index, &cancel).await?;
                    }
                    let search = *self.search.lock();
                    SearchPhase::after_files(&search, total_labels, self.searches_beyond_end())
                }
                SearchPhase::SearchingNonce { next_position } => {
                    self.search_beyond_end(oracle.as_ref(), next_position, &cancel)
                        .await?;
                    SearchPhase::Done
                }
                SearchPhase::Done => break,
            };
        }

        tracing::info!(
            num_labels_written = self.num_labels_written(),
            nonce = ?self.nonce(),
            "initialization completed"
        );
        Ok(())
    }

    /// Delete all label files and the metadata record.
    pub async fn reset(&self) -> Result<()> {
        let Some(_guard) = RunGuard::try_acquire(&self.running) else {
            return Err(InitError::CannotResetWhileInitializing);
        };

        for file in self.disk_state.label_files()? {
            let path = self
                .opts
                .data_dir
                .join(label_file_name(file.index));
            remove_if_exists(&path).await?;
        }
        remove_if_exists(&metadata::metadata_path(&self.opts.data_dir)).await?;

        *self.search.lock() = NonceSearch::default();
        self.num_labels_written.store(0, Ordering::Relaxed);
        tracing::info!(data_dir = %self.opts.data_dir.display(), "data directory reset");
        Ok(())
    }

    /// Delete label files at or beyond the layout's file count.
    pub(crate) async fn remove_redundant_files(&self) -> Result<()> {
        for file in self.disk_state.label_files()? {
            if file.index < self.layout.num_files {
                continue;
            }
            tracing::info!(file_index = file.index, "removing redundant label file");
            remove_if_exists(&self.opts.data_dir.join(label_file_name(file.index))).await?;
        }
        Ok(())
    }

    /// Re-read the written label count from disk, e.g. after partitions
    /// filled the directory.
    pub(crate) fn refresh_progress(&self) -> Result<()> {
        self.num_labels_written
            .store(self.disk_state.num_labels_written()?, Ordering::Relaxed);
        Ok(())
    }

    /// Replace the in-memory search state, e.g. with the orchestrator's merged record.
    pub(crate) fn restore(&self, record: &PostMetadata) {
        *self.search.lock() = record.search();
    }

    pub(crate) fn metadata(&self) -> PostMetadata {
        let search = *self.search.lock();
        PostMetadata::new(
            self.node_id,
            self.commitment_atx_id,
            &self.cfg,
            &self.opts,
            &search,
        )
    }

    fn searches_beyond_end(&self) -> bool {
        matches!(self.sink, MetadataSink::Direct)
    }

    async fn init_file(
        &self,
        oracle: &dyn WorkOracle,
        file_index: usize,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let target = self.layout.labels_in_file(file_index);
        let file_offset = self.layout.file_offset(file_index);

        let mut writer = LabelsWriter::open(&self.opts.data_dir, file_index).await?;
        let written = writer.num_labels_written().await?;

        match written.cmp(&target) {
            CmpOrdering::Equal => {
                tracing::info!(file_index, num_labels = target, "file already initialized, skipping");
                return Ok(());
            }
            CmpOrdering::Greater => {
                tracing::info!(
                    file_index,
                    num_labels_written = written,
                    num_labels = target,
                    "file has more labels than expected, truncating"
                );
                writer.truncate(target).await?;
                self.num_labels_written
                    .fetch_sub(written - target, Ordering::Relaxed);
                return self.file_completed(file_index, target).await;
            }
            CmpOrdering::Less if written > 0 => {
                tracing::info!(
                    file_index,
                    num_labels_written = written,
                    num_labels = target,
                    "resuming file"
                );
            }
            CmpOrdering::Less => {
                tracing::info!(file_index, num_labels = target, "initializing file");
            }
        }

        let end = file_offset + target;
        let mut position = file_offset + written;

        if let Err(e) = self
            .write_batches(oracle, &mut writer, file_index, &mut position, end, cancel)
            .await
        {
            self.flush_after_error(&mut writer, file_index, position - file_offset)
                .await;
            return Err(e);
        }

        writer.flush().await?;
        let flushed = writer.num_labels_written().await?;
        if flushed != target {
            return Err(InitError::LabelFile {
                file_index,
                path: writer.path().to_path_buf(),
                source: std::io::Error::other(format!(
                    "expected {target} labels after flush, found {flushed}"
                )),
            });
        }

        tracing::info!(file_index, num_labels = target, "file completed");
        self.file_completed(file_index, target).await
    }

    /// Compute and append batches until `position` reaches `end`.
    ///
    /// `position` only advances past batches handed to the writer.
    async fn write_batches(
        &self,
        oracle: &dyn WorkOracle,
        writer: &mut LabelsWriter,
        file_index: usize,
        position: &mut u64,
        end: u64,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let batch_size = self.opts.compute_batch_size;

        while *position < end {
            if cancel.is_cancelled() {
                tracing::info!(
                    file_index,
                    start_position = *position,
                    "initialization cancelled"
                );
                return Err(InitError::Cancelled);
            }

            let batch_end = position.saturating_add(batch_size).min(end);
            let output = self.compute(oracle, *position, batch_end - 1).await?;
            writer.write(&output).await?;
            self.num_labels_written
                .fetch_add(batch_end - *position, Ordering::Relaxed);

            tracing::debug!(
                file_index,
                start_position = *position,
                end_position = batch_end - 1,
                num_labels_written = self.num_labels_written(),
                "batch written"
            );
            *position = batch_end;
        }
        Ok(())
    }

    /// Keep the buffered batches of an interrupted file. If they cannot be
    /// flushed, the counter drops back to what reached the file.
    async fn flush_after_error(&self, writer: &mut LabelsWriter, file_index: usize, handed: u64) {
        let Err(e) = writer.flush().await else {
            return;
        };
        tracing::warn!(file_index, error = %e, "failed to flush label file");

        match writer.num_labels_written().await {
            Ok(on_disk) => {
                self.num_labels_written
                    .fetch_sub(handed.saturating_sub(on_disk), Ordering::Relaxed);
            }
            Err(e) => {
                tracing::warn!(file_index, error = %e, "failed to recount label file");
                if let Ok(total) = self.disk_state.num_labels_written() {
                    self.num_labels_written.store(total, Ordering::Relaxed);
                }
            }
        }
    }

    /// Run the oracle over `start..=end`, offer its nonce candidate and
    /// return the labels.
    async fn compute(&self, oracle: &dyn WorkOracle, start: u64, end: u64) -> Result<Vec<u8>> {
        let res = oracle
            .positions(start, end)
            .await
            .map_err(|source| InitError::Oracle { start, end, source })?;

        let expected = (end - start + 1) * BYTES_PER_LABEL;
        if res.output.len() as u64 != expected {
            return Err(InitError::InvalidOracleOutput(format!(
                "positions {start}..={end}: expected {expected} bytes, got {}",
                res.output.len()
            )));
        }

        if let Some(position) = res.nonce {
            let value = candidate_value(&res.output, start, position)?;
            self.offer_nonce(position, value).await?;
        }

        Ok(res.output)
    }

    async fn offer_nonce(&self, position: u64, value: NonceValue) -> Result<()> {
        let nonce = Nonce {
            position,
            value: Some(value),
        };
        if !self.search.lock().offer(nonce) {
            return Ok(());
        }

        tracing::info!(nonce = position, value = %hex::encode(value), "found better nonce");
        match &self.sink {
            MetadataSink::Direct => self.save_metadata().await,
            MetadataSink::Owner(updates) => send(updates, ProgressUpdate::BetterNonce(nonce)),
        }
    }

    async fn file_completed(&self, file_index: usize, num_labels: u64) -> Result<()> {
        match &self.sink {
            MetadataSink::Direct => self.save_metadata().await,
            MetadataSink::Owner(updates) => send(
                updates,
                ProgressUpdate::FileCompleted {
                    file_index,
                    num_labels,
                },
            ),
        }
    }

    /// Keep searching past the written label space until a nonce turns up.
    async fn search_beyond_end(
        &self,
        oracle: &dyn WorkOracle,
        start: u64,
        cancel: &CancellationToken,
    ) -> Result<()> {
        tracing::info!(start_position = start, "no nonce in written labels, continuing search");

        let batch_size = self.opts.compute_batch_size;
        let mut position = start;
        loop {
            if cancel.is_cancelled() {
                tracing::info!(start_position = position, "nonce search cancelled");
                return Err(InitError::Cancelled);
            }

            let Some(end) = position.checked_add(batch_size - 1) else {
                return Err(InitError::NoNonceFound {
                    last_position: position,
                });
            };

            self.compute(oracle, position, end).await?;
            if self.nonce().is_some() {
                return Ok(());
            }

            let Some(next) = end.checked_add(1) else {
                return Err(InitError::NoNonceFound { last_position: end });
            };
            self.search.lock().set_last_position(next);
            self.save_metadata().await?;

            tracing::debug!(
                start_position = position,
                end_position = end,
                "no nonce in batch"
            );
            position = next;
        }
    }

    async fn save_metadata(&self) -> Result<()> {
        metadata::save(&self.opts.data_dir, &self.metadata()).await
    }
}

fn send(updates: &mpsc::UnboundedSender<ProgressUpdate>, update: ProgressUpdate) -> Result<()> {
    updates
        .send(update)
        .map_err(|_| InitError::PartitionFailed("metadata owner stopped".to_string()))
}

async fn remove_if_exists(path: &std::path::Path) -> Result<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(InitError::io(path, e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oracle::CpuOracleFactory;
    use std::path::Path;
    use tempfile::tempdir;

    fn config(data_dir: &Path) -> InitializerConfig {
        let init = InitOpts::builder()
            .data_dir(data_dir)
            .num_units(1)
            .max_file_size(512u64)
            .compute_batch_size(8)
            .build()
            .unwrap();

        InitializerConfig::builder()
            .post(PostConfig {
                labels_per_unit: 64,
                min_num_units: 1,
                max_num_units: 8,
            })
            .init(init)
            .node_id([1u8; 32])
            .commitment_atx_id([2u8; 32])
            .oracle_factory(Arc::new(CpuOracleFactory))
            .difficulty_fn(Arc::new(|_: u64| [0xff; 16]))
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_new_saves_metadata() {
        let dir = tempdir().unwrap();
        let init = Initializer::new(config(dir.path())).await.unwrap();

        assert_eq!(init.status(), Status::NotStarted);
        assert_eq!(init.num_labels_written(), 0);
        assert_eq!(init.nonce(), None);

        let record = metadata::load(dir.path()).await.unwrap();
        assert_eq!(record.num_units, 1);
        assert_eq!(record.labels_per_unit, 64);
    }

    #[tokio::test]
    async fn test_initialize_completes() {
        let dir = tempdir().unwrap();
        let init = Initializer::new(config(dir.path())).await.unwrap();

        init.initialize(CancellationToken::new()).await.unwrap();

        assert_eq!(init.status(), Status::Completed);
        assert_eq!(init.num_labels_written(), 64);
        assert!(init.nonce().is_some());
        assert_eq!(
            metadata::load(dir.path()).await.unwrap().nonce,
            init.nonce()
        );
    }

    #[tokio::test]
    async fn test_lock_is_fail_fast() {
        let dir = tempdir().unwrap();
        let init = Initializer::new(config(dir.path())).await.unwrap();

        let guard = RunGuard::try_acquire(&init.running).unwrap();
        assert_eq!(init.status(), Status::Initializing);
        assert!(matches!(
            init.initialize(CancellationToken::new()).await,
            Err(InitError::AlreadyInitializing)
        ));
        assert!(matches!(
            init.reset().await,
            Err(InitError::CannotResetWhileInitializing)
        ));

        drop(guard);
        assert_eq!(init.status(), Status::NotStarted);
        init.reset().await.unwrap();
    }

    #[tokio::test]
    async fn test_cancelled_before_first_batch() {
        let dir = tempdir().unwrap();
        let init = Initializer::new(config(dir.path())).await.unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = init.initialize(cancel).await.unwrap_err();
        assert!(err.is_cancelled());
        assert_eq!(init.status(), Status::NotStarted);
    }

    #[tokio::test]
    async fn test_labels_without_metadata_is_rejected() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("postdata_0.bin"), vec![0u8; 64]).unwrap();

        let result = Initializer::new(config(dir.path())).await;
        assert!(matches!(result, Err(InitError::MetadataMissing { .. })));
    }

    #[tokio::test]
    async fn test_redundant_files_removed() {
        let dir = tempdir().unwrap();
        let init = Initializer::new(config(dir.path())).await.unwrap();
        init.initialize(CancellationToken::new()).await.unwrap();

        std::fs::write(dir.path().join("postdata_2.bin"), vec![0u8; 32]).unwrap();
        std::fs::write(dir.path().join("postdata_9.bin"), vec![0u8; 32]).unwrap();

        let init = Initializer::new(config(dir.path())).await.unwrap();
        init.initialize(CancellationToken::new()).await.unwrap();

        assert!(!dir.path().join("postdata_2.bin").exists());
        assert!(!dir.path().join("postdata_9.bin").exists());
        assert_eq!(init.status(), Status::Completed);
    }

    #[test]
    fn test_builder_rejects_invalid_options() {
        let dir = tempdir().unwrap();
        let init = InitOpts {
            data_dir: dir.path().to_path_buf(),
            num_units: 20,
            max_file_size: 512,
            ..Default::default()
        };

        let result = InitializerConfig::builder()
            .post(PostConfig {
                labels_per_unit: 64,
                min_num_units: 1,
                max_num_units: 8,
            })
            .init(init)
            .node_id([1u8; 32])
            .commitment_atx_id([2u8; 32])
            .oracle_factory(Arc::new(CpuOracleFactory))
            .build();
        assert!(result.is_err());
    }
}
