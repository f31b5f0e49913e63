// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Multi-provider partitioning.
//!
//! The file range of one data directory is split into contiguous, disjoint
//! partitions, one per compute provider, and each partition is filled by its
//! own [`Initializer`] concurrently. The orchestrator is the only writer of
//! the metadata record: partitions report better nonces and completed files
//! over a channel to a single owner task that merges and saves them.

use std::ops::RangeInclusive;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::error::{InitError, Result};
use crate::initializer::{Initializer, InitializerConfig, ProgressUpdate};
use crate::metadata::{self, PostMetadata};
use crate::oracle::ProviderId;

pub const DEFAULT_LAUNCH_DELAY: Duration = Duration::from_secs(1);

/// Split `0..num_files` into at most `num_partitions` contiguous inclusive
/// ranges of equal size; the last range takes the remainder.
///
/// With fewer files than partitions, each file gets its own range.
pub fn partition_files(num_files: usize, num_partitions: usize) -> Vec<RangeInclusive<usize>> {
    if num_files == 0 || num_partitions == 0 {
        return Vec::new();
    }

    let n = num_partitions.min(num_files);
    let each = num_files / n;
    (0..n)
        .map(|i| {
            let start = i * each;
            let end = if i + 1 == n {
                num_files - 1
            } else {
                start + each - 1
            };
            start..=end
        })
        .collect()
}

/// Runs one partition per provider against a shared data directory.
pub struct MultiProviderInitializer {
    config: InitializerConfig,
    providers: Vec<ProviderId>,
    launch_delay: Duration,
}

impl MultiProviderInitializer {
    pub fn new(config: InitializerConfig, providers: Vec<ProviderId>) -> Self {
        Self {
            config,
            providers,
            launch_delay: DEFAULT_LAUNCH_DELAY,
        }
    }

    /// Delay between consecutive partition launches.
    pub fn with_launch_delay(mut self, launch_delay: Duration) -> Self {
        self.launch_delay = launch_delay;
        self
    }

    /// Initialize the whole directory.
    ///
    /// Returns an [`Initializer`] over the full layout, holding the merged
    /// nonce, for status queries. The first partition failure cancels the
    /// remaining partitions and is returned once all of them have stopped.
    pub async fn run(&self, cancel: CancellationToken) -> Result<Initializer> {
        if self.providers.is_empty() {
            return Err(InitError::InvalidConfig(
                "at least one compute provider is required".to_string(),
            ));
        }

        let mut root_config = self.config.clone();
        root_config.init.from_file_idx = 0;
        root_config.init.to_file_idx = None;
        let root = Initializer::new(root_config).await?;
        root.remove_redundant_files().await?;

        let layout = *root.layout();
        let ranges = partition_files(layout.num_files, self.providers.len());
        if ranges.len() < self.providers.len() {
            tracing::warn!(
                num_files = layout.num_files,
                num_providers = self.providers.len(),
                idle = ?&self.providers[ranges.len()..],
                "fewer files than providers, leaving providers idle"
            );
        }

        let (updates_tx, updates_rx) = mpsc::unbounded_channel();
        let mut partitions = Vec::with_capacity(ranges.len());
        for (provider_id, range) in self.providers.iter().copied().zip(ranges) {
            let mut config = self.config.clone();
            config.init.provider_id = provider_id;
            config.init.from_file_idx = *range.start();
            config.init.to_file_idx = Some(*range.end());

            tracing::info!(
                provider_id,
                from_file_idx = range.start(),
                to_file_idx = range.end(),
                "prepared partition"
            );
            let init = Initializer::for_partition(config, updates_tx.clone()).await?;
            partitions.push((provider_id, Arc::new(init)));
        }
        drop(updates_tx);

        let token = cancel.child_token();
        let owner = tokio::spawn(own_metadata(
            root.opts().data_dir.clone(),
            root.metadata(),
            updates_rx,
            token.clone(),
        ));

        let mut join_set = JoinSet::new();
        for (i, (provider_id, init)) in partitions.into_iter().enumerate() {
            let token = token.clone();
            let delay = self.launch_delay * i as u32;
            join_set.spawn(async move {
                tokio::select! {
                    _ = token.cancelled() => return (provider_id, Err(InitError::Cancelled)),
                    _ = tokio::time::sleep(delay) => {}
                }
                tracing::info!(provider_id, "launching partition");
                (provider_id, init.initialize(token).await)
            });
        }

        let mut first_error = None;
        let mut cancelled = false;
        while let Some(joined) = join_set.join_next().await {
            let (provider_id, result) = match joined {
                Ok(res) => res,
                Err(e) => {
                    tracing::error!(error = %e, "partition task aborted, cancelling the others");
                    token.cancel();
                    first_error.get_or_insert(InitError::PartitionFailed(e.to_string()));
                    continue;
                }
            };

            match result {
                Ok(()) => tracing::info!(provider_id, "partition completed"),
                Err(e) if e.is_cancelled() => cancelled = true,
                Err(e) => {
                    tracing::error!(provider_id, error = %e, "partition failed, cancelling the others");
                    token.cancel();
                    first_error.get_or_insert(e);
                }
            }
        }

        let record = owner
            .await
            .map_err(|e| InitError::PartitionFailed(e.to_string()))??;
        if let Some(e) = first_error {
            return Err(e);
        }
        if cancelled {
            return Err(InitError::Cancelled);
        }

        root.restore(&record);
        root.refresh_progress()?;
        if root.nonce().is_none() {
            root.initialize(cancel).await?;
        }
        Ok(root)
    }
}

/// Single writer of the metadata record while partitions run.
async fn own_metadata(
    data_dir: PathBuf,
    mut record: PostMetadata,
    mut updates: mpsc::UnboundedReceiver<ProgressUpdate>,
    token: CancellationToken,
) -> Result<PostMetadata> {
    let mut search = record.search();

    while let Some(update) = updates.recv().await {
        match update {
            ProgressUpdate::BetterNonce(nonce) => {
                if !search.offer(nonce) {
                    continue;
                }
                record.apply(&search);
                tracing::debug!(nonce = nonce.position, "merged better nonce");
            }
            ProgressUpdate::FileCompleted {
                file_index,
                num_labels,
            } => {
                tracing::debug!(file_index, num_labels, "partition completed file");
            }
        }

        if let Err(e) = metadata::save(&data_dir, &record).await {
            tracing::error!(error = %e, "failed to save metadata, cancelling partitions");
            token.cancel();
            return Err(e);
        }
    }

    Ok(record)
}
