// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Persistent metadata record.
//!
//! One JSON record per data directory holds the identity, the configuration
//! the labels were written with, and the nonce search progress. The record is
//! always replaced as a whole: it is written to a uniquely named temp file,
//! synced, and renamed over the previous record.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;

use crate::config::{InitOpts, PostConfig};
use crate::error::{InitError, Result};
use crate::nonce::{Nonce, NonceSearch, NonceValue};
use crate::oracle::Id;

pub const METADATA_FILE_NAME: &str = "postdata_metadata.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PostMetadata {
    #[serde(with = "base64_bytes")]
    pub node_id: Id,

    #[serde(with = "base64_bytes")]
    pub commitment_atx_id: Id,

    pub labels_per_unit: u64,
    pub num_units: u32,
    pub max_file_size: u64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nonce: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none", with = "base64_opt")]
    pub nonce_value: Option<NonceValue>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_position: Option<u64>,
}

impl PostMetadata {
    pub fn new(
        node_id: Id,
        commitment_atx_id: Id,
        cfg: &PostConfig,
        opts: &InitOpts,
        search: &NonceSearch,
    ) -> Self {
        let mut metadata = Self {
            node_id,
            commitment_atx_id,
            labels_per_unit: cfg.labels_per_unit,
            num_units: opts.num_units,
            max_file_size: opts.max_file_size,
            nonce: None,
            nonce_value: None,
            last_position: None,
        };
        metadata.apply(search);
        metadata
    }

    /// Copy the search progress into the record.
    pub fn apply(&mut self, search: &NonceSearch) {
        let best = search.best();
        self.nonce = best.map(|n| n.position);
        self.nonce_value = best.and_then(|n| n.value);
        self.last_position = search.last_position();
    }

    /// Search progress stored in the record.
    pub fn search(&self) -> NonceSearch {
        let best = self.nonce.map(|position| Nonce {
            position,
            value: self.nonce_value,
        });
        NonceSearch::new(best, self.last_position)
    }
}

pub fn metadata_path(data_dir: &Path) -> PathBuf {
    data_dir.join(METADATA_FILE_NAME)
}

/// Atomically replace the metadata record in `data_dir`.
pub async fn save(data_dir: &Path, metadata: &PostMetadata) -> Result<()> {
    let content = serde_json::to_vec_pretty(metadata).map_err(|e| InitError::MetadataEncode {
        path: metadata_path(data_dir),
        source: e,
    })?;

    tokio::fs::create_dir_all(data_dir)
        .await
        .map_err(|e| InitError::io(data_dir, e))?;

    // Unique temp name so concurrent saves never share a temp file
    let temp_path = data_dir.join(format!(
        "{}.tmp.{}",
        METADATA_FILE_NAME,
        uuid::Uuid::new_v4().simple()
    ));

    let write = async {
        let mut file = tokio::fs::File::create(&temp_path).await?;
        file.write_all(&content).await?;
        file.sync_all().await?;
        tokio::fs::rename(&temp_path, metadata_path(data_dir)).await
    };

    if let Err(e) = write.await {
        let _ = tokio::fs::remove_file(&temp_path).await;
        return Err(InitError::io(metadata_path(data_dir), e));
    }

    Ok(())
}

/// Read the metadata record from `data_dir`.
pub async fn load(data_dir: &Path) -> Result<PostMetadata> {
    let path = metadata_path(data_dir);
    let content = match tokio::fs::read(&path).await {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(InitError::MetadataMissing {
                data_dir: data_dir.to_path_buf(),
            });
        }
        Err(e) => return Err(InitError::io(path, e)),
    };

    serde_json::from_slice(&content).map_err(|e| InitError::MetadataCorrupt { path, source: e })
}

/// Check that a directory initialized as `existing` can be resumed with the
/// requested identity and configuration.
///
/// `expected` in the returned error is what the directory requires, `found`
/// is what was requested.
pub fn verify(
    existing: &PostMetadata,
    node_id: &Id,
    commitment_atx_id: &Id,
    cfg: &PostConfig,
    opts: &InitOpts,
) -> Result<()> {
    let mismatch = |param, expected: String, found: String| InitError::ConfigMismatch {
        param,
        expected,
        found,
        data_dir: opts.data_dir.clone(),
    };

    if existing.node_id != *node_id {
        return Err(mismatch(
            "node_id",
            hex::encode(existing.node_id),
            hex::encode(node_id),
        ));
    }

    if existing.commitment_atx_id != *commitment_atx_id {
        return Err(mismatch(
            "commitment_atx_id",
            hex::encode(existing.commitment_atx_id),
            hex::encode(commitment_atx_id),
        ));
    }

    if existing.labels_per_unit != cfg.labels_per_unit {
        return Err(mismatch(
            "labels_per_unit",
            existing.labels_per_unit.to_string(),
            cfg.labels_per_unit.to_string(),
        ));
    }

    if existing.max_file_size != opts.max_file_size {
        return Err(mismatch(
            "max_file_size",
            existing.max_file_size.to_string(),
            opts.max_file_size.to_string(),
        ));
    }

    if opts.num_units < existing.num_units {
        return Err(mismatch(
            "num_units",
            format!(">= {}", existing.num_units),
            opts.num_units.to_string(),
        ));
    }

    Ok(())
}

mod base64_bytes {
    use base64::Engine as _;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer, de::Error};

    pub fn serialize<S: Serializer, const N: usize>(
        bytes: &[u8; N],
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>, const N: usize>(
        deserializer: D,
    ) -> Result<[u8; N], D::Error> {
        let s = String::deserialize(deserializer)?;
        let bytes = STANDARD.decode(s).map_err(D::Error::custom)?;
        bytes
            .try_into()
            .map_err(|v: Vec<u8>| D::Error::invalid_length(v.len(), &"fixed-size byte string"))
    }
}

mod base64_opt {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer, const N: usize>(
        bytes: &Option<[u8; N]>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match bytes {
            Some(bytes) => super::base64_bytes::serialize(bytes, serializer),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>, const N: usize>(
        deserializer: D,
    ) -> Result<Option<[u8; N]>, D::Error> {
        #[derive(Deserialize)]
        struct Wrapper<const M: usize>(#[serde(with = "super::base64_bytes")] [u8; M]);

        let wrapper = Option::<Wrapper<N>>::deserialize(deserializer)?;
        Ok(wrapper.map(|Wrapper(bytes)| bytes))
    }
}
