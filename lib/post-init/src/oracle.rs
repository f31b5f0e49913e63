// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Work oracle seam.
//!
//! The engine never computes labels itself. A [`WorkOracle`] turns an inclusive
//! range of label positions into the labels of that range (16 bytes each, in
//! position order) and reports a position whose label satisfies the difficulty
//! threshold, if the range contains one. Oracles are built per run by an
//! [`OracleFactory`] for a selected compute provider.
//!
//! [`CpuOracleFactory`] is the reference implementation: labels are the keyed
//! BLAKE3 hash of the position under the commitment.

use std::sync::Arc;

use anyhow::{Result, bail, ensure};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::BYTES_PER_LABEL;
use crate::nonce::NonceValue;

pub type ProviderId = u32;

/// 32-byte identifier (node id, commitment ATX id, commitment).
pub type Id = [u8; 32];

/// Labels whose 16-byte value is strictly below this threshold are nonce candidates.
pub type Difficulty = [u8; 16];

/// Maps the total number of labels to the oracle's difficulty threshold.
pub type DifficultyFn = Arc<dyn Fn(u64) -> Difficulty + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceClass {
    Cpu,
    Gpu,
}

/// A compute provider available to an oracle factory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Provider {
    pub id: ProviderId,
    pub model: String,
    pub class: DeviceClass,
}

/// Output of one oracle call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Positions {
    /// Labels of the requested range, `BYTES_PER_LABEL` bytes per position.
    pub output: Vec<u8>,

    /// A position in the range whose label satisfies the difficulty threshold.
    pub nonce: Option<u64>,
}

/// Parameters an oracle is bound to for the duration of a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OracleParams {
    pub provider_id: ProviderId,
    pub commitment: Id,
    pub difficulty: Difficulty,
}

#[async_trait]
pub trait WorkOracle: Send + Sync {
    /// Compute the labels of positions `start..=end`.
    ///
    /// Must be deterministic for fixed [`OracleParams`].
    async fn positions(&self, start: u64, end: u64) -> Result<Positions>;
}

pub trait OracleFactory: Send + Sync {
    /// Compute providers this factory can build oracles for.
    fn providers(&self) -> Vec<Provider>;

    /// Build an oracle bound to `params`.
    fn create(&self, params: OracleParams) -> Result<Arc<dyn WorkOracle>>;
}

/// Commitment the labels are derived from.
pub fn commitment_bytes(node_id: &Id, commitment_atx_id: &Id) -> Id {
    let mut hasher = blake3::Hasher::new();
    hasher.update(node_id);
    hasher.update(commitment_atx_id);
    *hasher.finalize().as_bytes()
}

/// Default difficulty: on average one candidate per `num_labels` labels.
pub fn pow_difficulty(num_labels: u64) -> Difficulty {
    (u128::MAX / u128::from(num_labels.max(1))).to_be_bytes()
}

/// Reference CPU oracle.
pub struct CpuOracle {
    commitment: Id,
    difficulty: Difficulty,
}

impl CpuOracle {
    pub fn new(commitment: Id, difficulty: Difficulty) -> Self {
        Self {
            commitment,
            difficulty,
        }
    }

    /// Label of a single position.
    pub fn label(&self, position: u64) -> NonceValue {
        let hash = blake3::keyed_hash(&self.commitment, &position.to_le_bytes());
        let mut label = [0u8; 16];
        label.copy_from_slice(&hash.as_bytes()[..16]);
        label
    }

    fn compute(&self, start: u64, end: u64) -> Positions {
        let len = (end - start + 1) as usize;
        let mut output = Vec::with_capacity(len * BYTES_PER_LABEL as usize);
        let mut best: Option<(NonceValue, u64)> = None;

        for position in start..=end {
            let label = self.label(position);
            if label < self.difficulty && best.is_none_or(|(value, _)| label < value) {
                best = Some((label, position));
            }
            output.extend_from_slice(&label);
        }

        Positions {
            output,
            nonce: best.map(|(_, position)| position),
        }
    }
}

#[async_trait]
impl WorkOracle for CpuOracle {
    async fn positions(&self, start: u64, end: u64) -> Result<Positions> {
        ensure!(start <= end, "invalid position range {start}..={end}");

        let oracle = CpuOracle::new(self.commitment, self.difficulty);
        let positions = tokio::task::spawn_blocking(move || oracle.compute(start, end)).await?;
        Ok(positions)
    }
}

/// Builds [`CpuOracle`]s. Exposes a single CPU provider with id 0.
#[derive(Debug, Clone, Default)]
pub struct CpuOracleFactory;

impl CpuOracleFactory {
    pub const CPU_PROVIDER_ID: ProviderId = 0;
}

impl OracleFactory for CpuOracleFactory {
    fn providers(&self) -> Vec<Provider> {
        vec![Provider {
            id: Self::CPU_PROVIDER_ID,
            model: "CPU".to_string(),
            class: DeviceClass::Cpu,
        }]
    }

    fn create(&self, params: OracleParams) -> Result<Arc<dyn WorkOracle>> {
        if params.provider_id != Self::CPU_PROVIDER_ID {
            bail!("unknown compute provider {}", params.provider_id);
        }
        Ok(Arc::new(CpuOracle::new(params.commitment, params.difficulty)))
    }
}
