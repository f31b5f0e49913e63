// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Common test utilities for initialization integration tests
//!
//! [`TestOracleFactory`] builds a deterministic work oracle that records every
//! range it is asked for, can trip a cancellation token once a position is
//! reached, can block its first call until released, and can fail on demand.

#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::bail;
use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use post_init::{
    DeviceClass, InitOpts, InitializerConfig, NonceValue, OracleFactory, OracleParams, PostConfig,
    Positions, Provider, ProviderId, WorkOracle,
};

pub const NODE_ID: [u8; 32] = [0x11; 32];
pub const ATX_ID: [u8; 32] = [0x22; 32];

/// Deterministic label of a position.
pub fn label(position: u64) -> NonceValue {
    let hash = blake3::hash(&position.to_le_bytes());
    let mut label = [0u8; 16];
    label.copy_from_slice(&hash.as_bytes()[..16]);
    label
}

/// Concatenated labels of `start..end`.
pub fn labels(start: u64, end: u64) -> Vec<u8> {
    (start..end).flat_map(label).collect()
}

/// Position in `start..end` with the smallest label.
pub fn min_label_position(start: u64, end: u64) -> u64 {
    (start..end).min_by_key(|p| label(*p)).unwrap()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Call {
    pub provider_id: ProviderId,
    pub start: u64,
    pub end: u64,
}

/// Blocks the first oracle call until released.
#[derive(Default)]
pub struct Gate {
    pub entered: Notify,
    pub release: Notify,
    armed: AtomicBool,
}

impl Gate {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            armed: AtomicBool::new(true),
            ..Default::default()
        })
    }
}

#[derive(Clone)]
pub struct TestOracleFactory {
    pub providers: Vec<ProviderId>,
    pub calls: Arc<Mutex<Vec<Call>>>,

    /// Only positions at or beyond this one are reported as nonce candidates.
    pub nonce_from: u64,

    /// Cancel the token once a batch starting at or beyond the position is requested.
    pub cancel_at: Option<(u64, CancellationToken)>,

    /// Provider whose oracle fails every call.
    pub failing_provider: Option<ProviderId>,

    /// Fail every batch starting at or beyond the position.
    pub fail_from: Option<u64>,

    /// Provider whose oracle panics on its first call.
    pub panicking_provider: Option<ProviderId>,

    pub gate: Option<Arc<Gate>>,
}

impl TestOracleFactory {
    pub fn new() -> Self {
        Self {
            providers: vec![0],
            calls: Arc::new(Mutex::new(Vec::new())),
            nonce_from: 0,
            cancel_at: None,
            failing_provider: None,
            fail_from: None,
            panicking_provider: None,
            gate: None,
        }
    }

    pub fn with_providers(mut self, providers: Vec<ProviderId>) -> Self {
        self.providers = providers;
        self
    }

    pub fn with_nonce_from(mut self, position: u64) -> Self {
        self.nonce_from = position;
        self
    }

    pub fn with_cancel_at(mut self, position: u64, token: CancellationToken) -> Self {
        self.cancel_at = Some((position, token));
        self
    }

    pub fn with_failing_provider(mut self, provider_id: ProviderId) -> Self {
        self.failing_provider = Some(provider_id);
        self
    }

    pub fn with_fail_from(mut self, position: u64) -> Self {
        self.fail_from = Some(position);
        self
    }

    pub fn with_panicking_provider(mut self, provider_id: ProviderId) -> Self {
        self.panicking_provider = Some(provider_id);
        self
    }

    pub fn with_gate(mut self, gate: Arc<Gate>) -> Self {
        self.gate = Some(gate);
        self
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }

    pub fn clear_calls(&self) {
        self.calls.lock().clear();
    }
}

impl OracleFactory for TestOracleFactory {
    fn providers(&self) -> Vec<Provider> {
        self.providers
            .iter()
            .map(|id| Provider {
                id: *id,
                model: format!("test-{id}"),
                class: DeviceClass::Cpu,
            })
            .collect()
    }

    fn create(&self, params: OracleParams) -> anyhow::Result<Arc<dyn WorkOracle>> {
        if !self.providers.contains(&params.provider_id) {
            bail!("unknown provider {}", params.provider_id);
        }
        Ok(Arc::new(TestOracle {
            provider_id: params.provider_id,
            factory: self.clone(),
        }))
    }
}

struct TestOracle {
    provider_id: ProviderId,
    factory: TestOracleFactory,
}

#[async_trait]
impl WorkOracle for TestOracle {
    async fn positions(&self, start: u64, end: u64) -> anyhow::Result<Positions> {
        if let Some(gate) = &self.factory.gate
            && gate.armed.swap(false, Ordering::SeqCst)
        {
            gate.entered.notify_one();
            gate.release.notified().await;
        }

        self.factory.calls.lock().push(Call {
            provider_id: self.provider_id,
            start,
            end,
        });

        if self.factory.failing_provider == Some(self.provider_id) {
            bail!("device {} lost", self.provider_id);
        }

        if self.factory.fail_from.is_some_and(|position| start >= position) {
            bail!("device {} failed at position {start}", self.provider_id);
        }

        if self.factory.panicking_provider == Some(self.provider_id) {
            panic!("device {} crashed", self.provider_id);
        }

        if let Some((position, token)) = &self.factory.cancel_at
            && start >= *position
        {
            token.cancel();
        }

        let output = labels(start, end + 1);
        let from = start.max(self.factory.nonce_from);
        let nonce = (from <= end).then(|| min_label_position(from, end + 1));
        Ok(Positions { output, nonce })
    }
}

pub fn post_config() -> PostConfig {
    PostConfig {
        labels_per_unit: 64,
        min_num_units: 1,
        max_num_units: 16,
    }
}

pub fn init_opts(data_dir: &Path, num_units: u32, max_file_size: u64) -> InitOpts {
    InitOpts::builder()
        .data_dir(data_dir)
        .num_units(num_units)
        .max_file_size(max_file_size)
        .compute_batch_size(8)
        .build()
        .expect("valid init options")
}

pub fn config(opts: InitOpts, factory: &TestOracleFactory) -> InitializerConfig {
    InitializerConfig::builder()
        .post(post_config())
        .init(opts)
        .node_id(NODE_ID)
        .commitment_atx_id(ATX_ID)
        .oracle_factory(Arc::new(factory.clone()))
        .build()
        .expect("valid initializer config")
}

pub fn read_label_file(data_dir: &Path, index: usize) -> Vec<u8> {
    std::fs::read(data_dir.join(post_init::label_file_name(index))).unwrap()
}
