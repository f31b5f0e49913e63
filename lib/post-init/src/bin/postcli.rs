// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use figment::Figment;
use tokio_util::sync::CancellationToken;

use post_init::{
    CpuOracleFactory, FilesLayout, Id, Initializer, InitializerConfig, MultiProviderInitializer,
    OracleFactory, ProviderId, Settings, SizeInput, logging,
};

#[derive(Parser, Debug)]
#[command(name = "postcli", about = "Initialize proof-of-space data")]
struct Cli {
    /// Data directory for label files and metadata
    #[arg(long)]
    datadir: Option<PathBuf>,

    /// Maximum size of one label file, e.g. "4GiB" or raw bytes
    #[arg(long)]
    max_file_size: Option<String>,

    /// Compute providers, comma-separated. More than one splits the files between them
    #[arg(long, value_delimiter = ',')]
    provider: Vec<ProviderId>,

    #[arg(long)]
    labels_per_unit: Option<u64>,

    #[arg(long)]
    num_units: Option<u32>,

    /// Node id (hex)
    #[arg(long, value_parser = parse_id)]
    id: Option<Id>,

    /// Commitment ATX id (hex)
    #[arg(long, value_parser = parse_id)]
    commitment_atx_id: Option<Id>,

    /// First file to initialize (inclusive)
    #[arg(long)]
    from_file: Option<usize>,

    /// Last file to initialize (inclusive)
    #[arg(long)]
    to_file: Option<usize>,

    /// Delete all label files and metadata in the data directory
    #[arg(long)]
    reset: bool,

    /// Print the available compute providers and exit
    #[arg(long)]
    print_providers: bool,

    /// Print the number of label files for the configuration and exit
    #[arg(long)]
    print_num_files: bool,

    /// Print the effective configuration and exit
    #[arg(long)]
    print_config: bool,
}

fn parse_id(s: &str) -> Result<Id, String> {
    let s = s.strip_prefix("0x").unwrap_or(s);
    let bytes = hex::decode(s).map_err(|e| format!("invalid hex: {e}"))?;
    Id::try_from(bytes.as_slice())
        .map_err(|_| format!("expected 32 bytes, got {}", bytes.len()))
}

/// Layer command-line flags over the figment settings.
fn settings_figment(cli: &Cli) -> anyhow::Result<Figment> {
    let mut figment = Settings::figment();

    if let Some(datadir) = &cli.datadir {
        figment = figment.merge(("init.data_dir", datadir));
    }
    if let Some(size) = &cli.max_file_size {
        let bytes = SizeInput::from(size.as_str())
            .to_bytes()
            .map_err(anyhow::Error::msg)?;
        figment = figment.merge(("init.max_file_size", bytes));
    }
    if let Some(labels_per_unit) = cli.labels_per_unit {
        figment = figment.merge(("post.labels_per_unit", labels_per_unit));
    }
    if let Some(num_units) = cli.num_units {
        figment = figment.merge(("init.num_units", num_units));
    }
    if let Some(provider) = cli.provider.first() {
        figment = figment.merge(("init.provider_id", provider));
    }
    if let Some(from) = cli.from_file {
        figment = figment.merge(("init.from_file_idx", from));
    }
    if let Some(to) = cli.to_file {
        figment = figment.merge(("init.to_file_idx", to));
    }

    Ok(figment)
}

fn spawn_ctrl_c(cancel: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Received interrupt, stopping at the next batch boundary");
            cancel.cancel();
        }
    });
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    logging::init();

    let cli = Cli::parse();
    let factory: Arc<dyn OracleFactory> = Arc::new(CpuOracleFactory);

    if cli.print_providers {
        for provider in factory.providers() {
            println!("{}", serde_json::to_string(&provider)?);
        }
        return Ok(());
    }

    let settings = Settings::extract_from(settings_figment(&cli)?)?;

    if cli.print_config {
        println!("{}", serde_json::to_string_pretty(&settings)?);
        return Ok(());
    }

    if cli.print_num_files {
        println!("{}", FilesLayout::derive(&settings.post, &settings.init).num_files);
        return Ok(());
    }

    let node_id = cli.id.context("--id is required")?;
    let commitment_atx_id = cli
        .commitment_atx_id
        .context("--commitment-atx-id is required")?;

    let providers = if cli.provider.is_empty() {
        vec![settings.init.provider_id]
    } else {
        cli.provider.clone()
    };

    let config = InitializerConfig::builder()
        .post(settings.post)
        .init(settings.init)
        .node_id(node_id)
        .commitment_atx_id(commitment_atx_id)
        .oracle_factory(factory)
        .build()?;

    if cli.reset {
        let init = Initializer::new(config).await?;
        init.reset().await?;
        tracing::info!("Data directory reset");
        return Ok(());
    }

    let cancel = CancellationToken::new();
    spawn_ctrl_c(cancel.clone());

    let result = if providers.len() > 1 {
        MultiProviderInitializer::new(config, providers)
            .run(cancel)
            .await
    } else {
        match Initializer::new(config).await {
            Ok(init) => init.initialize(cancel).await.map(|()| init),
            Err(e) => Err(e),
        }
    };

    match result {
        Ok(init) => {
            tracing::info!(
                num_labels_written = init.num_labels_written(),
                nonce = ?init.nonce(),
                status = ?init.status(),
                "Initialization finished"
            );
            Ok(())
        }
        Err(e) if e.is_cancelled() => {
            tracing::info!("Initialization cancelled, run again with the same flags to resume");
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}
