// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Process logging setup.
//!
//! - Configuration loaded from:
//!   1. Environment variables (highest priority).
//!   2. Optional TOML file pointed to by the `POST_LOGGING_CONFIG_PATH` environment variable.
//!   3. `/etc/post-init/logging.toml`.
//!
//! Logging can take two forms: `READABLE` or `JSONL`. The default is `READABLE`. `JSONL`
//! can be enabled by setting the `POST_LOGGING_JSONL` environment variable to `1`.
//!
//! To use local timezone for logging timestamps, set the `POST_LOG_USE_LOCAL_TZ` environment variable to `1`.
//!
//! Filters can be configured using the `POST_LOG` environment variable or by setting the `log_filters`
//! key in the TOML configuration file. The default log level is `info`.
//!
//! Example:
//! ```toml
//! log_level = "warn"
//!
//! [log_filters]
//! "post_init::initializer" = "debug"
//! ```

use std::collections::HashMap;
use std::sync::Once;

use figment::{
    Figment,
    providers::{Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use tracing::level_filters::LevelFilter;
use tracing_subscriber::fmt::time::{FormatTime, LocalTime, UtcTime};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, Layer, Registry, filter::Directive, fmt};

/// ENV used to set the log level
const FILTER_ENV: &str = "POST_LOG";

/// Default log level
const DEFAULT_FILTER_LEVEL: &str = "info";

/// ENV used to set the path to the logging configuration file
const CONFIG_PATH_ENV: &str = "POST_LOGGING_CONFIG_PATH";

const JSONL_ENV: &str = "POST_LOGGING_JSONL";

const LOCAL_TZ_ENV: &str = "POST_LOG_USE_LOCAL_TZ";

/// Once instance to ensure the logger is only initialized once
static INIT: Once = Once::new();

#[derive(Serialize, Deserialize, Debug, PartialEq)]
struct LoggingConfig {
    log_level: String,
    log_filters: HashMap<String, String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            log_level: DEFAULT_FILTER_LEVEL.to_string(),
            log_filters: HashMap::new(),
        }
    }
}

/// Initialize the logger
pub fn init() {
    INIT.call_once(setup_logging);
}

fn setup_logging() {
    let filter = filters(load_config());
    let jsonl = env_is_truthy(JSONL_ENV);

    let layer = if env_is_truthy(LOCAL_TZ_ENV) {
        fmt_layer(LocalTime::rfc_3339(), jsonl, filter)
    } else {
        fmt_layer(UtcTime::rfc_3339(), jsonl, filter)
    };

    if let Err(e) = tracing_subscriber::registry().with(layer).try_init() {
        eprintln!("Failed to install the tracing subscriber: {e}");
    }
}

fn fmt_layer<T>(
    timer: T,
    jsonl: bool,
    filter: EnvFilter,
) -> Box<dyn Layer<Registry> + Send + Sync>
where
    T: FormatTime + Send + Sync + 'static,
{
    if jsonl {
        fmt::layer()
            .json()
            .with_current_span(true)
            .with_ansi(false)
            .with_timer(timer)
            .with_writer(std::io::stderr)
            .with_filter(filter)
            .boxed()
    } else {
        fmt::layer()
            .compact()
            .with_timer(timer)
            .with_writer(std::io::stderr)
            .with_filter(filter)
            .boxed()
    }
}

fn filters(config: LoggingConfig) -> EnvFilter {
    let default_directive = config.log_level.parse::<Directive>().unwrap_or_else(|e| {
        eprintln!("Invalid log level '{}': {e}", config.log_level);
        LevelFilter::INFO.into()
    });

    let mut filter_layer = EnvFilter::builder()
        .with_default_directive(default_directive)
        .with_env_var(FILTER_ENV)
        .from_env_lossy();

    // apply the log_filters from the config files
    for (module, level) in config.log_filters {
        match format!("{module}={level}").parse::<Directive>() {
            Ok(d) => {
                filter_layer = filter_layer.add_directive(d);
            }
            Err(e) => {
                eprintln!("Failed parsing filter '{level}' for module '{module}': {e}");
            }
        }
    }
    filter_layer
}

fn load_config() -> LoggingConfig {
    let config_path = std::env::var(CONFIG_PATH_ENV).unwrap_or_default();
    let figment = Figment::new()
        .merge(Serialized::defaults(LoggingConfig::default()))
        .merge(Toml::file("/etc/post-init/logging.toml"))
        .merge(Toml::file(config_path));

    figment.extract().unwrap_or_else(|e| {
        eprintln!("Invalid logging configuration, using defaults: {e}");
        LoggingConfig::default()
    })
}

fn env_is_truthy(name: &str) -> bool {
    matches!(
        std::env::var(name).as_deref().map(str::to_ascii_lowercase).as_deref(),
        Ok("1" | "true" | "on" | "yes")
    )
}
