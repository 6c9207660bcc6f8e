// Licensed to the Apache Software Foundation (ASF) under one
// or more contributor license agreements.  See the NOTICE file
// distributed with this work for additional information
// regarding copyright ownership.  The ASF licenses this file
// to you under the Apache License, Version 2.0 (the
// "License"); you may not use this file except in compliance
// with the License.  You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing,
// software distributed under the License is distributed on an
// "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied.  See the License for the
// specific language governing permissions and limitations
// under the License.
use anyhow::{Context, Result, anyhow};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use crate::exec::runtime_filter::MAX_IN_CONDITIONS;

static CONFIG: OnceLock<NovaRocksRfConfig> = OnceLock::new();

fn default_log_level() -> String {
    "info".to_string()
}

pub fn init_from_path(path: impl AsRef<Path>) -> Result<&'static NovaRocksRfConfig> {
    if let Some(cfg) = CONFIG.get() {
        return Ok(cfg);
    }
    let path = path.as_ref().to_path_buf();
    let cfg = NovaRocksRfConfig::load_from_file(&path)?;
    let _ = CONFIG.set(cfg);
    CONFIG
        .get()
        .ok_or_else(|| anyhow!("config not initialized after set"))
}

pub fn init_from_env_or_default() -> Result<&'static NovaRocksRfConfig> {
    if let Some(cfg) = CONFIG.get() {
        return Ok(cfg);
    }
    let path = config_path_from_env_or_default()?;
    init_from_path(path)
}

pub fn config() -> Result<&'static NovaRocksRfConfig> {
    init_from_env_or_default()
}

fn config_path_from_env_or_default() -> Result<PathBuf> {
    if let Ok(p) = std::env::var("NOVAROCKS_RF_CONFIG") {
        if !p.trim().is_empty() {
            return Ok(PathBuf::from(p));
        }
    }

    let candidates = [PathBuf::from("novarocks_rf.toml")];
    for p in candidates {
        if p.exists() {
            return Ok(p);
        }
    }

    Err(anyhow!(
        "missing config file: set $NOVAROCKS_RF_CONFIG or create ./novarocks_rf.toml"
    ))
}

#[derive(Clone, Debug, Deserialize)]
pub struct NovaRocksRfConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Optional full tracing EnvFilter expression.
    /// If set, this takes precedence over `log_level`.
    /// Example: "novarocks_rf=debug"
    #[serde(default)]
    pub log_filter: Option<String>,

    #[serde(default)]
    pub runtime_filter: RuntimeFilterConfig,

    #[serde(default)]
    pub simulator: SimulatorConfig,
}

impl NovaRocksRfConfig {
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let s = std::fs::read_to_string(path)
            .with_context(|| format!("read config file: {}", path.display()))?;
        let cfg: NovaRocksRfConfig =
            toml::from_str(&s).with_context(|| format!("parse toml: {}", path.display()))?;
        cfg.runtime_filter.validate()?;
        Ok(cfg)
    }

    pub fn log_filter_or_level(&self) -> &str {
        self.log_filter
            .as_deref()
            .filter(|f| !f.trim().is_empty())
            .unwrap_or(&self.log_level)
    }
}

impl Default for NovaRocksRfConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_filter: None,
            runtime_filter: RuntimeFilterConfig::default(),
            simulator: SimulatorConfig::default(),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct RuntimeFilterConfig {
    /// Ceiling on the negotiated build row count. A larger merged estimate abandons filtering.
    #[serde(default = "default_max_filter_rows")]
    pub max_filter_rows: u64,
    /// Per-producer memory ceiling checked when a producer is configured.
    #[serde(default = "default_max_filter_bytes")]
    pub max_filter_bytes: u64,
    #[serde(default = "default_max_in_conditions")]
    pub max_in_conditions: usize,
    #[serde(default = "default_sync_size_timeout_ms")]
    pub sync_size_timeout_ms: u64,
    #[serde(default = "default_bloom_filter_default_size")]
    pub bloom_filter_default_size: u64,
    #[serde(default = "default_round_gc_ms")]
    pub round_gc_ms: u64,
}

fn default_max_filter_rows() -> u64 {
    64_000_000
}

fn default_max_filter_bytes() -> u64 {
    64 * 1024 * 1024
}

fn default_max_in_conditions() -> usize {
    1024
}

fn default_sync_size_timeout_ms() -> u64 {
    2000
}

fn default_bloom_filter_default_size() -> u64 {
    1_048_576
}

fn default_round_gc_ms() -> u64 {
    60_000
}

impl RuntimeFilterConfig {
    fn validate(&self) -> Result<()> {
        if self.max_filter_rows == 0 {
            return Err(anyhow!("runtime_filter.max_filter_rows must be positive"));
        }
        if self.max_filter_bytes == 0 {
            return Err(anyhow!("runtime_filter.max_filter_bytes must be positive"));
        }
        if self.max_in_conditions > MAX_IN_CONDITIONS {
            return Err(anyhow!(
                "runtime_filter.max_in_conditions must not exceed {}",
                MAX_IN_CONDITIONS
            ));
        }
        if self.round_gc_ms <= self.sync_size_timeout_ms {
            return Err(anyhow!(
                "runtime_filter.round_gc_ms ({}) must exceed sync_size_timeout_ms ({})",
                self.round_gc_ms,
                self.sync_size_timeout_ms
            ));
        }
        Ok(())
    }
}

impl Default for RuntimeFilterConfig {
    fn default() -> Self {
        Self {
            max_filter_rows: default_max_filter_rows(),
            max_filter_bytes: default_max_filter_bytes(),
            max_in_conditions: default_max_in_conditions(),
            sync_size_timeout_ms: default_sync_size_timeout_ms(),
            bloom_filter_default_size: default_bloom_filter_default_size(),
            round_gc_ms: default_round_gc_ms(),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct SimulatorConfig {
    #[serde(default = "default_sim_instances")]
    pub instances: u32,
    #[serde(default = "default_sim_rows_per_instance")]
    pub rows_per_instance: usize,
    #[serde(default)]
    pub broadcast: bool,
}

fn default_sim_instances() -> u32 {
    4
}

fn default_sim_rows_per_instance() -> usize {
    4096
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            instances: default_sim_instances(),
            rows_per_instance: default_sim_rows_per_instance(),
            broadcast: false,
        }
    }
}
