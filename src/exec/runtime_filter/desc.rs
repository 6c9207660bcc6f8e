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
//! Runtime-filter descriptors.
//!
//! Responsibilities:
//! - Describes one filter a join build side must produce: its kind, key column, sizing
//!   policy, and consumer fan-out.
//!
//! Key exported interfaces:
//! - Types: `RuntimeFilterDesc`, `RuntimeFilterType`, `FilterTarget`.

use std::fmt;

use super::error::{Result, RuntimeFilterError};

/// Filter kind requested by the plan.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RuntimeFilterType {
    In,
    MinMax,
    Bloom,
    InOrBloom,
    /// Planned by the frontend but not produced by hash join build sides.
    Bitmap,
}

impl RuntimeFilterType {
    pub fn name(self) -> &'static str {
        match self {
            RuntimeFilterType::In => "IN",
            RuntimeFilterType::MinMax => "MIN_MAX",
            RuntimeFilterType::Bloom => "BLOOM",
            RuntimeFilterType::InOrBloom => "IN_OR_BLOOM",
            RuntimeFilterType::Bitmap => "BITMAP",
        }
    }

    pub fn is_supported(self) -> bool {
        !matches!(self, RuntimeFilterType::Bitmap)
    }

    /// Kinds whose memory footprint depends on the build row count.
    pub fn uses_bloom(self) -> bool {
        matches!(self, RuntimeFilterType::Bloom | RuntimeFilterType::InOrBloom)
    }

    pub(crate) fn as_u8(self) -> u8 {
        match self {
            RuntimeFilterType::In => 0,
            RuntimeFilterType::MinMax => 1,
            RuntimeFilterType::Bloom => 2,
            RuntimeFilterType::InOrBloom => 3,
            RuntimeFilterType::Bitmap => 4,
        }
    }

    pub(crate) fn from_u8(v: u8) -> Result<Self> {
        match v {
            0 => Ok(RuntimeFilterType::In),
            1 => Ok(RuntimeFilterType::MinMax),
            2 => Ok(RuntimeFilterType::Bloom),
            3 => Ok(RuntimeFilterType::InOrBloom),
            4 => Ok(RuntimeFilterType::Bitmap),
            other => Err(RuntimeFilterError::Codec(format!(
                "unknown runtime filter type tag {}",
                other
            ))),
        }
    }
}

impl fmt::Display for RuntimeFilterType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Remote consumer address a published filter is forwarded to.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FilterTarget {
    pub host: String,
    pub port: u16,
}

impl FilterTarget {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for FilterTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RuntimeFilterDesc {
    pub filter_id: i32,
    /// Index of the build key column in chunks handed to the producer.
    pub build_expr_order: usize,
    pub filter_type: RuntimeFilterType,
    /// Size the bloom part from the globally negotiated build row count.
    pub build_bf_by_runtime_size: bool,
    pub has_remote_targets: bool,
    pub targets: Vec<FilterTarget>,
    /// Record nulls as `has_null` so null-safe probes keep null rows.
    pub null_aware: bool,
}

impl RuntimeFilterDesc {
    pub fn new(filter_id: i32, build_expr_order: usize, filter_type: RuntimeFilterType) -> Self {
        Self {
            filter_id,
            build_expr_order,
            filter_type,
            build_bf_by_runtime_size: filter_type.uses_bloom(),
            has_remote_targets: false,
            targets: Vec::new(),
            null_aware: false,
        }
    }

    pub fn with_runtime_size(mut self, enabled: bool) -> Self {
        self.build_bf_by_runtime_size = enabled;
        self
    }

    pub fn with_targets(mut self, targets: Vec<FilterTarget>) -> Self {
        self.has_remote_targets = !targets.is_empty();
        self.targets = targets;
        self
    }

    pub fn with_null_aware(mut self, null_aware: bool) -> Self {
        self.null_aware = null_aware;
        self
    }

    /// Whether this filter needs the cross-instance size round before it can be sized.
    pub fn needs_sync_size(&self) -> bool {
        self.build_bf_by_runtime_size && self.filter_type.uses_bloom()
    }
}
