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
//! Runtime-filter error taxonomy.
//!
//! `Config` and `SinkDelivery` are recoverable at the helper level: the first
//! disables one producer, the second is logged and swallowed. The remaining
//! variants abort the build pipeline.

use thiserror::Error;

use super::desc::RuntimeFilterType;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RuntimeFilterError {
    #[error("runtime filter config error: {0}")]
    Config(String),
    #[error(
        "incompatible runtime filter merge: filter_id={filter_id} local={local:?} incoming={incoming:?}"
    )]
    IncompatibleMerge {
        filter_id: i32,
        local: RuntimeFilterType,
        incoming: RuntimeFilterType,
    },
    #[error("runtime filter invalid state: {0}")]
    InvalidState(String),
    #[error("runtime filter delivery failed: filter_id={filter_id} {message}")]
    SinkDelivery { filter_id: i32, message: String },
    #[error("runtime filter codec error: {0}")]
    Codec(String),
    #[error("runtime filter internal error: {0}")]
    Internal(String),
}

impl RuntimeFilterError {
    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Self::InvalidState(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Whether the producer helper may absorb this error without failing the query.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Config(_) | Self::SinkDelivery { .. })
    }
}

pub type Result<T> = std::result::Result<T, RuntimeFilterError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recoverable_variants() {
        assert!(RuntimeFilterError::config("too large").is_recoverable());
        assert!(
            RuntimeFilterError::SinkDelivery {
                filter_id: 1,
                message: "connection refused".to_string(),
            }
            .is_recoverable()
        );
        assert!(!RuntimeFilterError::invalid_state("publish before build").is_recoverable());
        let err = RuntimeFilterError::IncompatibleMerge {
            filter_id: 3,
            local: RuntimeFilterType::Bloom,
            incoming: RuntimeFilterType::In,
        };
        assert!(!err.is_recoverable());
        assert!(err.to_string().contains("filter_id=3"));
    }
}
