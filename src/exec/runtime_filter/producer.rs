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
//! Per-descriptor runtime-filter producers.
//!
//! Responsibilities:
//! - Accumulates build keys for one descriptor once it has been sized.
//! - Finalizes into an immutable payload exactly once; disabled producers finalize to
//!   the accept-all payload.
//!
//! Key exported interfaces:
//! - Traits: `FilterProducer`.
//! - Types: `RuntimeFilterProducer`, `ProducerState`, `DisableReason`.

use std::fmt;

use bytes::Bytes;

use crate::exec::chunk::Chunk;
use crate::novarocks_logging::debug;
use crate::runtime::size_negotiator::AbandonReason;

use super::bloom::BlockBloomFilter;
use super::codec::{encode_disabled, encode_filter};
use super::desc::{RuntimeFilterDesc, RuntimeFilterType};
use super::error::{Result, RuntimeFilterError};
use super::filter::RuntimeFilter;
use super::value::{for_each_value, value_kind};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProducerState {
    Accumulating,
    Built,
    Published,
    Disabled,
}

/// Why a producer fell back to the accept-all filter.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DisableReason {
    Skipped,
    SizeAbandoned(AbandonReason),
    ConfigRejected,
    InListOverflow,
    MergedDisabled,
    SharedFilterMissing,
    Terminated,
}

impl fmt::Display for DisableReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DisableReason::Skipped => f.write_str("skipped"),
            DisableReason::SizeAbandoned(reason) => write!(f, "size abandoned ({})", reason),
            DisableReason::ConfigRejected => f.write_str("config rejected"),
            DisableReason::InListOverflow => f.write_str("in-list overflow"),
            DisableReason::MergedDisabled => f.write_str("merged a disabled filter"),
            DisableReason::SharedFilterMissing => f.write_str("shared filter missing"),
            DisableReason::Terminated => f.write_str("terminated"),
        }
    }
}

/// Capability surface every filter strategy exposes to the producer helper.
pub trait FilterProducer: Send {
    fn filter_id(&self) -> i32;

    fn filter_type(&self) -> RuntimeFilterType;

    fn state(&self) -> ProducerState;

    /// Size the filter for `size_hint` build rows. Must precede `insert`.
    fn configure(&mut self, size_hint: i64) -> Result<()>;

    /// Accumulate rows `start..` of the key column.
    fn insert(&mut self, chunk: &Chunk, start: usize) -> Result<()>;

    /// Union another producer of the same descriptor into this one.
    fn merge(&mut self, other: &dyn FilterProducer) -> Result<()>;

    /// Produce the immutable payload. Idempotent.
    fn finalize(&mut self) -> Result<Bytes>;

    /// Switch to the accept-all form. Returns false if the producer was already
    /// disabled or already built.
    fn disable(&mut self, reason: DisableReason) -> bool;

    fn mark_published(&mut self);

    fn is_published(&self) -> bool;

    fn inserted_rows(&self) -> u64;

    fn disable_reason(&self) -> Option<DisableReason>;

    /// Accumulated filter; `None` before `configure` or after `disable`.
    fn accumulated(&self) -> Option<&RuntimeFilter>;
}

#[derive(Clone, Debug)]
pub struct RuntimeFilterProducer {
    desc: RuntimeFilterDesc,
    max_in_conditions: usize,
    max_filter_bytes: u64,
    state: ProducerState,
    filter: Option<RuntimeFilter>,
    disable_reason: Option<DisableReason>,
    inserted_rows: u64,
    published: bool,
    payload: Option<Bytes>,
}

impl RuntimeFilterProducer {
    pub fn new(
        desc: RuntimeFilterDesc,
        max_in_conditions: usize,
        max_filter_bytes: u64,
    ) -> Result<Self> {
        if !desc.filter_type.is_supported() {
            return Err(RuntimeFilterError::Config(format!(
                "runtime filter {} has unsupported type {}",
                desc.filter_id, desc.filter_type
            )));
        }
        Ok(Self {
            desc,
            max_in_conditions,
            max_filter_bytes,
            state: ProducerState::Accumulating,
            filter: None,
            disable_reason: None,
            inserted_rows: 0,
            published: false,
            payload: None,
        })
    }

    pub fn desc(&self) -> &RuntimeFilterDesc {
        &self.desc
    }

    fn estimated_bytes_for(&self, size_hint: u64) -> u64 {
        if self.desc.filter_type.uses_bloom() {
            BlockBloomFilter::estimated_bytes(size_hint)
        } else {
            0
        }
    }

    fn require_accumulating(&self, op: &str) -> Result<()> {
        if self.state != ProducerState::Accumulating {
            return Err(RuntimeFilterError::invalid_state(format!(
                "runtime filter {} {} in state {:?}",
                self.desc.filter_id, op, self.state
            )));
        }
        Ok(())
    }

    fn disable_on_overflow(&mut self) {
        if self.filter.as_ref().is_some_and(RuntimeFilter::is_disabled) {
            debug!(
                "runtime filter disabled: filter_id={} reason={}",
                self.desc.filter_id,
                DisableReason::InListOverflow
            );
            self.disable(DisableReason::InListOverflow);
        }
    }
}

impl FilterProducer for RuntimeFilterProducer {
    fn filter_id(&self) -> i32 {
        self.desc.filter_id
    }

    fn filter_type(&self) -> RuntimeFilterType {
        self.desc.filter_type
    }

    fn state(&self) -> ProducerState {
        self.state
    }

    fn configure(&mut self, size_hint: i64) -> Result<()> {
        if self.state == ProducerState::Disabled {
            return Ok(());
        }
        self.require_accumulating("configure")?;
        if self.filter.is_some() {
            return Err(RuntimeFilterError::invalid_state(format!(
                "runtime filter {} configured twice",
                self.desc.filter_id
            )));
        }
        let size_hint = u64::try_from(size_hint).map_err(|_| {
            RuntimeFilterError::Config(format!(
                "runtime filter {} negative size hint {}",
                self.desc.filter_id, size_hint
            ))
        })?;
        let estimated = self.estimated_bytes_for(size_hint);
        if estimated > self.max_filter_bytes {
            return Err(RuntimeFilterError::Config(format!(
                "runtime filter {} needs {} bytes for {} rows, limit {}",
                self.desc.filter_id, estimated, size_hint, self.max_filter_bytes
            )));
        }
        self.filter = Some(RuntimeFilter::new(
            self.desc.filter_type,
            size_hint,
            self.max_in_conditions,
        ));
        Ok(())
    }

    fn insert(&mut self, chunk: &Chunk, start: usize) -> Result<()> {
        if self.state == ProducerState::Disabled {
            return Ok(());
        }
        self.require_accumulating("insert")?;
        let null_aware = self.desc.null_aware;
        let filter_id = self.desc.filter_id;
        let Some(filter) = self.filter.as_mut() else {
            return Err(RuntimeFilterError::invalid_state(format!(
                "runtime filter {} insert before configure",
                filter_id
            )));
        };
        let column = chunk
            .column(self.desc.build_expr_order)
            .map_err(RuntimeFilterError::Config)?;
        value_kind(column.data_type())?;

        let mut result = Ok(());
        for_each_value(column.as_ref(), start, |value| {
            if result.is_err() || (value.is_none() && !null_aware) {
                return;
            }
            result = filter.insert(value);
        })?;
        result?;
        self.inserted_rows += chunk.len().saturating_sub(start) as u64;
        self.disable_on_overflow();
        Ok(())
    }

    fn merge(&mut self, other: &dyn FilterProducer) -> Result<()> {
        if self.state == ProducerState::Disabled {
            return Ok(());
        }
        if other.filter_type() != self.desc.filter_type {
            return Err(RuntimeFilterError::IncompatibleMerge {
                filter_id: self.desc.filter_id,
                local: self.desc.filter_type,
                incoming: other.filter_type(),
            });
        }
        self.require_accumulating("merge")?;
        if other.state() == ProducerState::Disabled {
            self.disable(DisableReason::MergedDisabled);
            return Ok(());
        }
        let Some(incoming) = other.accumulated() else {
            return Err(RuntimeFilterError::invalid_state(format!(
                "runtime filter {} merge from unconfigured producer",
                self.desc.filter_id
            )));
        };
        match self.filter.as_mut() {
            Some(local) => local.merge_from(self.desc.filter_id, incoming)?,
            None => self.filter = Some(incoming.clone()),
        }
        self.disable_on_overflow();
        Ok(())
    }

    fn finalize(&mut self) -> Result<Bytes> {
        if let Some(payload) = &self.payload {
            return Ok(payload.clone());
        }
        let payload = match self.state {
            ProducerState::Disabled => encode_disabled(self.desc.filter_type),
            ProducerState::Accumulating => {
                let Some(filter) = self.filter.as_ref() else {
                    return Err(RuntimeFilterError::invalid_state(format!(
                        "runtime filter {} finalize before configure",
                        self.desc.filter_id
                    )));
                };
                let payload = encode_filter(filter);
                self.state = ProducerState::Built;
                payload
            }
            ProducerState::Built | ProducerState::Published => {
                return Err(RuntimeFilterError::Internal(format!(
                    "runtime filter {} built without payload",
                    self.desc.filter_id
                )));
            }
        };
        self.payload = Some(payload.clone());
        Ok(payload)
    }

    fn disable(&mut self, reason: DisableReason) -> bool {
        if self.state != ProducerState::Accumulating {
            return false;
        }
        self.state = ProducerState::Disabled;
        self.disable_reason = Some(reason);
        self.filter = None;
        true
    }

    fn mark_published(&mut self) {
        self.published = true;
        if self.state == ProducerState::Built {
            self.state = ProducerState::Published;
        }
    }

    fn is_published(&self) -> bool {
        self.published
    }

    fn inserted_rows(&self) -> u64 {
        self.inserted_rows
    }

    fn disable_reason(&self) -> Option<DisableReason> {
        self.disable_reason
    }

    fn accumulated(&self) -> Option<&RuntimeFilter> {
        self.filter.as_ref()
    }
}
