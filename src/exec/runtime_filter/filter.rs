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
//! Accumulated runtime-filter state shared by producers, the merge worker, and probes.
//!
//! Responsibilities:
//! - Holds one filter body (in-list, min/max, bloom, or accept-all) plus null tracking.
//! - Implements insert, probe, and the commutative merge used across build instances.
//!
//! Key exported interfaces:
//! - Types: `RuntimeFilter`, `FilterBody`.

use super::bloom::BlockBloomFilter;
use super::desc::RuntimeFilterType;
use super::error::{Result, RuntimeFilterError};
use super::in_filter::InFilter;
use super::min_max::MinMaxFilter;
use super::value::{FilterValue, ValueKind};

#[derive(Clone, Debug, PartialEq)]
pub enum FilterBody {
    /// Disabled filter: every probe row passes.
    AcceptAll,
    In(InFilter),
    MinMax(MinMaxFilter),
    Bloom(BlockBloomFilter),
}

#[derive(Clone, Debug, PartialEq)]
pub struct RuntimeFilter {
    filter_type: RuntimeFilterType,
    has_null: bool,
    size_hint: u64,
    value_kind: Option<ValueKind>,
    body: FilterBody,
}

fn in_to_bloom(in_filter: &InFilter, size_hint: u64) -> BlockBloomFilter {
    let mut bloom = BlockBloomFilter::with_capacity(size_hint.max(in_filter.len() as u64));
    for value in in_filter.values() {
        bloom.insert(value);
    }
    bloom
}

impl RuntimeFilter {
    /// Empty filter sized for `size_hint` build rows.
    pub fn new(filter_type: RuntimeFilterType, size_hint: u64, max_in_conditions: usize) -> Self {
        let body = match filter_type {
            RuntimeFilterType::In | RuntimeFilterType::InOrBloom => {
                FilterBody::In(InFilter::new(max_in_conditions))
            }
            RuntimeFilterType::MinMax => FilterBody::MinMax(MinMaxFilter::new()),
            RuntimeFilterType::Bloom => FilterBody::Bloom(BlockBloomFilter::with_capacity(size_hint)),
            RuntimeFilterType::Bitmap => FilterBody::AcceptAll,
        };
        Self {
            filter_type,
            has_null: false,
            size_hint,
            value_kind: None,
            body,
        }
    }

    pub fn accept_all(filter_type: RuntimeFilterType) -> Self {
        Self {
            filter_type,
            has_null: false,
            size_hint: 0,
            value_kind: None,
            body: FilterBody::AcceptAll,
        }
    }

    pub(crate) fn from_parts(
        filter_type: RuntimeFilterType,
        has_null: bool,
        size_hint: u64,
        value_kind: Option<ValueKind>,
        body: FilterBody,
    ) -> Result<Self> {
        let body_fits = matches!(
            (filter_type, &body),
            (RuntimeFilterType::In, FilterBody::In(_))
                | (RuntimeFilterType::MinMax, FilterBody::MinMax(_))
                | (RuntimeFilterType::Bloom, FilterBody::Bloom(_))
                | (RuntimeFilterType::InOrBloom, FilterBody::In(_))
                | (RuntimeFilterType::InOrBloom, FilterBody::Bloom(_))
        );
        if !body_fits {
            return Err(RuntimeFilterError::Codec(format!(
                "{} runtime filter cannot carry this body",
                filter_type
            )));
        }
        Ok(Self {
            filter_type,
            has_null,
            size_hint,
            value_kind,
            body,
        })
    }

    pub fn filter_type(&self) -> RuntimeFilterType {
        self.filter_type
    }

    pub fn has_null(&self) -> bool {
        self.has_null
    }

    pub fn size_hint(&self) -> u64 {
        self.size_hint
    }

    pub fn value_kind(&self) -> Option<ValueKind> {
        self.value_kind
    }

    pub fn body(&self) -> &FilterBody {
        &self.body
    }

    pub fn is_disabled(&self) -> bool {
        matches!(self.body, FilterBody::AcceptAll)
    }

    pub fn estimated_bytes(&self) -> usize {
        match &self.body {
            FilterBody::AcceptAll => 0,
            FilterBody::In(in_filter) => in_filter.footprint(),
            FilterBody::MinMax(_) => 2 * std::mem::size_of::<FilterValue>(),
            FilterBody::Bloom(bloom) => bloom.byte_size(),
        }
    }

    pub(crate) fn disable(&mut self) {
        self.body = FilterBody::AcceptAll;
    }

    fn check_kind(&mut self, kind: ValueKind) -> Result<()> {
        match self.value_kind {
            None => {
                self.value_kind = Some(kind);
                Ok(())
            }
            Some(expected) if expected == kind => Ok(()),
            Some(expected) => Err(RuntimeFilterError::Config(format!(
                "runtime filter key type changed from {:?} to {:?}",
                expected, kind
            ))),
        }
    }

    fn on_in_overflow(&mut self) {
        let body = std::mem::replace(&mut self.body, FilterBody::AcceptAll);
        if self.filter_type == RuntimeFilterType::InOrBloom
            && let FilterBody::In(in_filter) = &body
        {
            self.body = FilterBody::Bloom(in_to_bloom(in_filter, self.size_hint));
        }
    }

    /// Record one build key; `None` marks a null key.
    pub fn insert(&mut self, value: Option<FilterValue>) -> Result<()> {
        let Some(value) = value else {
            self.has_null = true;
            return Ok(());
        };
        if self.is_disabled() {
            return Ok(());
        }
        self.check_kind(value.kind())?;
        let overflowed = match &mut self.body {
            FilterBody::AcceptAll => false,
            FilterBody::In(in_filter) => !in_filter.insert(value),
            FilterBody::MinMax(min_max) => {
                min_max.insert(&value);
                false
            }
            FilterBody::Bloom(bloom) => {
                bloom.insert(&value);
                false
            }
        };
        if overflowed {
            self.on_in_overflow();
        }
        Ok(())
    }

    /// Probe one key; `None` probes a null key. False means the row can be dropped.
    pub fn may_contain(&self, value: Option<&FilterValue>) -> bool {
        let Some(value) = value else {
            return self.is_disabled() || self.has_null;
        };
        match &self.body {
            FilterBody::AcceptAll => true,
            FilterBody::In(in_filter) => in_filter.contains(value),
            FilterBody::MinMax(min_max) => min_max.contains(value),
            FilterBody::Bloom(bloom) => bloom.may_contain(value),
        }
    }

    /// Union `other` into `self`. Order-insensitive and idempotent; a disabled input
    /// disables the result.
    pub fn merge_from(&mut self, filter_id: i32, other: &RuntimeFilter) -> Result<()> {
        if self.filter_type != other.filter_type {
            return Err(RuntimeFilterError::IncompatibleMerge {
                filter_id,
                local: self.filter_type,
                incoming: other.filter_type,
            });
        }
        if self.is_disabled() {
            return Ok(());
        }
        if other.is_disabled() {
            self.disable();
            return Ok(());
        }
        match (self.value_kind, other.value_kind) {
            (Some(local), Some(incoming)) if local != incoming => {
                return Err(RuntimeFilterError::Config(format!(
                    "runtime filter {} merges {:?} keys into {:?} keys",
                    filter_id, incoming, local
                )));
            }
            (None, incoming) => self.value_kind = incoming,
            _ => {}
        }
        self.has_null |= other.has_null;
        self.size_hint = self.size_hint.max(other.size_hint);

        let body = std::mem::replace(&mut self.body, FilterBody::AcceptAll);
        self.body = match (body, &other.body) {
            (FilterBody::In(mut local), FilterBody::In(incoming)) => {
                if local.merge_from(incoming) {
                    FilterBody::In(local)
                } else if self.filter_type == RuntimeFilterType::InOrBloom {
                    FilterBody::Bloom(in_to_bloom(&local, self.size_hint))
                } else {
                    FilterBody::AcceptAll
                }
            }
            (FilterBody::MinMax(mut local), FilterBody::MinMax(incoming)) => {
                local.merge_from(incoming);
                FilterBody::MinMax(local)
            }
            (FilterBody::Bloom(mut local), FilterBody::Bloom(incoming)) => {
                if let Err(e) = local.merge_from(incoming) {
                    self.body = FilterBody::Bloom(local);
                    return Err(e);
                }
                FilterBody::Bloom(local)
            }
            (FilterBody::Bloom(mut local), FilterBody::In(incoming)) => {
                for value in incoming.values() {
                    local.insert(value);
                }
                FilterBody::Bloom(local)
            }
            (FilterBody::In(local), FilterBody::Bloom(incoming)) => {
                let mut bloom = incoming.clone();
                for value in local.values() {
                    bloom.insert(value);
                }
                FilterBody::Bloom(bloom)
            }
            (body, _) => {
                self.body = body;
                return Err(RuntimeFilterError::Internal(format!(
                    "runtime filter {} body shapes do not merge",
                    filter_id
                )));
            }
        };
        Ok(())
    }
}
