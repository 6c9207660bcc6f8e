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
//! Exact in-list filter.
//!
//! Responsibilities:
//! - Collects distinct build keys up to a configured capacity.
//! - Reports overflow so the owner can degrade to accept-all or to a bloom filter.
//!
//! Key exported interfaces:
//! - Types: `InFilter`.

use bytes::{BufMut, BytesMut};
use hashbrown::HashSet;

use super::codec::{get_u32_le, get_value, put_value};
use super::error::{Result, RuntimeFilterError};
use super::value::{FilterValue, ValueKind};

/// Largest condition cap whose value count, including the one that overflows, still
/// fits the payload's u32 length fields.
pub const MAX_IN_CONDITIONS: usize = u32::MAX as usize - 1;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InFilter {
    values: HashSet<FilterValue>,
    max_conditions: usize,
}

impl InFilter {
    pub fn new(max_conditions: usize) -> Self {
        Self {
            values: HashSet::new(),
            max_conditions: max_conditions.min(MAX_IN_CONDITIONS),
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn max_conditions(&self) -> usize {
        self.max_conditions
    }

    pub fn values(&self) -> impl Iterator<Item = &FilterValue> {
        self.values.iter()
    }

    /// Returns false once the distinct count exceeds `max_conditions`.
    pub fn insert(&mut self, value: FilterValue) -> bool {
        self.values.insert(value);
        self.values.len() <= self.max_conditions
    }

    /// Union `other` into `self`; returns false on overflow.
    pub fn merge_from(&mut self, other: &InFilter) -> bool {
        for value in &other.values {
            if !self.values.contains(value) {
                self.values.insert(value.clone());
            }
        }
        self.values.len() <= self.max_conditions
    }

    pub fn contains(&self, value: &FilterValue) -> bool {
        self.values.contains(value)
    }

    pub(crate) fn footprint(&self) -> usize {
        self.values.iter().map(FilterValue::footprint).sum()
    }

    pub(crate) fn encode_into(&self, buf: &mut BytesMut) -> Result<()> {
        let max_conditions = u32::try_from(self.max_conditions).map_err(|_| {
            RuntimeFilterError::Codec(format!(
                "in filter capacity {} does not fit the payload",
                self.max_conditions
            ))
        })?;
        let count = u32::try_from(self.values.len()).map_err(|_| {
            RuntimeFilterError::Codec(format!(
                "in filter holds {} values, more than the payload can carry",
                self.values.len()
            ))
        })?;
        buf.put_u32_le(max_conditions);
        buf.put_u32_le(count);
        // Sorted so equal filters encode to equal bytes.
        let mut sorted: Vec<&FilterValue> = self.values.iter().collect();
        sorted.sort();
        for value in sorted {
            put_value(buf, value);
        }
        Ok(())
    }

    pub(crate) fn decode(buf: &mut &[u8], kind: Option<ValueKind>) -> Result<Self> {
        let max_conditions = get_u32_le(buf)? as usize;
        let count = get_u32_le(buf)? as usize;
        if max_conditions > MAX_IN_CONDITIONS {
            return Err(RuntimeFilterError::Codec(format!(
                "in filter capacity {} exceeds {}",
                max_conditions, MAX_IN_CONDITIONS
            )));
        }
        if count > max_conditions {
            return Err(RuntimeFilterError::Codec(format!(
                "in filter holds {} values above its capacity {}",
                count, max_conditions
            )));
        }
        let mut values = HashSet::with_capacity(count.min(buf.len()));
        for _ in 0..count {
            values.insert(get_value(buf, kind)?);
        }
        Ok(Self {
            values,
            max_conditions,
        })
    }
}
