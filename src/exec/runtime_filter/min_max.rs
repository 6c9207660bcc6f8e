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
//! Min/max range filter.

use bytes::{BufMut, BytesMut};

use super::codec::{get_u8, get_value, put_value};
use super::error::Result;
use super::value::{FilterValue, ValueKind};

/// Running `[min, max]` over inserted keys. Empty until the first insert.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MinMaxFilter {
    range: Option<(FilterValue, FilterValue)>,
}

impl MinMaxFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.range.is_none()
    }

    pub fn min(&self) -> Option<&FilterValue> {
        self.range.as_ref().map(|(min, _)| min)
    }

    pub fn max(&self) -> Option<&FilterValue> {
        self.range.as_ref().map(|(_, max)| max)
    }

    pub fn insert(&mut self, value: &FilterValue) {
        match &mut self.range {
            Some((min, max)) => {
                if value < min {
                    *min = value.clone();
                }
                if value > max {
                    *max = value.clone();
                }
            }
            None => self.range = Some((value.clone(), value.clone())),
        }
    }

    pub fn merge_from(&mut self, other: &MinMaxFilter) {
        if let Some((min, max)) = &other.range {
            self.insert(min);
            self.insert(max);
        }
    }

    pub fn contains(&self, value: &FilterValue) -> bool {
        match &self.range {
            Some((min, max)) => value >= min && value <= max,
            None => false,
        }
    }

    pub(crate) fn encode_into(&self, buf: &mut BytesMut) {
        match &self.range {
            Some((min, max)) => {
                buf.put_u8(1);
                put_value(buf, min);
                put_value(buf, max);
            }
            None => buf.put_u8(0),
        }
    }

    pub(crate) fn decode(buf: &mut &[u8], kind: Option<ValueKind>) -> Result<Self> {
        if get_u8(buf)? == 0 {
            return Ok(Self::default());
        }
        let min = get_value(buf, kind)?;
        let max = get_value(buf, kind)?;
        Ok(Self {
            range: Some((min, max)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn range_widens_and_merges() {
        let mut a = MinMaxFilter::new();
        assert!(!a.contains(&FilterValue::Int(0)));
        a.insert(&FilterValue::Int(10));
        a.insert(&FilterValue::Int(-3));
        let mut b = MinMaxFilter::new();
        b.insert(&FilterValue::Int(40));
        a.merge_from(&b);
        assert_eq!(a.min(), Some(&FilterValue::Int(-3)));
        assert_eq!(a.max(), Some(&FilterValue::Int(40)));
        assert!(a.contains(&FilterValue::Int(25)));
        assert!(!a.contains(&FilterValue::Int(41)));
    }

    #[test]
    fn merging_empty_keeps_range() {
        let mut a = MinMaxFilter::new();
        a.insert(&FilterValue::Utf8("m".to_string()));
        a.merge_from(&MinMaxFilter::new());
        assert!(a.contains(&FilterValue::Utf8("m".to_string())));
        assert!(!a.contains(&FilterValue::Utf8("z".to_string())));
    }
}
