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
//! Build-key values seen by runtime-filter producers.
//!
//! Responsibilities:
//! - Extracts typed key values from Arrow build columns.
//! - Defines hashing and ordering shared by the bloom, in-list, and min/max filters.
//!
//! Key exported interfaces:
//! - Types: `FilterValue`, `ValueKind`.
//! - Functions: `value_kind`, `for_each_value`.

use std::cmp::Ordering;
use std::hash::{Hash, Hasher};

use arrow::array::{Array, ArrowPrimitiveType, AsArray};
use arrow::datatypes::{
    DataType, Date32Type, Date64Type, Float32Type, Float64Type, Int8Type, Int16Type, Int32Type,
    Int64Type, TimeUnit, TimestampMicrosecondType, TimestampMillisecondType,
    TimestampNanosecondType, TimestampSecondType, UInt8Type, UInt16Type, UInt32Type,
};
use twox_hash::XxHash64;

use super::error::{Result, RuntimeFilterError};

const FILTER_HASH_SEED: u64 = 0x811C9DC5;

/// Value family a producer's key column belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ValueKind {
    Bool,
    Int,
    Float,
    Utf8,
}

impl ValueKind {
    pub(crate) fn as_u8(self) -> u8 {
        match self {
            ValueKind::Bool => 0,
            ValueKind::Int => 1,
            ValueKind::Float => 2,
            ValueKind::Utf8 => 3,
        }
    }

    pub(crate) fn from_u8(v: u8) -> Result<Self> {
        match v {
            0 => Ok(ValueKind::Bool),
            1 => Ok(ValueKind::Int),
            2 => Ok(ValueKind::Float),
            3 => Ok(ValueKind::Utf8),
            other => Err(RuntimeFilterError::Codec(format!(
                "unknown filter value kind {}",
                other
            ))),
        }
    }
}

/// One non-null build key.
///
/// Integer-like columns (including dates and timestamps) widen to `i64`. Floats
/// compare and hash on a canonical bit pattern so `-0.0 == 0.0` and all NaNs
/// collapse into one value.
#[derive(Clone, Debug)]
pub enum FilterValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Utf8(String),
}

fn canonical_f64(v: f64) -> f64 {
    if v == 0.0 {
        0.0
    } else if v.is_nan() {
        f64::NAN
    } else {
        v
    }
}

impl FilterValue {
    pub fn kind(&self) -> ValueKind {
        match self {
            FilterValue::Bool(_) => ValueKind::Bool,
            FilterValue::Int(_) => ValueKind::Int,
            FilterValue::Float(_) => ValueKind::Float,
            FilterValue::Utf8(_) => ValueKind::Utf8,
        }
    }

    /// xxHash64 over the canonical little-endian encoding of the value.
    pub fn hash64(&self) -> u64 {
        match self {
            FilterValue::Bool(v) => XxHash64::oneshot(FILTER_HASH_SEED, &[*v as u8]),
            FilterValue::Int(v) => XxHash64::oneshot(FILTER_HASH_SEED, &v.to_le_bytes()),
            FilterValue::Float(v) => {
                XxHash64::oneshot(FILTER_HASH_SEED, &canonical_f64(*v).to_bits().to_le_bytes())
            }
            FilterValue::Utf8(v) => XxHash64::oneshot(FILTER_HASH_SEED, v.as_bytes()),
        }
    }

    /// Rough heap footprint used for memory accounting.
    pub(crate) fn footprint(&self) -> usize {
        match self {
            FilterValue::Utf8(v) => std::mem::size_of::<Self>() + v.len(),
            _ => std::mem::size_of::<Self>(),
        }
    }
}

impl PartialEq for FilterValue {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for FilterValue {}

impl PartialOrd for FilterValue {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for FilterValue {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (FilterValue::Bool(a), FilterValue::Bool(b)) => a.cmp(b),
            (FilterValue::Int(a), FilterValue::Int(b)) => a.cmp(b),
            (FilterValue::Float(a), FilterValue::Float(b)) => {
                canonical_f64(*a).total_cmp(&canonical_f64(*b))
            }
            (FilterValue::Utf8(a), FilterValue::Utf8(b)) => a.cmp(b),
            _ => self.kind().as_u8().cmp(&other.kind().as_u8()),
        }
    }
}

impl Hash for FilterValue {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.kind().as_u8().hash(state);
        match self {
            FilterValue::Bool(v) => v.hash(state),
            FilterValue::Int(v) => v.hash(state),
            FilterValue::Float(v) => canonical_f64(*v).to_bits().hash(state),
            FilterValue::Utf8(v) => v.hash(state),
        }
    }
}

/// Map an Arrow build column type to the value family it produces.
pub fn value_kind(data_type: &DataType) -> Result<ValueKind> {
    match data_type {
        DataType::Boolean => Ok(ValueKind::Bool),
        DataType::Int8
        | DataType::Int16
        | DataType::Int32
        | DataType::Int64
        | DataType::UInt8
        | DataType::UInt16
        | DataType::UInt32
        | DataType::Date32
        | DataType::Date64
        | DataType::Timestamp(_, _) => Ok(ValueKind::Int),
        DataType::Float32 | DataType::Float64 => Ok(ValueKind::Float),
        DataType::Utf8 | DataType::LargeUtf8 => Ok(ValueKind::Utf8),
        other => Err(RuntimeFilterError::Config(format!(
            "unsupported runtime filter build type: {:?}",
            other
        ))),
    }
}

fn downcast_error(data_type: &DataType) -> RuntimeFilterError {
    RuntimeFilterError::Internal(format!("array downcast failed for {:?}", data_type))
}

fn visit_int<T>(
    array: &dyn Array,
    start: usize,
    f: &mut dyn FnMut(Option<FilterValue>),
) -> Result<()>
where
    T: ArrowPrimitiveType,
    T::Native: Into<i64>,
{
    let values = array
        .as_primitive_opt::<T>()
        .ok_or_else(|| downcast_error(array.data_type()))?;
    for row in start..values.len() {
        if values.is_null(row) {
            f(None);
        } else {
            f(Some(FilterValue::Int(values.value(row).into())));
        }
    }
    Ok(())
}

fn visit_float<T>(
    array: &dyn Array,
    start: usize,
    f: &mut dyn FnMut(Option<FilterValue>),
) -> Result<()>
where
    T: ArrowPrimitiveType,
    T::Native: Into<f64>,
{
    let values = array
        .as_primitive_opt::<T>()
        .ok_or_else(|| downcast_error(array.data_type()))?;
    for row in start..values.len() {
        if values.is_null(row) {
            f(None);
        } else {
            f(Some(FilterValue::Float(values.value(row).into())));
        }
    }
    Ok(())
}

/// Visit rows `start..` of `array`, passing `None` for nulls.
pub fn for_each_value(
    array: &dyn Array,
    start: usize,
    mut f: impl FnMut(Option<FilterValue>),
) -> Result<()> {
    let f: &mut dyn FnMut(Option<FilterValue>) = &mut f;
    let data_type = array.data_type();
    match data_type {
        DataType::Boolean => {
            let values = array
                .as_boolean_opt()
                .ok_or_else(|| downcast_error(data_type))?;
            for row in start..values.len() {
                if values.is_null(row) {
                    f(None);
                } else {
                    f(Some(FilterValue::Bool(values.value(row))));
                }
            }
            Ok(())
        }
        DataType::Int8 => visit_int::<Int8Type>(array, start, f),
        DataType::Int16 => visit_int::<Int16Type>(array, start, f),
        DataType::Int32 => visit_int::<Int32Type>(array, start, f),
        DataType::Int64 => visit_int::<Int64Type>(array, start, f),
        DataType::UInt8 => visit_int::<UInt8Type>(array, start, f),
        DataType::UInt16 => visit_int::<UInt16Type>(array, start, f),
        DataType::UInt32 => visit_int::<UInt32Type>(array, start, f),
        DataType::Date32 => visit_int::<Date32Type>(array, start, f),
        DataType::Date64 => visit_int::<Date64Type>(array, start, f),
        DataType::Timestamp(TimeUnit::Second, _) => {
            visit_int::<TimestampSecondType>(array, start, f)
        }
        DataType::Timestamp(TimeUnit::Millisecond, _) => {
            visit_int::<TimestampMillisecondType>(array, start, f)
        }
        DataType::Timestamp(TimeUnit::Microsecond, _) => {
            visit_int::<TimestampMicrosecondType>(array, start, f)
        }
        DataType::Timestamp(TimeUnit::Nanosecond, _) => {
            visit_int::<TimestampNanosecondType>(array, start, f)
        }
        DataType::Float32 => visit_float::<Float32Type>(array, start, f),
        DataType::Float64 => visit_float::<Float64Type>(array, start, f),
        DataType::Utf8 => {
            let values = array
                .as_string_opt::<i32>()
                .ok_or_else(|| downcast_error(data_type))?;
            for row in start..values.len() {
                if values.is_null(row) {
                    f(None);
                } else {
                    f(Some(FilterValue::Utf8(values.value(row).to_string())));
                }
            }
            Ok(())
        }
        DataType::LargeUtf8 => {
            let values = array
                .as_string_opt::<i64>()
                .ok_or_else(|| downcast_error(data_type))?;
            for row in start..values.len() {
                if values.is_null(row) {
                    f(None);
                } else {
                    f(Some(FilterValue::Utf8(values.value(row).to_string())));
                }
            }
            Ok(())
        }
        other => Err(RuntimeFilterError::Config(format!(
            "unsupported runtime filter build type: {:?}",
            other
        ))),
    }
}
