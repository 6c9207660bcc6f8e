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
//! Runtime-filter payload codec.
//!
//! Responsibilities:
//! - Encodes finalized filters into the immutable payload handed to publish sinks.
//! - Decodes payloads for merging and probing, validating every length before reading.
//!
//! Key exported interfaces:
//! - Functions: `encode_filter`, `encode_disabled`, `decode_filter`, `peek_header`.
//!
//! Layout: `[version u8][type u8][flags u8][body]`. A disabled payload carries
//! `FLAG_DISABLED` and no body; consumers treat it as accept-all.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::bloom::BlockBloomFilter;
use super::desc::RuntimeFilterType;
use super::error::{Result, RuntimeFilterError};
use super::filter::{FilterBody, RuntimeFilter};
use super::in_filter::InFilter;
use super::min_max::MinMaxFilter;
use super::value::{FilterValue, ValueKind};
use crate::novarocks_logging::warn;

pub const PAYLOAD_VERSION: u8 = 1;
pub const FLAG_DISABLED: u8 = 0x01;
pub const FLAG_HAS_NULL: u8 = 0x02;

const NO_VALUE_KIND: u8 = 0xFF;
const BODY_IN: u8 = 0;
const BODY_MIN_MAX: u8 = 1;
const BODY_BLOOM: u8 = 2;

/// Fixed payload prefix.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PayloadHeader {
    pub version: u8,
    pub filter_type: RuntimeFilterType,
    pub disabled: bool,
    pub has_null: bool,
}

pub fn peek_header(payload: &[u8]) -> Result<PayloadHeader> {
    let mut buf = payload;
    read_header(&mut buf)
}

fn read_header(buf: &mut &[u8]) -> Result<PayloadHeader> {
    let version = get_u8(buf)?;
    if version != PAYLOAD_VERSION {
        return Err(RuntimeFilterError::Codec(format!(
            "unsupported runtime filter payload version {}",
            version
        )));
    }
    let filter_type = RuntimeFilterType::from_u8(get_u8(buf)?)?;
    let flags = get_u8(buf)?;
    Ok(PayloadHeader {
        version,
        filter_type,
        disabled: flags & FLAG_DISABLED != 0,
        has_null: flags & FLAG_HAS_NULL != 0,
    })
}

/// Canonical accept-all payload.
pub fn encode_disabled(filter_type: RuntimeFilterType) -> Bytes {
    Bytes::from(vec![PAYLOAD_VERSION, filter_type.as_u8(), FLAG_DISABLED])
}

pub fn encode_filter(filter: &RuntimeFilter) -> Bytes {
    if filter.is_disabled() {
        return encode_disabled(filter.filter_type());
    }
    let mut buf = BytesMut::with_capacity(32 + filter.estimated_bytes());
    buf.put_u8(PAYLOAD_VERSION);
    buf.put_u8(filter.filter_type().as_u8());
    buf.put_u8(if filter.has_null() { FLAG_HAS_NULL } else { 0 });
    buf.put_u64_le(filter.size_hint());
    buf.put_u8(filter.value_kind().map_or(NO_VALUE_KIND, ValueKind::as_u8));
    match filter.body() {
        FilterBody::In(in_filter) => {
            buf.put_u8(BODY_IN);
            // An unencodable value set degrades to the accept-all payload.
            if let Err(e) = in_filter.encode_into(&mut buf) {
                warn!("runtime filter in-list not encodable, sending disabled: error={}", e);
                return encode_disabled(filter.filter_type());
            }
        }
        FilterBody::MinMax(min_max) => {
            buf.put_u8(BODY_MIN_MAX);
            min_max.encode_into(&mut buf);
        }
        FilterBody::Bloom(bloom) => {
            buf.put_u8(BODY_BLOOM);
            bloom.encode_into(&mut buf);
        }
        FilterBody::AcceptAll => return encode_disabled(filter.filter_type()),
    }
    buf.freeze()
}

pub fn decode_filter(payload: &[u8]) -> Result<RuntimeFilter> {
    let mut buf = payload;
    let header = read_header(&mut buf)?;
    if header.disabled {
        if !buf.is_empty() {
            return Err(RuntimeFilterError::Codec(
                "disabled runtime filter payload carries a body".to_string(),
            ));
        }
        return Ok(RuntimeFilter::accept_all(header.filter_type));
    }
    let size_hint = get_u64_le(&mut buf)?;
    let value_kind = match get_u8(&mut buf)? {
        NO_VALUE_KIND => None,
        tag => Some(ValueKind::from_u8(tag)?),
    };
    let body = match get_u8(&mut buf)? {
        BODY_IN => FilterBody::In(InFilter::decode(&mut buf, value_kind)?),
        BODY_MIN_MAX => FilterBody::MinMax(MinMaxFilter::decode(&mut buf, value_kind)?),
        BODY_BLOOM => FilterBody::Bloom(BlockBloomFilter::decode(&mut buf)?),
        other => {
            return Err(RuntimeFilterError::Codec(format!(
                "unknown runtime filter body tag {}",
                other
            )));
        }
    };
    if !buf.is_empty() {
        return Err(RuntimeFilterError::Codec(format!(
            "{} trailing bytes after runtime filter body",
            buf.len()
        )));
    }
    RuntimeFilter::from_parts(header.filter_type, header.has_null, size_hint, value_kind, body)
}

pub(crate) fn ensure_remaining(buf: &[u8], need: usize, what: &str) -> Result<()> {
    if buf.len() < need {
        return Err(RuntimeFilterError::Codec(format!(
            "runtime filter data truncated reading {}: need {} bytes, have {}",
            what,
            need,
            buf.len()
        )));
    }
    Ok(())
}

pub(crate) fn get_u8(buf: &mut &[u8]) -> Result<u8> {
    ensure_remaining(buf, 1, "u8")?;
    Ok(buf.get_u8())
}

pub(crate) fn get_u32_le(buf: &mut &[u8]) -> Result<u32> {
    ensure_remaining(buf, 4, "u32")?;
    Ok(buf.get_u32_le())
}

pub(crate) fn get_i32_le(buf: &mut &[u8]) -> Result<i32> {
    ensure_remaining(buf, 4, "i32")?;
    Ok(buf.get_i32_le())
}

pub(crate) fn get_u64_le(buf: &mut &[u8]) -> Result<u64> {
    ensure_remaining(buf, 8, "u64")?;
    Ok(buf.get_u64_le())
}

pub(crate) fn put_value(buf: &mut BytesMut, value: &FilterValue) {
    match value {
        FilterValue::Bool(v) => buf.put_u8(*v as u8),
        FilterValue::Int(v) => buf.put_i64_le(*v),
        FilterValue::Float(v) => buf.put_f64_le(*v),
        FilterValue::Utf8(v) => {
            buf.put_u32_le(v.len() as u32);
            buf.put_slice(v.as_bytes());
        }
    }
}

pub(crate) fn get_value(buf: &mut &[u8], kind: Option<ValueKind>) -> Result<FilterValue> {
    let Some(kind) = kind else {
        return Err(RuntimeFilterError::Codec(
            "runtime filter value present without a value kind".to_string(),
        ));
    };
    match kind {
        ValueKind::Bool => Ok(FilterValue::Bool(get_u8(buf)? != 0)),
        ValueKind::Int => Ok(FilterValue::Int(get_u64_le(buf)? as i64)),
        ValueKind::Float => Ok(FilterValue::Float(f64::from_bits(get_u64_le(buf)?))),
        ValueKind::Utf8 => {
            let len = get_u32_le(buf)? as usize;
            ensure_remaining(buf, len, "utf8 value")?;
            let (head, tail) = buf.split_at(len);
            let value = std::str::from_utf8(head)
                .map_err(|e| RuntimeFilterError::Codec(format!("invalid utf8 value: {}", e)))?
                .to_string();
            *buf = tail;
            Ok(FilterValue::Utf8(value))
        }
    }
}
