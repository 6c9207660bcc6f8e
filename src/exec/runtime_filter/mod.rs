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
//! Runtime-filter module exports.
//!
//! Responsibilities:
//! - Filter representations (in-list, min/max, blocked bloom) and their wire payloads.
//! - Per-descriptor producers and the helper that drives one join build instance through
//!   size sync, build and publish.
//!
//! Key exported interfaces:
//! - Types: `RuntimeFilterDesc`, `RuntimeFilter`, `RuntimeFilterProducer`,
//!   `RuntimeFilterProducerHelper`, `SharedRuntimeFilters`.
//! - Functions: `encode_filter`, `encode_disabled`, `decode_filter`, `peek_header`.

mod bloom;
mod codec;
mod desc;
mod error;
mod filter;
mod in_filter;
mod min_max;
mod producer;
mod producer_helper;
mod shared;
mod value;

pub use bloom::BlockBloomFilter;
pub use codec::{
    FLAG_DISABLED, FLAG_HAS_NULL, PAYLOAD_VERSION, PayloadHeader, decode_filter,
    encode_disabled, encode_filter, peek_header,
};
pub use desc::{FilterTarget, RuntimeFilterDesc, RuntimeFilterType};
pub use error::{Result, RuntimeFilterError};
pub use filter::{FilterBody, RuntimeFilter};
pub use in_filter::{InFilter, MAX_IN_CONDITIONS};
pub use min_max::MinMaxFilter;
pub use producer::{DisableReason, FilterProducer, ProducerState, RuntimeFilterProducer};
pub use producer_helper::{
    HelperState, RuntimeFilterContext, RuntimeFilterOptions, RuntimeFilterProducerHelper,
};
pub use shared::SharedRuntimeFilters;
pub use value::{FilterValue, ValueKind, for_each_value, value_kind};
