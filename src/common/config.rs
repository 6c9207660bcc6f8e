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
use crate::novarocks_config::config as novarocks_app_config;

pub(crate) fn runtime_filter_max_rows() -> u64 {
    novarocks_app_config()
        .ok()
        .map(|c| c.runtime_filter.max_filter_rows)
        .unwrap_or(64_000_000)
}

pub(crate) fn runtime_filter_max_bytes() -> u64 {
    novarocks_app_config()
        .ok()
        .map(|c| c.runtime_filter.max_filter_bytes)
        .unwrap_or(64 * 1024 * 1024)
}

pub(crate) fn runtime_filter_max_in_conditions() -> usize {
    novarocks_app_config()
        .ok()
        .map(|c| c.runtime_filter.max_in_conditions)
        .unwrap_or(1024)
}

pub(crate) fn runtime_filter_sync_size_timeout_ms() -> u64 {
    novarocks_app_config()
        .ok()
        .map(|c| c.runtime_filter.sync_size_timeout_ms)
        .unwrap_or(2000)
}

pub(crate) fn runtime_filter_bloom_default_size() -> u64 {
    novarocks_app_config()
        .ok()
        .map(|c| c.runtime_filter.bloom_filter_default_size)
        .unwrap_or(1_048_576)
}

pub(crate) fn runtime_filter_round_gc_ms() -> u64 {
    novarocks_app_config()
        .ok()
        .map(|c| c.runtime_filter.round_gc_ms)
        .unwrap_or(60_000)
}
