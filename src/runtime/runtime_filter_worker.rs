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
use std::collections::HashMap;
use std::sync::Mutex;

use bytes::Bytes;

use crate::common::ids::InstanceId;
use crate::exec::runtime_filter::{
    Result, RuntimeFilter, RuntimeFilterError, decode_filter, encode_disabled, encode_filter,
};
use crate::novarocks_logging::{debug, warn};

/// Merges per-instance partial filters of shared (non-broadcast) joins into one final
/// filter per descriptor.
pub(crate) struct RuntimeFilterWorker {
    max_filter_bytes: Option<u64>,
    merge_states: Mutex<HashMap<i32, MergeState>>,
}

struct MergeState {
    expected: usize,
    received: HashMap<InstanceId, RuntimeFilter>,
    done: bool,
}

impl MergeState {
    fn new(expected: usize) -> Self {
        Self {
            expected,
            received: HashMap::new(),
            done: false,
        }
    }
}

impl RuntimeFilterWorker {
    pub(crate) fn new(max_filter_bytes: Option<u64>) -> Self {
        Self {
            max_filter_bytes: max_filter_bytes.filter(|v| *v > 0),
            merge_states: Mutex::new(HashMap::new()),
        }
    }

    /// Record one partial. Returns the merged payload when this partial completes the set;
    /// duplicates and partials arriving after completion are ignored.
    pub(crate) fn receive_partial(
        &self,
        filter_id: i32,
        instance_id: InstanceId,
        payload: &[u8],
        expected_builders: usize,
    ) -> Result<Option<Bytes>> {
        if expected_builders == 0 {
            return Err(RuntimeFilterError::invalid_state(format!(
                "runtime filter {} merge expects no builders",
                filter_id
            )));
        }
        let filter = decode_filter(payload)?;
        debug!(
            "runtime filter receive partial: filter_id={} type={} instance={} disabled={} bytes={}",
            filter_id,
            filter.filter_type(),
            instance_id,
            filter.is_disabled(),
            payload.len()
        );
        let parts = {
            let mut guard = self.merge_states.lock().expect("runtime filter merge lock");
            let state = guard
                .entry(filter_id)
                .or_insert_with(|| MergeState::new(expected_builders));
            if state.done {
                debug!(
                    "runtime filter partial after merge completed: filter_id={} instance={}",
                    filter_id, instance_id
                );
                return Ok(None);
            }
            if state.expected != expected_builders {
                warn!(
                    "runtime filter expected builders mismatch: filter_id={} first={} now={}",
                    filter_id, state.expected, expected_builders
                );
            }
            if state.received.contains_key(&instance_id) {
                return Ok(None);
            }
            state.received.insert(instance_id, filter);
            if state.received.len() < state.expected {
                return Ok(None);
            }
            state.done = true;
            std::mem::take(&mut state.received)
        };

        let data = self.merge_and_encode(filter_id, parts.into_values())?;
        debug!(
            "runtime filter merged final: filter_id={} bytes={}",
            filter_id,
            data.len()
        );
        Ok(Some(data))
    }

    fn merge_and_encode(
        &self,
        filter_id: i32,
        mut parts: impl Iterator<Item = RuntimeFilter>,
    ) -> Result<Bytes> {
        let Some(mut merged) = parts.next() else {
            return Err(RuntimeFilterError::Internal(format!(
                "runtime filter {} merge with no partials",
                filter_id
            )));
        };
        for part in parts {
            merged.merge_from(filter_id, &part)?;
        }
        let data = encode_filter(&merged);
        if let Some(max) = self.max_filter_bytes
            && data.len() as u64 > max
        {
            warn!(
                "runtime filter merged size over limit, publishing disabled: filter_id={} bytes={} limit={}",
                filter_id,
                data.len(),
                max
            );
            return Ok(encode_disabled(merged.filter_type()));
        }
        Ok(data)
    }

    pub(crate) fn pending_partials(&self, filter_id: i32) -> usize {
        self.merge_states
            .lock()
            .expect("runtime filter merge lock")
            .get(&filter_id)
            .map_or(0, |s| s.received.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::runtime_filter::{FilterValue, RuntimeFilterType};

    fn in_payload(values: &[i64]) -> Bytes {
        let mut filter = RuntimeFilter::new(RuntimeFilterType::In, 0, 64);
        for v in values {
            filter.insert(Some(FilterValue::Int(*v))).unwrap();
        }
        encode_filter(&filter)
    }

    #[test]
    fn merges_once_all_builders_report() {
        let worker = RuntimeFilterWorker::new(None);
        assert!(
            worker
                .receive_partial(1, InstanceId(0), &in_payload(&[1]), 2)
                .unwrap()
                .is_none()
        );
        // Duplicate from the same instance does not complete the set.
        assert!(
            worker
                .receive_partial(1, InstanceId(0), &in_payload(&[1]), 2)
                .unwrap()
                .is_none()
        );
        assert_eq!(worker.pending_partials(1), 1);
        let merged = worker
            .receive_partial(1, InstanceId(1), &in_payload(&[2]), 2)
            .unwrap()
            .unwrap();
        let filter = decode_filter(&merged).unwrap();
        assert!(filter.may_contain(Some(&FilterValue::Int(1))));
        assert!(filter.may_contain(Some(&FilterValue::Int(2))));
        assert!(!filter.may_contain(Some(&FilterValue::Int(3))));
        // Late partial is ignored.
        assert!(
            worker
                .receive_partial(1, InstanceId(2), &in_payload(&[3]), 2)
                .unwrap()
                .is_none()
        );
    }

    #[test]
    fn disabled_partial_disables_result() {
        let worker = RuntimeFilterWorker::new(None);
        worker
            .receive_partial(2, InstanceId(0), &in_payload(&[1]), 2)
            .unwrap();
        let merged = worker
            .receive_partial(2, InstanceId(1), &encode_disabled(RuntimeFilterType::In), 2)
            .unwrap()
            .unwrap();
        assert!(decode_filter(&merged).unwrap().is_disabled());
    }

    #[test]
    fn kind_mismatch_is_incompatible_merge() {
        let worker = RuntimeFilterWorker::new(None);
        worker
            .receive_partial(3, InstanceId(0), &in_payload(&[1]), 2)
            .unwrap();
        let mut min_max = RuntimeFilter::new(RuntimeFilterType::MinMax, 0, 64);
        min_max.insert(Some(FilterValue::Int(4))).unwrap();
        assert!(matches!(
            worker.receive_partial(3, InstanceId(1), &encode_filter(&min_max), 2),
            Err(RuntimeFilterError::IncompatibleMerge { filter_id: 3, .. })
        ));
    }

    #[test]
    fn oversized_merge_publishes_disabled() {
        let worker = RuntimeFilterWorker::new(Some(8));
        let merged = worker
            .receive_partial(4, InstanceId(0), &in_payload(&[1, 2, 3]), 1)
            .unwrap()
            .unwrap();
        assert!(decode_filter(&merged).unwrap().is_disabled());
    }
}
