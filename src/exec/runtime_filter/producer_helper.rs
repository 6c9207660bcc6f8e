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
//! Runtime-filter producer coordination for one hash join build instance.
//!
//! Responsibilities:
//! - Owns the producers of every descriptor the build side must emit.
//! - Drives the size round, sizes and fills producers, then publishes each payload once.
//! - Guarantees publication on every exit path: skip, normal publish, or terminate.
//!
//! Key exported interfaces:
//! - Types: `RuntimeFilterProducerHelper`, `HelperState`, `RuntimeFilterContext`,
//!   `RuntimeFilterOptions`.
//!
//! Lifecycle: `Init -> (Skipped | SizePending -> SizingDone) -> Building -> Built ->
//! Publishing -> Published`, with `Terminated` reachable from every non-terminal state.
//! Sibling instances of one join resolve the size round together, so either all of them
//! build real filters or all of them publish disabled ones.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::common::config;
use crate::common::ids::InstanceId;
use crate::common::types::UniqueId;
use crate::exec::chunk::Chunk;
use crate::exec::pipeline::dependency::CountedFinishDependency;
use crate::novarocks_logging::{debug, error, info, warn};
use crate::runtime::profile::{CounterRef, CounterUnit, RuntimeProfile, ScopedTimer};
use crate::runtime::runtime_filter_hub::{PublishMode, PublishRequest, PublishSink};
use crate::runtime::size_negotiator::{
    AbandonReason, RoundHandle, SizeNegotiator, SizeResolution, SizeRoundKey,
};

use super::desc::RuntimeFilterDesc;
use super::error::{Result, RuntimeFilterError};
use super::producer::{DisableReason, FilterProducer, ProducerState, RuntimeFilterProducer};
use super::shared::SharedRuntimeFilters;

/// Limits snapshotted for one helper.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RuntimeFilterOptions {
    pub max_in_conditions: usize,
    pub max_filter_bytes: u64,
    pub sync_size_timeout: Duration,
    pub bloom_filter_default_size: u64,
}

impl RuntimeFilterOptions {
    pub fn from_config() -> Self {
        Self {
            max_in_conditions: config::runtime_filter_max_in_conditions(),
            max_filter_bytes: config::runtime_filter_max_bytes(),
            sync_size_timeout: Duration::from_millis(config::runtime_filter_sync_size_timeout_ms()),
            bloom_filter_default_size: config::runtime_filter_bloom_default_size(),
        }
    }
}

impl Default for RuntimeFilterOptions {
    fn default() -> Self {
        Self::from_config()
    }
}

/// Query-scoped collaborators of one build instance.
#[derive(Clone)]
pub struct RuntimeFilterContext {
    pub query_id: UniqueId,
    pub join_node_id: i32,
    pub instance_id: InstanceId,
    /// Build instances of this join taking part in the size round.
    pub expected_instances: usize,
    pub negotiator: Arc<SizeNegotiator>,
    pub sink: Arc<dyn PublishSink>,
    pub options: RuntimeFilterOptions,
}

impl RuntimeFilterContext {
    fn round_key(&self) -> SizeRoundKey {
        SizeRoundKey::new(self.query_id, self.join_node_id)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HelperState {
    Init,
    Skipped,
    SizePending,
    SizingDone,
    Building,
    Built,
    Publishing,
    Published,
    Terminated,
}

impl HelperState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            HelperState::Skipped | HelperState::Published | HelperState::Terminated
        )
    }
}

pub struct RuntimeFilterProducerHelper {
    ctx: RuntimeFilterContext,
    should_build_hash_table: bool,
    is_broadcast_join: bool,
    state: HelperState,
    producers: Vec<RuntimeFilterProducer>,
    round: Option<RoundHandle>,
    size_deadline: Option<Instant>,
    synced_size: Option<u64>,
    profile: RuntimeProfile,
    publish_timer: CounterRef,
    build_timer: CounterRef,
}

impl RuntimeFilterProducerHelper {
    pub fn new(
        profile: &RuntimeProfile,
        should_build_hash_table: bool,
        is_broadcast_join: bool,
        ctx: RuntimeFilterContext,
    ) -> Self {
        let profile = profile.child("RuntimeFilterProducerHelper");
        let publish_timer = profile.add_timer("PublishTime");
        let build_timer = profile.add_timer("BuildTime");
        Self {
            ctx,
            should_build_hash_table,
            is_broadcast_join,
            state: HelperState::Init,
            producers: Vec::new(),
            round: None,
            size_deadline: None,
            synced_size: None,
            profile,
            publish_timer,
            build_timer,
        }
    }

    pub fn state(&self) -> HelperState {
        self.state
    }

    pub fn producers(&self) -> &[RuntimeFilterProducer] {
        &self.producers
    }

    /// Globally agreed build row count, once the size round resolved to a size.
    pub fn synced_size(&self) -> Option<u64> {
        self.synced_size
    }

    pub fn profile(&self) -> &RuntimeProfile {
        &self.profile
    }

    fn invalid(&self, op: &str) -> RuntimeFilterError {
        RuntimeFilterError::invalid_state(format!(
            "runtime filter helper {} in state {:?}: query_id={} join_node_id={} instance={}",
            op, self.state, self.ctx.query_id, self.ctx.join_node_id, self.ctx.instance_id
        ))
    }

    /// Create one producer per descriptor.
    pub fn init(&mut self, descs: &[RuntimeFilterDesc]) -> Result<()> {
        if self.state != HelperState::Init || !self.producers.is_empty() {
            return Err(self.invalid("init"));
        }
        let mut seen = HashSet::with_capacity(descs.len());
        let mut producers = Vec::with_capacity(descs.len());
        for desc in descs {
            if !seen.insert(desc.filter_id) {
                return Err(RuntimeFilterError::Config(format!(
                    "duplicate runtime filter id {} on join node {}",
                    desc.filter_id, self.ctx.join_node_id
                )));
            }
            producers.push(RuntimeFilterProducer::new(
                desc.clone(),
                self.ctx.options.max_in_conditions,
                self.ctx.options.max_filter_bytes,
            )?);
        }
        self.producers = producers;
        self.profile.counter_set(
            "RuntimeFilterNum",
            CounterUnit::Unit,
            self.producers.len() as i64,
        );
        debug!(
            "runtime filter helper init: query_id={} join_node_id={} instance={} filters={} build_hash_table={} broadcast={}",
            self.ctx.query_id,
            self.ctx.join_node_id,
            self.ctx.instance_id,
            self.producers.len(),
            self.should_build_hash_table,
            self.is_broadcast_join
        );
        Ok(())
    }

    fn needs_size_round(&self) -> bool {
        self.ctx.expected_instances > 1 && self.producers.iter().any(|p| p.desc().needs_sync_size())
    }

    fn disable_all(&mut self, reason: DisableReason) -> usize {
        let disabled = self
            .producers
            .iter_mut()
            .map(|p| p.disable(reason))
            .filter(|changed| *changed)
            .count();
        if disabled > 0 {
            self.profile.counter_add(
                "DisabledRuntimeFilterNum",
                CounterUnit::Unit,
                disabled as i64,
            );
        }
        disabled
    }

    /// Give up on filtering before any size exchange: publish disabled filters now so
    /// consumers never wait on this instance.
    pub fn skip_process(&mut self) -> Result<()> {
        match self.state {
            HelperState::Skipped => return Ok(()),
            HelperState::Init => {}
            _ => return Err(self.invalid("skip_process")),
        }
        if self.needs_size_round() {
            self.ctx.negotiator.abandon(
                self.ctx.round_key(),
                self.ctx.instance_id,
                AbandonReason::ParticipantSkipped,
            );
        }
        self.disable_all(DisableReason::Skipped);
        info!(
            "runtime filter helper skipped: query_id={} join_node_id={} instance={} filters={}",
            self.ctx.query_id,
            self.ctx.join_node_id,
            self.ctx.instance_id,
            self.producers.len()
        );
        self.publish_producers()?;
        self.state = HelperState::Skipped;
        Ok(())
    }

    /// Report this instance's build row count. `dependency` stays blocked while the size
    /// round is open.
    pub fn send_filter_size(
        &mut self,
        local_row_count: u64,
        dependency: &Arc<CountedFinishDependency>,
    ) -> Result<()> {
        match self.state {
            HelperState::Skipped | HelperState::Terminated => return Ok(()),
            HelperState::Init => {}
            _ => return Err(self.invalid("send_filter_size")),
        }
        let local_estimate = if self.should_build_hash_table {
            local_row_count
        } else {
            0
        };
        if !self.needs_size_round() {
            let resolution = self.ctx.negotiator.resolve_local(local_estimate);
            self.apply_resolution(resolution);
            self.state = HelperState::SizingDone;
            return Ok(());
        }

        let handle = self.ctx.negotiator.report(
            self.ctx.round_key(),
            self.ctx.instance_id,
            local_estimate,
            self.ctx.expected_instances,
        )?;
        let timeout = self.ctx.options.sync_size_timeout;
        self.ctx
            .negotiator
            .attach_dependency(&handle, Arc::clone(dependency), timeout);
        self.round = Some(handle);
        self.size_deadline = Some(Instant::now() + timeout);
        self.state = HelperState::SizePending;
        debug!(
            "runtime filter size sent: query_id={} join_node_id={} instance={} rows={} expected_instances={}",
            self.ctx.query_id,
            self.ctx.join_node_id,
            self.ctx.instance_id,
            local_estimate,
            self.ctx.expected_instances
        );
        self.poll_filter_size()?;
        Ok(())
    }

    /// Non-blocking check of the size round. Returns true once sizing is settled.
    pub fn poll_filter_size(&mut self) -> Result<bool> {
        match self.state {
            HelperState::Init => Err(self.invalid("poll_filter_size")),
            HelperState::SizePending => {
                let Some(handle) = self.round else {
                    return Err(RuntimeFilterError::Internal(
                        "size round pending without a handle".to_string(),
                    ));
                };
                if self.size_deadline.is_some_and(|d| Instant::now() >= d) {
                    self.ctx.negotiator.expire(&handle);
                }
                match self.ctx.negotiator.poll(&handle) {
                    Some(resolution) => {
                        self.finish_sizing(&handle, resolution);
                        Ok(true)
                    }
                    None => Ok(false),
                }
            }
            _ => Ok(true),
        }
    }

    /// Block until the size round settles or `timeout` (default: the configured sync
    /// timeout, counted from `send_filter_size`) elapses.
    pub fn wait_filter_size(&mut self, timeout: Option<Duration>) -> Result<()> {
        if self.state != HelperState::SizePending {
            return self.poll_filter_size().map(|_| ());
        }
        let Some(handle) = self.round else {
            return Err(RuntimeFilterError::Internal(
                "size round pending without a handle".to_string(),
            ));
        };
        let timeout = timeout.unwrap_or_else(|| {
            self.size_deadline
                .map_or(self.ctx.options.sync_size_timeout, |d| {
                    d.saturating_duration_since(Instant::now())
                })
        });
        let resolution = self.ctx.negotiator.wait(&handle, timeout);
        self.finish_sizing(&handle, resolution);
        Ok(())
    }

    fn finish_sizing(&mut self, handle: &RoundHandle, resolution: SizeResolution) {
        self.ctx.negotiator.observe(handle);
        self.round = None;
        self.size_deadline = None;
        self.apply_resolution(resolution);
        self.state = HelperState::SizingDone;
    }

    fn apply_resolution(&mut self, resolution: SizeResolution) {
        match resolution {
            SizeResolution::Sized(rows) => {
                self.synced_size = Some(rows);
                self.profile
                    .add_info_string("SyncedBuildRows", rows.to_string());
            }
            SizeResolution::Abandon(reason) => {
                let disabled = self.disable_all(DisableReason::SizeAbandoned(reason));
                warn!(
                    "runtime filters disabled by size round: query_id={} join_node_id={} instance={} reason={} disabled={}",
                    self.ctx.query_id,
                    self.ctx.join_node_id,
                    self.ctx.instance_id,
                    reason,
                    disabled
                );
            }
        }
    }

    fn configure_producers(&mut self) {
        let synced = self.synced_size.unwrap_or(0);
        let default_size = self.ctx.options.bloom_filter_default_size;
        let mut rejected = 0usize;
        for producer in &mut self.producers {
            if producer.state() == ProducerState::Disabled {
                continue;
            }
            let desc = producer.desc();
            let rows = if desc.filter_type.uses_bloom() && !desc.build_bf_by_runtime_size {
                default_size
            } else {
                synced
            };
            let size_hint = i64::try_from(rows).unwrap_or(i64::MAX);
            if let Err(e) = producer.configure(size_hint) {
                warn!(
                    "runtime filter configure rejected, disabling: filter_id={} rows={} error={}",
                    producer.filter_id(),
                    rows,
                    e
                );
                producer.disable(DisableReason::ConfigRejected);
                rejected += 1;
            }
        }
        if rejected > 0 {
            self.profile.counter_add(
                "DisabledRuntimeFilterNum",
                CounterUnit::Unit,
                rejected as i64,
            );
        }
    }

    /// Feed one build chunk. At `eos` shared-table joins exchange filters through
    /// `shared_filters` and the helper becomes `Built`.
    pub fn build(
        &mut self,
        chunk: &Chunk,
        use_shared_table: bool,
        shared_filters: &SharedRuntimeFilters,
        eos: bool,
    ) -> Result<()> {
        match self.state {
            HelperState::Skipped | HelperState::Terminated => return Ok(()),
            HelperState::SizePending => {
                if !self.poll_filter_size()? {
                    return Err(self.invalid("build before size sync"));
                }
                self.configure_producers();
            }
            HelperState::SizingDone => self.configure_producers(),
            HelperState::Building => {}
            _ => return Err(self.invalid("build")),
        }
        self.state = HelperState::Building;

        let timer = Arc::clone(&self.build_timer);
        let _build_timer = ScopedTimer::new(timer);
        if self.should_build_hash_table && !chunk.is_empty() {
            let mut rejected = 0i64;
            for producer in &mut self.producers {
                match producer.insert(chunk, 0) {
                    Ok(()) => {}
                    Err(e @ RuntimeFilterError::Config(_)) => {
                        warn!(
                            "runtime filter insert rejected, disabling: filter_id={} error={}",
                            producer.filter_id(),
                            e
                        );
                        producer.disable(DisableReason::ConfigRejected);
                        rejected += 1;
                    }
                    Err(e) => return Err(e),
                }
            }
            if rejected > 0 {
                self.profile
                    .counter_add("DisabledRuntimeFilterNum", CounterUnit::Unit, rejected);
            }
        }

        if eos {
            self.finish_build(use_shared_table, shared_filters)?;
            self.state = HelperState::Built;
        }
        Ok(())
    }

    fn finish_build(
        &mut self,
        use_shared_table: bool,
        shared_filters: &SharedRuntimeFilters,
    ) -> Result<()> {
        if !use_shared_table {
            if !self.should_build_hash_table {
                let disabled = self.disable_all(DisableReason::SharedFilterMissing);
                warn!(
                    "runtime filter instance built no table and shares none, disabling: join_node_id={} instance={} disabled={}",
                    self.ctx.join_node_id, self.ctx.instance_id, disabled
                );
            }
            return Ok(());
        }
        if self.should_build_hash_table {
            for producer in &self.producers {
                shared_filters.contribute(producer)?;
            }
        }
        // Union with the shared result is idempotent, so builders adopt it too.
        for producer in &mut self.producers {
            match shared_filters.get(producer.filter_id()) {
                Some(shared) => producer.merge(&shared)?,
                None => {
                    warn!(
                        "shared runtime filter missing, disabling: filter_id={} instance={}",
                        producer.filter_id(),
                        self.ctx.instance_id
                    );
                    if producer.disable(DisableReason::SharedFilterMissing) {
                        self.profile
                            .counter_add("DisabledRuntimeFilterNum", CounterUnit::Unit, 1);
                    }
                }
            }
        }
        Ok(())
    }

    /// Hand every built filter to the publish sink.
    pub fn publish(&mut self) -> Result<()> {
        match self.state {
            HelperState::Skipped => return Ok(()),
            HelperState::Built => {}
            _ => return Err(self.invalid("publish")),
        }
        self.state = HelperState::Publishing;
        self.publish_producers()?;
        self.state = HelperState::Published;
        debug!(
            "runtime filter helper published: query_id={} join_node_id={} instance={} filters={}",
            self.ctx.query_id,
            self.ctx.join_node_id,
            self.ctx.instance_id,
            self.producers.len()
        );
        Ok(())
    }

    /// Abort path: disable whatever is not built yet and publish everything not yet
    /// published. Idempotent.
    pub fn terminate(&mut self) -> Result<()> {
        if self.state.is_terminal() {
            return Ok(());
        }
        let from = self.state;
        if let Some(handle) = self.round.take() {
            // Siblings must not build real filters once this instance leaves the round.
            self.ctx.negotiator.abandon(
                handle.key(),
                handle.instance_id(),
                AbandonReason::ParticipantSkipped,
            );
        }
        if from == HelperState::Init && self.needs_size_round() {
            self.ctx.negotiator.abandon(
                self.ctx.round_key(),
                self.ctx.instance_id,
                AbandonReason::ParticipantSkipped,
            );
        }
        if !matches!(from, HelperState::Built | HelperState::Publishing) {
            self.disable_all(DisableReason::Terminated);
        }
        let result = self.publish_producers();
        self.state = HelperState::Terminated;
        info!(
            "runtime filter helper terminated: query_id={} join_node_id={} instance={} from={:?}",
            self.ctx.query_id, self.ctx.join_node_id, self.ctx.instance_id, from
        );
        result
    }

    fn publish_mode(&self) -> PublishMode {
        if self.is_broadcast_join {
            PublishMode::Broadcast
        } else {
            PublishMode::Merge {
                expected_builders: self.ctx.expected_instances,
            }
        }
    }

    fn publish_producers(&mut self) -> Result<()> {
        let timer = Arc::clone(&self.publish_timer);
        let _publish_timer = ScopedTimer::new(timer);
        let mode = self.publish_mode();
        for producer in &mut self.producers {
            if producer.is_published() {
                continue;
            }
            let payload = producer.finalize()?;
            let request = PublishRequest {
                filter_id: producer.filter_id(),
                instance_id: self.ctx.instance_id,
                payload,
                targets: producer.desc().targets.clone(),
                mode,
            };
            match self.ctx.sink.publish(request) {
                Ok(()) => {}
                Err(e @ RuntimeFilterError::SinkDelivery { .. }) => {
                    warn!(
                        "runtime filter delivery failed, consumers fall back to no filter: instance={} error={}",
                        self.ctx.instance_id, e
                    );
                    self.profile
                        .counter_add("SinkDeliveryFailures", CounterUnit::Unit, 1);
                }
                Err(e) => return Err(e),
            }
            producer.mark_published();
        }
        Ok(())
    }
}

impl Drop for RuntimeFilterProducerHelper {
    fn drop(&mut self) {
        if self.state.is_terminal() || self.producers.is_empty() {
            return;
        }
        error!(
            "runtime filter helper dropped before publish or terminate: query_id={} join_node_id={} instance={} state={:?}",
            self.ctx.query_id, self.ctx.join_node_id, self.ctx.instance_id, self.state
        );
        if !std::thread::panicking() {
            debug_assert!(
                false,
                "runtime filter helper dropped in state {:?}",
                self.state
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use arrow::array::{Int64Array, RecordBatch};
    use arrow::datatypes::{DataType, Field, Schema};
    use bytes::Bytes;

    use super::*;
    use crate::exec::runtime_filter::{FilterValue, RuntimeFilterType, decode_filter};

    #[derive(Default)]
    struct RecordingSink {
        requests: Mutex<Vec<PublishRequest>>,
        fail_delivery: bool,
    }

    impl PublishSink for RecordingSink {
        fn publish(&self, request: PublishRequest) -> Result<()> {
            let filter_id = request.filter_id;
            self.requests.lock().unwrap().push(request);
            if self.fail_delivery {
                return Err(RuntimeFilterError::SinkDelivery {
                    filter_id,
                    message: "target down".to_string(),
                });
            }
            Ok(())
        }
    }

    impl RecordingSink {
        fn payloads(&self) -> Vec<Bytes> {
            self.requests
                .lock()
                .unwrap()
                .iter()
                .map(|r| r.payload.clone())
                .collect()
        }
    }

    fn options() -> RuntimeFilterOptions {
        RuntimeFilterOptions {
            max_in_conditions: 16,
            max_filter_bytes: 1 << 20,
            sync_size_timeout: Duration::from_millis(50),
            bloom_filter_default_size: 1024,
        }
    }

    fn helper(
        sink: Arc<RecordingSink>,
        negotiator: Arc<SizeNegotiator>,
        expected_instances: usize,
    ) -> RuntimeFilterProducerHelper {
        let ctx = RuntimeFilterContext {
            query_id: UniqueId::new(7, 7),
            join_node_id: 3,
            instance_id: InstanceId(0),
            expected_instances,
            negotiator,
            sink,
            options: options(),
        };
        RuntimeFilterProducerHelper::new(&RuntimeProfile::new("HASH_JOIN_BUILD"), true, true, ctx)
    }

    fn chunk(values: Vec<i64>) -> Chunk {
        let schema = Arc::new(Schema::new(vec![Field::new("k", DataType::Int64, false)]));
        Chunk::new(
            RecordBatch::try_new(schema, vec![Arc::new(Int64Array::from(values)) as _]).unwrap(),
        )
    }

    fn negotiator() -> Arc<SizeNegotiator> {
        Arc::new(SizeNegotiator::new(1000, Duration::from_secs(60)))
    }

    #[test]
    fn single_instance_lifecycle_publishes_real_filters() {
        let sink = Arc::new(RecordingSink::default());
        let mut h = helper(Arc::clone(&sink), negotiator(), 1);
        h.init(&[
            RuntimeFilterDesc::new(1, 0, RuntimeFilterType::In),
            RuntimeFilterDesc::new(2, 0, RuntimeFilterType::Bloom),
        ])
        .unwrap();
        let dep = Arc::new(CountedFinishDependency::new("rf_sync_size:single"));
        h.send_filter_size(3, &dep).unwrap();
        assert!(dep.is_ready());
        assert_eq!(h.state(), HelperState::SizingDone);
        h.build(&chunk(vec![4, 5, 6]), false, &SharedRuntimeFilters::new(), true)
            .unwrap();
        assert_eq!(h.state(), HelperState::Built);
        h.publish().unwrap();
        assert_eq!(h.state(), HelperState::Published);

        let payloads = sink.payloads();
        assert_eq!(payloads.len(), 2);
        for payload in payloads {
            let filter = decode_filter(&payload).unwrap();
            assert!(filter.may_contain(Some(&FilterValue::Int(5))));
        }
        assert!(h.producers().iter().all(|p| p.state() == ProducerState::Published));
        assert!(h.profile().counter_value("BuildTime").is_some());
        assert_eq!(h.profile().counter_value("RuntimeFilterNum"), Some(2));
    }

    #[test]
    fn local_count_over_ceiling_disables_everything() {
        let sink = Arc::new(RecordingSink::default());
        let mut h = helper(Arc::clone(&sink), negotiator(), 1);
        h.init(&[RuntimeFilterDesc::new(1, 0, RuntimeFilterType::MinMax)])
            .unwrap();
        let dep = Arc::new(CountedFinishDependency::new("rf_sync_size:big"));
        h.send_filter_size(5000, &dep).unwrap();
        h.build(&chunk(vec![1]), false, &SharedRuntimeFilters::new(), true)
            .unwrap();
        h.publish().unwrap();
        assert!(decode_filter(&sink.payloads()[0]).unwrap().is_disabled());
    }

    #[test]
    fn publish_before_build_is_invalid_state() {
        let sink = Arc::new(RecordingSink::default());
        let mut h = helper(sink, negotiator(), 1);
        h.init(&[RuntimeFilterDesc::new(1, 0, RuntimeFilterType::In)])
            .unwrap();
        assert!(matches!(h.publish(), Err(RuntimeFilterError::InvalidState(_))));
        assert!(matches!(
            h.build(&chunk(vec![1]), false, &SharedRuntimeFilters::new(), false),
            Err(RuntimeFilterError::InvalidState(_))
        ));
        h.terminate().unwrap();
    }

    #[test]
    fn terminate_publishes_each_filter_once() {
        let sink = Arc::new(RecordingSink::default());
        let mut h = helper(Arc::clone(&sink), negotiator(), 1);
        h.init(&[
            RuntimeFilterDesc::new(1, 0, RuntimeFilterType::In),
            RuntimeFilterDesc::new(2, 0, RuntimeFilterType::MinMax),
        ])
        .unwrap();
        h.terminate().unwrap();
        h.terminate().unwrap();
        assert_eq!(h.state(), HelperState::Terminated);
        let payloads = sink.payloads();
        assert_eq!(payloads.len(), 2);
        assert!(payloads.iter().all(|p| decode_filter(p).unwrap().is_disabled()));
        // Nothing after a terminal state publishes again.
        h.build(&chunk(vec![1]), false, &SharedRuntimeFilters::new(), true)
            .unwrap();
        assert_eq!(sink.payloads().len(), 2);
    }

    #[test]
    fn terminate_after_build_keeps_built_filters() {
        let sink = Arc::new(RecordingSink::default());
        let mut h = helper(Arc::clone(&sink), negotiator(), 1);
        h.init(&[RuntimeFilterDesc::new(1, 0, RuntimeFilterType::In)])
            .unwrap();
        let dep = Arc::new(CountedFinishDependency::new("rf_sync_size:built"));
        h.send_filter_size(1, &dep).unwrap();
        h.build(&chunk(vec![8]), false, &SharedRuntimeFilters::new(), true)
            .unwrap();
        h.terminate().unwrap();
        let filter = decode_filter(&sink.payloads()[0]).unwrap();
        assert!(!filter.is_disabled());
        assert!(filter.may_contain(Some(&FilterValue::Int(8))));
    }

    #[test]
    fn skip_publishes_disabled_without_round() {
        let sink = Arc::new(RecordingSink::default());
        let negotiator = negotiator();
        let mut h = helper(Arc::clone(&sink), Arc::clone(&negotiator), 3);
        h.init(&[RuntimeFilterDesc::new(1, 0, RuntimeFilterType::Bloom)])
            .unwrap();
        h.skip_process().unwrap();
        assert_eq!(h.state(), HelperState::Skipped);
        assert_eq!(negotiator.active_rounds(), 0);
        let dep = Arc::new(CountedFinishDependency::new("rf_sync_size:skip"));
        h.send_filter_size(10, &dep).unwrap();
        h.publish().unwrap();
        h.terminate().unwrap();
        assert_eq!(negotiator.active_rounds(), 0);
        assert_eq!(sink.payloads().len(), 1);
        assert!(decode_filter(&sink.payloads()[0]).unwrap().is_disabled());
    }

    #[test]
    fn delivery_failure_is_swallowed() {
        let sink = Arc::new(RecordingSink {
            requests: Mutex::new(Vec::new()),
            fail_delivery: true,
        });
        let mut h = helper(Arc::clone(&sink), negotiator(), 1);
        h.init(&[RuntimeFilterDesc::new(1, 0, RuntimeFilterType::MinMax)])
            .unwrap();
        h.skip_process().unwrap();
        assert_eq!(h.profile().counter_value("SinkDeliveryFailures"), Some(1));
        assert!(h.producers()[0].is_published());
    }

    #[test]
    fn bitmap_and_duplicate_ids_fail_init() {
        let sink = Arc::new(RecordingSink::default());
        let mut h = helper(Arc::clone(&sink), negotiator(), 1);
        assert!(matches!(
            h.init(&[RuntimeFilterDesc::new(1, 0, RuntimeFilterType::Bitmap)]),
            Err(RuntimeFilterError::Config(_))
        ));
        assert!(matches!(
            h.init(&[
                RuntimeFilterDesc::new(1, 0, RuntimeFilterType::In),
                RuntimeFilterDesc::new(1, 0, RuntimeFilterType::MinMax),
            ]),
            Err(RuntimeFilterError::Config(_))
        ));
        assert!(h.producers().is_empty());
    }

    #[test]
    fn wrong_key_column_disables_only_that_filter() {
        let sink = Arc::new(RecordingSink::default());
        let mut h = helper(Arc::clone(&sink), negotiator(), 1);
        h.init(&[
            RuntimeFilterDesc::new(1, 0, RuntimeFilterType::In),
            RuntimeFilterDesc::new(2, 5, RuntimeFilterType::In),
        ])
        .unwrap();
        let dep = Arc::new(CountedFinishDependency::new("rf_sync_size:column"));
        h.send_filter_size(1, &dep).unwrap();
        h.build(&chunk(vec![1]), false, &SharedRuntimeFilters::new(), true)
            .unwrap();
        assert_eq!(h.producers()[0].state(), ProducerState::Accumulating);
        assert_eq!(
            h.producers()[1].disable_reason(),
            Some(DisableReason::ConfigRejected)
        );
        h.publish().unwrap();
        assert_eq!(h.profile().counter_value("DisabledRuntimeFilterNum"), Some(1));
    }
}
