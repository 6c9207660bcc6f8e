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
//! Integration tests for the runtime-filter producer helper across parallel build instances.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::common::{HelperFixture, RecordingSink, TestConfig, int_chunk, run_with_timeout};
use novarocks_rf::exec::pipeline::dependency::{CountedFinishDependency, DependencyManager};
use novarocks_rf::exec::runtime_filter::{
    DisableReason, FilterProducer, FilterValue, HelperState, ProducerState, RuntimeFilterDesc,
    RuntimeFilterProducerHelper, RuntimeFilterType, SharedRuntimeFilters, decode_filter,
};
use novarocks_rf::runtime::runtime_filter_hub::{PublishSink, RuntimeFilterHub};
use novarocks_rf::runtime::size_negotiator::AbandonReason;

mod common;

const BLOOM_ID: i32 = 10;
const MIN_MAX_ID: i32 = 11;
const IN_ID: i32 = 12;

fn sized_descs() -> Vec<RuntimeFilterDesc> {
    vec![
        RuntimeFilterDesc::new(BLOOM_ID, 0, RuntimeFilterType::Bloom),
        RuntimeFilterDesc::new(MIN_MAX_ID, 0, RuntimeFilterType::MinMax),
    ]
}

fn keys_for(instance: u32, rows: u64) -> Vec<i64> {
    let base = instance as i64 * 1000;
    (0..rows as i64).map(|v| base + v).collect()
}

fn sync_size(helper: &mut RuntimeFilterProducerHelper, rows: u64, name: &str) {
    let dep = Arc::new(CountedFinishDependency::new(format!("rf_sync_size:{}", name)));
    helper.send_filter_size(rows, &dep).unwrap();
    helper.wait_filter_size(None).unwrap();
    assert!(dep.is_ready());
}

#[test]
fn test_partitioned_instances_agree_on_summed_size() {
    TestConfig::default().init_logging();
    let hub = Arc::new(RuntimeFilterHub::new(DependencyManager::new()));
    let fixture = HelperFixture::new(
        "partitioned_sum",
        3,
        1000,
        Arc::clone(&hub) as Arc<dyn PublishSink>,
        Duration::from_secs(5),
    );
    let bloom_probe = hub.register_probe(BLOOM_ID);
    let rows = [100u64, 250, 150];
    let mut helpers: Vec<_> = (0..3).map(|i| fixture.helper(i, true, false)).collect();
    for helper in &mut helpers {
        helper.init(&sized_descs()).unwrap();
    }

    thread::scope(|s| {
        for (i, helper) in helpers.iter_mut().enumerate() {
            let rows = rows[i];
            s.spawn(move || {
                sync_size(helper, rows, &format!("partitioned_{}", i));
                assert_eq!(helper.synced_size(), Some(500));
                let shared = SharedRuntimeFilters::new();
                helper
                    .build(&int_chunk(keys_for(i as u32, rows)), false, &shared, true)
                    .unwrap();
                helper.publish().unwrap();
            });
        }
    });

    assert!(helpers.iter().all(|h| h.state() == HelperState::Published));
    assert_eq!(fixture.negotiator.active_rounds(), 0);
    assert_eq!(hub.publish_count(BLOOM_ID), 1);
    assert_eq!(hub.pending_partials(BLOOM_ID), 0);
    assert!(bloom_probe.is_ready());

    let bloom = bloom_probe.filter().unwrap();
    assert!(!bloom.is_disabled());
    assert_eq!(bloom.size_hint(), 500);
    for i in 0..3u32 {
        for key in keys_for(i, rows[i as usize]) {
            assert!(bloom.may_contain(Some(&FilterValue::Int(key))));
        }
    }

    let min_max = decode_filter(&hub.final_payload(MIN_MAX_ID).unwrap()).unwrap();
    assert!(min_max.may_contain(Some(&FilterValue::Int(0))));
    assert!(min_max.may_contain(Some(&FilterValue::Int(2149))));
    assert!(!min_max.may_contain(Some(&FilterValue::Int(2150))));
}

#[test]
fn test_summed_size_over_ceiling_disables_every_instance() {
    let sink = Arc::new(RecordingSink::default());
    let fixture = HelperFixture::new(
        "over_ceiling",
        2,
        1000,
        Arc::clone(&sink) as Arc<dyn PublishSink>,
        Duration::from_secs(5),
    );
    let mut helpers: Vec<_> = (0..2).map(|i| fixture.helper(i, true, true)).collect();
    for helper in &mut helpers {
        helper.init(&sized_descs()).unwrap();
    }
    thread::scope(|s| {
        for (i, helper) in helpers.iter_mut().enumerate() {
            s.spawn(move || {
                sync_size(helper, 600, &format!("over_ceiling_{}", i));
                let shared = SharedRuntimeFilters::new();
                helper
                    .build(&int_chunk(keys_for(i as u32, 600)), false, &shared, true)
                    .unwrap();
                helper.publish().unwrap();
            });
        }
    });

    assert_eq!(sink.count(), 4);
    for request in sink.requests() {
        assert!(decode_filter(&request.payload).unwrap().is_disabled());
    }
    for helper in &helpers {
        assert_eq!(helper.synced_size(), None);
        assert!(helper.producers().iter().all(|p| {
            p.disable_reason() == Some(DisableReason::SizeAbandoned(AbandonReason::ExceedsCeiling))
        }));
    }
    assert_eq!(fixture.negotiator.active_rounds(), 0);
}

#[test]
fn test_silent_instance_times_out_round() {
    let hub = Arc::new(RuntimeFilterHub::new(DependencyManager::new()));
    let fixture = HelperFixture::new(
        "silent_instance",
        2,
        1000,
        Arc::clone(&hub) as Arc<dyn PublishSink>,
        Duration::from_millis(100),
    );
    let probe = hub.register_probe(BLOOM_ID);
    let mut reporter = fixture.helper(0, true, false);
    let mut silent = fixture.helper(1, true, false);
    reporter.init(&sized_descs()).unwrap();
    silent.init(&sized_descs()).unwrap();

    let mut reporter = run_with_timeout(Duration::from_secs(5), move || {
        sync_size(&mut reporter, 900, "silent_reporter");
        reporter
    });
    assert_eq!(reporter.state(), HelperState::SizingDone);
    assert_eq!(
        reporter.producers()[0].disable_reason(),
        Some(DisableReason::SizeAbandoned(AbandonReason::Timeout))
    );
    reporter
        .build(&int_chunk(keys_for(0, 900)), false, &SharedRuntimeFilters::new(), true)
        .unwrap();
    reporter.publish().unwrap();
    assert!(!probe.is_ready());

    silent.terminate().unwrap();
    assert_eq!(silent.state(), HelperState::Terminated);
    assert!(probe.is_ready());
    assert!(probe.filter().unwrap().is_disabled());
    assert!(decode_filter(&hub.final_payload(MIN_MAX_ID).unwrap()).unwrap().is_disabled());
    assert_eq!(fixture.negotiator.active_rounds(), 0);
}

#[test]
fn test_skip_abandons_sibling_round() {
    let sink = Arc::new(RecordingSink::default());
    let fixture = HelperFixture::new(
        "skip_sibling",
        2,
        1000,
        Arc::clone(&sink) as Arc<dyn PublishSink>,
        Duration::from_secs(30),
    );
    let mut waiting = fixture.helper(0, true, true);
    let mut skipping = fixture.helper(1, true, true);
    waiting.init(&sized_descs()).unwrap();
    skipping.init(&sized_descs()).unwrap();

    let dep = Arc::new(CountedFinishDependency::new("rf_sync_size:skip_sibling"));
    waiting.send_filter_size(10, &dep).unwrap();
    assert_eq!(waiting.state(), HelperState::SizePending);
    assert!(!dep.is_ready());
    assert!(!waiting.poll_filter_size().unwrap());

    skipping.skip_process().unwrap();
    assert_eq!(skipping.state(), HelperState::Skipped);
    assert!(dep.is_ready());
    assert!(waiting.poll_filter_size().unwrap());
    assert_eq!(
        waiting.producers()[0].disable_reason(),
        Some(DisableReason::SizeAbandoned(AbandonReason::ParticipantSkipped))
    );
    assert_eq!(fixture.negotiator.active_rounds(), 0);

    waiting
        .build(&int_chunk([1, 2, 3]), false, &SharedRuntimeFilters::new(), true)
        .unwrap();
    waiting.publish().unwrap();
    assert_eq!(sink.count(), 4);
    assert!(
        sink.requests()
            .iter()
            .all(|r| decode_filter(&r.payload).unwrap().is_disabled())
    );
}

#[test]
fn test_skip_before_any_report_creates_no_round() {
    let sink = Arc::new(RecordingSink::default());
    let fixture = HelperFixture::new(
        "skip_first",
        3,
        1000,
        Arc::clone(&sink) as Arc<dyn PublishSink>,
        Duration::from_secs(30),
    );
    let mut helper = fixture.helper(0, true, true);
    helper.init(&sized_descs()).unwrap();
    helper.skip_process().unwrap();
    assert_eq!(fixture.negotiator.active_rounds(), 0);
    assert_eq!(sink.count(), 2);
    assert!(
        helper
            .producers()
            .iter()
            .all(|p| p.disable_reason() == Some(DisableReason::Skipped))
    );
}

#[test]
fn test_skip_before_sibling_report_releases_sibling_at_once() {
    let sink = Arc::new(RecordingSink::default());
    let fixture = HelperFixture::new(
        "skip_then_report",
        2,
        1000,
        Arc::clone(&sink) as Arc<dyn PublishSink>,
        Duration::from_secs(30),
    );
    let mut skipping = fixture.helper(0, true, true);
    let mut reporting = fixture.helper(1, true, true);
    skipping.init(&sized_descs()).unwrap();
    reporting.init(&sized_descs()).unwrap();

    skipping.skip_process().unwrap();
    assert_eq!(fixture.negotiator.active_rounds(), 0);

    let dep = Arc::new(CountedFinishDependency::new("rf_sync_size:skip_then_report"));
    reporting.send_filter_size(5, &dep).unwrap();
    assert!(dep.is_ready());
    assert_eq!(reporting.state(), HelperState::SizingDone);
    assert_eq!(
        reporting.producers()[0].disable_reason(),
        Some(DisableReason::SizeAbandoned(AbandonReason::ParticipantSkipped))
    );
    assert_eq!(fixture.negotiator.active_rounds(), 0);
    assert_eq!(fixture.negotiator.skip_markers(), 0);

    reporting
        .build(&int_chunk([1, 2, 3]), false, &SharedRuntimeFilters::new(), true)
        .unwrap();
    reporting.publish().unwrap();
    assert_eq!(sink.count(), 4);
    assert!(
        sink.requests()
            .iter()
            .all(|r| decode_filter(&r.payload).unwrap().is_disabled())
    );
}

fn drive_to(helper: &mut RuntimeFilterProducerHelper, target: HelperState) {
    helper
        .init(&[
            RuntimeFilterDesc::new(1, 0, RuntimeFilterType::In),
            RuntimeFilterDesc::new(2, 0, RuntimeFilterType::MinMax),
        ])
        .unwrap();
    if target == HelperState::Init {
        return;
    }
    let dep = Arc::new(CountedFinishDependency::new("rf_sync_size:drive"));
    helper.send_filter_size(4, &dep).unwrap();
    if target == HelperState::SizingDone {
        return;
    }
    let shared = SharedRuntimeFilters::new();
    helper.build(&int_chunk([1, 2]), false, &shared, false).unwrap();
    if target == HelperState::Building {
        return;
    }
    helper.build(&int_chunk([3, 4]), false, &shared, true).unwrap();
    if target == HelperState::Built {
        return;
    }
    helper.publish().unwrap();
}

#[test]
fn test_terminate_publishes_each_filter_exactly_once() {
    for target in [
        HelperState::Init,
        HelperState::SizingDone,
        HelperState::Building,
        HelperState::Built,
        HelperState::Published,
    ] {
        let sink = Arc::new(RecordingSink::default());
        let fixture = HelperFixture::new(
            "terminate_once",
            1,
            1000,
            Arc::clone(&sink) as Arc<dyn PublishSink>,
            Duration::from_secs(1),
        );
        let mut helper = fixture.helper(0, true, true);
        drive_to(&mut helper, target);
        assert_eq!(helper.state(), target);
        helper.terminate().unwrap();
        helper.terminate().unwrap();
        assert!(helper.state() == HelperState::Terminated || target == HelperState::Published);
        assert_eq!(sink.count_for(1), 1, "target {:?}", target);
        assert_eq!(sink.count_for(2), 1, "target {:?}", target);

        let built = matches!(target, HelperState::Built | HelperState::Published);
        for request in sink.requests() {
            let filter = decode_filter(&request.payload).unwrap();
            assert_eq!(filter.is_disabled(), !built, "target {:?}", target);
        }
        assert!(
            helper
                .producers()
                .iter()
                .all(|p| p.is_published() && p.state() != ProducerState::Accumulating)
        );
    }
}

#[test]
fn test_terminate_while_size_pending_releases_siblings() {
    let sink = Arc::new(RecordingSink::default());
    let fixture = HelperFixture::new(
        "terminate_pending",
        2,
        1000,
        Arc::clone(&sink) as Arc<dyn PublishSink>,
        Duration::from_secs(30),
    );
    let mut pending = fixture.helper(0, true, true);
    let mut sibling = fixture.helper(1, true, true);
    pending.init(&sized_descs()).unwrap();
    sibling.init(&sized_descs()).unwrap();

    let dep = Arc::new(CountedFinishDependency::new("rf_sync_size:terminate_pending"));
    pending.send_filter_size(5, &dep).unwrap();
    pending.terminate().unwrap();
    assert!(dep.is_ready());
    assert_eq!(sink.count(), 2);

    let sibling_dep = Arc::new(CountedFinishDependency::new("rf_sync_size:sibling"));
    sibling.send_filter_size(5, &sibling_dep).unwrap();
    assert!(sibling.poll_filter_size().unwrap());
    assert_eq!(sibling.synced_size(), None);
    sibling
        .build(&int_chunk([1]), false, &SharedRuntimeFilters::new(), true)
        .unwrap();
    sibling.publish().unwrap();
    assert_eq!(sink.count(), 4);
    assert_eq!(fixture.negotiator.active_rounds(), 0);
}

#[test]
fn test_broadcast_keeps_one_copy_per_instance() {
    let hub = Arc::new(RuntimeFilterHub::new(DependencyManager::new()));
    let fixture = HelperFixture::new(
        "broadcast_copies",
        3,
        10_000,
        Arc::clone(&hub) as Arc<dyn PublishSink>,
        Duration::from_secs(5),
    );
    let mut helpers: Vec<_> = (0..3).map(|i| fixture.helper(i, true, true)).collect();
    for helper in &mut helpers {
        helper.init(&sized_descs()).unwrap();
    }
    thread::scope(|s| {
        for (i, helper) in helpers.iter_mut().enumerate() {
            s.spawn(move || {
                sync_size(helper, 64, &format!("broadcast_{}", i));
                let shared = SharedRuntimeFilters::new();
                helper
                    .build(&int_chunk(keys_for(0, 64)), false, &shared, true)
                    .unwrap();
                helper.publish().unwrap();
            });
        }
    });

    let copies = hub.copies(BLOOM_ID);
    assert_eq!(copies.len(), 3);
    assert_eq!(hub.publish_count(BLOOM_ID), 3);
    assert!(hub.final_payload(BLOOM_ID).is_none());
    for (_, payload) in copies {
        let filter = decode_filter(&payload).unwrap();
        assert_eq!(filter.size_hint(), 192);
        assert!(filter.may_contain(Some(&FilterValue::Int(63))));
    }
}

#[test]
fn test_shared_table_instances_adopt_builder_filters() {
    let sink = Arc::new(RecordingSink::default());
    let fixture = HelperFixture::new(
        "shared_table",
        3,
        1000,
        Arc::clone(&sink) as Arc<dyn PublishSink>,
        Duration::from_secs(5),
    );
    let mut helpers: Vec<_> = (0..3).map(|i| fixture.helper(i, i == 0, true)).collect();
    for helper in &mut helpers {
        helper
            .init(&[
                RuntimeFilterDesc::new(BLOOM_ID, 0, RuntimeFilterType::Bloom),
                RuntimeFilterDesc::new(IN_ID, 0, RuntimeFilterType::In),
            ])
            .unwrap();
    }
    thread::scope(|s| {
        for (i, helper) in helpers.iter_mut().enumerate() {
            s.spawn(move || sync_size(helper, 40, &format!("shared_{}", i)));
        }
    });
    // Only the builder's estimate counts.
    assert!(helpers.iter().all(|h| h.synced_size() == Some(40)));

    let shared = SharedRuntimeFilters::new();
    let keys = keys_for(0, 40);
    for helper in &mut helpers {
        helper.build(&int_chunk(keys.clone()), true, &shared, true).unwrap();
        helper.publish().unwrap();
    }
    assert_eq!(shared.len(), 2);
    assert_eq!(sink.count(), 6);
    let payloads: Vec<_> = sink
        .requests()
        .into_iter()
        .filter(|r| r.filter_id == IN_ID)
        .map(|r| r.payload)
        .collect();
    assert_eq!(payloads.len(), 3);
    assert!(payloads.windows(2).all(|w| w[0] == w[1]));
    let in_filter = decode_filter(&payloads[0]).unwrap();
    assert!(!in_filter.is_disabled());
    assert!(in_filter.may_contain(Some(&FilterValue::Int(39))));
    assert!(!in_filter.may_contain(Some(&FilterValue::Int(40))));
    assert!(helpers[1].producers().iter().all(|p| p.inserted_rows() == 0));
}

#[test]
fn test_non_builder_without_shared_table_publishes_disabled() {
    let sink = Arc::new(RecordingSink::default());
    let fixture = HelperFixture::new(
        "non_builder",
        1,
        1000,
        Arc::clone(&sink) as Arc<dyn PublishSink>,
        Duration::from_secs(1),
    );
    let mut helper = fixture.helper(0, false, true);
    helper.init(&sized_descs()).unwrap();
    let dep = Arc::new(CountedFinishDependency::new("rf_sync_size:non_builder"));
    helper.send_filter_size(77, &dep).unwrap();
    assert_eq!(helper.synced_size(), Some(0));
    helper
        .build(&int_chunk([1, 2, 3]), false, &SharedRuntimeFilters::new(), true)
        .unwrap();
    helper.publish().unwrap();
    assert!(
        helper
            .producers()
            .iter()
            .all(|p| p.disable_reason() == Some(DisableReason::SharedFilterMissing))
    );
    assert_eq!(sink.count(), 2);
}

#[test]
fn test_config_file_drives_helper_options() {
    let config = TestConfig::default();
    let cfg = config.load_config().unwrap();
    assert_eq!(cfg.runtime_filter.max_filter_rows, 1000);
    assert_eq!(cfg.runtime_filter.sync_size_timeout_ms, 200);
    assert_eq!(cfg.simulator.instances, 3);
    assert_eq!(cfg.log_filter_or_level(), "debug");
}
