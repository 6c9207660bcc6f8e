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
use std::env;
use std::process;
use std::sync::Arc;
use std::thread;

use arrow::array::{Int64Array, RecordBatch};
use arrow::datatypes::{DataType, Field, Schema, SchemaRef};
use bytes::Bytes;

use novarocks_rf::common::app_config::NovaRocksRfConfig;
use novarocks_rf::exec::chunk::Chunk;
use novarocks_rf::exec::pipeline::dependency::{CountedFinishDependency, DependencyManager};
use novarocks_rf::exec::runtime_filter::{
    FilterTarget, FilterValue, RuntimeFilterContext, RuntimeFilterDesc, RuntimeFilterOptions,
    RuntimeFilterProducerHelper, RuntimeFilterType, SharedRuntimeFilters,
};
use novarocks_rf::novarocks_config;
use novarocks_rf::novarocks_logging::{self, error, info, warn};
use novarocks_rf::runtime::profile::RuntimeProfile;
use novarocks_rf::runtime::runtime_filter_hub::{RemoteFilterTransport, RuntimeFilterHub};
use novarocks_rf::runtime::size_negotiator::SizeNegotiator;
use novarocks_rf::{InstanceId, PublishSink, UniqueId};

const JOIN_NODE_ID: i32 = 1;
const CHUNK_ROWS: usize = 1024;

/// Delivers "remote" filters into a second in-process hub.
struct LoopbackTransport {
    remote: Arc<RuntimeFilterHub>,
}

impl RemoteFilterTransport for LoopbackTransport {
    fn send(&self, target: &FilterTarget, filter_id: i32, payload: &Bytes) -> Result<(), String> {
        info!(
            "loopback deliver: filter_id={} target={} bytes={}",
            filter_id,
            target,
            payload.len()
        );
        self.remote
            .receive_remote_filter(filter_id, payload)
            .map_err(|e| e.to_string())
    }
}

struct SimulatorArgs {
    config_path: Option<String>,
    instances: Option<u32>,
    rows_per_instance: Option<usize>,
    broadcast: Option<bool>,
}

fn parse_args() -> SimulatorArgs {
    let args: Vec<String> = env::args().collect();
    let mut parsed = SimulatorArgs {
        config_path: None,
        instances: None,
        rows_per_instance: None,
        broadcast: None,
    };
    let mut idx = 1usize;
    while let Some(arg) = args.get(idx) {
        match arg.as_str() {
            "--config" | "-c" => {
                idx += 1;
                parsed.config_path = args.get(idx).cloned();
                if parsed.config_path.is_none() {
                    eprintln!("missing value for --config/-c");
                    process::exit(1);
                }
            }
            "--instances" | "-n" => {
                idx += 1;
                parsed.instances = Some(parse_value(args.get(idx), "--instances"));
            }
            "--rows" => {
                idx += 1;
                parsed.rows_per_instance = Some(parse_value(args.get(idx), "--rows"));
            }
            "--broadcast" => parsed.broadcast = Some(true),
            "--help" | "-h" => {
                eprintln!(
                    "Usage: novarocks-rf [--config <path>] [--instances <n>] [--rows <n>] [--broadcast]"
                );
                eprintln!("  Runs one hash join build side with <n> parallel instances and");
                eprintln!("  reports the runtime filters each probe side would receive.");
                process::exit(0);
            }
            other => {
                eprintln!("unknown arg: {other} (try --help)");
                process::exit(1);
            }
        }
        idx += 1;
    }
    parsed
}

fn parse_value<T: std::str::FromStr>(raw: Option<&String>, flag: &str) -> T {
    match raw.map(|s| s.parse::<T>()) {
        Some(Ok(v)) => v,
        _ => {
            eprintln!("invalid or missing value for {flag}");
            process::exit(1);
        }
    }
}

fn load_config(path: Option<&str>) -> NovaRocksRfConfig {
    match path {
        Some(p) => match novarocks_config::init_from_path(p) {
            Ok(cfg) => cfg.clone(),
            Err(e) => {
                eprintln!("load config {p} failed: {e:#}");
                process::exit(1);
            }
        },
        None => novarocks_config::init_from_env_or_default()
            .map(|cfg| cfg.clone())
            .unwrap_or_default(),
    }
}

fn key_schema() -> SchemaRef {
    Arc::new(Schema::new(vec![Field::new("k", DataType::Int64, true)]))
}

// Instance i owns keys [i * rows, (i + 1) * rows); broadcast instances all see instance 0's keys.
fn build_chunks(
    schema: &SchemaRef,
    instance: u32,
    rows: usize,
    broadcast: bool,
) -> anyhow::Result<Vec<Chunk>> {
    let base = if broadcast { 0 } else { instance as i64 * rows as i64 };
    let keys: Vec<i64> = (0..rows as i64).map(|v| base + v).collect();
    let mut chunks = Vec::new();
    for part in keys.chunks(CHUNK_ROWS) {
        let batch = RecordBatch::try_new(
            Arc::clone(schema),
            vec![Arc::new(Int64Array::from(part.to_vec())) as _],
        )?;
        chunks.push(Chunk::new(batch));
    }
    if chunks.is_empty() {
        chunks.push(Chunk::empty(Arc::clone(schema)));
    }
    Ok(chunks)
}

fn descriptors() -> Vec<RuntimeFilterDesc> {
    vec![
        RuntimeFilterDesc::new(1, 0, RuntimeFilterType::In),
        RuntimeFilterDesc::new(2, 0, RuntimeFilterType::MinMax),
        RuntimeFilterDesc::new(3, 0, RuntimeFilterType::Bloom)
            .with_targets(vec![FilterTarget::new("127.0.0.1", 8060)]),
        RuntimeFilterDesc::new(4, 0, RuntimeFilterType::InOrBloom),
    ]
}

fn run_instance(
    ctx: RuntimeFilterContext,
    profile: &RuntimeProfile,
    chunks: Vec<Chunk>,
    broadcast: bool,
    shared: &SharedRuntimeFilters,
) -> anyhow::Result<()> {
    let instance = ctx.instance_id;
    let mut helper = RuntimeFilterProducerHelper::new(profile, true, broadcast, ctx);
    let result = (|| -> anyhow::Result<()> {
        helper.init(&descriptors())?;
        let rows: u64 = chunks.iter().map(|c| c.len() as u64).sum();
        let dep = Arc::new(CountedFinishDependency::new(format!(
            "rf_sync_size:{}",
            instance
        )));
        helper.send_filter_size(rows, &dep)?;
        helper.wait_filter_size(None)?;
        let last = chunks.len().saturating_sub(1);
        for (idx, chunk) in chunks.iter().enumerate() {
            helper.build(chunk, false, shared, idx == last)?;
        }
        helper.publish()?;
        Ok(())
    })();
    if let Err(e) = &result {
        error!("instance {} failed, terminating: {:#}", instance, e);
        helper.terminate()?;
    }
    result
}

fn main() {
    let args = parse_args();
    let mut cfg = load_config(args.config_path.as_deref());
    if let Some(n) = args.instances {
        cfg.simulator.instances = n;
    }
    if let Some(rows) = args.rows_per_instance {
        cfg.simulator.rows_per_instance = rows;
    }
    if let Some(b) = args.broadcast {
        cfg.simulator.broadcast = b;
    }

    let filter = cfg.log_filter.clone().unwrap_or_else(|| {
        match cfg.log_level.as_str() {
            "debug" => "info,novarocks_rf=debug".to_string(),
            "trace" => "info,novarocks_rf=trace".to_string(),
            other => other.to_string(),
        }
    });
    novarocks_logging::init_with_level(&filter);

    let sim = cfg.simulator.clone();
    if sim.instances == 0 {
        eprintln!("simulator.instances must be positive");
        process::exit(1);
    }
    let options = RuntimeFilterOptions {
        max_in_conditions: cfg.runtime_filter.max_in_conditions,
        max_filter_bytes: cfg.runtime_filter.max_filter_bytes,
        sync_size_timeout: std::time::Duration::from_millis(
            cfg.runtime_filter.sync_size_timeout_ms,
        ),
        bloom_filter_default_size: cfg.runtime_filter.bloom_filter_default_size,
    };
    let negotiator = Arc::new(SizeNegotiator::new(
        cfg.runtime_filter.max_filter_rows,
        std::time::Duration::from_millis(cfg.runtime_filter.round_gc_ms),
    ));
    let remote_hub = Arc::new(RuntimeFilterHub::new(DependencyManager::new()));
    let hub = Arc::new(
        RuntimeFilterHub::new(DependencyManager::new())
            .with_transport(Arc::new(LoopbackTransport {
                remote: Arc::clone(&remote_hub),
            }))
            .with_max_filter_bytes(cfg.runtime_filter.max_filter_bytes),
    );
    let probes: Vec<_> = descriptors()
        .iter()
        .map(|d| hub.register_probe(d.filter_id))
        .collect();

    info!(
        "runtime filter simulation: instances={} rows_per_instance={} broadcast={}",
        sim.instances, sim.rows_per_instance, sim.broadcast
    );
    let root = RuntimeProfile::new("HASH_JOIN_BUILD");
    let shared = Arc::new(SharedRuntimeFilters::new());
    let schema = key_schema();
    let query_id = UniqueId::new(0x5eed, 1);

    let mut handles = Vec::new();
    for i in 0..sim.instances {
        let chunks = match build_chunks(&schema, i, sim.rows_per_instance, sim.broadcast) {
            Ok(c) => c,
            Err(e) => {
                eprintln!("build input for instance {i} failed: {e:#}");
                process::exit(1);
            }
        };
        let ctx = RuntimeFilterContext {
            query_id,
            join_node_id: JOIN_NODE_ID,
            instance_id: InstanceId(i),
            expected_instances: sim.instances as usize,
            negotiator: Arc::clone(&negotiator),
            sink: Arc::clone(&hub) as Arc<dyn PublishSink>,
            options: options.clone(),
        };
        let profile = root.child(format!("instance_{}", i));
        let shared = Arc::clone(&shared);
        let broadcast = sim.broadcast;
        let spawned = thread::Builder::new()
            .name(format!("rf-build-{}", i))
            .spawn(move || run_instance(ctx, &profile, chunks, broadcast, &shared));
        match spawned {
            Ok(h) => handles.push(h),
            Err(e) => {
                eprintln!("spawn build instance {i} failed: {e}");
                process::exit(1);
            }
        }
    }

    let mut failed = 0usize;
    for handle in handles {
        match handle.join() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!("build instance failed: {:#}", e);
                failed += 1;
            }
            Err(_) => {
                error!("build instance panicked");
                failed += 1;
            }
        }
    }

    let probe_key = FilterValue::Int(sim.rows_per_instance as i64 / 2);
    for probe in &probes {
        match probe.filter() {
            Some(filter) => println!(
                "filter {}: type={} disabled={} size_hint={} bytes={} contains({:?})={}",
                probe.filter_id(),
                filter.filter_type(),
                filter.is_disabled(),
                filter.size_hint(),
                filter.estimated_bytes(),
                probe_key,
                filter.may_contain(Some(&probe_key))
            ),
            None => println!("filter {}: not published", probe.filter_id()),
        }
    }
    for desc in descriptors().iter().filter(|d| d.has_remote_targets) {
        println!(
            "remote filter {}: deliveries={}",
            desc.filter_id,
            remote_hub.publish_count(desc.filter_id)
        );
    }
    println!("{}", root.pretty_print());
    println!("size rounds still active: {}", negotiator.active_rounds());
    if failed > 0 {
        process::exit(1);
    }
}
