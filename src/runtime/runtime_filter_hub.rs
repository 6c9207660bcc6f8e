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
//! Runtime-filter publish sink and consumer registry.
//!
//! Responsibilities:
//! - Accepts finalized producer payloads (`PublishSink`).
//! - Broadcast joins keep one independent copy per producing instance; shared joins merge
//!   partials through `RuntimeFilterWorker` into one final filter per descriptor.
//! - Wakes local probes and forwards filters to remote consumers.
//!
//! Key exported interfaces:
//! - Traits: `PublishSink`, `RemoteFilterTransport`.
//! - Types: `PublishRequest`, `PublishMode`, `RuntimeFilterHub`, `RuntimeFilterProbe`.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use bytes::Bytes;

use crate::common::ids::InstanceId;
use crate::exec::pipeline::dependency::{DependencyHandle, DependencyManager};
use crate::exec::runtime_filter::{
    FilterTarget, Result, RuntimeFilter, RuntimeFilterError, decode_filter,
};
use crate::novarocks_logging::{debug, warn};
use crate::runtime::runtime_filter_worker::RuntimeFilterWorker;

/// How the sink combines payloads of one descriptor across build instances.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PublishMode {
    /// Every instance built the full filter; each copy is delivered as is.
    Broadcast,
    /// Each instance built a partial; consumers see the union once all arrived.
    Merge { expected_builders: usize },
}

#[derive(Clone, Debug)]
pub struct PublishRequest {
    pub filter_id: i32,
    pub instance_id: InstanceId,
    pub payload: Bytes,
    pub targets: Vec<FilterTarget>,
    pub mode: PublishMode,
}

/// Destination for finalized runtime filters.
pub trait PublishSink: Send + Sync {
    fn publish(&self, request: PublishRequest) -> Result<()>;
}

/// Delivery of a filter payload to one remote consumer.
pub trait RemoteFilterTransport: Send + Sync {
    fn send(
        &self,
        target: &FilterTarget,
        filter_id: i32,
        payload: &Bytes,
    ) -> std::result::Result<(), String>;
}

struct FilterEntry {
    dep: DependencyHandle,
    published: RwLock<Option<Arc<RuntimeFilter>>>,
    copies: Mutex<BTreeMap<InstanceId, Bytes>>,
    final_payload: Mutex<Option<Bytes>>,
    publish_count: AtomicU64,
}

pub struct RuntimeFilterHub {
    dep_manager: DependencyManager,
    worker: RuntimeFilterWorker,
    transport: Option<Arc<dyn RemoteFilterTransport>>,
    probe_wait_timeout: Option<Duration>,
    entries: Mutex<HashMap<i32, Arc<FilterEntry>>>,
}

impl RuntimeFilterHub {
    pub fn new(dep_manager: DependencyManager) -> Self {
        Self {
            dep_manager,
            worker: RuntimeFilterWorker::new(None),
            transport: None,
            probe_wait_timeout: None,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_transport(mut self, transport: Arc<dyn RemoteFilterTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Merged filters encoding larger than `max_filter_bytes` are published disabled.
    pub fn with_max_filter_bytes(mut self, max_filter_bytes: u64) -> Self {
        self.worker = RuntimeFilterWorker::new(Some(max_filter_bytes));
        self
    }

    /// Probes stop waiting for an unpublished filter after `timeout`.
    pub fn with_probe_wait_timeout(mut self, timeout: Duration) -> Self {
        self.probe_wait_timeout = Some(timeout);
        self
    }

    fn entry(&self, filter_id: i32) -> Arc<FilterEntry> {
        let mut guard = self.entries.lock().expect("runtime filter hub lock");
        guard
            .entry(filter_id)
            .or_insert_with(|| {
                Arc::new(FilterEntry {
                    dep: self
                        .dep_manager
                        .get_or_create(format!("runtime_filter:{}", filter_id)),
                    published: RwLock::new(None),
                    copies: Mutex::new(BTreeMap::new()),
                    final_payload: Mutex::new(None),
                    publish_count: AtomicU64::new(0),
                })
            })
            .clone()
    }

    pub fn register_probe(&self, filter_id: i32) -> RuntimeFilterProbe {
        RuntimeFilterProbe {
            filter_id,
            entry: self.entry(filter_id),
            wait_timeout: self.probe_wait_timeout,
            wait_start: Mutex::new(None),
            timeout_armed: AtomicBool::new(false),
        }
    }

    /// Broadcast copies received so far, ordered by instance.
    pub fn copies(&self, filter_id: i32) -> Vec<(InstanceId, Bytes)> {
        let entry = self.entry(filter_id);
        let guard = entry.copies.lock().expect("runtime filter copies lock");
        guard.iter().map(|(k, v)| (*k, v.clone())).collect()
    }

    /// Final merged payload of a shared join filter.
    pub fn final_payload(&self, filter_id: i32) -> Option<Bytes> {
        let entry = self.entry(filter_id);
        let guard = entry
            .final_payload
            .lock()
            .expect("runtime filter final payload lock");
        guard.clone()
    }

    /// Number of filters made visible to consumers for `filter_id`.
    pub fn publish_count(&self, filter_id: i32) -> u64 {
        self.entry(filter_id).publish_count.load(Ordering::Acquire)
    }

    pub fn pending_partials(&self, filter_id: i32) -> usize {
        self.worker.pending_partials(filter_id)
    }

    /// Install a filter forwarded by a remote producer.
    pub fn receive_remote_filter(&self, filter_id: i32, data: &[u8]) -> Result<()> {
        let filter = decode_filter(data)?;
        debug!(
            "runtime filter received remote: filter_id={} type={} disabled={} bytes={}",
            filter_id,
            filter.filter_type(),
            filter.is_disabled(),
            data.len()
        );
        self.install(filter_id, filter);
        Ok(())
    }

    fn install(&self, filter_id: i32, filter: RuntimeFilter) {
        let entry = self.entry(filter_id);
        {
            let mut guard = entry
                .published
                .write()
                .expect("runtime filter published lock");
            *guard = Some(Arc::new(filter));
        }
        entry.publish_count.fetch_add(1, Ordering::AcqRel);
        entry.dep.set_ready();
    }

    fn forward(&self, filter_id: i32, targets: &[FilterTarget], payload: &Bytes) -> Result<()> {
        if targets.is_empty() {
            return Ok(());
        }
        let Some(transport) = self.transport.as_ref() else {
            debug!(
                "runtime filter has remote targets but no transport: filter_id={} targets={}",
                filter_id,
                targets.len()
            );
            return Ok(());
        };
        let unique: BTreeSet<&FilterTarget> = targets.iter().collect();
        let mut failures = Vec::new();
        for target in unique {
            if let Err(e) = transport.send(target, filter_id, payload) {
                warn!(
                    "runtime filter send failed: filter_id={} target={} error={}",
                    filter_id, target, e
                );
                failures.push(format!("{}: {}", target, e));
            }
        }
        if failures.is_empty() {
            Ok(())
        } else {
            Err(RuntimeFilterError::SinkDelivery {
                filter_id,
                message: failures.join("; "),
            })
        }
    }
}

impl PublishSink for RuntimeFilterHub {
    fn publish(&self, request: PublishRequest) -> Result<()> {
        let PublishRequest {
            filter_id,
            instance_id,
            payload,
            targets,
            mode,
        } = request;
        match mode {
            PublishMode::Broadcast => {
                let filter = decode_filter(&payload)?;
                {
                    let entry = self.entry(filter_id);
                    let mut copies = entry.copies.lock().expect("runtime filter copies lock");
                    if copies.contains_key(&instance_id) {
                        warn!(
                            "runtime filter duplicate broadcast copy ignored: filter_id={} instance={}",
                            filter_id, instance_id
                        );
                        return Ok(());
                    }
                    copies.insert(instance_id, payload.clone());
                }
                self.install(filter_id, filter);
                self.forward(filter_id, &targets, &payload)
            }
            PublishMode::Merge { expected_builders } => {
                let Some(merged) = self.worker.receive_partial(
                    filter_id,
                    instance_id,
                    &payload,
                    expected_builders,
                )?
                else {
                    return Ok(());
                };
                let filter = decode_filter(&merged)?;
                {
                    let entry = self.entry(filter_id);
                    let mut guard = entry
                        .final_payload
                        .lock()
                        .expect("runtime filter final payload lock");
                    *guard = Some(merged.clone());
                }
                self.install(filter_id, filter);
                self.forward(filter_id, &targets, &merged)
            }
        }
    }
}

/// Consumer-side view of one runtime filter.
pub struct RuntimeFilterProbe {
    filter_id: i32,
    entry: Arc<FilterEntry>,
    wait_timeout: Option<Duration>,
    wait_start: Mutex<Option<Instant>>,
    timeout_armed: AtomicBool,
}

impl RuntimeFilterProbe {
    pub fn filter_id(&self) -> i32 {
        self.filter_id
    }

    pub fn dependency(&self) -> DependencyHandle {
        self.entry.dep.clone()
    }

    pub fn is_ready(&self) -> bool {
        self.entry.dep.is_ready()
    }

    /// Latest published filter, if any.
    pub fn filter(&self) -> Option<Arc<RuntimeFilter>> {
        self.entry
            .published
            .read()
            .expect("runtime filter published lock")
            .clone()
    }

    /// Dependency to park on, or `None` when the probe should run now. After the wait
    /// timeout the dependency is released so probes proceed unfiltered.
    pub fn dependency_or_timeout(&self) -> Option<DependencyHandle> {
        let dep = self.entry.dep.clone();
        if dep.is_ready() {
            return None;
        }
        let Some(timeout) = self.wait_timeout.filter(|t| !t.is_zero()) else {
            // No wait timeout configured: do not block on runtime filters.
            dep.set_ready();
            return None;
        };
        let mut guard = self.wait_start.lock().expect("runtime filter wait lock");
        let start = guard.get_or_insert_with(Instant::now);
        let elapsed = start.elapsed();
        if elapsed >= timeout {
            dep.set_ready();
            return None;
        }
        if !self.timeout_armed.swap(true, Ordering::AcqRel) {
            let dep_clone = dep.clone();
            let sleep_for = timeout.saturating_sub(elapsed);
            let spawned = std::thread::Builder::new()
                .name("rf-probe-timer".to_string())
                .spawn(move || {
                    std::thread::sleep(sleep_for);
                    dep_clone.set_ready();
                });
            if let Err(e) = spawned {
                warn!(
                    "failed to arm runtime filter probe timer: filter_id={} error={}",
                    self.filter_id, e
                );
                dep.set_ready();
                return None;
            }
        }
        Some(dep)
    }
}
