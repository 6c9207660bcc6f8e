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
//! Cross-instance build-size negotiation.
//!
//! Responsibilities:
//! - Collects one local row estimate per build instance of a join and resolves the round
//!   to a global total or to an abandon decision.
//! - Wakes blocked waiters and scheduler dependencies when a round resolves.
//! - Reclaims round state once every participant has observed the outcome, or after the
//!   GC window, keeping the outcome readable for participants that have not looked yet.
//! - Remembers instances that skip before any round exists so siblings do not wait on them.
//!
//! Key exported interfaces:
//! - Types: `SizeNegotiator`, `SizeRoundKey`, `RoundHandle`, `SizeResolution`, `AbandonReason`.
//!
//! A round resolves exactly once. A timeout resolves the whole round, so a participant
//! that reports after the deadline observes the same abandon decision as the waiters.

use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, Weak};
use std::time::{Duration, Instant};

use crate::common::config;
use crate::common::ids::InstanceId;
use crate::common::types::UniqueId;
use crate::exec::pipeline::dependency::CountedFinishDependency;
use crate::exec::runtime_filter::{Result, RuntimeFilterError};
use crate::novarocks_logging::{debug, warn};

/// One negotiation round per join build side of a query.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SizeRoundKey {
    pub query_id: UniqueId,
    pub join_node_id: i32,
}

impl SizeRoundKey {
    pub fn new(query_id: UniqueId, join_node_id: i32) -> Self {
        Self {
            query_id,
            join_node_id,
        }
    }
}

impl fmt::Display for SizeRoundKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.query_id, self.join_node_id)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AbandonReason {
    ExceedsCeiling,
    Timeout,
    ParticipantSkipped,
}

impl fmt::Display for AbandonReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AbandonReason::ExceedsCeiling => f.write_str("exceeds ceiling"),
            AbandonReason::Timeout => f.write_str("timeout"),
            AbandonReason::ParticipantSkipped => f.write_str("participant skipped"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SizeResolution {
    Sized(u64),
    Abandon(AbandonReason),
}

/// Participant's ticket into one round. Stale after the round is reclaimed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RoundHandle {
    key: SizeRoundKey,
    generation: u64,
    instance_id: InstanceId,
}

impl RoundHandle {
    pub fn key(&self) -> SizeRoundKey {
        self.key
    }

    pub fn instance_id(&self) -> InstanceId {
        self.instance_id
    }
}

struct RoundSlot {
    generation: u64,
    expected: usize,
    reported: HashMap<InstanceId, u64>,
    observed: HashSet<InstanceId>,
    resolution: Option<SizeResolution>,
    created_at: Instant,
    resolved_at: Option<Instant>,
    dependencies: Vec<Arc<CountedFinishDependency>>,
}

impl RoundSlot {
    fn open(generation: u64, expected: usize) -> Self {
        Self {
            generation,
            expected,
            reported: HashMap::new(),
            observed: HashSet::new(),
            resolution: None,
            created_at: Instant::now(),
            resolved_at: None,
            dependencies: Vec::new(),
        }
    }

    fn is_done(&self) -> bool {
        self.resolution.is_some() && self.observed.len() >= self.expected
    }
}

/// Resolution of a round reclaimed before every participant observed it.
struct Tombstone {
    generation: u64,
    expected: usize,
    resolution: SizeResolution,
    reclaimed_at: Instant,
}

/// Instances that left before any sibling opened the round.
struct SkipMarker {
    instances: HashSet<InstanceId>,
    reason: AbandonReason,
    recorded_at: Instant,
}

#[derive(Default)]
struct RoundTable {
    rounds: HashMap<SizeRoundKey, RoundSlot>,
    tombstones: HashMap<SizeRoundKey, Tombstone>,
    skipped: HashMap<SizeRoundKey, SkipMarker>,
}

impl RoundTable {
    /// `None` while the handle's round is open.
    fn resolution_of(&self, handle: &RoundHandle) -> Option<SizeResolution> {
        if let Some(slot) = self.rounds.get(&handle.key)
            && slot.generation == handle.generation
        {
            return slot.resolution;
        }
        match self.tombstones.get(&handle.key) {
            Some(tombstone) if tombstone.generation == handle.generation => {
                Some(tombstone.resolution)
            }
            _ => Some(SizeResolution::Abandon(AbandonReason::Timeout)),
        }
    }
}

struct NegotiatorInner {
    max_rows: u64,
    round_gc: Duration,
    next_generation: AtomicU64,
    table: Mutex<RoundTable>,
    resolved: Condvar,
}

/// Signals collected under the rounds lock and fired after it is released.
#[derive(Default)]
struct PendingWakeups {
    dependencies: Vec<Arc<CountedFinishDependency>>,
    notify: bool,
}

impl PendingWakeups {
    fn fire(self, inner: &NegotiatorInner) {
        for dep in self.dependencies {
            dep.sub();
        }
        if self.notify {
            inner.resolved.notify_all();
        }
    }
}

fn resolve_total(total: u64, max_rows: u64) -> SizeResolution {
    if total > max_rows {
        SizeResolution::Abandon(AbandonReason::ExceedsCeiling)
    } else {
        SizeResolution::Sized(total)
    }
}

fn expected_mismatch(
    key: &SizeRoundKey,
    expected: usize,
    instance_id: InstanceId,
    reported: usize,
) -> RuntimeFilterError {
    RuntimeFilterError::invalid_state(format!(
        "size round {} expects {} participants, instance {} reported {}",
        key, expected, instance_id, reported
    ))
}

impl NegotiatorInner {
    fn lock(&self) -> MutexGuard<'_, RoundTable> {
        self.table.lock().expect("size negotiator lock")
    }

    fn settle(
        key: &SizeRoundKey,
        slot: &mut RoundSlot,
        resolution: SizeResolution,
        wakeups: &mut PendingWakeups,
    ) {
        if slot.resolution.is_some() {
            return;
        }
        slot.resolution = Some(resolution);
        slot.resolved_at = Some(Instant::now());
        wakeups.dependencies.append(&mut slot.dependencies);
        wakeups.notify = true;
        match resolution {
            SizeResolution::Sized(total) => debug!(
                "runtime filter size round resolved: round={} total_rows={} reported={}/{}",
                key,
                total,
                slot.reported.len(),
                slot.expected
            ),
            SizeResolution::Abandon(reason) => warn!(
                "runtime filter size round abandoned: round={} reason={} reported={}/{}",
                key,
                reason,
                slot.reported.len(),
                slot.expected
            ),
        }
    }

    fn reclaim_if_done(rounds: &mut HashMap<SizeRoundKey, RoundSlot>, key: &SizeRoundKey) {
        if rounds.get(key).is_some_and(RoundSlot::is_done) {
            rounds.remove(key);
        }
    }

    /// Open rounds age from creation and are abandoned once `round_gc` passes. Resolved
    /// rounds age from resolution and leave a tombstone so unobserved handles keep
    /// reading the same outcome.
    fn gc_stale(&self, table: &mut RoundTable, wakeups: &mut PendingWakeups) {
        let now = Instant::now();
        let round_gc = self.round_gc;
        let mut reclaimed = Vec::new();
        table.rounds.retain(|key, slot| {
            let since = slot.resolved_at.unwrap_or(slot.created_at);
            if now.duration_since(since) < round_gc {
                return true;
            }
            Self::settle(
                key,
                slot,
                SizeResolution::Abandon(AbandonReason::Timeout),
                wakeups,
            );
            if let Some(resolution) = slot.resolution {
                reclaimed.push((
                    *key,
                    Tombstone {
                        generation: slot.generation,
                        expected: slot.expected,
                        resolution,
                        reclaimed_at: now,
                    },
                ));
            }
            debug!(
                "runtime filter size round reclaimed: round={} observed={}/{}",
                key,
                slot.observed.len(),
                slot.expected
            );
            false
        });
        table
            .tombstones
            .retain(|_, t| now.duration_since(t.reclaimed_at) < round_gc);
        table.tombstones.extend(reclaimed);
        table
            .skipped
            .retain(|_, m| now.duration_since(m.recorded_at) < round_gc);
    }

    fn expire(&self, key: SizeRoundKey, generation: u64, reason: AbandonReason) {
        let mut wakeups = PendingWakeups::default();
        {
            let mut table = self.lock();
            if let Some(slot) = table.rounds.get_mut(&key)
                && slot.generation == generation
            {
                Self::settle(&key, slot, SizeResolution::Abandon(reason), &mut wakeups);
                Self::reclaim_if_done(&mut table.rounds, &key);
            }
        }
        wakeups.fire(self);
    }
}

/// Process-wide coordinator for build-size rounds.
pub struct SizeNegotiator {
    inner: Arc<NegotiatorInner>,
}

impl SizeNegotiator {
    pub fn new(max_rows: u64, round_gc: Duration) -> Self {
        Self {
            inner: Arc::new(NegotiatorInner {
                max_rows,
                round_gc,
                next_generation: AtomicU64::new(1),
                table: Mutex::new(RoundTable::default()),
                resolved: Condvar::new(),
            }),
        }
    }

    pub fn from_config() -> Self {
        Self::new(
            config::runtime_filter_max_rows(),
            Duration::from_millis(config::runtime_filter_round_gc_ms()),
        )
    }

    pub fn max_rows(&self) -> u64 {
        self.inner.max_rows
    }

    /// Resolution for a build side that needs no cross-instance round.
    pub fn resolve_local(&self, local_estimate: u64) -> SizeResolution {
        resolve_total(local_estimate, self.inner.max_rows)
    }

    /// Contribute `local_estimate` to the round for `key`. The round resolves when
    /// `expected_participants` distinct instances have reported, or at once when a
    /// sibling already left through `abandon`.
    pub fn report(
        &self,
        key: SizeRoundKey,
        instance_id: InstanceId,
        local_estimate: u64,
        expected_participants: usize,
    ) -> Result<RoundHandle> {
        if expected_participants == 0 {
            return Err(RuntimeFilterError::invalid_state(format!(
                "size round {} expects no participants",
                key
            )));
        }
        let mut wakeups = PendingWakeups::default();
        let result = 'report: {
            let mut guard = self.inner.lock();
            let table = &mut *guard;
            self.inner.gc_stale(table, &mut wakeups);
            if !table.rounds.contains_key(&key)
                && let Some(tombstone) = table.tombstones.get(&key)
            {
                break 'report if tombstone.expected != expected_participants {
                    Err(expected_mismatch(
                        &key,
                        tombstone.expected,
                        instance_id,
                        expected_participants,
                    ))
                } else {
                    Ok(RoundHandle {
                        key,
                        generation: tombstone.generation,
                        instance_id,
                    })
                };
            }
            let slot = match table.rounds.entry(key) {
                Entry::Occupied(entry) => entry.into_mut(),
                Entry::Vacant(entry) => {
                    let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);
                    let slot = entry.insert(RoundSlot::open(generation, expected_participants));
                    if let Some(marker) = table.skipped.remove(&key) {
                        slot.observed.extend(marker.instances);
                        NegotiatorInner::settle(
                            &key,
                            slot,
                            SizeResolution::Abandon(marker.reason),
                            &mut wakeups,
                        );
                    }
                    slot
                }
            };
            if slot.expected != expected_participants {
                Err(expected_mismatch(
                    &key,
                    slot.expected,
                    instance_id,
                    expected_participants,
                ))
            } else {
                if slot.resolution.is_none() && !slot.reported.contains_key(&instance_id) {
                    slot.reported.insert(instance_id, local_estimate);
                    if slot.reported.len() == slot.expected {
                        let total = slot
                            .reported
                            .values()
                            .fold(0u64, |acc, v| acc.saturating_add(*v));
                        let resolution = resolve_total(total, self.inner.max_rows);
                        NegotiatorInner::settle(&key, slot, resolution, &mut wakeups);
                    }
                }
                Ok(RoundHandle {
                    key,
                    generation: slot.generation,
                    instance_id,
                })
            }
        };
        wakeups.fire(&self.inner);
        result
    }

    /// Current resolution; `None` while the round is open. A reclaimed round reads its
    /// tombstone, or a timeout once that has expired as well.
    pub fn poll(&self, handle: &RoundHandle) -> Option<SizeResolution> {
        self.inner.lock().resolution_of(handle)
    }

    /// Block until the round resolves or `timeout` elapses. On timeout the whole round
    /// is abandoned.
    pub fn wait(&self, handle: &RoundHandle, timeout: Duration) -> SizeResolution {
        let deadline = Instant::now() + timeout;
        let mut table = self.inner.lock();
        loop {
            if let Some(resolution) = table.resolution_of(handle) {
                return resolution;
            }
            let now = Instant::now();
            if now >= deadline {
                drop(table);
                self.expire(handle);
                return self
                    .poll(handle)
                    .unwrap_or(SizeResolution::Abandon(AbandonReason::Timeout));
            }
            let (guard, _) = self
                .inner
                .resolved
                .wait_timeout(table, deadline - now)
                .expect("size negotiator lock");
            table = guard;
        }
    }

    /// Keep `dependency` blocked until the round resolves, and abandon the round if it is
    /// still open after `timeout`.
    pub fn attach_dependency(
        &self,
        handle: &RoundHandle,
        dependency: Arc<CountedFinishDependency>,
        timeout: Duration,
    ) {
        {
            let mut table = self.inner.lock();
            let Some(slot) = table.rounds.get_mut(&handle.key) else {
                return;
            };
            if slot.generation != handle.generation || slot.resolution.is_some() {
                return;
            }
            dependency.add();
            slot.dependencies.push(dependency);
        }

        let weak: Weak<NegotiatorInner> = Arc::downgrade(&self.inner);
        let key = handle.key;
        let generation = handle.generation;
        let spawned = std::thread::Builder::new()
            .name("rf-size-timer".to_string())
            .spawn(move || {
                std::thread::sleep(timeout);
                if let Some(inner) = weak.upgrade() {
                    inner.expire(key, generation, AbandonReason::Timeout);
                }
            });
        if let Err(e) = spawned {
            warn!(
                "failed to arm runtime filter size timer: round={} error={}",
                key, e
            );
        }
    }

    /// Abandon the round with a timeout if it is still open.
    pub fn expire(&self, handle: &RoundHandle) {
        self.inner
            .expire(handle.key, handle.generation, AbandonReason::Timeout);
    }

    /// Abandon the round on behalf of `instance_id`, which leaves without reporting.
    /// Without an open round only a skip marker is kept; the first sibling to report
    /// then resolves at once instead of waiting out the sync timeout.
    pub fn abandon(&self, key: SizeRoundKey, instance_id: InstanceId, reason: AbandonReason) {
        let mut wakeups = PendingWakeups::default();
        {
            let mut guard = self.inner.lock();
            let table = &mut *guard;
            self.inner.gc_stale(table, &mut wakeups);
            if let Some(slot) = table.rounds.get_mut(&key) {
                NegotiatorInner::settle(&key, slot, SizeResolution::Abandon(reason), &mut wakeups);
                slot.observed.insert(instance_id);
                NegotiatorInner::reclaim_if_done(&mut table.rounds, &key);
            } else if !table.tombstones.contains_key(&key) {
                let marker = table.skipped.entry(key).or_insert_with(|| SkipMarker {
                    instances: HashSet::new(),
                    reason,
                    recorded_at: Instant::now(),
                });
                marker.instances.insert(instance_id);
                debug!(
                    "runtime filter size round skip recorded: round={} instance={} skipped={}",
                    key,
                    instance_id,
                    marker.instances.len()
                );
            }
        }
        wakeups.fire(&self.inner);
    }

    /// Record that the handle's participant no longer needs the round.
    pub fn observe(&self, handle: &RoundHandle) {
        let mut table = self.inner.lock();
        if let Some(slot) = table.rounds.get_mut(&handle.key)
            && slot.generation == handle.generation
        {
            slot.observed.insert(handle.instance_id);
            NegotiatorInner::reclaim_if_done(&mut table.rounds, &handle.key);
        }
    }

    pub fn active_rounds(&self) -> usize {
        self.inner.lock().rounds.len()
    }

    /// Keys with a recorded skip and no round yet.
    pub fn skip_markers(&self) -> usize {
        self.inner.lock().skipped.len()
    }
}

impl Default for SizeNegotiator {
    fn default() -> Self {
        Self::from_config()
    }
}
