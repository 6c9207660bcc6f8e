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
//! Pipeline dependency primitives.
//!
//! Responsibilities:
//! - Defines dependency handles, readiness flags, and dependency-manager bookkeeping.
//! - Used by the scheduler to park a task and by producers of readiness (size negotiation,
//!   filter publish) to unpark it.
//!
//! Key exported interfaces:
//! - Types: `DependencyHandle`, `Dependency`, `CountedFinishDependency`, `DependencyManager`.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::exec::pipeline::schedule::observer::{Observable, Observer};
use crate::novarocks_logging::{debug, warn};

static NEXT_DEP_MANAGER_ID: AtomicUsize = AtomicUsize::new(1);
static NEXT_DEP_ID: AtomicUsize = AtomicUsize::new(1);

/// Reference-counted handle to one pipeline dependency object.
pub type DependencyHandle = Arc<Dependency>;

/// Dependency primitive used to model blocked/unblocked execution conditions.
pub struct Dependency {
    id: usize,
    name: String,
    ready: AtomicBool,
    observable: Arc<Observable>,
}

impl fmt::Debug for Dependency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dependency")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("ready", &self.is_ready())
            .finish()
    }
}

impl PartialEq for Dependency {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Dependency {}

impl Dependency {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: NEXT_DEP_ID.fetch_add(1, Ordering::Relaxed),
            name: name.into(),
            ready: AtomicBool::new(false),
            observable: Arc::new(Observable::new()),
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    pub fn set_ready(&self) {
        let prev = self.ready.swap(true, Ordering::AcqRel);
        if !prev {
            let notify = self.observable.defer_notify();
            notify.arm();
            if should_log_dep(&self.name) {
                debug!(
                    "Dependency ready: dep_id={} name={} observers={}",
                    self.id,
                    self.name,
                    self.observable.num_observers()
                );
            }
        }
    }

    pub fn set_blocked(&self) {
        self.ready.store(false, Ordering::Release);
    }

    pub fn add_waiter(&self, observer: Observer) {
        if self.is_ready() {
            observer();
            return;
        }
        self.observable.add_observer(observer);
        // The dependency may have turned ready between the check and the registration.
        if self.is_ready() {
            let notify = self.observable.defer_notify();
            notify.arm();
        }
    }
}

/// Dependency that stays blocked while any counted task is outstanding.
///
/// Starts ready. Each `add` registers one outstanding completion and each `sub`
/// retires one; the dependency turns ready again when the count drops to zero.
pub struct CountedFinishDependency {
    dep: DependencyHandle,
    count: Mutex<usize>,
}

impl fmt::Debug for CountedFinishDependency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CountedFinishDependency")
            .field("dep", &self.dep)
            .field("count", &self.count())
            .finish()
    }
}

impl CountedFinishDependency {
    pub fn new(name: impl Into<String>) -> Self {
        let dep = Arc::new(Dependency::new(name));
        dep.set_ready();
        Self {
            dep,
            count: Mutex::new(0),
        }
    }

    pub fn dependency(&self) -> DependencyHandle {
        Arc::clone(&self.dep)
    }

    pub fn is_ready(&self) -> bool {
        self.dep.is_ready()
    }

    pub fn count(&self) -> usize {
        *self.count.lock().expect("counted dependency lock")
    }

    pub fn add(&self) {
        let mut guard = self.count.lock().expect("counted dependency lock");
        *guard += 1;
        if *guard == 1 {
            self.dep.set_blocked();
        }
    }

    pub fn sub(&self) {
        let ready = {
            let mut guard = self.count.lock().expect("counted dependency lock");
            if *guard == 0 {
                warn!(
                    "counted dependency sub below zero: dep_id={} name={}",
                    self.dep.id(),
                    self.dep.name()
                );
                return;
            }
            *guard -= 1;
            *guard == 0
        };
        if ready {
            self.dep.set_ready();
        }
    }

    pub fn add_waiter(&self, observer: Observer) {
        self.dep.add_waiter(observer);
    }
}

#[derive(Clone)]
/// Registry managing dependency objects for one pipeline build/execution context.
pub struct DependencyManager {
    id: usize,
    deps: Arc<Mutex<HashMap<String, DependencyHandle>>>,
}

impl DependencyManager {
    pub fn new() -> Self {
        Self {
            id: NEXT_DEP_MANAGER_ID.fetch_add(1, Ordering::Relaxed),
            deps: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn get_or_create(&self, name: impl Into<String>) -> DependencyHandle {
        let name = name.into();
        let mut guard = self.deps.lock().expect("dependency manager lock");
        guard
            .entry(name.clone())
            .or_insert_with(|| Arc::new(Dependency::new(name)))
            .clone()
    }

    pub fn mark_ready(&self, name: &str) {
        let dep = self.get_or_create(name.to_string());
        dep.set_ready();
    }
}

fn should_log_dep(name: &str) -> bool {
    name.starts_with("rf_sync_size:") || name.starts_with("runtime_filter:")
}

impl Default for DependencyManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::{CountedFinishDependency, DependencyManager};

    #[test]
    fn counted_dependency_blocks_until_all_subs() {
        let dep = CountedFinishDependency::new("rf_sync_size:test");
        assert!(dep.is_ready());
        dep.add();
        dep.add();
        assert!(!dep.is_ready());
        dep.sub();
        assert!(!dep.is_ready());
        dep.sub();
        assert!(dep.is_ready());
        // Extra sub is ignored.
        dep.sub();
        assert_eq!(dep.count(), 0);
    }

    #[test]
    fn waiter_fires_once_on_ready() {
        let dep = CountedFinishDependency::new("rf_sync_size:waiter");
        dep.add();
        let hits = Arc::new(AtomicUsize::new(0));
        let hits_clone = Arc::clone(&hits);
        dep.add_waiter(Arc::new(move || {
            hits_clone.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        dep.sub();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn manager_returns_same_handle_by_name() {
        let manager = DependencyManager::new();
        let a = manager.get_or_create("runtime_filter:1");
        let b = manager.get_or_create("runtime_filter:1");
        assert_eq!(a.id(), b.id());
        manager.mark_ready("runtime_filter:1");
        assert!(b.is_ready());
    }
}
