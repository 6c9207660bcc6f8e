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
//! Filters shared by the instances of one shared-hash-table join.
//!
//! Building instances deposit their producers at end of input; the merged result is
//! adopted by every instance of the table, including the ones that built nothing.

use std::collections::HashMap;
use std::sync::Mutex;

use super::error::Result;
use super::producer::{FilterProducer, RuntimeFilterProducer};
use crate::novarocks_logging::debug;

#[derive(Default)]
pub struct SharedRuntimeFilters {
    filters: Mutex<HashMap<i32, RuntimeFilterProducer>>,
}

impl SharedRuntimeFilters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Union `producer` into the shared filter of its descriptor.
    pub fn contribute(&self, producer: &RuntimeFilterProducer) -> Result<()> {
        let mut guard = self.filters.lock().expect("shared runtime filters lock");
        match guard.get_mut(&producer.filter_id()) {
            Some(shared) => shared.merge(producer)?,
            None => {
                guard.insert(producer.filter_id(), producer.clone());
            }
        }
        debug!(
            "shared runtime filter contributed: filter_id={} rows={} state={:?}",
            producer.filter_id(),
            producer.inserted_rows(),
            producer.state()
        );
        Ok(())
    }

    pub fn get(&self, filter_id: i32) -> Option<RuntimeFilterProducer> {
        self.filters
            .lock()
            .expect("shared runtime filters lock")
            .get(&filter_id)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.filters.lock().expect("shared runtime filters lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
