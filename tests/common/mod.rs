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
//! Common utilities and helpers for integration tests.
#![allow(dead_code)]
#![allow(unused_imports)]

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

use arrow::array::{Int64Array, RecordBatch};
use arrow::datatypes::{DataType, Field, Schema};

use novarocks_rf::common::ids::InstanceId;
use novarocks_rf::common::types::UniqueId;
use novarocks_rf::exec::chunk::Chunk;
use novarocks_rf::exec::runtime_filter::{
    Result, RuntimeFilterContext, RuntimeFilterError, RuntimeFilterOptions,
    RuntimeFilterProducerHelper,
};
use novarocks_rf::novarocks_config;
use novarocks_rf::novarocks_logging;
use novarocks_rf::runtime::profile::RuntimeProfile;
use novarocks_rf::runtime::runtime_filter_hub::{PublishRequest, PublishSink};
use novarocks_rf::runtime::size_negotiator::SizeNegotiator;

/// Test configuration for integration tests.
pub struct TestConfig {
    /// Temporary directory for test artifacts
    pub temp_dir: TempDir,
    /// Test config path
    pub config_path: PathBuf,
}

impl TestConfig {
    pub fn new() -> anyhow::Result<Self> {
        let temp_dir = tempfile::tempdir()?;
        let config_path = temp_dir.path().join("test_novarocks_rf.toml");

        let config_content = r#"
log_level = "debug"

[runtime_filter]
max_filter_rows = 1000
max_filter_bytes = 1048576
max_in_conditions = 64
sync_size_timeout_ms = 200
bloom_filter_default_size = 4096
round_gc_ms = 60000

[simulator]
instances = 3
rows_per_instance = 128
broadcast = false
"#;

        std::fs::write(&config_path, config_content)?;

        Ok(Self {
            temp_dir,
            config_path,
        })
    }

    /// Initialize logging for tests.
    pub fn init_logging(&self) {
        novarocks_logging::init_with_level("debug");
    }

    pub fn load_config(&self) -> anyhow::Result<novarocks_config::NovaRocksRfConfig> {
        novarocks_config::NovaRocksRfConfig::load_from_file(&self.config_path)
    }
}

impl Default for TestConfig {
    fn default() -> Self {
        Self::new().expect("Failed to create test config")
    }
}

/// Generate a unique query ID based on test name.
pub fn unique_query_id(test_name: &str) -> UniqueId {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};

    let mut hasher = DefaultHasher::new();
    test_name.hash(&mut hasher);
    let hash = hasher.finish();

    UniqueId {
        hi: hash as i64,
        lo: (hash >> 32) as i64,
    }
}

/// Limits small enough for tests to hit every fallback quickly.
pub fn test_options(sync_size_timeout: Duration) -> RuntimeFilterOptions {
    RuntimeFilterOptions {
        max_in_conditions: 64,
        max_filter_bytes: 1 << 20,
        sync_size_timeout,
        bloom_filter_default_size: 4096,
    }
}

pub fn int_chunk(values: impl IntoIterator<Item = i64>) -> Chunk {
    let values: Vec<i64> = values.into_iter().collect();
    let schema = Arc::new(Schema::new(vec![Field::new("k", DataType::Int64, true)]));
    let batch = RecordBatch::try_new(schema, vec![Arc::new(Int64Array::from(values)) as _])
        .expect("int batch");
    Chunk::new(batch)
}

pub struct HelperFixture {
    pub query_id: UniqueId,
    pub join_node_id: i32,
    pub expected_instances: usize,
    pub negotiator: Arc<SizeNegotiator>,
    pub sink: Arc<dyn PublishSink>,
    pub options: RuntimeFilterOptions,
    pub profile: RuntimeProfile,
}

impl HelperFixture {
    pub fn new(
        test_name: &str,
        expected_instances: usize,
        max_rows: u64,
        sink: Arc<dyn PublishSink>,
        sync_size_timeout: Duration,
    ) -> Self {
        Self {
            query_id: unique_query_id(test_name),
            join_node_id: 1,
            expected_instances,
            negotiator: Arc::new(SizeNegotiator::new(max_rows, Duration::from_secs(60))),
            sink,
            options: test_options(sync_size_timeout),
            profile: RuntimeProfile::new(test_name),
        }
    }

    pub fn helper(
        &self,
        instance: u32,
        should_build_hash_table: bool,
        is_broadcast_join: bool,
    ) -> RuntimeFilterProducerHelper {
        let ctx = RuntimeFilterContext {
            query_id: self.query_id,
            join_node_id: self.join_node_id,
            instance_id: InstanceId(instance),
            expected_instances: self.expected_instances,
            negotiator: Arc::clone(&self.negotiator),
            sink: Arc::clone(&self.sink),
            options: self.options.clone(),
        };
        let profile = self.profile.child(format!("instance_{}", instance));
        RuntimeFilterProducerHelper::new(&profile, should_build_hash_table, is_broadcast_join, ctx)
    }
}

/// Sink that keeps every request it sees.
#[derive(Default)]
pub struct RecordingSink {
    pub requests: Mutex<Vec<PublishRequest>>,
}

impl RecordingSink {
    pub fn count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub fn count_for(&self, filter_id: i32) -> usize {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.filter_id == filter_id)
            .count()
    }

    pub fn requests(&self) -> Vec<PublishRequest> {
        self.requests.lock().unwrap().clone()
    }
}

impl PublishSink for RecordingSink {
    fn publish(&self, request: PublishRequest) -> Result<()> {
        self.requests.lock().unwrap().push(request);
        Ok(())
    }
}

/// Run `f` and fail the test if it does not finish within `timeout`.
pub fn run_with_timeout<F, T>(timeout: Duration, f: F) -> T
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    use std::sync::mpsc;

    let (tx, rx) = mpsc::channel();
    std::thread::spawn(move || {
        let _ = tx.send(f());
    });

    match rx.recv_timeout(timeout) {
        Ok(v) => v,
        Err(_) => panic!("test timed out after {:?}", timeout),
    }
}

/// Assert that a result is Ok and return the value.
#[macro_export]
macro_rules! assert_ok {
    ($result:expr) => {
        match $result {
            Ok(value) => value,
            Err(e) => panic!("Expected Ok, got Err: {:?}", e),
        }
    };
    ($result:expr, $message:expr) => {
        match $result {
            Ok(value) => value,
            Err(e) => panic!("{}: {:?}", $message, e),
        }
    };
}
