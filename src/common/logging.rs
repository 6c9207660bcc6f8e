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
//! Process logging for runtime-filter coordination.
//!
//! Lines use the glog layout so they interleave with backend logs:
//! `Lyyyymmdd hh:mm:ss.uuuuuu thread module file:line] message`.
//! A bare level such as `debug` applies to this crate only; other targets stay at `warn`.
//! `NOVAROCKS_RF_LOG` overrides the configured filter.

use std::fmt;
use std::fs::{self, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::sync::{Arc, Mutex};

use chrono::{Datelike, Local, Timelike};
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::fmt::format::{FormatEvent, FormatFields, Writer};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::{EnvFilter, fmt as tracing_fmt};

const CRATE_TARGET: &str = "novarocks_rf";
const FILTER_ENV: &str = "NOVAROCKS_RF_LOG";
const DEFAULT_FILTER: &str = "warn,novarocks_rf=info";

static INIT: OnceLock<()> = OnceLock::new();

struct RuntimeFilterLogFormat;

#[derive(Clone)]
struct SharedFileMakeWriter {
    file: Arc<Mutex<std::fs::File>>,
}

struct SharedFileWriter {
    file: Arc<Mutex<std::fs::File>>,
}

impl<'a> MakeWriter<'a> for SharedFileMakeWriter {
    type Writer = SharedFileWriter;

    fn make_writer(&'a self) -> Self::Writer {
        SharedFileWriter {
            file: Arc::clone(&self.file),
        }
    }
}

impl io::Write for SharedFileWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut file = self
            .file
            .lock()
            .map_err(|_| io::Error::other("log file lock poisoned"))?;
        file.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        let mut file = self
            .file
            .lock()
            .map_err(|_| io::Error::other("log file lock poisoned"))?;
        file.flush()
    }
}

fn non_empty_env(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Directive string for `level`. A plain level is scoped to this crate.
fn filter_directives(level: &str) -> String {
    let level = level.trim();
    if level.is_empty() {
        DEFAULT_FILTER.to_string()
    } else if level.contains('=') || level.contains(',') {
        level.to_string()
    } else {
        format!("warn,{}={}", CRATE_TARGET, level)
    }
}

// Only an explicit file or directory sends logs to disk; otherwise stderr.
fn resolve_log_file_path() -> Option<PathBuf> {
    if let Some(log_path) = non_empty_env("NOVAROCKS_RF_LOG_FILE") {
        return Some(PathBuf::from(log_path));
    }
    non_empty_env("NOVAROCKS_RF_LOG_DIR").map(|dir| PathBuf::from(dir).join("novarocks_rf.log"))
}

fn open_log_writer() -> Option<SharedFileMakeWriter> {
    let log_file_path = resolve_log_file_path()?;
    if let Some(parent) = log_file_path.parent()
        && let Err(err) = fs::create_dir_all(parent)
    {
        eprintln!(
            "novarocks_rf: cannot create log directory {}: {}, logging to stderr",
            parent.display(),
            err
        );
        return None;
    }

    match OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_file_path)
    {
        Ok(file) => Some(SharedFileMakeWriter {
            file: Arc::new(Mutex::new(file)),
        }),
        Err(err) => {
            eprintln!(
                "novarocks_rf: cannot open log file {}: {}, logging to stderr",
                log_file_path.display(),
                err
            );
            None
        }
    }
}

/// `novarocks_rf::runtime::size_negotiator` -> `runtime::size_negotiator`.
fn short_target(target: &str) -> &str {
    target
        .strip_prefix(CRATE_TARGET)
        .map(|rest| rest.trim_start_matches("::"))
        .filter(|rest| !rest.is_empty())
        .unwrap_or(target)
}

fn file_name(path: &str) -> &str {
    Path::new(path)
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or(path)
}

/// Named threads (size timers, probe timers, simulator instances) log by name.
fn thread_label() -> String {
    let current = std::thread::current();
    match current.name() {
        Some(name) => name.to_string(),
        None => format!("{:?}", current.id())
            .trim_start_matches("ThreadId(")
            .trim_end_matches(')')
            .to_string(),
    }
}

impl<S, N> FormatEvent<S, N> for RuntimeFilterLogFormat
where
    S: tracing::Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &tracing_fmt::FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &tracing::Event<'_>,
    ) -> fmt::Result {
        let metadata = event.metadata();

        let level_char = match *metadata.level() {
            tracing::Level::ERROR => 'E',
            tracing::Level::WARN => 'W',
            tracing::Level::INFO => 'I',
            tracing::Level::DEBUG => 'D',
            tracing::Level::TRACE => 'T',
        };

        let now = Local::now();
        write!(
            writer,
            "{}{}{:02}{:02} {:02}:{:02}:{:02}.{:06} {} {} {}:{}] ",
            level_char,
            now.year() % 10000,
            now.month(),
            now.day(),
            now.hour(),
            now.minute(),
            now.second(),
            now.timestamp_subsec_micros(),
            thread_label(),
            short_target(metadata.target()),
            file_name(metadata.file().unwrap_or("unknown")),
            metadata.line().unwrap_or(0)
        )?;

        ctx.field_format().format_fields(writer.by_ref(), event)?;

        writeln!(writer)
    }
}

/// Install the global subscriber once. Later calls are ignored.
pub fn init_with_level(level: &str) {
    INIT.get_or_init(|| {
        let directives = non_empty_env(FILTER_ENV).unwrap_or_else(|| filter_directives(level));
        let env_filter = EnvFilter::try_new(&directives).unwrap_or_else(|err| {
            eprintln!(
                "novarocks_rf: invalid log filter {:?}: {}, using {}",
                directives, err, DEFAULT_FILTER
            );
            EnvFilter::new(DEFAULT_FILTER)
        });

        if let Some(make_writer) = open_log_writer() {
            let _ = tracing_fmt()
                .with_env_filter(env_filter)
                .with_writer(make_writer)
                .with_ansi(false)
                .event_format(RuntimeFilterLogFormat)
                .try_init();
            return;
        }

        let use_ansi = atty::is(atty::Stream::Stderr);
        let _ = tracing_fmt()
            .with_env_filter(env_filter)
            .with_writer(std::io::stderr)
            .with_ansi(use_ansi)
            .event_format(RuntimeFilterLogFormat)
            .try_init();
    });
}

pub fn init() {
    init_with_level(DEFAULT_FILTER);
}

pub use tracing::{debug, error, info, warn};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_level_is_scoped_to_crate() {
        assert_eq!(filter_directives("debug"), "warn,novarocks_rf=debug");
        assert_eq!(filter_directives("  "), DEFAULT_FILTER);
        assert_eq!(
            filter_directives("novarocks_rf::runtime=trace"),
            "novarocks_rf::runtime=trace"
        );
        assert_eq!(filter_directives("info,hyper=off"), "info,hyper=off");
    }

    #[test]
    fn crate_prefix_is_dropped_from_targets() {
        assert_eq!(
            short_target("novarocks_rf::runtime::size_negotiator"),
            "runtime::size_negotiator"
        );
        assert_eq!(short_target("novarocks_rf"), "novarocks_rf");
        assert_eq!(short_target("other::module"), "other::module");
        assert_eq!(file_name("src/runtime/size_negotiator.rs"), "size_negotiator.rs");
    }
}
