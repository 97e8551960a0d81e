// Copyright 2024-2025 Tree xie.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use certkeeper_util::resolve_path;
use snafu::Snafu;
use std::path::Path;
use tracing::error;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::filter::Directive;
use tracing_subscriber::fmt::time::OffsetTime;
use tracing_subscriber::EnvFilter;

const LOG_TARGET: &str = "certkeeper::logger";
const DEFAULT_LOG_FILE_NAME: &str = "certkeeper.log";

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Invalid {message}"))]
    Invalid { message: String },
}

type Result<T, E = Error> = std::result::Result<T, E>;

/// Builds a filter from `RUST_LOG` plus the comma separated directives
/// of `level`, e.g. `info,certkeeper::acme=debug`.
pub fn new_env_filter(level: &str) -> EnvFilter {
    let mut initial_filter = EnvFilter::from_default_env();
    for item in level.split(",") {
        if item.trim().is_empty() {
            continue;
        }
        match item.trim().parse::<Directive>() {
            Ok(directive) => {
                initial_filter = initial_filter.add_directive(directive);
            },
            Err(e) => {
                error!(
                    target: LOG_TARGET,
                    error = e.to_string(),
                    "parse directive fail"
                );
            },
        };
    }
    initial_filter
}

#[derive(Debug, Default, Clone)]
pub struct LoggerParams {
    /// Log file, logs go to stdout when empty. The file rolls daily.
    pub file: String,
    pub level: String,
    /// Number of buffered lines of the non blocking writer
    pub capacity: usize,
    pub json: bool,
}

/// Splits a log file path into its directory and file name.
fn split_log_file(file: &str) -> Result<(String, String)> {
    let file = resolve_path(file);
    let file = Path::new(&file);
    let filename = if let Some(filename) = file.file_name() {
        filename.to_string_lossy().to_string()
    } else {
        DEFAULT_LOG_FILE_NAME.to_string()
    };
    let dir = file.parent().ok_or_else(|| Error::Invalid {
        message: "log path is invalid".to_string(),
    })?;
    Ok((dir.to_string_lossy().to_string(), filename))
}

/// Installs the global tracing subscriber.
///
/// The returned guard flushes the non blocking writer when dropped, keep it
/// alive for the lifetime of the process.
pub fn logger_try_init(params: LoggerParams) -> Result<WorkerGuard> {
    let level = if params.level.is_empty() {
        "info".to_string()
    } else {
        params.level.to_lowercase()
    };
    let mut builder =
        tracing_appender::non_blocking::NonBlockingBuilder::default();
    let mut buffered_lines = params.capacity / 2 * 2;
    if buffered_lines < 16 {
        buffered_lines = 16;
    }
    builder = builder.buffered_lines_limit(buffered_lines);
    builder = builder.thread_name("certkeeper");
    let (non_blocking, guard) = if params.file.is_empty() {
        builder.finish(std::io::stdout())
    } else {
        let (dir, filename) = split_log_file(&params.file)?;
        let file_appender = tracing_appender::rolling::daily(dir, filename);
        builder.finish(file_appender)
    };

    let seconds = chrono::Local::now().offset().local_minus_utc();
    let hours = (seconds / 3600) as i8;
    let minutes = ((seconds % 3600) / 60) as i8;
    let offset = time::UtcOffset::from_hms(hours, minutes, 0)
        .unwrap_or(time::UtcOffset::UTC);
    let timer =
        OffsetTime::new(offset, time::format_description::well_known::Rfc3339);
    let is_dev = cfg!(debug_assertions);

    let result = if params.json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(new_env_filter(&level))
            .with_ansi(false)
            .with_timer(timer)
            .with_target(true)
            .with_writer(non_blocking)
            .try_init()
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(new_env_filter(&level))
            .with_ansi(is_dev && params.file.is_empty())
            .with_timer(timer)
            .with_target(is_dev)
            .with_writer(non_blocking)
            .try_init()
    };
    result.map_err(|e| Error::Invalid {
        message: e.to_string(),
    })?;

    Ok(guard)
}
