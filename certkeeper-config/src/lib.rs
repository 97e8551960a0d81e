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
use tokio::fs;
use tracing::debug;

mod conf;

pub static LOG_TARGET: &str = "certkeeper::config";

// Error enum for all possible configuration-related errors
#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Invalid error {message}"))]
    Invalid { message: String },
    #[snafu(display("Io error {source}, {file}"))]
    Io {
        source: std::io::Error,
        file: String,
    },
    #[snafu(display("Toml de error {source}"))]
    De { source: toml::de::Error },
    #[snafu(display("Addr parse error {source}, {addr}"))]
    AddrParse {
        source: std::net::AddrParseError,
        addr: String,
    },
}
type Result<T, E = Error> = std::result::Result<T, E>;

/// Parses and validates a toml configuration.
pub fn parse_config(data: &str) -> Result<AcmeConf> {
    let conf: AcmeConf =
        toml::from_str(data).map_err(|e| Error::De { source: e })?;
    conf.validate()?;
    Ok(conf)
}

/// Reads the toml file at `path` ('~' is expanded) and parses it.
pub async fn load_config(path: &str) -> Result<AcmeConf> {
    let file = resolve_path(path);
    let data = fs::read_to_string(&file).await.map_err(|e| Error::Io {
        source: e,
        file: file.clone(),
    })?;
    debug!(target: LOG_TARGET, file, "read config file");
    parse_config(&data)
}

pub use conf::*;
