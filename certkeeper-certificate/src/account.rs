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

use super::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;

const ACCOUNT_FILE_MODE: u32 = 0o600;

/// Account registered with the issuance authority.
///
/// Written once after a successful registration and loaded from its json
/// file afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountRecord {
    /// Contact uris, e.g. `mailto:owner@example.com`
    #[serde(default)]
    pub contact: Vec<String>,
    pub created_at: DateTime<Utc>,
    /// Status reported by the authority, e.g. `valid`
    pub status: String,
    /// Network address the account was registered from, when reported
    #[serde(default)]
    pub initial_ip: Option<String>,
    /// Fingerprint of the account key this record is bound to
    pub key_fingerprint: String,
    pub directory_url: String,
    /// Account url assigned by the authority, requests are signed with the
    /// account key under this id
    #[serde(default)]
    pub account_url: String,
}

impl AccountRecord {
    /// Loads the record, `None` if the file does not exist.
    pub fn load(path: &Path) -> Result<Option<Self>> {
        if !path.exists() {
            return Ok(None);
        }
        let file = path.to_string_lossy().to_string();
        let data = std::fs::read_to_string(path).map_err(|e| Error::Io {
            source: e,
            file: file.clone(),
        })?;
        let record =
            serde_json::from_str(&data).map_err(|e| Error::Json {
                source: e,
                file,
            })?;
        Ok(Some(record))
    }
    /// Writes the record, replacing the file atomically.
    pub fn save(&self, path: &Path) -> Result<()> {
        let file = path.to_string_lossy().to_string();
        let data =
            serde_json::to_string_pretty(self).map_err(|e| Error::Json {
                source: e,
                file: file.clone(),
            })?;
        certkeeper_util::write_atomic(
            path,
            data.as_bytes(),
            Some(ACCOUNT_FILE_MODE),
        )
        .map_err(|e| Error::Invalid {
            category: "save_account".to_string(),
            message: e.to_string(),
        })
    }
}
