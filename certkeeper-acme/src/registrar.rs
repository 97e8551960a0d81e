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

use super::{AcmeAuthority, Error, Result, LOG_TARGET};
use certkeeper_certificate::{AccountRecord, KeyMaterial};
use chrono::Utc;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

/// Loads the account record, registering a new account only when none is
/// stored yet.
pub struct AccountRegistrar {
    authority: Arc<dyn AcmeAuthority>,
    directory_url: String,
}

impl AccountRegistrar {
    pub fn new(authority: Arc<dyn AcmeAuthority>, directory_url: &str) -> Self {
        Self {
            authority,
            directory_url: directory_url.to_string(),
        }
    }
    /// The record is written only after the authority accepted the
    /// registration, a failed registration leaves the file untouched.
    pub async fn load_or_create(
        &self,
        account_path: &Path,
        account_key: &KeyMaterial,
        contacts: &[String],
    ) -> Result<AccountRecord> {
        if let Some(record) = AccountRecord::load(account_path)? {
            info!(
                target: LOG_TARGET,
                file = account_path.to_string_lossy().to_string(),
                status = record.status,
                "load account"
            );
            return Ok(record);
        }

        let registered = self
            .authority
            .create_account(account_key, contacts)
            .await
            .map_err(|e| match e {
                Error::Registration { .. } => e,
                e => Error::Registration {
                    message: e.to_string(),
                },
            })?;
        let record = AccountRecord {
            contact: contacts.to_vec(),
            created_at: Utc::now(),
            status: registered.status,
            initial_ip: registered.initial_ip,
            key_fingerprint: account_key.fingerprint(),
            directory_url: self.directory_url.clone(),
            account_url: registered.account_url,
        };
        record.save(account_path)?;
        info!(
            target: LOG_TARGET,
            file = account_path.to_string_lossy().to_string(),
            contact = contacts.join(","),
            directory_url = self.directory_url,
            "register account"
        );
        Ok(record)
    }
}
