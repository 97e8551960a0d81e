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

use super::{
    load_bundle, load_key, AccountRecord, Error, KeyAlgorithm, KeyKind,
    KeyMaterial, LOG_TARGET,
};
use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};
use std::path::PathBuf;
use tracing::debug;

/// Files making up a certificate bundle on disk.
#[derive(Debug, Clone, PartialEq)]
pub struct BundlePaths {
    pub account_path: PathBuf,
    pub account_key_path: PathBuf,
    pub server_key_path: PathBuf,
    pub bundle_path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct KeyInfo {
    pub algorithm: KeyAlgorithm,
    pub fingerprint: String,
}

impl From<&KeyMaterial> for KeyInfo {
    fn from(key: &KeyMaterial) -> Self {
        Self {
            algorithm: key.algorithm(),
            fingerprint: key.fingerprint(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChainInfo {
    pub subject: String,
    pub issuer: String,
    pub issuer_common_name: String,
    pub domains: Vec<String>,
    pub not_before: i64,
    pub not_after: i64,
    pub certificates: usize,
    /// Whether the check time lies within the validity window
    pub in_window: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AccountInfo {
    pub contact: Vec<String>,
    pub created_at: DateTime<Utc>,
    /// Status reported by the authority, kept apart from the `status` of
    /// the serialized verdict field
    pub account_status: String,
    pub initial_ip: Option<String>,
    pub directory_url: String,
}

fn serialize_status<T, S>(
    value: &Result<T, String>,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error>
where
    T: Serialize,
    S: Serializer,
{
    #[derive(Serialize)]
    struct StatusOk<'a, T: Serialize> {
        status: &'static str,
        #[serde(flatten)]
        detail: &'a T,
    }
    #[derive(Serialize)]
    struct StatusError<'a> {
        status: &'static str,
        reason: &'a str,
    }
    match value {
        Ok(detail) => StatusOk {
            status: "ok",
            detail,
        }
        .serialize(serializer),
        Err(reason) => StatusError {
            status: "error",
            reason,
        }
        .serialize(serializer),
    }
}

/// Snapshot of the stored bundle, recomputed on every check.
///
/// Each field is evaluated on its own, a broken field never hides the
/// state of the others.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValidityVerdict {
    #[serde(serialize_with = "serialize_status")]
    pub server_key: Result<KeyInfo, String>,
    #[serde(serialize_with = "serialize_status")]
    pub account_key: Result<KeyInfo, String>,
    #[serde(serialize_with = "serialize_status")]
    pub chain: Result<ChainInfo, String>,
    #[serde(serialize_with = "serialize_status")]
    pub account: Result<AccountInfo, String>,
    /// Days until the leaf expires, fractional
    pub days_remaining: Option<f64>,
    pub checked_at: i64,
}

fn parse_error(field: &str, err: Error) -> String {
    Error::ValidityParse {
        field: field.to_string(),
        message: err.to_string(),
    }
    .to_string()
}

/// Truncates (not rounds) to one decimal.
pub fn format_days(days: f64) -> String {
    format!("{:.1}", (days * 10.0).trunc() / 10.0)
}

impl ValidityVerdict {
    /// All fields parsed without error.
    pub fn is_error_free(&self) -> bool {
        self.server_key.is_ok()
            && self.account_key.is_ok()
            && self.chain.is_ok()
            && self.account.is_ok()
    }
    /// Error free, inside the validity window and more than `renew_days`
    /// days away from expiry.
    pub fn is_ok(&self, renew_days: f64) -> bool {
        if !self.is_error_free() {
            return false;
        }
        let in_window = self
            .chain
            .as_ref()
            .map(|chain| chain.in_window)
            .unwrap_or_default();
        let days = self.days_remaining.unwrap_or(f64::MIN);
        in_window && days > renew_days
    }
    /// Field name and reason of every failed field.
    pub fn errors(&self) -> Vec<(&'static str, &str)> {
        let mut errors = vec![];
        if let Err(e) = &self.server_key {
            errors.push(("server_key", e.as_str()));
        }
        if let Err(e) = &self.account_key {
            errors.push(("account_key", e.as_str()));
        }
        if let Err(e) = &self.chain {
            errors.push(("chain", e.as_str()));
        }
        if let Err(e) = &self.account {
            errors.push(("account", e.as_str()));
        }
        errors
    }
    /// Whether the certificate names equal `domains`, compared in
    /// canonical form with order and duplicates ignored.
    pub fn matches_domains(&self, domains: &[String]) -> bool {
        let Ok(chain) = &self.chain else {
            return false;
        };
        let canonical = |values: &[String]| {
            let mut values = values
                .iter()
                .map(|item| certkeeper_util::normalize_domain(item))
                .collect::<Vec<_>>();
            values.sort();
            values.dedup();
            values
        };
        canonical(domains) == canonical(&chain.domains)
    }
    /// Human readable report of the bundle.
    pub fn summary(&self) -> String {
        let mut lines = vec![];
        match &self.account {
            Ok(account) => {
                lines.push(format!(
                    "account: {}, created at {}, status {}",
                    if account.contact.is_empty() {
                        "-".to_string()
                    } else {
                        account.contact.join(",")
                    },
                    account.created_at.to_rfc3339(),
                    account.account_status
                ));
            },
            Err(e) => lines.push(format!("account: {e}")),
        }
        for (name, key) in
            [("account key", &self.account_key), ("server key", &self.server_key)]
        {
            match key {
                Ok(info) => lines.push(format!(
                    "{name}: {}, sha256 {}",
                    info.algorithm, info.fingerprint
                )),
                Err(e) => lines.push(format!("{name}: {e}")),
            }
        }
        match &self.chain {
            Ok(chain) => {
                lines.push(format!(
                    "certificate: {}, issued by {}",
                    chain.subject, chain.issuer
                ));
                lines.push(format!("domains: {}", chain.domains.join(",")));
            },
            Err(e) => lines.push(format!("certificate: {e}")),
        }
        if let Some(days) = self.days_remaining {
            lines.push(format!("days remaining: {}", format_days(days)));
        }
        lines.join("\n")
    }
}

/// Evaluates every file of the bundle at `now` (unix seconds).
///
/// Never fails, a missing or broken file shows up as an error of its field.
pub fn evaluate(paths: &BundlePaths, now: i64) -> ValidityVerdict {
    let server_key = load_key(KeyKind::Server, &paths.server_key_path)
        .map(|key| KeyInfo::from(&key))
        .map_err(|e| parse_error("server_key", e));
    let account_key = load_key(KeyKind::Account, &paths.account_key_path)
        .map(|key| KeyInfo::from(&key))
        .map_err(|e| parse_error("account_key", e));

    let mut days_remaining = None;
    let chain = load_bundle(&paths.bundle_path)
        .map(|info| {
            days_remaining = Some(info.days_remaining(now));
            ChainInfo {
                issuer_common_name: info.get_issuer_common_name(),
                in_window: info.in_window(now),
                subject: info.subject,
                issuer: info.issuer,
                domains: info.domains,
                not_before: info.not_before,
                not_after: info.not_after,
                certificates: info.certificates,
            }
        })
        .map_err(|e| parse_error("chain", e));

    let account = match AccountRecord::load(&paths.account_path) {
        Ok(Some(record)) => match &account_key {
            Ok(key) if key.fingerprint != record.key_fingerprint => {
                Err(parse_error(
                    "account",
                    Error::Invalid {
                        category: "account_binding".to_string(),
                        message: "account is bound to another account key"
                            .to_string(),
                    },
                ))
            },
            _ => Ok(AccountInfo {
                contact: record.contact,
                created_at: record.created_at,
                account_status: record.status,
                initial_ip: record.initial_ip,
                directory_url: record.directory_url,
            }),
        },
        Ok(None) => Err(parse_error(
            "account",
            Error::Invalid {
                category: "account".to_string(),
                message: format!(
                    "{} not found",
                    paths.account_path.to_string_lossy()
                ),
            },
        )),
        Err(e) => Err(parse_error("account", e)),
    };

    let verdict = ValidityVerdict {
        server_key,
        account_key,
        chain,
        account,
        days_remaining,
        checked_at: now,
    };
    debug!(
        target: LOG_TARGET,
        errors = verdict.errors().len(),
        days_remaining = verdict.days_remaining,
        "evaluate certificate bundle"
    );
    verdict
}
