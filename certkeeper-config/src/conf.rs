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
use certkeeper_util::resolve_path;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

pub const LETS_ENCRYPT_PRODUCTION: &str =
    "https://acme-v02.api.letsencrypt.org/directory";
pub const LETS_ENCRYPT_STAGING: &str =
    "https://acme-staging-v02.api.letsencrypt.org/directory";

const DEFAULT_BASE_DIR: &str = "~/.certkeeper";
const DEFAULT_CHALLENGE_ADDR: &str = "0.0.0.0:80";
const DEFAULT_MONITOR_INTERVAL: Duration = Duration::from_secs(12 * 3600);
const DEFAULT_ISSUE_TIMEOUT: Duration = Duration::from_secs(5 * 60);
const DEFAULT_RENEW_DAYS: f64 = 3.0;

/// Configuration of the certificate lifecycle.
///
/// It is constructed once (usually by [`crate::load_config`]) and handed to
/// every component behind an `Arc`.
#[derive(Debug, Default, Deserialize, Clone, Serialize)]
pub struct AcmeConf {
    /// Domain names requested on the certificate
    #[serde(default)]
    pub domains: Vec<String>,
    /// Operator contact, also used as account contact when no subscriber is set
    pub maintainer_email: Option<String>,
    /// Account contact registered with the authority
    pub subscriber_email: Option<String>,
    /// Application identity string (default: certkeeper/<version>)
    pub app: Option<String>,
    /// Directory url of the issuance authority
    pub directory_url: Option<String>,
    /// Use the staging directory and skip the challenge self-check
    pub staging: Option<bool>,
    /// Account record file (default: ~/.certkeeper/account.json)
    pub account_path: Option<String>,
    /// Account key file (default: ~/.certkeeper/account.key)
    pub account_key_path: Option<String>,
    /// Server key file (default: ~/.certkeeper/server.key)
    pub server_key_path: Option<String>,
    /// Leaf certificate followed by its chain (default: ~/.certkeeper/bundle.pem)
    pub bundle_path: Option<String>,
    /// Listen address of the http-01 responder (default: 0.0.0.0:80)
    pub challenge_addr: Option<String>,
    /// Interval between two lifecycle checks (default: 12h)
    #[serde(default)]
    #[serde(with = "humantime_serde")]
    pub monitor_interval: Option<Duration>,
    /// Renew when fewer days remain (default: 3)
    pub renew_days: Option<f64>,
    /// Overall deadline of one issuance attempt (default: 5m)
    #[serde(default)]
    #[serde(with = "humantime_serde")]
    pub issue_timeout: Option<Duration>,
    /// Verbose logging
    pub debug: Option<bool>,
    /// Log level (debug, info, warn, error)
    pub log_level: Option<String>,
    /// Log file, stdout if not set
    pub log_file: Option<String>,
    /// Whether to format logs as JSON
    pub log_json: Option<bool>,
}

fn resolve_file(value: &Option<String>, name: &str) -> PathBuf {
    let value = match value {
        Some(value) if !value.is_empty() => value.clone(),
        _ => format!("{DEFAULT_BASE_DIR}/{name}"),
    };
    PathBuf::from(resolve_path(&value))
}

impl AcmeConf {
    /// Creates a configuration for the domains with every other value defaulted.
    pub fn new(domains: &[&str]) -> Self {
        Self {
            domains: domains.iter().map(|item| item.to_string()).collect(),
            ..Default::default()
        }
    }
    /// Configured domains in canonical form (lowercase, no trailing dot),
    /// duplicates removed, order kept.
    pub fn get_domains(&self) -> Vec<String> {
        let mut domains: Vec<String> = vec![];
        for domain in self.domains.iter() {
            let domain = certkeeper_util::normalize_domain(domain);
            if !domains.contains(&domain) {
                domains.push(domain);
            }
        }
        domains
    }
    pub fn is_staging(&self) -> bool {
        self.staging.unwrap_or_default()
    }
    pub fn is_debug(&self) -> bool {
        self.debug.unwrap_or_default()
    }
    pub fn get_app(&self) -> String {
        match &self.app {
            Some(app) if !app.is_empty() => app.clone(),
            _ => format!("certkeeper/{}", certkeeper_util::get_pkg_version()),
        }
    }
    /// Returns the configured directory url, or the Let's Encrypt
    /// production/staging directory.
    pub fn get_directory_url(&self) -> String {
        match &self.directory_url {
            Some(url) if !url.is_empty() => url.clone(),
            _ => {
                if self.is_staging() {
                    LETS_ENCRYPT_STAGING.to_string()
                } else {
                    LETS_ENCRYPT_PRODUCTION.to_string()
                }
            },
        }
    }
    pub fn get_account_path(&self) -> PathBuf {
        resolve_file(&self.account_path, "account.json")
    }
    pub fn get_account_key_path(&self) -> PathBuf {
        resolve_file(&self.account_key_path, "account.key")
    }
    pub fn get_server_key_path(&self) -> PathBuf {
        resolve_file(&self.server_key_path, "server.key")
    }
    pub fn get_bundle_path(&self) -> PathBuf {
        resolve_file(&self.bundle_path, "bundle.pem")
    }
    pub fn get_challenge_addr(&self) -> Result<SocketAddr> {
        let addr = self
            .challenge_addr
            .clone()
            .unwrap_or_else(|| DEFAULT_CHALLENGE_ADDR.to_string());
        addr.parse().map_err(|e| Error::AddrParse { source: e, addr })
    }
    pub fn get_monitor_interval(&self) -> Duration {
        self.monitor_interval.unwrap_or(DEFAULT_MONITOR_INTERVAL)
    }
    pub fn get_renew_days(&self) -> f64 {
        self.renew_days.unwrap_or(DEFAULT_RENEW_DAYS)
    }
    pub fn get_issue_timeout(&self) -> Duration {
        self.issue_timeout.unwrap_or(DEFAULT_ISSUE_TIMEOUT)
    }
    /// Log level, `debug = true` wins over `log_level`.
    pub fn get_log_level(&self) -> String {
        if self.is_debug() {
            return "debug".to_string();
        }
        self.log_level.clone().unwrap_or_else(|| "info".to_string())
    }
    /// Account contacts as `mailto:` uris.
    pub fn contacts(&self) -> Vec<String> {
        self.subscriber_email
            .iter()
            .chain(self.maintainer_email.iter())
            .filter(|item| !item.is_empty())
            .take(1)
            .map(|item| format!("mailto:{item}"))
            .collect()
    }

    /// Validates the configuration:
    /// - at least one domain, no wildcard (http-01 cannot prove them)
    /// - email addresses look like addresses
    /// - challenge address parses, interval and timeout are positive
    pub fn validate(&self) -> Result<()> {
        if self.domains.is_empty() {
            return Err(Error::Invalid {
                message: "domains should not be empty".to_string(),
            });
        }
        for domain in self.domains.iter() {
            let name = certkeeper_util::normalize_domain(domain);
            if name.is_empty() || name.contains(char::is_whitespace) {
                return Err(Error::Invalid {
                    message: format!("domain '{domain}' is invalid"),
                });
            }
            if domain.contains('*') {
                return Err(Error::Invalid {
                    message: format!(
                        "wildcard domain {domain} is not supported by http-01"
                    ),
                });
            }
        }
        for email in self
            .maintainer_email
            .iter()
            .chain(self.subscriber_email.iter())
        {
            let valid = email
                .split_once('@')
                .map(|(name, host)| !name.is_empty() && host.contains('.'))
                .unwrap_or_default();
            if !valid {
                return Err(Error::Invalid {
                    message: format!("email {email} is invalid"),
                });
            }
        }
        self.get_challenge_addr()?;
        if self.get_monitor_interval().is_zero() {
            return Err(Error::Invalid {
                message: "monitor interval should be greater than zero"
                    .to_string(),
            });
        }
        if self.get_issue_timeout().is_zero() {
            return Err(Error::Invalid {
                message: "issue timeout should be greater than zero"
                    .to_string(),
            });
        }
        if self.get_renew_days() < 0.0 {
            return Err(Error::Invalid {
                message: "renew days should not be negative".to_string(),
            });
        }
        Ok(())
    }
}
